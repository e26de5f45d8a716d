//! # PCM Codec
//!
//! Pure conversion between floating-point samples and the 16-bit signed
//! little-endian PCM used on the wire, in both directions. No I/O.
//!
//! ## Scaling:
//! - **Encode**: clamp to [-1.0, 1.0], negative values scale by 32768, non-negative by 32767
//! - **Decode**: divide by 32768.0 so that -32768 maps to exactly -1.0

use crate::error::{AppResult, SessionError};
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// Bytes per 16-bit sample.
const BYTES_PER_SAMPLE: usize = 2;

/// A decoded block of output audio, ready to hand to the output device.
///
/// ## Layout:
/// `channels` holds one `Vec<f32>` per channel (de-interleaved), all of the
/// same length. `start_time` is a monotonic output-clock value in seconds and
/// is filled in by the playback scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSegment {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
    pub start_time: f64,
}

impl PlaybackSegment {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Frame `index` mixed down to mono.
    pub fn mono_sample(&self, index: usize) -> f32 {
        let count = self.channels.len();
        if count == 0 {
            return 0.0;
        }
        let sum: f32 = self
            .channels
            .iter()
            .map(|channel| channel.get(index).copied().unwrap_or(0.0))
            .sum();
        sum / count as f32
    }
}

/// Convert one float sample to a 16-bit integer.
fn float_to_i16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encode float samples to 16-bit signed little-endian PCM bytes.
pub fn encode_samples(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(float_to_i16(sample));
    }
    bytes
}

/// Encode float samples straight to the base64 text carried in realtime input frames.
pub fn encode_samples_base64(samples: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode_samples(samples))
}

/// Decode a base64 payload to raw bytes.
pub fn decode_base64(data: &str) -> AppResult<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}

/// Reinterpret PCM bytes as a [`PlaybackSegment`].
///
/// ## Errors:
/// Returns `SessionError::Decode` when the byte length is not a whole number
/// of frames (`2 * channels` bytes each) or when `channels` is zero.
pub fn decode_to_segment(bytes: &[u8], sample_rate: u32, channels: u16) -> AppResult<PlaybackSegment> {
    if channels == 0 {
        return Err(SessionError::Decode("channel count must be at least 1".to_string()));
    }

    let frame_bytes = BYTES_PER_SAMPLE * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(SessionError::Decode(format!(
            "PCM length {} is not a multiple of {} bytes",
            bytes.len(),
            frame_bytes
        )));
    }

    let mut interleaved = vec![0i16; bytes.len() / BYTES_PER_SAMPLE];
    LittleEndian::read_i16_into(bytes, &mut interleaved);

    let frames = interleaved.len() / channels as usize;
    let mut planar = vec![Vec::with_capacity(frames); channels as usize];
    for frame in interleaved.chunks_exact(channels as usize) {
        for (channel, &sample) in planar.iter_mut().zip(frame) {
            channel.push(sample as f32 / 32768.0);
        }
    }

    Ok(PlaybackSegment {
        channels: planar,
        sample_rate,
        start_time: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_scaling_and_clamping() {
        let bytes = encode_samples(&[0.0, 1.0, -1.0, 2.5, -7.0, 0.5]);
        let mut decoded = vec![0i16; 6];
        LittleEndian::read_i16_into(&bytes, &mut decoded);
        assert_eq!(decoded, vec![0, 32767, -32768, 32767, -32768, 16383]);
    }

    #[test]
    fn test_encode_is_little_endian() {
        let bytes = encode_samples(&[1.0]);
        assert_eq!(bytes, vec![0xFF, 0x7F]);
    }

    #[test]
    fn test_round_trip_within_quantization() {
        let original: Vec<f32> = (0..480)
            .map(|i| (i as f32 * 0.05).sin() * 0.8)
            .collect();
        let segment = decode_to_segment(&encode_samples(&original), 16_000, 1).unwrap();
        assert_eq!(segment.frames(), original.len());
        for (a, b) in original.iter().zip(&segment.channels[0]) {
            assert!((a - b).abs() <= 1.0 / 16384.0, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_decode_deinterleaves_stereo() {
        // L, R, L, R
        let bytes = encode_samples(&[0.5, -0.5, 0.25, -0.25]);
        let segment = decode_to_segment(&bytes, 24_000, 2).unwrap();
        assert_eq!(segment.channel_count(), 2);
        assert_eq!(segment.frames(), 2);
        assert!(segment.channels[0].iter().all(|s| *s > 0.0));
        assert!(segment.channels[1].iter().all(|s| *s < 0.0));
    }

    #[test]
    fn test_decode_rejects_partial_frames() {
        assert!(matches!(
            decode_to_segment(&[0u8; 3], 24_000, 1),
            Err(SessionError::Decode(_))
        ));
        // 6 bytes is 3 mono samples but 1.5 stereo frames
        assert!(decode_to_segment(&[0u8; 6], 24_000, 2).is_err());
        assert!(decode_to_segment(&[0u8; 4], 24_000, 0).is_err());
    }

    #[test]
    fn test_segment_duration() {
        let segment = decode_to_segment(&vec![0u8; 48_000], 24_000, 1).unwrap();
        assert!((segment.duration() - 1.0).abs() < 1e-9);
        let empty = decode_to_segment(&[], 24_000, 1).unwrap();
        assert_eq!(empty.duration(), 0.0);
    }

    #[test]
    fn test_base64_round_trip() {
        let text = encode_samples_base64(&[0.0, 1.0]);
        assert_eq!(decode_base64(&text).unwrap(), vec![0, 0, 0xFF, 0x7F]);
        assert!(matches!(decode_base64("@@not base64@@"), Err(SessionError::Decode(_))));
    }
}
