//! # Audio Module
//!
//! Everything between the sound card and the wire: microphone capture and
//! framing, PCM encoding in both directions, and gapless playback scheduling.
//!
//! ## Audio Format Requirements:
//! - **Capture**: 16 kHz, mono, 16-bit PCM (`audio/pcm;rate=16000`)
//! - **Playback**: 24 kHz, mono, 16-bit PCM
//! - **Encoding**: Little-endian signed integers

pub mod buffer;   // Fixed-size capture windows
pub mod capture;  // Window encoder and RMS
pub mod codec;    // PCM16 conversion
pub mod device;   // Device traits and cpal backend
pub mod playback; // Output scheduling

pub use capture::{rms, AudioCaptureEncoder, AudioFrame};
pub use codec::PlaybackSegment;
pub use device::{AudioBackend, AudioClock, AudioDevices, AudioSpec, CpalBackend, PlaybackDevice};
pub use playback::{OutputTimeline, PlaybackScheduler, ScheduleOutcome};
