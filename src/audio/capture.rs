//! # Capture Encoder
//!
//! Turns raw microphone blocks into wire-ready audio frames.
//!
//! ## Pipeline:
//! 1. The device callback pushes mono blocks into a bounded channel
//! 2. The encoder task re-chunks them into fixed windows ([`WindowBuffer`])
//! 3. Each window gets an RMS volume and a base64 PCM16 payload
//! 4. The frame is handed to a sink (the session forwards it to the transport
//!    and publishes the volume)
//!
//! Frames are produced on a single task, so they leave in capture order.

use crate::audio::buffer::{WindowBuffer, WindowConfig};
use crate::audio::codec::encode_samples_base64;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// One capture tick: the window samples plus their encoded form.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    /// Root-mean-square level of `samples`, always >= 0
    pub volume: f64,
    /// Base64 of the 16-bit little-endian PCM encoding
    pub data: String,
}

/// Root-mean-square level of a window.
///
/// Samples are clamped to [-1.0, 1.0] (NaN counts as silence) the same way the
/// encoder clamps them, so the result is in [0.0, 1.0]. It is exactly zero
/// only for an empty or all-zero window.
pub fn rms(window: &[f32]) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let sum: f64 = window
        .iter()
        .map(|&s| {
            let s = if s.is_nan() { 0.0 } else { f64::from(s.clamp(-1.0, 1.0)) };
            s * s
        })
        .sum();
    (sum / window.len() as f64).sqrt()
}

/// Re-chunks device blocks and encodes each window.
pub struct AudioCaptureEncoder {
    buffer: WindowBuffer,
}

impl AudioCaptureEncoder {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            buffer: WindowBuffer::new(config),
        }
    }

    /// Feed one device block, returning every frame it completes.
    pub fn process_block(&mut self, block: &[f32]) -> Vec<AudioFrame> {
        self.buffer
            .push(block)
            .into_iter()
            .map(Self::encode_window)
            .collect()
    }

    fn encode_window(samples: Vec<f32>) -> AudioFrame {
        AudioFrame {
            volume: rms(&samples),
            data: encode_samples_base64(&samples),
            samples,
        }
    }

    /// Run the encoder until the block channel closes or the task is aborted.
    pub fn spawn<F>(mut self, mut blocks: mpsc::Receiver<Vec<f32>>, mut sink: F) -> JoinHandle<()>
    where
        F: FnMut(AudioFrame) + Send + 'static,
    {
        tokio::spawn(async move {
            let window_ms = self.buffer.config().window_duration_ms();
            debug!(window_ms, "Capture encoder started");

            while let Some(block) = blocks.recv().await {
                for frame in self.process_block(&block) {
                    sink(frame);
                }
            }

            self.buffer.clear();
            debug!("Capture encoder stopped");
        })
    }
}
