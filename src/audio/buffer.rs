//! # Capture Window Buffer
//!
//! Input devices deliver samples in whatever block size the backend picks
//! (often 441, 480 or 1024 frames). The encoder works on fixed windows of N
//! samples, so this buffer re-chunks the device stream into exact windows,
//! in arrival order, holding at most one partial window between pushes.

use std::collections::VecDeque;

/// Configuration for the capture window buffer.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Input sample rate (16000 for the remote agent)
    pub sample_rate: u32,

    /// Samples per window (4096 gives ~256 ms ticks at 16 kHz)
    pub window_size: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            window_size: 4096,
        }
    }
}

impl WindowConfig {
    /// Length of one capture tick in milliseconds.
    pub fn window_duration_ms(&self) -> f64 {
        self.window_size as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// Re-chunks a continuous sample stream into fixed-size windows.
pub struct WindowBuffer {
    pending: VecDeque<f32>,
    config: WindowConfig,
}

impl WindowBuffer {
    /// Create an empty buffer.
    pub fn new(config: WindowConfig) -> Self {
        let capacity = config.window_size * 2;
        Self {
            pending: VecDeque::with_capacity(capacity),
            config,
        }
    }

    /// Append device samples and return every complete window now available.
    ///
    /// ## Example:
    /// With a window of 4 samples, pushing 3 samples returns nothing; pushing
    /// 6 more returns two windows and keeps 1 sample pending.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend(samples.iter().copied());

        let mut windows = Vec::new();
        while self.pending.len() >= self.config.window_size {
            windows.push(self.pending.drain(..self.config.window_size).collect());
        }
        windows
    }

    /// Samples waiting for the next full window.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial window (used on teardown).
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(window_size: usize) -> WindowBuffer {
        WindowBuffer::new(WindowConfig {
            sample_rate: 16_000,
            window_size,
        })
    }

    #[test]
    fn test_rechunks_into_fixed_windows() {
        let mut buf = buffer(4);
        assert!(buf.push(&[0.1, 0.2, 0.3]).is_empty());
        assert_eq!(buf.pending_len(), 3);

        let windows = buf.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0], vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(windows[1], vec![0.5, 0.6, 0.7, 0.8]);
        assert_eq!(buf.pending_len(), 1);
    }

    #[test]
    fn test_clear_drops_partial_window() {
        let mut buf = buffer(4);
        buf.push(&[1.0, 1.0]);
        buf.clear();
        assert_eq!(buf.pending_len(), 0);
        assert_eq!(buf.push(&[0.0; 4]).len(), 1);
    }

    #[test]
    fn test_window_duration() {
        let config = WindowConfig::default();
        assert!((config.window_duration_ms() - 256.0).abs() < 1e-9);
    }
}
