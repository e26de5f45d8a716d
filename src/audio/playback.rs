//! # Playback Scheduling
//!
//! Synthesized speech arrives as independent chunks of PCM. Each chunk has to
//! start exactly when the previous one ends so the voice plays back gapless and
//! never overlaps itself, even though chunks arrive with network jitter.
//!
//! ## Components:
//! - **PlaybackScheduler**: assigns each decoded segment a start time on the
//!   output clock (`start = max(next_start_time, now)`) and advances the cursor
//! - **OutputTimeline**: the output-side sink. It holds scheduled segments and
//!   renders them into device buffers; the frames it has rendered *are* the
//!   output clock
//!
//! ## Queue cap:
//! The cursor is never allowed to run more than `max_queued_secs` ahead of the
//! clock. A segment that would start past that horizon is dropped with a warning.

use crate::audio::codec::{decode_to_segment, PlaybackSegment};
use crate::audio::device::{AudioClock, PlaybackDevice};
use crate::config::AudioConfig;
use crate::error::AppResult;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// What happened to a segment handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleOutcome {
    /// Queued on the device to play from `start` for `duration` seconds
    Scheduled { start: f64, duration: f64 },
    /// Discarded because the backlog already exceeds the queue cap
    Dropped { backlog: f64 },
}

/// Gapless, non-overlapping scheduler for output audio.
pub struct PlaybackScheduler {
    device: Arc<dyn PlaybackDevice>,
    sample_rate: u32,
    channels: u16,
    max_queued_secs: f64,
    next_start_time: Mutex<f64>,
}

impl PlaybackScheduler {
    pub fn new(device: Arc<dyn PlaybackDevice>, config: &AudioConfig) -> Self {
        Self {
            device,
            sample_rate: config.output_sample_rate,
            channels: config.channels,
            max_queued_secs: config.max_queued_secs,
            next_start_time: Mutex::new(0.0),
        }
    }

    /// Decode one chunk of 16-bit PCM and schedule it.
    ///
    /// Decode failures are returned to the caller, who logs and skips the chunk.
    pub fn schedule_chunk(&self, pcm: &[u8]) -> AppResult<ScheduleOutcome> {
        let segment = decode_to_segment(pcm, self.sample_rate, self.channels)?;
        Ok(self.schedule(segment))
    }

    /// Place a decoded segment on the output clock.
    pub fn schedule(&self, mut segment: PlaybackSegment) -> ScheduleOutcome {
        let mut next = self
            .next_start_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let now = self.device.now();
        let start = next.max(now);
        let duration = segment.duration();

        if duration <= 0.0 {
            return ScheduleOutcome::Scheduled { start, duration: 0.0 };
        }

        let backlog = start - now;
        if backlog > self.max_queued_secs {
            warn!(
                backlog_secs = backlog,
                cap_secs = self.max_queued_secs,
                "Playback backlog over cap, dropping segment"
            );
            return ScheduleOutcome::Dropped { backlog };
        }

        segment.start_time = start;
        self.device.play_at(segment);
        *next = start + duration;

        debug!(start, duration, "Scheduled playback segment");
        ScheduleOutcome::Scheduled { start, duration }
    }

    /// Output-clock time at which the next segment will start, at the earliest.
    pub fn next_start_time(&self) -> f64 {
        *self
            .next_start_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Seconds of audio queued ahead of the device clock.
    pub fn queued_secs(&self) -> f64 {
        (self.next_start_time() - self.device.now()).max(0.0)
    }
}

struct QueuedSegment {
    start_frame: u64,
    segment: PlaybackSegment,
}

impl QueuedSegment {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.segment.frames() as u64
    }

    /// Sample for output channel `out_channel` at absolute frame `frame`.
    fn sample_at(&self, frame: u64, out_channel: usize) -> f32 {
        let index = (frame - self.start_frame) as usize;
        match self.segment.channels.len() {
            0 => 0.0,
            1 => self.segment.channels[0].get(index).copied().unwrap_or(0.0),
            n => self.segment.channels[out_channel % n]
                .get(index)
                .copied()
                .unwrap_or(0.0),
        }
    }
}

/// Frame-accurate output sink driven by the device callback.
///
/// The clock is `frames_rendered / sample_rate`, so it starts at zero when the
/// output stream opens and only ever moves forward.
pub struct OutputTimeline {
    sample_rate: u32,
    frames_rendered: AtomicU64,
    queue: Mutex<VecDeque<QueuedSegment>>,
}

impl OutputTimeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_rendered: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Fill an interleaved device buffer and advance the clock.
    ///
    /// Frames with nothing scheduled are silence.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let base = self.frames_rendered.load(Ordering::Acquire);
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        for i in 0..frames {
            let frame = base + i as u64;

            while queue.front().is_some_and(|q| q.end_frame() <= frame) {
                queue.pop_front();
            }

            let current = queue.front().filter(|q| q.start_frame <= frame);
            for c in 0..channels {
                out[i * channels + c] = current.map_or(0.0, |q| q.sample_at(frame, c));
            }
        }

        self.frames_rendered
            .fetch_add(frames as u64, Ordering::AcqRel);
    }

    /// Segments still waiting to play or partially played.
    pub fn queued_segments(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl AudioClock for OutputTimeline {
    fn now(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames_rendered.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }
}

impl PlaybackDevice for OutputTimeline {
    fn play_at(&self, segment: PlaybackSegment) {
        let start_frame = (segment.start_time * self.sample_rate as f64).round().max(0.0) as u64;
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        // Scheduler hands out increasing start times, so a push keeps the queue sorted
        queue.push_back(QueuedSegment { start_frame, segment });
    }

    fn flush(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode_samples;
    use crate::config::AppConfig;

    /// Playback device whose clock is set by the test.
    #[derive(Default)]
    struct ManualDevice {
        now: Mutex<f64>,
        played: Mutex<Vec<(f64, f64)>>,
    }

    impl ManualDevice {
        fn set_now(&self, t: f64) {
            *self.now.lock().unwrap() = t;
        }
    }

    impl AudioClock for ManualDevice {
        fn now(&self) -> f64 {
            *self.now.lock().unwrap()
        }
    }

    impl PlaybackDevice for ManualDevice {
        fn play_at(&self, segment: PlaybackSegment) {
            self.played
                .lock()
                .unwrap()
                .push((segment.start_time, segment.duration()));
        }

        fn flush(&self) {}
    }

    fn scheduler(device: Arc<ManualDevice>) -> PlaybackScheduler {
        PlaybackScheduler::new(device, &AppConfig::default().audio)
    }

    /// 0.1 s of mono 24 kHz PCM
    fn chunk() -> Vec<u8> {
        encode_samples(&vec![0.25; 2400])
    }

    #[test]
    fn test_segments_are_back_to_back() {
        let device = Arc::new(ManualDevice::default());
        let scheduler = scheduler(device.clone());

        for _ in 0..5 {
            scheduler.schedule_chunk(&chunk()).unwrap();
        }

        let played = device.played.lock().unwrap().clone();
        assert_eq!(played.len(), 5);
        for pair in played.windows(2) {
            let (start_a, dur_a) = pair[0];
            let (start_b, _) = pair[1];
            assert!((start_a + dur_a - start_b).abs() < 1e-9, "gap or overlap");
        }
    }

    #[test]
    fn test_start_times_never_regress_with_jitter() {
        let device = Arc::new(ManualDevice::default());
        let scheduler = scheduler(device.clone());

        let clock = [0.0, 0.05, 0.5, 0.52, 0.53, 2.0, 2.01];
        for t in clock {
            device.set_now(t);
            let outcome = scheduler.schedule_chunk(&chunk()).unwrap();
            match outcome {
                ScheduleOutcome::Scheduled { start, .. } => assert!(start >= t),
                ScheduleOutcome::Dropped { .. } => panic!("unexpected drop"),
            }
        }

        let played = device.played.lock().unwrap().clone();
        for pair in played.windows(2) {
            let (start_a, dur_a) = pair[0];
            let (start_b, _) = pair[1];
            assert!(start_b >= start_a + dur_a - 1e-9, "segments overlap");
        }
        // The late arrival at 2.0 starts at the clock, not at the stale cursor
        assert!((played[5].0 - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_backlog_cap_drops_segments() {
        let device = Arc::new(ManualDevice::default());
        let mut config = AppConfig::default().audio;
        config.max_queued_secs = 0.25;
        let scheduler = PlaybackScheduler::new(device.clone(), &config);

        let outcomes: Vec<_> = (0..5)
            .map(|_| scheduler.schedule_chunk(&chunk()).unwrap())
            .collect();

        // 0.0, 0.1, 0.2 fit; 0.3 and beyond exceed the 0.25 s cap
        assert!(matches!(outcomes[2], ScheduleOutcome::Scheduled { .. }));
        assert!(matches!(outcomes[3], ScheduleOutcome::Dropped { .. }));
        assert!(matches!(outcomes[4], ScheduleOutcome::Dropped { .. }));
        assert_eq!(device.played.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_malformed_chunk_is_an_error_and_does_not_move_cursor() {
        let device = Arc::new(ManualDevice::default());
        let scheduler = scheduler(device);
        assert!(scheduler.schedule_chunk(&[1, 2, 3]).is_err());
        assert_eq!(scheduler.next_start_time(), 0.0);
    }

    #[test]
    fn test_timeline_renders_scheduled_audio_and_advances_clock() {
        let timeline = Arc::new(OutputTimeline::new(4));
        let device: Arc<dyn PlaybackDevice> = timeline.clone();
        let scheduler = PlaybackScheduler::new(
            device,
            &AudioConfig {
                output_sample_rate: 4,
                ..AppConfig::default().audio
            },
        );

        // Two frames of 0.5 then two frames of -0.5, each 0.5 s at 4 Hz
        scheduler.schedule(PlaybackSegment {
            channels: vec![vec![0.5, 0.5]],
            sample_rate: 4,
            start_time: 0.0,
        });
        scheduler.schedule(PlaybackSegment {
            channels: vec![vec![-0.5, -0.5]],
            sample_rate: 4,
            start_time: 0.0,
        });

        let mut out = vec![9.0f32; 12];
        timeline.render(&mut out, 2);
        assert_eq!(
            out,
            vec![0.5, 0.5, 0.5, 0.5, -0.5, -0.5, -0.5, -0.5, 0.0, 0.0, 0.0, 0.0]
        );
        assert!((timeline.now() - 1.5).abs() < 1e-9);
        assert_eq!(timeline.queued_segments(), 0);
    }

    #[test]
    fn test_timeline_flush_silences_queue() {
        let timeline = OutputTimeline::new(4);
        timeline.play_at(PlaybackSegment {
            channels: vec![vec![1.0; 8]],
            sample_rate: 4,
            start_time: 0.0,
        });
        timeline.flush();

        let mut out = vec![1.0f32; 4];
        timeline.render(&mut out, 1);
        assert!(out.iter().all(|s| *s == 0.0));
    }
}
