//! # Audio Device Management
//!
//! Acquisition of the microphone and the two audio clocks (input-rate and
//! output-rate streams), behind small traits so the session never touches a
//! concrete backend.
//!
//! ## Layers:
//! - **AudioBackend**: acquires devices for one session (`open`)
//! - **AudioDevices**: the acquired handle; starts/stops capture and releases everything on `close`
//! - **PlaybackDevice**: the output side, exposing a monotonic clock and accepting scheduled segments
//!
//! ## cpal backend:
//! `cpal::Stream` is `!Send` on several platforms, so both streams live on one
//! dedicated OS thread and every operation is proxied over a channel.

use crate::audio::codec::PlaybackSegment;
use crate::audio::playback::OutputTimeline;
use crate::config::AudioConfig;
use crate::error::{AppResult, SessionError};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfig, SupportedStreamConfigRange};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Audio formats requested from the devices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioSpec {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u16,
}

impl From<&AudioConfig> for AudioSpec {
    fn from(config: &AudioConfig) -> Self {
        Self {
            input_sample_rate: config.input_sample_rate,
            output_sample_rate: config.output_sample_rate,
            channels: config.channels,
        }
    }
}

/// Monotonic clock of an audio device, in seconds since the stream started.
pub trait AudioClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Output side of the device pair.
pub trait PlaybackDevice: AudioClock {
    /// Queue a segment to start at `segment.start_time` on this device's clock.
    fn play_at(&self, segment: PlaybackSegment);

    /// Drop everything queued but not yet played.
    fn flush(&self);
}

/// Devices acquired for one session.
///
/// `close` must be idempotent: the session calls it on every teardown path.
pub trait AudioDevices: Send {
    /// Begin delivering microphone blocks (mono, input rate) into `blocks`.
    fn start_capture(&mut self, blocks: mpsc::Sender<Vec<f32>>) -> AppResult<()>;

    /// Stop the microphone stream. Safe to call when capture never started.
    fn stop_capture(&mut self);

    fn playback(&self) -> Arc<dyn PlaybackDevice>;

    /// Release the microphone and both clocks.
    fn close(&mut self);
}

/// Acquires devices for a session.
pub trait AudioBackend: Send + Sync {
    fn open(&self, spec: &AudioSpec) -> AppResult<Box<dyn AudioDevices>>;
}

/// Which way a device moves audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Information about an available audio device.
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub direction: DeviceDirection,
    pub is_default: bool,
}

/// Device detection utilities for the default cpal host.
pub struct AudioDeviceManager;

impl AudioDeviceManager {
    /// List every input and output device on the default host.
    pub fn list_devices() -> AppResult<Vec<AudioDeviceInfo>> {
        let host = cpal::default_host();
        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let mut result = Vec::new();

        let inputs = host
            .input_devices()
            .map_err(|e| SessionError::Acquisition(e.to_string()))?;
        for device in inputs {
            if let Ok(name) = device.name() {
                result.push(AudioDeviceInfo {
                    is_default: default_input.as_deref() == Some(name.as_str()),
                    name,
                    direction: DeviceDirection::Input,
                });
            }
        }

        let outputs = host
            .output_devices()
            .map_err(|e| SessionError::Acquisition(e.to_string()))?;
        for device in outputs {
            if let Ok(name) = device.name() {
                result.push(AudioDeviceInfo {
                    is_default: default_output.as_deref() == Some(name.as_str()),
                    name,
                    direction: DeviceDirection::Output,
                });
            }
        }

        Ok(result)
    }
}

/// Average interleaved frames down to mono.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Pick a stream config that supports `rate` exactly, preferring f32 and fewer channels.
fn pick_config(
    ranges: impl Iterator<Item = SupportedStreamConfigRange>,
    rate: u32,
    direction: DeviceDirection,
) -> AppResult<SupportedStreamConfig> {
    let mut candidates: Vec<SupportedStreamConfigRange> = ranges
        .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
        .filter(|r| matches!(r.sample_format(), SampleFormat::F32 | SampleFormat::I16))
        .collect();
    candidates.sort_by_key(|r| (r.sample_format() != SampleFormat::F32, r.channels()));

    candidates
        .into_iter()
        .next()
        .map(|r| r.with_sample_rate(SampleRate(rate)))
        .ok_or_else(|| {
            SessionError::Acquisition(format!("{:?} device does not support {} Hz", direction, rate))
        })
}

type CaptureSlot = Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>;

fn forward_block(slot: &CaptureSlot, block: Vec<f32>) {
    let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(tx) = guard.as_ref() {
        // The encoder is at most one tick behind; anything beyond that is dropped
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(block) {
            debug!("Capture consumer is behind, dropping input block");
        }
    }
}

fn input_stream_error(err: cpal::StreamError) {
    error!(%err, "Audio input stream error");
}

fn output_stream_error(err: cpal::StreamError) {
    error!(%err, "Audio output stream error");
}

fn build_input_stream(
    device: &cpal::Device,
    supported: &SupportedStreamConfig,
    slot: CaptureSlot,
) -> AppResult<Stream> {
    let config: StreamConfig = supported.config();
    let channels = config.channels as usize;

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                forward_block(&slot, downmix(data, channels));
            },
            input_stream_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                forward_block(&slot, downmix(&floats, channels));
            },
            input_stream_error,
            None,
        ),
        other => {
            return Err(SessionError::Acquisition(format!(
                "unsupported input sample format {:?}",
                other
            )))
        }
    };

    stream.map_err(|e| SessionError::Acquisition(format!("microphone unavailable: {}", e)))
}

fn build_output_stream(
    device: &cpal::Device,
    supported: &SupportedStreamConfig,
    timeline: Arc<OutputTimeline>,
) -> AppResult<Stream> {
    let config: StreamConfig = supported.config();
    let channels = config.channels as usize;

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                timeline.render(data, channels);
            },
            output_stream_error,
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    timeline.render(&mut scratch, channels);
                    for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                    }
                },
                output_stream_error,
                None,
            )
        }
        other => {
            return Err(SessionError::Acquisition(format!(
                "unsupported output sample format {:?}",
                other
            )))
        }
    };

    stream.map_err(|e| SessionError::Acquisition(format!("speaker unavailable: {}", e)))
}

/// A command sent to the audio thread.
enum DeviceCommand {
    StartCapture {
        blocks: mpsc::Sender<Vec<f32>>,
        reply: std_mpsc::Sender<AppResult<()>>,
    },
    StopCapture,
    Shutdown,
}

/// Devices on the default cpal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open(&self, spec: &AudioSpec) -> AppResult<Box<dyn AudioDevices>> {
        Ok(Box::new(CpalDevices::spawn(*spec)?))
    }
}

/// `Send` handle to the audio thread that owns both cpal streams.
struct CpalDevices {
    cmd_tx: std_mpsc::Sender<DeviceCommand>,
    thread: Option<thread::JoinHandle<()>>,
    timeline: Arc<OutputTimeline>,
}

impl CpalDevices {
    /// Spawn the audio thread and wait for both streams to open.
    fn spawn(spec: AudioSpec) -> AppResult<Self> {
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<DeviceCommand>();
        let (init_tx, init_rx) = std_mpsc::channel::<AppResult<()>>();
        let timeline = Arc::new(OutputTimeline::new(spec.output_sample_rate));
        let thread_timeline = Arc::clone(&timeline);

        let thread = thread::Builder::new()
            .name("soundscape-audio".into())
            .spawn(move || Self::run(spec, thread_timeline, cmd_rx, init_tx))
            .map_err(|e| SessionError::Acquisition(format!("failed to spawn audio thread: {}", e)))?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                cmd_tx,
                thread: Some(thread),
                timeline,
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => Err(SessionError::Acquisition("audio thread exited during startup".to_string())),
        }
    }

    fn run(
        spec: AudioSpec,
        timeline: Arc<OutputTimeline>,
        cmd_rx: std_mpsc::Receiver<DeviceCommand>,
        init_tx: std_mpsc::Sender<AppResult<()>>,
    ) {
        let slot: CaptureSlot = Arc::new(Mutex::new(None));

        let streams = Self::open_streams(&spec, Arc::clone(&slot), timeline);
        let (input, output) = match streams {
            Ok(pair) => {
                let _ = init_tx.send(Ok(()));
                pair
            }
            Err(err) => {
                let _ = init_tx.send(Err(err));
                return;
            }
        };

        while let Ok(cmd) = cmd_rx.recv() {
            match cmd {
                DeviceCommand::StartCapture { blocks, reply } => {
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(blocks);
                    let result = input
                        .play()
                        .map_err(|e| SessionError::Acquisition(format!("microphone failed to start: {}", e)));
                    let _ = reply.send(result);
                }
                DeviceCommand::StopCapture => {
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
                    if let Err(e) = input.pause() {
                        warn!("Failed to pause microphone stream: {}", e);
                    }
                }
                DeviceCommand::Shutdown => break,
            }
        }

        drop(input);
        drop(output);
        debug!("Audio thread stopped");
    }

    fn open_streams(
        spec: &AudioSpec,
        slot: CaptureSlot,
        timeline: Arc<OutputTimeline>,
    ) -> AppResult<(Stream, Stream)> {
        let host = cpal::default_host();

        let input_device = host
            .default_input_device()
            .ok_or_else(|| SessionError::Acquisition("no microphone found".to_string()))?;
        let output_device = host
            .default_output_device()
            .ok_or_else(|| SessionError::Acquisition("no output device found".to_string()))?;

        let input_ranges = input_device
            .supported_input_configs()
            .map_err(|e| SessionError::Acquisition(format!("microphone unavailable: {}", e)))?;
        let input_config = pick_config(input_ranges, spec.input_sample_rate, DeviceDirection::Input)?;

        let output_ranges = output_device
            .supported_output_configs()
            .map_err(|e| SessionError::Acquisition(format!("speaker unavailable: {}", e)))?;
        let output_config = pick_config(output_ranges, spec.output_sample_rate, DeviceDirection::Output)?;

        info!(
            input = %input_device.name().unwrap_or_default(),
            input_channels = input_config.channels(),
            output = %output_device.name().unwrap_or_default(),
            output_channels = output_config.channels(),
            "Opening audio devices"
        );

        let input = build_input_stream(&input_device, &input_config, slot)?;
        let output = build_output_stream(&output_device, &output_config, timeline)?;

        // The output clock starts now; the microphone waits for start_capture
        output
            .play()
            .map_err(|e| SessionError::Acquisition(format!("speaker failed to start: {}", e)))?;

        Ok((input, output))
    }
}

impl AudioDevices for CpalDevices {
    fn start_capture(&mut self, blocks: mpsc::Sender<Vec<f32>>) -> AppResult<()> {
        let (reply_tx, reply_rx) = std_mpsc::channel();
        self.cmd_tx
            .send(DeviceCommand::StartCapture { blocks, reply: reply_tx })
            .map_err(|_| SessionError::Acquisition("audio thread is not running".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| SessionError::Acquisition("audio thread is not running".to_string()))?
    }

    fn stop_capture(&mut self) {
        let _ = self.cmd_tx.send(DeviceCommand::StopCapture);
    }

    fn playback(&self) -> Arc<dyn PlaybackDevice> {
        self.timeline.clone()
    }

    fn close(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.cmd_tx.send(DeviceCommand::Shutdown);
            if thread.join().is_err() {
                warn!("Audio thread panicked during shutdown");
            }
            self.timeline.flush();
        }
    }
}

impl Drop for CpalDevices {
    fn drop(&mut self) {
        self.close();
    }
}
