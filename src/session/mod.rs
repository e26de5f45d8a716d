//! # Voice Session
//!
//! Owns one live conversation with the remote agent: acquires the audio
//! devices, opens the transport, streams microphone frames out, schedules
//! synthesized speech for playback, answers tool calls, and tears everything
//! down again.
//!
//! ## Session Lifecycle:
//! 1. `connect()` acquires the microphone and both audio clocks (state stays Idle
//!    if that fails)
//! 2. State moves to Connecting and the transport is opened
//! 3. Once the transport is open: capture starts, the greeting is sent once,
//!    the Greeting display is published and state moves to Connected
//! 4. Inbound audio is scheduled, tool calls are dispatched concurrently
//! 5. `disconnect()`, a transport error or a server close tears down
//!
//! ## Teardown order:
//! capture encoder, microphone stream, both audio clocks, then the transport.
//! After teardown nothing from the old session (audio, tool results, volume)
//! can reach the transport or the listeners.

pub mod events;
pub mod protocol;
pub mod state;
pub mod transport;

use crate::audio::buffer::WindowConfig;
use crate::audio::capture::{AudioCaptureEncoder, AudioFrame};
use crate::audio::device::{AudioBackend, AudioDevices, AudioSpec};
use crate::audio::playback::{PlaybackScheduler, ScheduleOutcome};
use crate::config::AppConfig;
use crate::error::{AppResult, SessionError};
use crate::tools::{ToolCallRequest, ToolDispatcher, ToolOutcome};

use events::{DisplayInfo, EventBus, SessionEvent};
use futures_util::Stream;
use protocol::{parse_server_message, ClientMessage, ServerEvent, SetupPayload};
use state::{ConnectionState, ConnectionStateMachine};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use transport::{Transport, TransportEvent};
use uuid::Uuid;

/// Capacity of the device-block channel between the audio callback and the encoder.
const CAPTURE_CHANNEL_CAPACITY: usize = 32;

/// Resources of a session that reached the transport.
struct LiveSession {
    id: Uuid,
    devices: Box<dyn AudioDevices>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    audio: mpsc::Sender<ClientMessage>,
    greeting_sent: bool,
    capture_task: Option<JoinHandle<()>>,
    inbound_task: Option<JoinHandle<()>>,
    tool_tasks: Vec<JoinHandle<()>>,
}

impl LiveSession {
    /// Release everything, in teardown order.
    fn shutdown(mut self) {
        if let Some(task) = self.capture_task.take() {
            task.abort();
        }
        self.devices.stop_capture();
        self.devices.close();
        for task in self.tool_tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.inbound_task.take() {
            task.abort();
        }
        // Dropping both senders closes the transport writer
        debug!(session_id = %self.id, "Session resources released");
    }
}

/// What the session currently holds.
enum Slot {
    Empty,
    /// A connect() is opening the devices
    Acquiring(Uuid),
    /// Devices acquired, transport still opening
    Pending(Box<dyn AudioDevices>),
    Live(LiveSession),
}

struct Inner {
    config: AppConfig,
    audio: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<ToolDispatcher>,
    bus: EventBus,
    state: ConnectionStateMachine,
    slot: Mutex<Slot>,
}

/// Handle to a voice session. Cheap to clone; all clones control the same session.
#[derive(Clone)]
pub struct SessionConnection {
    inner: Arc<Inner>,
}

impl SessionConnection {
    pub fn new(
        config: AppConfig,
        audio: Arc<dyn AudioBackend>,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<ToolDispatcher>,
    ) -> Self {
        let bus = EventBus::default();
        Self {
            inner: Arc::new(Inner {
                config,
                audio,
                transport,
                dispatcher,
                state: ConnectionStateMachine::new(bus.clone()),
                bus,
                slot: Mutex::new(Slot::Empty),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.bus.subscribe()
    }

    pub fn events(&self) -> impl Stream<Item = SessionEvent> + Send + 'static {
        self.inner.bus.stream()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Start a session.
    ///
    /// ## Errors:
    /// - `InvalidState` while in Error (call `reset()` or `disconnect()` first)
    /// - `AlreadyActive` while another session is live or connecting
    /// - `Acquisition` when the microphone or an audio clock is unavailable;
    ///   state stays Idle and an error notification is published
    /// - transport errors; state moves to Error and an error notification is published
    /// - `Cancelled` when `disconnect()` ran while the transport was opening
    pub async fn connect(&self) -> AppResult<()> {
        let inner = &self.inner;

        if inner.state.current() == ConnectionState::Error {
            return Err(SessionError::InvalidState(
                "session is in error; reset before reconnecting".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        {
            let mut slot = inner.lock_slot();
            if !matches!(*slot, Slot::Empty) {
                return Err(SessionError::AlreadyActive);
            }
            *slot = Slot::Acquiring(id);
        }

        // Opening devices waits on the audio thread
        let audio = Arc::clone(&inner.audio);
        let spec = AudioSpec::from(&inner.config.audio);
        let opened = tokio::task::spawn_blocking(move || audio.open(&spec))
            .await
            .unwrap_or_else(|e| Err(SessionError::Acquisition(format!("device task failed: {}", e))));

        {
            let mut slot = inner.lock_slot();
            let ours = matches!(*slot, Slot::Acquiring(owner) if owner == id);
            match opened {
                Ok(mut devices) if !ours => {
                    drop(slot);
                    info!("Connect cancelled while opening devices");
                    devices.close();
                    return Err(SessionError::Cancelled);
                }
                Ok(devices) => *slot = Slot::Pending(devices),
                Err(err) => {
                    if ours {
                        *slot = Slot::Empty;
                    }
                    drop(slot);
                    error!(error = %err, "Audio acquisition failed");
                    inner.bus.error(err.user_message());
                    inner.state.settle_idle();
                    return Err(err);
                }
            }
        }

        if let Err(err) = inner.state.begin_connect() {
            inner.release_pending();
            return Err(err);
        }

        let setup = SetupPayload::new(&inner.config, inner.dispatcher.declarations());
        let link = match inner.transport.open(setup).await {
            Ok(link) => link,
            Err(err) => {
                if inner.release_pending() {
                    error!(error = %err, "Failed to open transport");
                    let _ = inner.state.fail();
                    inner.bus.error(err.user_message());
                    inner.bus.connection(false);
                }
                return Err(err);
            }
        };

        {
            let mut slot = inner.lock_slot();
            let devices = match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Pending(devices) => devices,
                other => {
                    // disconnect() ran while the transport was opening
                    *slot = other;
                    info!("Connect cancelled while opening transport");
                    return Err(SessionError::Cancelled);
                }
            };

            *slot = Slot::Live(LiveSession {
                id,
                devices,
                outbound: link.outbound,
                audio: link.audio,
                greeting_sent: false,
                capture_task: None,
                inbound_task: None,
                tool_tasks: Vec::new(),
            });
        }

        info!(session_id = %id, "Transport open");
        inner.on_open(id)?;

        let spawned = {
            let mut slot = inner.lock_slot();
            match &mut *slot {
                Slot::Live(live) if live.id == id => {
                    let scheduler = Arc::new(PlaybackScheduler::new(
                        live.devices.playback(),
                        &inner.config.audio,
                    ));
                    let task = tokio::spawn(Inner::inbound_loop(
                        Arc::clone(inner),
                        id,
                        link.inbound,
                        scheduler,
                    ));
                    live.inbound_task = Some(task);
                    true
                }
                _ => false,
            }
        };

        if spawned {
            Ok(())
        } else {
            Err(SessionError::Cancelled)
        }
    }

    /// Stop the session and release every resource. Idempotent; safe from any state.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let previous = std::mem::replace(&mut *inner.lock_slot(), Slot::Empty);

        match previous {
            Slot::Empty => debug!("Disconnect with no active session"),
            Slot::Acquiring(_) => info!("Disconnect while opening devices"),
            Slot::Pending(mut devices) => {
                info!("Disconnect while connecting, releasing devices");
                devices.close();
            }
            Slot::Live(live) => {
                info!(session_id = %live.id, "Disconnecting");
                live.shutdown();
            }
        }

        inner.state.settle_idle();
        inner.bus.connection(false);
        inner.bus.display(DisplayInfo::None);
    }

    /// Leave the Error state so `connect()` is allowed again.
    pub fn reset(&self) -> AppResult<()> {
        self.inner.state.reset()
    }
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close pending devices. Returns false if disconnect() already took them.
    fn release_pending(&self) -> bool {
        let mut slot = self.lock_slot();
        match std::mem::replace(&mut *slot, Slot::Empty) {
            Slot::Pending(mut devices) => {
                devices.close();
                true
            }
            other => {
                *slot = other;
                false
            }
        }
    }

    /// Run `f` on the live session if it is still session `id`.
    fn with_live<R>(&self, id: Uuid, f: impl FnOnce(&mut LiveSession) -> R) -> Option<R> {
        let mut slot = self.lock_slot();
        match &mut *slot {
            Slot::Live(live) if live.id == id => Some(f(live)),
            _ => None,
        }
    }

    /// Start capture, send the greeting once, and announce the session.
    fn on_open(self: &Arc<Self>, id: Uuid) -> AppResult<()> {
        let (block_tx, block_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let window = WindowConfig {
            sample_rate: self.config.audio.input_sample_rate,
            window_size: self.config.audio.capture_window,
        };
        let greeting = self.config.session.greeting_prompt.clone();

        let started = self.with_live(id, |live| -> AppResult<bool> {
            live.devices.start_capture(block_tx)?;

            let forwarder = Arc::clone(self);
            live.capture_task = Some(
                AudioCaptureEncoder::new(window).spawn(block_rx, move |frame| {
                    forwarder.forward_frame(id, frame);
                }),
            );

            let first = !live.greeting_sent;
            if first {
                live.greeting_sent = true;
                let _ = live.outbound.send(ClientMessage::text(greeting));
            }
            Ok(first)
        });

        match started {
            Some(Ok(greeted)) => {
                if greeted {
                    self.bus.display(DisplayInfo::Greeting);
                }
                let _ = self.state.mark_connected();
                self.bus.connection(true);
                info!(session_id = %id, "Session connected");
                Ok(())
            }
            Some(Err(err)) => {
                error!(session_id = %id, error = %err, "Microphone failed to start");
                self.fail_session(id, &err);
                Err(err)
            }
            None => Err(SessionError::Cancelled),
        }
    }

    /// Publish the volume and send one frame, if `id` is still live.
    /// A frame the transport has no room for is dropped.
    fn forward_frame(&self, id: Uuid, frame: AudioFrame) {
        let mime_type = self.config.input_mime_type();
        let AudioFrame { volume, data, .. } = frame;
        self.with_live(id, |live| {
            self.bus.volume(volume);
            if let Err(mpsc::error::TrySendError::Full(_)) =
                live.audio.try_send(ClientMessage::audio(data, mime_type))
            {
                debug!(session_id = %id, "Transport busy, dropping microphone frame");
            }
        });
    }

    /// Tear down after a transport failure and enter Error.
    fn fail_session(&self, id: Uuid, err: &SessionError) {
        let taken = {
            let mut slot = self.lock_slot();
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Live(live) if live.id == id => Some(live),
                other => {
                    *slot = other;
                    None
                }
            }
        };

        if let Some(live) = taken {
            live.shutdown();
            let _ = self.state.fail();
            self.bus.error(err.user_message());
            self.bus.connection(false);
        }
    }

    /// Tear down after the server closed the stream and return to Idle.
    fn close_session(&self, id: Uuid, reason: Option<String>) {
        let taken = {
            let mut slot = self.lock_slot();
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Live(live) if live.id == id => Some(live),
                other => {
                    *slot = other;
                    None
                }
            }
        };

        if let Some(live) = taken {
            info!(session_id = %id, reason = reason.as_deref().unwrap_or(""), "Remote closed the session");
            live.shutdown();
            self.state.settle_idle();
            self.bus.connection(false);
            self.bus.display(DisplayInfo::None);
        }
    }

    /// Route inbound transport events until the stream ends.
    async fn inbound_loop(
        self: Arc<Self>,
        id: Uuid,
        mut inbound: mpsc::Receiver<TransportEvent>,
        scheduler: Arc<PlaybackScheduler>,
    ) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Message(text) => match parse_server_message(&text) {
                    Ok(events) => {
                        for event in events {
                            self.handle_server_event(id, event, &scheduler);
                        }
                    }
                    Err(err) => warn!(session_id = %id, error = %err, "Dropping malformed message"),
                },
                TransportEvent::Error(message) => {
                    error!(session_id = %id, error = %message, "Transport error");
                    self.fail_session(id, &SessionError::Transport(message));
                    return;
                }
                TransportEvent::Closed(reason) => {
                    self.close_session(id, reason);
                    return;
                }
            }
        }
        self.close_session(id, None);
    }

    fn handle_server_event(self: &Arc<Self>, id: Uuid, event: ServerEvent, scheduler: &PlaybackScheduler) {
        match event {
            ServerEvent::Audio(pcm) => match scheduler.schedule_chunk(&pcm) {
                Ok(ScheduleOutcome::Scheduled { .. }) => {}
                Ok(ScheduleOutcome::Dropped { backlog }) => {
                    debug!(session_id = %id, backlog, "Audio chunk dropped");
                }
                Err(err) => warn!(session_id = %id, error = %err, "Skipping undecodable audio chunk"),
            },
            ServerEvent::ToolCall(requests) => {
                for request in requests {
                    self.spawn_tool(id, request);
                }
            }
            ServerEvent::TurnComplete => debug!(session_id = %id, "Turn complete"),
            // Already-scheduled audio keeps playing; the clock is never rewound
            ServerEvent::Interrupted => debug!(session_id = %id, "Turn interrupted"),
            ServerEvent::SetupComplete => debug!(session_id = %id, "Duplicate setupComplete"),
            ServerEvent::GoAway => warn!(session_id = %id, "Server will close the session soon"),
            ServerEvent::Error(message) => {
                error!(session_id = %id, error = %message, "Server reported an error");
                self.fail_session(id, &SessionError::Transport(message));
            }
            ServerEvent::Malformed(detail) => warn!(session_id = %id, detail = %detail, "Skipping malformed message part"),
        }
    }

    fn spawn_tool(self: &Arc<Self>, id: Uuid, request: ToolCallRequest) {
        let inner = Arc::clone(self);
        let dispatcher = Arc::clone(&self.dispatcher);
        let task = tokio::spawn(async move {
            let outcome = dispatcher.dispatch(request).await;
            inner.complete_tool(id, outcome);
        });

        let tracked = self.with_live(id, |live| {
            live.tool_tasks.retain(|t| !t.is_finished());
            live.tool_tasks.push(task)
        });
        if tracked.is_none() {
            debug!(session_id = %id, "Tool call arrived after teardown");
        }
    }

    /// Send a tool result and publish its display, if `id` is still live.
    fn complete_tool(&self, id: Uuid, outcome: ToolOutcome) {
        let ToolOutcome { result, display, error } = outcome;
        let call_id = result.id.clone();

        let delivered = self.with_live(id, |live| {
            if let Some(info) = display {
                self.bus.display(info);
            }
            if let Some(message) = error {
                self.bus.error(message);
            }
            live.outbound.send(ClientMessage::tool_response(result)).is_ok()
        });

        match delivered {
            Some(true) => debug!(session_id = %id, call_id = %call_id, "Tool result sent"),
            Some(false) => warn!(session_id = %id, call_id = %call_id, "Transport closed before tool result"),
            None => debug!(session_id = %id, call_id = %call_id, "Discarding tool result for ended session"),
        }
    }
}
