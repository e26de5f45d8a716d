//! # Session Events
//!
//! Notifications a UI (or any other listener) receives from a session.
//! Every listener gets every event; the bus is a tokio broadcast channel so
//! any number of subscribers can attach at any time.
//!
//! ## Channels:
//! - **Display**: what the screen should show (greeting, tool data, nothing)
//! - **ConnectionChanged**: the session became live / stopped being live
//! - **StateChanged**: every connection-state transition
//! - **Error**: a human-readable message
//! - **Volume**: RMS level of each capture window

use crate::session::state::ConnectionState;
use crate::tools::community::{ConstructionUpdate, EventData};
use crate::tools::weather::WeatherData;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::debug;

/// What the display should show.
///
/// Serializes as `{"type": "WEATHER", "data": {...}}`; `None` and `Greeting`
/// carry no data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisplayInfo {
    None,
    Greeting,
    Weather(WeatherData),
    Construction(Vec<ConstructionUpdate>),
    Events(Vec<EventData>),
}

impl DisplayInfo {
    /// The data part, as returned to the remote agent. `Null` when there is none.
    pub fn payload(&self) -> Value {
        let value = match self {
            DisplayInfo::None | DisplayInfo::Greeting => Ok(Value::Null),
            DisplayInfo::Weather(data) => serde_json::to_value(data),
            DisplayInfo::Construction(updates) => serde_json::to_value(updates),
            DisplayInfo::Events(events) => serde_json::to_value(events),
        };
        // These types only contain strings, integers and dates
        value.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Display(DisplayInfo),
    ConnectionChanged(bool),
    StateChanged(ConnectionState),
    Error(String),
    Volume(f64),
}

/// Listener interface for callers that prefer callbacks over a stream.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn on_display(&self, _info: DisplayInfo) {}
    async fn on_connection_changed(&self, _live: bool) {}
    async fn on_state_changed(&self, _state: ConnectionState) {}
    async fn on_error(&self, _message: String) {}
    async fn on_volume(&self, _level: f64) {}
}

/// Fan-out of [`SessionEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current subscriber. Having none is not an error.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn display(&self, info: DisplayInfo) {
        self.publish(SessionEvent::Display(info));
    }

    pub fn connection(&self, live: bool) {
        self.publish(SessionEvent::ConnectionChanged(live));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(SessionEvent::Error(message.into()));
    }

    pub fn volume(&self, level: f64) {
        self.publish(SessionEvent::Volume(level));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Events as a stream. A slow consumer skips what it missed.
    pub fn stream(&self) -> impl Stream<Item = SessionEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| item.ok())
    }

    /// Drive an observer from this bus until the bus is dropped.
    pub fn attach(&self, observer: Arc<dyn SessionObserver>) -> JoinHandle<()> {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Observer fell behind, skipping events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match event {
                    SessionEvent::Display(info) => observer.on_display(info).await,
                    SessionEvent::ConnectionChanged(live) => observer.on_connection_changed(live).await,
                    SessionEvent::StateChanged(state) => observer.on_state_changed(state).await,
                    SessionEvent::Error(message) => observer.on_error(message).await,
                    SessionEvent::Volume(level) => observer.on_volume(level).await,
                }
            }
        })
    }
}
