//! # Soundscape Voice
//!
//! Real-time voice session client for a remote conversational agent. Streams
//! microphone audio out, plays synthesized speech back gaplessly, and answers
//! the agent's tool calls (weather, construction, events) locally.

pub mod audio;
pub mod config;
pub mod error;
pub mod session;
pub mod tools;

pub use config::AppConfig;
pub use error::{AppResult, SessionError};
pub use session::events::{DisplayInfo, SessionEvent, SessionObserver};
pub use session::state::ConnectionState;
pub use session::SessionConnection;
