//! Sous Gateway - live voice relay for a hands-free cooking assistant
//!
//! This library provides:
//! - The `/live-cooking` relay bridging client audio to an upstream
//!   conversational AI endpoint
//! - The client transport and audio pipeline used by `sous talk`
//! - Recipe store and auth collaborators
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Client                           │
//! │   AudioFrameSource → ClientSessionTransport → Sink    │
//! └────────────────────────┬─────────────────────────────┘
//!                          │ PCM16 / JSON control
//! ┌────────────────────────▼─────────────────────────────┐
//! │                  Relay (per session)                  │
//! │   auth │ recipe context │ pumps │ heartbeat           │
//! └────────────────────────┬─────────────────────────────┘
//!                          │ JSON envelopes
//! ┌────────────────────────▼─────────────────────────────┐
//! │              Upstream conversational AI               │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod store;
pub mod upstream;
pub mod voice;

pub use config::Config;
pub use error::{AudioError, Error, Result};
pub use protocol::{AudioFormat, AudioFrame, CloseReason, ConnectionState, ControlMessage};
pub use relay::{RelaySessionManager, SessionRegistry, VoiceSession};
