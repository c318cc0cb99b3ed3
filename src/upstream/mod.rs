//! Upstream conversational AI leg
//!
//! The relay talks to the upstream service through an [`UpstreamConnector`],
//! which yields one [`UpstreamLeg`] per session. [`UpstreamBridge`] does the
//! envelope translation.

pub mod bridge;
mod connector;
pub mod credentials;
mod envelope;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, Stream};
use uuid::Uuid;

use crate::Result;
use crate::protocol::CloseReason;

pub use bridge::{ConversationContext, InboundEvent, UpstreamBridge};
pub use connector::{DEFAULT_UPSTREAM_URL, GeminiConnector};
pub use credentials::{Credential, CredentialCache, CredentialKind};

/// Transport-neutral WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
    Close(Option<CloseReason>),
}

/// Write half of an upstream connection
pub type UpstreamSink = Pin<Box<dyn Sink<WireMessage, Error = crate::Error> + Send>>;

/// Read half of an upstream connection
pub type UpstreamStream = Pin<Box<dyn Stream<Item = Result<WireMessage>> + Send>>;

/// One open upstream connection
pub struct UpstreamLeg {
    pub sink: UpstreamSink,
    pub stream: UpstreamStream,
}

/// Opens upstream connections
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Open a new upstream leg for a session
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when credentials are missing (no connection is
    /// attempted) or `Error::Upstream` when the connection fails
    async fn connect(&self, session_id: Uuid) -> Result<UpstreamLeg>;

    /// Whether credentials are configured
    fn is_configured(&self) -> bool;
}
