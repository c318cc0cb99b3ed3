//! Error types for the Sous gateway

use thiserror::Error;

use crate::protocol::CloseReason;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing credentials, bad settings)
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed session parameters
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Upstream transport error
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Client transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol decode error (single frame, non-fatal)
    #[error("decode error: {0}")]
    Decode(String),

    /// Audio error
    #[error("audio error: {0}")]
    Audio(#[from] AudioError),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl Error {
    /// Close frame to send when this error ends a session
    #[must_use]
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::InvalidRequest(_) | Self::Unauthorized(_) | Self::NotFound(_) => {
                CloseReason::policy(self.to_string())
            }
            _ => CloseReason::internal(self.to_string()),
        }
    }
}

/// Audio device and format errors
#[derive(Debug, Error)]
pub enum AudioError {
    /// Microphone access was denied by the OS
    #[error("microphone permission denied")]
    PermissionDenied,

    /// No usable device
    #[error("no {0} device available")]
    NoDevice(&'static str),

    /// Native sample rate is unusable
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    /// Sample format or channel layout not handled
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Any other device failure
    #[error("device error: {0}")]
    Device(String),
}
