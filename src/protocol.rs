//! Wire types shared by the relay and the client
//!
//! Client and relay exchange two frame kinds: binary frames carry raw
//! PCM16 mono audio, text frames carry a JSON [`ControlMessage`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// WebSocket close codes used by the relay
pub mod close_code {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (disconnect, heartbeat timeout)
    pub const AWAY: u16 = 1001;
    /// Policy violation (bad parameters, unknown recipe, bad credentials)
    pub const POLICY: u16 = 1008;
    /// Internal error (upstream failure, misconfiguration)
    pub const ERROR: u16 = 1011;

    /// Codes that must never appear in a close frame
    pub(crate) const RESERVED: [u16; 3] = [1005, 1006, 1015];
}

/// Maximum close reason length allowed in a close frame
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// PCM16 little-endian audio layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// Microphone audio sent by the client
    pub const CAPTURE: Self = Self {
        sample_rate: 16_000,
        channels: 1,
    };

    /// Synthesized speech returned by the upstream
    pub const PLAYBACK: Self = Self {
        sample_rate: 24_000,
        channels: 1,
    };

    /// MIME tag used in upstream envelopes
    #[must_use]
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }
}

/// Which way a frame travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client microphone toward the upstream
    Outbound,
    /// Upstream speech toward the client speaker
    Inbound,
}

/// An immutable chunk of PCM16 audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub direction: Direction,
    pub format: AudioFormat,
    /// Diagnostic counter, not used for ordering
    pub sequence: u64,
    pub data: Bytes,
}

impl AudioFrame {
    /// Outbound capture-format frame
    #[must_use]
    pub const fn outbound(sequence: u64, data: Bytes) -> Self {
        Self {
            direction: Direction::Outbound,
            format: AudioFormat::CAPTURE,
            sequence,
            data,
        }
    }

    /// Inbound playback-format frame
    #[must_use]
    pub const fn inbound(sequence: u64, data: Bytes) -> Self {
        Self {
            direction: Direction::Inbound,
            format: AudioFormat::PLAYBACK,
            sequence,
            data,
        }
    }

    /// Number of samples per channel
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2 / usize::from(self.format.channels.max(1))
    }
}

/// Text frame exchanged between client and relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Upstream accepted the session setup
    SetupAck,
    /// The assistant finished its turn
    TurnComplete,
    /// Caption or transcript text
    #[serde(rename = "text")]
    TextUtterance { text: String },
    /// Session-level error the user should see
    Error { message: String },
}

impl ControlMessage {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a known control message
    pub fn parse(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::Error::Decode(e.to_string()))
    }

    /// Serialize to a text frame
    #[must_use]
    pub fn to_json(&self) -> String {
        // Serializing a plain tagged enum cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Lifecycle of one leg of a connection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed(String),
}

impl ConnectionState {
    /// Whether no further transitions are possible
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    /// Whether `next` is a legal successor of this state
    #[must_use]
    pub const fn can_transition_to(&self, next: &Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Self::Failed(_))
            | (Self::Idle, Self::Connecting)
            | (Self::Connecting, Self::Open | Self::Closing)
            | (Self::Open, Self::Closing)
            | (Self::Closing, Self::Closed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Close code and reason carried to both legs on teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    /// Build a close reason, sanitizing the code and truncating the text
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let code = if close_code::RESERVED.contains(&code) {
            close_code::NORMAL
        } else {
            code
        };
        Self {
            code,
            reason: truncate_reason(reason.into()),
        }
    }

    #[must_use]
    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(close_code::NORMAL, reason)
    }

    #[must_use]
    pub fn away(reason: impl Into<String>) -> Self {
        Self::new(close_code::AWAY, reason)
    }

    #[must_use]
    pub fn policy(reason: impl Into<String>) -> Self {
        Self::new(close_code::POLICY, reason)
    }

    #[must_use]
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(close_code::ERROR, reason)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason.truncate(end);
    reason
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_wire_shape() {
        let msg = ControlMessage::TextUtterance {
            text: "Preheat the oven".to_string(),
        };
        assert_eq!(msg.to_json(), r#"{"type":"text","text":"Preheat the oven"}"#);
        assert_eq!(ControlMessage::SetupAck.to_json(), r#"{"type":"setup_ack"}"#);

        let parsed = ControlMessage::parse(r#"{"type":"turn_complete"}"#).unwrap();
        assert_eq!(parsed, ControlMessage::TurnComplete);
        assert!(ControlMessage::parse(r#"{"type":"mystery"}"#).is_err());
    }

    #[test]
    fn connection_state_transitions() {
        use ConnectionState::*;

        assert!(Idle.can_transition_to(&Connecting));
        assert!(Connecting.can_transition_to(&Open));
        assert!(Open.can_transition_to(&Closing));
        assert!(Closing.can_transition_to(&Closed));
        assert!(Open.can_transition_to(&Failed("reset".into())));

        assert!(!Idle.can_transition_to(&Open));
        assert!(!Closed.can_transition_to(&Connecting));
        assert!(!Failed("x".into()).can_transition_to(&Closed));
        assert!(!Closed.can_transition_to(&Failed("late".into())));
    }

    #[test]
    fn close_reason_sanitizes_code_and_length() {
        let reason = CloseReason::new(1006, "abnormal");
        assert_eq!(reason.code, close_code::NORMAL);

        let long = "é".repeat(100);
        let reason = CloseReason::internal(long);
        assert!(reason.reason.len() <= MAX_CLOSE_REASON_BYTES);
        assert!(reason.reason.chars().all(|c| c == 'é'));
    }

    #[test]
    fn frame_sample_count() {
        let frame = AudioFrame::outbound(0, Bytes::from(vec![0u8; 320]));
        assert_eq!(frame.sample_count(), 160);
        assert_eq!(frame.format.mime_type(), "audio/pcm;rate=16000");
    }
}
