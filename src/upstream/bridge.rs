//! Translation between relay frames and upstream envelopes
//!
//! Pure protocol code: no I/O, no session state.

use std::fmt::Write as _;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;

use super::WireMessage;
use super::envelope::{
    Blob, ClientContent, ClientContentMessage, Content, GenerationConfig, MediaChunk, Part,
    PrebuiltVoiceConfig, RealtimeInput, RealtimeInputMessage, ServerMessage, Setup, SetupMessage,
    SpeechConfig, VoiceConfig,
};
use crate::protocol::AudioFrame;
use crate::store::RecipeContext;
use crate::{Error, Result};

/// Ingredients listed in the system instruction before truncating
pub const MAX_PROMPT_INGREDIENTS: usize = 15;

/// Default upstream model
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-exp";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Aoede";

/// First user turn sent after setup so the assistant speaks first
const GREETING_PROMPT: &str =
    "Hi! I'm in the kitchen and ready to start. Please greet me and tell me what we're cooking.";

/// Context the assistant is primed with for one session
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub recipe: RecipeContext,
    /// Zero-based step the user is on
    pub step_index: u32,
}

/// One thing extracted from an upstream message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Upstream accepted the setup envelope
    SetupComplete,
    /// Synthesized speech chunk (PCM16 at the playback rate)
    Audio(Bytes),
    /// Model text or transcript
    Text(String),
    /// The model finished its turn
    TurnComplete,
    /// Valid JSON with no recognized content, forwarded as-is
    Unparsed(String),
}

/// Encodes and decodes upstream envelopes
#[derive(Debug, Clone)]
pub struct UpstreamBridge {
    model: String,
    voice: String,
}

impl Default for UpstreamBridge {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL, DEFAULT_VOICE)
    }
}

impl UpstreamBridge {
    #[must_use]
    pub fn new(model: impl Into<String>, voice: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            voice: voice.into(),
        }
    }

    /// Build the "begin session" message
    #[must_use]
    pub fn build_setup_envelope(&self, context: &ConversationContext) -> WireMessage {
        let message = SetupMessage {
            setup: Setup {
                model: self.model.clone(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: self.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    role: None,
                    parts: vec![text_part(system_instruction(context))],
                },
            },
        };
        WireMessage::Text(to_json(&message))
    }

    /// Wrap a raw audio chunk without touching the samples
    #[must_use]
    pub fn wrap_outbound_audio(&self, frame: &AudioFrame) -> WireMessage {
        let message = RealtimeInputMessage {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: frame.format.mime_type(),
                    data: B64.encode(&frame.data),
                }],
            },
        };
        WireMessage::Text(to_json(&message))
    }

    /// Synthetic first turn injected after `setupComplete`
    #[must_use]
    pub fn greeting_turn(&self) -> WireMessage {
        let message = ClientContentMessage {
            client_content: ClientContent {
                turns: vec![Content {
                    role: Some("user".to_string()),
                    parts: vec![text_part(GREETING_PROMPT.to_string())],
                }],
                turn_complete: true,
            },
        };
        WireMessage::Text(to_json(&message))
    }

    /// Classify an upstream message
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the message is not a JSON object or carries
    /// audio that is not valid base64
    pub fn decode_inbound_message(&self, raw: &[u8]) -> Result<Vec<InboundEvent>> {
        let message: ServerMessage =
            serde_json::from_slice(raw).map_err(|e| Error::Decode(e.to_string()))?;

        let mut events = Vec::new();
        if message.setup_complete.is_some() {
            events.push(InboundEvent::SetupComplete);
        }

        if let Some(content) = message.server_content {
            for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
                if let Some(blob) = part.inline_data {
                    if let Some(audio) = decode_audio(blob)? {
                        events.push(InboundEvent::Audio(audio));
                    }
                }
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    events.push(InboundEvent::Text(text));
                }
            }
            if let Some(text) = content
                .output_transcription
                .and_then(|t| t.text)
                .filter(|t| !t.is_empty())
            {
                events.push(InboundEvent::Text(text));
            }
            if content.turn_complete {
                events.push(InboundEvent::TurnComplete);
            }
        }

        if events.is_empty() {
            events.push(InboundEvent::Unparsed(
                String::from_utf8_lossy(raw).into_owned(),
            ));
        }
        Ok(events)
    }
}

fn decode_audio(blob: Blob) -> Result<Option<Bytes>> {
    let is_audio = blob
        .mime_type
        .as_deref()
        .is_none_or(|mime| mime.starts_with("audio/"));
    if !is_audio {
        tracing::debug!(mime = ?blob.mime_type, "ignoring non-audio inline data");
        return Ok(None);
    }
    B64.decode(blob.data.as_bytes())
        .map(|bytes| Some(Bytes::from(bytes)))
        .map_err(|e| Error::Decode(format!("invalid audio payload: {e}")))
}

fn text_part(text: String) -> Part {
    Part {
        text: Some(text),
        inline_data: None,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    // Envelope structs contain only strings, vectors and bools
    serde_json::to_string(value).unwrap_or_default()
}

/// Assistant persona plus the recipe being cooked
fn system_instruction(context: &ConversationContext) -> String {
    let recipe = &context.recipe;
    let mut out = format!(
        "You are Sous, a warm and concise cooking assistant talking to someone whose hands \
         are busy in the kitchen. Keep replies short and spoken-word friendly.\n\n\
         The user is cooking \"{}\".\n",
        recipe.title
    );

    if !recipe.ingredients.is_empty() {
        let shown: Vec<&str> = recipe
            .ingredients
            .iter()
            .take(MAX_PROMPT_INGREDIENTS)
            .map(String::as_str)
            .collect();
        let _ = write!(out, "Ingredients: {}", shown.join(", "));
        let hidden = recipe.ingredients.len().saturating_sub(MAX_PROMPT_INGREDIENTS);
        if hidden > 0 {
            let _ = write!(out, " (and {hidden} more)");
        }
        out.push('\n');
    }

    let step = context.step_index as usize;
    if let Some(text) = recipe.steps.get(step) {
        let _ = writeln!(
            out,
            "They are on step {} of {}: {text}",
            step + 1,
            recipe.steps.len()
        );
    }

    out.push_str("\nStart by greeting the user and offering to walk them through the recipe.");
    out
}
