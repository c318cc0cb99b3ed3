//! Client-side audio
//!
//! Capture produces 16 kHz mono PCM16 frames for the relay; playback
//! consumes the 24 kHz speech coming back.

mod capture;
mod frame;
mod playback;

pub use capture::{AudioFrameSource, CaptureHandle, CaptureState, FrameCallback, LevelCallback};
pub use frame::{FRAME_SAMPLES, FrameAssembler, decode_pcm16, encode_pcm16, rms_level, write_wav};
pub use playback::{AudioSink, DEFAULT_QUEUE_FRAMES, PlaybackQueue};
