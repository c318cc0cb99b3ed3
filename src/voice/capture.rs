//! Audio capture from microphone

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream};

use super::frame::FrameAssembler;
use crate::error::AudioError;
use crate::protocol::AudioFrame;

/// Receives each wire-ready frame; runs on the audio thread and must not block
pub type FrameCallback = Arc<dyn Fn(AudioFrame) + Send + Sync>;

/// Receives the frame's RMS level for metering
pub type LevelCallback = Arc<dyn Fn(f32) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Running,
    Paused,
}

/// Token returned by [`AudioFrameSource::start`]
#[derive(Debug, PartialEq, Eq)]
pub struct CaptureHandle(u64);

/// Microphone capture producing 16 kHz mono PCM16 frames
///
/// Interruptions and route changes are handled by calling [`pause`] and
/// [`resume`]; resume reopens the current default device with its new
/// native format.
///
/// [`pause`]: AudioFrameSource::pause
/// [`resume`]: AudioFrameSource::resume
pub struct AudioFrameSource {
    state: CaptureState,
    stream: Option<Stream>,
    callbacks: Option<(FrameCallback, LevelCallback)>,
    sequence: Arc<AtomicU64>,
    active: Option<u64>,
    next_handle: u64,
}

impl Default for AudioFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioFrameSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: CaptureState::Idle,
            stream: None,
            callbacks: None,
            sequence: Arc::new(AtomicU64::new(0)),
            active: None,
            next_handle: 1,
        }
    }

    #[must_use]
    pub const fn state(&self) -> CaptureState {
        self.state
    }

    /// Open the default input device and start emitting frames
    ///
    /// # Errors
    ///
    /// Returns error if capture is already started, permission is denied, or
    /// the device cannot be opened
    pub fn start(
        &mut self,
        on_frame: FrameCallback,
        on_level: LevelCallback,
    ) -> Result<CaptureHandle, AudioError> {
        if self.state != CaptureState::Idle {
            return Err(AudioError::Device("capture already started".to_string()));
        }

        let stream = open_stream(
            Arc::clone(&on_frame),
            Arc::clone(&on_level),
            Arc::clone(&self.sequence),
        )?;
        self.stream = Some(stream);
        self.callbacks = Some((on_frame, on_level));
        self.state = CaptureState::Running;

        let id = self.next_handle;
        self.next_handle += 1;
        self.active = Some(id);
        tracing::debug!("audio capture started");
        Ok(CaptureHandle(id))
    }

    /// Stop capture; a stale handle is ignored
    pub fn stop(&mut self, handle: CaptureHandle) {
        if self.active != Some(handle.0) {
            return;
        }
        self.stream = None;
        self.callbacks = None;
        self.active = None;
        self.state = CaptureState::Idle;
        tracing::debug!("audio capture stopped");
    }

    /// Release the device but keep the session's callbacks
    pub fn pause(&mut self) {
        if self.state != CaptureState::Running {
            return;
        }
        self.stream = None;
        self.state = CaptureState::Paused;
        tracing::debug!("audio capture paused");
    }

    /// Reopen the device after [`pause`](Self::pause)
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be reopened; the source stays paused
    pub fn resume(&mut self) -> Result<(), AudioError> {
        if self.state != CaptureState::Paused {
            return Ok(());
        }
        let Some((on_frame, on_level)) = self.callbacks.clone() else {
            self.state = CaptureState::Idle;
            return Ok(());
        };

        let stream = open_stream(on_frame, on_level, Arc::clone(&self.sequence))?;
        self.stream = Some(stream);
        self.state = CaptureState::Running;
        tracing::debug!("audio capture resumed");
        Ok(())
    }
}

fn open_stream(
    on_frame: FrameCallback,
    on_level: LevelCallback,
    sequence: Arc<AtomicU64>,
) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoDevice("input"))?;

    let supported = device
        .default_input_config()
        .map_err(|e| classify(e.to_string()))?;
    let native_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let sample_format = supported.sample_format();
    let config = supported.config();

    let mut assembler = FrameAssembler::new(native_rate, channels)?;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        native_rate,
        channels,
        format = ?sample_format,
        "audio capture initialized"
    );

    let mut emit = move |pcm: Bytes, level: f32| {
        on_level(level);
        on_frame(AudioFrame::outbound(
            sequence.fetch_add(1, Ordering::Relaxed),
            pcm,
        ));
    };
    let on_error = |err: cpal::StreamError| {
        tracing::error!(error = %err, "audio capture error");
    };

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| assembler.push(data, &mut emit),
            on_error,
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    scratch.clear();
                    scratch.extend(data.iter().map(|&s| f32::from(s) / 32768.0));
                    assembler.push(&scratch, &mut emit);
                },
                on_error,
                None,
            )
        }
        other => {
            return Err(AudioError::UnsupportedFormat(format!("{other:?}")));
        }
    }
    .map_err(|e| classify(e.to_string()))?;

    stream.play().map_err(|e| classify(e.to_string()))?;
    Ok(stream)
}

/// Backends report permission problems as free-form errors
fn classify(message: String) -> AudioError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        AudioError::PermissionDenied
    } else {
        AudioError::Device(message)
    }
}
