//! Audio playback to speakers

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};

use super::frame::decode_pcm16;
use crate::error::AudioError;
use crate::protocol::{AudioFormat, AudioFrame};

/// Buffered speech chunks before the oldest is dropped
pub const DEFAULT_QUEUE_FRAMES: usize = 64;

/// Bounded playback buffer shared with the output callback
///
/// When full, the oldest queued chunk is dropped so latency stays bounded
/// under a slow output device.
#[derive(Debug)]
pub struct PlaybackQueue {
    queued: VecDeque<Vec<f32>>,
    capacity: usize,
    current: Vec<f32>,
    position: usize,
    dropped: u64,
}

impl PlaybackQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queued: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            current: Vec::new(),
            position: 0,
            dropped: 0,
        }
    }

    /// Queue a chunk, returning true if the oldest one was dropped for it
    pub fn push(&mut self, samples: Vec<f32>) -> bool {
        if samples.is_empty() {
            return false;
        }
        let overflow = self.queued.len() >= self.capacity;
        if overflow {
            self.queued.pop_front();
            self.dropped += 1;
        }
        self.queued.push_back(samples);
        overflow
    }

    /// Fill an interleaved output buffer, padding with silence
    pub fn fill(&mut self, out: &mut [f32], channels: usize) {
        for frame in out.chunks_mut(channels.max(1)) {
            let sample = self.next_sample().unwrap_or(0.0);
            frame.fill(sample);
        }
    }

    fn next_sample(&mut self) -> Option<f32> {
        while self.position >= self.current.len() {
            self.current = self.queued.pop_front()?;
            self.position = 0;
        }
        let sample = self.current[self.position];
        self.position += 1;
        Some(sample)
    }

    /// Whether anything is queued or still playing
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.position < self.current.len() || !self.queued.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Chunks dropped due to overflow
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Gapless playback of inbound speech on the default output device
pub struct AudioSink {
    queue: Arc<Mutex<PlaybackQueue>>,
    #[allow(dead_code)]
    stream: Stream,
}

impl AudioSink {
    /// Open the default output device at the playback rate
    ///
    /// # Errors
    ///
    /// Returns error if no output device supports the playback rate
    pub fn new(capacity: usize) -> Result<Self, AudioError> {
        let rate = AudioFormat::PLAYBACK.sample_rate;
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or(AudioError::NoDevice("output"))?;

        let supports = |channels: u16| {
            move |c: &cpal::SupportedStreamConfigRange| {
                c.channels() == channels
                    && c.sample_format() == cpal::SampleFormat::F32
                    && c.min_sample_rate() <= SampleRate(rate)
                    && c.max_sample_rate() >= SampleRate(rate)
            }
        };
        let supported_config = device
            .supported_output_configs()
            .map_err(|e| AudioError::Device(e.to_string()))?
            .find(supports(1))
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(supports(2))
            })
            .ok_or_else(|| {
                AudioError::UnsupportedFormat(format!("no {rate} Hz output config"))
            })?;

        let config = supported_config.with_sample_rate(SampleRate(rate)).config();
        let channels = usize::from(config.channels);

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = rate,
            channels,
            "audio playback initialized"
        );

        let queue = Arc::new(Mutex::new(PlaybackQueue::new(capacity)));
        let shared = Arc::clone(&queue);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    shared
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .fill(data, channels);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| AudioError::Device(e.to_string()))?;
        stream
            .play()
            .map_err(|e| AudioError::Device(e.to_string()))?;

        Ok(Self { queue, stream })
    }

    /// Queue a speech frame behind whatever is already playing
    pub fn schedule(&self, frame: &AudioFrame) {
        if frame.format != AudioFormat::PLAYBACK {
            tracing::debug!(rate = frame.format.sample_rate, "unexpected playback format");
        }
        let samples = decode_pcm16(&frame.data);
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.push(samples) {
            tracing::debug!(
                seq = frame.sequence,
                dropped = queue.dropped(),
                "playback queue full, dropped oldest chunk"
            );
        }
    }

    /// Whether speech is queued or playing (UI only)
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.queue.lock().is_ok_and(|q| q.is_active())
    }
}
