//! PCM conversion between device samples and wire frames
//!
//! Hardware independent so it can run inside the capture callback and in
//! tests alike.

use std::path::Path;

use bytes::{BufMut, Bytes, BytesMut};
use rubato::{FftFixedIn, Resampler};

use crate::error::AudioError;
use crate::protocol::AudioFormat;
use crate::{Error, Result};

/// Native samples (per channel) collected before a frame is emitted
pub const FRAME_SAMPLES: usize = 4096;

/// Downmixes, resamples and frames captured audio
///
/// Runs on the capture thread, so every buffer is allocated up front and
/// reused from one frame to the next.
pub struct FrameAssembler {
    channels: usize,
    pending: Vec<f32>,
    frame: Vec<f32>,
    resampler: Option<FftFixedIn<f32>>,
    resampled: Vec<Vec<f32>>,
    /// PCM16 staging; its allocation comes back once emitted frames are dropped
    wire: BytesMut,
}

impl FrameAssembler {
    /// Build an assembler for a device running at `native_rate` with
    /// `channels` interleaved channels
    ///
    /// # Errors
    ///
    /// Returns error if the rate or channel count is zero, or the resampler
    /// cannot be built for the rate
    pub fn new(native_rate: u32, channels: u16) -> std::result::Result<Self, AudioError> {
        if native_rate == 0 {
            return Err(AudioError::InvalidSampleRate(native_rate));
        }
        if channels == 0 {
            return Err(AudioError::UnsupportedFormat("zero channels".to_string()));
        }

        let target = AudioFormat::CAPTURE.sample_rate;
        let resampler = if native_rate == target {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(
                    native_rate as usize,
                    target as usize,
                    FRAME_SAMPLES,
                    2,
                    1,
                )
                .map_err(|e| AudioError::UnsupportedFormat(format!("resampler: {e}")))?,
            )
        };

        let resampled = resampler
            .as_ref()
            .map(|r| r.output_buffer_allocate(true))
            .unwrap_or_default();

        Ok(Self {
            channels: usize::from(channels),
            pending: Vec::with_capacity(FRAME_SAMPLES * 2),
            frame: Vec::with_capacity(FRAME_SAMPLES),
            resampler,
            resampled,
            wire: BytesMut::with_capacity(FRAME_SAMPLES * 2),
        })
    }

    /// Feed interleaved samples, calling `emit(pcm, level)` per full frame
    ///
    /// `pcm` is 16 kHz mono PCM16 LE, `level` the frame's RMS in `0.0..=1.0`.
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(Bytes, f32)) {
        self.pending.extend(
            interleaved
                .chunks(self.channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
        );

        while self.pending.len() >= FRAME_SAMPLES {
            self.frame.clear();
            self.frame.extend(self.pending.drain(..FRAME_SAMPLES));
            let level = rms_level(&self.frame);

            let samples: &[f32] = match self.resampler.as_mut() {
                None => &self.frame,
                Some(resampler) => match resampler.process_into_buffer(
                    std::slice::from_ref(&self.frame),
                    &mut self.resampled[..],
                    None,
                ) {
                    Ok((_, written)) => &self.resampled[0][..written],
                    Err(e) => {
                        tracing::warn!(error = %e, "resampling failed, dropping frame");
                        continue;
                    }
                },
            };

            put_pcm16(samples, &mut self.wire);
            emit(self.wire.split().freeze(), level);
        }
    }
}

/// RMS amplitude clamped to `0.0..=1.0`, 0 for empty or non-finite input
#[must_use]
pub fn rms_level(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_square = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    let rms = mean_square.sqrt();
    if rms.is_finite() { rms.clamp(0.0, 1.0) } else { 0.0 }
}

/// f32 samples to PCM16 little-endian bytes
#[must_use]
pub fn encode_pcm16(samples: &[f32]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    put_pcm16(samples, &mut out);
    out.freeze()
}

#[allow(clippy::cast_possible_truncation)]
fn put_pcm16(samples: &[f32], out: &mut BytesMut) {
    out.reserve(samples.len() * 2);
    for &sample in samples {
        out.put_i16_le((sample.clamp(-1.0, 1.0) * 32767.0) as i16);
    }
}

/// PCM16 little-endian bytes to f32 samples; a trailing odd byte is ignored
#[must_use]
pub fn decode_pcm16(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect()
}

/// Write mono PCM16 LE bytes to a WAV file
///
/// # Errors
///
/// Returns error if the file cannot be written
pub fn write_wav(path: &Path, pcm: &[u8], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let wav_err = |e: hound::Error| Error::Audio(AudioError::Device(format!("wav: {e}")));
    let mut writer = hound::WavWriter::create(path, spec).map_err(wav_err)?;
    for b in pcm.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([b[0], b[1]]))
            .map_err(wav_err)?;
    }
    writer.finalize().map_err(wav_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(assembler: &mut FrameAssembler, samples: &[f32]) -> Vec<(Bytes, f32)> {
        let mut frames = Vec::new();
        assembler.push(samples, |pcm, level| frames.push((pcm, level)));
        frames
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(matches!(
            FrameAssembler::new(0, 1),
            Err(AudioError::InvalidSampleRate(0))
        ));
        assert!(FrameAssembler::new(16_000, 0).is_err());
    }

    #[test]
    fn native_wire_rate_is_framed_without_resampling() {
        let mut assembler = FrameAssembler::new(16_000, 1).unwrap();
        assert!(collect(&mut assembler, &vec![0.25; FRAME_SAMPLES - 1]).is_empty());

        let frames = collect(&mut assembler, &[0.25]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.len(), FRAME_SAMPLES * 2);
        assert!((frames[0].1 - 0.25).abs() < 1e-4);
    }

    #[test]
    fn stereo_is_downmixed() {
        let mut assembler = FrameAssembler::new(16_000, 2).unwrap();
        let interleaved: Vec<f32> = (0..FRAME_SAMPLES).flat_map(|_| [0.5, -0.5]).collect();
        let frames = collect(&mut assembler, &interleaved);
        assert_eq!(frames.len(), 1);
        assert!(decode_pcm16(&frames[0].0).iter().all(|s| *s == 0.0));
        assert_eq!(frames[0].1, 0.0);
    }

    #[test]
    fn higher_native_rate_is_resampled_down() {
        let mut assembler = FrameAssembler::new(48_000, 1).unwrap();
        let frames = collect(&mut assembler, &vec![0.1; FRAME_SAMPLES * 3]);
        assert_eq!(frames.len(), 3);
        for (pcm, _) in &frames {
            let samples = pcm.len() / 2;
            assert!(samples > 0 && samples < FRAME_SAMPLES);
        }
    }

    #[test]
    fn buffers_are_reused_across_frames() {
        let mut assembler = FrameAssembler::new(48_000, 1).unwrap();
        let first = collect(&mut assembler, &vec![0.1; FRAME_SAMPLES]);
        assert_eq!(first.len(), 1);
        drop(first);

        let frame = assembler.frame.as_ptr();
        let resampled = assembler.resampled[0].as_ptr();

        let mut sizes = Vec::new();
        for _ in 0..8 {
            assembler.push(&vec![0.1; FRAME_SAMPLES], |pcm, _| sizes.push(pcm.len()));
        }

        assert_eq!(sizes.len(), 8);
        assert!(sizes.iter().all(|n| *n == sizes[0] && *n > 0));
        assert_eq!(assembler.frame.as_ptr(), frame);
        assert_eq!(assembler.resampled[0].as_ptr(), resampled);
    }

    #[test]
    fn level_is_clamped_and_finite() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[f32::NAN, 0.5]), 0.0);
        assert_eq!(rms_level(&[4.0, -4.0]), 1.0);
        assert!((rms_level(&[0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn pcm16_conversion_clamps() {
        let pcm = encode_pcm16(&[2.0, -2.0, 0.0]);
        assert_eq!(&pcm[..2], &i16::MAX.to_le_bytes());
        assert_eq!(&pcm[2..4], &(-32767i16).to_le_bytes());
        assert_eq!(decode_pcm16(&pcm[..5]).len(), 2);
    }

    #[test]
    fn wav_file_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.wav");
        write_wav(&path, &encode_pcm16(&[0.1; 160]), 16_000).unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.len(), 160);
    }
}
