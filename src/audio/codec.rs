//! # Frame Codec
//!
//! Converts between the two audio representations the engine deals with:
//! - **Outbound**: captured `f32` samples → 16-bit little-endian PCM frames (16 kHz mono)
//! - **Inbound**: 16-bit little-endian PCM bytes → normalized `f32` playback buffers (24 kHz)
//!
//! Both directions are pure functions with no shared state, so they are safe to
//! call from the device callback thread as well as from the session actor.

use crate::error::{SessionError, SessionResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Sample rate of captured microphone audio sent to the endpoint.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of synthesized speech received from the endpoint.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Bytes per 16-bit PCM sample.
const BYTES_PER_SAMPLE: usize = 2;

/// One encoded outbound frame: mono 16-bit PCM at `INPUT_SAMPLE_RATE`.
///
/// Frames are handed to the transport once and never retained afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
}

impl AudioFrame {
    /// Encode a slice of captured samples into a frame.
    pub fn from_samples(samples: &[f32]) -> Self {
        Self { data: encode(samples) }
    }

    pub fn sample_count(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// A decoded inbound audio buffer ready to be scheduled for playback.
///
/// ## Layout:
/// Samples are stored per channel (planar), normalized to [-1.0, 1.0).
/// Playback uses channel 0; the engine requests mono speech.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSegment {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

impl PlaybackSegment {
    /// Build a mono segment directly from samples.
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            channels: vec![samples],
            sample_rate,
        }
    }

    /// Samples of the playback channel.
    pub fn samples(&self) -> &[f32] {
        self.channels.first().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of sample frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.samples().len()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }
}

/// Encode `f32` samples as 16-bit little-endian PCM.
///
/// Each sample is clamped to [-1, 1] and scaled asymmetrically so that -1.0
/// maps to `i16::MIN` and 1.0 maps to `i16::MAX`.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        // The Vec writer cannot fail
        let _ = out.write_i16::<LittleEndian>(float_to_i16(sample));
    }
    out
}

/// Decode 16-bit little-endian PCM into a playback segment.
///
/// ## Errors:
/// `MalformedAudioData` if `channels` is zero or the byte length is not a
/// multiple of `2 * channels`.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> SessionResult<PlaybackSegment> {
    if channels == 0 {
        return Err(SessionError::MalformedAudioData(
            "channel count must be at least 1".to_string(),
        ));
    }

    let frame_bytes = BYTES_PER_SAMPLE * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(SessionError::MalformedAudioData(format!(
            "{} bytes is not a multiple of {} bytes per frame",
            bytes.len(),
            frame_bytes
        )));
    }

    let frames = bytes.len() / frame_bytes;
    let mut planar = vec![Vec::with_capacity(frames); channels as usize];
    let mut cursor = Cursor::new(bytes);

    for _ in 0..frames {
        for channel in planar.iter_mut() {
            let sample = cursor
                .read_i16::<LittleEndian>()
                .map_err(|e| SessionError::MalformedAudioData(e.to_string()))?;
            channel.push(i16_to_float(sample));
        }
    }

    Ok(PlaybackSegment {
        channels: planar,
        sample_rate,
    })
}

fn float_to_i16(sample: f32) -> i16 {
    // NaN is treated as silence
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

fn i16_to_float(sample: i16) -> f32 {
    sample as f32 / 32768.0
}
