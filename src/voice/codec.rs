//! Stateless PCM16 and base64 conversions

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::frame::AudioFrame;
use crate::{Error, Result};

/// Base64 text of a frame's little-endian PCM16 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: String,
    pub sample_rate: u32,
}

/// Decoded audio ready for the output device
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackItem {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackItem {
    /// Playback length at the item's own rate
    #[must_use]
    pub fn duration(&self) -> std::time::Duration {
        if self.sample_rate == 0 {
            return std::time::Duration::ZERO;
        }
        #[allow(clippy::cast_precision_loss)]
        let secs = self.samples.len() as f64 / f64::from(self.sample_rate);
        std::time::Duration::from_secs_f64(secs)
    }
}

/// Convert a PCM16 sample to a normalized float
///
/// Negatives divide by 32768, non-negatives by 32767.
#[must_use]
pub fn pcm16_to_sample(value: i16) -> f32 {
    if value < 0 {
        f32::from(value) / 32768.0
    } else {
        f32::from(value) / 32767.0
    }
}

/// Encode a frame as base64 PCM16LE
#[must_use]
pub fn encode(frame: &AudioFrame, sample_rate: u32) -> EncodedChunk {
    EncodedChunk {
        data: BASE64.encode(frame.to_le_bytes()),
        sample_rate,
    }
}

/// Decode base64 text back to raw bytes
///
/// # Errors
///
/// Returns `PlaybackDecode` if the text is not valid base64
pub fn decode_bytes(data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data.trim())
        .map_err(|e| Error::PlaybackDecode(format!("invalid base64: {e}")))
}

/// Reinterpret little-endian bytes as PCM16 samples
///
/// # Errors
///
/// Returns `PlaybackDecode` if the byte count is odd
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::PlaybackDecode(format!(
            "odd byte count {} for PCM16",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Decode a chunk's payload to PCM16 samples
///
/// # Errors
///
/// Returns `PlaybackDecode` on invalid base64 or odd byte count
pub fn decode_pcm(chunk: &EncodedChunk) -> Result<Vec<i16>> {
    bytes_to_pcm16(&decode_bytes(&chunk.data)?)
}

/// Turn raw PCM16LE bytes into a playable buffer
///
/// # Errors
///
/// Returns `PlaybackDecode` on odd byte count
pub fn decode_raw(bytes: &[u8], sample_rate: u32) -> Result<PlaybackItem> {
    let samples = bytes_to_pcm16(bytes)?
        .into_iter()
        .map(pcm16_to_sample)
        .collect();
    Ok(PlaybackItem {
        samples,
        sample_rate,
    })
}

/// Decode a chunk into a playable buffer at `sample_rate`
///
/// # Errors
///
/// Returns `PlaybackDecode` on invalid base64 or odd byte count
pub fn decode(chunk: &EncodedChunk, sample_rate: u32) -> Result<PlaybackItem> {
    decode_raw(&decode_bytes(&chunk.data)?, sample_rate)
}
