//! Fixed-length PCM16 frames and the capture-side accumulator

use std::sync::Arc;

use tokio::sync::mpsc;

/// Capture sample rate (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per frame (2048 at 16kHz is roughly 128ms)
pub const FRAME_SIZE: usize = 2048;

/// An immutable, mono block of PCM16 samples
///
/// Cloning is cheap; the samples are shared, never mutated after emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
}

impl AudioFrame {
    /// Build a frame from owned samples
    #[must_use]
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Little-endian byte layout of the samples
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Map a normalized float sample to PCM16
///
/// Clamps to [-1, 1], then scales negatives by 32768 and non-negatives by
/// 32767. The scaled value is truncated toward zero.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn sample_to_pcm16(sample: f32) -> i16 {
    // NaN clamps to NaN; treat it as silence
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Accumulates float samples into fixed-length PCM16 frames
///
/// Lives on the real-time capture thread. Completed frames are copied out and
/// sent over an unbounded channel so the audio callback never waits on the
/// consumer.
pub struct FrameBuffer {
    current: Box<[i16]>,
    offset: usize,
    frames: mpsc::UnboundedSender<AudioFrame>,
    emitted: u64,
}

impl FrameBuffer {
    /// Create an accumulator emitting frames of `capacity` samples
    ///
    /// A zero capacity is bumped to one.
    #[must_use]
    pub fn new(capacity: usize, frames: mpsc::UnboundedSender<AudioFrame>) -> Self {
        Self {
            current: vec![0; capacity.max(1)].into_boxed_slice(),
            offset: 0,
            frames,
            emitted: 0,
        }
    }

    /// Append one normalized sample, emitting a frame when full
    pub fn push(&mut self, sample: f32) {
        self.current[self.offset] = sample_to_pcm16(sample);
        self.offset += 1;

        if self.offset == self.current.len() {
            let frame = AudioFrame::new(self.current.to_vec());
            self.offset = 0;
            self.emitted += 1;
            // Consumer gone means the session is tearing down; keep running
            let _ = self.frames.send(frame);
        }
    }

    /// Append a block of samples as delivered by the audio callback
    pub fn push_slice(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.push(sample);
        }
    }

    /// Samples written into the open frame
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.current.len()
    }

    /// Frames emitted since creation
    #[must_use]
    pub const fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Drop the partially filled frame without emitting it
    pub const fn reset(&mut self) {
        self.offset = 0;
    }
}
