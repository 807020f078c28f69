//! Sample-rate conversion for devices that cannot run at the pipeline rates

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

const CHUNK_SIZE: usize = 1024;
const SUB_CHUNKS: usize = 2;

fn build(from_rate: u32, to_rate: u32) -> Result<FftFixedIn<f32>> {
    FftFixedIn::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        CHUNK_SIZE,
        SUB_CHUNKS,
        1,
    )
    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))
}

/// Resample a complete mono buffer
///
/// The output is aligned with the input: the resampler's leading delay is
/// trimmed and its tail flushed, so the result has `len * to / from` samples.
///
/// # Errors
///
/// Returns error if the resampler cannot be built or fails
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = build(from_rate, to_rate)?;
    let delay = resampler.output_delay();
    let expected = samples.len() * to_rate as usize / from_rate as usize;
    let mut output = Vec::with_capacity(delay + expected + CHUNK_SIZE);

    let mut chunks = samples.chunks_exact(CHUNK_SIZE);
    for chunk in &mut chunks {
        let result = resampler
            .process(&[chunk], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let result = resampler
            .process_partial(Some(&[tail][..]), None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    // Push silence through until the delayed tail is out
    while output.len() < delay + expected {
        let result = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(|e| Error::Audio(format!("resample flush failed: {e}")))?;
        if result[0].is_empty() {
            break;
        }
        output.extend_from_slice(&result[0]);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);
    Ok(output)
}

/// Incremental resampler for the capture callback
///
/// Buffers input until a full resampler chunk is available.
pub struct StreamResampler {
    inner: FftFixedIn<f32>,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// # Errors
    ///
    /// Returns error if the resampler cannot be built
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        Ok(Self {
            inner: build(from_rate, to_rate)?,
            pending: Vec::with_capacity(CHUNK_SIZE * 2),
        })
    }

    /// Feed input, handing each resampled sample to `out`
    ///
    /// # Errors
    ///
    /// Returns error if the resampler fails
    pub fn process(&mut self, input: &[f32], mut out: impl FnMut(f32)) -> Result<()> {
        self.pending.extend_from_slice(input);

        loop {
            let need = self.inner.input_frames_next();
            if self.pending.len() < need {
                return Ok(());
            }
            let result = self
                .inner
                .process(&[&self.pending[..need]], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            self.pending.drain(..need);
            for &sample in &result[0] {
                out(sample);
            }
        }
    }
}

/// Average interleaved channels down to mono
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
