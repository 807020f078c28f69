//! Audio playback to speakers

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, StreamConfig};
use tokio::sync::oneshot;

use super::AudioSink;
use super::codec::PlaybackItem;
use super::resample::resample;
use crate::{Error, Result};

/// Slack added to a buffer's nominal length before giving up on the
/// completion signal
const COMPLETION_GRACE: Duration = Duration::from_millis(500);

enum Signal {
    Drained,
    Abort,
}

/// Sends `Abort` to the output thread unless disarmed
struct AbortOnDrop(Option<Sender<Signal>>);

impl AbortOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Signal::Abort);
        }
    }
}

/// Plays buffers on the default output device
///
/// Each buffer gets its own output stream, opened at the buffer's sample rate
/// on a short-lived thread (cpal streams are not `Send`). The stream is
/// dropped as soon as the buffer drains or playback is aborted.
#[derive(Default)]
pub struct SpeakerOutput {
    active: Mutex<Option<Sender<Signal>>>,
}

impl SpeakerOutput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AudioSink for SpeakerOutput {
    async fn play(&self, item: PlaybackItem) -> Result<()> {
        if item.samples.is_empty() {
            return Ok(());
        }

        let (signal_tx, signal_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = oneshot::channel::<Result<()>>();

        let mut guard = AbortOnDrop(Some(signal_tx.clone()));
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(signal_tx.clone());

        std::thread::Builder::new()
            .name("voxlink-playback".to_string())
            .spawn(move || {
                let result = play_blocking(item, signal_tx, &signal_rx);
                let _ = done_tx.send(result);
            })
            .map_err(|e| Error::Audio(format!("failed to spawn playback thread: {e}")))?;

        let result = done_rx
            .await
            .unwrap_or_else(|_| Err(Error::Audio("playback thread exited".to_string())));

        guard.disarm();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        result
    }

    fn close(&self) {
        if let Some(tx) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(Signal::Abort);
            tracing::debug!("closed active output stream");
        }
    }
}

/// Play one buffer and wait for it to drain or be aborted
fn play_blocking(item: PlaybackItem, drained_tx: Sender<Signal>, signal_rx: &Receiver<Signal>) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let nominal = item.duration();
    let (config, samples) = output_config(&device, item)?;
    let channels = usize::from(config.channels);
    let total = samples.len();

    let mut position = 0usize;
    let mut notified = false;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(position).copied().unwrap_or(0.0);
                    frame.fill(sample);

                    if position < total {
                        position += 1;
                    } else if !notified {
                        notified = true;
                        let _ = drained_tx.send(Signal::Drained);
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let outcome = signal_rx.recv_timeout(nominal + COMPLETION_GRACE);
    drop(stream);

    match outcome {
        Ok(Signal::Drained) => tracing::trace!(samples = total, "playback complete"),
        Ok(Signal::Abort) => tracing::debug!(samples = total, "playback aborted"),
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(samples = total, "playback completion not signalled, assuming finished");
        }
        Err(RecvTimeoutError::Disconnected) => {}
    }

    Ok(())
}

/// Pick an output config at the item's rate, or resample to the device default
fn output_config(device: &Device, item: PlaybackItem) -> Result<(StreamConfig, Vec<f32>)> {
    let rate = item.sample_rate;
    let supports = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(rate)
                && c.max_sample_rate() >= SampleRate(rate)
        })
    };

    if let Some(supported) = supports(1).or_else(|| supports(2)) {
        let config = supported.with_sample_rate(SampleRate(rate)).config();
        tracing::trace!(
            sample_rate = rate,
            channels = config.channels,
            "output stream at item rate"
        );
        return Ok((config, item.samples));
    }

    let config: StreamConfig = device
        .default_output_config()
        .map_err(|e| Error::Audio(e.to_string()))?
        .config();
    let samples = resample(&item.samples, rate, config.sample_rate.0)?;
    tracing::trace!(
        from = rate,
        to = config.sample_rate.0,
        "resampling output to device rate"
    );
    Ok((config, samples))
}
