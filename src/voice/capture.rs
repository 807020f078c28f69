//! Microphone capture on a dedicated real-time thread

use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use super::AudioSource;
use super::frame::{AudioFrame, FrameBuffer};
use super::resample::{StreamResampler, downmix};
use crate::config::CaptureConfig;
use crate::{Error, Result};

/// Captures audio from the default input device
///
/// cpal streams are not `Send`, so the stream is built and owned by a
/// dedicated thread that parks until capture is stopped. Samples flow from the
/// cpal callback into a [`FrameBuffer`]; completed frames leave over the
/// channel handed to [`AudioSource::start`].
pub struct MicCapture {
    config: CaptureConfig,
    worker: Mutex<Option<CaptureWorker>>,
}

struct CaptureWorker {
    stop_tx: std::sync::mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl MicCapture {
    #[must_use]
    pub const fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            worker: Mutex::new(None),
        }
    }

    /// The configured capture sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }
}

#[async_trait]
impl AudioSource for MicCapture {
    async fn start(&self, frames: mpsc::UnboundedSender<AudioFrame>) -> Result<()> {
        if self.is_capturing() {
            return Ok(());
        }

        let config = self.config.clone();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("voxlink-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(&config, frames) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(Error::from_capture_backend(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until stop is requested or the worker handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("capture thread released input stream");
            })
            .map_err(|e| Error::CaptureInitFailed(format!("failed to spawn capture thread: {e}")))?;

        let ready = ready_rx
            .await
            .unwrap_or_else(|_| Err(Error::CaptureInitFailed("capture thread exited".to_string())));

        if let Err(e) = ready {
            let _ = thread.join();
            return Err(e);
        }

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(CaptureWorker { stop_tx, thread });

        tracing::debug!(sample_rate = self.config.sample_rate, "audio capture started");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(worker) = worker else {
            return Ok(());
        };

        let _ = worker.stop_tx.send(());
        worker
            .thread
            .join()
            .map_err(|_| Error::Audio("capture thread panicked".to_string()))?;

        tracing::debug!("audio capture stopped");
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        if let Err(e) = AudioSource::stop(self) {
            tracing::warn!(error = %e, "failed to stop capture on drop");
        }
    }
}

/// Build the input stream, falling back to the device default config plus
/// downmix/resample when mono at the capture rate is unavailable
fn open_input_stream(
    config: &CaptureConfig,
    frames: mpsc::UnboundedSender<AudioFrame>,
) -> Result<Stream> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(Error::DeviceNotFound)?;
    let rate = config.sample_rate;

    tracing::debug!(
        echo_cancellation = config.echo_cancellation,
        noise_suppression = config.noise_suppression,
        auto_gain_control = config.auto_gain_control,
        "capture processing hints are delegated to the host"
    );

    let supported = device
        .supported_input_configs()
        .map_err(|e| Error::from_capture_backend(e.to_string()))?
        .find(|c| {
            c.channels() == config.channel_count
                && c.min_sample_rate() <= SampleRate(rate)
                && c.max_sample_rate() >= SampleRate(rate)
        });

    let mut frame_buffer = FrameBuffer::new(config.frame_size, frames);
    let on_error = |err: cpal::StreamError| {
        tracing::error!(error = %err, "audio capture error");
    };

    let stream = if let Some(supported) = supported {
        let stream_config = supported.with_sample_rate(SampleRate(rate)).config();
        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            sample_rate = rate,
            channels = stream_config.channels,
            "audio capture initialized"
        );

        device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                frame_buffer.push_slice(data);
            },
            on_error,
            None,
        )
    } else {
        let stream_config: StreamConfig = device
            .default_input_config()
            .map_err(|e| Error::from_capture_backend(e.to_string()))?
            .config();
        let channels = usize::from(stream_config.channels);
        let mut resampler = StreamResampler::new(stream_config.sample_rate.0, rate)?;

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            device_rate = stream_config.sample_rate.0,
            channels,
            sample_rate = rate,
            "audio capture initialized with resampling"
        );

        device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                if let Err(e) = resampler.process(&mono, |s| frame_buffer.push(s)) {
                    tracing::error!(error = %e, "capture resample failed");
                }
            },
            on_error,
            None,
        )
    }
    .map_err(|e| Error::from_capture_backend(e.to_string()))?;

    Ok(stream)
}
