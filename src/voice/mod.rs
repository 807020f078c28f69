//! Voice processing module
//!
//! Handles frame accumulation, PCM16 encoding, microphone capture, and
//! ordered playback of returned audio.

mod capture;
pub mod codec;
mod frame;
mod playback;
mod queue;
mod resample;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use capture::MicCapture;
pub use codec::{EncodedChunk, PlaybackItem};
pub use frame::{AudioFrame, FRAME_SIZE, FrameBuffer, SAMPLE_RATE, sample_to_pcm16};
pub use playback::SpeakerOutput;
pub use queue::{ChunkPayload, PlaybackEvent, PlaybackQueue};
pub use resample::{downmix, resample};

use crate::Result;

/// A source of captured audio frames
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Acquire the capture device and begin emitting frames on `frames`
    ///
    /// Resolves once the device is running. Starting an already running
    /// source is a no-op.
    async fn start(&self, frames: mpsc::UnboundedSender<AudioFrame>) -> Result<()>;

    /// Stop capture and release the device
    ///
    /// # Errors
    ///
    /// Returns error if the capture thread could not be shut down cleanly
    fn stop(&self) -> Result<()>;

    /// Whether the device is currently held
    fn is_capturing(&self) -> bool;
}

/// An output device that plays one buffer at a time
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play `item`, resolving when its last sample has been rendered
    ///
    /// Dropping the returned future stops the buffer immediately.
    async fn play(&self, item: PlaybackItem) -> Result<()>;

    /// Release any open output device contexts
    fn close(&self) {}
}
