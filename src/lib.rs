//! voxlink - real-time voice streaming client
//!
//! This library provides the pipeline for conversational voice sessions:
//! - Fixed-size PCM16 frame capture on a dedicated audio thread
//! - Envelope framing over a persistent WebSocket connection
//! - A session state machine driven by transport and playback events
//! - Ordered, non-overlapping playback of returned speech
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  SessionController                   │
//! │   start / stop / toggle  │  keepalive  │  teardown   │
//! └──────┬──────────────────────┬───────────────┬───────┘
//!        │                      │               │
//! ┌──────▼───────┐      ┌───────▼──────┐ ┌──────▼───────┐
//! │  MicCapture  │      │  Transport   │ │ PlaybackQueue│
//! │ FrameBuffer  │─────▶│  envelopes   │─▶ FIFO, 1 item │
//! │  (rt thread) │frames│  (WebSocket) │ │  at a time   │
//! └──────────────┘      └──────────────┘ └──────────────┘
//! ```

pub mod config;
pub mod error;
pub mod session;
pub mod transport;
pub mod voice;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use session::{SessionController, SessionEvent, SessionId, SessionState};
pub use transport::{ProtocolProfile, Transport, WsTransport};
