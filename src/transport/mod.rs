//! Persistent socket connection to the voice service
//!
//! A [`Transport`] owns one full-duplex, message-oriented connection. It
//! serializes [`ClientEnvelope`]s according to the active
//! [`ProtocolProfile`], decodes inbound frames into [`ServerEnvelope`]s, and
//! reports lifecycle changes as [`TransportEvent`]s.
//!
//! Delivery order is assumed equal to send order; envelopes carry no sequence
//! numbers.

mod envelope;
mod profile;
mod ws;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use envelope::{ClientEnvelope, ServerEnvelope, TranscriptRole, WireMessage};
pub use profile::{AudioFraming, FieldMapping, ProtocolProfile};
pub use ws::WsTransport;

use crate::Result;

/// Connection lifecycle as seen by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Connecting,
    Open,
    /// The connection attempt failed
    Failed(String),
}

impl LinkState {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Events emitted by a transport while connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Envelope(ServerEnvelope),
    /// An inbound frame could not be decoded
    Malformed(String),
    /// The peer closed the connection or the read side failed
    Closed(Option<String>),
}

/// A persistent, ordered, message-oriented connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin connecting; returns without waiting for the open state
    ///
    /// Events for this connection are delivered on `events`. Calling
    /// `connect` while connecting or open is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the attempt cannot be started at all
    async fn connect(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()>;

    /// Current lifecycle state
    fn link_state(&self) -> LinkState;

    /// Queue an envelope for sending
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` unless the link is open
    async fn send(&self, envelope: &ClientEnvelope) -> Result<()>;

    /// Close the connection; no `Closed` event is emitted for an intentional
    /// close
    async fn close(&self);

    fn is_open(&self) -> bool {
        self.link_state().is_open()
    }
}
