//! WebSocket transport built on tokio-tungstenite

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::envelope::{ClientEnvelope, ServerEnvelope, WireMessage};
use super::profile::ProtocolProfile;
use super::{LinkState, Transport, TransportEvent};
use crate::{Error, Result};

/// Time allowed for the close handshake before the I/O task is aborted
const CLOSE_GRACE: Duration = Duration::from_secs(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A single WebSocket connection to the voice service
///
/// One I/O task per connection selects over the outbound queue and the
/// inbound stream, so sends never wait on reads.
pub struct WsTransport {
    url: String,
    profile: ProtocolProfile,
    default_rate: u32,
    link: Arc<Mutex<LinkState>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Create a transport for `url`
    ///
    /// `default_rate` is the playback rate assumed for inbound audio that
    /// does not declare one.
    #[must_use]
    pub fn new(url: impl Into<String>, profile: ProtocolProfile, default_rate: u32) -> Self {
        Self {
            url: url.into(),
            profile,
            default_rate,
            link: Arc::new(Mutex::new(LinkState::Closed)),
            outbound: Arc::new(Mutex::new(None)),
            io_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()> {
        {
            let mut link = lock(&self.link);
            if matches!(*link, LinkState::Connecting | LinkState::Open) {
                return Ok(());
            }
            *link = LinkState::Connecting;
        }

        tracing::debug!(url = %self.url, profile = %self.profile.name, "connecting");

        let task = tokio::spawn(run_connection(
            self.url.clone(),
            self.profile.clone(),
            self.default_rate,
            Arc::clone(&self.link),
            Arc::clone(&self.outbound),
            events,
        ));

        if let Some(previous) = lock(&self.io_task).replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn link_state(&self) -> LinkState {
        lock(&self.link).clone()
    }

    async fn send(&self, envelope: &ClientEnvelope) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }

        let message = match envelope.to_wire(&self.profile) {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(bytes) => Message::Binary(bytes),
        };

        lock(&self.outbound)
            .as_ref()
            .ok_or(Error::NotConnected)?
            .send(message)
            .map_err(|_| Error::NotConnected)?;

        tracing::trace!(kind = envelope.kind(), "envelope queued");
        Ok(())
    }

    async fn close(&self) {
        *lock(&self.link) = LinkState::Closed;
        let outbound = lock(&self.outbound).take();
        let Some(task) = lock(&self.io_task).take() else {
            return;
        };

        match outbound {
            Some(tx) => {
                let _ = tx.send(Message::Close(None));
                drop(tx);
                let abort = task.abort_handle();
                if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                    tracing::debug!("close handshake timed out");
                    abort.abort();
                }
            }
            None => task.abort(),
        }

        tracing::debug!(url = %self.url, "connection closed");
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.io_task).take() {
            task.abort();
        }
    }
}

async fn run_connection(
    url: String,
    profile: ProtocolProfile,
    default_rate: u32,
    link: Arc<Mutex<LinkState>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "connect failed");
            let mut link = lock(&link);
            if *link == LinkState::Connecting {
                *link = LinkState::Failed(e.to_string());
            }
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    {
        let mut link = lock(&link);
        if *link != LinkState::Connecting {
            // Closed while the handshake was in flight
            return;
        }
        *lock(&outbound) = Some(tx);
        *link = LinkState::Open;
    }
    let _ = events.send(TransportEvent::Opened);
    tracing::info!(url = %url, "connected to voice service");

    let reason = loop {
        tokio::select! {
            out = rx.recv() => match out {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = sink.send(message).await {
                        break Some(e.to_string());
                    }
                    if closing {
                        break None;
                    }
                }
                None => break None,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let event = match ServerEnvelope::parse(&text, &profile, default_rate) {
                        Ok(envelope) => TransportEvent::Envelope(envelope),
                        Err(e) => TransportEvent::Malformed(e.to_string()),
                    };
                    let _ = events.send(event);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = events.send(TransportEvent::Envelope(ServerEnvelope::from_binary(
                        bytes,
                        default_rate,
                    )));
                }
                Some(Ok(Message::Close(frame))) => {
                    break Some(frame.map_or_else(
                        || "closed by server".to_string(),
                        |f| format!("closed by server: {} {}", f.code, f.reason),
                    ));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break Some("stream ended".to_string()),
            },
        }
    };

    let intentional = {
        let mut link = lock(&link);
        let intentional = *link == LinkState::Closed;
        *link = LinkState::Closed;
        lock(&outbound).take();
        intentional
    };

    if !intentional {
        tracing::warn!(reason = ?reason, "connection lost");
        let _ = events.send(TransportEvent::Closed(reason));
    }
}
