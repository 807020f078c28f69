//! Shared test utilities
//!
//! In-memory stand-ins for the socket, the microphone, and the speaker so
//! sessions can run without network or audio hardware.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use voxlink::transport::{ClientEnvelope, LinkState, ServerEnvelope, Transport, TransportEvent};
use voxlink::voice::{
    AudioFrame, AudioSink, AudioSource, ChunkPayload, FRAME_SIZE, FrameBuffer, PlaybackItem,
    codec,
};
use voxlink::{Error, Result, SessionController, SessionState};

/// How a [`MockTransport`] reacts to `connect`
#[derive(Debug, Clone)]
pub enum OpenBehavior {
    Immediate,
    After(Duration),
    Never,
    Fail(String),
}

/// Records every envelope sent and lets tests inject inbound events
pub struct MockTransport {
    behavior: OpenBehavior,
    /// Reply to `start` with `session_started`
    ack_on_start: AtomicBool,
    state: Arc<Mutex<LinkState>>,
    sent: Mutex<Vec<ClientEnvelope>>,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>,
    opener: Mutex<Option<JoinHandle<()>>>,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
}

impl MockTransport {
    pub fn new(behavior: OpenBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            ack_on_start: AtomicBool::new(true),
            state: Arc::new(Mutex::new(LinkState::Closed)),
            sent: Mutex::new(Vec::new()),
            events: Arc::new(Mutex::new(None)),
            opener: Mutex::new(None),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn without_ack(behavior: OpenBehavior) -> Arc<Self> {
        let transport = Self::new(behavior);
        transport.ack_on_start.store(false, Ordering::SeqCst);
        transport
    }

    pub fn sent(&self) -> Vec<ClientEnvelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(ClientEnvelope::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent_kinds().iter().filter(|k| **k == kind).count()
    }

    /// Deliver an inbound event as if it came off the socket
    pub fn inject(&self, event: TransportEvent) {
        let events = self.events.lock().unwrap();
        events
            .as_ref()
            .expect("transport not connected")
            .send(event)
            .expect("driver gone");
    }

    pub fn inject_envelope(&self, envelope: ServerEnvelope) {
        self.inject(TransportEvent::Envelope(envelope));
    }

    /// Simulate the server dropping the connection
    pub fn drop_connection(&self, reason: &str) {
        *self.state.lock().unwrap() = LinkState::Closed;
        self.inject(TransportEvent::Closed(Some(reason.to_string())));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.events.lock().unwrap() = Some(events.clone());

        match &self.behavior {
            OpenBehavior::Immediate => {
                *self.state.lock().unwrap() = LinkState::Open;
                let _ = events.send(TransportEvent::Opened);
            }
            OpenBehavior::After(delay) => {
                *self.state.lock().unwrap() = LinkState::Connecting;
                let state = Arc::clone(&self.state);
                let delay = *delay;
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let mut state = state.lock().unwrap();
                    if *state == LinkState::Connecting {
                        *state = LinkState::Open;
                        let _ = events.send(TransportEvent::Opened);
                    }
                });
                *self.opener.lock().unwrap() = Some(task);
            }
            OpenBehavior::Never => {
                *self.state.lock().unwrap() = LinkState::Connecting;
            }
            OpenBehavior::Fail(reason) => {
                *self.state.lock().unwrap() = LinkState::Failed(reason.clone());
            }
        }
        Ok(())
    }

    fn link_state(&self) -> LinkState {
        self.state.lock().unwrap().clone()
    }

    async fn send(&self, envelope: &ClientEnvelope) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }
        self.sent.lock().unwrap().push(envelope.clone());

        if let ClientEnvelope::Start { session_id, .. } = envelope {
            if self.ack_on_start.load(Ordering::SeqCst) {
                if let Some(events) = self.events.lock().unwrap().as_ref() {
                    let _ = events.send(TransportEvent::Envelope(ServerEnvelope::SessionStarted {
                        session_id: Some(session_id.to_string()),
                    }));
                }
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = LinkState::Closed;
        self.events.lock().unwrap().take();
        if let Some(task) = self.opener.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Microphone stand-in that feeds samples through a real `FrameBuffer`
#[derive(Default)]
pub struct MockCapture {
    frames: Mutex<Option<FrameBuffer>>,
    fail_with: Option<fn() -> Error>,
    /// How long successive `start` calls take to acquire the device
    start_delays: Mutex<VecDeque<Duration>>,
    in_flight: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    /// Most `start` calls ever running at once
    pub max_in_flight: AtomicUsize,
}

impl MockCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A capture whose `start` always fails with `make()`
    pub fn failing(make: fn() -> Error) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(make),
            ..Self::default()
        })
    }

    /// A capture whose n-th `start` takes `delays[n]` to open the device
    pub fn with_start_delays(delays: &[Duration]) -> Arc<Self> {
        Arc::new(Self {
            start_delays: Mutex::new(delays.iter().copied().collect()),
            ..Self::default()
        })
    }

    /// Push normalized samples as if the device produced them
    pub fn emit(&self, samples: &[f32]) {
        let mut frames = self.frames.lock().unwrap();
        frames
            .as_mut()
            .expect("capture not running")
            .push_slice(samples);
    }
}

#[async_trait]
impl AudioSource for MockCapture {
    async fn start(&self, frames: mpsc::UnboundedSender<AudioFrame>) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(make) = self.fail_with {
            return Err(make());
        }

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = self.start_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        *self.frames.lock().unwrap() = Some(FrameBuffer::new(FRAME_SIZE, frames));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.frames.lock().unwrap().take();
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.frames.lock().unwrap().is_some()
    }
}

/// One `play` call: sample count, start, and end (unset if aborted)
pub type PlayRecord = (usize, Instant, Option<Instant>);

/// Speaker stand-in that "plays" for the item's real duration
#[derive(Default)]
pub struct MockSink {
    pub log: Mutex<Vec<PlayRecord>>,
    pub closes: AtomicUsize,
}

impl MockSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn played(&self) -> Vec<PlayRecord> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioSink for MockSink {
    async fn play(&self, item: PlaybackItem) -> Result<()> {
        let idx = {
            let mut log = self.log.lock().unwrap();
            log.push((item.samples.len(), Instant::now(), None));
            log.len() - 1
        };
        tokio::time::sleep(item.duration()).await;
        self.log.lock().unwrap()[idx].2 = Some(Instant::now());
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// An inbound audio envelope of `samples` silent samples at 24 kHz
pub fn audio_envelope(samples: usize) -> ServerEnvelope {
    ServerEnvelope::Audio {
        payload: ChunkPayload::Encoded(codec::encode(&AudioFrame::new(vec![0; samples]), 24000)),
        text: None,
    }
}

/// Poll until the controller reaches `want`
pub async fn wait_for_state(controller: &SessionController, want: SessionState) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while controller.state() != want {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {want}, stuck in {}", controller.state()));
}
