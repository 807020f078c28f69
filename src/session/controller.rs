//! Session orchestration: connect, capture, stream, play, tear down

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::state::{SessionState, SessionStateMachine, Transition};
use super::{SessionEvent, SessionId};
use crate::config::Config;
use crate::error::ErrorKind;
use crate::transport::{
    ClientEnvelope, LinkState, ServerEnvelope, TranscriptRole, Transport, TransportEvent,
    WsTransport,
};
use crate::voice::{
    AudioFrame, AudioSink, AudioSource, MicCapture, PlaybackEvent, PlaybackQueue, SpeakerOutput,
};
use crate::{Error, Result};

/// Capacity of the session event broadcast channel
const EVENT_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resources held for the live session
#[derive(Default)]
struct Active {
    session_id: Option<SessionId>,
    /// Forwards captured frames to the transport
    pump: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    /// Consumes transport events for the current connection
    driver: Option<JoinHandle<()>>,
}

struct Inner {
    config: Config,
    transport: Arc<dyn Transport>,
    capture: Arc<dyn AudioSource>,
    queue: PlaybackQueue,
    machine: Mutex<SessionStateMachine>,
    events: broadcast::Sender<SessionEvent>,
    active: Mutex<Active>,
    /// Held for the duration of a teardown; `start` waits on it
    teardown_lock: tokio::sync::Mutex<()>,
}

/// Top-level voice session orchestrator
///
/// Owns the microphone, the socket, and the output device for the lifetime of
/// one session. `start`, `stop`, and `toggle` may be called from any task at
/// any time.
pub struct SessionController {
    inner: Arc<Inner>,
    monitor: JoinHandle<()>,
}

impl SessionController {
    /// Create a controller over the given collaborators
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        capture: Arc<dyn AudioSource>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            config,
            transport,
            capture,
            queue: PlaybackQueue::new(sink, playback_tx),
            machine: Mutex::new(SessionStateMachine::new()),
            events,
            active: Mutex::new(Active::default()),
            teardown_lock: tokio::sync::Mutex::new(()),
        });

        let monitor = tokio::spawn(monitor_playback(Arc::downgrade(&inner), playback_rx));

        Self { inner, monitor }
    }

    /// Create a controller using the WebSocket transport and the default
    /// audio devices
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        let transport = Arc::new(WsTransport::new(
            config.endpoint.clone(),
            config.profile.clone(),
            config.playback.default_sample_rate,
        ));
        let capture = Arc::new(MicCapture::new(config.capture.clone()));
        let sink = Arc::new(SpeakerOutput::new());
        Self::new(config, transport, capture, sink)
    }

    /// Start a session
    ///
    /// A no-op while a session is connecting or live, and while an earlier
    /// attempt is still acquiring the microphone; concurrent calls collapse
    /// to a single session. A `stop` issued while this is pending cancels it
    /// and this returns `Ok(())`. Resolves once the session is acknowledged.
    ///
    /// # Errors
    ///
    /// Returns the classified failure after moving the session to `error`
    pub async fn start(&self) -> Result<()> {
        let epoch = {
            let mut machine = lock(&self.inner.machine);
            if !machine.can_start() {
                tracing::debug!(
                    state = %machine.state(),
                    starting = machine.is_starting(),
                    "start ignored, session already active"
                );
                return Ok(());
            }
            if let Some(state) = machine.apply(Transition::StartRequested) {
                let _ = self.inner.events.send(SessionEvent::StateChanged(state));
            }
            machine.epoch()
        };

        let deadline = Instant::now() + self.inner.config.timing.connect_timeout;
        tracing::info!(endpoint = %self.inner.config.endpoint, epoch, "starting session");

        {
            let _starting = StartGuard(&self.inner);
            if let Err(e) = self.inner.establish(epoch, deadline).await {
                return Err(self.inner.settle_failure(epoch, e).await);
            }
        }

        if let Err(e) = self.inner.await_ack(epoch, deadline).await {
            return Err(self.inner.settle_failure(epoch, e).await);
        }
        Ok(())
    }

    /// Stop the session from any state and release every resource
    ///
    /// `idle` is reported only after every resource has been released.
    pub async fn stop(&self) {
        // In-flight starts must not pick anything up while we release
        lock(&self.inner.machine).supersede();

        let session_id = lock(&self.inner.active).session_id.clone();
        if let Some(session_id) = session_id {
            if self.inner.transport.is_open() {
                let stop = ClientEnvelope::Stop {
                    session_id: session_id.clone(),
                };
                if let Err(e) = self.inner.transport.send(&stop).await {
                    tracing::debug!(error = %e, "stop envelope not sent");
                }
            }
            tracing::info!(session_id = %session_id, "stopping session");
        }

        self.inner.teardown(Some(Transition::Stopped)).await;
    }

    /// Start when resting, stop otherwise
    ///
    /// # Errors
    ///
    /// Returns error if starting fails
    pub async fn toggle(&self) -> Result<()> {
        if self.state().is_rest() {
            self.start().await
        } else {
            self.stop().await;
            Ok(())
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        lock(&self.inner.machine).state()
    }

    /// Id of the live session, if any
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        lock(&self.inner.active).session_id.clone()
    }

    /// Receive state changes, transcripts, and failures
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn playback_queue(&self) -> &PlaybackQueue {
        &self.inner.queue
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.monitor.abort();

        let inner = &self.inner;
        if let Err(e) = inner.capture.stop() {
            tracing::warn!(error = %e, "capture stop failed during drop");
        }
        {
            let mut active = lock(&inner.active);
            active.session_id = None;
            for task in [active.pump.take(), active.keepalive.take(), active.driver.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
        }
        inner.queue.close_output();
        inner.queue.clear();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&inner.transport);
            handle.spawn(async move { transport.close().await });
        }
    }
}

/// Holds the start-in-progress flag until dropped
struct StartGuard<'a>(&'a Inner);

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        lock(&self.0.machine).settle_start();
    }
}

impl Inner {
    /// Apply a transition and broadcast the new state
    fn transition(&self, transition: Transition) -> Option<SessionState> {
        let mut machine = lock(&self.machine);
        let changed = machine.apply(transition);
        if let Some(state) = changed {
            tracing::info!(state = %state, "session state");
            let _ = self.events.send(SessionEvent::StateChanged(state));
        }
        changed
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Whether the start attempt `epoch` is still the live one
    fn is_current(&self, epoch: u64) -> bool {
        let machine = lock(&self.machine);
        machine.epoch() == epoch && machine.state().is_active()
    }

    async fn establish(self: &Arc<Self>, epoch: u64, deadline: Instant) -> Result<()> {
        // A previous teardown may still be closing the socket
        drop(self.teardown_lock.lock().await);
        if !self.is_current(epoch) {
            return self.abandon().await;
        }

        if !matches!(
            self.transport.link_state(),
            LinkState::Open | LinkState::Connecting
        ) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.transport.connect(tx).await?;
            let driver = tokio::spawn(drive(Arc::downgrade(self), rx));
            if let Some(previous) = lock(&self.active).driver.replace(driver) {
                previous.abort();
            }
        }

        self.wait_open(epoch, deadline).await?;
        if !self.is_current(epoch) {
            return self.abandon().await;
        }

        let keepalive = tokio::spawn(keepalive(
            Arc::clone(&self.transport),
            self.config.timing.keepalive,
        ));

        let session_id = SessionId::new();
        {
            let machine = lock(&self.machine);
            if !(machine.epoch() == epoch && machine.state().is_active()) {
                drop(machine);
                keepalive.abort();
                return self.abandon().await;
            }
            let mut active = lock(&self.active);
            active.session_id = Some(session_id.clone());
            if let Some(previous) = active.keepalive.replace(keepalive) {
                previous.abort();
            }
        }

        self.transport
            .send(&ClientEnvelope::Start {
                session_id: session_id.clone(),
                agent_id: self.config.agent_id.clone(),
            })
            .await?;
        tracing::info!(session_id = %session_id, agent_id = %self.config.agent_id, "session requested");

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        self.capture.start(frames_tx).await?;

        let pump = tokio::spawn(pump_frames(
            Arc::clone(&self.transport),
            session_id,
            self.config.capture.sample_rate,
            frames_rx,
        ));
        {
            let machine = lock(&self.machine);
            if !(machine.epoch() == epoch && machine.state().is_active()) {
                // Stopped while the device was opening
                drop(machine);
                pump.abort();
                return self.abandon().await;
            }
            if let Some(previous) = lock(&self.active).pump.replace(pump) {
                previous.abort();
            }
        }

        if !self.config.profile.await_session_ack {
            self.transition(Transition::SessionAcked);
        }
        Ok(())
    }

    /// Release whatever a superseded attempt acquired
    ///
    /// No other attempt can be running while the start guard is held, so
    /// everything still registered belongs to this one.
    async fn abandon(self: &Arc<Self>) -> Result<()> {
        tracing::debug!("start superseded, releasing");
        self.teardown(None).await;
        Ok(())
    }

    /// Report a failed start unless a stop or newer attempt took over
    async fn settle_failure(self: &Arc<Self>, epoch: u64, error: Error) -> Error {
        if self.is_current(epoch) {
            self.fail(&error).await;
        } else {
            tracing::debug!(error = %error, "superseded start failed");
        }
        error
    }

    /// Poll the link until open, failed, superseded, or the deadline passes
    async fn wait_open(&self, epoch: u64, deadline: Instant) -> Result<()> {
        let timing = &self.config.timing;

        loop {
            if !self.is_current(epoch) {
                return Ok(());
            }
            match self.transport.link_state() {
                LinkState::Open => return Ok(()),
                LinkState::Failed(reason) => return Err(Error::ConnectFailed(reason)),
                LinkState::Closed | LinkState::Connecting => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::ConnectTimeout(timing.connect_timeout));
            }
            tokio::time::sleep(timing.connect_poll).await;
        }
    }

    /// Wait for `session_started` within what is left of the connect budget
    async fn await_ack(&self, epoch: u64, deadline: Instant) -> Result<()> {
        let timing = &self.config.timing;

        loop {
            {
                let machine = lock(&self.machine);
                if machine.epoch() != epoch || machine.state() != SessionState::Connecting {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                tracing::warn!("session not acknowledged in time");
                return Err(Error::ConnectTimeout(timing.connect_timeout));
            }
            tokio::time::sleep(timing.connect_poll).await;
        }
    }

    /// Move to `error`, report, and release everything
    async fn fail(self: &Arc<Self>, error: &Error) {
        tracing::error!(kind = %error.kind(), error = %error, "session failed");

        let session_id = lock(&self.active).session_id.clone();
        if let Some(session_id) = session_id {
            if self.transport.is_open() {
                if let Err(e) = self.transport.send(&ClientEnvelope::Stop { session_id }).await {
                    tracing::debug!(error = %e, "stop envelope not sent");
                }
            }
        }

        {
            let mut machine = lock(&self.machine);
            let transition = match error.kind() {
                ErrorKind::ConnectTimeout | ErrorKind::ConnectFailed
                    if machine.state() == SessionState::Connecting =>
                {
                    Transition::ConnectFailed
                }
                _ => Transition::Failed,
            };
            if let Some(state) = machine.apply(transition) {
                let _ = self.events.send(SessionEvent::StateChanged(state));
            }
            let _ = self.events.send(SessionEvent::failed(error));
        }

        self.teardown(None).await;
    }

    /// Release session resources in a fixed order, then apply `then`
    ///
    /// Runs on its own task so dropping the caller cannot cut it short.
    async fn teardown(self: &Arc<Self>, then: Option<Transition>) {
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            inner.release().await;
            if let Some(transition) = then {
                inner.transition(transition);
            }
        });
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "teardown task failed");
        }
    }

    async fn release(&self) {
        let _guard = self.teardown_lock.lock().await;

        let (session_id, pump, keepalive, driver) = {
            let mut active = lock(&self.active);
            (
                active.session_id.take(),
                active.pump.take(),
                active.keepalive.take(),
                active.driver.take(),
            )
        };

        if let Err(e) = self.capture.stop() {
            tracing::warn!(error = %e, "capture stop failed");
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        self.queue.close_output();
        let dropped = self.queue.clear();
        self.transport.close().await;
        if let Some(keepalive) = keepalive {
            keepalive.abort();
        }
        if let Some(driver) = driver {
            driver.abort();
        }

        tracing::debug!(
            session_id = session_id.as_ref().map_or("-", SessionId::as_str),
            dropped,
            "session resources released"
        );
    }

    /// Handle one transport event; returns false once the connection is done
    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Opened => {
                tracing::debug!("transport open");
                true
            }
            TransportEvent::Envelope(envelope) => self.on_envelope(envelope).await,
            TransportEvent::Malformed(reason) => {
                if self.is_live() {
                    self.fail(&Error::Protocol(reason)).await;
                    return false;
                }
                tracing::warn!(reason = %reason, "malformed envelope outside a session");
                true
            }
            TransportEvent::Closed(reason) => {
                if self.is_live() {
                    let reason = reason.unwrap_or_else(|| "connection closed".to_string());
                    self.fail(&Error::ConnectFailed(reason)).await;
                }
                false
            }
        }
    }

    async fn on_envelope(self: &Arc<Self>, envelope: ServerEnvelope) -> bool {
        match envelope {
            ServerEnvelope::SessionStarted { session_id } => {
                let ours = lock(&self.active).session_id.clone();
                if let (Some(theirs), Some(ours)) = (&session_id, &ours) {
                    if theirs != ours.as_str() {
                        tracing::debug!(ours = %ours, theirs = %theirs, "server assigned its own session id");
                    }
                }
                self.transition(Transition::SessionAcked);
            }
            ServerEnvelope::Audio { payload, text } => {
                if !matches!(
                    self.current_state(),
                    SessionState::Listening | SessionState::Processing | SessionState::Speaking
                ) {
                    tracing::debug!(state = %self.current_state(), "audio outside a live session ignored");
                    return true;
                }
                self.transition(Transition::ResponseAudio);
                let seq = self.queue.enqueue(payload);
                tracing::trace!(seq, "response chunk queued");
                if let Some(text) = text {
                    self.emit(SessionEvent::ResponseText(text));
                }
            }
            ServerEnvelope::Transcript { role, text } => {
                if role == TranscriptRole::Input {
                    self.transition(Transition::InputReceived);
                }
                self.emit(SessionEvent::Transcript { role, text });
            }
            ServerEnvelope::Error { message } => {
                self.fail(&Error::Server(message)).await;
                return false;
            }
            ServerEnvelope::SessionStopped => {
                tracing::info!("session stopped by server");
                if self.current_state() != SessionState::Error {
                    self.transition(Transition::Stopped);
                }
                self.teardown(None).await;
                return false;
            }
            ServerEnvelope::Pong => {
                tracing::trace!("pong");
                self.emit(SessionEvent::Pong);
            }
            ServerEnvelope::Unknown { kind } => {
                tracing::debug!(kind = %kind, "ignoring unknown envelope type");
            }
        }
        true
    }

    fn current_state(&self) -> SessionState {
        lock(&self.machine).state()
    }

    fn is_live(&self) -> bool {
        self.current_state().is_active()
    }
}

/// Consume events for one connection
async fn drive(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.on_transport_event(event).await {
            break;
        }
    }
    tracing::trace!("transport driver finished");
}

/// Follow playback progress for the controller's lifetime
async fn monitor_playback(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<PlaybackEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            PlaybackEvent::Started { seq } => tracing::trace!(seq, "chunk playing"),
            PlaybackEvent::Finished { seq } => tracing::trace!(seq, "chunk finished"),
            PlaybackEvent::Failed { seq, error } => {
                tracing::warn!(seq, error = %error, "chunk skipped");
                inner.emit(SessionEvent::PlaybackError(error));
            }
            PlaybackEvent::Drained => {
                // A chunk enqueued after the drain report restarts playback
                if inner.queue.is_playing() || !inner.queue.is_empty() {
                    continue;
                }
                let link_open = inner.transport.is_open();
                if inner.transition(Transition::PlaybackDrained { link_open })
                    == Some(SessionState::Idle)
                {
                    inner.teardown(None).await;
                }
            }
        }
    }
}

/// Send a `ping` every `every` while the link is open
async fn keepalive(transport: Arc<dyn Transport>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !transport.is_open() {
            continue;
        }
        if let Err(e) = transport.send(&ClientEnvelope::Ping).await {
            tracing::debug!(error = %e, "keepalive ping failed");
        } else {
            tracing::trace!("keepalive ping");
        }
    }
}

/// Forward captured frames as `audio` envelopes, in capture order
async fn pump_frames(
    transport: Arc<dyn Transport>,
    session_id: SessionId,
    sample_rate: u32,
    mut frames: mpsc::UnboundedReceiver<AudioFrame>,
) {
    let mut sent: u64 = 0;
    while let Some(frame) = frames.recv().await {
        let envelope = ClientEnvelope::Audio {
            session_id: session_id.clone(),
            frame,
            sample_rate,
        };
        match transport.send(&envelope).await {
            Ok(()) => sent += 1,
            Err(Error::NotConnected) => tracing::trace!("frame dropped, link not open"),
            Err(e) => tracing::warn!(error = %e, "frame send failed"),
        }
    }
    tracing::debug!(session_id = %session_id, sent, "frame pump finished");
}
