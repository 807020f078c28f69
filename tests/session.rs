//! Session controller integration tests
//!
//! Drive full sessions against in-memory transport, capture, and sink.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

use voxlink::transport::{ClientEnvelope, ServerEnvelope, TranscriptRole, TransportEvent};
use voxlink::voice::{AudioSource, ChunkPayload, EncodedChunk};
use voxlink::{
    Config, Error, ErrorKind, SessionController, SessionEvent, SessionState, Transport,
};

mod common;

use common::{MockCapture, MockSink, MockTransport, OpenBehavior, audio_envelope, wait_for_state};

struct Harness {
    controller: SessionController,
    transport: Arc<MockTransport>,
    capture: Arc<MockCapture>,
    sink: Arc<MockSink>,
    events: broadcast::Receiver<SessionEvent>,
}

fn harness_with(config: Config, transport: Arc<MockTransport>, capture: Arc<MockCapture>) -> Harness {
    let sink = MockSink::new();
    let controller =
        SessionController::new(config, transport.clone(), capture.clone(), sink.clone());
    let events = controller.subscribe();
    Harness {
        controller,
        transport,
        capture,
        sink,
        events,
    }
}

fn harness(behavior: OpenBehavior) -> Harness {
    harness_with(Config::default(), MockTransport::new(behavior), MockCapture::new())
}

async fn listening(behavior: OpenBehavior) -> Harness {
    let h = harness(behavior);
    assert_ok!(h.controller.start().await);
    wait_for_state(&h.controller, SessionState::Listening).await;
    h
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn states(events: &[SessionEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged(s) => Some(*s),
            _ => None,
        })
        .collect()
}

fn failure_kind(events: &[SessionEvent]) -> Option<ErrorKind> {
    events.iter().find_map(|e| match e {
        SessionEvent::Failed { kind, .. } => Some(*kind),
        _ => None,
    })
}

fn assert_released(h: &Harness) {
    assert!(!h.capture.is_capturing(), "capture still running");
    assert!(!h.transport.is_open(), "socket still open");
    assert!(h.controller.playback_queue().is_empty());
    assert!(!h.controller.playback_queue().is_playing());
    assert!(h.controller.session_id().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_start_reaches_listening_after_ack() {
    let mut h = listening(OpenBehavior::Immediate).await;

    assert_eq!(h.transport.sent_kinds(), vec!["start"]);
    let ClientEnvelope::Start { session_id, agent_id } = &h.transport.sent()[0] else {
        panic!("expected start envelope");
    };
    assert_eq!(agent_id, "default");
    assert_eq!(Some(session_id.clone()), h.controller.session_id());
    assert_eq!(h.capture.starts.load(Ordering::SeqCst), 1);

    assert_eq!(
        states(&drain(&mut h.events)),
        vec![SessionState::Connecting, SessionState::Listening]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_starts_collapse_to_one_session() {
    let h = harness(OpenBehavior::After(Duration::from_millis(250)));

    let (a, b) = tokio::join!(h.controller.start(), h.controller.start());
    assert!(a.is_ok());
    assert!(b.is_ok());
    wait_for_state(&h.controller, SessionState::Listening).await;

    assert_eq!(h.transport.count("start"), 1);
    assert_eq!(h.transport.connects.load(Ordering::SeqCst), 1);
    assert_eq!(h.capture.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_live_is_noop() {
    let h = listening(OpenBehavior::Immediate).await;
    let id = h.controller.session_id();

    assert_ok!(h.controller.start().await);

    assert_eq!(h.transport.count("start"), 1);
    assert_eq!(h.controller.session_id(), id);
    assert_eq!(h.controller.state(), SessionState::Listening);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_moves_to_error() {
    let mut h = harness(OpenBehavior::Never);

    let started = Instant::now();
    let err = h.controller.start().await.unwrap_err();
    let waited = started.elapsed();

    assert_eq!(err.kind(), ErrorKind::ConnectTimeout);
    assert!(waited >= Duration::from_millis(5000));
    assert!(waited < Duration::from_millis(5200));
    assert_eq!(h.controller.state(), SessionState::Error);
    assert!(h.transport.sent().is_empty(), "nothing may be sent");
    assert_eq!(h.capture.starts.load(Ordering::SeqCst), 0);

    let events = drain(&mut h.events);
    assert_eq!(states(&events), vec![SessionState::Connecting, SessionState::Error]);
    assert_eq!(failure_kind(&events), Some(ErrorKind::ConnectTimeout));
}

#[tokio::test(start_paused = true)]
async fn test_missing_session_ack_times_out() {
    let mut h = harness_with(
        Config::default(),
        MockTransport::without_ack(OpenBehavior::Immediate),
        MockCapture::new(),
    );

    let started = Instant::now();
    let err = h.controller.start().await.unwrap_err();
    let waited = started.elapsed();

    assert_eq!(err.kind(), ErrorKind::ConnectTimeout);
    assert!(waited >= Duration::from_millis(5000));
    assert!(waited < Duration::from_millis(5200));
    assert_eq!(h.controller.state(), SessionState::Error);
    assert_eq!(h.transport.sent_kinds(), vec!["start", "stop"]);
    assert_released(&h);

    let events = drain(&mut h.events);
    assert_eq!(states(&events), vec![SessionState::Connecting, SessionState::Error]);
    assert_eq!(failure_kind(&events), Some(ErrorKind::ConnectTimeout));

    // Nothing lingers past the failure
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.controller.state(), SessionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_is_classified() {
    let h = harness(OpenBehavior::Fail("connection refused".to_string()));

    let err = h.controller.start().await.unwrap_err();
    assert!(matches!(err, Error::ConnectFailed(ref reason) if reason == "connection refused"));
    assert_eq!(h.controller.state(), SessionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_restart_from_error() {
    let transport = MockTransport::new(OpenBehavior::Immediate);
    let capture = MockCapture::failing(|| Error::DeviceNotFound);
    let h = harness_with(Config::default(), transport, capture);

    assert_err!(h.controller.start().await);
    assert_eq!(h.controller.state(), SessionState::Error);

    // error is a rest state; a new start makes a new attempt
    assert_err!(h.controller.start().await);
    assert_eq!(h.transport.count("start"), 2);
    assert_eq!(h.transport.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_permission_denied_sends_stop_and_errors() {
    let transport = MockTransport::new(OpenBehavior::Immediate);
    let capture = MockCapture::failing(|| Error::PermissionDenied("not allowed".to_string()));
    let mut h = harness_with(Config::default(), transport, capture);

    let err = h.controller.start().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(h.controller.state(), SessionState::Error);
    assert_eq!(h.transport.sent_kinds(), vec!["start", "stop"]);

    let events = drain(&mut h.events);
    assert_eq!(states(&events).last(), Some(&SessionState::Error));
    let message = events
        .iter()
        .find_map(|e| match e {
            SessionEvent::Failed { message, .. } => Some(message.clone()),
            _ => None,
        })
        .unwrap();
    assert!(message.contains("Microphone permission denied"));
    assert_released(&h);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_connecting() {
    let h = harness(OpenBehavior::Never);

    let (started, ()) = tokio::join!(h.controller.start(), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.controller.state(), SessionState::Connecting);
        h.controller.stop().await;
    });

    assert!(started.is_ok(), "cancelled start is not an error");
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.capture.starts.load(Ordering::SeqCst), 0);
    assert!(h.transport.closes.load(Ordering::SeqCst) >= 1);
    assert_released(&h);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_slow_capture_open() {
    let capture =
        MockCapture::with_start_delays(&[Duration::from_millis(1000), Duration::from_millis(100)]);
    let h = harness_with(
        Config::default(),
        MockTransport::new(OpenBehavior::Immediate),
        capture,
    );

    let (first, ()) = tokio::join!(h.controller.start(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.controller.stop().await;
        assert_eq!(h.controller.state(), SessionState::Idle);

        // The first attempt is still opening the device
        assert_ok!(h.controller.start().await);
        assert_eq!(h.capture.starts.load(Ordering::SeqCst), 1);
    });

    assert_ok!(first);
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_released(&h);

    assert_ok!(h.controller.start().await);
    assert_eq!(h.controller.state(), SessionState::Listening);
    assert!(h.capture.is_capturing());
    assert_eq!(h.capture.starts.load(Ordering::SeqCst), 2);
    assert_eq!(h.capture.max_in_flight.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(h.capture.is_capturing(), "earlier attempt must not release the device");
    assert_eq!(h.controller.state(), SessionState::Listening);
}

#[tokio::test(start_paused = true)]
async fn test_idle_reported_after_release() {
    let h = listening(OpenBehavior::Immediate).await;

    let capture = h.capture.clone();
    let transport = h.transport.clone();
    let mut events = h.controller.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged(SessionState::Idle)) => {
                    return (capture.is_capturing(), transport.is_open());
                }
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    });

    h.controller.stop().await;

    let (capturing, open) = watcher.await.unwrap();
    assert!(!capturing, "idle reported while the microphone was held");
    assert!(!open, "idle reported while the socket was open");
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_listening() {
    let h = listening(OpenBehavior::Immediate).await;
    let id = h.controller.session_id().unwrap();

    h.controller.stop().await;

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.transport.sent().last(), Some(&ClientEnvelope::Stop { session_id: id }));
    assert_eq!(h.capture.stops.load(Ordering::SeqCst), 1);
    assert_released(&h);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_speaking_aborts_playback() {
    let h = listening(OpenBehavior::Immediate).await;

    // Three one-second chunks
    for _ in 0..3 {
        h.transport.inject_envelope(audio_envelope(24000));
    }
    wait_for_state(&h.controller, SessionState::Speaking).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    h.controller.stop().await;

    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_released(&h);
    assert!(h.sink.closes.load(Ordering::SeqCst) >= 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let played = h.sink.played();
    assert_eq!(played.len(), 1, "queued chunks must be discarded");
    assert!(played[0].2.is_none(), "sounding chunk must be cut off");
    assert_eq!(h.controller.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_response_chunks_play_in_order() {
    let mut h = listening(OpenBehavior::Immediate).await;
    drain(&mut h.events);

    h.transport.inject_envelope(audio_envelope(2400));
    h.transport.inject_envelope(audio_envelope(4800));
    h.transport.inject_envelope(audio_envelope(1200));

    wait_for_state(&h.controller, SessionState::Speaking).await;
    wait_for_state(&h.controller, SessionState::Listening).await;

    let played = h.sink.played();
    assert_eq!(
        played.iter().map(|(n, _, _)| *n).collect::<Vec<_>>(),
        vec![2400, 4800, 1200]
    );
    for pair in played.windows(2) {
        let previous_end = pair[0].2.expect("chunk finished");
        assert!(pair[1].1 >= previous_end, "chunks overlapped");
    }

    assert_eq!(
        states(&drain(&mut h.events)),
        vec![SessionState::Speaking, SessionState::Listening]
    );
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_chunk_does_not_end_session() {
    let mut h = listening(OpenBehavior::Immediate).await;

    h.transport.inject_envelope(ServerEnvelope::Audio {
        payload: ChunkPayload::Encoded(EncodedChunk {
            data: "%%%".to_string(),
            sample_rate: 24000,
        }),
        text: None,
    });
    h.transport.inject_envelope(audio_envelope(2400));

    wait_for_state(&h.controller, SessionState::Speaking).await;
    wait_for_state(&h.controller, SessionState::Listening).await;

    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(e, SessionEvent::PlaybackError(_))));
    assert_eq!(failure_kind(&events), None);
    assert_eq!(h.sink.played().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_input_transcript_moves_to_processing() {
    let mut h = listening(OpenBehavior::Immediate).await;
    drain(&mut h.events);

    h.transport.inject_envelope(ServerEnvelope::Transcript {
        role: TranscriptRole::Input,
        text: "what's the weather".to_string(),
    });
    wait_for_state(&h.controller, SessionState::Processing).await;

    h.transport.inject_envelope(ServerEnvelope::Audio {
        payload: ChunkPayload::Raw {
            bytes: vec![0; 4800],
            sample_rate: 24000,
        },
        text: Some("Sunny all day".to_string()),
    });
    wait_for_state(&h.controller, SessionState::Speaking).await;
    wait_for_state(&h.controller, SessionState::Listening).await;

    let events = drain(&mut h.events);
    assert!(events.contains(&SessionEvent::Transcript {
        role: TranscriptRole::Input,
        text: "what's the weather".to_string(),
    }));
    assert!(events.contains(&SessionEvent::ResponseText("Sunny all day".to_string())));
    assert_eq!(
        states(&events),
        vec![
            SessionState::Processing,
            SessionState::Speaking,
            SessionState::Listening
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_captured_frames_are_streamed() {
    let h = listening(OpenBehavior::Immediate).await;
    let id = h.controller.session_id().unwrap();

    let mut samples = vec![0.0_f32; 4096 + 100];
    samples[0] = 0.5;
    h.capture.emit(&samples);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let audio: Vec<_> = h
        .transport
        .sent()
        .into_iter()
        .filter_map(|e| match e {
            ClientEnvelope::Audio {
                session_id,
                frame,
                sample_rate,
            } => Some((session_id, frame, sample_rate)),
            _ => None,
        })
        .collect();

    assert_eq!(audio.len(), 2, "only full frames are sent");
    for (session_id, frame, rate) in &audio {
        assert_eq!(session_id, &id);
        assert_eq!(frame.len(), 2048);
        assert_eq!(*rate, 16000);
    }
    assert_eq!(audio[0].1.samples()[0], 16383);
    assert!(audio[1].1.samples().iter().all(|&s| s == 0));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_pings_every_thirty_seconds() {
    let h = listening(OpenBehavior::Immediate).await;
    assert_eq!(h.transport.count("ping"), 0);

    tokio::time::sleep(Duration::from_millis(29_900)).await;
    assert_eq!(h.transport.count("ping"), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.transport.count("ping"), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.count("ping"), 2);

    // pong is informational only
    h.transport.inject_envelope(ServerEnvelope::Pong);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.controller.state(), SessionState::Listening);
}

#[tokio::test(start_paused = true)]
async fn test_server_error_moves_to_error() {
    let mut h = listening(OpenBehavior::Immediate).await;

    h.transport.inject_envelope(ServerEnvelope::Error {
        message: "agent unavailable".to_string(),
    });
    wait_for_state(&h.controller, SessionState::Error).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(failure_kind(&drain(&mut h.events)), Some(ErrorKind::ServerError));
    assert_released(&h);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_envelope_is_protocol_error() {
    let mut h = listening(OpenBehavior::Immediate).await;

    h.transport
        .inject(TransportEvent::Malformed("invalid JSON envelope".to_string()));
    wait_for_state(&h.controller, SessionState::Error).await;

    assert_eq!(failure_kind(&drain(&mut h.events)), Some(ErrorKind::ProtocolError));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_envelope_is_ignored() {
    let h = listening(OpenBehavior::Immediate).await;

    h.transport.inject_envelope(ServerEnvelope::Unknown {
        kind: "typing_indicator".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.controller.state(), SessionState::Listening);
}

#[tokio::test(start_paused = true)]
async fn test_server_close_while_live_is_connect_failure() {
    let mut h = listening(OpenBehavior::Immediate).await;

    h.transport.drop_connection("going away");
    wait_for_state(&h.controller, SessionState::Error).await;

    let events = drain(&mut h.events);
    assert_eq!(failure_kind(&events), Some(ErrorKind::ConnectFailed));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Failed { message, .. } if message.contains("going away")
    )));
}

#[tokio::test(start_paused = true)]
async fn test_session_stopped_returns_to_idle() {
    let h = listening(OpenBehavior::Immediate).await;

    h.transport.inject_envelope(ServerEnvelope::SessionStopped);
    wait_for_state(&h.controller, SessionState::Idle).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_released(&h);
    assert_eq!(h.transport.count("stop"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_toggle_starts_and_stops() {
    let h = harness(OpenBehavior::Immediate);

    h.controller.toggle().await.unwrap();
    wait_for_state(&h.controller, SessionState::Listening).await;

    h.controller.toggle().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Idle);
    assert_eq!(h.transport.sent_kinds(), vec!["start", "stop"]);
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_profile_listens_after_capture() {
    let mut config = Config::default();
    config.profile.await_session_ack = false;
    let h = harness_with(
        config,
        MockTransport::without_ack(OpenBehavior::Immediate),
        MockCapture::new(),
    );

    h.controller.start().await.unwrap();

    assert_eq!(h.controller.state(), SessionState::Listening);
    assert!(h.capture.is_capturing());
}

#[tokio::test(start_paused = true)]
async fn test_new_session_gets_new_id() {
    let h = listening(OpenBehavior::Immediate).await;
    let first = h.controller.session_id().unwrap();
    h.controller.stop().await;

    h.controller.start().await.unwrap();
    wait_for_state(&h.controller, SessionState::Listening).await;
    let second = h.controller.session_id().unwrap();

    assert_ne!(first, second);
}
