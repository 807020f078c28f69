//! Ordered, non-overlapping playback of inbound audio

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::AudioSink;
use super::codec::{self, EncodedChunk, PlaybackItem};
use crate::Error;

/// Inbound audio as it arrived on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    /// Base64 PCM16LE from a JSON envelope
    Encoded(EncodedChunk),
    /// Raw PCM16LE from a binary frame
    Raw { bytes: Vec<u8>, sample_rate: u32 },
}

impl ChunkPayload {
    fn decode(&self) -> crate::Result<PlaybackItem> {
        match self {
            Self::Encoded(chunk) => codec::decode(chunk, chunk.sample_rate),
            Self::Raw { bytes, sample_rate } => codec::decode_raw(bytes, *sample_rate),
        }
    }
}

/// Progress reported by the playback loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started { seq: u64 },
    Finished { seq: u64 },
    /// A chunk failed to decode or play; the loop moved on
    Failed { seq: u64, error: String },
    /// The loop found the queue empty and exited
    Drained,
}

enum LoopState {
    Idle,
    Running(JoinHandle<()>),
}

struct QueueInner {
    pending: VecDeque<(u64, ChunkPayload)>,
    loop_state: LoopState,
    next_seq: u64,
    /// Bumped by `clear`; a loop from an older generation touches nothing
    generation: u64,
}

struct Shared {
    sink: Arc<dyn AudioSink>,
    inner: Mutex<QueueInner>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO of inbound chunks played one at a time
///
/// At most one playback loop runs; it owns the head item until the sink
/// reports completion, then fetches the next. The loop exits once it finds
/// the queue empty, and the next `enqueue` starts a fresh one.
#[derive(Clone)]
pub struct PlaybackQueue {
    shared: Arc<Shared>,
}

impl PlaybackQueue {
    /// Create a queue playing through `sink` and reporting on `events`
    #[must_use]
    pub fn new(sink: Arc<dyn AudioSink>, events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink,
                inner: Mutex::new(QueueInner {
                    pending: VecDeque::new(),
                    loop_state: LoopState::Idle,
                    next_seq: 0,
                    generation: 0,
                }),
                events,
            }),
        }
    }

    /// Append a chunk, starting the playback loop if none is running
    ///
    /// Must be called within a Tokio runtime. Returns the chunk's sequence
    /// number.
    pub fn enqueue(&self, payload: ChunkPayload) -> u64 {
        let mut inner = self.shared.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.pending.push_back((seq, payload));

        if matches!(inner.loop_state, LoopState::Idle) {
            let shared = Arc::clone(&self.shared);
            let generation = inner.generation;
            // The loop cannot pop before this lock is released
            inner.loop_state = LoopState::Running(tokio::spawn(run_loop(shared, generation)));
            tracing::trace!(seq, "playback loop started");
        }

        seq
    }

    /// Discard every queued chunk and abort the sounding one
    ///
    /// Returns the number of chunks dropped, including the one in flight.
    pub fn clear(&self) -> usize {
        let mut inner = self.shared.lock();
        let mut dropped = inner.pending.len();
        inner.pending.clear();
        // An aborted loop may still be mid-poll on another worker
        inner.generation += 1;

        if let LoopState::Running(handle) = std::mem::replace(&mut inner.loop_state, LoopState::Idle) {
            handle.abort();
            dropped += 1;
        }
        drop(inner);

        if dropped > 0 {
            tracing::debug!(dropped, "playback queue cleared");
        }
        dropped
    }

    /// Chunks waiting behind the one playing
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a playback loop is running
    #[must_use]
    pub fn is_playing(&self) -> bool {
        matches!(self.shared.lock().loop_state, LoopState::Running(_))
    }

    /// Release output device contexts held by the sink
    pub fn close_output(&self) {
        self.shared.sink.close();
    }
}

async fn run_loop(shared: Arc<Shared>, generation: u64) {
    loop {
        let next = {
            let mut inner = shared.lock();
            if inner.generation != generation {
                tracing::trace!(generation, "stale playback loop exiting");
                return;
            }
            let next = inner.pending.pop_front();
            if next.is_none() {
                inner.loop_state = LoopState::Idle;
                // Reported under the lock so it precedes any loop a later
                // enqueue starts
                let _ = shared.events.send(PlaybackEvent::Drained);
            }
            next
        };

        let Some((seq, payload)) = next else {
            break;
        };

        let item = match payload.decode() {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(seq, error = %e, "dropping undecodable chunk");
                let _ = shared.events.send(PlaybackEvent::Failed {
                    seq,
                    error: e.to_string(),
                });
                continue;
            }
        };

        let _ = shared.events.send(PlaybackEvent::Started { seq });
        let played = shared.sink.play(item).await;
        if shared.lock().generation != generation {
            return;
        }
        match played {
            Ok(()) => {
                let _ = shared.events.send(PlaybackEvent::Finished { seq });
            }
            Err(e) => {
                let e = match e {
                    Error::PlaybackDecode(_) => e,
                    other => Error::PlaybackDecode(other.to_string()),
                };
                tracing::warn!(seq, error = %e, "chunk playback failed");
                let _ = shared.events.send(PlaybackEvent::Failed {
                    seq,
                    error: e.to_string(),
                });
            }
        }
    }

    tracing::trace!("playback loop drained");
}
