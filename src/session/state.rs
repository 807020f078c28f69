//! Session state and its legal transitions

use std::fmt;

/// Authoritative pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Listening,
    Processing,
    Speaking,
    Error,
}

impl SessionState {
    /// `idle` and `error` are the only states a session can rest in
    #[must_use]
    pub const fn is_rest(self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }

    /// Whether a session is live (connecting through speaking)
    #[must_use]
    pub const fn is_active(self) -> bool {
        !self.is_rest()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// User asked for a session
    StartRequested,
    /// Transport open and the session acknowledged
    SessionAcked,
    /// Connect timed out or failed
    ConnectFailed,
    /// The service received the user's turn
    InputReceived,
    /// Response audio arrived
    ResponseAudio,
    /// The last queued chunk finished playing
    PlaybackDrained { link_open: bool },
    /// Transport, capture, or server failure
    Failed,
    /// Stop and cleanup completed
    Stopped,
}

/// State plus the connect-attempt epoch
///
/// Every entry into `connecting` bumps the epoch so work started for an
/// earlier attempt can tell it has been superseded. `starting` stays set from
/// that entry until the attempt has finished acquiring the microphone, even
/// if the state has since been reset by a stop.
#[derive(Debug, Default)]
pub struct SessionStateMachine {
    state: SessionState,
    epoch: u64,
    starting: bool,
}

impl SessionStateMachine {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SessionState::Idle,
            epoch: 0,
            starting: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether a start attempt is still acquiring resources
    #[must_use]
    pub const fn is_starting(&self) -> bool {
        self.starting
    }

    /// Whether a new start may begin now
    #[must_use]
    pub const fn can_start(&self) -> bool {
        self.state.is_rest() && !self.starting
    }

    /// Mark the in-flight start attempt as finished
    pub fn settle_start(&mut self) {
        self.starting = false;
    }

    /// Invalidate every in-flight attempt without changing state
    pub fn supersede(&mut self) {
        self.epoch += 1;
    }

    /// Target state for `transition` from `from`, or `None` if illegal
    #[must_use]
    pub const fn target(from: SessionState, transition: Transition) -> Option<SessionState> {
        use SessionState as S;

        match (from, transition) {
            (S::Idle | S::Error, Transition::StartRequested) => Some(S::Connecting),
            (S::Connecting, Transition::SessionAcked) => Some(S::Listening),
            (S::Connecting, Transition::ConnectFailed) => Some(S::Error),
            (S::Listening, Transition::InputReceived) => Some(S::Processing),
            (S::Listening | S::Processing | S::Speaking, Transition::ResponseAudio) => {
                Some(S::Speaking)
            }
            (S::Speaking, Transition::PlaybackDrained { link_open: true }) => Some(S::Listening),
            (S::Speaking, Transition::PlaybackDrained { link_open: false }) => Some(S::Idle),
            (_, Transition::Failed) => Some(S::Error),
            (_, Transition::Stopped) => Some(S::Idle),
            _ => None,
        }
    }

    /// Apply `transition`, returning the new state if it changed
    pub fn apply(&mut self, transition: Transition) -> Option<SessionState> {
        let Some(next) = Self::target(self.state, transition) else {
            tracing::debug!(state = %self.state, ?transition, "transition rejected");
            return None;
        };
        if next == self.state {
            return None;
        }

        tracing::debug!(from = %self.state, to = %next, "session state changed");
        self.state = next;
        if next == SessionState::Connecting {
            self.epoch += 1;
            self.starting = true;
        }
        Some(next)
    }
}
