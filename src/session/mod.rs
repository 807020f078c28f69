//! Voice session lifecycle
//!
//! [`SessionController`] wires capture, transport, and playback together and
//! drives the [`SessionStateMachine`]. Observers follow along through
//! [`SessionEvent`]s.

mod controller;
mod state;

use std::fmt;

pub use controller::SessionController;
pub use state::{SessionState, SessionStateMachine, Transition};

use crate::error::ErrorKind;
use crate::transport::TranscriptRole;

/// Opaque session token, immutable for the life of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Notifications for whatever renders session status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Transcript text forwarded from the service
    Transcript { role: TranscriptRole, text: String },
    /// Text accompanying a synthesized audio chunk
    ResponseText(String),
    /// The session entered `error`
    Failed { kind: ErrorKind, message: String },
    /// A single chunk failed to play; the session continues
    PlaybackError(String),
    Pong,
}

impl SessionEvent {
    pub(crate) fn failed(error: &crate::Error) -> Self {
        let kind = error.kind();
        Self::Failed {
            kind,
            message: format!("{} ({error})", kind.user_message()),
        }
    }
}
