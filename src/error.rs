//! Error types for the voice streaming pipeline

use std::time::Duration;

use thiserror::Error;

/// Result type alias for voxlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a voice session
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone access was refused by the host
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No capture device is available
    #[error("no capture device available")]
    DeviceNotFound,

    /// The capture stream or its real-time thread failed to initialize
    #[error("capture init failed: {0}")]
    CaptureInitFailed(String),

    /// The transport never reached the open state within the bound
    #[error("connection timed out after {}ms", .0.as_millis())]
    ConnectTimeout(Duration),

    /// The transport failed to connect or dropped while a session was live
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Malformed or unexpected envelope
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server sent an `error` envelope
    #[error("server error: {0}")]
    Server(String),

    /// A queued chunk could not be decoded
    #[error("playback decode error: {0}")]
    PlaybackDecode(String),

    /// Output device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Attempted to send while the transport is not open
    #[error("transport not connected")]
    NotConnected,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Base64 decoding error
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Classification of an error for status reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PermissionDenied,
    DeviceNotFound,
    CaptureInitFailed,
    ConnectTimeout,
    ConnectFailed,
    ProtocolError,
    ServerError,
    PlaybackDecodeError,
    Other,
}

impl ErrorKind {
    /// Human-readable status line for the UI
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Microphone permission denied. Allow microphone access and try again."
            }
            Self::DeviceNotFound => "No microphone found. Connect a microphone and try again.",
            Self::CaptureInitFailed => "Could not start audio capture.",
            Self::ConnectTimeout => "Could not connect to the voice service (timed out).",
            Self::ConnectFailed => "Could not connect to the voice service.",
            Self::ProtocolError => "The voice service sent an unexpected message.",
            Self::ServerError => "The voice service reported an error.",
            Self::PlaybackDecodeError => "A response audio chunk could not be played.",
            Self::Other => "Something went wrong with the voice session.",
        }
    }

    /// Whether an error of this kind ends the session
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::PlaybackDecodeError)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PermissionDenied => "permission_denied",
            Self::DeviceNotFound => "device_not_found",
            Self::CaptureInitFailed => "capture_init_failed",
            Self::ConnectTimeout => "connect_timeout",
            Self::ConnectFailed => "connect_failed",
            Self::ProtocolError => "protocol_error",
            Self::ServerError => "server_error",
            Self::PlaybackDecodeError => "playback_decode_error",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::DeviceNotFound => ErrorKind::DeviceNotFound,
            Self::CaptureInitFailed(_) => ErrorKind::CaptureInitFailed,
            Self::ConnectTimeout(_) => ErrorKind::ConnectTimeout,
            Self::ConnectFailed(_) | Self::NotConnected | Self::WebSocket(_) => {
                ErrorKind::ConnectFailed
            }
            Self::Protocol(_) | Self::Serialization(_) => ErrorKind::ProtocolError,
            Self::Server(_) => ErrorKind::ServerError,
            Self::PlaybackDecode(_) | Self::Base64(_) => ErrorKind::PlaybackDecodeError,
            Self::Audio(_) | Self::Config(_) | Self::Io(_) | Self::Toml(_) => ErrorKind::Other,
        }
    }

    /// Classify a capture backend failure by its message
    ///
    /// cpal does not surface permission denial as a distinct error, so the
    /// backend text is inspected.
    #[must_use]
    pub fn from_capture_backend(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("permission") || lower.contains("denied") || lower.contains("not permitted")
        {
            Self::PermissionDenied(message)
        } else if lower.contains("no such device") || lower.contains("device not available") {
            Self::DeviceNotFound
        } else {
            Self::CaptureInitFailed(message)
        }
    }
}
