//! Envelopes exchanged with the voice service and their wire encoding

use serde_json::{Map, Value};

use super::profile::{AudioFraming, ProtocolProfile};
use crate::session::SessionId;
use crate::voice::{AudioFrame, ChunkPayload, EncodedChunk, codec};
use crate::{Error, Result};

/// Client -> server messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEnvelope {
    /// Begin a session
    Start {
        session_id: SessionId,
        agent_id: String,
    },
    /// One captured frame
    Audio {
        session_id: SessionId,
        frame: AudioFrame,
        sample_rate: u32,
    },
    /// End a session
    Stop { session_id: SessionId },
    /// Keepalive
    Ping,
}

/// A message ready for the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl ClientEnvelope {
    /// The envelope's `type` tag
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Audio { .. } => "audio",
            Self::Stop { .. } => "stop",
            Self::Ping => "ping",
        }
    }

    /// Encode for the wire according to `profile`
    #[must_use]
    pub fn to_wire(&self, profile: &ProtocolProfile) -> WireMessage {
        let fields = &profile.fields;
        let mut map = Map::new();
        map.insert("type".to_string(), Value::String(self.kind().to_string()));

        match self {
            Self::Start {
                session_id,
                agent_id,
            } => {
                map.insert(fields.session_id.clone(), Value::String(session_id.to_string()));
                map.insert(fields.agent_id.clone(), Value::String(agent_id.clone()));
            }
            Self::Audio {
                session_id,
                frame,
                sample_rate,
            } => {
                if profile.audio_framing == AudioFraming::Binary {
                    return WireMessage::Binary(frame.to_le_bytes());
                }
                let chunk = codec::encode(frame, *sample_rate);
                map.insert(fields.session_id.clone(), Value::String(session_id.to_string()));
                map.insert(fields.audio.clone(), Value::String(chunk.data));
            }
            Self::Stop { session_id } => {
                map.insert(fields.session_id.clone(), Value::String(session_id.to_string()));
            }
            Self::Ping => {}
        }

        WireMessage::Text(Value::Object(map).to_string())
    }
}

/// Which side of the conversation a transcript belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    /// What the user said
    Input,
    /// What the agent said
    Output,
}

/// Server -> client messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEnvelope {
    /// Handshake complete
    SessionStarted { session_id: Option<String> },
    /// Synthesized audio, optionally with its text
    Audio {
        payload: ChunkPayload,
        text: Option<String>,
    },
    /// Informational transcript
    Transcript { role: TranscriptRole, text: String },
    /// Server-side failure
    Error { message: String },
    SessionStopped,
    Pong,
    /// Well-formed envelope with a tag this client does not handle
    Unknown { kind: String },
}

fn first_str<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

impl ServerEnvelope {
    /// Parse a JSON text frame
    ///
    /// `default_rate` applies to audio that does not declare `sample_rate`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for non-JSON input, a missing `type`, or a
    /// known type missing its required payload
    pub fn parse(text: &str, profile: &ProtocolProfile, default_rate: u32) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("invalid JSON envelope: {e}")))?;
        let Value::Object(obj) = value else {
            return Err(Error::Protocol("envelope is not a JSON object".to_string()));
        };
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("envelope missing type".to_string()))?;

        let envelope = match kind {
            "session_started" => Self::SessionStarted {
                session_id: first_str(
                    &obj,
                    &[profile.fields.session_id.as_str(), "sessionId", "session_id"],
                )
                .map(ToString::to_string),
            },
            "audio" | "voice_response" | "audio_response" => {
                let data = profile
                    .inbound_audio_fields
                    .iter()
                    .find_map(|k| obj.get(k).and_then(Value::as_str))
                    .ok_or_else(|| Error::Protocol(format!("{kind} envelope without audio")))?;

                let sample_rate = ["sample_rate", "sampleRate"]
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(Value::as_u64))
                    .and_then(|r| u32::try_from(r).ok())
                    .filter(|r| *r > 0)
                    .unwrap_or(default_rate);

                let text = profile
                    .inbound_text_fields
                    .iter()
                    .find_map(|k| obj.get(k).and_then(Value::as_str))
                    .map(ToString::to_string);

                Self::Audio {
                    payload: ChunkPayload::Encoded(EncodedChunk {
                        data: data.to_string(),
                        sample_rate,
                    }),
                    text,
                }
            }
            "input_transcript" | "output_transcript" => {
                let role = if kind == "input_transcript" {
                    TranscriptRole::Input
                } else {
                    TranscriptRole::Output
                };
                let text = first_str(&obj, &["text", "transcript"])
                    .ok_or_else(|| Error::Protocol(format!("{kind} envelope without text")))?;
                Self::Transcript {
                    role,
                    text: text.to_string(),
                }
            }
            "error" => Self::Error {
                message: first_str(&obj, &["message", "error"])
                    .unwrap_or("unknown server error")
                    .to_string(),
            },
            "session_stopped" => Self::SessionStopped,
            "pong" => Self::Pong,
            other => Self::Unknown {
                kind: other.to_string(),
            },
        };

        Ok(envelope)
    }

    /// Wrap a binary frame as inbound PCM16LE audio
    #[must_use]
    pub const fn from_binary(bytes: Vec<u8>, sample_rate: u32) -> Self {
        Self::Audio {
            payload: ChunkPayload::Raw { bytes, sample_rate },
            text: None,
        }
    }
}
