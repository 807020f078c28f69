//! Protocol profiles covering the envelope variants deployed services speak

use serde::{Deserialize, Serialize};

/// How audio travels over the socket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFraming {
    /// JSON `audio` envelope with base64 PCM16LE
    #[default]
    Base64Text,
    /// Raw PCM16LE in WebSocket binary frames
    Binary,
}

/// Outbound JSON field names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub session_id: String,
    pub agent_id: String,
    pub audio: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            session_id: "sessionId".to_string(),
            agent_id: "agentId".to_string(),
            audio: "audioData".to_string(),
        }
    }
}

/// Wire-level protocol settings selected at session configuration time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolProfile {
    /// Preset name, for logging
    pub name: String,
    pub audio_framing: AudioFraming,
    pub fields: FieldMapping,
    /// Inbound fields searched, in order, for base64 audio
    pub inbound_audio_fields: Vec<String>,
    /// Inbound fields searched, in order, for text accompanying audio
    pub inbound_text_fields: Vec<String>,
    /// Whether `connecting -> listening` waits for `session_started`
    pub await_session_ack: bool,
}

impl Default for ProtocolProfile {
    fn default() -> Self {
        Self::json()
    }
}

impl ProtocolProfile {
    /// JSON envelopes with base64 audio, acknowledged sessions
    #[must_use]
    pub fn json() -> Self {
        Self {
            name: "json".to_string(),
            audio_framing: AudioFraming::Base64Text,
            fields: FieldMapping::default(),
            inbound_audio_fields: vec!["data".to_string(), "audio".to_string()],
            inbound_text_fields: vec![
                "text".to_string(),
                "transcript".to_string(),
                "response".to_string(),
            ],
            await_session_ack: true,
        }
    }

    /// JSON control envelopes with binary audio frames in both directions
    #[must_use]
    pub fn binary() -> Self {
        Self {
            name: "binary".to_string(),
            audio_framing: AudioFraming::Binary,
            ..Self::json()
        }
    }

    /// Look up a preset by name
    #[must_use]
    pub fn by_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "json" | "base64" | "text" => Some(Self::json()),
            "binary" | "raw" => Some(Self::binary()),
            _ => None,
        }
    }
}
