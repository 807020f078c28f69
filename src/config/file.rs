//! TOML configuration file loading
//!
//! Supports `~/.config/voxlink/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

use crate::transport::AudioFraming;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoxlinkConfigFile {
    /// WebSocket endpoint of the voice service
    pub endpoint: Option<String>,

    /// Agent the service should route the session to
    pub agent_id: Option<String>,

    /// Protocol preset name ("json" or "binary")
    pub profile: Option<String>,

    #[serde(default)]
    pub protocol: ProtocolFileConfig,

    #[serde(default)]
    pub capture: CaptureFileConfig,

    #[serde(default)]
    pub playback: PlaybackFileConfig,

    #[serde(default)]
    pub timing: TimingFileConfig,
}

/// Per-field overrides applied on top of the selected preset
#[derive(Debug, Default, Deserialize)]
pub struct ProtocolFileConfig {
    pub audio_framing: Option<AudioFraming>,
    pub session_id_field: Option<String>,
    pub agent_id_field: Option<String>,
    pub audio_field: Option<String>,
    pub inbound_audio_fields: Option<Vec<String>>,
    pub await_session_ack: Option<bool>,
}

/// Microphone capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u16>,
    pub frame_size: Option<usize>,
    pub echo_cancellation: Option<bool>,
    pub noise_suppression: Option<bool>,
    pub auto_gain_control: Option<bool>,
}

/// Playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Rate assumed for inbound audio that does not declare one
    pub default_sample_rate: Option<u32>,
}

/// Session timing, all in milliseconds
#[derive(Debug, Default, Deserialize)]
pub struct TimingFileConfig {
    pub connect_timeout_ms: Option<u64>,
    pub connect_poll_ms: Option<u64>,
    pub keepalive_ms: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoxlinkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoxlinkConfigFile {
    let Some(path) = config_file_path() else {
        return VoxlinkConfigFile::default();
    };

    if !path.exists() {
        return VoxlinkConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoxlinkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoxlinkConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/voxlink/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voxlink").join("config.toml"))
}
