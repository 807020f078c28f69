//! Configuration management for voxlink

pub mod file;

use std::time::Duration;

use crate::transport::ProtocolProfile;
use crate::voice::{FRAME_SIZE, SAMPLE_RATE};
use crate::{Error, Result};

/// Default voice service endpoint
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8080/ws/voice";

/// Default playback rate for inbound audio that does not declare one
pub const DEFAULT_PLAYBACK_RATE: u32 = 24000;

/// voxlink configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket URL of the voice service
    pub endpoint: String,

    /// Agent identifier sent in the `start` envelope
    pub agent_id: String,

    /// Wire protocol variant
    pub profile: ProtocolProfile,

    /// Microphone capture configuration
    pub capture: CaptureConfig,

    /// Playback configuration
    pub playback: PlaybackConfig,

    /// Connect and keepalive timing
    pub timing: SessionTiming,
}

/// Microphone capture configuration
///
/// The DSP flags are requested from the host; voxlink does not implement
/// echo cancellation, noise suppression, or gain control itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Samples per emitted frame
    pub frame_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channel_count: 1,
            frame_size: FRAME_SIZE,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Playback configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackConfig {
    pub default_sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_sample_rate: DEFAULT_PLAYBACK_RATE,
        }
    }
}

/// Session timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTiming {
    /// Upper bound on waiting for the transport to open
    pub connect_timeout: Duration,
    /// Poll interval while waiting for the transport to open
    pub connect_poll: Duration,
    /// Interval between `ping` envelopes
    pub keepalive: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            connect_poll: Duration::from_millis(100),
            keepalive: Duration::from_secs(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            agent_id: "default".to_string(),
            profile: ProtocolProfile::default(),
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
            timing: SessionTiming::default(),
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed config file with an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error on an unknown profile name or invalid values
    pub fn resolve(
        fc: file::VoxlinkConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = Self::default();

        let profile_name = env("VOXLINK_PROFILE").or(fc.profile);
        let mut profile = match profile_name {
            Some(name) => ProtocolProfile::by_name(&name)
                .ok_or_else(|| Error::Config(format!("unknown protocol profile: {name}")))?,
            None => defaults.profile,
        };

        let p = fc.protocol;
        if let Some(framing) = p.audio_framing {
            profile.audio_framing = framing;
        }
        if let Some(field) = p.session_id_field {
            profile.fields.session_id = field;
        }
        if let Some(field) = p.agent_id_field {
            profile.fields.agent_id = field;
        }
        if let Some(field) = p.audio_field {
            profile.fields.audio = field;
        }
        if let Some(fields) = p.inbound_audio_fields {
            profile.inbound_audio_fields = fields;
        }
        if let Some(ack) = p.await_session_ack {
            profile.await_session_ack = ack;
        }

        let c = fc.capture;
        let capture = CaptureConfig {
            sample_rate: c.sample_rate.unwrap_or(defaults.capture.sample_rate),
            channel_count: c.channel_count.unwrap_or(defaults.capture.channel_count),
            frame_size: c.frame_size.unwrap_or(defaults.capture.frame_size),
            echo_cancellation: c
                .echo_cancellation
                .unwrap_or(defaults.capture.echo_cancellation),
            noise_suppression: c
                .noise_suppression
                .unwrap_or(defaults.capture.noise_suppression),
            auto_gain_control: c
                .auto_gain_control
                .unwrap_or(defaults.capture.auto_gain_control),
        };

        let playback = PlaybackConfig {
            default_sample_rate: fc
                .playback
                .default_sample_rate
                .unwrap_or(defaults.playback.default_sample_rate),
        };

        let t = fc.timing;
        let env_ms = |key: &str| env(key).and_then(|v| v.parse::<u64>().ok());
        let timing = SessionTiming {
            connect_timeout: env_ms("VOXLINK_CONNECT_TIMEOUT_MS")
                .or(t.connect_timeout_ms)
                .map_or(defaults.timing.connect_timeout, Duration::from_millis),
            connect_poll: t
                .connect_poll_ms
                .map_or(defaults.timing.connect_poll, Duration::from_millis),
            keepalive: t
                .keepalive_ms
                .map_or(defaults.timing.keepalive, Duration::from_millis),
        };

        let config = Self {
            endpoint: env("VOXLINK_URL")
                .or(fc.endpoint)
                .unwrap_or(defaults.endpoint),
            agent_id: env("VOXLINK_AGENT_ID")
                .or(fc.agent_id)
                .unwrap_or(defaults.agent_id),
            profile,
            capture,
            playback,
            timing,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the pipeline misbehave
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "endpoint must be a ws:// or wss:// URL: {}",
                self.endpoint
            )));
        }
        if self.capture.frame_size == 0 {
            return Err(Error::Config("capture.frame_size must be non-zero".to_string()));
        }
        if self.capture.sample_rate == 0 || self.playback.default_sample_rate == 0 {
            return Err(Error::Config("sample rates must be non-zero".to_string()));
        }
        if self.capture.channel_count == 0 {
            return Err(Error::Config("capture.channel_count must be non-zero".to_string()));
        }
        if self.timing.connect_timeout.is_zero()
            || self.timing.connect_poll.is_zero()
            || self.timing.keepalive.is_zero()
        {
            return Err(Error::Config("timing values must be non-zero".to_string()));
        }
        Ok(())
    }
}
