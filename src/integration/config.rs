//! Configuration for the integration layer
//!
//! Provides centralized configuration for all components. Every field has a
//! default, so a TOML file only needs the values that differ.

use crate::audio::playback::PlaybackConfig;
use crate::session::timer::TimerConfig;
use crate::session::topic::TopicRules;
use crate::transport::channel::TransportConfig;
use crate::{Result, SessionError};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Configuration for one interview session
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket address of the orchestration server
    pub server_address: String,

    /// Opaque session identifier issued by the application layer
    pub session_id: String,

    /// Roster id of the local (human) participant
    pub local_participant_id: String,

    /// Display name of the local participant
    pub local_participant_name: String,

    /// Session identity token, sent as a bearer token when connecting
    pub auth_token: Option<String>,

    /// Interview configuration to load before starting
    pub config_id: Option<String>,

    pub transport: TransportConfig,

    pub playback: PlaybackConfig,

    pub timers: TimerConfig,

    pub topics: TopicRules,

    /// Whether to enable audio input
    pub enable_audio_input: bool,

    /// Whether to enable audio output
    pub enable_audio_output: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_address: "ws://127.0.0.1:8000/ws".to_string(),
            session_id: String::new(),
            local_participant_id: "candidate".to_string(),
            local_participant_name: "Candidate".to_string(),
            auth_token: None,
            config_id: None,
            transport: TransportConfig::default(),
            playback: PlaybackConfig::default(),
            timers: TimerConfig::default(),
            topics: TopicRules::default(),
            enable_audio_input: true,
            enable_audio_output: true,
        }
    }
}

impl SessionConfig {
    /// Create a configuration for a server and session
    pub fn new(server_address: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SessionError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SessionError::ConfigError(format!("Invalid configuration: {}", e)))
    }

    /// Set the local participant
    pub fn with_participant(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.local_participant_id = id.into();
        self.local_participant_name = name.into();
        self
    }

    /// Set the session identity token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Load an interview configuration by id on connect
    pub fn with_config_id(mut self, config_id: impl Into<String>) -> Self {
        self.config_id = Some(config_id.into());
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_playback(mut self, playback: PlaybackConfig) -> Self {
        self.playback = playback;
        self
    }

    pub fn with_timers(mut self, timers: TimerConfig) -> Self {
        self.timers = timers;
        self
    }

    /// Disable audio input (no microphone)
    pub fn without_audio_input(mut self) -> Self {
        self.enable_audio_input = false;
        self
    }

    /// Disable audio output (speech is received but not played)
    pub fn without_audio_output(mut self) -> Self {
        self.enable_audio_output = false;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let require = |value: &str, name: &str| {
            if value.trim().is_empty() {
                Err(SessionError::ConfigError(format!("{} must not be empty", name)))
            } else {
                Ok(())
            }
        };

        require(&self.server_address, "server_address")?;
        require(&self.session_id, "session_id")?;
        require(&self.local_participant_id, "local_participant_id")?;
        require(&self.local_participant_name, "local_participant_name")?;

        if !self.server_address.starts_with("ws://") && !self.server_address.starts_with("wss://") {
            return Err(SessionError::ConfigError(format!(
                "server_address must be a ws:// or wss:// URL: {}",
                self.server_address
            )));
        }

        if self.playback.min_buffer_bytes == 0 {
            return Err(SessionError::ConfigError(
                "playback.min_buffer_bytes must be greater than zero".to_string(),
            ));
        }

        if self.timers.live_coding_secs == 0 || self.timers.tick_interval_ms == 0 {
            return Err(SessionError::ConfigError(
                "timer durations must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
