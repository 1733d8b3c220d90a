//! Configuration system for Matinee.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MATINEE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/matinee/config.toml
//!   3. ~/.config/matinee/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatineeConfig {
    pub network: NetworkConfig,
    pub session: SessionConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the authority binds. Clients dial it.
    pub bind_addr: String,
    /// TCP port. 0 = OS-assigned.
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hard maximum for one frame's payload on the wire.
    pub max_frame_payload: usize,
    /// Application messages above this are split by the session manager.
    /// Must exceed `max_frame_payload`.
    pub split_threshold: usize,
    /// Per-destination unconfirmed-byte ceiling for heavy traffic.
    pub unconfirmed_ceiling: u64,
    /// Server keep-alive emission interval.
    pub keepalive_interval_ms: u64,
    /// Keep-alive silence beyond this is connection loss.
    pub keepalive_timeout_ms: u64,
    /// Client latency probe interval.
    pub latency_probe_interval_ms: u64,
    /// Idle sleep for the pump/worker polling loops.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// How long the host waits for participation confirmations.
    pub participation_timeout_ms: u64,
    /// Optional password required in the client handshake.
    pub password: Option<String>,
    /// Maximum connected users. 0 = unlimited.
    pub max_users: usize,
    /// Whether newly joined users may add playlist items.
    pub guests_may_add: bool,
    /// Whether newly joined users may start/stop/seek playback.
    pub guests_may_control: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for MatineeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            session: SessionConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 9513,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: crate::wire::DEFAULT_MAX_FRAME_PAYLOAD,
            split_threshold: crate::wire::DEFAULT_SPLIT_THRESHOLD,
            unconfirmed_ceiling: 4 * 1024 * 1024,
            keepalive_interval_ms: 1_000,
            keepalive_timeout_ms: 10_000,
            latency_probe_interval_ms: 1_000,
            poll_interval_ms: 10,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            participation_timeout_ms: 5_000,
            password: None,
            max_users: 0,
            guests_may_add: true,
            guests_may_control: true,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("matinee")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MatineeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MatineeConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MATINEE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MatineeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MATINEE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MATINEE_NETWORK__BIND_ADDR") {
            self.network.bind_addr = v;
        }
        if let Ok(v) = std::env::var("MATINEE_NETWORK__PORT") {
            if let Ok(p) = v.parse() {
                self.network.port = p;
            }
        }
        if let Ok(v) = std::env::var("MATINEE_SESSION__MAX_FRAME_PAYLOAD") {
            if let Ok(n) = v.parse() {
                self.session.max_frame_payload = n;
            }
        }
        if let Ok(v) = std::env::var("MATINEE_SESSION__SPLIT_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.session.split_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("MATINEE_PLAYBACK__PASSWORD") {
            self.playback.password = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = std::env::var("MATINEE_PLAYBACK__MAX_USERS") {
            if let Ok(n) = v.parse() {
                self.playback.max_users = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_split_threshold_above_frame_ceiling() {
        let config = MatineeConfig::default();
        assert!(config.session.split_threshold > config.session.max_frame_payload);
        assert!(config.playback.password.is_none());
        assert_eq!(config.playback.max_users, 0);
    }

    #[test]
    fn toml_round_trip() {
        let config = MatineeConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: MatineeConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.network.port, config.network.port);
        assert_eq!(back.session.unconfirmed_ceiling, config.session.unconfirmed_ceiling);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: MatineeConfig = toml::from_str("[network]\nport = 7000\n").unwrap();
        assert_eq!(config.network.port, 7000);
        assert_eq!(
            config.session.max_frame_payload,
            crate::wire::DEFAULT_MAX_FRAME_PAYLOAD
        );
    }
}
