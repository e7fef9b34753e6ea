/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

use crate::error::ConfigError;
use crate::reconnect::{ExponentialBackoff, LinearBackoff, ReconnectionPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use videocall_transport::LinkTimeouts;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    /// Fraction of each exponential delay that may be shaved off at random.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 15_000,
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> Arc<dyn ReconnectionPolicy> {
        let base = Duration::from_millis(self.base_delay_ms);
        let max_delay = Duration::from_millis(self.max_delay_ms);
        match self.strategy {
            BackoffStrategy::Linear => Arc::new(LinearBackoff {
                base,
                step: base,
                max_delay,
                max_attempts: self.max_attempts,
            }),
            BackoffStrategy::Exponential => Arc::new(ExponentialBackoff {
                initial: base,
                factor: 2.0,
                max_delay,
                max_attempts: self.max_attempts,
                jitter: self.jitter,
            }),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Rendezvous URLs, tried in order on every (re)connection.
    pub signaling_urls: Vec<String>,
    pub probe_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// How long to wait for a roster naming us before assuming the join
    /// went through.
    pub join_fallback_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Unacknowledged heartbeats tolerated before a warning is logged.
    pub heartbeat_ack_grace: u32,
    pub native_timeout_ms: u64,
    pub secondary_timeout_ms: u64,
    pub relay_frame_interval_ms: u64,
    pub relay_max_dimension: u32,
    pub relay_jpeg_quality: u8,
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_urls: Vec::new(),
            probe_timeout_ms: 1_500,
            connect_timeout_ms: 5_000,
            join_fallback_ms: 3_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_ack_grace: 3,
            native_timeout_ms: 20_000,
            secondary_timeout_ms: 15_000,
            relay_frame_interval_ms: 250,
            relay_max_dimension: 320,
            relay_jpeg_quality: 60,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            signaling_urls: urls.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env_or_default() -> Result<Self, ConfigError> {
        // A config file wins over individual variables
        if let Ok(config_path) = std::env::var("SESSION_CONFIG_PATH") {
            return Self::from_file(&config_path);
        }

        let mut config = Self::default();
        if let Ok(urls) = std::env::var("SIGNALING_URLS") {
            config.signaling_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
        }
        override_from_env("PROBE_TIMEOUT_MS", &mut config.probe_timeout_ms)?;
        override_from_env("CONNECT_TIMEOUT_MS", &mut config.connect_timeout_ms)?;
        override_from_env("JOIN_FALLBACK_MS", &mut config.join_fallback_ms)?;
        override_from_env("HEARTBEAT_INTERVAL_MS", &mut config.heartbeat_interval_ms)?;
        override_from_env("NATIVE_TIMEOUT_MS", &mut config.native_timeout_ms)?;
        override_from_env("SECONDARY_TIMEOUT_MS", &mut config.secondary_timeout_ms)?;
        override_from_env(
            "RELAY_FRAME_INTERVAL_MS",
            &mut config.relay_frame_interval_ms,
        )?;
        override_from_env(
            "RECONNECT_MAX_ATTEMPTS",
            &mut config.reconnect.max_attempts,
        )?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling_urls.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one signaling URL is required".into(),
            ));
        }
        let non_zero = [
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("join_fallback_ms", self.join_fallback_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("native_timeout_ms", self.native_timeout_ms),
            ("secondary_timeout_ms", self.secondary_timeout_ms),
            ("relay_frame_interval_ms", self.relay_frame_interval_ms),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.max_attempts must be non-zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(ConfigError::Invalid(
                "reconnect.jitter must be within 0.0..=1.0".into(),
            ));
        }
        if self.relay_max_dimension < 16 || !(1..=100).contains(&self.relay_jpeg_quality) {
            return Err(ConfigError::Invalid(
                "relay_max_dimension must be >= 16 and relay_jpeg_quality within 1..=100".into(),
            ));
        }
        Ok(())
    }

    pub fn link_timeouts(&self) -> LinkTimeouts {
        LinkTimeouts {
            probe: Duration::from_millis(self.probe_timeout_ms),
            handshake: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn join_fallback(&self) -> Duration {
        Duration::from_millis(self.join_fallback_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn relay_frame_interval(&self) -> Duration {
        Duration::from_millis(self.relay_frame_interval_ms)
    }
}

fn override_from_env<T: std::str::FromStr>(name: &str, slot: &mut T) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(name) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env {
                name: name.to_string(),
                value,
            })?;
    }
    Ok(())
}
