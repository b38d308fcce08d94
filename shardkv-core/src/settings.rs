//! Deployment settings loaded from TOML
//!
//! Every section is optional in the file; missing values fall back to the
//! defaults below. A few settings can be overridden through environment
//! variables, which take precedence over the file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{ShardKvError, ShardKvResult};
use crate::types::{GroupId, NO_GROUP};

/// Complete settings structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Request timeouts and background loop intervals
    pub timing: TimingSettings,

    /// Replicated log backend and its parameters
    pub log: LogSettings,

    /// Shape of an in-process deployment
    pub deployment: DeploymentSettings,

    /// Logging configuration
    pub observability: ObservabilitySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// How long a handler waits for its command to be applied
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Reconfiguration driver poll interval
    #[serde(with = "humantime_serde")]
    pub config_poll_interval: Duration,

    /// Shard migration engine interval (pulls and GC acknowledgements)
    #[serde(with = "humantime_serde")]
    pub migration_interval: Duration,

    /// Clerk back-off between retry rounds
    #[serde(with = "humantime_serde")]
    pub client_retry_delay: Duration,
}

/// Which replicated log implementation backs each participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    /// Deterministic in-process log with explicit leader control
    Memory,
    /// raft-rs nodes exchanging messages in-process
    Raft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub backend: LogBackend,

    /// Raft tick interval
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Ticks without a heartbeat before a follower campaigns
    pub election_tick: usize,

    /// Ticks between leader heartbeats
    pub heartbeat_tick: usize,

    /// Retained log entries that trigger a snapshot; 0 disables snapshots
    pub compaction_threshold: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentSettings {
    /// Replicas of the shard controller
    pub controller_replicas: usize,

    /// Storage groups started by the deployment
    pub groups: Vec<GroupSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSettings {
    pub gid: GroupId,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Default log level when `RUST_LOG` is not set
    pub log_level: String,
}

fn default_replicas() -> usize {
    3
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timing: TimingSettings::default(),
            log: LogSettings::default(),
            deployment: DeploymentSettings::default(),
            observability: ObservabilitySettings::default(),
        }
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            config_poll_interval: Duration::from_millis(100),
            migration_interval: Duration::from_millis(50),
            client_retry_delay: Duration::from_millis(50),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            backend: LogBackend::Memory,
            tick_interval: Duration::from_millis(20),
            election_tick: 10,
            heartbeat_tick: 3,
            compaction_threshold: 1000,
        }
    }
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            controller_replicas: 3,
            groups: vec![
                GroupSettings { gid: 100, replicas: 3 },
                GroupSettings { gid: 101, replicas: 3 },
                GroupSettings { gid: 102, replicas: 3 },
            ],
        }
    }
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, apply environment overrides and validate
    pub fn from_file<P: AsRef<Path>>(path: P) -> ShardKvResult<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .map_err(|e| ShardKvError::ConfigError(format!("Failed to read config file: {}", e)))?;
        Self::from_toml(&contents)
    }

    /// Parse settings from TOML text, apply environment overrides and validate
    pub fn from_toml(contents: &str) -> ShardKvResult<Self> {
        let mut settings: Settings = toml::from_str(contents)
            .map_err(|e| ShardKvError::ConfigError(format!("Failed to parse TOML: {}", e)))?;

        settings.apply_env_overrides()?;
        settings.validate()?;

        Ok(settings)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> ShardKvResult<()> {
        if let Ok(level) = std::env::var("SHARDKV_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(backend) = std::env::var("SHARDKV_LOG_BACKEND") {
            self.log.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => LogBackend::Memory,
                "raft" => LogBackend::Raft,
                other => {
                    return Err(ShardKvError::ConfigError(format!(
                        "Invalid SHARDKV_LOG_BACKEND: {}",
                        other
                    )))
                }
            };
        }
        if let Ok(timeout) = std::env::var("SHARDKV_REQUEST_TIMEOUT") {
            self.timing.request_timeout = humantime_serde::re::humantime::parse_duration(&timeout)
                .map_err(|e| {
                    ShardKvError::ConfigError(format!("Invalid SHARDKV_REQUEST_TIMEOUT: {}", e))
                })?;
        }
        Ok(())
    }

    /// Validate settings
    pub fn validate(&self) -> ShardKvResult<()> {
        if self.timing.request_timeout.is_zero() {
            return Err(ShardKvError::ConfigError(
                "Request timeout must be greater than zero".to_string(),
            ));
        }
        if self.timing.config_poll_interval.is_zero() || self.timing.migration_interval.is_zero() {
            return Err(ShardKvError::ConfigError(
                "Background loop intervals must be greater than zero".to_string(),
            ));
        }

        if self.log.heartbeat_tick == 0 || self.log.heartbeat_tick >= self.log.election_tick {
            return Err(ShardKvError::ConfigError(
                "Heartbeat tick must be non-zero and less than election tick".to_string(),
            ));
        }
        if self.log.tick_interval.is_zero() {
            return Err(ShardKvError::ConfigError(
                "Tick interval must be greater than zero".to_string(),
            ));
        }

        if self.deployment.controller_replicas == 0 {
            return Err(ShardKvError::ConfigError(
                "Controller needs at least one replica".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for group in &self.deployment.groups {
            if group.gid == NO_GROUP {
                return Err(ShardKvError::ConfigError(format!(
                    "Group id {} is reserved for unassigned shards",
                    NO_GROUP
                )));
            }
            if group.replicas == 0 {
                return Err(ShardKvError::ConfigError(format!(
                    "Group {} needs at least one replica",
                    group.gid
                )));
            }
            if !seen.insert(group.gid) {
                return Err(ShardKvError::ConfigError(format!(
                    "Group {} is listed twice",
                    group.gid
                )));
            }
        }

        match self.observability.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ShardKvError::ConfigError(format!(
                    "Invalid log level: {}",
                    self.observability.log_level
                )))
            }
        }

        Ok(())
    }
}

/// Settings builder for programmatic construction
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: LogBackend) -> Self {
        self.settings.log.backend = backend;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.timing.request_timeout = timeout;
        self
    }

    pub fn config_poll_interval(mut self, interval: Duration) -> Self {
        self.settings.timing.config_poll_interval = interval;
        self
    }

    pub fn migration_interval(mut self, interval: Duration) -> Self {
        self.settings.timing.migration_interval = interval;
        self
    }

    pub fn client_retry_delay(mut self, delay: Duration) -> Self {
        self.settings.timing.client_retry_delay = delay;
        self
    }

    pub fn compaction_threshold(mut self, entries: u64) -> Self {
        self.settings.log.compaction_threshold = entries;
        self
    }

    pub fn controller_replicas(mut self, replicas: usize) -> Self {
        self.settings.deployment.controller_replicas = replicas;
        self
    }

    pub fn groups(mut self, groups: impl IntoIterator<Item = (GroupId, usize)>) -> Self {
        self.settings.deployment.groups = groups
            .into_iter()
            .map(|(gid, replicas)| GroupSettings { gid, replicas })
            .collect();
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.settings.observability.log_level = level.into();
        self
    }

    pub fn build(self) -> ShardKvResult<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}
