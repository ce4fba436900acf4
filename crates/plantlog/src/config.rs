// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Acquisition service configuration
//!
//! Loaded once from TOML at startup and read-only afterwards.
//!
//! ```toml
//! [service]
//! name = "line-1"
//!
//! [store]
//! path = "plantlog.db"
//!
//! [[sources]]
//! name = "Bottom Cover Module"
//! endpoint = "opc.tcp://172.20.3.1:4840"
//! poll_interval_ms = 500
//!
//! [[sources.tags]]
//! address = "ns=2;s=|var|CECC-LK.Application.Transport.xBG21"
//! on_change = true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service: ServiceSection,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub writer: WriterConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Polled sources, one task each.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// General service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    /// Service name (for identification in logs).
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Health reporting interval (seconds, 0 disables).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_service_name() -> String {
    "plantlog".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    30
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

/// Store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path (":memory:" for a transient store).
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "plantlog.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Reconnection supervisor settings, shared by all sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First retry delay (ms).
    pub backoff_base_ms: u64,

    /// Retry delay cap (ms).
    pub backoff_max_ms: u64,

    /// Jitter fraction added on top of the delay (0.0 - 1.0).
    pub jitter: f64,

    /// Consecutive read failures before a session is considered degraded.
    pub degraded_after: u32,

    /// Timeout for a single connect attempt (ms).
    pub connect_timeout_ms: u64,

    /// Timeout for a single read of all tags (ms).
    pub read_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            jitter: 0.2,
            degraded_after: 3,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 2_000,
        }
    }
}

impl ReconnectConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// What a full buffer does with a new reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject the new reading and count it as dropped.
    #[default]
    RejectNewest,

    /// Evict the oldest buffered reading and count it as dropped.
    DropOldest,
}

/// Per-source buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum buffered readings per source.
    pub capacity: usize,

    /// Fill level that wakes the writer before its next scheduled flush.
    pub watermark: usize,

    /// Behavior on overflow.
    pub overflow: OverflowPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            watermark: 1_000,
            overflow: OverflowPolicy::RejectNewest,
        }
    }
}

/// Writer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Scheduled flush interval (ms).
    pub flush_interval_ms: u64,

    /// Maximum readings per batch.
    pub max_batch: usize,

    /// First commit retry delay (ms).
    pub retry_base_ms: u64,

    /// Commit retry delay cap (ms).
    pub retry_max_ms: u64,

    /// Failed attempts on one batch before the store alert is raised.
    pub alert_after_attempts: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 1_000,
            max_batch: 500,
            retry_base_ms: 200,
            retry_max_ms: 10_000,
            alert_after_attempts: 5,
        }
    }
}

impl WriterConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

/// Fate of readings still unacknowledged at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnackedPolicy {
    /// Save to the spill file and replay on next start.
    #[default]
    Spill,

    /// Discard (the count is logged).
    Discard,
}

/// Shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time allowed for tasks to stop before they are aborted (ms).
    pub grace_ms: u64,

    /// What to do with unacknowledged readings.
    pub unacked: UnackedPolicy,

    /// Spill file location.
    pub spill_path: PathBuf,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: 5_000,
            unacked: UnackedPolicy::Spill,
            spill_path: PathBuf::from("plantlog.spill.jsonl"),
        }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// One polled endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Module name, used as the source id.
    pub name: String,

    /// Endpoint address (e.g. "opc.tcp://172.20.3.1:4840").
    pub endpoint: String,

    /// Poll interval (ms).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Tags read on every poll, in order.
    #[serde(default)]
    pub tags: Vec<TagConfig>,

    /// Optional session credentials.
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

fn default_poll_interval() -> u64 {
    500
}

impl SourceConfig {
    /// Create a source with the default poll interval and no tags.
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            poll_interval_ms: default_poll_interval(),
            tags: Vec::new(),
            credentials: None,
        }
    }

    /// Add a sampled tag.
    pub fn tag(mut self, address: impl Into<String>) -> Self {
        self.tags.push(TagConfig {
            address: address.into(),
            on_change: false,
        });
        self
    }

    /// Add a tag reported only when its value changes.
    pub fn tag_on_change(mut self, address: impl Into<String>) -> Self {
        self.tags.push(TagConfig {
            address: address.into(),
            on_change: true,
        });
        self
    }

    /// Set the poll interval.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Tag addresses in read order.
    pub fn addresses(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.address.clone()).collect()
    }
}

/// One tag of a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagConfig {
    /// Protocol address (node id).
    pub address: String,

    /// Emit a reading only when the value differs from the last one emitted.
    #[serde(default)]
    pub on_change: bool,
}

/// Session credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("No sources configured".into()));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(ConfigError::Invalid("Source with empty name".into()));
            }
            if !names.insert(source.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate source name '{}'",
                    source.name
                )));
            }
            if source.endpoint.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Source '{}' has empty endpoint",
                    source.name
                )));
            }
            if source.poll_interval_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "Source '{}' has zero poll interval",
                    source.name
                )));
            }
            if source.tags.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Source '{}' has no tags",
                    source.name
                )));
            }

            let mut addresses = HashSet::new();
            for tag in &source.tags {
                if tag.address.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "Source '{}' has a tag with empty address",
                        source.name
                    )));
                }
                if !addresses.insert(tag.address.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "Source '{}' lists tag '{}' twice",
                        source.name, tag.address
                    )));
                }
            }
        }

        if self.buffer.capacity == 0 {
            return Err(ConfigError::Invalid("Buffer capacity must be > 0".into()));
        }
        if self.buffer.watermark == 0 || self.buffer.watermark > self.buffer.capacity {
            return Err(ConfigError::Invalid(format!(
                "Buffer watermark {} must be within 1..={}",
                self.buffer.watermark, self.buffer.capacity
            )));
        }
        if self.writer.max_batch == 0 {
            return Err(ConfigError::Invalid("Writer max_batch must be > 0".into()));
        }
        if self.writer.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "Writer flush interval must be > 0".into(),
            ));
        }
        if self.reconnect.backoff_base_ms == 0
            || self.reconnect.backoff_base_ms > self.reconnect.backoff_max_ms
        {
            return Err(ConfigError::Invalid(format!(
                "Reconnect backoff base {} ms must be within 1..={} ms",
                self.reconnect.backoff_base_ms, self.reconnect.backoff_max_ms
            )));
        }
        if self.writer.retry_base_ms == 0 || self.writer.retry_base_ms > self.writer.retry_max_ms
        {
            return Err(ConfigError::Invalid(format!(
                "Writer retry base {} ms must be within 1..={} ms",
                self.writer.retry_base_ms, self.writer.retry_max_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(ConfigError::Invalid(format!(
                "Reconnect jitter {} must be within 0.0..=1.0",
                self.reconnect.jitter
            )));
        }
        if self.reconnect.degraded_after == 0 {
            return Err(ConfigError::Invalid(
                "Reconnect degraded_after must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Example configuration for a small assembly line.
    pub fn example() -> Self {
        let presence = "ns=2;s=|var|CECC-LK.Application.Transport.xBG21";
        let order = "ns=2;s=|var|CECC-LK.Application.FBs.stpStopper1.stRfidData.stMesData.udiONo";

        Self {
            service: ServiceSection {
                name: "assembly-line".into(),
                ..Default::default()
            },
            sources: vec![
                SourceConfig::new("Bottom Cover Module", "opc.tcp://172.20.3.1:4840")
                    .tag_on_change(presence)
                    .tag(order),
                SourceConfig::new("Robot Cell Module", "opc.tcp://172.20.4.1:4840")
                    .tag_on_change("ns=2;s=|var|CECC-LK.Application.TransportByPass.xBG31")
                    .tag(order),
            ],
            ..Default::default()
        }
    }
}
