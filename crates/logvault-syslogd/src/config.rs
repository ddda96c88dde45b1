// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Daemon configuration.
//!
//! The daemon consumes a fully resolved [`Config`]: defaults, an
//! optional JSON file and CLI flags are merged by the binary before the
//! supervisor starts. `validate()` rejects combinations the pipeline
//! cannot run with.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// Monthly-partitioned SQLite files with FTS5 (default).
    Sqlite,
    /// Monthly-partitioned Meilisearch indexes.
    Meilisearch,
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::Meilisearch => write!(f, "meilisearch"),
        }
    }
}

impl std::str::FromStr for Driver {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(Self::Sqlite),
            "meilisearch" => Ok(Self::Meilisearch),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown driver '{other}' (expected 'sqlite' or 'meilisearch')"
            ))),
        }
    }
}

/// Resolved daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// UDP bind address.
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,

    /// UDP bind port.
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Storage backend.
    #[serde(default = "default_driver")]
    pub driver: Driver,

    /// Flush when this many records are buffered.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush this many seconds after the first buffered record.
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,

    /// Capacity of the receiver-to-batcher queue (0 = batch_size * 8).
    #[serde(default)]
    pub queue_capacity: usize,

    /// Requested SO_RCVBUF size in bytes.
    #[serde(default = "default_recv_buffer")]
    pub recv_buffer_bytes: usize,

    /// Wall-clock cap on the shutdown drain.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// SQLite backend settings.
    #[serde(default)]
    pub sqlite: SqliteConfig,

    /// Search backend settings.
    #[serde(default)]
    pub search: SearchConfig,

    /// Verbose per-datagram diagnostics.
    #[serde(default)]
    pub debug: bool,
}

/// SQLite backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Partition filename template: `syslog.sqlite3` produces
    /// `syslog_YYYYMM.sqlite3` next to it.
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

/// Search backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Endpoint, e.g. `http://127.0.0.1:7700`.
    #[serde(default)]
    pub url: String,

    /// API key sent as a bearer token.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Index name prefix; partitions become `<prefix>_YYYYMM`.
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            index_prefix: default_index_prefix(),
        }
    }
}

fn default_bind_ip() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_bind_port() -> u16 {
    5140
}

fn default_driver() -> Driver {
    Driver::Sqlite
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout() -> u64 {
    5
}

fn default_recv_buffer() -> usize {
    8 * 1024 * 1024
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_database() -> PathBuf {
    PathBuf::from("syslog.sqlite3")
}

fn default_index_prefix() -> String {
    "SystemEvents".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            bind_port: default_bind_port(),
            driver: default_driver(),
            batch_size: default_batch_size(),
            batch_timeout_secs: default_batch_timeout(),
            queue_capacity: 0,
            recv_buffer_bytes: default_recv_buffer(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            sqlite: SqliteConfig::default(),
            search: SearchConfig::default(),
            debug: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Effective queue capacity (resolves the 0 = auto default).
    pub fn queue_capacity(&self) -> usize {
        if self.queue_capacity > 0 {
            self.queue_capacity
        } else {
            self.batch_size.saturating_mul(8)
        }
    }

    /// Batch timeout as a [`Duration`].
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }

    /// Shutdown drain cap as a [`Duration`].
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_port == 0 {
            return Err(ConfigError::InvalidValue("bind_port cannot be 0".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue("batch_size cannot be 0".into()));
        }
        if self.batch_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "batch_timeout_secs cannot be 0".into(),
            ));
        }
        if self.queue_capacity() < self.batch_size {
            return Err(ConfigError::InvalidValue(
                "queue_capacity must be at least batch_size".into(),
            ));
        }
        if self.driver == Driver::Meilisearch && self.search.url.is_empty() {
            return Err(ConfigError::InvalidValue(
                "search.url is required for the meilisearch driver".into(),
            ));
        }
        if self.sqlite.database.file_name().is_none() {
            return Err(ConfigError::InvalidValue(
                "sqlite.database must name a file".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}
