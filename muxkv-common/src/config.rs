//! # Client Configuration
//!
//! Purpose: Describe how many physical connections to open, how long callers
//! may wait for a write path, and what happens while no connection is up.
//!
//! ## Design Principles
//! 1. **Plain Data**: Fields are milliseconds so the struct deserializes from
//!    any serde format; accessors hand out `Duration`s.
//! 2. **Safe Defaults**: `MuxConfig::default()` is usable as-is for a local server.
//! 3. **Validate Once**: `validate()` rejects nonsense before any socket opens.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What to do with a message when its connection cannot accept writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogPolicy {
    /// Queue the message until the connection returns or its deadline passes.
    #[default]
    Default,
    /// Reject immediately with "no connection available".
    FailFast,
}

/// Configuration for the multiplexer and its physical connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Number of physical connections to multiplex onto.
    pub connections: usize,
    /// Backlog behavior while disconnected.
    pub backlog_policy: BacklogPolicy,
    /// Maximum wait for the per-connection write lock; 0 means never wait.
    pub write_lock_timeout_ms: u64,
    /// Deadline for messages submitted by blocking callers.
    pub sync_timeout_ms: u64,
    /// Deadline for messages submitted by async callers.
    pub async_timeout_ms: u64,
    /// Period of the backlog expiry sweep.
    pub heartbeat_interval_ms: u64,
    /// Delay before a dropped connection is re-established.
    pub reconnect_interval_ms: u64,
    /// Optional TCP connect timeout.
    pub connect_timeout_ms: Option<u64>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            addr: "127.0.0.1:6379".to_string(),
            connections: 1,
            backlog_policy: BacklogPolicy::Default,
            write_lock_timeout_ms: 5_000,
            sync_timeout_ms: 5_000,
            async_timeout_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            reconnect_interval_ms: 1_000,
            connect_timeout_ms: None,
        }
    }
}

impl MuxConfig {
    /// Creates a configuration for `addr` with every other field defaulted.
    pub fn new(addr: impl Into<String>) -> Self {
        MuxConfig {
            addr: addr.into(),
            ..MuxConfig::default()
        }
    }

    /// Checks cross-field constraints, returning the first violated one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if self.connections == 0 {
            return Err(ConfigError::NoConnections);
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroHeartbeat);
        }
        Ok(())
    }

    pub fn write_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.write_lock_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}
