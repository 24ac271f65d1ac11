//! Connector port: the read/write contract every field-bus driver satisfies.

use crate::error::ConnectorError;
use async_trait::async_trait;
use mtp_core::{TagDefinition, TagValue, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Stopped,
}

impl ConnectionState {
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectorHealth {
    pub state: ConnectionState,
    pub last_success: Option<Instant>,
    pub last_error: Option<Instant>,
    pub last_error_message: Option<String>,
    pub consecutive_errors: u32,
    pub total_reads: u64,
    pub total_writes: u64,
    pub total_errors: u64,
}

impl ConnectorHealth {
    pub fn is_healthy(&self) -> bool {
        self.state.is_connected() && self.consecutive_errors == 0
    }
}

/// Shared health bookkeeping for connector implementations.
#[derive(Debug, Default)]
pub struct HealthTracker {
    inner: Mutex<ConnectorHealth>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ConnectorHealth {
        self.inner.lock().clone()
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.inner.lock().state = state;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn record_read(&self, count: usize) {
        self.inner.lock().total_reads += count as u64;
    }

    pub fn record_write(&self) {
        self.inner.lock().total_writes += 1;
    }

    pub fn record_success(&self) {
        let mut health = self.inner.lock();
        health.last_success = Some(Instant::now());
        health.consecutive_errors = 0;
    }

    pub fn record_error(&self, message: impl Into<String>) {
        let mut health = self.inner.lock();
        health.last_error = Some(Instant::now());
        health.last_error_message = Some(message.into());
        health.consecutive_errors = health.consecutive_errors.saturating_add(1);
        health.total_errors += 1;
    }
}

/// Uniform contract for a field-bus driver.
///
/// `read_tag_values` returns raw (unscaled) readings keyed by tag name. A
/// tag missing from the map counts as a failed read for that tag. An `Err`
/// fails the whole batch.
#[async_trait]
pub trait ConnectorPort: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<(), ConnectorError>;

    async fn disconnect(&self);

    async fn read_tag_values(
        &self,
        tags: &[Arc<TagDefinition>],
    ) -> Result<HashMap<String, TagValue>, ConnectorError>;

    /// Write a raw value. `Ok(false)` means the device refused it.
    async fn write_tag_value(&self, tag: &TagDefinition, value: &Value)
        -> Result<bool, ConnectorError>;

    fn health(&self) -> ConnectorHealth;

    fn is_connected(&self) -> bool {
        self.health().state.is_connected()
    }
}
