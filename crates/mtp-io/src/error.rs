use mtp_core::{ProcedureCommand, ProcedureState};
use thiserror::Error;

/// Failures raised by a field connector.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    #[error("connector '{connector}' is not connected")]
    NotConnected { connector: String },

    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Errors surfaced to callers of the tag and service APIs.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("tag '{tag}' is not writable")]
    NotWritable { tag: String },

    #[error("write to '{tag}' denied: {reason}")]
    WriteDenied { tag: String, reason: String },

    #[error("invalid value for '{tag}': {reason}")]
    InvalidValue { tag: String, reason: String },

    #[error("command {command} not valid in state {state}")]
    InvalidTransition {
        state: ProcedureState,
        command: ProcedureCommand,
    },

    #[error("service '{service}' interlocked: {reason}")]
    Interlocked {
        service: String,
        reason: String,
        source_tag: Option<String>,
    },

    #[error("communication failure on '{connector}': {source}")]
    CommunicationFailure {
        connector: String,
        #[source]
        source: ConnectorError,
    },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    pub fn tag_not_found(name: &str) -> Self {
        GatewayError::NotFound {
            kind: "Tag",
            name: name.to_string(),
        }
    }

    pub fn service_not_found(name: &str) -> Self {
        GatewayError::NotFound {
            kind: "Service",
            name: name.to_string(),
        }
    }

    /// Safety and interlock rejections; the caller decides whether to retry.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            GatewayError::WriteDenied { .. } | GatewayError::Interlocked { .. }
        )
    }
}
