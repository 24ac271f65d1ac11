//! Audit logging for safety-relevant gateway events.
//!
//! Commands, rejections, state transitions, emergency stops, and
//! communication loss are appended to a JSONL file, one entry per line.

use mtp_io::ServiceEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Types of events that are logged in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    /// Command forwarded to a service proxy
    CommandIssued,
    /// Command blocked by an interlock or refused by the proxy
    CommandRejected,
    StateTransition,
    EmergencyStop,
    CommLoss,
    /// Safety controller refused a write
    WriteDenied,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    /// Additional event-specific details
    pub details: serde_json::Value,
}

/// Thread-safe audit logger that writes to a JSONL file
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogger {
    /// Open `path` in append mode, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(&AuditEntry {
            unix_us: unix_now_us(),
            event_type,
            details,
        })
    }

    pub fn record_service_event(&self, event: &ServiceEvent) -> std::io::Result<()> {
        let (event_type, details) = describe(event);
        self.log_event(event_type, details)
    }
}

fn describe(event: &ServiceEvent) -> (AuditEventType, serde_json::Value) {
    match event {
        ServiceEvent::CommandIssued {
            service,
            command,
            procedure_id,
            from,
        } => (
            AuditEventType::CommandIssued,
            serde_json::json!({
                "service": service,
                "command": command,
                "procedure_id": procedure_id,
                "from_state": from,
            }),
        ),
        ServiceEvent::CommandRejected {
            service,
            command,
            reason,
        } => (
            AuditEventType::CommandRejected,
            serde_json::json!({
                "service": service,
                "command": command,
                "reason": reason,
            }),
        ),
        ServiceEvent::StateChanged { service, from, to } => (
            AuditEventType::StateTransition,
            serde_json::json!({
                "service": service,
                "from_state": from,
                "to_state": to,
            }),
        ),
        ServiceEvent::EmergencyStop { services } => (
            AuditEventType::EmergencyStop,
            serde_json::json!({ "aborted": services }),
        ),
        ServiceEvent::WriteDenied { tag, reason } => (
            AuditEventType::WriteDenied,
            serde_json::json!({ "tag": tag, "reason": reason }),
        ),
        ServiceEvent::CommLoss { connector, action } => (
            AuditEventType::CommLoss,
            serde_json::json!({ "connector": connector, "action": action }),
        ),
    }
}

fn unix_now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
