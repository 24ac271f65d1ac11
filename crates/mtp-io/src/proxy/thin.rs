use super::{ProxyError, ProxyResult};
use crate::config::ServiceConfig;
use crate::tag_manager::TagManager;
use mtp_core::{ProcedureCommand, ProcedureState, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// The PLC owns the state machine; the gateway only writes command codes
/// and reads the reported state.
pub struct ThinProxy {
    name: String,
    command_op_tag: Option<String>,
    state_cur_tag: Option<String>,
    tags: Arc<TagManager>,
}

impl ThinProxy {
    pub fn new(config: &ServiceConfig, tags: Arc<TagManager>) -> Self {
        Self {
            name: config.name.clone(),
            command_op_tag: config.command_op_tag.clone(),
            state_cur_tag: config.state_cur_tag.clone(),
            tags,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send_command(
        &self,
        command: ProcedureCommand,
        procedure_id: Option<u32>,
    ) -> ProxyResult {
        let from_state = self.get_state();
        let Some(command_tag) = self.command_op_tag.as_deref() else {
            warn!(service = %self.name, command = %command, "No command_op_tag configured");
            return ProxyResult::failed(from_state, ProxyError::MissingCommandTag);
        };

        let code = Value::Int(i64::from(command.code()));
        match self.tags.write_tag(command_tag, code).await {
            Ok(true) => {
                debug!(
                    service = %self.name,
                    command = %command,
                    procedure_id = ?procedure_id,
                    tag = command_tag,
                    "Command written to PLC"
                );
                ProxyResult::accepted(from_state, None)
            }
            Ok(false) => ProxyResult::failed(from_state, ProxyError::WriteNotAcknowledged),
            Err(e) => {
                warn!(service = %self.name, command = %command, error = %e, "Command write failed");
                ProxyResult::failed(from_state, ProxyError::Write(e))
            }
        }
    }

    /// State reported by the PLC; UNDEFINED when absent or out of range.
    pub fn get_state(&self) -> ProcedureState {
        self.state_cur_tag
            .as_deref()
            .and_then(|tag| self.tags.get_value(tag))
            .and_then(|value| value.value().and_then(state_code))
            .and_then(ProcedureState::from_code)
            .unwrap_or(ProcedureState::Undefined)
    }
}

fn state_code(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Float(x) if x.fract() == 0.0 => Some(*x as i64),
        _ => None,
    }
}
