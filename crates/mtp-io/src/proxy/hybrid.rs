use super::{LocalMachine, ProxyResult, ThinProxy};
use crate::config::ServiceConfig;
use crate::tag_manager::TagManager;
use mtp_core::{ProcedureCommand, ProcedureState};
use std::sync::Arc;
use tracing::debug;

/// Commands go to the PLC; a local machine tracks the expected state and
/// yields to the PLC whenever the PLC reports a defined state.
pub struct HybridProxy {
    thin: ThinProxy,
    local: LocalMachine,
}

impl HybridProxy {
    pub fn new(config: &ServiceConfig, tags: Arc<TagManager>) -> Self {
        Self {
            thin: ThinProxy::new(config, Arc::clone(&tags)),
            local: LocalMachine::new(config, tags),
        }
    }

    pub fn name(&self) -> &str {
        self.thin.name()
    }

    pub fn local(&self) -> &LocalMachine {
        &self.local
    }

    /// The local machine only moves once the PLC write succeeded.
    pub async fn send_command(
        &self,
        command: ProcedureCommand,
        procedure_id: Option<u32>,
    ) -> ProxyResult {
        let from_state = self.get_state().await;
        let mut result = self.thin.send_command(command, procedure_id).await;
        result.from_state = from_state;
        if result.success {
            let tracked = self.local.send_command(command).await;
            debug!(
                service = %self.name(),
                command = %command,
                local_state = ?tracked.to_state,
                "Command sent to PLC and tracked locally"
            );
        }
        result
    }

    pub async fn get_state(&self) -> ProcedureState {
        let remote = self.thin.get_state();
        if remote == ProcedureState::Undefined {
            return self.local.state().await;
        }
        self.local.resync(remote).await;
        remote
    }
}
