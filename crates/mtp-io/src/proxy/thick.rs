use super::{ProxyError, ProxyResult};
use crate::config::{ServiceConfig, WriteAction};
use crate::tag_manager::TagManager;
use async_trait::async_trait;
use mtp_core::{
    AutoComplete, PackMlMachine, ProcedureCommand, ProcedureState, StateHook, Transition,
    TransitionError,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Entry hook that performs configured tag writes through the Tag Manager.
pub struct WriteHook {
    service: String,
    actions: Vec<WriteAction>,
    tags: Arc<TagManager>,
}

impl WriteHook {
    pub fn new(service: impl Into<String>, actions: Vec<WriteAction>, tags: Arc<TagManager>) -> Self {
        Self {
            service: service.into(),
            actions,
            tags,
        }
    }
}

#[async_trait]
impl StateHook for WriteHook {
    async fn run(&self, state: ProcedureState) {
        for action in &self.actions {
            match self.tags.write_tag(&action.tag, action.value.clone()).await {
                Ok(true) => {}
                Ok(false) => warn!(
                    service = %self.service,
                    state = %state,
                    tag = %action.tag,
                    "Hook write not acknowledged"
                ),
                Err(e) => warn!(
                    service = %self.service,
                    state = %state,
                    tag = %action.tag,
                    error = %e,
                    "Hook write failed"
                ),
            }
        }
        debug!(
            service = %self.service,
            state = %state,
            hook_count = self.actions.len(),
            "Executed hooks for state"
        );
    }
}

/// Gateway-owned state machine: the sole authority in thick mode, the
/// tracking copy in hybrid mode.
pub struct LocalMachine {
    name: String,
    machine: Mutex<PackMlMachine>,
}

impl LocalMachine {
    pub fn new(config: &ServiceConfig, tags: Arc<TagManager>) -> Self {
        let mut machine = PackMlMachine::new(config.name.clone());
        machine.set_auto_complete(if config.timeouts.auto_complete_acting_states {
            AutoComplete {
                enabled: true,
                excluded: config.acting_state_conditions.keys().copied().collect(),
            }
        } else {
            AutoComplete::disabled()
        });
        for (state, actions) in config.state_hooks.by_state() {
            let hook = WriteHook::new(config.name.clone(), actions.to_vec(), Arc::clone(&tags));
            machine.on_enter(state, Arc::new(hook));
        }
        Self {
            name: config.name.clone(),
            machine: Mutex::new(machine),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> ProcedureState {
        self.machine.lock().await.state()
    }

    pub async fn can_accept(&self, command: ProcedureCommand) -> bool {
        self.machine.lock().await.can_accept(command)
    }

    /// Run a command through the machine. Hooks and auto-completion finish
    /// before this returns.
    pub async fn send_command(&self, command: ProcedureCommand) -> ProxyResult {
        let mut machine = self.machine.lock().await;
        let from_state = machine.state();
        match machine.send_command(command).await {
            Ok(transition) => ProxyResult::accepted(from_state, Some(transition.to)),
            Err(e) => {
                debug!(service = %self.name, command = %command, state = %from_state, "Command rejected by state machine");
                ProxyResult::failed(from_state, ProxyError::Transition(e))
            }
        }
    }

    pub async fn complete_acting_state(&self) -> Result<Transition, TransitionError> {
        self.machine.lock().await.complete_acting_state().await
    }

    pub async fn complete_execution(&self) -> Result<Transition, TransitionError> {
        self.machine.lock().await.complete_execution().await
    }

    /// Adopt a remotely reported state without running hooks.
    pub async fn resync(&self, state: ProcedureState) {
        self.machine.lock().await.resync(state);
    }
}
