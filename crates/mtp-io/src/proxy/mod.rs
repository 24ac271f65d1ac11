//! Service proxies: who owns a service's procedural state.
//!
//! The mode is fixed at configuration time. [`ServiceProxy::from_config`]
//! builds the one variant a service uses; there is no runtime switching.

mod hybrid;
mod thick;
mod thin;

pub use hybrid::HybridProxy;
pub use thick::{LocalMachine, WriteHook};
pub use thin::ThinProxy;

use crate::config::{ProxyMode, ServiceConfig};
use crate::error::GatewayError;
use crate::tag_manager::TagManager;
use mtp_core::{ProcedureCommand, ProcedureState, Transition, TransitionError};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("Thin proxy service missing command_op_tag")]
    MissingCommandTag,
    #[error("Failed to write command to PLC")]
    WriteNotAcknowledged,
    #[error(transparent)]
    Write(GatewayError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Outcome of a command sent through a proxy.
#[derive(Debug, Clone)]
pub struct ProxyResult {
    pub success: bool,
    pub from_state: ProcedureState,
    /// Absent when the new state is only known once the PLC reports it.
    pub to_state: Option<ProcedureState>,
    pub error: Option<ProxyError>,
}

impl ProxyResult {
    pub fn accepted(from_state: ProcedureState, to_state: Option<ProcedureState>) -> Self {
        Self {
            success: true,
            from_state,
            to_state,
            error: None,
        }
    }

    pub fn failed(from_state: ProcedureState, error: ProxyError) -> Self {
        Self {
            success: false,
            from_state,
            to_state: None,
            error: Some(error),
        }
    }
}

pub enum ServiceProxy {
    Thin(ThinProxy),
    Thick(LocalMachine),
    Hybrid(HybridProxy),
}

impl ServiceProxy {
    pub fn from_config(config: &ServiceConfig, tags: Arc<TagManager>) -> Self {
        match config.mode {
            ProxyMode::ThinProxy => ServiceProxy::Thin(ThinProxy::new(config, tags)),
            ProxyMode::ThickProxy => ServiceProxy::Thick(LocalMachine::new(config, tags)),
            ProxyMode::Hybrid => ServiceProxy::Hybrid(HybridProxy::new(config, tags)),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ServiceProxy::Thin(p) => p.name(),
            ServiceProxy::Thick(p) => p.name(),
            ServiceProxy::Hybrid(p) => p.name(),
        }
    }

    pub fn mode(&self) -> ProxyMode {
        match self {
            ServiceProxy::Thin(_) => ProxyMode::ThinProxy,
            ServiceProxy::Thick(_) => ProxyMode::ThickProxy,
            ServiceProxy::Hybrid(_) => ProxyMode::Hybrid,
        }
    }

    pub async fn send_command(
        &self,
        command: ProcedureCommand,
        procedure_id: Option<u32>,
    ) -> ProxyResult {
        match self {
            ServiceProxy::Thin(p) => p.send_command(command, procedure_id).await,
            ServiceProxy::Thick(p) => p.send_command(command).await,
            ServiceProxy::Hybrid(p) => p.send_command(command, procedure_id).await,
        }
    }

    pub async fn get_state(&self) -> ProcedureState {
        match self {
            ServiceProxy::Thin(p) => p.get_state(),
            ServiceProxy::Thick(p) => p.state().await,
            ServiceProxy::Hybrid(p) => p.get_state().await,
        }
    }

    /// The locally tracked machine, if this mode has one.
    pub fn local_machine(&self) -> Option<&LocalMachine> {
        match self {
            ServiceProxy::Thin(_) => None,
            ServiceProxy::Thick(p) => Some(p),
            ServiceProxy::Hybrid(p) => Some(p.local()),
        }
    }

    /// Advance the local acting state. `None` when there is no local machine.
    pub async fn complete_acting_state(&self) -> Option<Result<Transition, TransitionError>> {
        match self.local_machine() {
            Some(machine) => Some(machine.complete_acting_state().await),
            None => None,
        }
    }

    pub async fn complete_execution(&self) -> Option<Result<Transition, TransitionError>> {
        match self.local_machine() {
            Some(machine) => Some(machine.complete_execution().await),
            None => None,
        }
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("name", &self.name())
            .field("mode", &self.mode())
            .finish()
    }
}
