//! PackML procedure lifecycle: 18 states, 9 commands, entry and exit hooks,
//! and auto-completion of acting states.

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcedureState {
    Undefined,
    Idle,
    Starting,
    Execute,
    Completing,
    Completed,
    Holding,
    Held,
    Unholding,
    Stopping,
    Stopped,
    Aborting,
    Aborted,
    Clearing,
    Suspending,
    Suspended,
    Unsuspending,
    Resetting,
}

impl ProcedureState {
    /// All states in wire code order.
    pub const ALL: [ProcedureState; 18] = [
        ProcedureState::Undefined,
        ProcedureState::Idle,
        ProcedureState::Starting,
        ProcedureState::Execute,
        ProcedureState::Completing,
        ProcedureState::Completed,
        ProcedureState::Holding,
        ProcedureState::Held,
        ProcedureState::Unholding,
        ProcedureState::Stopping,
        ProcedureState::Stopped,
        ProcedureState::Aborting,
        ProcedureState::Aborted,
        ProcedureState::Clearing,
        ProcedureState::Suspending,
        ProcedureState::Suspended,
        ProcedureState::Unsuspending,
        ProcedureState::Resetting,
    ];

    /// Integer code reported by the remote controller's state tag.
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn is_acting(self) -> bool {
        self.acting_target().is_some()
    }

    /// The state an acting state advances to once its work completes.
    pub fn acting_target(self) -> Option<Self> {
        use ProcedureState::*;
        match self {
            Starting => Some(Execute),
            Completing => Some(Completed),
            Holding => Some(Held),
            Unholding => Some(Execute),
            Stopping => Some(Stopped),
            Aborting => Some(Aborted),
            Clearing => Some(Stopped),
            Suspending => Some(Suspended),
            Unsuspending => Some(Execute),
            Resetting => Some(Idle),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        use ProcedureState::*;
        match self {
            Undefined => "UNDEFINED",
            Idle => "IDLE",
            Starting => "STARTING",
            Execute => "EXECUTE",
            Completing => "COMPLETING",
            Completed => "COMPLETED",
            Holding => "HOLDING",
            Held => "HELD",
            Unholding => "UNHOLDING",
            Stopping => "STOPPING",
            Stopped => "STOPPED",
            Aborting => "ABORTING",
            Aborted => "ABORTED",
            Clearing => "CLEARING",
            Suspending => "SUSPENDING",
            Suspended => "SUSPENDED",
            Unsuspending => "UNSUSPENDING",
            Resetting => "RESETTING",
        }
    }
}

impl fmt::Display for ProcedureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcedureCommand {
    Reset = 1,
    Start = 2,
    Stop = 3,
    Hold = 4,
    Unhold = 5,
    Suspend = 6,
    Unsuspend = 7,
    Abort = 8,
    Clear = 9,
}

impl ProcedureCommand {
    pub const ALL: [ProcedureCommand; 9] = [
        ProcedureCommand::Reset,
        ProcedureCommand::Start,
        ProcedureCommand::Stop,
        ProcedureCommand::Hold,
        ProcedureCommand::Unhold,
        ProcedureCommand::Suspend,
        ProcedureCommand::Unsuspend,
        ProcedureCommand::Abort,
        ProcedureCommand::Clear,
    ];

    /// Integer code written to the remote controller's command tag.
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| i64::from(c.code()) == code)
    }

    pub fn name(self) -> &'static str {
        use ProcedureCommand::*;
        match self {
            Reset => "RESET",
            Start => "START",
            Stop => "STOP",
            Hold => "HOLD",
            Unhold => "UNHOLD",
            Suspend => "SUSPEND",
            Unsuspend => "UNSUSPEND",
            Abort => "ABORT",
            Clear => "CLEAR",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for ProcedureCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The acting state a command leads to from `state`, if the command is valid there.
pub fn transition(state: ProcedureState, command: ProcedureCommand) -> Option<ProcedureState> {
    use ProcedureCommand as C;
    use ProcedureState as S;
    match (state, command) {
        (S::Aborting | S::Aborted, C::Abort) => None,
        (_, C::Abort) => Some(S::Aborting),

        (S::Idle, C::Start) => Some(S::Starting),
        (S::Execute, C::Hold) => Some(S::Holding),
        (S::Execute, C::Suspend) => Some(S::Suspending),
        (S::Held, C::Unhold) => Some(S::Unholding),
        (S::Suspended, C::Unsuspend) => Some(S::Unsuspending),
        (S::Stopped | S::Completed, C::Reset) => Some(S::Resetting),
        (S::Stopped | S::Aborted, C::Clear) => Some(S::Clearing),

        (
            S::Idle
            | S::Execute
            | S::Held
            | S::Suspended
            | S::Completed
            | S::Starting
            | S::Completing
            | S::Holding
            | S::Unholding
            | S::Suspending
            | S::Unsuspending
            | S::Resetting,
            C::Stop,
        ) => Some(S::Stopping),

        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("command {command} not valid in state {state}")]
    InvalidTransition {
        state: ProcedureState,
        command: ProcedureCommand,
    },
    #[error("state {state} is not an acting state")]
    NotActing { state: ProcedureState },
    #[error("execution can only complete from EXECUTE, current state is {state}")]
    NotExecuting { state: ProcedureState },
}

/// Outcome of an accepted command or completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ProcedureState,
    pub to: ProcedureState,
    /// Every state entered, in order, including acting states passed through.
    pub path: Vec<ProcedureState>,
}

/// Side effect run when a state is entered or left.
#[async_trait]
pub trait StateHook: Send + Sync {
    async fn run(&self, state: ProcedureState);
}

/// Which acting states advance on their own once their entry hooks finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoComplete {
    pub enabled: bool,
    pub excluded: HashSet<ProcedureState>,
}

impl Default for AutoComplete {
    fn default() -> Self {
        Self {
            enabled: true,
            excluded: HashSet::new(),
        }
    }
}

impl AutoComplete {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            excluded: HashSet::new(),
        }
    }

    pub fn applies_to(&self, state: ProcedureState) -> bool {
        self.enabled && state.is_acting() && !self.excluded.contains(&state)
    }
}

pub struct PackMlMachine {
    name: String,
    state: ProcedureState,
    entered_at: Instant,
    auto_complete: AutoComplete,
    on_enter: HashMap<ProcedureState, Vec<Arc<dyn StateHook>>>,
    on_exit: HashMap<ProcedureState, Vec<Arc<dyn StateHook>>>,
}

impl PackMlMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_initial_state(name, ProcedureState::Idle)
    }

    pub fn with_initial_state(name: impl Into<String>, initial: ProcedureState) -> Self {
        Self {
            name: name.into(),
            state: initial,
            entered_at: Instant::now(),
            auto_complete: AutoComplete::default(),
            on_enter: HashMap::new(),
            on_exit: HashMap::new(),
        }
    }

    pub fn set_auto_complete(&mut self, auto_complete: AutoComplete) {
        self.auto_complete = auto_complete;
    }

    pub fn auto_complete(&self) -> &AutoComplete {
        &self.auto_complete
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcedureState {
        self.state
    }

    /// When the current state was entered.
    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    pub fn can_accept(&self, command: ProcedureCommand) -> bool {
        transition(self.state, command).is_some()
    }

    pub fn on_enter(&mut self, state: ProcedureState, hook: Arc<dyn StateHook>) {
        self.on_enter.entry(state).or_default().push(hook);
    }

    pub fn on_exit(&mut self, state: ProcedureState, hook: Arc<dyn StateHook>) {
        self.on_exit.entry(state).or_default().push(hook);
    }

    pub async fn send_command(
        &mut self,
        command: ProcedureCommand,
    ) -> Result<Transition, TransitionError> {
        let from = self.state;
        let acting = transition(from, command).ok_or(TransitionError::InvalidTransition {
            state: from,
            command,
        })?;
        debug!("{}: {} accepted in {}", self.name, command, from);

        let mut path = Vec::new();
        self.move_to(acting, &mut path).await;
        self.settle(&mut path).await;
        Ok(Transition {
            from,
            to: self.state,
            path,
        })
    }

    /// Advance the current acting state to its target. Used when
    /// auto-completion is disabled or excluded for the state.
    pub async fn complete_acting_state(&mut self) -> Result<Transition, TransitionError> {
        let from = self.state;
        let target = from
            .acting_target()
            .ok_or(TransitionError::NotActing { state: from })?;

        let mut path = Vec::new();
        self.move_to(target, &mut path).await;
        self.settle(&mut path).await;
        Ok(Transition {
            from,
            to: self.state,
            path,
        })
    }

    /// Internal completion of the procedure: EXECUTE to COMPLETING.
    pub async fn complete_execution(&mut self) -> Result<Transition, TransitionError> {
        let from = self.state;
        if from != ProcedureState::Execute {
            return Err(TransitionError::NotExecuting { state: from });
        }

        let mut path = Vec::new();
        self.move_to(ProcedureState::Completing, &mut path).await;
        self.settle(&mut path).await;
        Ok(Transition {
            from,
            to: self.state,
            path,
        })
    }

    /// Adopt a state reported from elsewhere without running any hooks.
    pub fn resync(&mut self, state: ProcedureState) {
        if self.state != state {
            debug!("{}: resync {} -> {}", self.name, self.state, state);
            self.state = state;
            self.entered_at = Instant::now();
        }
    }

    async fn move_to(&mut self, next: ProcedureState, path: &mut Vec<ProcedureState>) {
        let exit_hooks = self.on_exit.get(&self.state).cloned().unwrap_or_default();
        for hook in exit_hooks {
            hook.run(self.state).await;
        }

        self.state = next;
        self.entered_at = Instant::now();
        path.push(next);

        let enter_hooks = self.on_enter.get(&next).cloned().unwrap_or_default();
        for hook in enter_hooks {
            hook.run(next).await;
        }
    }

    // Bounded by the number of states so a misconfigured chain cannot spin.
    async fn settle(&mut self, path: &mut Vec<ProcedureState>) {
        for _ in 0..ProcedureState::ALL.len() {
            if !self.auto_complete.applies_to(self.state) {
                break;
            }
            let Some(target) = self.state.acting_target() else {
                break;
            };
            self.move_to(target, path).await;
        }
    }
}

impl fmt::Debug for PackMlMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackMlMachine")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("auto_complete", &self.auto_complete)
            .finish()
    }
}
