//! Service Manager: one proxy per service, interlock gating, emergency stop,
//! state supervision, and comm-loss policy.

use crate::config::{seconds, CommLossAction, ProxyMode, RuntimePolicy, ServiceConfig};
use crate::error::GatewayError;
use crate::metrics;
use crate::proxy::{ProxyError, ProxyResult, ServiceProxy};
use crate::tag_manager::TagManager;
use mtp_core::{InterlockEvaluator, InterlockResult, ProcedureCommand, ProcedureState, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);

/// Commands that resume or begin activity and are therefore blocked by an
/// active interlock. ABORT and STOP are never gated.
pub fn is_interlock_gated(command: ProcedureCommand) -> bool {
    matches!(
        command,
        ProcedureCommand::Start | ProcedureCommand::Unhold | ProcedureCommand::Unsuspend
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    CommandIssued {
        service: String,
        command: ProcedureCommand,
        procedure_id: Option<u32>,
        from: ProcedureState,
    },
    CommandRejected {
        service: String,
        command: ProcedureCommand,
        reason: String,
    },
    StateChanged {
        service: String,
        from: ProcedureState,
        to: ProcedureState,
    },
    EmergencyStop {
        services: Vec<String>,
    },
    WriteDenied {
        tag: String,
        reason: String,
    },
    CommLoss {
        connector: String,
        action: CommLossAction,
    },
}

pub type ServiceListener = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmergencyStopReport {
    /// Safe-state tags whose write failed or was refused.
    pub safe_state_failures: Vec<String>,
    pub aborted: Vec<String>,
    pub abort_failures: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Observed {
    state: ProcedureState,
    since: Instant,
    timeout_fired: bool,
}

struct ManagedService {
    config: ServiceConfig,
    proxy: ServiceProxy,
    procedure_id: Mutex<Option<u32>>,
    observed: Mutex<Observed>,
    execute_started: Mutex<Option<Instant>>,
}

pub struct ServiceManager {
    services: BTreeMap<String, Arc<ManagedService>>,
    tags: Arc<TagManager>,
    interlocks: InterlockEvaluator,
    runtime: RuntimePolicy,
    listeners: RwLock<Vec<ServiceListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceManager {
    pub fn new(
        services: &[ServiceConfig],
        tags: Arc<TagManager>,
        interlocks: InterlockEvaluator,
        runtime: RuntimePolicy,
    ) -> Self {
        let services = services
            .iter()
            .map(|config| {
                let proxy = ServiceProxy::from_config(config, Arc::clone(&tags));
                let initial = if config.mode == ProxyMode::ThinProxy {
                    ProcedureState::Undefined
                } else {
                    ProcedureState::Idle
                };
                let managed = ManagedService {
                    config: config.clone(),
                    proxy,
                    procedure_id: Mutex::new(None),
                    observed: Mutex::new(Observed {
                        state: initial,
                        since: Instant::now(),
                        timeout_fired: false,
                    }),
                    execute_started: Mutex::new(None),
                };
                (config.name.clone(), Arc::new(managed))
            })
            .collect::<BTreeMap<_, _>>();
        info!(services = services.len(), "Service manager initialized");
        Self {
            services,
            tags,
            interlocks,
            runtime,
            listeners: RwLock::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn tags(&self) -> &Arc<TagManager> {
        &self.tags
    }

    pub fn interlocks(&self) -> &InterlockEvaluator {
        &self.interlocks
    }

    pub fn subscribe(&self, listener: ServiceListener) {
        self.listeners.write().push(listener);
    }

    /// Service names in sorted order.
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn service_config(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(name).map(|s| &s.config)
    }

    pub async fn service_state(&self, name: &str) -> Option<ProcedureState> {
        let service = self.services.get(name)?;
        Some(service.proxy.get_state().await)
    }

    /// Procedure selected by the last START.
    pub fn procedure_id(&self, name: &str) -> Option<u32> {
        self.services.get(name).and_then(|s| *s.procedure_id.lock())
    }

    pub fn is_service_interlocked(&self, name: &str) -> InterlockResult {
        self.interlocks
            .check_service_interlocks(name, &self.interlock_values())
    }

    pub async fn send_command(
        &self,
        name: &str,
        command: ProcedureCommand,
        procedure_id: Option<u32>,
    ) -> Result<ProxyResult, GatewayError> {
        let service = self
            .services
            .get(name)
            .ok_or_else(|| GatewayError::service_not_found(name))?;
        let from = service.proxy.get_state().await;

        if is_interlock_gated(command) {
            let interlock = self.is_service_interlocked(name);
            if interlock.interlocked {
                let reason = interlock
                    .reason
                    .unwrap_or_else(|| "Interlock active".to_string());
                warn!(service = name, command = %command, reason = %reason, "Command blocked by interlock");
                metrics::COMMANDS_INTERLOCKED.inc();
                self.emit(&ServiceEvent::CommandRejected {
                    service: name.to_string(),
                    command,
                    reason: reason.clone(),
                });
                return Err(GatewayError::Interlocked {
                    service: name.to_string(),
                    reason,
                    source_tag: interlock.source_tag,
                });
            }
        }

        let procedure_id = if command == ProcedureCommand::Start {
            let selected = procedure_id
                .or_else(|| service.config.default_procedure_id())
                .unwrap_or(0);
            *service.procedure_id.lock() = Some(selected);
            Some(selected)
        } else {
            procedure_id
        };

        info!(service = name, command = %command, from = %from, procedure_id = ?procedure_id, "Sending command");
        metrics::COMMANDS_ISSUED.inc();
        self.emit(&ServiceEvent::CommandIssued {
            service: name.to_string(),
            command,
            procedure_id,
            from,
        });

        let result = service.proxy.send_command(command, procedure_id).await;
        if result.success {
            let to = match result.to_state {
                Some(state) => state,
                None => service.proxy.get_state().await,
            };
            self.observe(service, to);
        } else {
            let reason = result
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "command failed".to_string());
            if matches!(result.error, Some(ProxyError::Transition(_))) {
                metrics::INVALID_TRANSITIONS.inc();
            }
            warn!(service = name, command = %command, reason = %reason, "Command not accepted");
            self.emit(&ServiceEvent::CommandRejected {
                service: name.to_string(),
                command,
                reason,
            });
        }
        Ok(result)
    }

    /// Write every safe-state output, then ABORT every service. Denied or
    /// failed writes are logged and do not hold back the ABORTs.
    pub async fn emergency_stop(&self) -> EmergencyStopReport {
        error!("EMERGENCY STOP");
        metrics::EMERGENCY_STOPS.inc();
        let mut report = EmergencyStopReport {
            safe_state_failures: self.apply_safe_state().await,
            ..EmergencyStopReport::default()
        };

        for name in self.services.keys() {
            match self.send_command(name, ProcedureCommand::Abort, None).await {
                Ok(result) if result.success => report.aborted.push(name.clone()),
                Ok(result) => {
                    error!(service = %name, error = ?result.error, "ABORT not accepted during emergency stop");
                    report.abort_failures.push(name.clone());
                }
                Err(e) => {
                    error!(service = %name, error = %e, "ABORT failed during emergency stop");
                    report.abort_failures.push(name.clone());
                }
            }
        }
        self.emit(&ServiceEvent::EmergencyStop {
            services: report.aborted.clone(),
        });
        report
    }

    /// Write the configured safe-state outputs in order. Returns the tags
    /// that could not be written.
    pub async fn apply_safe_state(&self) -> Vec<String> {
        let outputs: Vec<(String, Value)> = self.tags.safety().get_safe_state_values().to_vec();
        let mut failures = Vec::new();
        for (tag, value) in outputs {
            match self.tags.write_tag(&tag, value.clone()).await {
                Ok(true) => info!(tag = %tag, value = %value, "Safe state written"),
                Ok(false) => {
                    error!(tag = %tag, "Safe state write not acknowledged");
                    failures.push(tag);
                }
                Err(e) => {
                    error!(tag = %tag, error = %e, "Safe state write failed");
                    if let GatewayError::WriteDenied { reason, .. } = &e {
                        self.emit(&ServiceEvent::WriteDenied {
                            tag: tag.clone(),
                            reason: reason.clone(),
                        });
                    }
                    failures.push(tag);
                }
            }
        }
        failures
    }

    pub async fn handle_comm_loss(&self, connector: &str, action: CommLossAction) {
        error!(connector, action = ?action, "Connector communication loss detected");
        metrics::COMM_LOSS_EVENTS.inc();
        self.emit(&ServiceEvent::CommLoss {
            connector: connector.to_string(),
            action,
        });
        match action {
            CommLossAction::None => {}
            CommLossAction::SafeState => {
                self.apply_safe_state().await;
            }
            CommLossAction::AbortServices => {
                self.emergency_stop().await;
            }
        }
    }

    /// Connectors that have been unhealthy for at least the grace period and
    /// have not yet triggered. Healthy connectors are re-armed.
    pub fn detect_comm_loss(
        &self,
        now: Instant,
        monitor_started: Instant,
        triggered: &mut HashSet<String>,
    ) -> Vec<String> {
        let grace = self.runtime.grace();
        let mut lost = Vec::new();
        for connector in self.tags.connector_names() {
            let Some(health) = self.tags.connector_health(&connector) else {
                continue;
            };
            if health.is_healthy() {
                if triggered.remove(&connector) {
                    info!(connector = %connector, "Connector communication restored");
                }
                continue;
            }
            let reference = health
                .last_success
                .or(health.last_error)
                .unwrap_or(monitor_started);
            if now.saturating_duration_since(reference) >= grace
                && triggered.insert(connector.clone())
            {
                lost.push(connector);
            }
        }
        lost
    }

    /// One supervision step for a service: state-change notification,
    /// acting-state conditions, per-state timeouts, and execution completion.
    pub async fn supervise(&self, name: &str) {
        let Some(service) = self.services.get(name) else {
            return;
        };
        let state = service.proxy.get_state().await;
        if state != ProcedureState::Undefined {
            self.observe(service, state);
        }

        let Some(machine) = service.proxy.local_machine() else {
            return;
        };
        let config = &service.config;
        let local = machine.state().await;

        if local.is_acting() {
            if let Some(condition) = config.acting_state_conditions.get(&local) {
                let value = self.current_value(&condition.tag);
                if condition.is_met(value.as_ref()) {
                    debug!(service = name, state = %local, "Acting state condition met");
                    self.complete_local(service, machine.complete_acting_state().await);
                    return;
                }
            } else if config.mode == ProxyMode::ThickProxy
                && config.timeouts.auto_complete_acting_states
            {
                self.complete_local(service, machine.complete_acting_state().await);
                return;
            }
        }

        if let Some(command) = self.expired_timeout(service) {
            warn!(service = name, state = %state, command = %command, "State timeout expired");
            if let Err(e) = self.send_command(name, command, None).await {
                warn!(service = name, error = %e, "Timeout action failed");
            }
            return;
        }

        if local == ProcedureState::Execute {
            let completion = &config.completion;
            let condition_met = completion
                .condition
                .as_ref()
                .is_some_and(|c| c.is_met(self.current_value(&c.tag).as_ref()));
            if completion.self_completing || condition_met {
                info!(service = name, "Execution complete");
                self.complete_local(service, machine.complete_execution().await);
                return;
            }
            let started = *service.execute_started.lock();
            if let (Some(limit), Some(started)) = (completion.timeout_s, started) {
                if started.elapsed() >= seconds(limit) {
                    warn!(service = name, timeout_s = limit, "Completion timeout, aborting");
                    *service.execute_started.lock() = None;
                    if let Err(e) = self.send_command(name, ProcedureCommand::Abort, None).await {
                        warn!(service = name, error = %e, "Completion timeout abort failed");
                    }
                }
            }
        }
    }

    /// Spawn a supervisor per service and the comm-loss monitor.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        for name in self.service_names() {
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SUPERVISE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    manager.supervise(&name).await;
                }
            }));
        }

        let manager = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let started = Instant::now();
            let mut triggered = HashSet::new();
            let mut ticker = tokio::time::interval(manager.runtime.monitor_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let lost = manager.detect_comm_loss(Instant::now(), started, &mut triggered);
                for connector in lost {
                    manager
                        .handle_comm_loss(&connector, manager.runtime.comm_loss_action)
                        .await;
                }
            }
        }));
        info!(tasks = tasks.len(), "Service supervision started");
    }

    pub async fn stop(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    fn interlock_values(&self) -> HashMap<String, Value> {
        self.tags.values_for(self.interlocks.source_tags())
    }

    fn current_value(&self, tag: &str) -> Option<Value> {
        self.tags.get_value(tag)?.value().cloned()
    }

    fn complete_local(
        &self,
        service: &ManagedService,
        result: Result<mtp_core::Transition, mtp_core::TransitionError>,
    ) {
        match result {
            Ok(transition) => self.observe(service, transition.to),
            Err(e) => debug!(service = %service.config.name, error = %e, "Local completion skipped"),
        }
    }

    /// Next command if the observed state has outlived its configured timeout.
    fn expired_timeout(&self, service: &ManagedService) -> Option<ProcedureCommand> {
        let timeouts = &service.config.timeouts;
        let mut observed = service.observed.lock();
        let limit = *timeouts.timeouts.get(&observed.state)?;
        if observed.timeout_fired
            || observed.since.elapsed() < seconds(limit)
        {
            return None;
        }
        observed.timeout_fired = true;
        timeouts.on_timeout.command()
    }

    fn observe(&self, service: &ManagedService, to: ProcedureState) {
        let from = {
            let mut observed = service.observed.lock();
            if observed.state == to {
                return;
            }
            let from = observed.state;
            *observed = Observed {
                state: to,
                since: Instant::now(),
                timeout_fired: false,
            };
            from
        };
        {
            let mut started = service.execute_started.lock();
            *started = (to == ProcedureState::Execute).then(Instant::now);
        }
        metrics::SERVICE_STATE
            .with_label_values(&[service.config.name.as_str()])
            .set(i64::from(to.code()));
        info!(service = %service.config.name, from = %from, to = %to, "Service state changed");
        self.emit(&ServiceEvent::StateChanged {
            service: service.config.name.clone(),
            from,
            to,
        });
    }

    fn emit(&self, event: &ServiceEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(event);
        }
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("services", &self.service_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompletionConfig, ConditionConfig, ProcedureConfig, WriteAction};
    use crate::connector::ConnectorPort;
    use crate::sim::SimulatedConnector;
    use crate::tag_manager::ConnectorBinding;
    use mtp_core::{
        ComparisonOperator, DataType, InterlockBinding, InterlockPolicy, SafetyController,
        TagDefinition,
    };

    struct Rig {
        sim: Arc<SimulatedConnector>,
        manager: ServiceManager,
        events: Arc<Mutex<Vec<ServiceEvent>>>,
    }

    async fn rig(services: Vec<ServiceConfig>, runtime: RuntimePolicy) -> Rig {
        let sim = SimulatedConnector::shared("plc");
        let tags = vec![
            TagDefinition::new("Pump.CommandOp", "plc", "40001", DataType::Uint16).allow_writes(),
            TagDefinition::new("Pump.StateCur", "plc", "40002", DataType::Uint16),
            TagDefinition::new("Tank.High", "plc", "10001", DataType::Bool),
            TagDefinition::new("Tank.Level", "plc", "30001", DataType::Float32),
            TagDefinition::new("Heater.On", "plc", "00001", DataType::Bool).allow_writes(),
        ];
        let safety = SafetyController::new(
            vec!["Pump.CommandOp".to_string(), "Heater.On".to_string()],
            vec![("Heater.On".to_string(), Value::Bool(false))],
            None,
        );
        let tag_manager = Arc::new(
            TagManager::new(
                tags,
                vec![ConnectorBinding::new(sim.clone(), Duration::from_millis(100))],
                Arc::new(safety),
            )
            .unwrap(),
        );
        sim.connect().await.unwrap();
        let interlocks = InterlockEvaluator::new(
            vec![InterlockBinding::new(
                "Pump:TankHigh",
                "Tank.High",
                ComparisonOperator::Eq,
                Value::Bool(true),
            )],
            InterlockPolicy::FailOpen,
        );
        let manager = ServiceManager::new(&services, tag_manager, interlocks, runtime);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        manager.subscribe(Arc::new(move |event: &ServiceEvent| sink.lock().push(event.clone())));
        Rig {
            sim,
            manager,
            events,
        }
    }

    fn thin_pump() -> ServiceConfig {
        let mut config = ServiceConfig::new("Pump", ProxyMode::ThinProxy);
        config.command_op_tag = Some("Pump.CommandOp".to_string());
        config.state_cur_tag = Some("Pump.StateCur".to_string());
        config
    }

    fn thick_heater() -> ServiceConfig {
        let mut config = ServiceConfig::new("Heater", ProxyMode::ThickProxy);
        config.procedures = vec![
            ProcedureConfig {
                id: 1,
                name: "Warm".to_string(),
                is_default: false,
            },
            ProcedureConfig {
                id: 4,
                name: "Boil".to_string(),
                is_default: true,
            },
        ];
        config.state_hooks.on_execute = vec![WriteAction {
            tag: "Heater.On".to_string(),
            value: Value::Bool(true),
        }];
        config
    }

    #[tokio::test]
    async fn interlock_blocks_start_but_not_abort() {
        let rig = rig(vec![thin_pump()], RuntimePolicy::default()).await;
        rig.sim.set_value("10001", true);
        rig.manager.tags().poll_connector("plc").await.unwrap();

        let err = rig
            .manager
            .send_command("Pump", ProcedureCommand::Start, None)
            .await
            .unwrap_err();
        match err {
            GatewayError::Interlocked {
                service,
                source_tag,
                ..
            } => {
                assert_eq!(service, "Pump");
                assert_eq!(source_tag.as_deref(), Some("Tank.High"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rig.sim.writes().is_empty());

        let result = rig
            .manager
            .send_command("Pump", ProcedureCommand::Abort, None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(rig.sim.writes(), vec![("40001".to_string(), Value::Int(8))]);
        assert!(rig.events.lock().iter().any(|e| matches!(
            e,
            ServiceEvent::CommandRejected { command: ProcedureCommand::Start, .. }
        )));
    }

    #[tokio::test]
    async fn clear_interlock_lets_start_through() {
        let rig = rig(vec![thin_pump()], RuntimePolicy::default()).await;
        rig.sim.set_value("10001", false);
        rig.manager.tags().poll_connector("plc").await.unwrap();
        assert!(!rig.manager.is_service_interlocked("Pump").interlocked);

        let result = rig
            .manager
            .send_command("Pump", ProcedureCommand::Start, None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.to_state, None);
        assert_eq!(rig.manager.procedure_id("Pump"), Some(0));
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let rig = rig(vec![thin_pump()], RuntimePolicy::default()).await;
        let err = rig
            .manager
            .send_command("Nope", ProcedureCommand::Start, None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Service 'Nope' not found");
    }

    #[tokio::test]
    async fn start_selects_default_procedure_and_reports_transition() {
        let rig = rig(vec![thick_heater()], RuntimePolicy::default()).await;
        let result = rig
            .manager
            .send_command("Heater", ProcedureCommand::Start, None)
            .await
            .unwrap();
        assert_eq!(result.to_state, Some(ProcedureState::Execute));
        assert_eq!(rig.manager.procedure_id("Heater"), Some(4));
        assert_eq!(rig.sim.value("00001"), Some(Value::Bool(true)));
        assert!(rig.events.lock().contains(&ServiceEvent::StateChanged {
            service: "Heater".to_string(),
            from: ProcedureState::Idle,
            to: ProcedureState::Execute,
        }));

        let result = rig
            .manager
            .send_command("Heater", ProcedureCommand::Start, Some(1))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(rig.manager.procedure_id("Heater"), Some(1));
    }

    #[tokio::test]
    async fn emergency_stop_writes_safe_state_and_aborts_everything() {
        let rig = rig(vec![thin_pump(), thick_heater()], RuntimePolicy::default()).await;
        rig.manager
            .send_command("Heater", ProcedureCommand::Start, None)
            .await
            .unwrap();

        let report = rig.manager.emergency_stop().await;
        assert!(report.safe_state_failures.is_empty());
        assert_eq!(report.aborted, vec!["Heater".to_string(), "Pump".to_string()]);
        assert_eq!(rig.sim.value("00001"), Some(Value::Bool(false)));
        assert_eq!(rig.sim.value("40001"), Some(Value::Int(8)));
        assert_eq!(
            rig.manager.service_state("Heater").await,
            Some(ProcedureState::Aborted)
        );
    }

    #[tokio::test]
    async fn supervisor_completes_execution_on_condition() {
        let mut heater = thick_heater();
        heater.completion = CompletionConfig {
            self_completing: false,
            condition: Some(ConditionConfig {
                tag: "Tank.Level".to_string(),
                op: ComparisonOperator::Ge,
                reference: Value::Float(80.0),
            }),
            timeout_s: None,
        };
        let rig = rig(vec![heater], RuntimePolicy::default()).await;
        rig.manager
            .send_command("Heater", ProcedureCommand::Start, None)
            .await
            .unwrap();

        rig.sim.set_value("30001", 50.0);
        rig.manager.tags().poll_connector("plc").await.unwrap();
        rig.manager.supervise("Heater").await;
        assert_eq!(
            rig.manager.service_state("Heater").await,
            Some(ProcedureState::Execute)
        );

        rig.sim.set_value("30001", 85.0);
        rig.manager.tags().poll_connector("plc").await.unwrap();
        rig.manager.supervise("Heater").await;
        assert_eq!(
            rig.manager.service_state("Heater").await,
            Some(ProcedureState::Completed)
        );
    }

    #[tokio::test]
    async fn supervisor_advances_acting_state_when_condition_met() {
        let mut heater = thick_heater();
        heater.acting_state_conditions.insert(
            ProcedureState::Starting,
            ConditionConfig {
                tag: "Tank.Level".to_string(),
                op: ComparisonOperator::Gt,
                reference: Value::Float(10.0),
            },
        );
        let rig = rig(vec![heater], RuntimePolicy::default()).await;
        let result = rig
            .manager
            .send_command("Heater", ProcedureCommand::Start, None)
            .await
            .unwrap();
        assert_eq!(result.to_state, Some(ProcedureState::Starting));

        rig.sim.set_value("30001", 20.0);
        rig.manager.tags().poll_connector("plc").await.unwrap();
        rig.manager.supervise("Heater").await;
        assert_eq!(
            rig.manager.service_state("Heater").await,
            Some(ProcedureState::Execute)
        );
    }

    #[tokio::test]
    async fn state_timeout_issues_configured_command() {
        let mut heater = thick_heater();
        heater.timeouts.timeouts.insert(ProcedureState::Execute, 0.0);
        let rig = rig(vec![heater], RuntimePolicy::default()).await;
        rig.manager
            .send_command("Heater", ProcedureCommand::Start, None)
            .await
            .unwrap();

        rig.manager.supervise("Heater").await;
        assert_eq!(
            rig.manager.service_state("Heater").await,
            Some(ProcedureState::Aborted)
        );
    }

    #[tokio::test]
    async fn thin_state_changes_are_reported() {
        let rig = rig(vec![thin_pump()], RuntimePolicy::default()).await;
        rig.sim.set_value("40002", 3);
        rig.manager.tags().poll_connector("plc").await.unwrap();
        rig.manager.supervise("Pump").await;
        assert!(rig.events.lock().contains(&ServiceEvent::StateChanged {
            service: "Pump".to_string(),
            from: ProcedureState::Undefined,
            to: ProcedureState::Execute,
        }));
    }

    #[tokio::test]
    async fn comm_loss_triggers_once_and_rearms() {
        let runtime = RuntimePolicy {
            comm_loss_action: CommLossAction::SafeState,
            comm_loss_grace_s: 0.0,
            comm_monitor_interval_ms: 100,
        };
        let rig = rig(vec![thin_pump()], runtime).await;
        let started = Instant::now();
        let mut triggered = HashSet::new();
        assert!(rig
            .manager
            .detect_comm_loss(Instant::now(), started, &mut triggered)
            .is_empty());

        rig.sim.set_link_down(true);
        rig.manager.tags().poll_connector("plc").await.unwrap();
        let lost = rig
            .manager
            .detect_comm_loss(Instant::now(), started, &mut triggered);
        assert_eq!(lost, vec!["plc".to_string()]);
        assert!(rig
            .manager
            .detect_comm_loss(Instant::now(), started, &mut triggered)
            .is_empty());

        rig.sim.set_link_down(false);
        rig.manager.tags().poll_connector("plc").await.unwrap();
        assert!(rig
            .manager
            .detect_comm_loss(Instant::now(), started, &mut triggered)
            .is_empty());
        assert!(triggered.is_empty());
    }

    #[tokio::test]
    async fn grace_period_delays_comm_loss() {
        let runtime = RuntimePolicy {
            comm_loss_action: CommLossAction::AbortServices,
            comm_loss_grace_s: 30.0,
            comm_monitor_interval_ms: 100,
        };
        let rig = rig(vec![thin_pump()], runtime).await;
        let started = Instant::now();
        let mut triggered = HashSet::new();
        rig.sim.set_link_down(true);
        rig.manager.tags().poll_connector("plc").await.unwrap();

        assert!(rig
            .manager
            .detect_comm_loss(Instant::now(), started, &mut triggered)
            .is_empty());
        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(
            rig.manager.detect_comm_loss(later, started, &mut triggered),
            vec!["plc".to_string()]
        );
    }

    #[tokio::test]
    async fn comm_loss_safe_state_writes_outputs() {
        let rig = rig(vec![thin_pump()], RuntimePolicy::default()).await;
        rig.sim.set_value("00001", true);
        rig.manager
            .handle_comm_loss("plc", CommLossAction::SafeState)
            .await;
        assert_eq!(rig.sim.value("00001"), Some(Value::Bool(false)));
        assert!(rig.events.lock().contains(&ServiceEvent::CommLoss {
            connector: "plc".to_string(),
            action: CommLossAction::SafeState,
        }));
    }
}
