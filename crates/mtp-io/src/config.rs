//! Gateway configuration document: YAML schema, loading, and validation.

use crate::connector::ConnectorPort;
use crate::modbus::{ModbusTcpConfig, ModbusTcpConnector};
use crate::sim::SimulatedConnector;
use crate::tag_manager::ConnectorBinding;
use mtp_core::{
    ComparisonOperator, InterlockBinding, InterlockEvaluator, InterlockPolicy, ProcedureCommand,
    ProcedureState, RateLimiter, SafetyController, TagDefinition, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayInfo {
    #[serde(default = "default_gateway_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
}

impl Default for GatewayInfo {
    fn default() -> Self {
        Self {
            name: default_gateway_name(),
            version: default_version(),
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommLossAction {
    #[default]
    None,
    SafeState,
    AbortServices,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimePolicy {
    #[serde(default)]
    pub comm_loss_action: CommLossAction,
    #[serde(default = "default_grace_s")]
    pub comm_loss_grace_s: f64,
    #[serde(default = "default_monitor_interval_ms")]
    pub comm_monitor_interval_ms: u64,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            comm_loss_action: CommLossAction::None,
            comm_loss_grace_s: default_grace_s(),
            comm_monitor_interval_ms: default_monitor_interval_ms(),
        }
    }
}

impl RuntimePolicy {
    pub fn grace(&self) -> Duration {
        seconds(self.comm_loss_grace_s)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.comm_monitor_interval_ms.max(10))
    }
}

/// Seconds from configuration as a `Duration`. Values too large to
/// represent saturate instead of panicking.
pub(crate) fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

fn is_valid_seconds(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    ModbusTcp,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ConnectorKind,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// One tag write performed by a state hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteAction {
    pub tag: String,
    pub value: Value,
}

/// `tag <op> ref`, evaluated against a tag's current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionConfig {
    pub tag: String,
    pub op: ComparisonOperator,
    #[serde(rename = "ref")]
    pub reference: Value,
}

impl ConditionConfig {
    /// A missing value or an incomparable pair is not met.
    pub fn is_met(&self, value: Option<&Value>) -> bool {
        value.is_some_and(|v| self.op.evaluate(v, &self.reference).unwrap_or(false))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateHooksConfig {
    #[serde(default)]
    pub on_idle: Vec<WriteAction>,
    #[serde(default)]
    pub on_starting: Vec<WriteAction>,
    #[serde(default)]
    pub on_execute: Vec<WriteAction>,
    #[serde(default)]
    pub on_completing: Vec<WriteAction>,
    #[serde(default)]
    pub on_completed: Vec<WriteAction>,
    #[serde(default)]
    pub on_holding: Vec<WriteAction>,
    #[serde(default)]
    pub on_held: Vec<WriteAction>,
    #[serde(default)]
    pub on_unholding: Vec<WriteAction>,
    #[serde(default)]
    pub on_stopping: Vec<WriteAction>,
    #[serde(default)]
    pub on_stopped: Vec<WriteAction>,
    #[serde(default)]
    pub on_aborting: Vec<WriteAction>,
    #[serde(default)]
    pub on_aborted: Vec<WriteAction>,
    #[serde(default)]
    pub on_clearing: Vec<WriteAction>,
    #[serde(default)]
    pub on_suspending: Vec<WriteAction>,
    #[serde(default)]
    pub on_suspended: Vec<WriteAction>,
    #[serde(default)]
    pub on_unsuspending: Vec<WriteAction>,
    #[serde(default)]
    pub on_resetting: Vec<WriteAction>,
}

impl StateHooksConfig {
    /// Non-empty hook lists keyed by the state they run on.
    pub fn by_state(&self) -> Vec<(ProcedureState, &[WriteAction])> {
        use ProcedureState::*;
        [
            (Idle, &self.on_idle),
            (Starting, &self.on_starting),
            (Execute, &self.on_execute),
            (Completing, &self.on_completing),
            (Completed, &self.on_completed),
            (Holding, &self.on_holding),
            (Held, &self.on_held),
            (Unholding, &self.on_unholding),
            (Stopping, &self.on_stopping),
            (Stopped, &self.on_stopped),
            (Aborting, &self.on_aborting),
            (Aborted, &self.on_aborted),
            (Clearing, &self.on_clearing),
            (Suspending, &self.on_suspending),
            (Suspended, &self.on_suspended),
            (Unsuspending, &self.on_unsuspending),
            (Resetting, &self.on_resetting),
        ]
        .into_iter()
        .filter(|(_, actions)| !actions.is_empty())
        .map(|(state, actions)| (state, actions.as_slice()))
        .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionConfig {
    #[serde(default)]
    pub self_completing: bool,
    #[serde(default)]
    pub condition: Option<ConditionConfig>,
    #[serde(default)]
    pub timeout_s: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    None,
    #[default]
    Abort,
    Stop,
    Hold,
}

impl TimeoutAction {
    pub fn command(self) -> Option<ProcedureCommand> {
        match self {
            TimeoutAction::None => None,
            TimeoutAction::Abort => Some(ProcedureCommand::Abort),
            TimeoutAction::Stop => Some(ProcedureCommand::Stop),
            TimeoutAction::Hold => Some(ProcedureCommand::Hold),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateTimeoutsConfig {
    #[serde(default = "default_true")]
    pub auto_complete_acting_states: bool,
    #[serde(default)]
    pub timeouts: BTreeMap<ProcedureState, f64>,
    #[serde(default)]
    pub on_timeout: TimeoutAction,
}

impl Default for StateTimeoutsConfig {
    fn default() -> Self {
        Self {
            auto_complete_acting_states: true,
            timeouts: BTreeMap::new(),
            on_timeout: TimeoutAction::Abort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    #[default]
    ThinProxy,
    ThickProxy,
    Hybrid,
}

impl ProxyMode {
    pub fn has_local_machine(self) -> bool {
        !matches!(self, ProxyMode::ThinProxy)
    }

    pub fn has_remote_state(self) -> bool {
        !matches!(self, ProxyMode::ThickProxy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcedureConfig {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub mode: ProxyMode,
    #[serde(default)]
    pub procedures: Vec<ProcedureConfig>,
    #[serde(default)]
    pub state_hooks: StateHooksConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub timeouts: StateTimeoutsConfig,
    #[serde(default)]
    pub acting_state_conditions: BTreeMap<ProcedureState, ConditionConfig>,
    #[serde(default)]
    pub state_cur_tag: Option<String>,
    #[serde(default)]
    pub command_op_tag: Option<String>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, mode: ProxyMode) -> Self {
        Self {
            name: name.into(),
            mode,
            procedures: Vec::new(),
            state_hooks: StateHooksConfig::default(),
            completion: CompletionConfig::default(),
            timeouts: StateTimeoutsConfig::default(),
            acting_state_conditions: BTreeMap::new(),
            state_cur_tag: None,
            command_op_tag: None,
        }
    }

    pub fn default_procedure_id(&self) -> Option<u32> {
        self.procedures.iter().find(|p| p.is_default).map(|p| p.id)
    }

    /// Every tag the service reads or writes.
    pub fn referenced_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self
            .state_hooks
            .by_state()
            .into_iter()
            .flat_map(|(_, actions)| actions.iter().map(|a| a.tag.as_str()))
            .collect();
        tags.extend(self.completion.condition.iter().map(|c| c.tag.as_str()));
        tags.extend(self.acting_state_conditions.values().map(|c| c.tag.as_str()));
        tags.extend(self.state_cur_tag.as_deref());
        tags.extend(self.command_op_tag.as_deref());
        tags
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SafeStateOutput {
    pub tag: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SafetyConfig {
    #[serde(default)]
    pub write_allowlist: Vec<String>,
    #[serde(default)]
    pub safe_state_outputs: Vec<SafeStateOutput>,
    #[serde(default = "default_rate_limit")]
    pub command_rate_limit: String,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            write_allowlist: Vec::new(),
            safe_state_outputs: Vec::new(),
            command_rate_limit: default_rate_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewayInfo,
    #[serde(default)]
    pub runtime: RuntimePolicy,
    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,
    #[serde(default)]
    pub tags: Vec<TagDefinition>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub interlocks: Vec<InterlockBinding>,
    #[serde(default)]
    pub interlock_policy: InterlockPolicy,
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl GatewayConfig {
    /// Load, expand `${VAR}` references, merge the override, and validate.
    pub fn load(path: &Path, override_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut document = read_document(path)?;
        if let Some(override_path) = override_path {
            deep_merge(&mut document, read_document(override_path)?);
        }
        Self::from_document(document, &path.display().to_string())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let document = parse_document(yaml, "<inline>")?;
        Self::from_document(document, "<inline>")
    }

    fn from_document(mut document: serde_yaml::Value, origin: &str) -> Result<Self, ConfigError> {
        expand_env_in(&mut document);
        let config: GatewayConfig =
            serde_yaml::from_value(document).map_err(|source| ConfigError::Parse {
                origin: origin.to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject anything that would leave a reference dangling at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if !is_valid_seconds(self.runtime.comm_loss_grace_s) {
            problems.push(format!(
                "runtime comm_loss_grace_s {} must be a finite, non-negative number",
                self.runtime.comm_loss_grace_s
            ));
        }

        let mut connector_names = HashSet::new();
        for connector in &self.connectors {
            if !connector_names.insert(connector.name.as_str()) {
                problems.push(format!("duplicate connector '{}'", connector.name));
            }
            if !(10..=60_000).contains(&connector.poll_interval_ms) {
                problems.push(format!(
                    "connector '{}' poll_interval_ms {} outside 10..=60000",
                    connector.name, connector.poll_interval_ms
                ));
            }
            if connector.kind == ConnectorKind::ModbusTcp && connector.host.trim().is_empty() {
                problems.push(format!("connector '{}' requires a host", connector.name));
            }
        }

        let mut tag_names = HashSet::new();
        for tag in &self.tags {
            if !tag_names.insert(tag.name.as_str()) {
                problems.push(format!("duplicate tag '{}'", tag.name));
            }
            if !connector_names.contains(tag.connector.as_str()) {
                problems.push(format!(
                    "Tag '{}' references unknown connector '{}'",
                    tag.name, tag.connector
                ));
            }
            if tag.address.trim().is_empty() {
                problems.push(format!("tag '{}' has an empty address", tag.name));
            }
            if tag.writable && tag.scale.is_some_and(|s| s.gain == 0.0) {
                problems.push(format!(
                    "writable tag '{}' has a zero-gain scale and cannot be reverse scaled",
                    tag.name
                ));
            }
        }

        let mut service_names = HashSet::new();
        for service in &self.services {
            if !service_names.insert(service.name.as_str()) {
                problems.push(format!("duplicate service '{}'", service.name));
            }
            for tag in service.referenced_tags() {
                if !tag_names.contains(tag) {
                    problems.push(format!(
                        "Service '{}' references unknown tag '{}'",
                        service.name, tag
                    ));
                }
            }
            if service.procedures.iter().filter(|p| p.is_default).count() > 1 {
                problems.push(format!(
                    "service '{}' declares more than one default procedure",
                    service.name
                ));
            }
            if let Some(timeout) = service.completion.timeout_s {
                if !is_valid_seconds(timeout) {
                    problems.push(format!(
                        "service '{}' completion timeout_s {} must be a finite, non-negative number",
                        service.name, timeout
                    ));
                }
            }
            for (state, timeout) in &service.timeouts.timeouts {
                if !is_valid_seconds(*timeout) {
                    problems.push(format!(
                        "service '{}' timeout for {} is {}; must be a finite, non-negative number",
                        service.name, state, timeout
                    ));
                }
            }
            for state in service.acting_state_conditions.keys() {
                if !state.is_acting() {
                    problems.push(format!(
                        "service '{}' acting condition on non-acting state {}",
                        service.name, state
                    ));
                }
            }
        }

        for binding in &self.interlocks {
            if !tag_names.contains(binding.source_tag.as_str()) {
                problems.push(format!(
                    "interlock '{}' references unknown tag '{}'",
                    binding.element, binding.source_tag
                ));
            }
        }

        for tag in &self.safety.write_allowlist {
            if !tag_names.contains(tag.as_str()) {
                problems.push(format!("Write allowlist references unknown tag '{tag}'"));
            }
        }
        for output in &self.safety.safe_state_outputs {
            if !self.safety.write_allowlist.contains(&output.tag) {
                problems.push(format!(
                    "Safe state output '{}' must be included in write allowlist",
                    output.tag
                ));
            }
        }
        if let Err(e) = RateLimiter::from_rate_string(&self.safety.command_rate_limit) {
            problems.push(e.to_string());
        }

        for warning in self.warnings() {
            warn!("{}", warning);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Accepted but suspicious settings.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for service in self.services.iter().filter(|s| s.mode.has_remote_state()) {
            if service.command_op_tag.is_none() {
                warnings.push(format!(
                    "service '{}' has no command_op_tag; commands will fail",
                    service.name
                ));
            }
            if service.state_cur_tag.is_none() {
                warnings.push(format!(
                    "service '{}' has no state_cur_tag; remote state reads as UNDEFINED",
                    service.name
                ));
            }
        }
        warnings
    }

    pub fn safety_controller(&self) -> Result<SafetyController, ConfigError> {
        let limiter = RateLimiter::from_rate_string(&self.safety.command_rate_limit)
            .map_err(|e| ConfigError::Invalid(vec![e.to_string()]))?;
        Ok(SafetyController::new(
            self.safety.write_allowlist.iter().cloned(),
            self.safety
                .safe_state_outputs
                .iter()
                .map(|o| (o.tag.clone(), o.value.clone()))
                .collect(),
            Some(limiter),
        ))
    }

    pub fn interlock_evaluator(&self) -> InterlockEvaluator {
        InterlockEvaluator::new(self.interlocks.clone(), self.interlock_policy)
    }

    /// Instantiate connectors. With `simulate`, every connector is replaced
    /// by a simulated one seeded with zero values for its tags.
    pub fn connector_bindings(&self, simulate: bool) -> Vec<ConnectorBinding> {
        self.connectors
            .iter()
            .map(|connector| {
                let port: Arc<dyn ConnectorPort> =
                    if simulate || connector.kind == ConnectorKind::Simulated {
                        let sim = SimulatedConnector::new(connector.name.clone());
                        sim.seed_defaults(self.tags.iter().filter(|t| t.connector == connector.name));
                        Arc::new(sim)
                    } else {
                        Arc::new(ModbusTcpConnector::new(ModbusTcpConfig {
                            name: connector.name.clone(),
                            host: connector.host.clone(),
                            port: connector.port,
                            unit_id: connector.unit_id,
                            timeout: Duration::from_millis(connector.timeout_ms),
                        }))
                    };
                ConnectorBinding::new(port, Duration::from_millis(connector.poll_interval_ms))
            })
            .collect()
    }
}

fn read_document(path: &Path) -> Result<serde_yaml::Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_document(&text, &path.display().to_string())
}

fn parse_document(text: &str, origin: &str) -> Result<serde_yaml::Value, ConfigError> {
    serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
        origin: origin.to_string(),
        source,
    })
}

/// Overlay mappings key by key; any other overlay value replaces the base.
pub fn deep_merge(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn expand_env_in(value: &mut serde_yaml::Value) {
    match value {
        serde_yaml::Value::String(s) => {
            if !s.contains("${") {
                return;
            }
            let whole = is_single_placeholder(s);
            let expanded = expand_env(s);
            // A lone placeholder takes the type of what it expands to.
            if whole {
                if let Ok(scalar) = serde_yaml::from_str::<serde_yaml::Value>(&expanded) {
                    if !matches!(
                        scalar,
                        serde_yaml::Value::Mapping(_) | serde_yaml::Value::Sequence(_)
                    ) {
                        *value = scalar;
                        return;
                    }
                }
            }
            *s = expanded;
        }
        serde_yaml::Value::Sequence(items) => items.iter_mut().for_each(expand_env_in),
        serde_yaml::Value::Mapping(map) => map.values_mut().for_each(expand_env_in),
        _ => {}
    }
}

fn is_single_placeholder(s: &str) -> bool {
    s.starts_with("${") && s.ends_with('}') && s.matches("${").count() == 1
}

/// Expand `${VAR}` and `${VAR:-default}`. An undefined variable without a
/// default is left as written.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let expr = &after[..end];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };
        match (std::env::var(name), default) {
            (Ok(value), _) => out.push_str(&value),
            (Err(_), Some(default)) => out.push_str(default),
            (Err(_), None) => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn default_gateway_name() -> String {
    "mtp-gateway".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_grace_s() -> f64 {
    5.0
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

fn default_modbus_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_rate_limit() -> String {
    "10/s".to_string()
}

fn default_true() -> bool {
    true
}
