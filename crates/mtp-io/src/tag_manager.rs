//! Tag Manager: owns every tag's live state, polls connectors, and gates writes.
//!
//! The tag map is fixed at construction. Each tag carries its own state lock
//! and an I/O lock; a poll holds the I/O locks of its connector's tags for the
//! duration of the batched read, a write holds the one tag's lock for the
//! write and its read-back. A tag's subscribers run once its I/O lock is
//! released, and a poll announces each tag before recording the next.

use crate::connector::{ConnectorHealth, ConnectorPort};
use crate::error::GatewayError;
use crate::metrics;
use mtp_core::{
    tags::notify, Quality, SafetyController, SubscriptionId, TagDefinition, TagState,
    TagSubscriber, TagValue, Value,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A connector together with its polling interval.
#[derive(Clone)]
pub struct ConnectorBinding {
    pub port: Arc<dyn ConnectorPort>,
    pub poll_interval: Duration,
}

impl ConnectorBinding {
    pub fn new(port: Arc<dyn ConnectorPort>, poll_interval: Duration) -> Self {
        Self {
            port,
            poll_interval,
        }
    }
}

struct TagEntry {
    definition: Arc<TagDefinition>,
    state: RwLock<TagState>,
    io: tokio::sync::Mutex<()>,
}

impl TagEntry {
    fn new(definition: Arc<TagDefinition>) -> Self {
        Self {
            state: RwLock::new(TagState::new(Arc::clone(&definition))),
            definition,
            io: tokio::sync::Mutex::new(()),
        }
    }

    fn previous_value(&self) -> Option<Value> {
        self.state
            .read()
            .current_value()
            .and_then(|v| v.value().cloned())
    }

    fn record(&self, value: TagValue) -> Vec<TagSubscriber> {
        if !value.quality().is_good() {
            metrics::TAG_READ_ERRORS.inc();
        }
        self.state.write().record(value)
    }
}

struct PollGroup {
    port: Arc<dyn ConnectorPort>,
    interval: Duration,
    entries: Vec<Arc<TagEntry>>,
    polled: AtomicBool,
}

/// Point-in-time copy of a tag's state.
#[derive(Debug, Clone)]
pub struct TagSnapshot {
    pub definition: Arc<TagDefinition>,
    pub current_value: Option<TagValue>,
    pub last_good_value: Option<TagValue>,
    pub quality: Quality,
    pub read_count: u64,
    pub error_count: u64,
    pub write_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagStatistics {
    pub total_tags: usize,
    pub total_reads: u64,
    pub total_writes: u64,
    pub total_errors: u64,
    pub good_quality_count: usize,
    pub bad_quality_count: usize,
    pub connectors: Vec<String>,
}

/// Handle returned by [`TagManager::subscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    ids: Vec<(String, SubscriptionId)>,
}

type Notification = (Vec<TagSubscriber>, Arc<TagDefinition>, TagValue);

pub struct TagManager {
    tags: HashMap<String, Arc<TagEntry>>,
    order: Vec<String>,
    groups: Vec<PollGroup>,
    safety: Arc<SafetyController>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TagManager {
    /// Build the tag map. Tags are grouped per connector in definition order.
    pub fn new(
        definitions: Vec<TagDefinition>,
        connectors: Vec<ConnectorBinding>,
        safety: Arc<SafetyController>,
    ) -> Result<Self, GatewayError> {
        let mut groups: Vec<PollGroup> = connectors
            .into_iter()
            .map(|binding| PollGroup {
                port: binding.port,
                interval: binding.poll_interval,
                entries: Vec::new(),
                polled: AtomicBool::new(false),
            })
            .collect();

        let mut tags = HashMap::with_capacity(definitions.len());
        let mut order = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if tags.contains_key(&definition.name) {
                return Err(GatewayError::Configuration(format!(
                    "duplicate tag '{}'",
                    definition.name
                )));
            }
            let group = groups
                .iter_mut()
                .find(|g| g.port.name() == definition.connector)
                .ok_or_else(|| {
                    GatewayError::Configuration(format!(
                        "tag '{}' references unknown connector '{}'",
                        definition.name, definition.connector
                    ))
                })?;
            let entry = Arc::new(TagEntry::new(Arc::new(definition)));
            group.entries.push(Arc::clone(&entry));
            order.push(entry.definition.name.clone());
            tags.insert(entry.definition.name.clone(), entry);
        }

        info!(
            total_tags = tags.len(),
            connectors = groups.len(),
            "Tag manager initialized"
        );
        Ok(Self {
            tags,
            order,
            groups,
            safety,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn safety(&self) -> &Arc<SafetyController> {
        &self.safety
    }

    pub fn get_value(&self, name: &str) -> Option<TagValue> {
        self.tags
            .get(name)
            .and_then(|entry| entry.state.read().current_value().cloned())
    }

    pub fn get_tag(&self, name: &str) -> Option<TagSnapshot> {
        let entry = self.tags.get(name)?;
        let state = entry.state.read();
        Some(TagSnapshot {
            definition: Arc::clone(&entry.definition),
            current_value: state.current_value().cloned(),
            last_good_value: state.last_good_value().cloned(),
            quality: state.quality(),
            read_count: state.read_count(),
            error_count: state.error_count(),
            write_count: state.write_count(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    /// Current values of the named tags; tags without a value are omitted.
    pub fn values_for<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> HashMap<String, Value> {
        names
            .into_iter()
            .filter_map(|name| {
                let value = self.get_value(name)?.value()?.clone();
                Some((name.to_string(), value))
            })
            .collect()
    }

    /// Tag names in sorted order.
    pub fn tag_names(&self) -> Vec<String> {
        let mut names = self.order.clone();
        names.sort();
        names
    }

    /// Tag definitions in configuration order.
    pub fn definitions(&self) -> Vec<Arc<TagDefinition>> {
        self.order
            .iter()
            .filter_map(|name| self.tags.get(name))
            .map(|entry| Arc::clone(&entry.definition))
            .collect()
    }

    pub fn tags_for_connector(&self, connector: &str) -> Vec<TagSnapshot> {
        self.groups
            .iter()
            .filter(|g| g.port.name() == connector)
            .flat_map(|g| g.entries.iter())
            .filter_map(|entry| self.get_tag(&entry.definition.name))
            .collect()
    }

    pub fn connector_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.port.name().to_string()).collect()
    }

    pub fn connector(&self, name: &str) -> Option<Arc<dyn ConnectorPort>> {
        self.group(name).map(|g| Arc::clone(&g.port))
    }

    pub fn connector_health(&self, name: &str) -> Option<ConnectorHealth> {
        self.group(name).map(|g| g.port.health())
    }

    /// True once every connector has completed at least one poll cycle.
    pub fn all_polled(&self) -> bool {
        self.groups.iter().all(|g| g.polled.load(Ordering::SeqCst))
    }

    pub fn statistics(&self) -> TagStatistics {
        let mut stats = TagStatistics {
            total_tags: self.tags.len(),
            total_reads: 0,
            total_writes: 0,
            total_errors: 0,
            good_quality_count: 0,
            bad_quality_count: 0,
            connectors: self.connector_names(),
        };
        for entry in self.tags.values() {
            let state = entry.state.read();
            stats.total_reads += state.read_count();
            stats.total_writes += state.write_count();
            stats.total_errors += state.error_count();
            if state.quality().is_good() {
                stats.good_quality_count += 1;
            } else if state.quality().is_bad() {
                stats.bad_quality_count += 1;
            }
        }
        stats
    }

    /// Subscribe to updates of every tag.
    pub fn subscribe(&self, callback: TagSubscriber) -> Subscription {
        let ids = self
            .order
            .iter()
            .filter_map(|name| {
                let entry = self.tags.get(name)?;
                let id = entry.state.write().subscribe(Arc::clone(&callback));
                Some((name.clone(), id))
            })
            .collect();
        Subscription { ids }
    }

    pub fn subscribe_tag(
        &self,
        name: &str,
        callback: TagSubscriber,
    ) -> Result<SubscriptionId, GatewayError> {
        let entry = self
            .tags
            .get(name)
            .ok_or_else(|| GatewayError::tag_not_found(name))?;
        Ok(entry.state.write().subscribe(callback))
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        for (name, id) in &subscription.ids {
            if let Some(entry) = self.tags.get(name) {
                entry.state.write().unsubscribe(*id);
            }
        }
    }

    pub fn unsubscribe_tag(&self, name: &str, id: SubscriptionId) -> bool {
        self.tags
            .get(name)
            .is_some_and(|entry| entry.state.write().unsubscribe(id))
    }

    /// Write an engineering value to a tag.
    ///
    /// Returns `Ok(false)` when the connector did not acknowledge the write.
    /// Safety rejections never reach the connector.
    pub async fn write_tag(&self, name: &str, value: Value) -> Result<bool, GatewayError> {
        let entry = self
            .tags
            .get(name)
            .ok_or_else(|| GatewayError::tag_not_found(name))?;
        let definition = &entry.definition;
        if !definition.writable {
            warn!(tag = name, "Tag is not writable");
            return Err(GatewayError::NotWritable {
                tag: name.to_string(),
            });
        }

        let validation = self.safety.validate_write(name);
        if !validation.allowed {
            let reason = validation
                .reason
                .unwrap_or_else(|| "write not allowed".to_string());
            warn!(tag = name, reason = %reason, "Write blocked by safety");
            metrics::WRITES_DENIED.inc();
            return Err(GatewayError::WriteDenied {
                tag: name.to_string(),
                reason,
            });
        }
        if !self.safety.check_rate_limit() {
            warn!(tag = name, "Write rate limit exceeded");
            metrics::WRITES_DENIED.inc();
            return Err(GatewayError::WriteDenied {
                tag: name.to_string(),
                reason: "Rate limit exceeded".to_string(),
            });
        }

        let raw = definition
            .unscale(&value)
            .map_err(|e| GatewayError::InvalidValue {
                tag: name.to_string(),
                reason: e.to_string(),
            })?;
        let raw = definition
            .datatype
            .coerce(&raw)
            .map_err(|e| GatewayError::InvalidValue {
                tag: name.to_string(),
                reason: e.to_string(),
            })?;

        let port = self.port_for(definition)?;
        let pending = {
            let _io = entry.io.lock().await;
            let acknowledged = port
                .write_tag_value(definition, &raw)
                .await
                .map_err(|source| GatewayError::CommunicationFailure {
                    connector: definition.connector.clone(),
                    source,
                })?;
            if !acknowledged {
                warn!(tag = name, value = %value, "Connector did not acknowledge write");
                return Ok(false);
            }
            entry.state.write().record_write();
            metrics::TAG_WRITES.inc();
            debug!(tag = name, value = %value, raw = %raw, "Tag written");

            match Self::read_locked(entry, port.as_ref()).await {
                Ok(pending) => pending,
                Err(e) => {
                    debug!(tag = name, error = %e, "Read-back after write failed");
                    None
                }
            }
        };
        if let Some((subscribers, definition, value)) = pending {
            notify(&subscribers, &definition.name, &value);
        }
        Ok(true)
    }

    /// Read a tag from its connector now, bypassing the poll cache.
    pub async fn read_tag(&self, name: &str) -> Result<Option<TagValue>, GatewayError> {
        let entry = self
            .tags
            .get(name)
            .ok_or_else(|| GatewayError::tag_not_found(name))?;
        let port = self.port_for(&entry.definition)?;
        let pending = {
            let _io = entry.io.lock().await;
            Self::read_locked(entry, port.as_ref()).await?
        };
        Ok(pending.map(|(subscribers, definition, value)| {
            notify(&subscribers, &definition.name, &value);
            value
        }))
    }

    /// Run one poll cycle for a connector.
    pub async fn poll_connector(&self, connector: &str) -> Result<(), GatewayError> {
        let group = self.group(connector).ok_or_else(|| GatewayError::NotFound {
            kind: "Connector",
            name: connector.to_string(),
        })?;
        Self::poll_group(group).await;
        if self.all_polled() {
            metrics::set_ready(true);
        }
        Ok(())
    }

    /// Explicit partial degradation: tags with a last good value become
    /// uncertain/last-usable, the rest bad/no-communication.
    pub fn mark_connector_degraded(&self, connector: &str) -> usize {
        let Some(group) = self.group(connector) else {
            return 0;
        };
        for entry in &group.entries {
            let degraded = {
                let state = entry.state.read();
                match state.last_good_value() {
                    Some(last_good) => TagValue::uncertain_last_usable(last_good),
                    None => TagValue::bad_no_comm(
                        state.current_value().and_then(|v| v.value().cloned()),
                    ),
                }
            };
            let subscribers = entry.record(degraded.clone());
            notify(&subscribers, &entry.definition.name, &degraded);
        }
        let count = group.entries.len();
        warn!(connector, tag_count = count, "Connector marked degraded");
        count
    }

    /// Spawn one polling task per connector. Calling again while running
    /// does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        info!("Starting tag manager");
        for index in 0..self.groups.len() {
            let manager = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let group = &manager.groups[index];
                debug!(
                    connector = group.port.name(),
                    interval_ms = group.interval.as_millis() as u64,
                    tag_count = group.entries.len(),
                    "Starting poll loop"
                );
                let mut ticker = tokio::time::interval(group.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    Self::poll_group(group).await;
                    if manager.all_polled() {
                        metrics::set_ready(true);
                    }
                }
            }));
        }
    }

    /// Cancel the polling tasks and disconnect every connector.
    pub async fn stop(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        info!("Stopping tag manager");
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        for group in &self.groups {
            group.port.disconnect().await;
        }
        metrics::set_ready(false);
        info!("Tag manager stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    fn group(&self, connector: &str) -> Option<&PollGroup> {
        self.groups.iter().find(|g| g.port.name() == connector)
    }

    fn port_for(&self, definition: &TagDefinition) -> Result<Arc<dyn ConnectorPort>, GatewayError> {
        self.connector(&definition.connector).ok_or_else(|| GatewayError::NotFound {
            kind: "Connector",
            name: definition.connector.clone(),
        })
    }

    /// Read one tag with its I/O lock already held and record the result.
    async fn read_locked(
        entry: &TagEntry,
        port: &dyn ConnectorPort,
    ) -> Result<Option<Notification>, GatewayError> {
        let batch = [Arc::clone(&entry.definition)];
        let mut values =
            port.read_tag_values(&batch)
                .await
                .map_err(|source| GatewayError::CommunicationFailure {
                    connector: entry.definition.connector.clone(),
                    source,
                })?;
        metrics::TAG_READS.inc();
        Ok(values.remove(&entry.definition.name).map(|raw| {
            let value = scale_reading(&entry.definition, raw);
            let subscribers = entry.record(value.clone());
            (subscribers, Arc::clone(&entry.definition), value)
        }))
    }

    async fn poll_group(group: &PollGroup) {
        let started = Instant::now();
        let connector = group.port.name();
        if !group.port.is_connected() {
            if let Err(e) = group.port.connect().await {
                debug!(connector, error = %e, "Reconnect failed");
            }
        }
        metrics::CONNECTOR_CONNECTED
            .with_label_values(&[connector])
            .set(i64::from(group.port.is_connected()));

        if !group.entries.is_empty() {
            let mut guards = Vec::with_capacity(group.entries.len());
            for entry in &group.entries {
                guards.push(entry.io.lock().await);
            }
            let batch: Vec<Arc<TagDefinition>> = group
                .entries
                .iter()
                .map(|e| Arc::clone(&e.definition))
                .collect();
            let result = group.port.read_tag_values(&batch).await;
            metrics::TAG_READS.inc_by(batch.len() as u64);

            let values: Vec<TagValue> = match result {
                Ok(mut values) => group
                    .entries
                    .iter()
                    .map(|entry| match values.remove(&entry.definition.name) {
                        Some(raw) => scale_reading(&entry.definition, raw),
                        None => TagValue::bad_no_comm(entry.previous_value()),
                    })
                    .collect(),
                Err(e) => {
                    warn!(connector, error = %e, tag_count = batch.len(), "Poll failed, marking tags bad");
                    group
                        .entries
                        .iter()
                        .map(|entry| TagValue::bad_no_comm(entry.previous_value()))
                        .collect()
                }
            };

            // Tags are recorded and announced one at a time, in batch order.
            // Each I/O lock is released before its own subscribers run.
            for ((entry, guard), value) in group.entries.iter().zip(guards).zip(values) {
                let subscribers = entry.record(value.clone());
                drop(guard);
                notify(&subscribers, &entry.definition.name, &value);
            }
        }

        group.polled.store(true, Ordering::SeqCst);
        metrics::POLL_DURATION_MS.observe(started.elapsed().as_secs_f64() * 1000.0);
    }
}

impl std::fmt::Debug for TagManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagManager")
            .field("tags", &self.order)
            .field("connectors", &self.connector_names())
            .finish()
    }
}

fn scale_reading(definition: &TagDefinition, raw: TagValue) -> TagValue {
    raw.map_value(|v| definition.scale_raw(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectionState, HealthTracker};
    use crate::error::ConnectorError;
    use crate::sim::SimulatedConnector;
    use async_trait::async_trait;
    use mtp_core::{DataType, RateLimiter, ScaleConfig};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Connector whose calls touching `held_tag` park until `release`.
    struct GatedConnector {
        name: String,
        held_tag: String,
        open: AtomicBool,
        gate: Notify,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        health: HealthTracker,
    }

    impl GatedConnector {
        fn shared(name: &str, held_tag: &str) -> Arc<Self> {
            let health = HealthTracker::new();
            health.set_state(ConnectionState::Connected);
            Arc::new(Self {
                name: name.to_string(),
                held_tag: held_tag.to_string(),
                open: AtomicBool::new(false),
                gate: Notify::new(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                health,
            })
        }

        fn release(&self) {
            self.open.store(true, Ordering::SeqCst);
            self.gate.notify_waiters();
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        async fn pass(&self, held: bool) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if held {
                loop {
                    let notified = self.gate.notified();
                    if self.open.load(Ordering::SeqCst) {
                        break;
                    }
                    notified.await;
                }
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ConnectorPort for GatedConnector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn connect(&self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn read_tag_values(
            &self,
            tags: &[Arc<TagDefinition>],
        ) -> Result<HashMap<String, TagValue>, ConnectorError> {
            self.pass(tags.iter().any(|t| t.name == self.held_tag)).await;
            Ok(tags
                .iter()
                .map(|t| (t.name.clone(), TagValue::good(Value::Int(0))))
                .collect())
        }

        async fn write_tag_value(
            &self,
            tag: &TagDefinition,
            _value: &Value,
        ) -> Result<bool, ConnectorError> {
            self.pass(tag.name == self.held_tag).await;
            Ok(true)
        }

        fn health(&self) -> ConnectorHealth {
            self.health.snapshot()
        }
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn defs() -> Vec<TagDefinition> {
        vec![
            TagDefinition::new("Level", "sim", "30001", DataType::Int16)
                .with_scale(ScaleConfig::new(0.1, 0.0)),
            TagDefinition::new("Valve", "sim", "00001", DataType::Bool).allow_writes(),
            TagDefinition::new("Setpoint", "sim", "40001", DataType::Int16)
                .allow_writes()
                .with_scale(ScaleConfig::new(0.1, 0.0)),
        ]
    }

    fn manager_with(safety: SafetyController) -> (Arc<SimulatedConnector>, TagManager) {
        let sim = SimulatedConnector::shared("sim");
        let manager = TagManager::new(
            defs(),
            vec![ConnectorBinding::new(sim.clone(), Duration::from_millis(50))],
            Arc::new(safety),
        )
        .unwrap();
        (sim, manager)
    }

    fn allow_all() -> SafetyController {
        SafetyController::new(
            vec!["Valve".to_string(), "Setpoint".to_string()],
            Vec::new(),
            None,
        )
    }

    #[tokio::test]
    async fn poll_scales_good_values() {
        let (sim, manager) = manager_with(allow_all());
        sim.set_value("30001", 125);
        manager.poll_connector("sim").await.unwrap();

        let level = manager.get_value("Level").unwrap();
        assert!(level.quality().is_good());
        assert_eq!(level.value(), Some(&Value::Float(12.5)));
        // Missing from the device map.
        assert_eq!(manager.get_tag("Valve").unwrap().quality, Quality::BadNoCommunication);
        assert!(manager.all_polled());
    }

    #[tokio::test]
    async fn poll_failure_degrades_and_keeps_last_good() {
        let (sim, manager) = manager_with(allow_all());
        sim.set_value("30001", 100);
        manager.poll_connector("sim").await.unwrap();

        sim.set_link_down(true);
        manager.poll_connector("sim").await.unwrap();
        let tag = manager.get_tag("Level").unwrap();
        assert_eq!(tag.quality, Quality::BadNoCommunication);
        assert_eq!(tag.current_value.unwrap().value(), Some(&Value::Float(10.0)));
        assert_eq!(tag.last_good_value.unwrap().value(), Some(&Value::Float(10.0)));
        assert_eq!(tag.error_count, 1);

        sim.set_link_down(false);
        sim.set_value("30001", 50);
        manager.poll_connector("sim").await.unwrap();
        let tag = manager.get_tag("Level").unwrap();
        assert_eq!(tag.quality, Quality::Good);
        assert_eq!(tag.current_value.unwrap().value(), Some(&Value::Float(5.0)));
    }

    #[tokio::test]
    async fn write_outside_allowlist_never_reaches_connector() {
        let (sim, manager) = manager_with(SafetyController::deny_all());
        sim.connect().await.unwrap();
        let err = manager.write_tag("Valve", Value::Bool(true)).await.unwrap_err();
        assert!(matches!(err, GatewayError::WriteDenied { ref reason, .. } if reason.contains("allowlist")));
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_denies_second_immediate_write() {
        let safety = SafetyController::new(
            vec!["Valve".to_string()],
            Vec::new(),
            Some(RateLimiter::new(1.0)),
        );
        let (sim, manager) = manager_with(safety);
        sim.connect().await.unwrap();
        assert!(manager.write_tag("Valve", Value::Bool(true)).await.unwrap());
        let err = manager.write_tag("Valve", Value::Bool(false)).await.unwrap_err();
        assert!(matches!(err, GatewayError::WriteDenied { ref reason, .. } if reason == "Rate limit exceeded"));
        assert_eq!(sim.writes().len(), 1);
    }

    #[tokio::test]
    async fn read_only_and_unknown_tags_are_rejected() {
        let (_sim, manager) = manager_with(allow_all());
        assert!(matches!(
            manager.write_tag("Level", Value::Int(1)).await,
            Err(GatewayError::NotWritable { .. })
        ));
        assert!(matches!(
            manager.write_tag("Nope", Value::Int(1)).await,
            Err(GatewayError::NotFound { kind: "Tag", .. })
        ));
    }

    #[tokio::test]
    async fn write_reverse_scales_coerces_and_reads_back() {
        let (sim, manager) = manager_with(allow_all());
        sim.connect().await.unwrap();
        assert!(manager.write_tag("Setpoint", Value::Float(4.2)).await.unwrap());

        assert_eq!(sim.writes(), vec![("40001".to_string(), Value::Int(42))]);
        let tag = manager.get_tag("Setpoint").unwrap();
        assert_eq!(tag.write_count, 1);
        let current = tag.current_value.unwrap();
        assert!(current.quality().is_good());
        let read_back = current.value().and_then(Value::as_f64).unwrap();
        assert!((read_back - 4.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn uncoercible_value_is_invalid() {
        let (sim, manager) = manager_with(allow_all());
        sim.connect().await.unwrap();
        let err = manager
            .write_tag("Setpoint", Value::Text("fast".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidValue { .. }));
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn refused_write_reports_false() {
        let (sim, manager) = manager_with(allow_all());
        sim.connect().await.unwrap();
        sim.set_refuse_writes(true);
        assert!(!manager.write_tag("Valve", Value::Bool(true)).await.unwrap());
        assert_eq!(manager.get_tag("Valve").unwrap().write_count, 0);
    }

    #[tokio::test]
    async fn write_on_dead_link_is_communication_failure() {
        let (_sim, manager) = manager_with(allow_all());
        let err = manager.write_tag("Valve", Value::Bool(true)).await.unwrap_err();
        assert!(matches!(err, GatewayError::CommunicationFailure { .. }));
    }

    #[tokio::test]
    async fn subscribers_see_every_update_in_order() {
        let (sim, manager) = manager_with(allow_all());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::clone(&seen);
        let second = Arc::clone(&seen);
        manager
            .subscribe_tag(
                "Level",
                Arc::new(move |name: &str, _: &TagValue| first.lock().push(format!("a:{name}"))),
            )
            .unwrap();
        let all = manager.subscribe(Arc::new(move |name: &str, _: &TagValue| second.lock().push(format!("b:{name}"))));

        sim.set_value("30001", 1);
        manager.poll_connector("sim").await.unwrap();
        assert_eq!(
            *seen.lock(),
            vec!["a:Level", "b:Level", "b:Valve", "b:Setpoint"]
        );

        manager.unsubscribe(&all);
        seen.lock().clear();
        manager.poll_connector("sim").await.unwrap();
        assert_eq!(*seen.lock(), vec!["a:Level"]);
    }

    #[tokio::test]
    async fn poll_announces_each_tag_before_recording_the_next() {
        let sim = SimulatedConnector::shared("sim");
        let manager = Arc::new(
            TagManager::new(
                vec![
                    TagDefinition::new("A", "sim", "40001", DataType::Uint16),
                    TagDefinition::new("B", "sim", "40002", DataType::Uint16),
                ],
                vec![ConnectorBinding::new(sim.clone(), Duration::from_millis(50))],
                Arc::new(SafetyController::deny_all()),
            )
            .unwrap(),
        );
        sim.set_value("40001", 1);
        sim.set_value("40002", 2);

        let b_seen_from_a = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&b_seen_from_a);
        let observer = Arc::clone(&manager);
        manager
            .subscribe_tag(
                "A",
                Arc::new(move |_: &str, _: &TagValue| {
                    *slot.lock() = Some(observer.get_value("B").is_some());
                }),
            )
            .unwrap();

        manager.poll_connector("sim").await.unwrap();
        assert_eq!(*b_seen_from_a.lock(), Some(false));
        assert!(manager.get_value("B").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_waits_for_poll_of_same_tag() {
        let port = GatedConnector::shared("plc", "Valve");
        let manager = Arc::new(
            TagManager::new(
                vec![TagDefinition::new("Valve", "plc", "00001", DataType::Bool).allow_writes()],
                vec![ConnectorBinding::new(port.clone(), Duration::from_millis(50))],
                Arc::new(SafetyController::new(vec!["Valve".to_string()], Vec::new(), None)),
            )
            .unwrap(),
        );

        let poller = Arc::clone(&manager);
        let poll = tokio::spawn(async move { poller.poll_connector("plc").await });
        wait_for(|| port.calls() == 1).await;

        let writer = Arc::clone(&manager);
        let write = tokio::spawn(async move { writer.write_tag("Valve", Value::Bool(true)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(port.calls(), 1);
        assert!(!write.is_finished());

        port.release();
        poll.await.unwrap().unwrap();
        assert!(write.await.unwrap().unwrap());
        // Poll read, write, read-back.
        assert_eq!(port.calls(), 3);
        assert_eq!(port.max_in_flight(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stalled_tag_does_not_block_other_io() {
        let stalled = GatedConnector::shared("plc", "Slow.A");
        let sim = SimulatedConnector::shared("sim");
        sim.set_value("40001", 0);
        let manager = Arc::new(
            TagManager::new(
                vec![
                    TagDefinition::new("Slow.A", "plc", "40001", DataType::Uint16).allow_writes(),
                    TagDefinition::new("Slow.B", "plc", "40002", DataType::Uint16).allow_writes(),
                    TagDefinition::new("Fast.C", "sim", "40001", DataType::Uint16).allow_writes(),
                ],
                vec![
                    ConnectorBinding::new(stalled.clone(), Duration::from_millis(50)),
                    ConnectorBinding::new(sim.clone(), Duration::from_millis(50)),
                ],
                Arc::new(SafetyController::new(
                    vec!["Slow.A".to_string(), "Slow.B".to_string(), "Fast.C".to_string()],
                    Vec::new(),
                    None,
                )),
            )
            .unwrap(),
        );

        let writer = Arc::clone(&manager);
        let hung = tokio::spawn(async move { writer.write_tag("Slow.A", Value::Int(1)).await });
        wait_for(|| stalled.calls() == 1).await;

        let limit = Duration::from_secs(1);
        tokio::time::timeout(limit, manager.poll_connector("sim"))
            .await
            .expect("other connector polled")
            .unwrap();
        let fast = tokio::time::timeout(limit, manager.write_tag("Fast.C", Value::Int(3)))
            .await
            .expect("other connector written");
        assert!(fast.unwrap());
        let sibling = tokio::time::timeout(limit, manager.write_tag("Slow.B", Value::Int(2)))
            .await
            .expect("sibling tag written");
        assert!(sibling.unwrap());
        assert_eq!(sim.writes().len(), 1);
        assert!(!hung.is_finished());

        stalled.release();
        assert!(hung.await.unwrap().unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_share_one_rate_budget() {
        let safety = SafetyController::new(
            vec!["Valve".to_string(), "Setpoint".to_string()],
            Vec::new(),
            Some(RateLimiter::new(1.0 / 60.0)),
        );
        let (sim, manager) = manager_with(safety);
        sim.connect().await.unwrap();
        let manager = Arc::new(manager);

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        manager.write_tag("Valve", Value::Bool(true)).await
                    } else {
                        manager.write_tag("Setpoint", Value::Float(1.0)).await
                    }
                })
            })
            .collect();

        let mut granted = 0;
        for writer in writers {
            match writer.await.unwrap() {
                Ok(true) => granted += 1,
                Err(GatewayError::WriteDenied { reason, .. }) => {
                    assert_eq!(reason, "Rate limit exceeded")
                }
                other => panic!("unexpected write result: {other:?}"),
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(sim.writes().len(), 1);
    }

    #[tokio::test]
    async fn degrade_promotes_last_good_to_uncertain() {
        let (sim, manager) = manager_with(allow_all());
        sim.set_value("30001", 10);
        manager.poll_connector("sim").await.unwrap();

        assert_eq!(manager.mark_connector_degraded("sim"), 3);
        let level = manager.get_tag("Level").unwrap();
        assert_eq!(level.quality, Quality::UncertainNoCommLastUsable);
        assert_eq!(level.current_value.unwrap().value(), Some(&Value::Float(1.0)));
        assert_eq!(
            manager.get_tag("Valve").unwrap().quality,
            Quality::BadNoCommunication
        );
    }

    #[tokio::test]
    async fn statistics_sum_counters() {
        let (sim, manager) = manager_with(allow_all());
        sim.set_value("30001", 10);
        sim.set_value("00001", false);
        sim.set_value("40001", 0);
        manager.poll_connector("sim").await.unwrap();

        let stats = manager.statistics();
        assert_eq!(stats.total_tags, 3);
        assert_eq!(stats.total_reads, 3);
        assert_eq!(stats.good_quality_count, 3);
        assert_eq!(stats.connectors, vec!["sim".to_string()]);
        assert_eq!(manager.tag_names(), vec!["Level", "Setpoint", "Valve"]);
    }

    #[tokio::test]
    async fn unknown_connector_reference_is_configuration_error() {
        let err = TagManager::new(
            vec![TagDefinition::new("X", "missing", "40001", DataType::Int16)],
            Vec::new(),
            Arc::new(SafetyController::deny_all()),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[tokio::test]
    async fn background_polling_updates_values() {
        let (sim, manager) = manager_with(allow_all());
        let manager = Arc::new(manager);
        sim.set_value("30001", 7);
        manager.start();
        assert!(manager.is_running());
        tokio::time::sleep(Duration::from_millis(120)).await;
        manager.stop().await;

        assert!(!manager.is_running());
        let level = manager.get_tag("Level").unwrap();
        assert!(level.read_count >= 1);
        let scaled = level.current_value.unwrap().value().and_then(Value::as_f64).unwrap();
        assert!((scaled - 0.7).abs() < 1e-9);
    }
}
