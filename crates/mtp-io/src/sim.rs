//! In-memory connector used for `--simulate` runs and tests.

use crate::connector::{ConnectionState, ConnectorHealth, ConnectorPort, HealthTracker};
use crate::error::ConnectorError;
use async_trait::async_trait;
use mtp_core::{TagDefinition, TagValue, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Simulated field device backed by an address to value map.
#[derive(Debug)]
pub struct SimulatedConnector {
    name: String,
    registers: Mutex<HashMap<String, Value>>,
    writes: Mutex<Vec<(String, Value)>>,
    fail_reads: AtomicBool,
    fail_connect: AtomicBool,
    refuse_writes: AtomicBool,
    health: HealthTracker,
}

impl SimulatedConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registers: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            fail_reads: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            refuse_writes: AtomicBool::new(false),
            health: HealthTracker::new(),
        }
    }

    pub fn shared(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    /// Preset a raw value at `address`, as if the device produced it.
    pub fn set_value(&self, address: &str, value: impl Into<Value>) {
        self.registers.lock().insert(address.to_string(), value.into());
    }

    pub fn value(&self, address: &str) -> Option<Value> {
        self.registers.lock().get(address).cloned()
    }

    /// Every acknowledged write, oldest first.
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.writes.lock().clone()
    }

    /// Make reads fail, as a dropped link would.
    pub fn set_link_down(&self, down: bool) {
        self.fail_reads.store(down, Ordering::SeqCst);
        self.fail_connect.store(down, Ordering::SeqCst);
        if down {
            self.health.set_state(ConnectionState::Error);
        }
    }

    pub fn set_refuse_writes(&self, refuse: bool) {
        self.refuse_writes.store(refuse, Ordering::SeqCst);
    }

    /// Seed every configured tag with a zero value of its type.
    pub fn seed_defaults<'a>(&self, tags: impl IntoIterator<Item = &'a TagDefinition>) {
        let mut registers = self.registers.lock();
        for tag in tags {
            let zero = if tag.datatype == mtp_core::DataType::Bool {
                Value::Bool(false)
            } else if tag.datatype == mtp_core::DataType::String {
                Value::Text(String::new())
            } else {
                Value::Int(0)
            };
            registers.entry(tag.address.clone()).or_insert(zero);
        }
    }
}

#[async_trait]
impl ConnectorPort for SimulatedConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            self.health.set_state(ConnectionState::Error);
            self.health.record_error("simulated link down");
            return Err(ConnectorError::Connect {
                endpoint: format!("sim://{}", self.name),
                reason: "simulated link down".to_string(),
            });
        }
        self.health.set_state(ConnectionState::Connected);
        info!(connector = %self.name, "Simulated connector online");
        Ok(())
    }

    async fn disconnect(&self) {
        self.health.set_state(ConnectionState::Stopped);
    }

    async fn read_tag_values(
        &self,
        tags: &[Arc<TagDefinition>],
    ) -> Result<HashMap<String, TagValue>, ConnectorError> {
        self.health.record_read(tags.len());
        if self.fail_reads.load(Ordering::SeqCst) {
            self.health.record_error("simulated read failure");
            return Err(ConnectorError::Read("simulated read failure".to_string()));
        }
        if !self.health.state().is_connected() {
            return Err(ConnectorError::NotConnected {
                connector: self.name.clone(),
            });
        }

        let registers = self.registers.lock();
        let values = tags
            .iter()
            .filter_map(|tag| {
                registers
                    .get(&tag.address)
                    .map(|v| (tag.name.clone(), TagValue::good(v.clone())))
            })
            .collect();
        self.health.record_success();
        Ok(values)
    }

    async fn write_tag_value(
        &self,
        tag: &TagDefinition,
        value: &Value,
    ) -> Result<bool, ConnectorError> {
        if !self.health.state().is_connected() {
            return Err(ConnectorError::NotConnected {
                connector: self.name.clone(),
            });
        }
        if self.refuse_writes.load(Ordering::SeqCst) {
            debug!(connector = %self.name, tag = %tag.name, "Simulated device refused write");
            return Ok(false);
        }
        self.registers
            .lock()
            .insert(tag.address.clone(), value.clone());
        self.writes.lock().push((tag.address.clone(), value.clone()));
        self.health.record_write();
        Ok(true)
    }

    fn health(&self) -> ConnectorHealth {
        self.health.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtp_core::DataType;

    fn tag() -> Arc<TagDefinition> {
        Arc::new(TagDefinition::new("Level", "sim", "40001", DataType::Int16))
    }

    #[tokio::test]
    async fn reads_back_written_value() {
        let sim = SimulatedConnector::new("sim");
        sim.connect().await.unwrap();
        let tag = tag();
        assert!(sim.write_tag_value(&tag, &Value::Int(12)).await.unwrap());

        let values = sim.read_tag_values(&[tag.clone()]).await.unwrap();
        assert_eq!(values["Level"].value(), Some(&Value::Int(12)));
        assert_eq!(sim.writes(), vec![("40001".to_string(), Value::Int(12))]);
    }

    #[tokio::test]
    async fn link_down_fails_reads() {
        let sim = SimulatedConnector::new("sim");
        sim.connect().await.unwrap();
        sim.set_link_down(true);
        assert!(sim.read_tag_values(&[tag()]).await.is_err());
        assert!(!sim.health().is_healthy());
        assert!(sim.connect().await.is_err());
    }

    #[tokio::test]
    async fn unknown_address_is_omitted() {
        let sim = SimulatedConnector::new("sim");
        sim.connect().await.unwrap();
        let values = sim.read_tag_values(&[tag()]).await.unwrap();
        assert!(values.is_empty());
    }
}
