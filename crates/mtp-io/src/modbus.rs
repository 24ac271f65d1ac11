//! Modbus TCP connector.
//!
//! Addresses use the classic five digit ranges (`00001` coils, `10001`
//! discrete inputs, `30001` input registers, `40001` holding registers) or
//! zero based prefixes (`C0`, `DI0`, `IR0`, `HR0`). A `.N` suffix selects
//! bit N of a register. Multi-register values are big endian, high word first.

use crate::connector::{ConnectionState, ConnectorHealth, ConnectorPort, HealthTracker};
use crate::error::ConnectorError;
use async_trait::async_trait;
use mtp_core::{DataType, Quality, TagDefinition, TagValue, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl RegisterKind {
    pub fn is_writable(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::HoldingRegister)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusAddress {
    pub kind: RegisterKind,
    /// Zero based protocol address.
    pub offset: u16,
    pub bit: Option<u8>,
}

pub fn parse_modbus_address(address: &str) -> Result<ModbusAddress, ConnectorError> {
    let invalid = |reason: &str| ConnectorError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };
    let normalized = address.trim().to_ascii_uppercase();
    let (base, bit) = match normalized.split_once('.') {
        Some((base, bit)) => {
            let bit: u8 = bit.parse().map_err(|_| invalid("bad bit index"))?;
            if bit > 15 {
                return Err(invalid("bit index must be 0..=15"));
            }
            (base.to_string(), Some(bit))
        }
        None => (normalized, None),
    };

    let prefixed = [
        ("HR", RegisterKind::HoldingRegister),
        ("IR", RegisterKind::InputRegister),
        ("DI", RegisterKind::DiscreteInput),
        ("C", RegisterKind::Coil),
    ];
    for (prefix, kind) in prefixed {
        if let Some(rest) = base.strip_prefix(prefix) {
            let offset: u16 = rest.parse().map_err(|_| invalid("bad register number"))?;
            return Ok(ModbusAddress { kind, offset, bit });
        }
    }

    let number: u32 = base.parse().map_err(|_| invalid("unrecognized format"))?;
    let (kind, first) = match number {
        1..=9999 => (RegisterKind::Coil, 1),
        10001..=19999 => (RegisterKind::DiscreteInput, 10001),
        30001..=39999 => (RegisterKind::InputRegister, 30001),
        40001..=49999 => (RegisterKind::HoldingRegister, 40001),
        _ => return Err(invalid("address outside Modbus ranges")),
    };
    let offset = u16::try_from(number - first).map_err(|_| invalid("offset overflow"))?;
    Ok(ModbusAddress { kind, offset, bit })
}

/// Number of 16-bit registers a value of `datatype` occupies.
pub fn register_count(datatype: DataType) -> Option<u16> {
    match datatype {
        DataType::Bool | DataType::Int16 | DataType::Uint16 => Some(1),
        DataType::Int32 | DataType::Uint32 | DataType::Float32 => Some(2),
        DataType::Int64 | DataType::Uint64 | DataType::Float64 => Some(4),
        DataType::String => None,
    }
}

pub fn decode_registers(datatype: DataType, registers: &[u16]) -> Option<Value> {
    let count = usize::from(register_count(datatype)?);
    let words = registers.get(..count)?;
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    let value = match datatype {
        DataType::Bool => Value::Bool(words[0] != 0),
        DataType::Int16 => Value::Int(i64::from(words[0] as i16)),
        DataType::Uint16 => Value::Int(i64::from(words[0])),
        DataType::Int32 => Value::Int(i64::from(i32::from_be_bytes(bytes[..4].try_into().ok()?))),
        DataType::Uint32 => Value::Int(i64::from(u32::from_be_bytes(bytes[..4].try_into().ok()?))),
        DataType::Float32 => {
            Value::Float(f64::from(f32::from_be_bytes(bytes[..4].try_into().ok()?)))
        }
        DataType::Int64 => Value::Int(i64::from_be_bytes(bytes[..8].try_into().ok()?)),
        DataType::Uint64 => {
            Value::Int(i64::try_from(u64::from_be_bytes(bytes[..8].try_into().ok()?)).ok()?)
        }
        DataType::Float64 => Value::Float(f64::from_be_bytes(bytes[..8].try_into().ok()?)),
        DataType::String => return None,
    };
    Some(value)
}

pub fn encode_registers(datatype: DataType, value: &Value) -> Option<Vec<u16>> {
    let bytes: Vec<u8> = match datatype {
        DataType::Bool => return Some(vec![u16::from(value.as_bool()?)]),
        DataType::Int16 => i16::try_from(int(value)?).ok()?.to_be_bytes().to_vec(),
        DataType::Uint16 => u16::try_from(int(value)?).ok()?.to_be_bytes().to_vec(),
        DataType::Int32 => i32::try_from(int(value)?).ok()?.to_be_bytes().to_vec(),
        DataType::Uint32 => u32::try_from(int(value)?).ok()?.to_be_bytes().to_vec(),
        DataType::Int64 => int(value)?.to_be_bytes().to_vec(),
        DataType::Uint64 => u64::try_from(int(value)?).ok()?.to_be_bytes().to_vec(),
        DataType::Float32 => (value.as_f64()? as f32).to_be_bytes().to_vec(),
        DataType::Float64 => value.as_f64()?.to_be_bytes().to_vec(),
        DataType::String => return None,
    };
    Some(
        bytes
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect(),
    )
}

fn int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Float(f) if f.is_finite() => Some(f.round() as i64),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ModbusTcpConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout: Duration,
}

pub struct ModbusTcpConnector {
    config: ModbusTcpConfig,
    ctx: Mutex<Option<Context>>,
    health: HealthTracker,
}

impl ModbusTcpConnector {
    pub fn new(config: ModbusTcpConfig) -> Self {
        Self {
            config,
            ctx: Mutex::new(None),
            health: HealthTracker::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    async fn io<T, F>(&self, op: F) -> Result<T, ConnectorError>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        let timeout_ms = self.config.timeout.as_millis() as u64;
        match timeout(self.config.timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ConnectorError::Read(e.to_string())),
            Err(_) => Err(ConnectorError::Timeout { timeout_ms }),
        }
    }

    async fn read_one(
        &self,
        ctx: &mut Context,
        tag: &TagDefinition,
    ) -> Result<Option<Value>, ConnectorError> {
        let addr = match parse_modbus_address(&tag.address) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(tag = %tag.name, error = %e, "Skipping tag with invalid address");
                return Ok(None);
            }
        };

        match addr.kind {
            RegisterKind::Coil => {
                let bits = self.io(ctx.read_coils(addr.offset, 1)).await?;
                Ok(bits.first().map(|b| Value::Bool(*b)))
            }
            RegisterKind::DiscreteInput => {
                let bits = self.io(ctx.read_discrete_inputs(addr.offset, 1)).await?;
                Ok(bits.first().map(|b| Value::Bool(*b)))
            }
            RegisterKind::InputRegister | RegisterKind::HoldingRegister => {
                let count = match (addr.bit, register_count(tag.datatype)) {
                    (Some(_), _) => 1,
                    (None, Some(count)) => count,
                    (None, None) => return Ok(None),
                };
                let words = if addr.kind == RegisterKind::InputRegister {
                    self.io(ctx.read_input_registers(addr.offset, count)).await?
                } else {
                    self.io(ctx.read_holding_registers(addr.offset, count)).await?
                };
                Ok(match addr.bit {
                    Some(bit) => words.first().map(|w| Value::Bool(w & (1 << bit) != 0)),
                    None => decode_registers(tag.datatype, &words),
                })
            }
        }
    }

    async fn write_one(
        &self,
        ctx: &mut Context,
        tag: &TagDefinition,
        value: &Value,
    ) -> Result<bool, ConnectorError> {
        let addr = parse_modbus_address(&tag.address)?;
        if !addr.kind.is_writable() {
            return Err(ConnectorError::InvalidAddress {
                address: tag.address.clone(),
                reason: "register type is read-only".to_string(),
            });
        }
        let write_err = |e: ConnectorError| match e {
            ConnectorError::Read(msg) => ConnectorError::Write(msg),
            other => other,
        };

        match (addr.kind, addr.bit) {
            (RegisterKind::Coil, _) => {
                let on = value.as_bool().unwrap_or(false);
                self.io(ctx.write_single_coil(addr.offset, on))
                    .await
                    .map_err(write_err)?;
            }
            (_, Some(bit)) => {
                let current = self
                    .io(ctx.read_holding_registers(addr.offset, 1))
                    .await?
                    .first()
                    .copied()
                    .unwrap_or(0);
                let word = if value.as_bool().unwrap_or(false) {
                    current | (1 << bit)
                } else {
                    current & !(1 << bit)
                };
                self.io(ctx.write_single_register(addr.offset, word))
                    .await
                    .map_err(write_err)?;
            }
            (_, None) => {
                let Some(words) = encode_registers(tag.datatype, value) else {
                    return Ok(false);
                };
                if words.len() == 1 {
                    self.io(ctx.write_single_register(addr.offset, words[0]))
                        .await
                        .map_err(write_err)?;
                } else {
                    self.io(ctx.write_multiple_registers(addr.offset, &words))
                        .await
                        .map_err(write_err)?;
                }
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl ConnectorPort for ModbusTcpConnector {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        let endpoint = self.endpoint();
        let socket_addr: SocketAddr = tokio::net::lookup_host(&endpoint)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConnectorError::Connect {
                endpoint: endpoint.clone(),
                reason: "address does not resolve".to_string(),
            })?;

        self.health.set_state(ConnectionState::Connecting);
        let slave = Slave(self.config.unit_id);
        match timeout(self.config.timeout, tcp::connect_slave(socket_addr, slave)).await {
            Ok(Ok(ctx)) => {
                *self.ctx.lock().await = Some(ctx);
                self.health.set_state(ConnectionState::Connected);
                self.health.record_success();
                info!(connector = %self.config.name, addr = %endpoint, "Connected to Modbus TCP");
                Ok(())
            }
            Ok(Err(e)) => {
                self.health.set_state(ConnectionState::Error);
                self.health.record_error(e.to_string());
                error!(connector = %self.config.name, addr = %endpoint, error = %e, "Modbus connect failed");
                Err(ConnectorError::Connect {
                    endpoint,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.health.set_state(ConnectionState::Error);
                self.health.record_error("connect timed out");
                Err(ConnectorError::Timeout {
                    timeout_ms: self.config.timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn disconnect(&self) {
        self.ctx.lock().await.take();
        self.health.set_state(ConnectionState::Stopped);
        info!(connector = %self.config.name, "Disconnected from Modbus TCP");
    }

    async fn read_tag_values(
        &self,
        tags: &[Arc<TagDefinition>],
    ) -> Result<HashMap<String, TagValue>, ConnectorError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or_else(|| ConnectorError::NotConnected {
            connector: self.config.name.clone(),
        })?;
        self.health.record_read(tags.len());

        let mut values = HashMap::with_capacity(tags.len());
        for tag in tags {
            match self.read_one(ctx, tag).await {
                Ok(Some(raw)) => {
                    values.insert(tag.name.clone(), TagValue::good(raw));
                }
                Ok(None) => {
                    values.insert(
                        tag.name.clone(),
                        TagValue::new(None, Quality::BadConfigurationError),
                    );
                }
                Err(e) => {
                    // A transport failure invalidates the session.
                    warn!(connector = %self.config.name, error = %e, "Modbus read failed");
                    guard.take();
                    self.health.set_state(ConnectionState::Disconnected);
                    self.health.record_error(e.to_string());
                    return Err(e);
                }
            }
        }
        self.health.record_success();
        Ok(values)
    }

    async fn write_tag_value(
        &self,
        tag: &TagDefinition,
        value: &Value,
    ) -> Result<bool, ConnectorError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or_else(|| ConnectorError::NotConnected {
            connector: self.config.name.clone(),
        })?;
        let result = self.write_one(ctx, tag, value).await;
        match &result {
            Ok(_) => self.health.record_write(),
            Err(ConnectorError::InvalidAddress { .. }) => {}
            Err(e) => {
                warn!(connector = %self.config.name, tag = %tag.name, error = %e, "Modbus write failed");
                guard.take();
                self.health.set_state(ConnectionState::Disconnected);
                self.health.record_error(e.to_string());
            }
        }
        result
    }

    fn health(&self) -> ConnectorHealth {
        self.health.snapshot()
    }
}
