//! Tag value and tag state model.
//!
//! A [`TagValue`] is an immutable reading (value, quality, timestamps). A
//! [`TagState`] tracks the live history of one configured tag: the current
//! reading, the most recent good reading, counters, and change subscribers.

use crate::value::{DataType, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityCategory {
    Good,
    Uncertain,
    Bad,
}

impl QualityCategory {
    /// Protocol neutral severity code (0 good, 1 uncertain, 2 bad).
    pub fn code(self) -> u8 {
        match self {
            QualityCategory::Good => 0,
            QualityCategory::Uncertain => 1,
            QualityCategory::Bad => 2,
        }
    }
}

impl fmt::Display for QualityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QualityCategory::Good => "good",
            QualityCategory::Uncertain => "uncertain",
            QualityCategory::Bad => "bad",
        })
    }
}

/// Trust classification of a reading, mirroring OPC UA status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quality {
    Good,
    GoodLocalOverride,
    Uncertain,
    UncertainNoCommLastUsable,
    UncertainSensorNotAccurate,
    UncertainLastUsableValue,
    Bad,
    BadNoCommunication,
    BadSensorFailure,
    BadNotConnected,
    BadDeviceFailure,
    BadConfigurationError,
    BadOutOfService,
}

impl Quality {
    pub fn status_code(self) -> u32 {
        match self {
            Quality::Good => 0x0000_0000,
            Quality::GoodLocalOverride => 0x00D8_0000,
            Quality::Uncertain => 0x4000_0000,
            Quality::UncertainNoCommLastUsable => 0x408F_0000,
            Quality::UncertainSensorNotAccurate => 0x4093_0000,
            Quality::UncertainLastUsableValue => 0x408C_0000,
            Quality::Bad => 0x8000_0000,
            Quality::BadNoCommunication => 0x8031_0000,
            Quality::BadSensorFailure => 0x8032_0000,
            Quality::BadNotConnected => 0x80AB_0000,
            Quality::BadDeviceFailure => 0x8033_0000,
            Quality::BadConfigurationError => 0x8089_0000,
            Quality::BadOutOfService => 0x808A_0000,
        }
    }

    pub fn category(self) -> QualityCategory {
        // The two severity bits of an OPC UA status code select the category.
        match self.status_code() >> 30 {
            0 => QualityCategory::Good,
            1 => QualityCategory::Uncertain,
            _ => QualityCategory::Bad,
        }
    }

    pub fn is_good(self) -> bool {
        self.category() == QualityCategory::Good
    }

    pub fn is_uncertain(self) -> bool {
        self.category() == QualityCategory::Uncertain
    }

    pub fn is_bad(self) -> bool {
        self.category() == QualityCategory::Bad
    }
}

/// An immutable reading of a tag.
#[derive(Debug, Clone, PartialEq)]
pub struct TagValue {
    value: Option<Value>,
    timestamp: SystemTime,
    quality: Quality,
    source_timestamp: Option<SystemTime>,
}

impl TagValue {
    pub fn new(value: Option<Value>, quality: Quality) -> Self {
        Self {
            value,
            timestamp: SystemTime::now(),
            quality,
            source_timestamp: None,
        }
    }

    pub fn good(value: impl Into<Value>) -> Self {
        Self::new(Some(value.into()), Quality::Good)
    }

    /// Communication lost. The last known value, if any, is retained.
    pub fn bad_no_comm(last_value: Option<Value>) -> Self {
        Self::new(last_value, Quality::BadNoCommunication)
    }

    /// Carry a previous reading forward as the last usable value.
    pub fn uncertain_last_usable(previous: &TagValue) -> Self {
        Self {
            value: previous.value.clone(),
            timestamp: SystemTime::now(),
            quality: Quality::UncertainNoCommLastUsable,
            source_timestamp: Some(previous.timestamp),
        }
    }

    /// Transform the carried value, keeping quality and timestamps.
    pub fn map_value(mut self, f: impl FnOnce(Value) -> Value) -> Self {
        self.value = self.value.map(f);
        self
    }

    pub fn with_source_timestamp(mut self, source_timestamp: SystemTime) -> Self {
        self.source_timestamp = Some(source_timestamp);
        self
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn quality(&self) -> Quality {
        self.quality
    }

    pub fn source_timestamp(&self) -> Option<SystemTime> {
        self.source_timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ScaleError {
    #[error("cannot reverse scale with zero gain")]
    ZeroGain,
}

/// Linear engineering-unit transform applied to raw field values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScaleConfig {
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default)]
    pub offset: f64,
}

fn default_gain() -> f64 {
    1.0
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            gain: 1.0,
            offset: 0.0,
        }
    }
}

impl ScaleConfig {
    pub fn new(gain: f64, offset: f64) -> Self {
        Self { gain, offset }
    }

    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.gain + self.offset
    }

    pub fn reverse(&self, engineering: f64) -> Result<f64, ScaleError> {
        if self.gain == 0.0 {
            return Err(ScaleError::ZeroGain);
        }
        Ok((engineering - self.offset) / self.gain)
    }
}

/// Static definition of one tag, loaded from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagDefinition {
    pub name: String,
    pub connector: String,
    pub address: String,
    pub datatype: DataType,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub scale: Option<ScaleConfig>,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
}

impl TagDefinition {
    pub fn new(
        name: impl Into<String>,
        connector: impl Into<String>,
        address: impl Into<String>,
        datatype: DataType,
    ) -> Self {
        Self {
            name: name.into(),
            connector: connector.into(),
            address: address.into(),
            datatype,
            writable: false,
            scale: None,
            unit: String::new(),
            description: String::new(),
        }
    }

    pub fn allow_writes(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn with_scale(mut self, scale: ScaleConfig) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Raw field value to engineering value. Booleans and text pass through.
    pub fn scale_raw(&self, raw: Value) -> Value {
        let Some(scale) = &self.scale else {
            return raw;
        };
        match raw {
            Value::Int(i) => Value::Float(scale.apply(i as f64)),
            Value::Float(x) => Value::Float(scale.apply(x)),
            other => other,
        }
    }

    /// Engineering value to raw field value.
    pub fn unscale(&self, engineering: &Value) -> Result<Value, ScaleError> {
        match (&self.scale, engineering) {
            (Some(scale), Value::Int(i)) => Ok(Value::Float(scale.reverse(*i as f64)?)),
            (Some(scale), Value::Float(x)) => Ok(Value::Float(scale.reverse(*x)?)),
            _ => Ok(engineering.clone()),
        }
    }
}

pub type TagSubscriber = Arc<dyn Fn(&str, &TagValue) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Live state of one tag.
pub struct TagState {
    definition: Arc<TagDefinition>,
    current_value: Option<TagValue>,
    last_good_value: Option<TagValue>,
    read_count: u64,
    error_count: u64,
    write_count: u64,
    subscribers: Vec<(SubscriptionId, TagSubscriber)>,
    next_subscription: u64,
}

impl TagState {
    pub fn new(definition: Arc<TagDefinition>) -> Self {
        Self {
            definition,
            current_value: None,
            last_good_value: None,
            read_count: 0,
            error_count: 0,
            write_count: 0,
            subscribers: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn definition(&self) -> &Arc<TagDefinition> {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn current_value(&self) -> Option<&TagValue> {
        self.current_value.as_ref()
    }

    pub fn last_good_value(&self) -> Option<&TagValue> {
        self.last_good_value.as_ref()
    }

    pub fn quality(&self) -> Quality {
        self.current_value
            .as_ref()
            .map(TagValue::quality)
            .unwrap_or(Quality::BadNotConnected)
    }

    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn write_count(&self) -> u64 {
        self.write_count
    }

    pub fn subscribe(&mut self, callback: TagSubscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, callback));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    /// Apply an update and return the subscribers to notify, in subscription
    /// order. Used by owners that must notify after releasing a lock.
    pub fn record(&mut self, value: TagValue) -> Vec<TagSubscriber> {
        self.read_count += 1;
        if value.quality().is_good() {
            self.last_good_value = Some(value.clone());
        } else {
            self.error_count += 1;
        }
        self.current_value = Some(value);
        self.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
    }

    /// Apply an update and notify every subscriber synchronously.
    pub fn update(&mut self, value: TagValue) {
        let subscribers = self.record(value.clone());
        notify(&subscribers, &self.definition.name, &value);
    }

    pub fn record_write(&mut self) {
        self.write_count += 1;
    }
}

pub fn notify(subscribers: &[TagSubscriber], name: &str, value: &TagValue) {
    for callback in subscribers {
        callback(name, value);
    }
}

impl fmt::Debug for TagState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagState")
            .field("name", &self.definition.name)
            .field("current_value", &self.current_value)
            .field("last_good_value", &self.last_good_value)
            .field("read_count", &self.read_count)
            .field("error_count", &self.error_count)
            .field("write_count", &self.write_count)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn state() -> TagState {
        TagState::new(Arc::new(TagDefinition::new(
            "TIC_101.PV",
            "plc1",
            "40001",
            DataType::Float32,
        )))
    }

    #[test]
    fn initial_quality_is_not_connected() {
        let s = state();
        assert_eq!(s.quality(), Quality::BadNotConnected);
        assert!(s.current_value().is_none());
    }

    #[test]
    fn bad_update_preserves_last_good() {
        let mut s = state();
        s.update(TagValue::good(21.5));
        s.update(TagValue::bad_no_comm(Some(Value::Float(21.5))));
        assert_eq!(s.quality(), Quality::BadNoCommunication);
        assert_eq!(
            s.last_good_value().and_then(TagValue::value),
            Some(&Value::Float(21.5))
        );
        assert_eq!(s.error_count(), 1);
        assert_eq!(s.read_count(), 2);
    }

    #[test]
    fn uncertain_carries_previous_timestamp() {
        let previous = TagValue::good(7);
        let degraded = TagValue::uncertain_last_usable(&previous);
        assert_eq!(degraded.quality(), Quality::UncertainNoCommLastUsable);
        assert_eq!(degraded.value(), Some(&Value::Int(7)));
        assert_eq!(degraded.source_timestamp(), Some(previous.timestamp()));
    }

    #[test]
    fn subscribers_notified_in_order() {
        let mut s = state();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            s.subscribe(Arc::new(move |name: &str, _: &TagValue| {
                seen.lock().unwrap().push(format!("{tag}:{name}"));
            }));
        }
        s.update(TagValue::good(1.0));
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:TIC_101.PV".to_string(), "second:TIC_101.PV".to_string()]
        );
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let mut s = state();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        let id = s.subscribe(Arc::new(move |_: &str, _: &TagValue| {
            *counter.lock().unwrap() += 1;
        }));
        s.update(TagValue::good(1.0));
        assert!(s.unsubscribe(id));
        s.update(TagValue::good(2.0));
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn reverse_rejects_zero_gain() {
        assert_eq!(ScaleConfig::new(0.0, 1.0).reverse(5.0), Err(ScaleError::ZeroGain));
    }

    #[test]
    fn quality_categories() {
        assert!(Quality::GoodLocalOverride.is_good());
        assert!(Quality::UncertainNoCommLastUsable.is_uncertain());
        assert!(Quality::BadNotConnected.is_bad());
        assert_eq!(Quality::BadNoCommunication.status_code(), 0x8031_0000);
    }

    #[test]
    fn scale_raw_leaves_booleans_alone() {
        let def = TagDefinition::new("X", "plc1", "00001", DataType::Bool)
            .with_scale(ScaleConfig::new(10.0, 0.0));
        assert_eq!(def.scale_raw(Value::Bool(true)), Value::Bool(true));
        let def = TagDefinition::new("Y", "plc1", "40001", DataType::Int16)
            .with_scale(ScaleConfig::new(0.1, 0.0));
        assert_eq!(def.scale_raw(Value::Int(215)), Value::Float(21.5));
    }
}
