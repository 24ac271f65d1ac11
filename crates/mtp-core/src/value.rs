use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// A process value as carried by tags, hooks, and interlock references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the value. Booleans count as 0 and 1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Some(true),
                "false" | "0" | "off" => Some(false),
                _ => None,
            },
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Value::Text(_))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

/// Ordering exists between two numeric values or between two strings.
/// Any other pairing has no ordering.
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Declared data type of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    String,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot convert {value} to {datatype}: {reason}")]
pub struct ValueError {
    pub value: String,
    pub datatype: DataType,
    pub reason: &'static str,
}

impl DataType {
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            DataType::Int16
                | DataType::Uint16
                | DataType::Int32
                | DataType::Uint32
                | DataType::Int64
                | DataType::Uint64
        )
    }

    fn integer_bounds(self) -> (f64, f64) {
        match self {
            DataType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            DataType::Uint16 => (0.0, u16::MAX as f64),
            DataType::Int32 => (i32::MIN as f64, i32::MAX as f64),
            DataType::Uint32 => (0.0, u32::MAX as f64),
            DataType::Int64 => (i64::MIN as f64, i64::MAX as f64),
            // Values are carried as i64, so the upper half of u64 is not representable.
            DataType::Uint64 => (0.0, i64::MAX as f64),
            _ => (f64::MIN, f64::MAX),
        }
    }

    /// Convert a value to this type, as done before every field write.
    pub fn coerce(self, value: &Value) -> Result<Value, ValueError> {
        let fail = |reason| ValueError {
            value: value.to_string(),
            datatype: self,
            reason,
        };
        match self {
            DataType::Bool => value.as_bool().map(Value::Bool).ok_or_else(|| fail("not a boolean")),
            DataType::String => Ok(Value::Text(value.to_string())),
            DataType::Float32 | DataType::Float64 => {
                let x = numeric(value).ok_or_else(|| fail("not a number"))?;
                if !x.is_finite() {
                    return Err(fail("not finite"));
                }
                Ok(Value::Float(x))
            }
            _ => {
                if let Value::Int(i) = value {
                    let (lo, hi) = self.integer_bounds();
                    if (*i as f64) < lo || (*i as f64) > hi {
                        return Err(fail("out of range"));
                    }
                    return Ok(Value::Int(*i));
                }
                let x = numeric(value).ok_or_else(|| fail("not a number"))?;
                if !x.is_finite() {
                    return Err(fail("not finite"));
                }
                let rounded = x.round();
                let (lo, hi) = self.integer_bounds();
                if rounded < lo || rounded > hi {
                    return Err(fail("out of range"));
                }
                Ok(Value::Int(rounded as i64))
            }
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Text(s) => s.trim().parse::<f64>().ok(),
        other => other.as_f64(),
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Int16 => "int16",
            DataType::Uint16 => "uint16",
            DataType::Int32 => "int32",
            DataType::Uint32 => "uint32",
            DataType::Int64 => "int64",
            DataType::Uint64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::String => "string",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_kinds_compare_by_value() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Bool(true), Value::Int(1));
        assert!(Value::Float(2.5) > Value::Int(2));
    }

    #[test]
    fn text_never_equals_number() {
        assert_ne!(Value::Text("1".into()), Value::Int(1));
        assert_eq!(Value::Text("1".into()).partial_cmp(&Value::Int(1)), None);
    }

    #[test]
    fn coerce_rounds_into_integer_types() {
        assert_eq!(DataType::Int16.coerce(&Value::Float(41.6)), Ok(Value::Int(42)));
        assert!(DataType::Uint16.coerce(&Value::Int(-1)).is_err());
        assert!(DataType::Int16.coerce(&Value::Float(40000.0)).is_err());
    }

    #[test]
    fn coerce_bool_accepts_numbers() {
        assert_eq!(DataType::Bool.coerce(&Value::Int(0)), Ok(Value::Bool(false)));
        assert!(DataType::Bool.coerce(&Value::Text("maybe".into())).is_err());
    }
}
