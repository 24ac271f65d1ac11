//! Interlock evaluation.
//!
//! Interlocks block START, UNHOLD and UNSUSPEND class commands while their
//! condition holds. ABORT and STOP are never blocked; that gating lives in
//! the service manager, this module only evaluates conditions.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOperator {
    #[default]
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot compare {value} with {reference}")]
pub struct ComparisonError {
    pub value: String,
    pub reference: String,
}

impl ComparisonOperator {
    pub fn evaluate(self, value: &Value, reference: &Value) -> Result<bool, ComparisonError> {
        use std::cmp::Ordering;
        let ordering = || {
            value.partial_cmp(reference).ok_or_else(|| ComparisonError {
                value: value.to_string(),
                reference: reference.to_string(),
            })
        };
        Ok(match self {
            ComparisonOperator::Eq => value == reference,
            ComparisonOperator::Ne => value != reference,
            ComparisonOperator::Gt => ordering()? == Ordering::Greater,
            ComparisonOperator::Ge => ordering()? != Ordering::Less,
            ComparisonOperator::Lt => ordering()? == Ordering::Less,
            ComparisonOperator::Le => ordering()? != Ordering::Greater,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "eq",
            ComparisonOperator::Ne => "ne",
            ComparisonOperator::Gt => "gt",
            ComparisonOperator::Ge => "ge",
            ComparisonOperator::Lt => "lt",
            ComparisonOperator::Le => "le",
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Binds an element to the tag that interlocks it. Service scoped elements
/// are named `Service:Element`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterlockBinding {
    pub element: String,
    pub source_tag: String,
    #[serde(default)]
    pub condition: ComparisonOperator,
    #[serde(default = "default_ref_value")]
    pub ref_value: Value,
}

fn default_ref_value() -> Value {
    Value::Bool(true)
}

impl InterlockBinding {
    pub fn new(
        element: impl Into<String>,
        source_tag: impl Into<String>,
        condition: ComparisonOperator,
        ref_value: impl Into<Value>,
    ) -> Self {
        Self {
            element: element.into(),
            source_tag: source_tag.into(),
            condition,
            ref_value: ref_value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InterlockResult {
    pub interlocked: bool,
    pub reason: Option<String>,
    pub source_tag: Option<String>,
}

impl InterlockResult {
    pub fn clear() -> Self {
        Self::default()
    }

    fn active(source_tag: &str, reason: String) -> Self {
        Self {
            interlocked: true,
            reason: Some(reason),
            source_tag: Some(source_tag.to_string()),
        }
    }
}

/// What to conclude when an interlock source has no usable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlockPolicy {
    /// Missing or uncomparable data is not an interlock.
    #[default]
    FailOpen,
    /// Missing or uncomparable data interlocks the element.
    FailClosed,
}

#[derive(Debug, Clone, Default)]
pub struct InterlockEvaluator {
    bindings: Vec<InterlockBinding>,
    policy: InterlockPolicy,
}

impl InterlockEvaluator {
    pub fn new(bindings: Vec<InterlockBinding>, policy: InterlockPolicy) -> Self {
        let mut evaluator = Self {
            bindings: Vec::with_capacity(bindings.len()),
            policy,
        };
        for binding in bindings {
            evaluator.add_binding(binding);
        }
        evaluator
    }

    /// Adds a binding, replacing any existing binding for the same element.
    pub fn add_binding(&mut self, binding: InterlockBinding) {
        match self.bindings.iter_mut().find(|b| b.element == binding.element) {
            Some(existing) => *existing = binding,
            None => self.bindings.push(binding),
        }
    }

    pub fn policy(&self) -> InterlockPolicy {
        self.policy
    }

    pub fn bindings(&self) -> &[InterlockBinding] {
        &self.bindings
    }

    /// Tags read by any binding.
    pub fn source_tags(&self) -> BTreeSet<&str> {
        self.bindings.iter().map(|b| b.source_tag.as_str()).collect()
    }

    pub fn check_interlock(
        &self,
        element: &str,
        tag_values: &HashMap<String, Value>,
    ) -> InterlockResult {
        match self.bindings.iter().find(|b| b.element == element) {
            Some(binding) => self.evaluate(binding, tag_values),
            None => InterlockResult::clear(),
        }
    }

    pub fn get_interlocked_elements(&self, tag_values: &HashMap<String, Value>) -> BTreeSet<String> {
        self.bindings
            .iter()
            .filter(|b| self.evaluate(b, tag_values).interlocked)
            .map(|b| b.element.clone())
            .collect()
    }

    /// First active interlock among the bindings scoped to `service`.
    pub fn check_service_interlocks(
        &self,
        service: &str,
        tag_values: &HashMap<String, Value>,
    ) -> InterlockResult {
        let prefix = format!("{service}:");
        self.bindings
            .iter()
            .filter(|b| b.element.starts_with(&prefix))
            .map(|b| self.evaluate(b, tag_values))
            .find(|r| r.interlocked)
            .unwrap_or_default()
    }

    fn evaluate(
        &self,
        binding: &InterlockBinding,
        tag_values: &HashMap<String, Value>,
    ) -> InterlockResult {
        let Some(value) = tag_values.get(&binding.source_tag) else {
            return match self.policy {
                InterlockPolicy::FailOpen => InterlockResult::clear(),
                InterlockPolicy::FailClosed => InterlockResult::active(
                    &binding.source_tag,
                    format!("Interlock source unavailable: {}", binding.source_tag),
                ),
            };
        };

        match binding.condition.evaluate(value, &binding.ref_value) {
            Ok(true) => InterlockResult::active(
                &binding.source_tag,
                format!(
                    "Interlock active: {} {} {}",
                    binding.source_tag, binding.condition, binding.ref_value
                ),
            ),
            Ok(false) => InterlockResult::clear(),
            Err(err) => match self.policy {
                InterlockPolicy::FailOpen => InterlockResult::clear(),
                InterlockPolicy::FailClosed => InterlockResult::active(
                    &binding.source_tag,
                    format!("Interlock source not comparable: {err}"),
                ),
            },
        }
    }
}
