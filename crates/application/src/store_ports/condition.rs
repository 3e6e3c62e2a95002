use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tether_core::{AppError, AppResult};

use super::item::{Attributes, StoreItem};

/// Server-side predicate evaluated against the current item before a write.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Always holds.
    Always,
    /// Holds when no live item exists for the key.
    NotExists,
    /// Holds when a live item exists for the key.
    Exists,
    /// Holds when the attribute exists and equals the value.
    AttributeEquals(String, Value),
    /// Holds when the attribute exists and is strictly less than the value.
    AttributeLessThan(String, Value),
    /// Holds when every nested condition holds.
    And(Vec<Condition>),
    /// Holds when any nested condition holds.
    Or(Vec<Condition>),
}

impl Condition {
    /// Builds an equality predicate.
    #[must_use]
    pub fn attribute_equals(name: &str, value: impl Into<Value>) -> Self {
        Self::AttributeEquals(name.to_owned(), value.into())
    }

    /// Builds a strict less-than predicate.
    #[must_use]
    pub fn attribute_less_than(name: &str, value: impl Into<Value>) -> Self {
        Self::AttributeLessThan(name.to_owned(), value.into())
    }

    /// Combines two conditions so both must hold.
    #[must_use]
    pub fn and(self, other: Condition) -> Self {
        match self {
            Self::And(mut conditions) => {
                conditions.push(other);
                Self::And(conditions)
            }
            condition => Self::And(vec![condition, other]),
        }
    }

    /// Combines two conditions so either may hold.
    #[must_use]
    pub fn or(self, other: Condition) -> Self {
        match self {
            Self::Or(mut conditions) => {
                conditions.push(other);
                Self::Or(conditions)
            }
            condition => Self::Or(vec![condition, other]),
        }
    }

    /// Evaluates the predicate against the current live item, if any.
    #[must_use]
    pub fn is_satisfied_by(&self, item: Option<&StoreItem>) -> bool {
        match self {
            Self::Always => true,
            Self::NotExists => item.is_none(),
            Self::Exists => item.is_some(),
            Self::AttributeEquals(name, expected) => item
                .and_then(|item| item.attribute(name))
                .is_some_and(|actual| actual == expected),
            Self::AttributeLessThan(name, bound) => item
                .and_then(|item| item.attribute(name))
                .and_then(|actual| compare_values(actual, bound))
                .is_some_and(|ordering| ordering == Ordering::Less),
            Self::And(conditions) => conditions
                .iter()
                .all(|condition| condition.is_satisfied_by(item)),
            Self::Or(conditions) => conditions
                .iter()
                .any(|condition| condition.is_satisfied_by(item)),
        }
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => match (left.as_i64(), right.as_i64()) {
            (Some(left), Some(right)) => Some(left.cmp(&right)),
            _ => left.as_f64()?.partial_cmp(&right.as_f64()?),
        },
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        _ => None,
    }
}

/// Attribute changes applied atomically by `update_item`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemUpdate {
    /// Attributes overwritten with new values.
    pub set: Attributes,
    /// Numeric attributes incremented by a delta; absent attributes start at zero.
    pub increments: Vec<(String, i64)>,
    /// New storage-layer expiry, when changed.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ItemUpdate {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites one attribute.
    #[must_use]
    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set.insert(name.to_owned(), value.into());
        self
    }

    /// Adds `delta` to one numeric attribute.
    #[must_use]
    pub fn increment(mut self, name: &str, delta: i64) -> Self {
        self.increments.push((name.to_owned(), delta));
        self
    }

    /// Changes the storage-layer expiry.
    #[must_use]
    pub fn expire_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Applies the update in place.
    pub fn apply_to(&self, item: &mut StoreItem) -> AppResult<()> {
        for (name, value) in &self.set {
            item.attributes.insert(name.clone(), value.clone());
        }

        for (name, delta) in &self.increments {
            let current = match item.attributes.get(name) {
                None => 0,
                Some(value) => value.as_i64().ok_or_else(|| {
                    AppError::Internal(format!(
                        "cannot increment non-integer attribute '{name}' of {} item '{}'",
                        item.key.table.as_str(),
                        item.key.partition_key
                    ))
                })?,
            };
            let next = current.checked_add(*delta).ok_or_else(|| {
                AppError::Internal(format!(
                    "increment of attribute '{name}' of {} item '{}' overflows",
                    item.key.table.as_str(),
                    item.key.partition_key
                ))
            })?;
            item.attributes.insert(name.clone(), Value::from(next));
        }

        if let Some(expires_at) = self.expires_at {
            item.expires_at = Some(expires_at);
        }

        Ok(())
    }
}
