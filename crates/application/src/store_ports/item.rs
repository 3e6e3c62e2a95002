use chrono::{DateTime, Utc};
use serde_json::Value;
use tether_core::{AppError, AppResult};

/// Attribute map stored on one item.
pub type Attributes = serde_json::Map<String, Value>;

/// Logical collections persisted in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreTable {
    /// One row per protected resource name.
    Locks,
    /// Per-execution counter sentinel (sort key 0) and log entries.
    LogEntries,
    /// Idempotency claims for producer batches.
    LogBatches,
    /// Pending and active viewer connections.
    Connections,
    /// Execution status rows.
    Executions,
}

impl StoreTable {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locks => "locks",
            Self::LogEntries => "log_entries",
            Self::LogBatches => "log_batches",
            Self::Connections => "connections",
            Self::Executions => "executions",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "locks" => Ok(Self::Locks),
            "log_entries" => Ok(Self::LogEntries),
            "log_batches" => Ok(Self::LogBatches),
            "connections" => Ok(Self::Connections),
            "executions" => Ok(Self::Executions),
            _ => Err(AppError::Internal(format!("unknown store table '{value}'"))),
        }
    }
}

/// Primary key of one stored item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    /// Owning table.
    pub table: StoreTable,
    /// Partition key.
    pub partition_key: String,
    /// Sort key inside the partition.
    pub sort_key: i64,
}

impl ItemKey {
    /// Creates a composite key.
    #[must_use]
    pub fn new(table: StoreTable, partition_key: impl Into<String>, sort_key: i64) -> Self {
        Self {
            table,
            partition_key: partition_key.into(),
            sort_key,
        }
    }

    /// Creates a key for tables holding one item per partition.
    #[must_use]
    pub fn single(table: StoreTable, partition_key: impl Into<String>) -> Self {
        Self::new(table, partition_key, 0)
    }
}

/// One stored item.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreItem {
    /// Primary key.
    pub key: ItemKey,
    /// Optional secondary lookup key.
    pub lookup_key: Option<String>,
    /// Item attributes.
    pub attributes: Attributes,
    /// Storage-layer expiry; expired items are invisible to reads.
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoreItem {
    /// Creates an item without attributes.
    #[must_use]
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            lookup_key: None,
            attributes: Attributes::new(),
            expires_at: None,
        }
    }

    /// Adds one attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_owned(), value.into());
        self
    }

    /// Adds one attribute when a value is present.
    #[must_use]
    pub fn with_optional_attribute(self, name: &str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.with_attribute(name, value),
            None => self,
        }
    }

    /// Sets the secondary lookup key.
    #[must_use]
    pub fn with_lookup_key(mut self, lookup_key: impl Into<String>) -> Self {
        self.lookup_key = Some(lookup_key.into());
        self
    }

    /// Sets the storage-layer expiry.
    #[must_use]
    pub fn with_expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Returns true when storage-layer expiry has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Returns one raw attribute.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Returns a required string attribute.
    pub fn string_attribute(&self, name: &str) -> AppResult<String> {
        self.optional_string_attribute(name)
            .ok_or_else(|| self.missing_attribute(name, "string"))
    }

    /// Returns an optional string attribute.
    #[must_use]
    pub fn optional_string_attribute(&self, name: &str) -> Option<String> {
        self.attribute(name)
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    }

    /// Returns a required integer attribute.
    pub fn i64_attribute(&self, name: &str) -> AppResult<i64> {
        self.attribute(name)
            .and_then(Value::as_i64)
            .ok_or_else(|| self.missing_attribute(name, "integer"))
    }

    /// Returns a required epoch-millisecond attribute as a timestamp.
    pub fn timestamp_attribute(&self, name: &str) -> AppResult<DateTime<Utc>> {
        let millis = self.i64_attribute(name)?;
        DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            AppError::Internal(format!(
                "attribute '{name}' of {} item '{}' holds out-of-range timestamp {millis}",
                self.key.table.as_str(),
                self.key.partition_key
            ))
        })
    }

    fn missing_attribute(&self, name: &str, expected: &str) -> AppError {
        AppError::Internal(format!(
            "{} item '{}/{}' is missing {expected} attribute '{name}'",
            self.key.table.as_str(),
            self.key.partition_key,
            self.key.sort_key
        ))
    }
}
