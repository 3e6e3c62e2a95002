//! Ordered per-execution log: index reservation, persistence and reads.
//!
//! Every execution owns one partition in `log_entries`. Sort key 0 is the
//! counter sentinel holding `max_index`; entries live at sort keys `1..=max_index`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tether_core::{AppError, AppResult, NonEmptyString};
use tether_domain::{LogEntry, LogLine};

use crate::store_ports::{ItemKey, KeyValueStore, StoreTable};

mod batches;
mod entries;
mod sequencer;

pub use batches::IngestedBatch;
pub use entries::{ExpireBatchFailure, ExpireReport};

/// Sort key of the per-execution counter sentinel.
pub(crate) const COUNTER_SORT_KEY: i64 = 0;

const MAX_INDEX_ATTRIBUTE: &str = "max_index";
const DEFAULT_READ_PAGE_SIZE: usize = 500;

/// Log sequencer and store service.
#[derive(Clone)]
pub struct LogService {
    store: Arc<dyn KeyValueStore>,
    read_page_size: usize,
}

impl LogService {
    /// Creates a log service over one store.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            read_page_size: DEFAULT_READ_PAGE_SIZE,
        }
    }

    /// Overrides the page size used when walking a log partition.
    #[must_use]
    pub fn with_read_page_size(mut self, read_page_size: usize) -> Self {
        self.read_page_size = read_page_size.max(1);
        self
    }

    /// Sequences and persists one producer batch.
    ///
    /// With a `batch_id`, redelivery of the same batch reuses the indices
    /// reserved by the first delivery instead of reserving new ones.
    pub async fn ingest_batch(
        &self,
        execution_id: &str,
        batch_id: Option<&str>,
        lines: &[LogLine],
    ) -> AppResult<IngestedBatch> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        if lines.is_empty() {
            return Err(AppError::Validation(
                "log batch must contain at least one line".to_owned(),
            ));
        }
        let count = i64::try_from(lines.len())
            .map_err(|error| AppError::Validation(format!("log batch is too large: {error}")))?;

        match batch_id {
            None => {
                let start_index = self.reserve_range(execution_id.as_str(), count).await?;
                self.append_entries(execution_id.as_str(), start_index, lines)
                    .await?;
                Ok(IngestedBatch {
                    start_index,
                    count,
                    replayed: false,
                })
            }
            Some(batch_id) => {
                let batch_id = NonEmptyString::for_field("batch_id", batch_id)?;
                self.ingest_idempotent(execution_id.as_str(), batch_id.as_str(), lines, count)
                    .await
            }
        }
    }

    /// Returns the highest reserved index, or 0 before the first reservation.
    pub async fn max_index(&self, execution_id: &str) -> AppResult<i64> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        match self
            .store
            .get_item(&counter_key(execution_id.as_str()))
            .await?
        {
            Some(counter) => counter.i64_attribute(MAX_INDEX_ATTRIBUTE),
            None => Ok(0),
        }
    }

    /// Returns true once the first range was reserved for the execution.
    pub async fn is_materialized(&self, execution_id: &str) -> AppResult<bool> {
        Ok(self.max_index(execution_id).await? > 0)
    }

    /// Stamps a retention deadline on every entry of the execution.
    pub async fn expire_all(
        &self,
        execution_id: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<ExpireReport> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        self.expire_partition(execution_id.as_str(), expires_at)
            .await
    }

    /// Returns all entries with an index above `after_index`, ascending.
    pub async fn read_since(
        &self,
        execution_id: &str,
        after_index: i64,
    ) -> AppResult<Vec<LogEntry>> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        self.read_entries(execution_id.as_str(), after_index, None)
            .await
    }

    /// Returns at most `limit` entries with an index above `after_index`, ascending.
    pub async fn read_page(
        &self,
        execution_id: &str,
        after_index: i64,
        limit: usize,
    ) -> AppResult<Vec<LogEntry>> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        if limit == 0 {
            return Err(AppError::Validation(
                "limit must be greater than zero".to_owned(),
            ));
        }

        self.read_entries(execution_id.as_str(), after_index, Some(limit))
            .await
    }
}

fn counter_key(execution_id: &str) -> ItemKey {
    ItemKey::new(StoreTable::LogEntries, execution_id, COUNTER_SORT_KEY)
}

fn entry_key(execution_id: &str, index: i64) -> ItemKey {
    ItemKey::new(StoreTable::LogEntries, execution_id, index)
}

#[cfg(test)]
mod tests;
