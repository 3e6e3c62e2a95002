use tracing::warn;

use crate::store_ports::{BatchWriteRequest, MAX_BATCH_WRITE_ITEMS, PartitionQuery, StoreItem};

use super::*;

/// Outcome of stamping retention on one execution log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExpireReport {
    /// Rows stamped successfully, counter sentinel included.
    pub stamped: usize,
    /// Batches that failed; they are not retried or rolled back.
    pub failed_batches: Vec<ExpireBatchFailure>,
}

impl ExpireReport {
    /// Returns true when every batch was stamped.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed_batches.is_empty()
    }
}

/// One failed retention batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpireBatchFailure {
    /// Position of the first row of the batch inside the walk.
    pub offset: usize,
    /// Store error message.
    pub error: String,
}

impl LogService {
    /// Persists `lines` at indices `start_index..start_index + lines.len()`.
    ///
    /// Writes are chunked to the store batch limit. The first failing chunk
    /// aborts the append; earlier chunks stay written.
    pub async fn append_entries(
        &self,
        execution_id: &str,
        start_index: i64,
        lines: &[LogLine],
    ) -> AppResult<()> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        if start_index < 1 {
            return Err(AppError::Validation(
                "start_index must be at least 1".to_owned(),
            ));
        }

        for (chunk_number, chunk) in lines.chunks(MAX_BATCH_WRITE_ITEMS).enumerate() {
            let offset = chunk_number * MAX_BATCH_WRITE_ITEMS;
            let chunk_start = i64::try_from(offset)
                .ok()
                .and_then(|offset| start_index.checked_add(offset))
                .ok_or_else(|| {
                    AppError::Validation(format!(
                        "log batch for execution '{execution_id}' overflows the index range"
                    ))
                })?;
            let requests = chunk
                .iter()
                .zip(chunk_start..)
                .map(|(line, index)| {
                    BatchWriteRequest::Put(entry_item(execution_id.as_str(), index, line))
                })
                .collect();

            self.store.batch_write(requests).await.map_err(|error| {
                AppError::Internal(format!(
                    "failed to append log entries for execution '{execution_id}' at offset {offset}: {error}"
                ))
            })?;
        }

        Ok(())
    }

    pub(super) async fn read_entries(
        &self,
        execution_id: &str,
        after_index: i64,
        limit: Option<usize>,
    ) -> AppResult<Vec<LogEntry>> {
        let mut entries = Vec::new();
        let mut cursor = Some(after_index.max(COUNTER_SORT_KEY));

        while let Some(after_sort_key) = cursor {
            let remaining = limit.map(|limit| limit - entries.len());
            let page_size = remaining.map_or(self.read_page_size, |remaining| {
                remaining.min(self.read_page_size)
            });
            let page = self
                .store
                .query_partition(PartitionQuery::ascending(
                    StoreTable::LogEntries,
                    execution_id,
                    Some(after_sort_key),
                    page_size,
                ))
                .await?;

            for item in page
                .items
                .iter()
                .filter(|item| item.key.sort_key != COUNTER_SORT_KEY)
            {
                entries.push(entry_from_item(item)?);
            }

            cursor = page.next_sort_key;
            if limit.is_some_and(|limit| entries.len() >= limit) {
                break;
            }
        }

        Ok(entries)
    }

    pub(super) async fn expire_partition(
        &self,
        execution_id: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<ExpireReport> {
        let mut report = ExpireReport::default();
        let mut offset = 0;
        let mut cursor = None;

        loop {
            let page = self
                .store
                .query_partition(PartitionQuery::ascending(
                    StoreTable::LogEntries,
                    execution_id,
                    cursor,
                    self.read_page_size,
                ))
                .await?;

            for chunk in page.items.chunks(MAX_BATCH_WRITE_ITEMS) {
                let requests = chunk
                    .iter()
                    .cloned()
                    .map(|item| BatchWriteRequest::Put(item.with_expires_at(Some(expires_at))))
                    .collect();

                match self.store.batch_write(requests).await {
                    Ok(stamped) => report.stamped += stamped,
                    Err(error) => {
                        warn!(
                            execution_id,
                            offset,
                            error = %error,
                            "failed to stamp log retention batch"
                        );
                        report.failed_batches.push(ExpireBatchFailure {
                            offset,
                            error: error.to_string(),
                        });
                    }
                }
                offset += chunk.len();
            }

            match page.next_sort_key {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(report)
    }
}

fn entry_item(execution_id: &str, index: i64, line: &LogLine) -> StoreItem {
    StoreItem::new(entry_key(execution_id, index))
        .with_attribute("timestamp", line.timestamp)
        .with_attribute("message", line.message.as_str())
}

fn entry_from_item(item: &StoreItem) -> AppResult<LogEntry> {
    Ok(LogEntry {
        execution_id: item.key.partition_key.clone(),
        index: item.key.sort_key,
        timestamp: item.i64_attribute("timestamp")?,
        message: item.string_attribute("message")?,
        expires_at: item.expires_at,
    })
}
