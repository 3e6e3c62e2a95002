use tracing::debug;

use crate::store_ports::{Condition, ItemUpdate, StoreItem};

use super::*;

const MAX_RESERVE_ATTEMPTS: usize = 3;

impl LogService {
    /// Atomically reserves `count` consecutive indices and returns the first one.
    ///
    /// Concurrent callers always receive disjoint ranges. The producer must call
    /// this once per unique batch; a second call for the same batch reserves a
    /// second range.
    pub async fn reserve_range(&self, execution_id: &str, count: i64) -> AppResult<i64> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        if count <= 0 {
            return Err(AppError::Validation(
                "count must be greater than zero".to_owned(),
            ));
        }

        let key = counter_key(execution_id.as_str());
        for attempt in 1..=MAX_RESERVE_ATTEMPTS {
            let incremented = self
                .store
                .update_item(
                    &key,
                    ItemUpdate::new().increment(MAX_INDEX_ATTRIBUTE, count),
                    Condition::Exists,
                )
                .await?;

            if let Some(counter) = incremented {
                let max_index = counter.i64_attribute(MAX_INDEX_ATTRIBUTE)?;
                let start_index = max_index - count + 1;
                debug!(
                    execution_id = %execution_id,
                    start_index,
                    count,
                    "reserved log index range"
                );
                return Ok(start_index);
            }

            let counter = StoreItem::new(key.clone()).with_attribute(MAX_INDEX_ATTRIBUTE, count);
            if self
                .store
                .put_item(counter, Condition::NotExists)
                .await?
                .is_applied()
            {
                debug!(
                    execution_id = %execution_id,
                    count,
                    "created log counter"
                );
                return Ok(1);
            }

            debug!(
                execution_id = %execution_id,
                attempt,
                "log counter created concurrently; retrying increment"
            );
        }

        Err(AppError::Internal(format!(
            "failed to reserve {count} log indices for execution '{execution_id}' after {MAX_RESERVE_ATTEMPTS} attempts"
        )))
    }
}
