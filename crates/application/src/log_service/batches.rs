use chrono::Duration;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::store_ports::{Condition, ItemUpdate, StoreItem};

use super::*;

const BATCH_CLAIM_TTL_MINUTES: i64 = 15;
const CLAIMED_STATE: &str = "claimed";
const RESERVED_STATE: &str = "reserved";

/// Placement of one ingested batch inside the execution log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestedBatch {
    /// Index of the first line of the batch.
    pub start_index: i64,
    /// Number of lines in the batch.
    pub count: i64,
    /// True when the batch was delivered before and its indices were reused.
    pub replayed: bool,
}

impl IngestedBatch {
    /// Index of the last line of the batch.
    #[must_use]
    pub fn end_index(&self) -> i64 {
        self.start_index + self.count - 1
    }
}

impl LogService {
    pub(super) async fn ingest_idempotent(
        &self,
        execution_id: &str,
        batch_id: &str,
        lines: &[LogLine],
        count: i64,
    ) -> AppResult<IngestedBatch> {
        let key = batch_claim_key(execution_id, batch_id);
        let claim = StoreItem::new(key.clone())
            .with_attribute("batch_id", batch_id)
            .with_attribute("count", count)
            .with_attribute("state", CLAIMED_STATE)
            .with_expires_at(Some(
                Utc::now() + Duration::minutes(BATCH_CLAIM_TTL_MINUTES),
            ));

        if self
            .store
            .put_item(claim, Condition::NotExists)
            .await?
            .is_applied()
        {
            let start_index = match self.reserve_range(execution_id, count).await {
                Ok(start_index) => start_index,
                Err(error) => {
                    if let Err(cleanup_error) = self
                        .store
                        .delete_item(&key, Condition::attribute_equals("state", CLAIMED_STATE))
                        .await
                    {
                        warn!(
                            execution_id,
                            batch_id,
                            error = %cleanup_error,
                            "failed to drop log batch claim after reservation error"
                        );
                    }
                    return Err(error);
                }
            };

            self.record_reservation(&key, execution_id, batch_id, count, start_index)
                .await?;
            self.append_entries(execution_id, start_index, lines)
                .await?;

            return Ok(IngestedBatch {
                start_index,
                count,
                replayed: false,
            });
        }

        let existing = self.store.get_item(&key).await?.ok_or_else(|| {
            AppError::Conflict(format!(
                "log batch '{batch_id}' claim changed concurrently; retry"
            ))
        })?;

        if existing.string_attribute("batch_id")? != batch_id {
            return Err(AppError::Conflict(format!(
                "log batch '{batch_id}' collides with another batch of execution '{execution_id}'"
            )));
        }

        let claimed_count = existing.i64_attribute("count")?;
        if claimed_count != count {
            return Err(AppError::Validation(format!(
                "log batch '{batch_id}' was first delivered with {claimed_count} lines, got {count}"
            )));
        }

        if existing.optional_string_attribute("state").as_deref() != Some(RESERVED_STATE) {
            return Err(AppError::Conflict(format!(
                "log batch '{batch_id}' is still being reserved; retry later"
            )));
        }

        let start_index = existing.i64_attribute("start_index")?;
        self.append_entries(execution_id, start_index, lines)
            .await?;
        info!(
            execution_id,
            batch_id, start_index, count, "replayed duplicate log batch at its original indices"
        );

        Ok(IngestedBatch {
            start_index,
            count,
            replayed: true,
        })
    }
}

impl LogService {
    /// Moves the claim to `reserved`. A claim that expired while the range was
    /// being reserved is written again, unless another delivery took it over.
    async fn record_reservation(
        &self,
        key: &ItemKey,
        execution_id: &str,
        batch_id: &str,
        count: i64,
        start_index: i64,
    ) -> AppResult<()> {
        let updated = self
            .store
            .update_item(
                key,
                ItemUpdate::new()
                    .set("state", RESERVED_STATE)
                    .set("start_index", start_index),
                Condition::Exists.and(Condition::attribute_equals("state", CLAIMED_STATE)),
            )
            .await?;
        if updated.is_some() {
            return Ok(());
        }

        warn!(
            execution_id,
            batch_id, start_index, "log batch claim expired during reservation; recording it again"
        );
        let reserved = StoreItem::new(key.clone())
            .with_attribute("batch_id", batch_id)
            .with_attribute("count", count)
            .with_attribute("state", RESERVED_STATE)
            .with_attribute("start_index", start_index)
            .with_expires_at(Some(
                Utc::now() + Duration::minutes(BATCH_CLAIM_TTL_MINUTES),
            ));
        if self
            .store
            .put_item(reserved, Condition::NotExists)
            .await?
            .is_applied()
        {
            return Ok(());
        }

        Err(AppError::Conflict(format!(
            "log batch '{batch_id}' was claimed again before indices {start_index}.. were recorded"
        )))
    }
}

fn batch_claim_key(execution_id: &str, batch_id: &str) -> ItemKey {
    let digest = Sha256::digest(batch_id.as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let sort_key = i64::from_be_bytes(prefix) & i64::MAX;

    ItemKey::new(StoreTable::LogBatches, execution_id, sort_key)
}
