use async_trait::async_trait;

use crate::delivery_ports::{ExecutionRecord, ExecutionStatusReader};
use crate::store_ports::{Condition, ItemKey, ItemUpdate, StoreItem, StoreTable, WriteOutcome};

use super::*;

/// Execution status rows in the `executions` table.
#[derive(Clone)]
pub struct ExecutionStatusStore {
    store: Arc<dyn KeyValueStore>,
}

impl ExecutionStatusStore {
    /// Creates a status store over one key-value store.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Returns one execution row.
    pub async fn get(&self, execution_id: &str) -> AppResult<Option<ExecutionRecord>> {
        self.store
            .get_item(&execution_key(execution_id))
            .await?
            .as_ref()
            .map(record_from_item)
            .transpose()
    }

    /// Inserts a row unless one already exists.
    pub async fn create(&self, record: &ExecutionRecord) -> AppResult<WriteOutcome> {
        self.store
            .put_item(record_to_item(record), Condition::NotExists)
            .await
    }

    /// Moves an existing row to `status` when its current status is one of `from`.
    ///
    /// Returns `None` when the row is absent or in another status.
    pub fn transition<'a>(
        &'a self,
        execution_id: &'a str,
        from: &'a [ExecutionStatus],
        status: ExecutionStatus,
        lock: Option<(&'a str, &'a str)>,
    ) -> impl std::future::Future<Output = AppResult<Option<ExecutionRecord>>> + Send + 'a {
        async move {
            let mut update = ItemUpdate::new()
                .set("status", status.as_str())
                .set("updated_at", Utc::now().timestamp_millis());
            if let Some((lock_name, holder_identity)) = lock {
                update = update
                    .set("lock_name", lock_name)
                    .set("holder_identity", holder_identity);
            }

            let allowed = from
                .iter()
                .map(|status| Condition::attribute_equals("status", status.as_str()))
                .reduce(Condition::or)
                .ok_or_else(|| {
                    AppError::Internal("execution transition needs a source status".to_owned())
                })?;

            self.store
                .update_item(
                    &execution_key(execution_id),
                    update,
                    Condition::Exists.and(allowed),
                )
                .await?
                .as_ref()
                .map(record_from_item)
                .transpose()
        }
    }
}

#[async_trait]
impl ExecutionStatusReader for ExecutionStatusStore {
    async fn execution_status(&self, execution_id: &str) -> AppResult<Option<ExecutionStatus>> {
        Ok(self.get(execution_id).await?.map(|record| record.status))
    }
}

fn execution_key(execution_id: &str) -> ItemKey {
    ItemKey::single(StoreTable::Executions, execution_id)
}

fn record_to_item(record: &ExecutionRecord) -> StoreItem {
    StoreItem::new(execution_key(record.execution_id.as_str()))
        .with_attribute("status", record.status.as_str())
        .with_optional_attribute("lock_name", record.lock_name.as_deref())
        .with_optional_attribute("holder_identity", record.holder_identity.as_deref())
        .with_attribute("created_at", record.created_at.timestamp_millis())
        .with_attribute("updated_at", record.updated_at.timestamp_millis())
}

fn record_from_item(item: &StoreItem) -> AppResult<ExecutionRecord> {
    Ok(ExecutionRecord {
        execution_id: item.key.partition_key.clone(),
        status: ExecutionStatus::parse(item.string_attribute("status")?.as_str())?,
        lock_name: item.optional_string_attribute("lock_name"),
        holder_identity: item.optional_string_attribute("holder_identity"),
        created_at: item.timestamp_attribute("created_at")?,
        updated_at: item.timestamp_attribute("updated_at")?,
    })
}
