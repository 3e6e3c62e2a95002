use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tether_application::{
    BatchWriteRequest, Condition, ItemKey, ItemUpdate, KeyValueStore, MAX_BATCH_WRITE_ITEMS,
    PartitionQuery, QueryPage, SortDirection, StoreItem, StoreTable, WriteOutcome,
};
use tether_core::{AppError, AppResult};
use tokio::sync::RwLock;

/// In-memory key-value store for single-process deployments and tests.
///
/// Every conditional write holds the write lock across check and commit.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    items: RwLock<BTreeMap<ItemKey, StoreItem>>,
}

impl InMemoryKeyValueStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Physically removes items whose expiry passed before `before`.
    pub async fn purge_expired(&self, before: DateTime<Utc>) -> u64 {
        let mut items = self.items.write().await;
        let initial = items.len();
        items.retain(|_, item| !item.is_expired_at(before));
        (initial - items.len()) as u64
    }
}

fn live<'a>(
    items: &'a BTreeMap<ItemKey, StoreItem>,
    key: &ItemKey,
    now: DateTime<Utc>,
) -> Option<&'a StoreItem> {
    items.get(key).filter(|item| !item.is_expired_at(now))
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get_item(&self, key: &ItemKey) -> AppResult<Option<StoreItem>> {
        Ok(live(&*self.items.read().await, key, Utc::now()).cloned())
    }

    async fn put_item(&self, item: StoreItem, condition: Condition) -> AppResult<WriteOutcome> {
        let mut items = self.items.write().await;
        if !condition.is_satisfied_by(live(&items, &item.key, Utc::now())) {
            return Ok(WriteOutcome::ConditionFailed);
        }

        items.insert(item.key.clone(), item);
        Ok(WriteOutcome::Applied)
    }

    async fn update_item(
        &self,
        key: &ItemKey,
        update: ItemUpdate,
        condition: Condition,
    ) -> AppResult<Option<StoreItem>> {
        let mut items = self.items.write().await;
        let current = live(&items, key, Utc::now()).cloned();
        if !condition.is_satisfied_by(current.as_ref()) {
            return Ok(None);
        }

        let mut next = current.unwrap_or_else(|| StoreItem::new(key.clone()));
        update.apply_to(&mut next)?;
        items.insert(key.clone(), next.clone());
        Ok(Some(next))
    }

    async fn delete_item(&self, key: &ItemKey, condition: Condition) -> AppResult<WriteOutcome> {
        let mut items = self.items.write().await;
        if !condition.is_satisfied_by(live(&items, key, Utc::now())) {
            return Ok(WriteOutcome::ConditionFailed);
        }

        items.remove(key);
        Ok(WriteOutcome::Applied)
    }

    async fn query_partition(&self, query: PartitionQuery) -> AppResult<QueryPage> {
        if query.limit == 0 {
            return Err(AppError::Validation(
                "query limit must be greater than zero".to_owned(),
            ));
        }

        let now = Utc::now();
        let lower = ItemKey::new(query.table, query.partition_key.as_str(), i64::MIN);
        let upper = ItemKey::new(query.table, query.partition_key.as_str(), i64::MAX);
        let items = self.items.read().await;
        let partition = items
            .range(lower..=upper)
            .map(|(_, item)| item)
            .filter(|item| !item.is_expired_at(now));

        let page: Vec<StoreItem> = match (query.direction, query.after_sort_key) {
            (SortDirection::Ascending, after) => partition
                .filter(|item| after.is_none_or(|after| item.key.sort_key > after))
                .take(query.limit)
                .cloned()
                .collect(),
            (SortDirection::Descending, after) => partition
                .rev()
                .filter(|item| after.is_none_or(|after| item.key.sort_key < after))
                .take(query.limit)
                .cloned()
                .collect(),
        };

        let next_sort_key = (page.len() == query.limit)
            .then(|| page.last().map(|item| item.key.sort_key))
            .flatten();

        Ok(QueryPage {
            items: page,
            next_sort_key,
        })
    }

    async fn query_lookup(
        &self,
        table: StoreTable,
        lookup_key: &str,
    ) -> AppResult<Vec<StoreItem>> {
        let now = Utc::now();
        Ok(self
            .items
            .read()
            .await
            .values()
            .filter(|item| {
                item.key.table == table
                    && item.lookup_key.as_deref() == Some(lookup_key)
                    && !item.is_expired_at(now)
            })
            .cloned()
            .collect())
    }

    async fn batch_write(&self, requests: Vec<BatchWriteRequest>) -> AppResult<usize> {
        if requests.len() > MAX_BATCH_WRITE_ITEMS {
            return Err(AppError::Validation(format!(
                "batch write accepts at most {MAX_BATCH_WRITE_ITEMS} requests, got {}",
                requests.len()
            )));
        }

        let now = Utc::now();
        let mut items = self.items.write().await;
        let mut affected = 0;
        for request in requests {
            match request {
                BatchWriteRequest::Put(item) => {
                    items.insert(item.key.clone(), item);
                    affected += 1;
                }
                BatchWriteRequest::Delete(key) => {
                    if items.remove(&key).is_some_and(|item| !item.is_expired_at(now)) {
                        affected += 1;
                    }
                }
            }
        }

        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use tether_application::{
        BatchWriteRequest, Condition, ItemKey, ItemUpdate, KeyValueStore, PartitionQuery,
        SortDirection, StoreItem, StoreTable, WriteOutcome,
    };
    use tether_core::AppError;

    use super::InMemoryKeyValueStore;

    fn counter_key() -> ItemKey {
        ItemKey::new(StoreTable::LogEntries, "exec-1", 0)
    }

    #[tokio::test]
    async fn conditional_put_rejects_existing_items() {
        let store = InMemoryKeyValueStore::new();
        let item = StoreItem::new(counter_key()).with_attribute("max_index", 3);

        let first = store.put_item(item.clone(), Condition::NotExists).await;
        assert!(matches!(first, Ok(WriteOutcome::Applied)));
        let second = store.put_item(item, Condition::NotExists).await;
        assert!(matches!(second, Ok(WriteOutcome::ConditionFailed)));
    }

    #[tokio::test]
    async fn increment_returns_new_value() {
        let store = InMemoryKeyValueStore::new();
        let missing = store
            .update_item(
                &counter_key(),
                ItemUpdate::new().increment("max_index", 2),
                Condition::Exists,
            )
            .await;
        assert!(matches!(missing, Ok(None)));

        let created = store
            .update_item(
                &counter_key(),
                ItemUpdate::new().increment("max_index", 2),
                Condition::Always,
            )
            .await;
        assert!(matches!(created, Ok(Some(_))));

        let incremented = store
            .update_item(
                &counter_key(),
                ItemUpdate::new().increment("max_index", 5),
                Condition::Exists,
            )
            .await;
        assert_eq!(
            incremented
                .ok()
                .flatten()
                .and_then(|item| item.i64_attribute("max_index").ok()),
            Some(7)
        );
    }

    #[tokio::test]
    async fn concurrent_increments_never_lose_updates() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_item(
                        &counter_key(),
                        ItemUpdate::new().increment("max_index", 1),
                        Condition::Always,
                    )
                    .await
            }));
        }
        for handle in handles {
            assert!(matches!(handle.await, Ok(Ok(Some(_)))));
        }

        let counter = store.get_item(&counter_key()).await;
        assert_eq!(
            counter
                .ok()
                .flatten()
                .and_then(|item| item.i64_attribute("max_index").ok()),
            Some(32)
        );
    }

    #[tokio::test]
    async fn expired_items_are_invisible() {
        let store = InMemoryKeyValueStore::new();
        let expired = StoreItem::new(ItemKey::single(StoreTable::Connections, "conn-1"))
            .with_lookup_key("exec-1")
            .with_attribute("last_index", 0)
            .with_expires_at(Some(Utc::now() - Duration::seconds(1)));
        assert!(store.put_item(expired.clone(), Condition::Always).await.is_ok());

        assert!(matches!(store.get_item(&expired.key).await, Ok(None)));
        assert!(matches!(
            store.query_lookup(StoreTable::Connections, "exec-1").await,
            Ok(items) if items.is_empty()
        ));
        assert!(matches!(
            store.put_item(expired.clone(), Condition::NotExists).await,
            Ok(WriteOutcome::Applied)
        ));
        assert_eq!(store.purge_expired(Utc::now()).await, 1);
    }

    #[tokio::test]
    async fn partition_pages_in_both_directions() {
        let store = InMemoryKeyValueStore::new();
        let requests = (0..6)
            .map(|index| {
                BatchWriteRequest::Put(
                    StoreItem::new(ItemKey::new(StoreTable::LogEntries, "exec-1", index))
                        .with_attribute("message", format!("line {index}")),
                )
            })
            .collect();
        assert!(matches!(store.batch_write(requests).await, Ok(6)));

        let first = store
            .query_partition(PartitionQuery::ascending(
                StoreTable::LogEntries,
                "exec-1",
                Some(0),
                3,
            ))
            .await;
        assert!(first.is_ok());
        let first = first.unwrap_or_else(|_| unreachable!());
        let sort_keys: Vec<i64> = first.items.iter().map(|item| item.key.sort_key).collect();
        assert_eq!(sort_keys, vec![1, 2, 3]);
        assert_eq!(first.next_sort_key, Some(3));

        let descending = store
            .query_partition(PartitionQuery {
                direction: SortDirection::Descending,
                ..PartitionQuery::ascending(StoreTable::LogEntries, "exec-1", None, 2)
            })
            .await;
        let sort_keys: Option<Vec<i64>> = descending
            .ok()
            .map(|page| page.items.iter().map(|item| item.key.sort_key).collect());
        assert_eq!(sort_keys, Some(vec![5, 4]));
    }

    #[tokio::test]
    async fn batch_write_enforces_limit_and_counts_deletes() {
        let store = InMemoryKeyValueStore::new();
        let oversized = (0..26)
            .map(|index| {
                BatchWriteRequest::Delete(ItemKey::single(
                    StoreTable::Connections,
                    format!("conn-{index}"),
                ))
            })
            .collect();
        assert!(matches!(
            store.batch_write(oversized).await,
            Err(AppError::Validation(_))
        ));

        let item = StoreItem::new(ItemKey::single(StoreTable::Connections, "conn-1"));
        assert!(store.put_item(item, Condition::Always).await.is_ok());
        let deletes = vec![
            BatchWriteRequest::Delete(ItemKey::single(StoreTable::Connections, "conn-1")),
            BatchWriteRequest::Delete(ItemKey::single(StoreTable::Connections, "conn-2")),
        ];
        assert!(matches!(store.batch_write(deletes).await, Ok(1)));
    }
}
