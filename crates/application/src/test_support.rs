use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tether_core::{AppError, AppResult};
use tether_domain::ExecutionStatus;
use tokio::sync::Mutex;

use crate::delivery_ports::{ExecutionStatusReader, PushOutcome, PushTransport};
use crate::store_ports::{
    BatchWriteRequest, Condition, ItemKey, ItemUpdate, KeyValueStore, MAX_BATCH_WRITE_ITEMS,
    PartitionQuery, QueryPage, SortDirection, StoreItem, StoreTable, WriteOutcome,
};

/// Single-process store fake with the same conditional semantics as real adapters.
#[derive(Default)]
pub(crate) struct FakeKeyValueStore {
    items: Mutex<BTreeMap<ItemKey, StoreItem>>,
    failing_batch_calls: Mutex<Vec<usize>>,
    batch_calls: Mutex<usize>,
    failing_queries: Mutex<Vec<StoreTable>>,
    vanishing_updates: Mutex<Vec<StoreTable>>,
}

impl FakeKeyValueStore {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the n-th (0-based) `batch_write` call fail.
    pub(crate) async fn fail_batch_call(&self, call_number: usize) {
        self.failing_batch_calls.lock().await.push(call_number);
    }

    /// Makes the next `query_partition` call on `table` fail once.
    pub(crate) async fn fail_next_query(&self, table: StoreTable) {
        self.failing_queries.lock().await.push(table);
    }

    /// Removes the target item right before the next `update_item` on `table`,
    /// as if it had expired in between.
    pub(crate) async fn expire_before_next_update(&self, table: StoreTable) {
        self.vanishing_updates.lock().await.push(table);
    }

    pub(crate) async fn raw_item(&self, key: &ItemKey) -> Option<StoreItem> {
        self.items.lock().await.get(key).cloned()
    }

    pub(crate) async fn insert_raw(&self, item: StoreItem) {
        self.items.lock().await.insert(item.key.clone(), item);
    }
}

fn live(items: &BTreeMap<ItemKey, StoreItem>, key: &ItemKey) -> Option<StoreItem> {
    items
        .get(key)
        .filter(|item| !item.is_expired_at(Utc::now()))
        .cloned()
}

#[async_trait]
impl KeyValueStore for FakeKeyValueStore {
    async fn get_item(&self, key: &ItemKey) -> AppResult<Option<StoreItem>> {
        Ok(live(&*self.items.lock().await, key))
    }

    async fn put_item(&self, item: StoreItem, condition: Condition) -> AppResult<WriteOutcome> {
        let mut items = self.items.lock().await;
        if !condition.is_satisfied_by(live(&items, &item.key).as_ref()) {
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
        let vanish = {
            let mut vanishing = self.vanishing_updates.lock().await;
            match vanishing.iter().position(|table| *table == key.table) {
                Some(position) => {
                    vanishing.remove(position);
                    true
                }
                None => false,
            }
        };
        let mut items = self.items.lock().await;
        if vanish {
            items.remove(key);
        }
        let current = live(&items, key);
        if !condition.is_satisfied_by(current.as_ref()) {
            return Ok(None);
        }
        let mut next = current.unwrap_or_else(|| StoreItem::new(key.clone()));
        update.apply_to(&mut next)?;
        items.insert(key.clone(), next.clone());
        Ok(Some(next))
    }

    async fn delete_item(&self, key: &ItemKey, condition: Condition) -> AppResult<WriteOutcome> {
        let mut items = self.items.lock().await;
        if !condition.is_satisfied_by(live(&items, key).as_ref()) {
            return Ok(WriteOutcome::ConditionFailed);
        }
        items.remove(key);
        Ok(WriteOutcome::Applied)
    }

    async fn query_partition(&self, query: PartitionQuery) -> AppResult<QueryPage> {
        {
            let mut failing = self.failing_queries.lock().await;
            if let Some(position) = failing.iter().position(|table| *table == query.table) {
                failing.remove(position);
                return Err(AppError::ServiceUnavailable("throttled".to_owned()));
            }
        }

        let now = Utc::now();
        let items = self.items.lock().await;
        let mut matching: Vec<StoreItem> = items
            .values()
            .filter(|item| {
                item.key.table == query.table
                    && item.key.partition_key == query.partition_key
                    && !item.is_expired_at(now)
                    && match (query.direction, query.after_sort_key) {
                        (_, None) => true,
                        (SortDirection::Ascending, Some(after)) => item.key.sort_key > after,
                        (SortDirection::Descending, Some(after)) => item.key.sort_key < after,
                    }
            })
            .cloned()
            .collect();
        if query.direction == SortDirection::Descending {
            matching.reverse();
        }
        matching.truncate(query.limit);
        let next_sort_key = if matching.len() == query.limit {
            matching.last().map(|item| item.key.sort_key)
        } else {
            None
        };

        Ok(QueryPage {
            items: matching,
            next_sort_key,
        })
    }

    async fn query_lookup(&self, table: StoreTable, lookup_key: &str) -> AppResult<Vec<StoreItem>> {
        let now = Utc::now();
        Ok(self
            .items
            .lock()
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
            return Err(AppError::Validation("batch too large".to_owned()));
        }

        let call_number = {
            let mut calls = self.batch_calls.lock().await;
            let current = *calls;
            *calls += 1;
            current
        };
        if self.failing_batch_calls.lock().await.contains(&call_number) {
            return Err(AppError::Internal("simulated batch failure".to_owned()));
        }

        let mut items = self.items.lock().await;
        let mut affected = 0;
        for request in requests {
            match request {
                BatchWriteRequest::Put(item) => {
                    items.insert(item.key.clone(), item);
                    affected += 1;
                }
                BatchWriteRequest::Delete(key) => {
                    if items.remove(&key).is_some() {
                        affected += 1;
                    }
                }
            }
        }
        Ok(affected)
    }
}

/// Transport fake recording payloads per connection.
#[derive(Default)]
pub(crate) struct RecordingPushTransport {
    pub(crate) sent: Mutex<Vec<(String, String)>>,
    pub(crate) gone: Mutex<Vec<String>>,
}

impl RecordingPushTransport {
    pub(crate) async fn mark_gone(&self, connection_id: &str) {
        self.gone.lock().await.push(connection_id.to_owned());
    }

    pub(crate) async fn payloads_for(&self, connection_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id == connection_id)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl PushTransport for RecordingPushTransport {
    async fn send(&self, connection_id: &str, payload: Vec<u8>) -> AppResult<PushOutcome> {
        if self.gone.lock().await.iter().any(|id| id == connection_id) {
            return Ok(PushOutcome::Gone);
        }

        self.sent.lock().await.push((
            connection_id.to_owned(),
            String::from_utf8_lossy(&payload).into_owned(),
        ));
        Ok(PushOutcome::Delivered)
    }
}

/// Transport fake that holds every push for a moment and records the peak
/// number of pushes in flight.
#[derive(Default)]
pub(crate) struct SlowPushTransport {
    in_flight: AtomicUsize,
    pub(crate) peak_in_flight: AtomicUsize,
    pub(crate) delivered: AtomicUsize,
}

#[async_trait]
impl PushTransport for SlowPushTransport {
    async fn send(&self, _connection_id: &str, _payload: Vec<u8>) -> AppResult<PushOutcome> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(PushOutcome::Delivered)
    }
}

/// Status reader fake backed by a map.
#[derive(Default)]
pub(crate) struct FixedStatusReader {
    pub(crate) statuses: Mutex<HashMap<String, ExecutionStatus>>,
}

impl FixedStatusReader {
    pub(crate) async fn set(&self, execution_id: &str, status: ExecutionStatus) {
        self.statuses
            .lock()
            .await
            .insert(execution_id.to_owned(), status);
    }
}

#[async_trait]
impl ExecutionStatusReader for FixedStatusReader {
    async fn execution_status(&self, execution_id: &str) -> AppResult<Option<ExecutionStatus>> {
        Ok(self.statuses.lock().await.get(execution_id).copied())
    }
}
