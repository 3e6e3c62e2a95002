use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tether_application::{
    BatchWriteRequest, Condition, ItemKey, ItemUpdate, KeyValueStore, PartitionQuery, QueryPage,
    StoreItem, StoreTable, WriteOutcome,
};
use tether_core::{AppError, AppResult};
use tether_infrastructure::{InMemoryKeyValueStore, LocalPushHub};

use crate::api_config::{ApiConfig, StoreBackend};
use crate::api_services::assemble_app_state;
use crate::state::AppState;

pub(crate) fn test_config() -> ApiConfig {
    ApiConfig {
        migrate_only: false,
        store_backend: StoreBackend::Memory,
        redis_url: None,
        api_host: "127.0.0.1".to_owned(),
        api_port: 0,
        viewer_origin: "http://localhost:3000".to_owned(),
        internal_shared_secret: "internal-secret-for-tests".to_owned(),
        fanout_concurrency: 4,
        viewer_token_ttl_seconds: 300,
        log_retention_seconds: 3600,
        request_timeout_seconds: 5,
        expiry_sweep_interval_seconds: 60,
    }
}

/// State over the in-memory store and the in-process push hub.
pub(crate) fn memory_state() -> (AppState, Arc<LocalPushHub>) {
    let hub = Arc::new(LocalPushHub::new());
    let state = assemble_app_state(
        Arc::new(InMemoryKeyValueStore::new()),
        hub.clone(),
        hub.clone(),
        &test_config(),
    );
    (state, hub)
}

/// In-memory store whose secondary lookups fail while armed.
#[derive(Default)]
pub(crate) struct LookupFailingStore {
    inner: InMemoryKeyValueStore,
    failing: AtomicBool,
}

impl LookupFailingStore {
    pub(crate) fn arm(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for LookupFailingStore {
    async fn get_item(&self, key: &ItemKey) -> AppResult<Option<StoreItem>> {
        self.inner.get_item(key).await
    }

    async fn put_item(&self, item: StoreItem, condition: Condition) -> AppResult<WriteOutcome> {
        self.inner.put_item(item, condition).await
    }

    async fn update_item(
        &self,
        key: &ItemKey,
        update: ItemUpdate,
        condition: Condition,
    ) -> AppResult<Option<StoreItem>> {
        self.inner.update_item(key, update, condition).await
    }

    async fn delete_item(&self, key: &ItemKey, condition: Condition) -> AppResult<WriteOutcome> {
        self.inner.delete_item(key, condition).await
    }

    async fn query_partition(&self, query: PartitionQuery) -> AppResult<QueryPage> {
        self.inner.query_partition(query).await
    }

    async fn query_lookup(
        &self,
        table: StoreTable,
        lookup_key: &str,
    ) -> AppResult<Vec<StoreItem>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::ServiceUnavailable("store throttled".to_owned()));
        }
        self.inner.query_lookup(table, lookup_key).await
    }

    async fn batch_write(&self, requests: Vec<BatchWriteRequest>) -> AppResult<usize> {
        self.inner.batch_write(requests).await
    }
}

/// State whose store lookups can be made to fail.
pub(crate) fn lookup_failing_state() -> (AppState, Arc<LookupFailingStore>) {
    let store = Arc::new(LookupFailingStore::default());
    let hub = Arc::new(LocalPushHub::new());
    let state = assemble_app_state(store.clone(), hub.clone(), hub, &test_config());
    (state, store)
}
