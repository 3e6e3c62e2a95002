use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tether_application::{
    ConnectionRegistry, DeliveryService, ExecutionService, ExecutionStatusStore, KeyValueStore,
    LockService, LogService, PushSubscriber, PushTransport,
};
use tether_core::{AppError, AppResult};
use tether_infrastructure::{
    InMemoryKeyValueStore, LocalPushHub, PostgresKeyValueStore, RedisPushTransport,
};
use tracing::info;

use crate::api_config::{ApiConfig, StoreBackend};
use crate::state::AppState;

use super::connect_and_migrate;
use super::redis_client::build_redis_client;

const VIEWER_CHANNEL_PREFIX: &str = "tether:viewer";

/// Concrete store behind the key-value port, kept for maintenance tasks.
#[derive(Clone)]
pub enum StoreHandle {
    Memory(Arc<InMemoryKeyValueStore>),
    Postgres(Arc<PostgresKeyValueStore>),
}

impl StoreHandle {
    pub async fn connect(backend: &StoreBackend) -> AppResult<(Self, Option<PgPool>)> {
        match backend {
            StoreBackend::Postgres { database_url } => {
                let pool = connect_and_migrate(database_url).await?;
                Ok((
                    Self::Postgres(Arc::new(PostgresKeyValueStore::new(pool.clone()))),
                    Some(pool),
                ))
            }
            StoreBackend::Memory => Ok((Self::Memory(Arc::new(InMemoryKeyValueStore::new())), None)),
        }
    }

    pub fn key_value_store(&self) -> Arc<dyn KeyValueStore> {
        match self {
            Self::Memory(store) => store.clone(),
            Self::Postgres(store) => store.clone(),
        }
    }

    pub async fn purge_expired(&self, before: DateTime<Utc>) -> AppResult<u64> {
        match self {
            Self::Memory(store) => Ok(store.purge_expired(before).await),
            Self::Postgres(store) => store.purge_expired(before).await,
        }
    }
}

pub async fn build_app_state(config: &ApiConfig) -> Result<(AppState, StoreHandle), AppError> {
    let (store, postgres_pool) = StoreHandle::connect(&config.store_backend).await?;

    let redis_client = config
        .redis_url
        .as_deref()
        .map(build_redis_client)
        .transpose()?;

    let (transport, subscriber): (Arc<dyn PushTransport>, Arc<dyn PushSubscriber>) =
        match redis_client.clone() {
            Some(client) => {
                let redis_transport = Arc::new(RedisPushTransport::new(client, VIEWER_CHANNEL_PREFIX));
                info!("viewer push uses redis pub/sub");
                (redis_transport.clone(), redis_transport)
            }
            None => {
                let hub = Arc::new(LocalPushHub::new());
                info!("viewer push uses the in-process hub");
                (hub.clone(), hub)
            }
        };

    let mut state = assemble_app_state(store.key_value_store(), transport, subscriber, config);
    state.postgres_pool = postgres_pool;
    state.redis_client = redis_client;

    Ok((state, store))
}

/// Wires the services over one store and one push transport.
pub fn assemble_app_state(
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn PushTransport>,
    subscriber: Arc<dyn PushSubscriber>,
    config: &ApiConfig,
) -> AppState {
    let lock_service = LockService::new(store.clone());
    let log_service = LogService::new(store.clone());
    let connection_registry = ConnectionRegistry::new(store.clone());
    let delivery_service = DeliveryService::new(
        log_service.clone(),
        connection_registry.clone(),
        transport,
        Arc::new(ExecutionStatusStore::new(store.clone())),
    )
    .with_concurrency(config.fanout_concurrency);
    let execution_service = ExecutionService::new(
        store,
        lock_service.clone(),
        log_service,
        delivery_service.clone(),
    )
    .with_log_retention(Duration::seconds(config.log_retention_seconds));

    AppState {
        lock_service,
        execution_service,
        connection_registry,
        delivery_service,
        push_subscriber: subscriber,
        internal_shared_secret: config.internal_shared_secret.clone(),
        viewer_token_ttl_seconds: config.viewer_token_ttl_seconds,
        postgres_pool: None,
        redis_client: None,
    }
}
