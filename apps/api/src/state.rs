use std::sync::Arc;

use sqlx::PgPool;
use tether_application::{
    ConnectionRegistry, DeliveryService, ExecutionService, LockService, PushSubscriber,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub lock_service: LockService,
    pub execution_service: ExecutionService,
    pub connection_registry: ConnectionRegistry,
    pub delivery_service: DeliveryService,
    pub push_subscriber: Arc<dyn PushSubscriber>,
    pub internal_shared_secret: String,
    pub viewer_token_ttl_seconds: u32,
    pub postgres_pool: Option<PgPool>,
    pub redis_client: Option<redis::Client>,
}
