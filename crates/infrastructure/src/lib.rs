//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod in_memory_key_value_store;
mod local_push_hub;
mod postgres_key_value_store;
mod redis_push_transport;

pub use in_memory_key_value_store::InMemoryKeyValueStore;
pub use local_push_hub::LocalPushHub;
pub use postgres_key_value_store::PostgresKeyValueStore;
pub use redis_push_transport::RedisPushTransport;
