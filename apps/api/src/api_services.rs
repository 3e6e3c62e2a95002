mod database;
mod expiry;
mod redis_client;
mod state_builder;

pub use database::connect_and_migrate;
pub use expiry::spawn_expiry_sweeper;
pub use redis_client::build_redis_client;
pub use state_builder::{StoreHandle, assemble_app_state, build_app_state};
