//! Tether API composition root.

#![forbid(unsafe_code)]

mod api_config;
mod api_router;
mod api_services;
mod dto;
mod error;
mod handlers;
mod middleware;
mod state;

use tether_core::AppError;
use tracing::info;

use crate::api_config::{ApiConfig, StoreBackend, init_tracing};
use crate::api_services::{build_app_state, connect_and_migrate, spawn_expiry_sweeper};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ApiConfig::load()?;

    if config.migrate_only {
        let StoreBackend::Postgres { database_url } = &config.store_backend else {
            return Err(AppError::Validation(
                "migrate requires STORE_BACKEND=postgres".to_owned(),
            ));
        };
        connect_and_migrate(database_url).await?;
        info!("database migrations applied successfully");
        return Ok(());
    }

    let (app_state, store) = build_app_state(&config).await?;
    let sweeper = spawn_expiry_sweeper(store, config.expiry_sweep_interval());
    let app = api_router::build_router(app_state, &config)?;

    let address = config.socket_address()?;
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|error| AppError::Internal(format!("failed to bind listener: {error}")))?;

    info!(%address, "tether-api listening");

    let served = axum::serve(listener, app)
        .await
        .map_err(|error| AppError::Internal(format!("api server error: {error}")));
    sweeper.abort();
    served
}
