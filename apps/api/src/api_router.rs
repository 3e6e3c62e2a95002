use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tether_core::AppError;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::api_config::ApiConfig;
use crate::handlers;
use crate::state::AppState;

mod cors;
mod internal;

pub fn build_router(app_state: AppState, config: &ApiConfig) -> Result<Router, AppError> {
    let public_routes = Router::new()
        .route(
            "/api/executions/{execution_id}/logs",
            get(handlers::executions::read_logs_handler),
        )
        .layer(cors::build_cors_layer(config.viewer_origin.as_str())?);

    Ok(Router::new()
        .route("/health", get(handlers::health::health_handler))
        .route("/ws", get(handlers::viewers::viewer_socket_handler))
        .merge(public_routes)
        .merge(internal::build_internal_routes(app_state.clone()))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout(),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state))
}
