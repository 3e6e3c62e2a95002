use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};

use crate::state::AppState;
use crate::{handlers, middleware};

pub(super) fn build_internal_routes(app_state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/api/internal/locks/{lock_name}",
            get(handlers::locks::get_lock_handler),
        )
        .route(
            "/api/internal/locks/{lock_name}/acquire",
            post(handlers::locks::acquire_lock_handler),
        )
        .route(
            "/api/internal/locks/{lock_name}/release",
            post(handlers::locks::release_lock_handler),
        )
        .route(
            "/api/internal/locks/{lock_name}/renew",
            post(handlers::locks::renew_lock_handler),
        )
        .route(
            "/api/internal/executions/{execution_id}",
            get(handlers::executions::execution_status_handler)
                .post(handlers::executions::register_execution_handler),
        )
        .route(
            "/api/internal/executions/{execution_id}/start",
            post(handlers::executions::start_execution_handler),
        )
        .route(
            "/api/internal/executions/{execution_id}/logs",
            post(handlers::executions::ingest_logs_handler),
        )
        .route(
            "/api/internal/executions/{execution_id}/complete",
            post(handlers::executions::complete_execution_handler),
        )
        .route(
            "/api/internal/executions/{execution_id}/viewers",
            post(handlers::viewers::issue_viewer_token_handler),
        )
        .route_layer(from_fn_with_state(
            app_state,
            middleware::require_internal_auth,
        ))
}
