use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use tether_application::{ConnectionMetadata, PushSubscription};
use tether_core::AppError;
use tether_domain::ViewerConnection;
use tracing::{info, warn};

use crate::dto::{IssueViewerTokenRequest, ViewerHandshakeQuery, ViewerTokenResponse};
use crate::error::ApiResult;
use crate::state::AppState;

mod socket;

pub async fn issue_viewer_token_handler(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Json(payload): Json<IssueViewerTokenRequest>,
) -> ApiResult<(StatusCode, Json<ViewerTokenResponse>)> {
    state.execution_service.status(execution_id.as_str()).await?;

    let issued = state
        .connection_registry
        .issue_viewer_token(
            execution_id.as_str(),
            state.viewer_token_ttl_seconds,
            ConnectionMetadata {
                user_identity: payload.user_identity,
                client_ip: payload.client_ip,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(ViewerTokenResponse::from(issued))))
}

pub async fn viewer_socket_handler(
    State(state): State<AppState>,
    Query(query): Query<ViewerHandshakeQuery>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    let (connection, subscription) = accept_viewer(&state, query).await?;

    Ok(upgrade.on_upgrade(move |socket| socket::serve_viewer(state, connection, subscription, socket)))
}

/// Redeems the viewer token and registers the new connection with the push transport.
async fn accept_viewer(
    state: &AppState,
    query: ViewerHandshakeQuery,
) -> ApiResult<(ViewerConnection, PushSubscription)> {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let connection = match state
        .connection_registry
        .connect(
            connection_id.as_str(),
            query.execution_id.as_str(),
            query.token.as_str(),
            query.last_index,
        )
        .await
    {
        Ok(connection) => connection,
        Err(AppError::Unauthorized(message)) => {
            info!(execution_id = %query.execution_id, "viewer handshake rejected");
            return Err(AppError::Unauthorized(message).into());
        }
        Err(error) => {
            warn!(
                execution_id = %query.execution_id,
                error = %error,
                "viewer handshake failed"
            );
            return Err(error.into());
        }
    };

    match state.push_subscriber.subscribe(connection_id.as_str()).await {
        Ok(subscription) => Ok((connection, subscription)),
        Err(error) => {
            if let Err(cleanup_error) = state
                .connection_registry
                .disconnect(connection_id.as_str())
                .await
            {
                warn!(
                    connection_id = %connection_id,
                    error = %cleanup_error,
                    "failed to remove connection after subscribe failure"
                );
            }
            Err(error.into())
        }
    }
}
