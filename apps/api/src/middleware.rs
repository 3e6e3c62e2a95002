use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;
use tether_core::AppError;
use tracing::debug;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn require_internal_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> ApiResult<Response> {
    let presented = bearer_token(request.headers()).unwrap_or_default();
    if !secrets_match(presented, state.internal_shared_secret.as_str()) {
        debug!(path = %request.uri().path(), "rejected internal request");
        return Err(AppError::Unauthorized("invalid internal credentials".to_owned()).into());
    }

    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

fn secrets_match(presented: &str, expected: &str) -> bool {
    !presented.is_empty() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}
