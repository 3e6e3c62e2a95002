use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use tether_core::AppError;

use crate::dto::{AcquireLockRequest, LockResponse, ReleaseLockRequest, RenewLockRequest};
use crate::error::ApiResult;
use crate::state::AppState;

pub async fn acquire_lock_handler(
    State(state): State<AppState>,
    Path(lock_name): Path<String>,
    Json(payload): Json<AcquireLockRequest>,
) -> ApiResult<(StatusCode, Json<LockResponse>)> {
    let lock = state
        .lock_service
        .acquire(
            lock_name.as_str(),
            payload.execution_id.as_str(),
            payload.holder_identity.as_str(),
            payload.ttl_seconds,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(LockResponse::from(lock))))
}

pub async fn release_lock_handler(
    State(state): State<AppState>,
    Path(lock_name): Path<String>,
    Json(payload): Json<ReleaseLockRequest>,
) -> ApiResult<StatusCode> {
    state
        .lock_service
        .release(lock_name.as_str(), payload.execution_id.as_str())
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn renew_lock_handler(
    State(state): State<AppState>,
    Path(lock_name): Path<String>,
    Json(payload): Json<RenewLockRequest>,
) -> ApiResult<Json<LockResponse>> {
    let lock = state
        .lock_service
        .renew(
            lock_name.as_str(),
            payload.execution_id.as_str(),
            payload.ttl_seconds,
        )
        .await?;

    Ok(Json(LockResponse::from(lock)))
}

pub async fn get_lock_handler(
    State(state): State<AppState>,
    Path(lock_name): Path<String>,
) -> ApiResult<Json<LockResponse>> {
    let lock = state
        .lock_service
        .get(lock_name.as_str())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("lock '{lock_name}' is not held")))?;

    Ok(Json(LockResponse::from(lock)))
}

#[cfg(test)]
mod tests {
    use axum::Json;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use tether_core::AppError;

    use crate::dto::{AcquireLockRequest, ReleaseLockRequest, RenewLockRequest};
    use crate::handlers::test_support::memory_state;

    use super::{
        acquire_lock_handler, get_lock_handler, release_lock_handler, renew_lock_handler,
    };

    fn acquire_request(execution_id: &str) -> Json<AcquireLockRequest> {
        Json(AcquireLockRequest {
            execution_id: execution_id.to_owned(),
            holder_identity: "deployer".to_owned(),
            ttl_seconds: 60,
        })
    }

    #[tokio::test]
    async fn second_acquire_conflicts_until_release() {
        let (state, _) = memory_state();

        let first = acquire_lock_handler(
            State(state.clone()),
            Path("env-prod".to_owned()),
            acquire_request("exec-1"),
        )
        .await;
        assert!(matches!(&first, Ok((StatusCode::CREATED, _))));

        let second = acquire_lock_handler(
            State(state.clone()),
            Path("env-prod".to_owned()),
            acquire_request("exec-2"),
        )
        .await;
        assert!(matches!(second, Err(error) if matches!(error.0, AppError::Conflict(_))));

        let released = release_lock_handler(
            State(state.clone()),
            Path("env-prod".to_owned()),
            Json(ReleaseLockRequest {
                execution_id: "exec-1".to_owned(),
            }),
        )
        .await;
        assert!(matches!(released, Ok(StatusCode::NO_CONTENT)));

        let third = acquire_lock_handler(
            State(state),
            Path("env-prod".to_owned()),
            acquire_request("exec-2"),
        )
        .await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn renew_by_non_owner_is_not_held_and_get_reports_holder() {
        let (state, _) = memory_state();
        let acquired = acquire_lock_handler(
            State(state.clone()),
            Path("env-stage".to_owned()),
            acquire_request("exec-1"),
        )
        .await;
        assert!(acquired.is_ok());

        let renewed = renew_lock_handler(
            State(state.clone()),
            Path("env-stage".to_owned()),
            Json(RenewLockRequest {
                execution_id: "exec-2".to_owned(),
                ttl_seconds: 60,
            }),
        )
        .await;
        assert!(matches!(renewed, Err(error) if matches!(error.0, AppError::NotHeld(_))));

        let current = get_lock_handler(State(state.clone()), Path("env-stage".to_owned())).await;
        assert!(current.is_ok());
        let Json(current) = current.unwrap_or_else(|_| unreachable!());
        assert_eq!(current.execution_id, "exec-1");
        assert_eq!(current.status, "active");

        let missing = get_lock_handler(State(state), Path("env-other".to_owned())).await;
        assert!(matches!(missing, Err(error) if matches!(error.0, AppError::NotFound(_))));
    }
}
