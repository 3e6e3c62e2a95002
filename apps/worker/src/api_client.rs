use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{StatusCode, header};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_core::{AppError, AppResult};
use tether_domain::{ExecutionStatus, LogLine};

use crate::worker_config::WorkerConfig;

#[derive(Debug, Serialize)]
struct StartExecutionRequest<'a> {
    lock_name: &'a str,
    holder_identity: &'a str,
    ttl_seconds: u32,
}

#[derive(Debug, Serialize)]
struct RenewLockRequest<'a> {
    execution_id: &'a str,
    ttl_seconds: u32,
}

#[derive(Debug, Serialize)]
struct IngestLogsRequest<'a> {
    batch_id: &'a str,
    lines: &'a [LogLine],
}

#[derive(Debug, Serialize)]
struct CompleteExecutionRequest {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionBody {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct LockBody {
    pub lock_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct StartedExecutionBody {
    pub lock: LockBody,
}

#[derive(Debug, Deserialize)]
pub struct IngestedBatchBody {
    pub start_index: i64,
    pub end_index: i64,
    pub replayed: bool,
}

#[derive(Debug, Deserialize)]
pub struct CompletedExecutionBody {
    pub notified_viewers: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Client for the internal execution endpoints of the API.
#[derive(Clone)]
pub struct ApiClient {
    http_client: reqwest::Client,
    api_base_url: String,
    internal_shared_secret: String,
    execution_id: String,
}

impl ApiClient {
    pub fn new(config: &WorkerConfig) -> AppResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|error| AppError::Internal(format!("failed to build HTTP client: {error}")))?;

        Ok(Self {
            http_client,
            api_base_url: config.api_base_url.clone(),
            internal_shared_secret: config.internal_shared_secret.clone(),
            execution_id: config.execution_id.clone(),
        })
    }

    /// Records the execution as `provisioning` before the lock is taken.
    pub async fn register_execution(&self) -> AppResult<ExecutionBody> {
        self.post(
            format!("/api/internal/executions/{}", self.execution_id),
            &(),
            "register",
        )
        .await
    }

    pub async fn start_execution(
        &self,
        lock_name: &str,
        holder_identity: &str,
        ttl_seconds: u32,
    ) -> AppResult<StartedExecutionBody> {
        self.post(
            format!("/api/internal/executions/{}/start", self.execution_id),
            &StartExecutionRequest {
                lock_name,
                holder_identity,
                ttl_seconds,
            },
            "start",
        )
        .await
    }

    pub async fn renew_lock(&self, lock_name: &str, ttl_seconds: u32) -> AppResult<LockBody> {
        self.post(
            format!("/api/internal/locks/{lock_name}/renew"),
            &RenewLockRequest {
                execution_id: self.execution_id.as_str(),
                ttl_seconds,
            },
            "lock renew",
        )
        .await
    }

    pub async fn ingest_logs(&self, batch_id: &str, lines: &[LogLine]) -> AppResult<IngestedBatchBody> {
        self.post(
            format!("/api/internal/executions/{}/logs", self.execution_id),
            &IngestLogsRequest { batch_id, lines },
            "log ingest",
        )
        .await
    }

    pub async fn complete_execution(
        &self,
        status: ExecutionStatus,
    ) -> AppResult<CompletedExecutionBody> {
        self.post(
            format!("/api/internal/executions/{}/complete", self.execution_id),
            &CompleteExecutionRequest {
                status: status.as_str(),
            },
            "complete",
        )
        .await
    }

    async fn post<B, R>(&self, path: String, body: &B, action: &str) -> AppResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self
            .http_client
            .post(format!("{}{path}", self.api_base_url))
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.internal_shared_secret),
            )
            .json(body)
            .send()
            .await
            .map_err(|error| {
                AppError::ServiceUnavailable(format!("failed to call {action} endpoint: {error}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_owned());
            return Err(error_for_status(status, body.as_str(), action));
        }

        response.json::<R>().await.map_err(|error| {
            AppError::Internal(format!(
                "failed to parse {action} endpoint response body: {error}"
            ))
        })
    }
}

/// Maps an API error response back onto the shared error taxonomy.
fn error_for_status(status: StatusCode, body: &str, action: &str) -> AppError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|error| error.message)
        .unwrap_or_else(|_| body.to_owned());
    let message = format!(
        "{action} endpoint returned status {}: {message}",
        status.as_u16()
    );

    match status {
        StatusCode::BAD_REQUEST => AppError::Validation(message),
        StatusCode::UNAUTHORIZED => AppError::Unauthorized(message),
        StatusCode::NOT_FOUND => AppError::NotFound(message),
        StatusCode::CONFLICT => AppError::Conflict(message),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::REQUEST_TIMEOUT => {
            AppError::ServiceUnavailable(message)
        }
        _ => AppError::Internal(message),
    }
}
