use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::Utc;
use tether_core::AppError;
use tether_domain::{ExecutionStatus, LogLine};

use crate::dto::{
    CompleteExecutionRequest, CompleteExecutionResponse, ExecutionResponse, IngestLogsRequest,
    IngestLogsResponse, LogEntryResponse, LogPageResponse, ReadLogsQuery, StartExecutionRequest,
    StartExecutionResponse,
};
use crate::error::ApiResult;
use crate::state::AppState;

const DEFAULT_READ_LIMIT: usize = 500;
const MAX_READ_LIMIT: usize = 1000;

pub async fn register_execution_handler(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> ApiResult<(StatusCode, Json<ExecutionResponse>)> {
    let record = state
        .execution_service
        .register(execution_id.as_str())
        .await?;

    Ok((StatusCode::CREATED, Json(ExecutionResponse::from(record))))
}

pub async fn start_execution_handler(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Json(payload): Json<StartExecutionRequest>,
) -> ApiResult<(StatusCode, Json<StartExecutionResponse>)> {
    let started = state
        .execution_service
        .start(
            execution_id.as_str(),
            payload.lock_name.as_str(),
            payload.holder_identity.as_str(),
            payload.ttl_seconds,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(StartExecutionResponse::from(started)),
    ))
}

pub async fn execution_status_handler(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionResponse>> {
    let record = state.execution_service.status(execution_id.as_str()).await?;
    Ok(Json(ExecutionResponse::from(record)))
}

pub async fn ingest_logs_handler(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Json(payload): Json<IngestLogsRequest>,
) -> ApiResult<Json<IngestLogsResponse>> {
    let received_at = Utc::now().timestamp_millis();
    let lines: Vec<LogLine> = payload
        .lines
        .into_iter()
        .map(|line| LogLine {
            timestamp: line.timestamp.unwrap_or(received_at),
            message: line.message,
        })
        .collect();

    let outcome = state
        .execution_service
        .ingest_logs(execution_id.as_str(), payload.batch_id.as_deref(), &lines)
        .await?;

    Ok(Json(IngestLogsResponse::from(outcome)))
}

pub async fn complete_execution_handler(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Json(payload): Json<CompleteExecutionRequest>,
) -> ApiResult<Json<CompleteExecutionResponse>> {
    let status = ExecutionStatus::parse(payload.status.trim())?;
    let completed = state
        .execution_service
        .complete(execution_id.as_str(), status)
        .await?;

    Ok(Json(CompleteExecutionResponse::from(completed)))
}

pub async fn read_logs_handler(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Query(query): Query<ReadLogsQuery>,
) -> ApiResult<Json<LogPageResponse>> {
    let after_index = query.after_index.unwrap_or(0);
    if after_index < 0 {
        return Err(AppError::Validation("after_index must not be negative".to_owned()).into());
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_READ_LIMIT)
        .clamp(1, MAX_READ_LIMIT);

    let entries = state
        .execution_service
        .read_logs(execution_id.as_str(), after_index, limit)
        .await?;
    let next_after_index = entries.last().map(|entry| entry.index);

    Ok(Json(LogPageResponse {
        execution_id,
        entries: entries.into_iter().map(LogEntryResponse::from).collect(),
        next_after_index,
    }))
}

#[cfg(test)]
mod tests;
