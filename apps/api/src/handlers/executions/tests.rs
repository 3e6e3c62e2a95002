use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use tether_core::AppError;

use crate::dto::{
    CompleteExecutionRequest, IngestLogsRequest, LogLineRequest, ReadLogsQuery,
    StartExecutionRequest,
};
use crate::handlers::test_support::memory_state;
use crate::state::AppState;

use super::{
    complete_execution_handler, execution_status_handler, ingest_logs_handler,
    read_logs_handler, register_execution_handler, start_execution_handler,
};

async fn start(state: &AppState, execution_id: &str, lock_name: &str) -> Result<(), AppError> {
    start_execution_handler(
        State(state.clone()),
        Path(execution_id.to_owned()),
        Json(StartExecutionRequest {
            lock_name: lock_name.to_owned(),
            holder_identity: "deployer".to_owned(),
            ttl_seconds: 60,
        }),
    )
    .await
    .map(|_| ())
    .map_err(|error| error.0)
}

fn batch(batch_id: Option<&str>, messages: &[&str]) -> Json<IngestLogsRequest> {
    Json(IngestLogsRequest {
        batch_id: batch_id.map(ToOwned::to_owned),
        lines: messages
            .iter()
            .enumerate()
            .map(|(position, message)| LogLineRequest {
                timestamp: Some(1_700_000_000_000 + position as i64),
                message: (*message).to_owned(),
            })
            .collect(),
    })
}

#[tokio::test]
async fn ingested_lines_are_readable_page_by_page() {
    let (state, _) = memory_state();
    assert!(start(&state, "exec-1", "env-prod").await.is_ok());

    let ingested = ingest_logs_handler(
        State(state.clone()),
        Path("exec-1".to_owned()),
        batch(None, &["one", "two", "three"]),
    )
    .await;
    assert!(ingested.is_ok());
    let Json(ingested) = ingested.unwrap_or_else(|_| unreachable!());
    assert_eq!((ingested.start_index, ingested.end_index), (1, 3));

    let first_page = read_logs_handler(
        State(state.clone()),
        Path("exec-1".to_owned()),
        Query(ReadLogsQuery {
            after_index: None,
            limit: Some(2),
        }),
    )
    .await;
    assert!(first_page.is_ok());
    let Json(first_page) = first_page.unwrap_or_else(|_| unreachable!());
    let messages: Vec<&str> = first_page
        .entries
        .iter()
        .map(|entry| entry.message.as_str())
        .collect();
    assert_eq!(messages, vec!["one", "two"]);
    assert_eq!(first_page.next_after_index, Some(2));

    let second_page = read_logs_handler(
        State(state),
        Path("exec-1".to_owned()),
        Query(ReadLogsQuery {
            after_index: first_page.next_after_index,
            limit: None,
        }),
    )
    .await;
    assert!(second_page.is_ok());
    let Json(second_page) = second_page.unwrap_or_else(|_| unreachable!());
    assert_eq!(second_page.entries.len(), 1);
    assert_eq!(second_page.entries[0].index, 3);
}

#[tokio::test]
async fn unknown_execution_is_not_found() {
    let (state, _) = memory_state();

    let ingested = ingest_logs_handler(
        State(state.clone()),
        Path("exec-missing".to_owned()),
        batch(None, &["line"]),
    )
    .await;
    assert!(matches!(ingested, Err(error) if matches!(error.0, AppError::NotFound(_))));

    let read = read_logs_handler(
        State(state),
        Path("exec-missing".to_owned()),
        Query(ReadLogsQuery {
            after_index: None,
            limit: None,
        }),
    )
    .await;
    assert!(matches!(read, Err(error) if matches!(error.0, AppError::NotFound(_))));
}

#[tokio::test]
async fn redelivered_batch_keeps_its_indices() {
    let (state, _) = memory_state();
    assert!(start(&state, "exec-1", "env-prod").await.is_ok());

    let mut start_indices = Vec::new();
    for _ in 0..2 {
        let ingested = ingest_logs_handler(
            State(state.clone()),
            Path("exec-1".to_owned()),
            batch(Some("batch-7"), &["a", "b"]),
        )
        .await;
        assert!(ingested.is_ok());
        let Json(ingested) = ingested.unwrap_or_else(|_| unreachable!());
        start_indices.push((ingested.start_index, ingested.replayed));
    }

    assert_eq!(start_indices, vec![(1, false), (1, true)]);
}

#[tokio::test]
async fn start_conflicts_while_lock_is_held_elsewhere() {
    let (state, _) = memory_state();
    assert!(start(&state, "exec-1", "env-prod").await.is_ok());
    assert!(matches!(
        start(&state, "exec-2", "env-prod").await,
        Err(AppError::Conflict(_))
    ));
}

#[tokio::test]
async fn complete_validates_status_and_frees_the_lock() {
    let (state, _) = memory_state();
    assert!(start(&state, "exec-1", "env-prod").await.is_ok());

    for status in ["running", "bogus"] {
        let rejected = complete_execution_handler(
            State(state.clone()),
            Path("exec-1".to_owned()),
            Json(CompleteExecutionRequest {
                status: status.to_owned(),
            }),
        )
        .await;
        assert!(matches!(rejected, Err(error) if matches!(error.0, AppError::Validation(_))));
    }

    let completed = complete_execution_handler(
        State(state.clone()),
        Path("exec-1".to_owned()),
        Json(CompleteExecutionRequest {
            status: "succeeded".to_owned(),
        }),
    )
    .await;
    assert!(completed.is_ok());
    let Json(completed) = completed.unwrap_or_else(|_| unreachable!());
    assert_eq!(completed.execution.status, "succeeded");
    assert!(completed.retention_complete);

    assert!(matches!(state.lock_service.get("env-prod").await, Ok(None)));

    let status = execution_status_handler(State(state.clone()), Path("exec-1".to_owned())).await;
    assert!(matches!(status, Ok(Json(record)) if record.status == "succeeded"));

    let restarted = start_execution_handler(
        State(state),
        Path("exec-2".to_owned()),
        Json(StartExecutionRequest {
            lock_name: "env-prod".to_owned(),
            holder_identity: "deployer".to_owned(),
            ttl_seconds: 60,
        }),
    )
    .await;
    assert!(matches!(restarted, Ok((StatusCode::CREATED, _))));
}

#[tokio::test]
async fn registered_execution_is_unavailable_for_reading_until_started() {
    let (state, _) = memory_state();

    let registered =
        register_execution_handler(State(state.clone()), Path("exec-1".to_owned())).await;
    assert!(matches!(&registered, Ok((StatusCode::CREATED, _))));
    let (_, Json(registered)) = registered.unwrap_or_else(|_| unreachable!());
    assert_eq!(registered.status, "provisioning");

    let early = read_logs_handler(
        State(state.clone()),
        Path("exec-1".to_owned()),
        Query(ReadLogsQuery {
            after_index: None,
            limit: None,
        }),
    )
    .await;
    let Err(early) = early else {
        panic!("logs of a provisioning execution must not be readable yet");
    };
    assert_eq!(early.status_code(), StatusCode::SERVICE_UNAVAILABLE);

    let duplicate =
        register_execution_handler(State(state.clone()), Path("exec-1".to_owned())).await;
    assert!(matches!(duplicate, Err(error) if matches!(error.0, AppError::Conflict(_))));

    assert!(start(&state, "exec-1", "env-prod").await.is_ok());
    let status = execution_status_handler(State(state.clone()), Path("exec-1".to_owned())).await;
    assert!(matches!(status, Ok(Json(record)) if record.status == "running"));

    let readable = read_logs_handler(
        State(state),
        Path("exec-1".to_owned()),
        Query(ReadLogsQuery {
            after_index: None,
            limit: None,
        }),
    )
    .await;
    assert!(matches!(readable, Ok(Json(page)) if page.entries.is_empty()));
}
