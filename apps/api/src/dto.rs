use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_application::{
    CompletedExecution, ExecutionRecord, FanOutReport, IngestOutcome, IssuedViewerToken,
    StartedExecution,
};
use tether_domain::{ExecutionLock, LogEntry};

/// Health response payload.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ready: bool,
    pub store: HealthDependencyStatus,
    pub redis: HealthDependencyStatus,
}

/// One runtime dependency health status.
#[derive(Debug, Serialize)]
pub struct HealthDependencyStatus {
    pub status: &'static str,
    pub detail: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AcquireLockRequest {
    pub execution_id: String,
    pub holder_identity: String,
    pub ttl_seconds: u32,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseLockRequest {
    pub execution_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RenewLockRequest {
    pub execution_id: String,
    pub ttl_seconds: u32,
}

/// API representation of a held lock.
#[derive(Debug, Serialize)]
pub struct LockResponse {
    pub lock_name: String,
    pub lock_id: String,
    pub execution_id: String,
    pub holder_identity: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct StartExecutionRequest {
    pub lock_name: String,
    pub holder_identity: String,
    pub ttl_seconds: u32,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub status: &'static str,
    pub lock_name: Option<String>,
    pub holder_identity: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StartExecutionResponse {
    pub execution: ExecutionResponse,
    pub lock: LockResponse,
}

#[derive(Debug, Deserialize)]
pub struct LogLineRequest {
    /// Milliseconds since the epoch; defaults to the receive time.
    pub timestamp: Option<i64>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct IngestLogsRequest {
    pub batch_id: Option<String>,
    pub lines: Vec<LogLineRequest>,
}

#[derive(Debug, Serialize)]
pub struct FanOutSummaryResponse {
    pub skipped: bool,
    pub delivered: usize,
    pub up_to_date: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct IngestLogsResponse {
    pub start_index: i64,
    pub end_index: i64,
    pub count: i64,
    pub replayed: bool,
    pub fan_out: Option<FanOutSummaryResponse>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteExecutionRequest {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct CompleteExecutionResponse {
    pub execution: ExecutionResponse,
    pub stamped_rows: usize,
    pub retention_complete: bool,
    pub notified_viewers: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReadLogsQuery {
    pub after_index: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LogEntryResponse {
    pub index: i64,
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct LogPageResponse {
    pub execution_id: String,
    pub entries: Vec<LogEntryResponse>,
    /// Pass as `after_index` to continue; absent when the page is empty.
    pub next_after_index: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct IssueViewerTokenRequest {
    pub user_identity: Option<String>,
    pub client_ip: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ViewerTokenResponse {
    pub token: String,
    pub pending_connection_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ViewerHandshakeQuery {
    pub execution_id: String,
    pub token: String,
    pub last_index: Option<i64>,
}

impl From<ExecutionLock> for LockResponse {
    fn from(value: ExecutionLock) -> Self {
        Self {
            status: value.status.as_str(),
            lock_name: value.lock_name,
            lock_id: value.lock_id,
            execution_id: value.execution_id,
            holder_identity: value.holder_identity,
            acquired_at: value.acquired_at,
            expires_at: value.expires_at,
        }
    }
}

impl From<ExecutionRecord> for ExecutionResponse {
    fn from(value: ExecutionRecord) -> Self {
        Self {
            status: value.status.as_str(),
            execution_id: value.execution_id,
            lock_name: value.lock_name,
            holder_identity: value.holder_identity,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

impl From<StartedExecution> for StartExecutionResponse {
    fn from(value: StartedExecution) -> Self {
        Self {
            execution: value.record.into(),
            lock: value.lock.into(),
        }
    }
}

impl From<&FanOutReport> for FanOutSummaryResponse {
    fn from(value: &FanOutReport) -> Self {
        Self {
            skipped: value.skipped,
            delivered: value.delivered,
            up_to_date: value.up_to_date,
            failed: value.failures.len(),
        }
    }
}

impl From<IngestOutcome> for IngestLogsResponse {
    fn from(value: IngestOutcome) -> Self {
        Self {
            start_index: value.batch.start_index,
            end_index: value.batch.end_index(),
            count: value.batch.count,
            replayed: value.batch.replayed,
            fan_out: value.fan_out.as_ref().map(FanOutSummaryResponse::from),
        }
    }
}

impl From<CompletedExecution> for CompleteExecutionResponse {
    fn from(value: CompletedExecution) -> Self {
        Self {
            stamped_rows: value.retention.stamped,
            retention_complete: value.retention.is_complete(),
            notified_viewers: value.notified,
            execution: value.record.into(),
        }
    }
}

impl From<LogEntry> for LogEntryResponse {
    fn from(value: LogEntry) -> Self {
        Self {
            index: value.index,
            timestamp: value.timestamp,
            message: value.message,
        }
    }
}

impl From<IssuedViewerToken> for ViewerTokenResponse {
    fn from(value: IssuedViewerToken) -> Self {
        Self {
            token: value.token,
            pending_connection_id: value.pending_connection_id,
            expires_at: value.expires_at,
        }
    }
}
