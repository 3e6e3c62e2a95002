//! Execution lifecycle around the lock, the log and viewer delivery.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tether_core::{AppError, AppResult, NonEmptyString};
use tether_domain::{ExecutionLock, ExecutionStatus, LogEntry, LogLine};
use tracing::{info, warn};

use crate::delivery_ports::ExecutionRecord;
use crate::delivery_service::{DeliveryService, FanOutReport};
use crate::lock_service::LockService;
use crate::log_service::{ExpireBatchFailure, ExpireReport, IngestedBatch, LogService};
use crate::store_ports::KeyValueStore;

mod status_store;

pub use status_store::ExecutionStatusStore;

/// Default retention stamped on log entries of completed executions.
pub const DEFAULT_LOG_RETENTION_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Execution that was started under a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedExecution {
    /// Status row after the transition to running.
    pub record: ExecutionRecord,
    /// Lock acquired for the execution.
    pub lock: ExecutionLock,
}

/// Outcome of one producer batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Placement of the batch in the log.
    pub batch: IngestedBatch,
    /// Fan-out result, absent when delivery failed for every viewer.
    pub fan_out: Option<FanOutReport>,
}

/// Outcome of completing an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedExecution {
    /// Status row after the terminal transition.
    pub record: ExecutionRecord,
    /// Retention stamping outcome.
    pub retention: ExpireReport,
    /// Number of viewers that received the completion notice.
    pub notified: usize,
}

/// Execution lifecycle service.
#[derive(Clone)]
pub struct ExecutionService {
    executions: ExecutionStatusStore,
    locks: LockService,
    logs: LogService,
    delivery: DeliveryService,
    log_retention: Duration,
}

impl ExecutionService {
    /// Creates an execution service.
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        locks: LockService,
        logs: LogService,
        delivery: DeliveryService,
    ) -> Self {
        Self {
            executions: ExecutionStatusStore::new(store),
            locks,
            logs,
            delivery,
            log_retention: Duration::seconds(DEFAULT_LOG_RETENTION_SECONDS),
        }
    }

    /// Overrides how long log entries live after completion.
    #[must_use]
    pub fn with_log_retention(mut self, log_retention: Duration) -> Self {
        self.log_retention = log_retention;
        self
    }

    /// Records a new execution in `provisioning`.
    pub async fn register(&self, execution_id: &str) -> AppResult<ExecutionRecord> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        let now = Utc::now();
        let record = ExecutionRecord {
            execution_id: execution_id.into(),
            status: ExecutionStatus::Provisioning,
            lock_name: None,
            holder_identity: None,
            created_at: now,
            updated_at: now,
        };

        if !self.executions.create(&record).await?.is_applied() {
            return Err(AppError::Conflict(format!(
                "execution '{}' already exists",
                record.execution_id
            )));
        }

        Ok(record)
    }

    /// Acquires the lock and moves the execution to `running`.
    ///
    /// Unknown executions are created directly in `running`. The lock is
    /// released again when the status transition is rejected.
    pub async fn start(
        &self,
        execution_id: &str,
        lock_name: &str,
        holder_identity: &str,
        ttl_seconds: u32,
    ) -> AppResult<StartedExecution> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        let lock = self
            .locks
            .acquire(
                lock_name,
                execution_id.as_str(),
                holder_identity,
                ttl_seconds,
            )
            .await?;

        match self.mark_running(execution_id.as_str(), &lock).await {
            Ok(record) => {
                info!(
                    execution_id = %execution_id,
                    lock_name = %lock.lock_name,
                    "execution started"
                );
                Ok(StartedExecution { record, lock })
            }
            Err(error) => {
                if let Err(release_error) = self
                    .locks
                    .release(lock.lock_name.as_str(), execution_id.as_str())
                    .await
                {
                    warn!(
                        execution_id = %execution_id,
                        lock_name = %lock.lock_name,
                        error = %release_error,
                        "failed to release lock after rejected start"
                    );
                }
                Err(error)
            }
        }
    }

    /// Sequences a producer batch and fans it out to live viewers.
    ///
    /// A fan-out that fails for every viewer is logged; the batch itself
    /// stays committed.
    pub async fn ingest_logs(
        &self,
        execution_id: &str,
        batch_id: Option<&str>,
        lines: &[LogLine],
    ) -> AppResult<IngestOutcome> {
        let record = self.status(execution_id).await?;
        if record.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "execution '{}' already finished with status '{}'",
                record.execution_id,
                record.status.as_str()
            )));
        }

        let batch = self
            .logs
            .ingest_batch(record.execution_id.as_str(), batch_id, lines)
            .await?;

        let fan_out = match self
            .delivery
            .deliver_new_entries(record.execution_id.as_str())
            .await
        {
            Ok(report) => Some(report),
            Err(error) => {
                warn!(
                    execution_id = %record.execution_id,
                    start_index = batch.start_index,
                    error = %error,
                    "log batch stored but live delivery failed"
                );
                None
            }
        };

        Ok(IngestOutcome { batch, fan_out })
    }

    /// Records the terminal status, stamps log retention, disconnects viewers
    /// and releases the lock.
    pub async fn complete(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> AppResult<CompletedExecution> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        if !status.is_terminal() {
            return Err(AppError::Validation(format!(
                "'{}' is not a terminal execution status",
                status.as_str()
            )));
        }

        let record = match self
            .executions
            .transition(
                execution_id.as_str(),
                &[ExecutionStatus::Provisioning, ExecutionStatus::Running],
                status,
                None,
            )
            .await?
        {
            Some(record) => record,
            None => {
                let current = self.status(execution_id.as_str()).await?;
                return Err(AppError::Conflict(format!(
                    "execution '{execution_id}' already finished with status '{}'",
                    current.status.as_str()
                )));
            }
        };

        // The terminal status is committed; nothing below may abort completion.
        let retention = match self
            .logs
            .expire_all(execution_id.as_str(), Utc::now() + self.log_retention)
            .await
        {
            Ok(report) => report,
            Err(error) => ExpireReport {
                stamped: 0,
                failed_batches: vec![ExpireBatchFailure {
                    offset: 0,
                    error: error.to_string(),
                }],
            },
        };
        if !retention.is_complete() {
            warn!(
                execution_id = %execution_id,
                failed_batches = retention.failed_batches.len(),
                "log retention was stamped partially"
            );
        }

        let notified = match self
            .delivery
            .notify_execution_completion(execution_id.as_str())
            .await
        {
            Ok(report) => report.delivered,
            Err(error) => {
                warn!(
                    execution_id = %execution_id,
                    error = %error,
                    "failed to notify viewers of completion"
                );
                0
            }
        };

        if let Some(lock_name) = record.lock_name.as_deref() {
            match self.locks.release(lock_name, execution_id.as_str()).await {
                Ok(()) => {}
                Err(AppError::NotHeld(message)) => {
                    info!(
                        execution_id = %execution_id,
                        lock_name,
                        message = %message,
                        "lock was already free at completion"
                    );
                }
                Err(error) => {
                    warn!(
                        execution_id = %execution_id,
                        lock_name,
                        error = %error,
                        "failed to release lock at completion; it frees at expiry"
                    );
                }
            }
        }

        info!(
            execution_id = %execution_id,
            status = status.as_str(),
            notified,
            "execution completed"
        );
        Ok(CompletedExecution {
            record,
            retention,
            notified,
        })
    }

    /// Returns the execution row or `NotFound`.
    pub async fn status(&self, execution_id: &str) -> AppResult<ExecutionRecord> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        self.executions
            .get(execution_id.as_str())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("execution '{execution_id}' does not exist")))
    }

    /// Reads one page of the execution log for polling clients.
    ///
    /// Fails with `ServiceUnavailable` while a provisioning execution has not
    /// produced its first line.
    pub async fn read_logs(
        &self,
        execution_id: &str,
        after_index: i64,
        limit: usize,
    ) -> AppResult<Vec<LogEntry>> {
        let record = self.status(execution_id).await?;
        let execution_id = record.execution_id.as_str();

        if record.status == ExecutionStatus::Provisioning
            && !self.logs.is_materialized(execution_id).await?
        {
            return Err(AppError::ServiceUnavailable(format!(
                "log stream for execution '{execution_id}' is not available yet"
            )));
        }

        self.logs.read_page(execution_id, after_index, limit).await
    }

    /// Shared status reader for delivery fan-out.
    #[must_use]
    pub fn status_reader(&self) -> ExecutionStatusStore {
        self.executions.clone()
    }

    async fn mark_running(
        &self,
        execution_id: &str,
        lock: &ExecutionLock,
    ) -> AppResult<ExecutionRecord> {
        let lock_fields = Some((lock.lock_name.as_str(), lock.holder_identity.as_str()));
        if let Some(record) = self
            .executions
            .transition(
                execution_id,
                &[ExecutionStatus::Provisioning],
                ExecutionStatus::Running,
                lock_fields,
            )
            .await?
        {
            return Ok(record);
        }

        let now = Utc::now();
        let record = ExecutionRecord {
            execution_id: execution_id.to_owned(),
            status: ExecutionStatus::Running,
            lock_name: Some(lock.lock_name.clone()),
            holder_identity: Some(lock.holder_identity.clone()),
            created_at: now,
            updated_at: now,
        };
        if self.executions.create(&record).await?.is_applied() {
            return Ok(record);
        }

        Err(AppError::Conflict(format!(
            "execution '{execution_id}' was already started"
        )))
    }
}
