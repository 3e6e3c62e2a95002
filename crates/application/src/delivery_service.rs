//! Bounded fan-out of sequenced log entries to live viewers.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tether_core::{AppError, AppResult, NonEmptyString};
use tether_domain::{DisconnectNotice, ExecutionStatus, ViewerConnection, encode_ndjson};
use tracing::{debug, info, warn};

use crate::connection_registry::ConnectionRegistry;
use crate::delivery_ports::{ExecutionStatusReader, PushOutcome, PushTransport};
use crate::log_service::LogService;

/// Default cap on in-flight pushes per fan-out call.
pub const DEFAULT_FANOUT_CONCURRENCY: usize = 10;

/// Result of pushing to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDelivery {
    /// Entries were pushed and the cursor now points at `last_index`.
    Delivered {
        /// Highest index pushed.
        last_index: i64,
    },
    /// Nothing newer than the connection cursor.
    UpToDate,
    /// The transport no longer knows the connection.
    Gone,
}

/// Per-connection delivery failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFailure {
    /// Failed connection.
    pub connection_id: String,
    /// Human-readable reason.
    pub reason: String,
}

/// Aggregate outcome of one fan-out call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// True when the execution was not running and no push was attempted.
    pub skipped: bool,
    /// Connections that received a payload.
    pub delivered: usize,
    /// Connections whose cursor was already current.
    pub up_to_date: usize,
    /// Connections that failed.
    pub failures: Vec<ConnectionFailure>,
}

impl FanOutReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn attempted(&self) -> usize {
        self.delivered + self.failures.len()
    }

    fn all_failed(&self) -> bool {
        self.attempted() > 0 && self.delivered == 0
    }
}

/// Delivery fan-out service.
#[derive(Clone)]
pub struct DeliveryService {
    log_service: LogService,
    registry: ConnectionRegistry,
    transport: Arc<dyn PushTransport>,
    status_reader: Arc<dyn ExecutionStatusReader>,
    concurrency: usize,
}

impl DeliveryService {
    /// Creates a fan-out service with the default concurrency cap.
    #[must_use]
    pub fn new(
        log_service: LogService,
        registry: ConnectionRegistry,
        transport: Arc<dyn PushTransport>,
        status_reader: Arc<dyn ExecutionStatusReader>,
    ) -> Self {
        Self {
            log_service,
            registry,
            transport,
            status_reader,
            concurrency: DEFAULT_FANOUT_CONCURRENCY,
        }
    }

    /// Overrides the cap on in-flight pushes.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Pushes unseen entries to every active viewer of a running execution.
    ///
    /// Failures are isolated per connection. The call fails only when every
    /// attempted push failed.
    pub async fn deliver_new_entries(&self, execution_id: &str) -> AppResult<FanOutReport> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        let status = self
            .status_reader
            .execution_status(execution_id.as_str())
            .await?;
        if status != Some(ExecutionStatus::Running) {
            debug!(
                execution_id = %execution_id,
                status = status.map(|status| status.as_str()),
                "skipping live delivery for execution that is not running"
            );
            return Ok(FanOutReport::skipped());
        }

        let connections = self
            .registry
            .list_active_for_execution(execution_id.as_str())
            .await?;
        if connections.is_empty() {
            return Ok(FanOutReport::default());
        }

        let outcomes: Vec<(String, AppResult<ConnectionDelivery>)> = stream::iter(connections)
            .map(|connection| async move {
                let outcome = self.deliver_to_connection(&connection).await;
                (connection.connection_id, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = FanOutReport::default();
        for (connection_id, outcome) in outcomes {
            match outcome {
                Ok(ConnectionDelivery::Delivered { .. }) => report.delivered += 1,
                Ok(ConnectionDelivery::UpToDate) => report.up_to_date += 1,
                Ok(ConnectionDelivery::Gone) => {
                    self.forget_gone_connection(connection_id.as_str()).await;
                    report.failures.push(ConnectionFailure {
                        connection_id,
                        reason: "connection is gone".to_owned(),
                    });
                }
                Err(error) => {
                    warn!(
                        execution_id = %execution_id,
                        connection_id = %connection_id,
                        error = %error,
                        "failed to deliver log entries"
                    );
                    report.failures.push(ConnectionFailure {
                        connection_id,
                        reason: error.to_string(),
                    });
                }
            }
        }

        if report.all_failed() {
            return Err(AppError::Internal(format!(
                "failed to deliver log entries for execution '{execution_id}' to all {} connections",
                report.failures.len()
            )));
        }

        Ok(report)
    }

    /// Pushes everything after the connection cursor and advances the cursor
    /// once the transport confirms the push.
    pub async fn deliver_to_connection(
        &self,
        connection: &ViewerConnection,
    ) -> AppResult<ConnectionDelivery> {
        let entries = self
            .log_service
            .read_since(connection.execution_id.as_str(), connection.last_index)
            .await?;
        let Some(last_index) = entries.last().map(|entry| entry.index) else {
            return Ok(ConnectionDelivery::UpToDate);
        };

        let payload = encode_ndjson(&entries)?;
        match self
            .transport
            .send(connection.connection_id.as_str(), payload.into_bytes())
            .await?
        {
            PushOutcome::Gone => {
                warn!(
                    execution_id = %connection.execution_id,
                    connection_id = %connection.connection_id,
                    "viewer connection is gone"
                );
                Ok(ConnectionDelivery::Gone)
            }
            PushOutcome::Delivered => {
                if let Err(error) = self
                    .registry
                    .advance_cursor(connection.connection_id.as_str(), last_index)
                    .await
                {
                    warn!(
                        execution_id = %connection.execution_id,
                        connection_id = %connection.connection_id,
                        last_index,
                        error = %error,
                        "failed to advance delivery cursor; entries may be redelivered"
                    );
                }
                debug!(
                    execution_id = %connection.execution_id,
                    connection_id = %connection.connection_id,
                    entries = entries.len(),
                    last_index,
                    "delivered log entries"
                );
                Ok(ConnectionDelivery::Delivered { last_index })
            }
        }
    }

    /// Sends the completion notice to every active viewer, then deletes all
    /// connection rows of the execution.
    pub fn notify_execution_completion<'a>(
        &'a self,
        execution_id: &'a str,
    ) -> impl std::future::Future<Output = AppResult<FanOutReport>> + Send + 'a {
        async move {
            let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
            let connections = self
                .registry
                .list_for_execution(execution_id.as_str())
                .await?;
            if connections.is_empty() {
                return Ok(FanOutReport::default());
            }

            let notice = DisconnectNotice::execution_completed().to_json()?;
            let active: Vec<&ViewerConnection> = connections
                .iter()
                .filter(|connection| !connection.is_pending())
                .collect();

            let sends: Vec<_> = active
                .into_iter()
                .map(|connection| {
                    let payload = notice.clone().into_bytes();
                    async move {
                        let outcome = self
                            .transport
                            .send(connection.connection_id.as_str(), payload)
                            .await;
                        (connection.connection_id.as_str(), outcome)
                    }
                })
                .collect();
            let outcomes: Vec<(&str, AppResult<PushOutcome>)> = stream::iter(sends)
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            let mut report = FanOutReport::default();
            for (connection_id, outcome) in outcomes {
                let reason = match outcome {
                    Ok(PushOutcome::Delivered) => {
                        report.delivered += 1;
                        continue;
                    }
                    Ok(PushOutcome::Gone) => "connection is gone".to_owned(),
                    Err(error) => error.to_string(),
                };
                warn!(
                    execution_id = %execution_id,
                    connection_id,
                    reason = %reason,
                    "failed to push completion notice"
                );
                report.failures.push(ConnectionFailure {
                    connection_id: connection_id.to_owned(),
                    reason,
                });
            }

            let connection_ids: Vec<String> = connections
                .iter()
                .map(|connection| connection.connection_id.clone())
                .collect();
            match self.registry.delete_all(&connection_ids).await {
                Ok(removed) => info!(
                    execution_id = %execution_id,
                    removed,
                    notified = report.delivered,
                    "closed viewer connections for completed execution"
                ),
                Err(error) => warn!(
                    execution_id = %execution_id,
                    error = %error,
                    "failed to delete connections of completed execution"
                ),
            }

            if report.all_failed() {
                return Err(AppError::Internal(format!(
                    "failed to notify any of {} viewers of execution '{execution_id}'",
                    report.failures.len()
                )));
            }

            Ok(report)
        }
    }

    async fn forget_gone_connection(&self, connection_id: &str) {
        if let Err(error) = self.registry.disconnect(connection_id).await {
            warn!(
                connection_id,
                error = %error,
                "failed to delete gone viewer connection"
            );
        }
    }
}
