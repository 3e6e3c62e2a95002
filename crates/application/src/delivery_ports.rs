use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tether_core::AppResult;
use tether_domain::ExecutionStatus;

/// Result of pushing one payload to one viewer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The transport accepted the payload for the connection.
    Delivered,
    /// The connection no longer exists on the transport.
    Gone,
}

/// Transport that pushes bytes to one live connection.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Sends one payload to the connection.
    async fn send(&self, connection_id: &str, payload: Vec<u8>) -> AppResult<PushOutcome>;
}

/// Stream of payloads pushed to one connection.
pub type PushSubscription = BoxStream<'static, Vec<u8>>;

/// Receiving side of a push transport, owned by the process holding the socket.
#[async_trait]
pub trait PushSubscriber: Send + Sync {
    /// Starts receiving payloads addressed to the connection until the stream is dropped.
    async fn subscribe(&self, connection_id: &str) -> AppResult<PushSubscription>;
}

/// Persisted execution status row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    /// Execution identifier.
    pub execution_id: String,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// Lock guarding the execution, once started.
    pub lock_name: Option<String>,
    /// Identity that started the execution.
    pub holder_identity: Option<String>,
    /// Time the row was created.
    pub created_at: DateTime<Utc>,
    /// Time the status last changed.
    pub updated_at: DateTime<Utc>,
}

/// Read port for execution status consumed by delivery fan-out.
#[async_trait]
pub trait ExecutionStatusReader: Send + Sync {
    /// Returns the current status, or `None` for unknown executions.
    async fn execution_status(&self, execution_id: &str) -> AppResult<Option<ExecutionStatus>>;
}
