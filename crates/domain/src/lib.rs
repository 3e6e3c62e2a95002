//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod connection;
mod execution;
mod lock;
mod log;

pub use connection::{PENDING_CONNECTION_PREFIX, ViewerConnection, pending_connection_id};
pub use execution::ExecutionStatus;
pub use lock::{ExecutionLock, LockStatus};
pub use log::{DisconnectNotice, LogEntry, LogLine, encode_ndjson};
