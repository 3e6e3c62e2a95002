//! Application services and ports.

#![forbid(unsafe_code)]

mod connection_registry;
mod delivery_ports;
mod delivery_service;
mod execution_service;
mod lock_service;
mod log_service;
mod store_ports;

#[cfg(test)]
mod test_support;

pub use connection_registry::{ConnectionMetadata, ConnectionRegistry, IssuedViewerToken};
pub use delivery_ports::{
    ExecutionRecord, ExecutionStatusReader, PushOutcome, PushSubscriber, PushSubscription,
    PushTransport,
};
pub use delivery_service::{
    ConnectionDelivery, ConnectionFailure, DEFAULT_FANOUT_CONCURRENCY, DeliveryService,
    FanOutReport,
};
pub use execution_service::{
    CompletedExecution, DEFAULT_LOG_RETENTION_SECONDS, ExecutionService, ExecutionStatusStore,
    IngestOutcome, StartedExecution,
};
pub use lock_service::LockService;
pub use log_service::{ExpireBatchFailure, ExpireReport, IngestedBatch, LogService};
pub use store_ports::{
    Attributes, BatchWriteRequest, Condition, ItemKey, ItemUpdate, KeyValueStore,
    MAX_BATCH_WRITE_ITEMS, PartitionQuery, QueryPage, SortDirection, StoreItem, StoreTable,
    WriteOutcome,
};
