//! Key-value store port consumed by every coordination service.
//!
//! The store offers single-item atomicity only: conditional put/update/delete
//! on one item, a numeric increment that returns the new value, range queries
//! over one partition, and small batched writes without cross-item guarantees.

mod condition;
mod item;

use async_trait::async_trait;
use tether_core::AppResult;

pub use condition::{Condition, ItemUpdate};
pub use item::{Attributes, ItemKey, StoreItem, StoreTable};

/// Largest number of requests accepted by one `batch_write` call.
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

/// Result of a conditional single-item write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The condition held and the write was committed.
    Applied,
    /// The condition did not hold; nothing was written.
    ConditionFailed,
}

impl WriteOutcome {
    /// Returns true when the write was committed.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Sort order for partition range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Lowest sort key first.
    Ascending,
    /// Highest sort key first.
    Descending,
}

/// Range query over the items of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionQuery {
    /// Table to read.
    pub table: StoreTable,
    /// Partition to read.
    pub partition_key: String,
    /// Exclusive start sort key in query direction; doubles as the page cursor.
    pub after_sort_key: Option<i64>,
    /// Result order.
    pub direction: SortDirection,
    /// Page size.
    pub limit: usize,
}

impl PartitionQuery {
    /// Creates an ascending query starting after `after_sort_key`.
    #[must_use]
    pub fn ascending(
        table: StoreTable,
        partition_key: impl Into<String>,
        after_sort_key: Option<i64>,
        limit: usize,
    ) -> Self {
        Self {
            table,
            partition_key: partition_key.into(),
            after_sort_key,
            direction: SortDirection::Ascending,
            limit,
        }
    }
}

/// One page of partition query results.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryPage {
    /// Items in query direction.
    pub items: Vec<StoreItem>,
    /// Cursor for the next page, absent once the partition is exhausted.
    pub next_sort_key: Option<i64>,
}

/// One request inside a batched write.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchWriteRequest {
    /// Unconditionally writes the item.
    Put(StoreItem),
    /// Unconditionally deletes the item.
    Delete(ItemKey),
}

/// Persistence port with single-item atomic operations.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the item for one key, if present and not expired.
    async fn get_item(&self, key: &ItemKey) -> AppResult<Option<StoreItem>>;

    /// Writes the whole item when the condition holds against the current item.
    async fn put_item(&self, item: StoreItem, condition: Condition) -> AppResult<WriteOutcome>;

    /// Applies an update when the condition holds and returns the new item.
    ///
    /// Returns `None` when the condition failed. An absent item is created
    /// when the condition allows it.
    async fn update_item(
        &self,
        key: &ItemKey,
        update: ItemUpdate,
        condition: Condition,
    ) -> AppResult<Option<StoreItem>>;

    /// Deletes one item when the condition holds.
    async fn delete_item(&self, key: &ItemKey, condition: Condition) -> AppResult<WriteOutcome>;

    /// Reads one page of a partition in sort key order.
    async fn query_partition(&self, query: PartitionQuery) -> AppResult<QueryPage>;

    /// Returns every live item of a table carrying the secondary lookup key.
    async fn query_lookup(&self, table: StoreTable, lookup_key: &str) -> AppResult<Vec<StoreItem>>;

    /// Applies up to `MAX_BATCH_WRITE_ITEMS` unconditional writes.
    ///
    /// Returns the number of items actually affected; deletes of absent items
    /// do not count. The batch is not atomic.
    async fn batch_write(&self, requests: Vec<BatchWriteRequest>) -> AppResult<usize>;
}
