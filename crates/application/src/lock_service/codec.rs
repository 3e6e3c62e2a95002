use tether_core::AppResult;
use tether_domain::{ExecutionLock, LockStatus};

use crate::store_ports::{StoreItem, StoreTable};

use super::lock_key;

pub(super) fn lock_to_item(lock: &ExecutionLock) -> StoreItem {
    StoreItem::new(lock_key(lock.lock_name.as_str()))
        .with_attribute("lock_id", lock.lock_id.as_str())
        .with_attribute("execution_id", lock.execution_id.as_str())
        .with_attribute("holder_identity", lock.holder_identity.as_str())
        .with_attribute("acquired_at", lock.acquired_at.timestamp_millis())
        .with_attribute("expires_at", lock.expires_at.timestamp_millis())
        .with_attribute("status", lock.status.as_str())
}

pub(super) fn lock_from_item(item: &StoreItem) -> AppResult<ExecutionLock> {
    debug_assert_eq!(item.key.table, StoreTable::Locks);

    Ok(ExecutionLock {
        lock_name: item.key.partition_key.clone(),
        lock_id: item.string_attribute("lock_id")?,
        execution_id: item.string_attribute("execution_id")?,
        holder_identity: item.string_attribute("holder_identity")?,
        acquired_at: item.timestamp_attribute("acquired_at")?,
        expires_at: item.timestamp_attribute("expires_at")?,
        status: LockStatus::parse(item.string_attribute("status")?.as_str())?,
    })
}
