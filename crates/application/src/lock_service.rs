//! Execution lock manager built on conditional single-item writes.
//!
//! A lock row is held while `status = active` and `now < expires_at`. Rows are
//! never deleted: a competing `acquire` overwrites an expired or released row.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tether_core::{AppError, AppResult, NonEmptyString};
use tether_domain::{ExecutionLock, LockStatus};
use tracing::{debug, info};

use crate::store_ports::{Condition, ItemKey, ItemUpdate, KeyValueStore, StoreTable};

mod codec;

use codec::{lock_from_item, lock_to_item};

/// Lock manager service.
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn KeyValueStore>,
}

impl LockService {
    /// Creates a lock service over one store.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Acquires the named lock for one execution.
    ///
    /// Fails with `Conflict` while another row is held; the error names the
    /// current holder and expiry when they can be read back.
    pub async fn acquire(
        &self,
        lock_name: &str,
        execution_id: &str,
        holder_identity: &str,
        ttl_seconds: u32,
    ) -> AppResult<ExecutionLock> {
        let lock_name = NonEmptyString::for_field("lock_name", lock_name)?;
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        let holder_identity = NonEmptyString::for_field("holder_identity", holder_identity)?;
        validate_ttl(ttl_seconds)?;

        let now = Utc::now();
        let lock = ExecutionLock {
            lock_name: lock_name.into(),
            lock_id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.into(),
            holder_identity: holder_identity.into(),
            acquired_at: now,
            expires_at: expiry_after(now, ttl_seconds),
            status: LockStatus::Active,
        };

        let free_slot = Condition::NotExists
            .or(Condition::attribute_less_than(
                "expires_at",
                now.timestamp_millis(),
            ))
            .or(Condition::attribute_equals(
                "status",
                LockStatus::Released.as_str(),
            ));

        let outcome = self.store.put_item(lock_to_item(&lock), free_slot).await?;
        if !outcome.is_applied() {
            return Err(self.conflict_for(lock.lock_name.as_str(), now).await);
        }

        info!(
            lock_name = %lock.lock_name,
            execution_id = %lock.execution_id,
            lock_id = %lock.lock_id,
            expires_at = %lock.expires_at,
            "lock acquired"
        );
        Ok(lock)
    }

    /// Releases the named lock when it belongs to the execution.
    pub async fn release(&self, lock_name: &str, execution_id: &str) -> AppResult<()> {
        let lock_name = NonEmptyString::for_field("lock_name", lock_name)?;
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;

        let now = Utc::now();
        let update = ItemUpdate::new()
            .set("status", LockStatus::Released.as_str())
            .set("expires_at", now.timestamp_millis());
        let owned_by_caller = Condition::Exists.and(Condition::attribute_equals(
            "execution_id",
            execution_id.as_str(),
        ));

        let updated = self
            .store
            .update_item(&lock_key(lock_name.as_str()), update, owned_by_caller)
            .await?;
        if updated.is_none() {
            return Err(not_held(lock_name.as_str(), execution_id.as_str()));
        }

        info!(
            lock_name = %lock_name,
            execution_id = %execution_id,
            "lock released"
        );
        Ok(())
    }

    /// Extends the lock from now while the execution still owns the active row.
    pub async fn renew(
        &self,
        lock_name: &str,
        execution_id: &str,
        ttl_seconds: u32,
    ) -> AppResult<ExecutionLock> {
        let lock_name = NonEmptyString::for_field("lock_name", lock_name)?;
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        validate_ttl(ttl_seconds)?;

        let now = Utc::now();
        let update = ItemUpdate::new()
            .set("acquired_at", now.timestamp_millis())
            .set(
                "expires_at",
                expiry_after(now, ttl_seconds).timestamp_millis(),
            );
        let active_for_caller = Condition::Exists
            .and(Condition::attribute_equals(
                "execution_id",
                execution_id.as_str(),
            ))
            .and(Condition::attribute_equals(
                "status",
                LockStatus::Active.as_str(),
            ));

        let updated = self
            .store
            .update_item(&lock_key(lock_name.as_str()), update, active_for_caller)
            .await?
            .ok_or_else(|| not_held(lock_name.as_str(), execution_id.as_str()))?;

        let lock = lock_from_item(&updated)?;
        debug!(
            lock_name = %lock.lock_name,
            execution_id = %lock.execution_id,
            expires_at = %lock.expires_at,
            "lock renewed"
        );
        Ok(lock)
    }

    /// Returns the lock while it is held; released and expired rows read as `None`.
    pub async fn get(&self, lock_name: &str) -> AppResult<Option<ExecutionLock>> {
        let lock_name = NonEmptyString::for_field("lock_name", lock_name)?;
        let Some(item) = self.store.get_item(&lock_key(lock_name.as_str())).await? else {
            return Ok(None);
        };

        let lock = lock_from_item(&item)?;
        Ok(lock.is_held_at(Utc::now()).then_some(lock))
    }

    async fn conflict_for(&self, lock_name: &str, now: DateTime<Utc>) -> AppError {
        let holder = match self.store.get_item(&lock_key(lock_name)).await {
            Ok(Some(item)) => lock_from_item(&item).ok(),
            _ => None,
        };

        match holder {
            Some(holder) if holder.is_held_at(now) => {
                info!(
                    lock_name,
                    holder_execution_id = %holder.execution_id,
                    "lock acquisition rejected"
                );
                AppError::Conflict(format!(
                    "lock '{lock_name}' is held by execution '{}' until {}",
                    holder.execution_id,
                    holder.expires_at.to_rfc3339()
                ))
            }
            _ => AppError::Conflict(format!("lock '{lock_name}' is already held")),
        }
    }
}

fn lock_key(lock_name: &str) -> ItemKey {
    ItemKey::single(StoreTable::Locks, lock_name)
}

fn validate_ttl(ttl_seconds: u32) -> AppResult<()> {
    if ttl_seconds == 0 {
        return Err(AppError::Validation(
            "ttl_seconds must be greater than zero".to_owned(),
        ));
    }

    Ok(())
}

fn expiry_after(now: DateTime<Utc>, ttl_seconds: u32) -> DateTime<Utc> {
    now + Duration::seconds(i64::from(ttl_seconds))
}

fn not_held(lock_name: &str, execution_id: &str) -> AppError {
    AppError::NotHeld(format!(
        "lock '{lock_name}' is not held by execution '{execution_id}'"
    ))
}
