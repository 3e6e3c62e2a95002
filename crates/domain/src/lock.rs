use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_core::{AppError, AppResult};

/// Lifecycle status of one lock row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// Lock was acquired and is held until it expires or is released.
    Active,
    /// Lock was released by its holder.
    Released,
}

impl LockStatus {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Released => "released",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "active" => Ok(Self::Active),
            "released" => Ok(Self::Released),
            _ => Err(AppError::Validation(format!(
                "unknown lock status '{value}'"
            ))),
        }
    }
}

/// Mutual-exclusion record for one named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLock {
    /// Protected resource name, unique per lock row.
    pub lock_name: String,
    /// Opaque token regenerated on every successful acquisition.
    pub lock_id: String,
    /// Execution currently associated with the lock.
    pub execution_id: String,
    /// Identity of the caller that acquired the lock.
    pub holder_identity: String,
    /// Time of the latest acquisition or renewal.
    pub acquired_at: DateTime<Utc>,
    /// Instant after which the lock is logically free.
    pub expires_at: DateTime<Utc>,
    /// Lifecycle status.
    pub status: LockStatus,
}

impl ExecutionLock {
    /// Returns true when the lock is active and not yet expired at `now`.
    #[must_use]
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.status == LockStatus::Active && now < self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    use super::{ExecutionLock, LockStatus};

    fn lock_expiring_in(seconds: i64, status: LockStatus) -> ExecutionLock {
        let acquired_at = Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .unwrap_or_else(|| unreachable!());

        ExecutionLock {
            lock_name: "env-prod".to_owned(),
            lock_id: "lock-1".to_owned(),
            execution_id: "exec-1".to_owned(),
            holder_identity: "alice".to_owned(),
            acquired_at,
            expires_at: acquired_at + Duration::seconds(seconds),
            status,
        }
    }

    #[test]
    fn released_lock_is_never_held() {
        let lock = lock_expiring_in(1800, LockStatus::Released);
        assert!(!lock.is_held_at(lock.acquired_at));
    }

    #[test]
    fn status_round_trips_through_storage_value() {
        for status in [LockStatus::Active, LockStatus::Released] {
            assert_eq!(LockStatus::parse(status.as_str()).ok(), Some(status));
        }
        assert!(LockStatus::parse("releasing").is_err());
    }

    proptest! {
        #[test]
        fn active_lock_is_held_exactly_before_expiry(ttl in 1_i64..10_000, offset in 0_i64..20_000) {
            let lock = lock_expiring_in(ttl, LockStatus::Active);
            let now = lock.acquired_at + Duration::seconds(offset);
            prop_assert_eq!(lock.is_held_at(now), offset < ttl);
        }
    }
}
