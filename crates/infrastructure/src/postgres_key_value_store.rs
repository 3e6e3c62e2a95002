//! PostgreSQL-backed key-value store over the `kv_items` table.
//!
//! Conditions are evaluated in Rust against the current row and committed
//! with a compare-and-swap on the `version` column, retried on contention.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tether_application::{
    Attributes, BatchWriteRequest, Condition, ItemKey, ItemUpdate, KeyValueStore,
    MAX_BATCH_WRITE_ITEMS, PartitionQuery, QueryPage, SortDirection, StoreItem, StoreTable,
    WriteOutcome,
};
use tether_core::{AppError, AppResult};
use tracing::debug;

const MAX_CAS_ATTEMPTS: usize = 16;

/// PostgreSQL implementation of the key-value store port.
#[derive(Clone)]
pub struct PostgresKeyValueStore {
    pool: PgPool,
}

impl PostgresKeyValueStore {
    /// Creates a store with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Physically removes rows whose expiry passed before `before`.
    pub async fn purge_expired(&self, before: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM kv_items
            WHERE expires_at IS NOT NULL AND expires_at <= $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to purge expired items: {error}")))?;

        Ok(result.rows_affected())
    }

    async fn fetch_row(&self, key: &ItemKey) -> AppResult<Option<VersionedItem>> {
        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT table_name, partition_key, sort_key, lookup_key, attributes, expires_at, version
            FROM kv_items
            WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3
            "#,
        )
        .bind(key.table.as_str())
        .bind(key.partition_key.as_str())
        .bind(key.sort_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to read store item: {error}")))?;

        row.map(VersionedItem::try_from).transpose()
    }

    /// Commits `item` if the row still has `expected_version`, or inserts it
    /// when no row existed. Returns false when another writer won.
    ///
    /// Versions come from one sequence, so a deleted and re-inserted row never
    /// repeats a version an earlier reader may still hold.
    async fn compare_and_swap(
        &self,
        item: &StoreItem,
        expected_version: Option<i64>,
    ) -> AppResult<bool> {
        let result = match expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO kv_items (
                        table_name, partition_key, sort_key, lookup_key, attributes, expires_at, version
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, nextval('kv_item_version_seq'))
                    ON CONFLICT (table_name, partition_key, sort_key) DO NOTHING
                    "#,
                )
                .bind(item.key.table.as_str())
                .bind(item.key.partition_key.as_str())
                .bind(item.key.sort_key)
                .bind(item.lookup_key.as_deref())
                .bind(Json(&item.attributes))
                .bind(item.expires_at)
                .execute(&self.pool)
                .await
            }
            Some(version) => {
                sqlx::query(
                    r#"
                    UPDATE kv_items
                    SET lookup_key = $4, attributes = $5, expires_at = $6, version = nextval('kv_item_version_seq')
                    WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3 AND version = $7
                    "#,
                )
                .bind(item.key.table.as_str())
                .bind(item.key.partition_key.as_str())
                .bind(item.key.sort_key)
                .bind(item.lookup_key.as_deref())
                .bind(Json(&item.attributes))
                .bind(item.expires_at)
                .bind(version)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(|error| AppError::Internal(format!("failed to write store item: {error}")))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_version(&self, key: &ItemKey, version: i64) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM kv_items
            WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3 AND version = $4
            "#,
        )
        .bind(key.table.as_str())
        .bind(key.partition_key.as_str())
        .bind(key.sort_key)
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to delete store item: {error}")))?;

        Ok(result.rows_affected() == 1)
    }
}

fn contention_error(key: &ItemKey) -> AppError {
    AppError::ServiceUnavailable(format!(
        "gave up writing {} item '{}/{}' after {MAX_CAS_ATTEMPTS} contended attempts",
        key.table.as_str(),
        key.partition_key,
        key.sort_key
    ))
}

#[async_trait]
impl KeyValueStore for PostgresKeyValueStore {
    async fn get_item(&self, key: &ItemKey) -> AppResult<Option<StoreItem>> {
        Ok(self
            .fetch_row(key)
            .await?
            .and_then(|row| row.live_at(Utc::now())))
    }

    async fn put_item(&self, item: StoreItem, condition: Condition) -> AppResult<WriteOutcome> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.fetch_row(&item.key).await?;
            let live = current.as_ref().and_then(|row| row.live_at(Utc::now()));
            if !condition.is_satisfied_by(live.as_ref()) {
                return Ok(WriteOutcome::ConditionFailed);
            }

            let expected_version = current.as_ref().map(|row| row.version);
            if self.compare_and_swap(&item, expected_version).await? {
                return Ok(WriteOutcome::Applied);
            }
            debug!(attempt, table = item.key.table.as_str(), "store put contended");
        }

        Err(contention_error(&item.key))
    }

    async fn update_item(
        &self,
        key: &ItemKey,
        update: ItemUpdate,
        condition: Condition,
    ) -> AppResult<Option<StoreItem>> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.fetch_row(key).await?;
            let live = current.as_ref().and_then(|row| row.live_at(Utc::now()));
            if !condition.is_satisfied_by(live.as_ref()) {
                return Ok(None);
            }

            let mut next = live.unwrap_or_else(|| StoreItem::new(key.clone()));
            update.apply_to(&mut next)?;

            let expected_version = current.as_ref().map(|row| row.version);
            if self.compare_and_swap(&next, expected_version).await? {
                return Ok(Some(next));
            }
            debug!(attempt, table = key.table.as_str(), "store update contended");
        }

        Err(contention_error(key))
    }

    async fn delete_item(&self, key: &ItemKey, condition: Condition) -> AppResult<WriteOutcome> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.fetch_row(key).await?;
            let live = current.as_ref().and_then(|row| row.live_at(Utc::now()));
            if !condition.is_satisfied_by(live.as_ref()) {
                return Ok(WriteOutcome::ConditionFailed);
            }

            let Some(current) = current else {
                return Ok(WriteOutcome::Applied);
            };
            if self.delete_version(key, current.version).await? {
                return Ok(WriteOutcome::Applied);
            }
            debug!(attempt, table = key.table.as_str(), "store delete contended");
        }

        Err(contention_error(key))
    }

    async fn query_partition(&self, query: PartitionQuery) -> AppResult<QueryPage> {
        if query.limit == 0 {
            return Err(AppError::Validation(
                "query limit must be greater than zero".to_owned(),
            ));
        }
        let limit = i64::try_from(query.limit)
            .map_err(|error| AppError::Validation(format!("query limit is too large: {error}")))?;

        let statement = match query.direction {
            SortDirection::Ascending => {
                r#"
                SELECT table_name, partition_key, sort_key, lookup_key, attributes, expires_at, version
                FROM kv_items
                WHERE table_name = $1
                  AND partition_key = $2
                  AND ($3::BIGINT IS NULL OR sort_key > $3)
                  AND (expires_at IS NULL OR expires_at > $4)
                ORDER BY sort_key ASC
                LIMIT $5
                "#
            }
            SortDirection::Descending => {
                r#"
                SELECT table_name, partition_key, sort_key, lookup_key, attributes, expires_at, version
                FROM kv_items
                WHERE table_name = $1
                  AND partition_key = $2
                  AND ($3::BIGINT IS NULL OR sort_key < $3)
                  AND (expires_at IS NULL OR expires_at > $4)
                ORDER BY sort_key DESC
                LIMIT $5
                "#
            }
        };

        let rows = sqlx::query_as::<_, ItemRow>(statement)
            .bind(query.table.as_str())
            .bind(query.partition_key.as_str())
            .bind(query.after_sort_key)
            .bind(Utc::now())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to query store partition: {error}"))
            })?;

        let items = rows
            .into_iter()
            .map(|row| VersionedItem::try_from(row).map(|row| row.item))
            .collect::<AppResult<Vec<_>>>()?;
        let next_sort_key = (items.len() == query.limit)
            .then(|| items.last().map(|item| item.key.sort_key))
            .flatten();

        Ok(QueryPage {
            items,
            next_sort_key,
        })
    }

    async fn query_lookup(
        &self,
        table: StoreTable,
        lookup_key: &str,
    ) -> AppResult<Vec<StoreItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT table_name, partition_key, sort_key, lookup_key, attributes, expires_at, version
            FROM kv_items
            WHERE table_name = $1
              AND lookup_key = $2
              AND (expires_at IS NULL OR expires_at > $3)
            ORDER BY partition_key, sort_key
            "#,
        )
        .bind(table.as_str())
        .bind(lookup_key)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to query store lookup: {error}")))?;

        rows.into_iter()
            .map(|row| VersionedItem::try_from(row).map(|row| row.item))
            .collect()
    }

    async fn batch_write(&self, requests: Vec<BatchWriteRequest>) -> AppResult<usize> {
        if requests.len() > MAX_BATCH_WRITE_ITEMS {
            return Err(AppError::Validation(format!(
                "batch write accepts at most {MAX_BATCH_WRITE_ITEMS} requests, got {}",
                requests.len()
            )));
        }

        let now = Utc::now();
        let mut transaction = self.pool.begin().await.map_err(|error| {
            AppError::Internal(format!("failed to start batch write transaction: {error}"))
        })?;

        let mut affected = 0_u64;
        for request in &requests {
            let result = match request {
                BatchWriteRequest::Put(item) => {
                    sqlx::query(
                        r#"
                        INSERT INTO kv_items (
                            table_name, partition_key, sort_key, lookup_key, attributes, expires_at, version
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, nextval('kv_item_version_seq'))
                        ON CONFLICT (table_name, partition_key, sort_key) DO UPDATE
                        SET
                            lookup_key = EXCLUDED.lookup_key,
                            attributes = EXCLUDED.attributes,
                            expires_at = EXCLUDED.expires_at,
                            version = nextval('kv_item_version_seq')
                        "#,
                    )
                    .bind(item.key.table.as_str())
                    .bind(item.key.partition_key.as_str())
                    .bind(item.key.sort_key)
                    .bind(item.lookup_key.as_deref())
                    .bind(Json(&item.attributes))
                    .bind(item.expires_at)
                    .execute(&mut *transaction)
                    .await
                }
                BatchWriteRequest::Delete(key) => {
                    sqlx::query(
                        r#"
                        DELETE FROM kv_items
                        WHERE table_name = $1
                          AND partition_key = $2
                          AND sort_key = $3
                          AND (expires_at IS NULL OR expires_at > $4)
                        "#,
                    )
                    .bind(key.table.as_str())
                    .bind(key.partition_key.as_str())
                    .bind(key.sort_key)
                    .bind(now)
                    .execute(&mut *transaction)
                    .await
                }
            }
            .map_err(|error| AppError::Internal(format!("failed to apply batch write: {error}")))?;

            affected += result.rows_affected();
        }

        transaction.commit().await.map_err(|error| {
            AppError::Internal(format!("failed to commit batch write: {error}"))
        })?;

        usize::try_from(affected)
            .map_err(|error| AppError::Internal(format!("batch write count overflow: {error}")))
    }
}

#[derive(Debug, FromRow)]
struct ItemRow {
    table_name: String,
    partition_key: String,
    sort_key: i64,
    lookup_key: Option<String>,
    attributes: Json<Attributes>,
    expires_at: Option<DateTime<Utc>>,
    version: i64,
}

struct VersionedItem {
    item: StoreItem,
    version: i64,
}

impl VersionedItem {
    fn live_at(&self, now: DateTime<Utc>) -> Option<StoreItem> {
        (!self.item.is_expired_at(now)).then(|| self.item.clone())
    }
}

impl TryFrom<ItemRow> for VersionedItem {
    type Error = AppError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        let table = StoreTable::parse(row.table_name.as_str())?;
        Ok(Self {
            item: StoreItem {
                key: ItemKey::new(table, row.partition_key, row.sort_key),
                lookup_key: row.lookup_key,
                attributes: row.attributes.0,
                expires_at: row.expires_at,
            },
            version: row.version,
        })
    }
}
