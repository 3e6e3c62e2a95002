//! Viewer connection rows and the token handshake that activates them.
//!
//! Rows live in the `connections` table keyed by connection id, with the
//! execution id as secondary lookup key. Pending rows carry the SHA-256 hash
//! of a single-use viewer token; active rows are keyed by the transport id.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tether_core::{AppError, AppResult, NonEmptyString};
use tether_domain::{ViewerConnection, pending_connection_id};
use tracing::{debug, info, warn};

use crate::store_ports::{
    BatchWriteRequest, Condition, ItemKey, ItemUpdate, KeyValueStore, MAX_BATCH_WRITE_ITEMS,
    StoreTable,
};

mod codec;
mod handshake;
mod token_crypto;

use codec::{connection_from_item, connection_to_item};

/// Caller context recorded on a pending row and copied to the active row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetadata {
    /// Identity the viewing capability is issued to.
    pub user_identity: Option<String>,
    /// Address of the client that requested the capability.
    pub client_ip: Option<String>,
}

/// Raw viewer token returned once to the issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedViewerToken {
    /// Secret the viewer presents during the handshake.
    pub token: String,
    /// Placeholder row created for the token.
    pub pending_connection_id: String,
    /// Instant after which the token can no longer be redeemed.
    pub expires_at: DateTime<Utc>,
}

/// Connection registry service.
#[derive(Clone)]
pub struct ConnectionRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl ConnectionRegistry {
    /// Creates a registry over one store.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Generates a viewer token and stores its pending row.
    pub async fn issue_viewer_token(
        &self,
        execution_id: &str,
        ttl_seconds: u32,
        metadata: ConnectionMetadata,
    ) -> AppResult<IssuedViewerToken> {
        let token = token_crypto::generate_token()?;
        let pending = self
            .create_pending(execution_id, token.as_str(), ttl_seconds, metadata)
            .await?;

        let expires_at = pending.expires_at.ok_or_else(|| {
            AppError::Internal("pending connection was stored without expiry".to_owned())
        })?;

        Ok(IssuedViewerToken {
            token,
            pending_connection_id: pending.connection_id,
            expires_at,
        })
    }

    /// Inserts a pending row for `token`; only the token hash is persisted.
    pub async fn create_pending(
        &self,
        execution_id: &str,
        token: &str,
        ttl_seconds: u32,
        metadata: ConnectionMetadata,
    ) -> AppResult<ViewerConnection> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        let token = NonEmptyString::for_field("token", token)?;
        if ttl_seconds == 0 {
            return Err(AppError::Validation(
                "ttl_seconds must be greater than zero".to_owned(),
            ));
        }

        let token_hash = token_crypto::hash_token(token.as_str());
        let pending = ViewerConnection {
            connection_id: pending_connection_id(execution_id.as_str(), &token_hash[..16]),
            execution_id: execution_id.into(),
            token_hash: Some(token_hash),
            last_index: 0,
            expires_at: Some(Utc::now() + Duration::seconds(i64::from(ttl_seconds))),
            user_identity: metadata.user_identity,
            client_ip: metadata.client_ip,
        };

        let outcome = self
            .store
            .put_item(connection_to_item(&pending), Condition::NotExists)
            .await?;
        if !outcome.is_applied() {
            return Err(AppError::Conflict(format!(
                "pending connection '{}' already exists",
                pending.connection_id
            )));
        }

        debug!(
            execution_id = %pending.execution_id,
            connection_id = %pending.connection_id,
            "created pending viewer connection"
        );
        Ok(pending)
    }

    /// Returns one connection row.
    pub async fn get(&self, connection_id: &str) -> AppResult<Option<ViewerConnection>> {
        let connection_id = NonEmptyString::for_field("connection_id", connection_id)?;
        self.store
            .get_item(&connection_key(connection_id.as_str()))
            .await?
            .as_ref()
            .map(connection_from_item)
            .transpose()
    }

    /// Lists every pending and active row of an execution.
    pub async fn list_for_execution(&self, execution_id: &str) -> AppResult<Vec<ViewerConnection>> {
        let execution_id = NonEmptyString::for_field("execution_id", execution_id)?;
        let mut connections = self
            .store
            .query_lookup(StoreTable::Connections, execution_id.as_str())
            .await?
            .iter()
            .map(connection_from_item)
            .collect::<AppResult<Vec<_>>>()?;
        connections.sort_by(|left, right| left.connection_id.cmp(&right.connection_id));

        Ok(connections)
    }

    /// Lists rows bound to a live transport connection.
    pub async fn list_active_for_execution(
        &self,
        execution_id: &str,
    ) -> AppResult<Vec<ViewerConnection>> {
        let mut connections = self.list_for_execution(execution_id).await?;
        connections.retain(|connection| !connection.is_pending());
        Ok(connections)
    }

    /// Deletes the row of one transport connection. Returns false when absent.
    pub async fn disconnect(&self, connection_id: &str) -> AppResult<bool> {
        let connection_id = NonEmptyString::for_field("connection_id", connection_id)?;
        let removed = self
            .store
            .delete_item(&connection_key(connection_id.as_str()), Condition::Exists)
            .await?
            .is_applied();

        info!(connection_id = %connection_id, removed, "viewer disconnected");
        Ok(removed)
    }

    /// Deletes rows in store-sized batches and returns how many existed.
    ///
    /// Not atomic: a failing batch aborts the call after earlier batches
    /// were applied.
    pub async fn delete_all(&self, connection_ids: &[String]) -> AppResult<usize> {
        let mut removed = 0;
        for chunk in connection_ids.chunks(MAX_BATCH_WRITE_ITEMS) {
            let requests = chunk
                .iter()
                .map(|connection_id| BatchWriteRequest::Delete(connection_key(connection_id)))
                .collect();
            removed += self.store.batch_write(requests).await?;
        }

        Ok(removed)
    }

    /// Moves the delivery cursor forward. Returns false when the row is gone
    /// or the cursor already reached `last_index`.
    pub async fn advance_cursor(&self, connection_id: &str, last_index: i64) -> AppResult<bool> {
        let connection_id = NonEmptyString::for_field("connection_id", connection_id)?;
        let advanced = self
            .store
            .update_item(
                &connection_key(connection_id.as_str()),
                ItemUpdate::new().set("last_index", last_index),
                Condition::Exists.and(Condition::attribute_less_than("last_index", last_index)),
            )
            .await?
            .is_some();

        Ok(advanced)
    }
}

fn connection_key(connection_id: &str) -> ItemKey {
    ItemKey::single(StoreTable::Connections, connection_id)
}
