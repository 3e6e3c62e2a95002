use crate::store_ports::WriteOutcome;

use super::token_crypto::{hash_token, hashes_match};
use super::*;

const REJECTED_HANDSHAKE: &str = "invalid or expired viewer token";

impl ConnectionRegistry {
    /// Upgrades the pending row matching `token` into an active row keyed by
    /// `transport_connection_id`.
    ///
    /// The pending row is consumed by a conditional delete, so a token can be
    /// redeemed at most once even under concurrent handshakes. Every rejection
    /// is the same generic `Unauthorized`.
    pub async fn connect(
        &self,
        transport_connection_id: &str,
        execution_id: &str,
        token: &str,
        resume_from_index: Option<i64>,
    ) -> AppResult<ViewerConnection> {
        let transport_connection_id =
            NonEmptyString::for_field("connection_id", transport_connection_id)?;
        if execution_id.trim().is_empty() || token.trim().is_empty() {
            return Err(rejected());
        }

        let candidates = self
            .store
            .query_lookup(StoreTable::Connections, execution_id)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to list connections for handshake: {error}"))
            })?;

        let presented_hash = hash_token(token);
        let mut matched = None;
        for item in &candidates {
            let stored_hash = item.optional_string_attribute("token_hash");
            let is_match = stored_hash
                .as_deref()
                .is_some_and(|stored_hash| hashes_match(stored_hash, presented_hash.as_str()));
            if is_match && matched.is_none() {
                matched = Some(item);
            }
        }

        let Some(pending_item) = matched else {
            debug!(execution_id, "viewer handshake rejected");
            return Err(rejected());
        };
        let pending = connection_from_item(pending_item)?;

        let consumed = self
            .store
            .delete_item(
                &pending_item.key,
                Condition::Exists.and(Condition::attribute_equals(
                    "token_hash",
                    presented_hash.as_str(),
                )),
            )
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to consume pending connection: {error}"))
            })?;
        if consumed == WriteOutcome::ConditionFailed {
            debug!(execution_id, "viewer token was redeemed concurrently");
            return Err(rejected());
        }

        let active = ViewerConnection {
            connection_id: transport_connection_id.into(),
            execution_id: pending.execution_id,
            token_hash: None,
            last_index: resume_from_index.unwrap_or(pending.last_index).max(0),
            expires_at: pending.expires_at,
            user_identity: pending.user_identity,
            client_ip: pending.client_ip,
        };

        let registered = self
            .store
            .put_item(connection_to_item(&active), Condition::NotExists)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to register active connection: {error}"))
            })
            .and_then(|created| {
                if created.is_applied() {
                    Ok(())
                } else {
                    Err(AppError::Internal(format!(
                        "connection '{}' is already registered",
                        active.connection_id
                    )))
                }
            });
        if let Err(error) = registered {
            warn!(
                execution_id = %active.execution_id,
                pending_connection_id = %pending.connection_id,
                connection_id = %active.connection_id,
                error = %error,
                "viewer token was consumed but the connection was not registered; a new token must be issued"
            );
            return Err(error);
        }

        info!(
            execution_id = %active.execution_id,
            connection_id = %active.connection_id,
            last_index = active.last_index,
            "viewer connected"
        );
        Ok(active)
    }
}

fn rejected() -> AppError {
    AppError::Unauthorized(REJECTED_HANDSHAKE.to_owned())
}
