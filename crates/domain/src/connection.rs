use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection id prefix used for placeholder rows awaiting a handshake.
pub const PENDING_CONNECTION_PREFIX: &str = "pending_";

/// Builds the placeholder connection id for one issued viewer token.
#[must_use]
pub fn pending_connection_id(execution_id: &str, token_id: &str) -> String {
    format!("{PENDING_CONNECTION_PREFIX}{execution_id}_{token_id}")
}

/// One live or pending viewer subscription to an execution log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerConnection {
    /// Transport connection id, or a `pending_` placeholder.
    pub connection_id: String,
    /// Execution the viewer is subscribed to.
    pub execution_id: String,
    /// SHA-256 hex digest of the single-use viewer token, on pending rows only.
    pub token_hash: Option<String>,
    /// Highest log index already delivered to this viewer.
    pub last_index: i64,
    /// Instant after which the row is reaped by the store.
    pub expires_at: Option<DateTime<Utc>>,
    /// Identity of the viewer the capability was issued to.
    pub user_identity: Option<String>,
    /// Client address recorded when the capability was issued.
    pub client_ip: Option<String>,
}

impl ViewerConnection {
    /// Returns true for placeholder rows that have not completed a handshake.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.connection_id.starts_with(PENDING_CONNECTION_PREFIX)
    }
}
