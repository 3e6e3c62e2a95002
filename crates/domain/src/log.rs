use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_core::{AppError, AppResult};

/// One line emitted by a producer before it has been sequenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Producer timestamp in epoch milliseconds.
    pub timestamp: i64,
    /// Line content without trailing newline.
    pub message: String,
}

/// One persisted, sequenced log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Owning execution.
    pub execution_id: String,
    /// 1-based gapless position inside the execution log.
    pub index: i64,
    /// Producer timestamp in epoch milliseconds.
    pub timestamp: i64,
    /// Line content.
    pub message: String,
    /// Retention deadline stamped when the execution completes.
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct DeliveredLine<'a> {
    index: i64,
    timestamp: i64,
    message: &'a str,
}

/// Encodes entries as newline-delimited JSON, one object per entry.
pub fn encode_ndjson(entries: &[LogEntry]) -> AppResult<String> {
    let mut lines = Vec::with_capacity(entries.len());
    for entry in entries {
        let line = serde_json::to_string(&DeliveredLine {
            index: entry.index,
            timestamp: entry.timestamp,
            message: entry.message.as_str(),
        })
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to serialize log entry {} of execution '{}': {error}",
                entry.index, entry.execution_id
            ))
        })?;
        lines.push(line);
    }

    Ok(lines.join("\n"))
}

/// Structured message pushed to viewers before their connection is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisconnectNotice {
    /// Sent once the execution reached a terminal state.
    Disconnect {
        /// Machine-readable disconnect reason.
        reason: String,
    },
}

impl DisconnectNotice {
    /// Notice broadcast when an execution completes.
    #[must_use]
    pub fn execution_completed() -> Self {
        Self::Disconnect {
            reason: "execution_completed".to_owned(),
        }
    }

    /// Serializes the notice to its wire representation.
    pub fn to_json(&self) -> AppResult<String> {
        serde_json::to_string(self).map_err(|error| {
            AppError::Internal(format!("failed to serialize disconnect notice: {error}"))
        })
    }
}
