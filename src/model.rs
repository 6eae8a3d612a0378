//! The canonical log record (§3) and the transient notification derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::config::LIVENESS_PULSE_OPERATION;
use crate::error::{HortonError, Result};

/// A structured row image. `None` means "no payload captured" (the
/// `INSERT`-side `previousRecord`, or a `recordColumns = []` projection);
/// `Some(Value::Object(..))` is the normal, non-empty case.
pub type Record = serde_json::Value;

/// A single row in the durable event queue (§3).
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct QueueRow {
    pub id: i64,
    pub table_name: String,
    pub operation: String,
    pub previous_record: Option<Record>,
    pub current_record: Option<Record>,
    pub queued_at: DateTime<Utc>,
}

impl QueueRow {
    /// `true` when this row carries an internal message (e.g. a liveness
    /// pulse) rather than a change to a watched source table.
    pub fn is_internal(&self, internal_pseudo_table: &str) -> bool {
        self.table_name == internal_pseudo_table
    }
}

/// A transient message derived from a [`QueueRow`] by the listener or the
/// reconciler (§3). `is_internal` is a pure function of `table_name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueNotification {
    pub row_id: i64,
    pub is_internal: bool,
}

/// Parses the `"<rowId>:<tableName>:<operation>"` wire payload emitted by
/// the queue table's own insert trigger (§4.3). Malformed payloads return
/// `Err` and the caller is expected to drop them silently and rely on
/// reconciliation, per SPEC_FULL.md §7.
pub(crate) fn parse_notification_payload(payload: &str) -> Result<(i64, String, String)> {
    let mut parts = payload.splitn(3, ':');
    let row_id = parts
        .next()
        .ok_or_else(|| HortonError::configuration("empty notification payload"))?;
    let table_name = parts
        .next()
        .ok_or_else(|| HortonError::configuration("missing table name in notification payload"))?;
    let operation = parts
        .next()
        .ok_or_else(|| HortonError::configuration("missing operation in notification payload"))?;

    let row_id: i64 = row_id
        .parse()
        .map_err(|_| HortonError::configuration("non-numeric row id in notification payload"))?;

    Ok((row_id, table_name.to_string(), operation.to_string()))
}

/// Reserved pseudo-table name used for internal rows such as liveness
/// pulses (§3, §6). Combined with a gateway's prefix via
/// [`crate::gateway::DatabaseGateway::prefix_name`].
pub const INTERNAL_PSEUDO_TABLE_LOGICAL_NAME: &str = "internal";

/// A JSON payload carried by an internal queue row (e.g. a liveness pulse's
/// metadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalMetadata {
    pub operation: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl InternalMetadata {
    pub fn liveness_pulse() -> Self {
        Self {
            operation: LIVENESS_PULSE_OPERATION.to_string(),
            payload: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_payload() {
        let (row_id, table_name, operation) = parse_notification_payload("42:accounts:UPDATE").unwrap();
        assert_eq!(row_id, 42);
        assert_eq!(table_name, "accounts");
        assert_eq!(operation, "UPDATE");
    }

    #[test]
    fn rejects_non_numeric_row_id() {
        assert!(parse_notification_payload("abc:accounts:UPDATE").is_err());
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(parse_notification_payload("42:accounts").is_err());
        assert!(parse_notification_payload("").is_err());
    }
}
