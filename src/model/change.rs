//! The change record (spec.md §3, §4.2): an immutable row-level mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::lsn::Lsn;

use super::table::Table;

/// The kind of row mutation a `Change` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Insert,
    Update,
    Delete,
}

/// One row-level mutation: `{table, op, data, lsn, updatedAt}`.
///
/// Invariants (spec.md §3): every non-delete carries a complete row image
/// sufficient to upsert; `data.id` uniquely identifies the entity within
/// `table`; `lsn` is unique in the change-history ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub table: Table,
    pub op: Op,
    pub data: Value,
    pub lsn: Lsn,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl Change {
    pub fn new(table: Table, op: Op, data: Value, lsn: Lsn, updated_at: DateTime<Utc>) -> Self {
        Self {
            table,
            op,
            data,
            lsn,
            updated_at,
        }
    }

    /// The row id this change applies to, if `data` carries one.
    pub fn row_id(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }

    /// The originating client id embedded in the row image, if any. Used by
    /// C3's origin filtering and C11's tiebreak.
    pub fn client_id(&self) -> Option<Uuid> {
        self.data
            .get("clientId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// A `(table, row id)` key identifying which row this change targets,
    /// used to group a batch for per-row dedup/merge (C3) and lookup in the
    /// ledger (C4).
    pub fn row_key(&self) -> Option<(Table, String)> {
        self.row_id().map(|id| (self.table, id.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn row_key_requires_id() {
        let change = Change::new(
            Table::Tasks,
            Op::Insert,
            json!({"title": "no id here"}),
            Lsn::ZERO,
            Utc::now(),
        );
        assert!(change.row_key().is_none());
    }

    #[test]
    fn row_key_present() {
        let change = Change::new(
            Table::Tasks,
            Op::Insert,
            json!({"id": "t1", "title": "a"}),
            Lsn::ZERO,
            Utc::now(),
        );
        assert_eq!(
            change.row_key(),
            Some((Table::Tasks, "t1".to_string()))
        );
    }
}
