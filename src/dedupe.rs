//! Deduplication and merge (C3, spec.md §4.3).
//!
//! Collapses an unordered batch of changes touching the same row down to
//! one change per row, applying delete-dominance and insert/update field
//! merging, then hands the survivors to [`crate::model::order_for_apply`].

use std::collections::HashMap;

use uuid::Uuid;

use crate::model::{change::Op, order_for_apply, Change, Table};

/// A row collapsed from more than one input change, recorded for
/// observability (logged at `debug` level by callers).
#[derive(Debug, Clone, PartialEq)]
pub struct Transformation {
    pub table: Table,
    pub row_id: String,
    pub kind: TransformationKind,
    pub inputs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationKind {
    /// A `delete` anywhere in the row's changes dominated the rest.
    DeleteDominance,
    /// An `insert` and one or more `update`s merged into a single `insert`.
    InsertUpdateMerge,
    /// A chain of `update`s merged into a single `update`.
    UpdateChainMerge,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dropped {
    /// Changes whose `data` carried no usable `id`.
    pub missing_id: Vec<Change>,
    /// Changes superseded by a newer change for the same row.
    pub outdated: Vec<Change>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupeResult {
    pub changes: Vec<Change>,
    pub dropped: Dropped,
    pub transformations: Vec<Transformation>,
}

/// Collapse `changes` to one survivor per `(table, id)`, optionally
/// filtering out changes that originated from `originating_client_id` (so a
/// client never receives its own echo back, spec.md §4.7, §8 property 7).
pub fn dedupe(changes: Vec<Change>, originating_client_id: Option<Uuid>) -> DedupeResult {
    let mut groups: HashMap<(Table, String), Vec<Change>> = HashMap::new();
    let mut missing_id = Vec::new();

    for change in changes {
        match change.row_key() {
            Some(key) => groups.entry(key).or_default().push(change),
            None => missing_id.push(change),
        }
    }

    let mut survivors = Vec::new();
    let mut outdated = Vec::new();
    let mut transformations = Vec::new();

    for ((table, row_id), mut candidates) in groups {
        // 1. Sort newest-first.
        candidates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        // 2. Delete dominance: the newest delete wins outright.
        if candidates.iter().any(|c| matches!(c.op, Op::Delete)) {
            let total = candidates.len();
            let mut iter = candidates.into_iter();
            let winner = iter
                .by_ref()
                .find(|c| matches!(c.op, Op::Delete))
                .expect("checked above");
            outdated.extend(iter);

            if total > 1 {
                transformations.push(Transformation {
                    table,
                    row_id: row_id.clone(),
                    kind: TransformationKind::DeleteDominance,
                    inputs: total,
                });
            }

            maybe_keep(winner, originating_client_id, &mut survivors);
            continue;
        }

        // 3. Fold newest-to-oldest, merging insert/update field images.
        let total = candidates.len();
        let mut candidates = candidates.into_iter();
        let mut acc = candidates.next().expect("group is non-empty");
        let mut merged_any = false;
        let mut saw_insert = matches!(acc.op, Op::Insert);
        let mut saw_update = matches!(acc.op, Op::Update);

        for older in candidates {
            let mixed = matches!((acc.op, older.op), (Op::Insert, Op::Update) | (Op::Update, Op::Insert));
            let both_update = matches!((acc.op, older.op), (Op::Update, Op::Update));

            if mixed || both_update {
                let mut data = older.data.clone();
                merge_json(&mut data, &acc.data);
                let op = if mixed { Op::Insert } else { Op::Update };
                acc = Change::new(table, op, data, acc.lsn, acc.updated_at);
                merged_any = true;
                saw_insert |= matches!(older.op, Op::Insert);
                saw_update |= matches!(older.op, Op::Update);
            } else {
                // Any other combination: keep the newer (already-accumulated) change.
                outdated.push(older);
            }
        }

        if merged_any {
            transformations.push(Transformation {
                table,
                row_id: row_id.clone(),
                kind: if saw_insert && saw_update {
                    TransformationKind::InsertUpdateMerge
                } else {
                    TransformationKind::UpdateChainMerge
                },
                inputs: total,
            });
        }

        maybe_keep(acc, originating_client_id, &mut survivors);
    }

    DedupeResult {
        changes: order_for_apply(survivors),
        dropped: Dropped { missing_id, outdated },
        transformations,
    }
}

fn maybe_keep(change: Change, originating_client_id: Option<Uuid>, out: &mut Vec<Change>) {
    if let Some(origin) = originating_client_id {
        if change.client_id() == Some(origin) {
            return;
        }
    }
    out.push(change);
}

/// Shallow object merge: `target`'s fields win over `base`'s on conflict,
/// fields present only in `base` survive.
fn merge_json(base: &mut serde_json::Value, target: &serde_json::Value) {
    if let (Some(base_obj), Some(target_obj)) = (base.as_object_mut(), target.as_object()) {
        for (k, v) in target_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lsn::Lsn;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn change(table: Table, op: Op, data: serde_json::Value, at: i64) -> Change {
        Change::new(table, op, data, Lsn::ZERO, t(at))
    }

    #[test]
    fn s2_insert_then_update_collapses_to_single_insert() {
        let changes = vec![
            change(Table::Tasks, Op::Insert, json!({"id": "t1", "title": "a"}), 0),
            change(Table::Tasks, Op::Update, json!({"id": "t1", "title": "b"}), 1),
        ];

        let result = dedupe(changes, None);
        assert_eq!(result.changes.len(), 1);
        let merged = &result.changes[0];
        assert_eq!(merged.op, Op::Insert);
        assert_eq!(merged.data["title"], "b");
        assert_eq!(merged.data["id"], "t1");
        assert_eq!(
            result.transformations[0].kind,
            TransformationKind::InsertUpdateMerge
        );
    }

    #[test]
    fn s3_delete_dominates_regardless_of_order() {
        let changes = vec![
            change(Table::Tasks, Op::Update, json!({"id": "t1", "title": "c"}), 2),
            change(Table::Tasks, Op::Delete, json!({"id": "t1"}), 3),
            change(Table::Tasks, Op::Insert, json!({"id": "t1", "title": "d"}), 1),
        ];

        let result = dedupe(changes, None);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].op, Op::Delete);
        assert_eq!(result.dropped.outdated.len(), 2);
    }

    #[test]
    fn update_chain_merges_newest_wins_per_field() {
        let changes = vec![
            change(Table::Tasks, Op::Update, json!({"id": "t1", "title": "z", "body": "keep"}), 5),
            change(Table::Tasks, Op::Update, json!({"id": "t1", "title": "y"}), 3),
            change(Table::Tasks, Op::Update, json!({"id": "t1", "title": "x", "body": "orig"}), 1),
        ];

        let result = dedupe(changes, None);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].data["title"], "z");
        assert_eq!(result.changes[0].data["body"], "keep");
    }

    #[test]
    fn missing_id_is_dropped_separately() {
        let changes = vec![change(Table::Tasks, Op::Insert, json!({"title": "no id"}), 0)];
        let result = dedupe(changes, None);
        assert!(result.changes.is_empty());
        assert_eq!(result.dropped.missing_id.len(), 1);
    }

    #[test]
    fn origin_filtering_excludes_own_echo() {
        let origin = Uuid::new_v4();
        let changes = vec![change(
            Table::Tasks,
            Op::Insert,
            json!({"id": "t1", "clientId": origin.to_string()}),
            0,
        )];
        let result = dedupe(changes, Some(origin));
        assert!(result.changes.is_empty());
    }

    #[test]
    fn dedupe_is_idempotent() {
        let changes = vec![
            change(Table::Projects, Op::Insert, json!({"id": "p1", "name": "a"}), 0),
            change(Table::Tasks, Op::Update, json!({"id": "t1", "title": "b"}), 1),
        ];

        let once = dedupe(changes, None);
        let twice = dedupe(once.changes.clone(), None);
        assert_eq!(once.changes, twice.changes);
    }

    #[test]
    fn merge_equivalence_for_single_row() {
        // Applying the raw sequence in order must match applying the
        // dedupe'd single change (spec.md §8 property 3): last values win
        // per field, same as folding updates in chronological order.
        let raw = vec![
            change(Table::Tasks, Op::Insert, json!({"id": "t1", "title": "a", "done": false}), 0),
            change(Table::Tasks, Op::Update, json!({"id": "t1", "title": "b"}), 1),
            change(Table::Tasks, Op::Update, json!({"id": "t1", "done": true}), 2),
        ];

        let mut applied = serde_json::json!({});
        for c in &raw {
            merge_json(&mut applied, &c.data);
        }

        let result = dedupe(raw, None);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].data, applied);
    }
}
