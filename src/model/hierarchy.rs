//! Table dependency DAG and apply ordering (spec.md §4.2).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use thiserror::Error;

use super::change::{Change, Op};
use super::table::Table;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("cyclic table dependency detected involving \"{0}\"")]
    Cycle(Table),
}

/// `dependencyLevel(table)`: roots (no parents) are 0, otherwise one more
/// than the max of parents' levels. Computed once and cached, since the
/// hierarchy is static for the life of the process.
static LEVELS: Lazy<HashMap<Table, u32>> = Lazy::new(|| compute_levels().expect("static table hierarchy must be acyclic"));

fn compute_levels() -> Result<HashMap<Table, u32>, Error> {
    let mut levels = HashMap::new();

    fn level_of(
        table: Table,
        levels: &mut HashMap<Table, u32>,
        visiting: &mut Vec<Table>,
    ) -> Result<u32, Error> {
        if let Some(l) = levels.get(&table) {
            return Ok(*l);
        }
        if visiting.contains(&table) {
            return Err(Error::Cycle(table));
        }
        visiting.push(table);

        let parents = table.parents();
        let level = if parents.is_empty() {
            0
        } else {
            let mut max = 0;
            for parent in parents {
                max = max.max(level_of(*parent, levels, visiting)?);
            }
            max + 1
        };

        visiting.pop();
        levels.insert(table, level);
        Ok(level)
    }

    let mut visiting = Vec::new();
    for table in Table::ALL {
        level_of(table, &mut levels, &mut visiting)?;
    }

    Ok(levels)
}

/// Dependency level of a table: 0 for roots, `1 + max(parent levels)` otherwise.
pub fn dependency_level(table: Table) -> u32 {
    LEVELS[&table]
}

/// Order a batch of changes for apply (spec.md §4.2):
///
/// - non-deletes are ordered ascending by dependency level (parents before
///   children, so foreign keys resolve);
/// - deletes are ordered descending by dependency level (children before
///   parents, so foreign keys don't dangle);
/// - all deletes follow all non-deletes in a mixed batch;
/// - ties within a level preserve input order (a stable sort).
pub fn order_for_apply(changes: Vec<Change>) -> Vec<Change> {
    let mut indexed: Vec<(usize, Change)> = changes.into_iter().enumerate().collect();

    indexed.sort_by(|(ia, a), (ib, b)| {
        let a_is_delete = matches!(a.op, Op::Delete);
        let b_is_delete = matches!(b.op, Op::Delete);

        a_is_delete
            .cmp(&b_is_delete)
            .then_with(|| {
                let la = dependency_level(a.table);
                let lb = dependency_level(b.table);
                if a_is_delete {
                    // descending: children (higher level) first
                    lb.cmp(&la)
                } else {
                    // ascending: parents (lower level) first
                    la.cmp(&lb)
                }
            })
            .then_with(|| ia.cmp(ib))
    });

    indexed.into_iter().map(|(_, change)| change).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lsn::Lsn;
    use chrono::Utc;
    use serde_json::json;

    fn change(table: Table, op: Op, id: &str) -> Change {
        Change::new(table, op, json!({"id": id}), Lsn::ZERO, Utc::now())
    }

    #[test]
    fn levels_match_hierarchy() {
        assert_eq!(dependency_level(Table::Users), 0);
        assert_eq!(dependency_level(Table::Projects), 0);
        assert_eq!(dependency_level(Table::Tasks), 1);
        assert_eq!(dependency_level(Table::Comments), 2);
    }

    #[test]
    fn non_deletes_ordered_parent_first() {
        let changes = vec![
            change(Table::Comments, Op::Insert, "c1"),
            change(Table::Projects, Op::Insert, "p1"),
            change(Table::Tasks, Op::Insert, "t1"),
        ];
        let ordered = order_for_apply(changes);
        assert_eq!(ordered[0].table, Table::Projects);
        assert_eq!(ordered[1].table, Table::Tasks);
        assert_eq!(ordered[2].table, Table::Comments);
    }

    #[test]
    fn deletes_ordered_child_first() {
        let changes = vec![
            change(Table::Projects, Op::Delete, "p1"),
            change(Table::Comments, Op::Delete, "c1"),
            change(Table::Tasks, Op::Delete, "t1"),
        ];
        let ordered = order_for_apply(changes);
        assert_eq!(ordered[0].table, Table::Comments);
        assert_eq!(ordered[1].table, Table::Tasks);
        assert_eq!(ordered[2].table, Table::Projects);
    }

    #[test]
    fn mixed_batch_all_non_deletes_before_deletes() {
        let changes = vec![
            change(Table::Tasks, Op::Delete, "t-old"),
            change(Table::Projects, Op::Insert, "p1"),
            change(Table::Comments, Op::Insert, "c1"),
        ];
        let ordered = order_for_apply(changes);
        assert!(!matches!(ordered[0].op, Op::Delete));
        assert!(!matches!(ordered[1].op, Op::Delete));
        assert!(matches!(ordered[2].op, Op::Delete));
    }

    #[test]
    fn ties_preserve_input_order() {
        let changes = vec![
            change(Table::Projects, Op::Insert, "p1"),
            change(Table::Users, Op::Insert, "u1"),
        ];
        let ordered = order_for_apply(changes);
        assert_eq!(ordered[0].row_id(), Some("p1"));
        assert_eq!(ordered[1].row_id(), Some("u1"));
    }
}
