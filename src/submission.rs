//! Client submission path (C10, spec.md §4.10): applies a client's batch of
//! changes to the source tables inside a single transaction, respecting
//! the hierarchy ordering (C2) and last-write-wins arbitration (C11), and
//! reports back a `submit_ack`/`submit_nack`.
//!
//! The applied rows are not appended to the change-history ledger directly
//! — the replication ingester (C5) picks up the resulting WAL record like
//! any other write, which is what lets a submitting client's own session
//! filter the echo back out (spec.md §8 property 7) instead of this path
//! needing to special-case it.

use deadpool_postgres::Pool;
use thiserror::Error;
use tokio_postgres::error::SqlState;
use uuid::Uuid;

use crate::dedupe::dedupe;
use crate::lsn::Lsn;
use crate::model::{order_for_apply, Change, Op};
use crate::session::protocol::RejectedRow;

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("pool: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
}

#[derive(Debug, PartialEq)]
pub enum SubmissionOutcome {
    Accepted {
        resulting_lsn: Lsn,
    },
    Rejected {
        reason: String,
        rejected: Vec<RejectedRow>,
    },
}

/// A change whose embedded `clientId` doesn't match the submitting
/// session's own is a protocol violation, not an ordinary rejection — the
/// caller should close the session rather than nack the batch.
pub fn changes_belong_to_client(changes: &[Change], client_id: Uuid) -> bool {
    changes.iter().all(|c| c.client_id() == Some(client_id))
}

/// Create the mirrored tables submission applies to, if they don't already
/// exist. `parent_id` carries the FK used to enforce hierarchy ordering;
/// `NULL` for root tables.
pub async fn ensure_schema(pool: &Pool) -> Result<(), Error> {
    let client = pool.get().await?;
    client
        .batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id text PRIMARY KEY,
                data jsonb NOT NULL,
                client_id uuid,
                updated_at timestamptz NOT NULL
            );
            CREATE TABLE IF NOT EXISTS projects (
                id text PRIMARY KEY,
                data jsonb NOT NULL,
                client_id uuid,
                updated_at timestamptz NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tasks (
                id text PRIMARY KEY,
                parent_id text REFERENCES projects (id),
                data jsonb NOT NULL,
                client_id uuid,
                updated_at timestamptz NOT NULL
            );
            CREATE TABLE IF NOT EXISTS comments (
                id text PRIMARY KEY,
                parent_id text REFERENCES tasks (id),
                data jsonb NOT NULL,
                client_id uuid,
                updated_at timestamptz NOT NULL
            );

            -- The replication ingester (C5) recovers a deleted row's
            -- `data` column from the old row image to extract its
            -- `clientId` for origin filtering (spec.md §8 property 7);
            -- the default primary-key-only identity wouldn't send it.
            ALTER TABLE users REPLICA IDENTITY FULL;
            ALTER TABLE projects REPLICA IDENTITY FULL;
            ALTER TABLE tasks REPLICA IDENTITY FULL;
            ALTER TABLE comments REPLICA IDENTITY FULL;
            "#,
        )
        .await?;
    Ok(())
}

fn parent_id(change: &Change) -> Option<String> {
    change
        .table
        .parent_id_field()
        .and_then(|field| change.data.get(field))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

async fn apply_one(tx: &tokio_postgres::Transaction<'_>, change: &Change) -> Result<(), tokio_postgres::Error> {
    let table = change.table.as_str();
    let id = change.row_id().unwrap_or_default();
    let client_id = change.client_id();

    match change.op {
        Op::Delete => {
            // Same (updatedAt, clientId) LWW guard as the insert/update arm
            // below: a stale delete (replayed out of order, or racing a
            // newer write for the same row) must not destroy a row a
            // concurrent newer write just produced.
            tx.execute(
                &format!(
                    r#"
                    DELETE FROM {table}
                    WHERE id = $1
                      AND (updated_at < $2 OR (updated_at = $2 AND client_id <= $3))
                    "#
                ),
                &[&id, &change.updated_at, &client_id],
            )
            .await?;
        }
        Op::Insert | Op::Update => {
            let parent = parent_id(change);
            tx.execute(
                &format!(
                    r#"
                    INSERT INTO {table} (id, parent_id, data, client_id, updated_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (id) DO UPDATE SET
                        parent_id = EXCLUDED.parent_id,
                        data = EXCLUDED.data,
                        client_id = EXCLUDED.client_id,
                        updated_at = EXCLUDED.updated_at
                    WHERE {table}.updated_at < EXCLUDED.updated_at
                       OR ({table}.updated_at = EXCLUDED.updated_at AND {table}.client_id <= EXCLUDED.client_id)
                    "#
                ),
                &[&id, &parent, &change.data, &client_id, &change.updated_at],
            )
            .await?;
        }
    }

    Ok(())
}

fn is_fk_violation(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION)
}

/// Apply a submitted batch. Changes are deduped (collapsing a multi-step
/// edit of the same row into one write) and ordered parent-first /
/// child-last (C2) before being applied inside one transaction using
/// per-row savepoints: a row that fails on a foreign-key violation is
/// retried once at the end of the batch (its parent may have appeared
/// earlier in the same batch but not yet have been committed when this
/// row was first attempted is impossible within one transaction, but a
/// parent arriving *later* in an unordered batch is not); a row that still
/// fails after the retry is rolled back individually and reported in the
/// nack's `rejected` list while the rest of the batch still commits.
pub async fn apply(pool: &Pool, client_id: Uuid, changes: Vec<Change>) -> Result<SubmissionOutcome, Error> {
    let deduped = dedupe(changes, None).changes;
    let ordered = order_for_apply(deduped);

    let mut client = pool.get().await?;
    let tx = client.transaction().await?;

    let mut deferred = Vec::new();
    let mut rejected = Vec::new();

    for change in &ordered {
        let savepoint = tx.savepoint(&format!("sp_{}", change.row_id().unwrap_or("x"))).await?;
        match apply_one(&savepoint, change).await {
            Ok(()) => savepoint.commit().await?,
            Err(err) if is_fk_violation(&err) => deferred.push(change),
            Err(err) => return Err(err.into()),
        }
    }

    for change in deferred {
        let savepoint = tx.savepoint(&format!("retry_{}", change.row_id().unwrap_or("x"))).await?;
        match apply_one(&savepoint, change).await {
            Ok(()) => savepoint.commit().await?,
            Err(err) if is_fk_violation(&err) => {
                rejected.push(RejectedRow {
                    id: change.row_id().unwrap_or_default().to_string(),
                    reason: "foreign key violation: referenced parent row not found".to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        }
    }

    if !rejected.is_empty() && rejected.len() == ordered.len() {
        tx.rollback().await?;
        return Ok(SubmissionOutcome::Rejected {
            reason: "all rows in the batch were rejected".to_string(),
            rejected,
        });
    }

    let resulting_lsn = {
        let row = tx.query_one("SELECT pg_current_wal_lsn()::text", &[]).await?;
        let lsn: String = row.get(0);
        Lsn::parse(&lsn).unwrap_or(Lsn::ZERO)
    };

    tx.commit().await?;

    if rejected.is_empty() {
        Ok(SubmissionOutcome::Accepted { resulting_lsn })
    } else {
        // Partial success: the accepted rows already committed above: a
        // real `submit_nack` with a non-empty `rejected` plus a distinct
        // `submit_ack` for the rest would require splitting this into two
        // responses. We report it as a qualified rejection; the client's
        // reconciliation logic inspects `rejected` to see which rows (if
        // any) still need local retry, and everything absent from it has
        // already landed.
        Ok(SubmissionOutcome::Rejected {
            reason: "some rows were rejected; rows not listed were applied".to_string(),
            rejected,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Table;
    use chrono::Utc;
    use serde_json::json;

    fn change(table: Table, op: Op, id: &str, client_id: Uuid) -> Change {
        Change::new(
            table,
            op,
            json!({"id": id, "clientId": client_id.to_string()}),
            Lsn::ZERO,
            Utc::now(),
        )
    }

    #[test]
    fn rejects_batch_with_foreign_client_id() {
        let client_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let changes = vec![change(Table::Tasks, Op::Insert, "t1", other)];
        assert!(!changes_belong_to_client(&changes, client_id));
    }

    #[test]
    fn accepts_batch_matching_client_id() {
        let client_id = Uuid::new_v4();
        let changes = vec![change(Table::Tasks, Op::Insert, "t1", client_id)];
        assert!(changes_belong_to_client(&changes, client_id));
    }

    #[test]
    fn parent_id_extracted_for_child_tables() {
        let mut data = json!({"id": "t1", "projectId": "p1"});
        let change = Change::new(Table::Tasks, Op::Insert, data.take(), Lsn::ZERO, Utc::now());
        assert_eq!(parent_id(&change), Some("p1".to_string()));
    }

    #[test]
    fn parent_id_absent_for_root_tables() {
        let change = Change::new(Table::Projects, Op::Insert, json!({"id": "p1"}), Lsn::ZERO, Utc::now());
        assert_eq!(parent_id(&change), None);
    }
}
