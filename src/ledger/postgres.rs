//! Postgres-backed change-history ledger.
//!
//! Persists the `{lsn, table, op, data, updated_at}` schema from spec.md
//! §6, plus an internal `lsn_order bigint` column: Postgres's default text
//! collation does not sort `"A/1"` before `"10/1"` the way the LSN's
//! numeric value does, so range scans order by this derived column instead
//! of the text column itself.

use async_trait::async_trait;
use deadpool_postgres::Pool;

use crate::lsn::Lsn;
use crate::model::{Change, Op, Table};

use super::{ChangeLedger, Error};

pub struct PostgresLedger {
    pool: Pool,
}

impl PostgresLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create the ledger table if it doesn't exist. Idempotent; safe to run
    /// on every startup.
    pub async fn ensure_schema(&self) -> Result<(), Error> {
        let client = self.pool.get().await?;
        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS change_history (
                    lsn text PRIMARY KEY,
                    lsn_order bigint NOT NULL,
                    "table" text NOT NULL,
                    op text NOT NULL,
                    data jsonb NOT NULL,
                    updated_at timestamptz NOT NULL
                );
                CREATE INDEX IF NOT EXISTS change_history_lsn_order_idx
                    ON change_history (lsn_order);
                "#,
            )
            .await?;
        Ok(())
    }
}

fn op_str(op: Op) -> &'static str {
    match op {
        Op::Insert => "insert",
        Op::Update => "update",
        Op::Delete => "delete",
    }
}

fn parse_op(s: &str) -> Result<Op, Error> {
    match s {
        "insert" => Ok(Op::Insert),
        "update" => Ok(Op::Update),
        "delete" => Ok(Op::Delete),
        other => Err(Error::MalformedRow(format!("unknown op \"{other}\""))),
    }
}

fn row_to_change(row: &tokio_postgres::Row) -> Result<Change, Error> {
    let table: String = row.get("table");
    let op: String = row.get("op");
    let lsn: String = row.get("lsn");

    Ok(Change::new(
        table
            .parse::<Table>()
            .map_err(|e| Error::MalformedRow(e.to_string()))?,
        parse_op(&op)?,
        row.get("data"),
        Lsn::parse(&lsn).map_err(|e| Error::MalformedRow(e.to_string()))?,
        row.get("updated_at"),
    ))
}

#[async_trait]
impl ChangeLedger for PostgresLedger {
    async fn append(&self, change: Change) -> Result<(), Error> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO change_history (lsn, lsn_order, "table", op, data, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (lsn) DO NOTHING
                "#,
                &[
                    &change.lsn.to_string(),
                    &(change.lsn.as_u64() as i64),
                    &change.table.as_str(),
                    &op_str(change.op),
                    &change.data,
                    &change.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn head_lsn(&self) -> Result<Lsn, Error> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT lsn FROM change_history ORDER BY lsn_order DESC LIMIT 1", &[])
            .await?;
        match row {
            Some(row) => {
                let lsn: String = row.get("lsn");
                Ok(Lsn::parse(&lsn).map_err(|e| Error::MalformedRow(e.to_string()))?)
            }
            None => Ok(Lsn::ZERO),
        }
    }

    async fn read_after(&self, from: Lsn, limit: usize) -> Result<Vec<Change>, Error> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                SELECT lsn, "table", op, data, updated_at
                FROM change_history
                WHERE lsn_order > $1
                ORDER BY lsn_order ASC
                LIMIT $2
                "#,
                &[&(from.as_u64() as i64), &(limit as i64)],
            )
            .await?;

        rows.iter().map(row_to_change).collect()
    }

    async fn count_after(&self, from: Lsn) -> Result<u64, Error> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT count(*) FROM change_history WHERE lsn_order > $1",
                &[&(from.as_u64() as i64)],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn truncate_before(&self, lsn: Lsn) -> Result<(), Error> {
        let client = self.pool.get().await?;
        client
            .execute(
                "DELETE FROM change_history WHERE lsn_order < $1",
                &[&(lsn.as_u64() as i64)],
            )
            .await?;
        Ok(())
    }
}
