//! Postgres-backed client registry, persisting the `{client_id, last_ack_lsn,
//! updated_at}` schema from spec.md §6 plus the `profile_id`/`subject_id`
//! fields the data model (§3) requires.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use uuid::Uuid;

use crate::lsn::Lsn;

use super::{ClientRecord, ClientRegistry, Error};

pub struct PostgresRegistry {
    pool: Pool,
}

impl PostgresRegistry {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), Error> {
        let client = self.pool.get().await?;
        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS client_registry (
                    client_id uuid PRIMARY KEY,
                    profile_id uuid NOT NULL,
                    subject_id text,
                    last_ack_lsn text NOT NULL DEFAULT '0/0',
                    updated_at timestamptz NOT NULL DEFAULT now()
                );
                "#,
            )
            .await?;
        Ok(())
    }
}

fn row_to_record(row: &tokio_postgres::Row) -> Result<ClientRecord, Error> {
    let lsn: String = row.get("last_ack_lsn");
    Ok(ClientRecord {
        client_id: row.get("client_id"),
        profile_id: row.get("profile_id"),
        subject_id: row.get("subject_id"),
        last_ack_lsn: Lsn::parse(&lsn).map_err(|e| Error::MalformedRow(e.to_string()))?,
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl ClientRegistry for PostgresRegistry {
    async fn get(&self, client_id: Uuid) -> Result<Option<ClientRecord>, Error> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT client_id, profile_id, subject_id, last_ack_lsn, updated_at \
                 FROM client_registry WHERE client_id = $1",
                &[&client_id],
            )
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn upsert(&self, record: ClientRecord) -> Result<(), Error> {
        let client = self.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO client_registry (client_id, profile_id, subject_id, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (client_id) DO UPDATE SET
                    profile_id = EXCLUDED.profile_id,
                    subject_id = EXCLUDED.subject_id,
                    updated_at = EXCLUDED.updated_at
                "#,
                &[&record.client_id, &record.profile_id, &record.subject_id, &record.updated_at],
            )
            .await?;
        Ok(())
    }

    async fn update_last_ack_lsn(&self, client_id: Uuid, lsn: Lsn) -> Result<(), Error> {
        // Postgres's text collation does not sort LSNs numerically (`"A/1"`
        // sorts after `"10/1"`), so the compare-and-advance happens in
        // application code inside a row-locking transaction rather than in
        // the WHERE clause.
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT last_ack_lsn FROM client_registry WHERE client_id = $1 FOR UPDATE",
                &[&client_id],
            )
            .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(());
        };

        let current: String = row.get("last_ack_lsn");
        let current = Lsn::parse(&current).map_err(|e| Error::MalformedRow(e.to_string()))?;

        if Lsn::compare(&lsn, &current) > 0 {
            tx.execute(
                "UPDATE client_registry SET last_ack_lsn = $2, updated_at = now() WHERE client_id = $1",
                &[&client_id, &lsn.to_string()],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ClientRecord>, Error> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT client_id, profile_id, subject_id, last_ack_lsn, updated_at FROM client_registry",
                &[],
            )
            .await?;
        rows.iter().map(row_to_record).collect()
    }
}
