//! Durable client registry (C6, spec.md §4.6).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::lsn::Lsn;

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("pool: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("malformed registry row: {0}")]
    MalformedRow(String),
}

/// `{clientId, lastAckLSN, profileId, subjectId?}` (spec.md §3). `clientId`
/// is chosen by the client; the record is created on first connection and
/// destroyed only on explicit deprovision, never on mere disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub client_id: Uuid,
    pub last_ack_lsn: Lsn,
    pub profile_id: Uuid,
    pub subject_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ClientRecord {
    pub fn new(client_id: Uuid, profile_id: Uuid, subject_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            client_id,
            last_ack_lsn: Lsn::ZERO,
            profile_id,
            subject_id,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait ClientRegistry: Send + Sync {
    async fn get(&self, client_id: Uuid) -> Result<Option<ClientRecord>, Error>;

    /// Insert a new record or update the mutable fields of an existing one.
    /// Does not touch `last_ack_lsn`.
    async fn upsert(&self, record: ClientRecord) -> Result<(), Error>;

    /// Atomically compare-and-advance: only writes `lsn` if it is strictly
    /// greater than the currently stored value. Silently ignores a lower
    /// or equal LSN (spec.md §4.6) rather than erroring, since this is the
    /// ordinary outcome of a duplicate or stale acknowledgement.
    async fn update_last_ack_lsn(&self, client_id: Uuid, lsn: Lsn) -> Result<(), Error>;

    async fn list(&self) -> Result<Vec<ClientRecord>, Error>;
}
