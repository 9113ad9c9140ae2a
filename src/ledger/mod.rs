//! Append-only change-history ledger (C4, spec.md §4.4).
//!
//! Writers: the replication ingester (C5) only. Readers: the catch-up
//! engine (C7) and the live broadcaster (C8), concurrently with writes.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::lsn::Lsn;
use crate::model::Change;

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("pool: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("malformed ledger row: {0}")]
    MalformedRow(String),
}

/// The change-history ledger's contract. Implementations must uphold the
/// gap-free resumability invariant: `readAfter(X,N)` followed by
/// `readAfter(last.lsn, M)` reconstructs the full range without gaps or
/// duplicates, provided no `truncateBefore` crossed the boundary.
#[async_trait]
pub trait ChangeLedger: Send + Sync {
    /// Append a change. Idempotent on `lsn`: re-appending an already-stored
    /// LSN is a no-op, not an error (spec.md §4.5 "duplicate delivery").
    async fn append(&self, change: Change) -> Result<(), Error>;

    /// The maximum stored LSN, or `Lsn::ZERO` if the ledger is empty.
    async fn head_lsn(&self) -> Result<Lsn, Error>;

    /// Changes strictly greater than `from`, ascending by LSN, bounded by
    /// `limit`.
    async fn read_after(&self, from: Lsn, limit: usize) -> Result<Vec<Change>, Error>;

    /// Count of changes strictly greater than `from`, used by the catch-up
    /// engine (C7) to size its chunk sequence up front.
    async fn count_after(&self, from: Lsn) -> Result<u64, Error>;

    /// Discard entries strictly older than `lsn`. Safe to call concurrently
    /// with reads; never removes anything a live read range still needs
    /// (callers are responsible for only truncating before the oldest
    /// client's acknowledged LSN).
    async fn truncate_before(&self, lsn: Lsn) -> Result<(), Error>;
}
