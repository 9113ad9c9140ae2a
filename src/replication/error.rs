use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("pool: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("malformed replication message: {0}")]
    Decode(String),

    #[error("unknown relation oid {0}, was no Relation message seen for it")]
    UnknownRelation(u32),

    #[error(transparent)]
    Lsn(#[from] crate::lsn::Error),

    #[error(transparent)]
    Ledger(#[from] crate::ledger::Error),

    #[error("replication stream ended unexpectedly")]
    StreamClosed,
}
