//! The explicit `Engine` handle (spec.md §9 design note: "global singleton
//! data source -> explicit handle"). Owns C4-C8 -- the change-history
//! ledger, the client registry, the live broadcaster and the replication
//! ingester's lifetime -- and is passed down to every session instead of
//! being recovered from a process-wide accessor the way the teacher's
//! `config()`/`databases()` globals are.

use std::sync::Arc;

use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::ledger::postgres::PostgresLedger;
use crate::ledger::ChangeLedger;
use crate::registry::postgres::PostgresRegistry;
use crate::registry::ClientRegistry;
use crate::replication::{Ingester, IngesterConfig};
use crate::session::handler::SessionHandles;
use crate::session::registry::ActiveSessions;
use crate::{broadcast::LiveBroadcaster, submission};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] crate::config::Error),

    #[error("failed to build database pool: {0}")]
    Pool(#[from] deadpool_postgres::CreatePoolError),

    #[error(transparent)]
    Ledger(#[from] crate::ledger::Error),

    #[error(transparent)]
    Registry(#[from] crate::registry::Error),

    #[error(transparent)]
    Submission(#[from] submission::Error),

    #[error("database URL could not be parsed: {0}")]
    InvalidDatabaseUrl(#[source] tokio_postgres::Error),
}

/// Everything a running server needs, constructed once at startup in the
/// order spec.md §9 prescribes: open the DB pool, ensure the replication
/// slot exists, start the ingester, start the broadcaster, then accept
/// connections.
pub struct Engine {
    pub config: Arc<Config>,
    pub pool: Pool,
    pub ledger: Arc<dyn ChangeLedger>,
    pub registry: Arc<dyn ClientRegistry>,
    pub broadcaster: Arc<LiveBroadcaster>,
    /// Tracks which session currently owns each `clientId`, so a
    /// reconnecting client force-closes its predecessor (spec.md §4.9).
    pub active_sessions: ActiveSessions,
    ingester_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build the engine and start its background ingester task. Does not
    /// start accepting WebSocket connections -- that's `listener::run`'s
    /// job, kept separate so tests can construct an `Engine` without
    /// binding a socket.
    pub async fn start(config: Arc<Config>, cancel: CancellationToken) -> Result<Arc<Self>, Error> {
        let database_url = config.database_url()?;
        let pool = build_pool(&database_url)?;

        let ledger = Arc::new(PostgresLedger::new(pool.clone()));
        ledger.ensure_schema().await?;

        let registry = Arc::new(PostgresRegistry::new(pool.clone()));
        registry.ensure_schema().await?;

        submission::ensure_schema(&pool).await?;

        let broadcaster = Arc::new(LiveBroadcaster::new(config.backpressure_timeout()));

        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(Error::InvalidDatabaseUrl)?;

        let ingester = Ingester::new(
            pg_config,
            IngesterConfig {
                slot_name: config.replication_slot_name.clone(),
                publication_name: config.publication_name.clone(),
                ..IngesterConfig::default()
            },
            ledger.clone(),
            broadcaster.clone(),
        );

        info!("starting replication ingester");
        let ingester_cancel = cancel.clone();
        let ingester_handle = tokio::spawn(async move {
            if let Err(err) = ingester.run(ingester_cancel).await {
                tracing::error!(error = %err, "replication ingester halted");
            }
        });

        Ok(Arc::new(Self {
            config,
            pool,
            ledger,
            registry,
            broadcaster,
            active_sessions: ActiveSessions::new(),
            ingester_handle: parking_lot::Mutex::new(Some(ingester_handle)),
        }))
    }

    pub fn handles(&self) -> SessionHandles {
        SessionHandles {
            registry: self.registry.clone(),
            ledger: self.ledger.clone(),
            broadcaster: self.broadcaster.clone(),
            pool: self.pool.clone(),
        }
    }

    /// Join the ingester task, e.g. during an orderly shutdown.
    pub async fn join(&self) {
        let handle = self.ingester_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn build_pool(database_url: &str) -> Result<Pool, deadpool_postgres::CreatePoolError> {
    let mut pool_config = PoolConfig::new();
    pool_config.url = Some(database_url.to_string());
    pool_config.create_pool(Some(Runtime::Tokio1), NoTls)
}
