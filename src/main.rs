//! Process entrypoint (spec.md §9: "startup order: open DB pool -> ensure
//! replication slot -> start ingester -> start broadcaster -> accept
//! WebSockets").
//!
//! Grounded in the teacher's `cli.rs`/`main`-wiring shape -- parse `Cli`,
//! load `Config`, dispatch on the subcommand -- but replacing the teacher's
//! process-wide `config()`/`databases()` singletons with the explicit
//! `Engine` handle built in `engine.rs` (spec.md §9 design note).

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
#[cfg(target_family = "unix")]
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use vibestack_sync::auth::{AllowAllValidator, SharedSecretValidator, TokenValidator};
use vibestack_sync::cli::{Cli, Commands};
use vibestack_sync::config::{Config, ConfigOverrides};
use vibestack_sync::engine::Engine;
use vibestack_sync::{healthcheck, listener, logging, tls};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(mut config) => {
            config.apply_overrides(ConfigOverrides {
                database_url: cli.database_url.clone(),
                port: cli.port,
                replication_slot_name: None,
            });
            config
        }
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(config.log_format);

    let runtime = match build_runtime(config.workers) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.clone().unwrap_or_default();
    let result = runtime.block_on(dispatch(command, config));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn build_runtime(workers: usize) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if workers > 0 {
        builder.worker_threads(workers);
    }
    builder.build()
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error(transparent)]
    Engine(#[from] vibestack_sync::engine::Error),

    #[error(transparent)]
    Listener(#[from] listener::Error),

    #[error(transparent)]
    Tls(#[from] tls::Error),

    #[error(transparent)]
    Config(#[from] vibestack_sync::config::Error),

    #[error("database connection failed: {0}")]
    Connect(#[source] tokio_postgres::Error),

    #[error(transparent)]
    Replication(#[from] vibestack_sync::replication::Error),
}

async fn dispatch(command: Commands, config: Config) -> Result<(), MainError> {
    match command {
        Commands::Configcheck => {
            info!("configuration is valid");
            Ok(())
        }
        Commands::SlotStatus => slot_status(config).await,
        Commands::Run => run(config).await,
    }
}

async fn slot_status(config: Config) -> Result<(), MainError> {
    let database_url = config.database_url()?;
    let pg_config: tokio_postgres::Config = database_url
        .parse()
        .map_err(MainError::Connect)?;
    let (client, connection) = pg_config
        .connect(tokio_postgres::NoTls)
        .await
        .map_err(MainError::Connect)?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(error = %err, "connection to database closed with an error");
        }
    });

    match vibestack_sync::replication::slot::slot_status(&client, &config.replication_slot_name).await? {
        Some(status) => {
            println!("slot:                {}", status.slot_name);
            println!("active:              {}", status.active);
            println!(
                "restart_lsn:         {}",
                status.restart_lsn.map(|l| l.to_string()).unwrap_or_else(|| "-".into())
            );
            println!(
                "confirmed_flush_lsn: {}",
                status
                    .confirmed_flush_lsn
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "-".into())
            );
        }
        None => println!("slot \"{}\" does not exist", config.replication_slot_name),
    }

    Ok(())
}

async fn run(config: Config) -> Result<(), MainError> {
    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let tls_acceptor = tls::build_acceptor(
        config.tls_certificate.as_deref(),
        config.tls_private_key.as_deref(),
    )?;

    let validator: Arc<dyn TokenValidator> = if config.auth_shared_secret.is_empty() {
        tracing::warn!("no auth_shared_secret configured; accepting any non-empty token");
        Arc::new(AllowAllValidator)
    } else {
        Arc::new(SharedSecretValidator::new(config.auth_shared_secret.clone()))
    };

    let engine = Engine::start(config.clone(), cancel.clone()).await?;

    let mut tasks = tokio::task::JoinSet::new();

    if let Some(port) = config.healthcheck_port {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(err) = healthcheck::server(engine, port, cancel).await {
                tracing::error!(error = %err, "healthcheck server stopped");
            }
        });
    }

    {
        let engine = engine.clone();
        let validator = validator.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(err) = listener::run(engine, tls_acceptor, validator, cancel).await {
                tracing::error!(error = %err, "listener stopped");
            }
        });
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining sessions");
    cancel.cancel();

    while tasks.join_next().await.is_some() {}
    engine.join().await;

    Ok(())
}

/// Waits for Ctrl+C or SIGTERM, whichever comes first -- the two signals an
/// orchestrator (systemd, Kubernetes) is expected to send for a graceful
/// stop.
async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(target_family = "unix")]
    {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(target_family = "unix"))]
    {
        let _ = ctrl_c.await;
    }
}
