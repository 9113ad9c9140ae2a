//! `/healthz` + `/readyz` HTTP surface (spec.md §6.1 [AMBIENT]).
//!
//! Grounded in the teacher's `healthcheck.rs`: a bare `hyper` `http1`
//! connection loop with no router crate, since there are only two routes.
//! Deliberately not the teacher's full `admin/` console (`SHOW`/`SET`
//! commands over the Postgres wire protocol) -- that's an explicit
//! Non-goal (spec.md §1): this surface answers "is the process alive" and
//! "is it caught up", nothing else.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::lsn::Lsn;

pub async fn server(engine: Arc<Engine>, port: u16, cancel: CancellationToken) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "healthcheck endpoint listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let io = TokioIo::new(stream);
                let engine = engine.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, engine.clone()));
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        warn!(error = %err, "healthcheck connection error");
                    }
                });
            }
        }
    }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    engine: Arc<Engine>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (status, body) = match req.uri().path() {
        "/healthz" => healthz(&engine).await,
        "/readyz" => readyz(&engine).await,
        _ => (404, "not found"),
    };

    Ok(Response::builder()
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("healthcheck unavailable")))))
}

/// Liveness: the process can still reach the database through its pool.
/// Does not check replication lag -- that's `/readyz`'s job, since a
/// lagging-but-alive process should still be considered live (restarting
/// it would only make the lag worse).
async fn healthz(engine: &Engine) -> (u16, &'static str) {
    match engine.pool.get().await {
        Ok(_) => (200, "up"),
        Err(_) => (503, "down"),
    }
}

/// Readiness: the replication ingester has caught the change-history ledger
/// up to (or within a small slack of) the current WAL position. A session
/// connecting to a not-ready instance would otherwise be handed a stale
/// catch-up snapshot.
async fn readyz(engine: &Engine) -> (u16, &'static str) {
    let Ok(client) = engine.pool.get().await else {
        return (503, "database unavailable");
    };
    let Ok(row) = client.query_one("SELECT pg_current_wal_lsn()::text", &[]).await else {
        return (503, "could not read wal position");
    };
    let current: String = row.get(0);
    let Ok(current_lsn) = Lsn::parse(&current) else {
        return (503, "malformed wal lsn");
    };

    let Ok(ledger_head) = engine.ledger.head_lsn().await else {
        return (503, "ledger unavailable");
    };

    if Lsn::compare(&ledger_head, &current_lsn) >= 0 {
        (200, "ready")
    } else {
        (503, "catching up")
    }
}
