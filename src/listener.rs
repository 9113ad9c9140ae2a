//! WebSocket accept loop (spec.md §6): binds the listening socket, performs
//! the optional TLS handshake, validates the connecting client's identity
//! and origin, then hands the upgraded socket off to the per-session
//! transport pump (C9) and handler.
//!
//! Grounded in the teacher's `frontend/listener.rs::Listener::listen`
//! accept loop, but shutdown is driven by an explicit [`CancellationToken`]
//! passed down from `main` instead of the teacher's process-wide
//! `Arc<Notify>` / `comms()` singleton (spec.md §9 design note).

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::TokenValidator;
use crate::engine::Engine;
use crate::session::handler::{self, SessionConfig};
use crate::session::protocol::CloseCode;
use crate::session::transport;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default)]
struct ConnectParams {
    client_id: Option<Uuid>,
    auth_token: Option<String>,
}

fn parse_connect_params(uri: &str) -> ConnectParams {
    let mut params = ConnectParams::default();
    let Some((_, query)) = uri.split_once('?') else {
        return params;
    };
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else { continue };
        let value = url::form_urlencoded::parse(value.as_bytes())
            .map(|(k, _)| k.into_owned())
            .next()
            .unwrap_or_default();
        match key {
            "clientId" => params.client_id = Uuid::parse_str(&value).ok(),
            "auth" => params.auth_token = Some(value),
            _ => {}
        }
    }
    params
}

fn origin_allowed(allowed_origins: &[String], request: &Request) -> bool {
    if allowed_origins.is_empty() {
        return true;
    }
    request
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|origin| allowed_origins.iter().any(|allowed| allowed == origin))
}

fn reject(status: StatusCode) -> ErrorResponse {
    Response::builder().status(status).body(None).expect("valid response")
}

fn tune_socket(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(std::time::Duration::from_secs(60));
    if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(error = %err, "failed to set TCP keepalive");
    }
}

/// Accept WebSocket connections until `cancel` fires.
pub async fn run(
    engine: Arc<Engine>,
    tls_acceptor: Option<TlsAcceptor>,
    validator: Arc<dyn TokenValidator>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let addr: SocketAddr = format!("{}:{}", engine.config.host, engine.config.port)
        .parse()
        .expect("host:port already validated by Config");

    let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind { addr, source })?;
    info!(%addr, tls = tls_acceptor.is_some(), "accepting websocket connections");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                tune_socket(&stream);

                let engine = engine.clone();
                let tls_acceptor = tls_acceptor.clone();
                let validator = validator.clone();
                let cancel = cancel.child_token();

                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer, tls_acceptor, engine, validator, cancel).await {
                        warn!(%peer, error = %err, "session ended with an error");
                    }
                });
            }
        }
    }
}

#[derive(Debug, Error)]
enum ConnError {
    #[error("tls handshake failed: {0}")]
    Tls(#[from] std::io::Error),

    #[error("websocket handshake failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connecting client omitted a clientId or auth token")]
    MissingParams,

    #[error("auth token rejected: {0}")]
    Auth(#[from] crate::auth::Error),

    #[error(transparent)]
    Transport(#[from] transport::Error),

    #[error(transparent)]
    Handler(#[from] handler::Error),
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    engine: Arc<Engine>,
    validator: Arc<dyn TokenValidator>,
    cancel: CancellationToken,
) -> Result<(), ConnError> {
    match tls_acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(stream).await?;
            run_session(tls_stream, peer, engine, validator, cancel).await
        }
        None => run_session(stream, peer, engine, validator, cancel).await,
    }
}

async fn run_session<S>(
    stream: S,
    peer: SocketAddr,
    engine: Arc<Engine>,
    validator: Arc<dyn TokenValidator>,
    cancel: CancellationToken,
) -> Result<(), ConnError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let captured: Arc<Mutex<Option<ConnectParams>>> = Arc::new(Mutex::new(None));
    let captured_cb = captured.clone();
    let allowed_origins = engine.config.allowed_origins.clone();

    let callback = move |request: &Request, response: Response| {
        if !origin_allowed(&allowed_origins, request) {
            return Err(reject(StatusCode::FORBIDDEN));
        }
        *captured_cb.lock() = Some(parse_connect_params(request.uri().to_string().as_str()));
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    let params = captured.lock().take().unwrap_or_default();
    let (Some(client_id), Some(auth_token)) = (params.client_id, params.auth_token) else {
        return Err(ConnError::MissingParams);
    };

    let identity = validator.validate(&auth_token).await?;

    let session_id = Uuid::new_v4();
    info!(%session_id, %client_id, %peer, "session opened");

    let close_reason: Arc<Mutex<Option<CloseCode>>> = Arc::new(Mutex::new(None));

    // A known clientId reconnecting force-closes whatever session currently
    // holds it before this one proceeds into Opening (spec.md §4.9).
    engine.active_sessions.take_over(client_id, session_id, cancel.clone(), close_reason.clone());

    let (inbound_tx, inbound_rx) = mpsc::channel(32);
    let (outbound_tx, outbound_rx) = mpsc::channel(engine.config.outbound_queue_depth);

    let transport_handle = {
        let cancel = cancel.clone();
        let close_reason = close_reason.clone();
        tokio::spawn(async move { transport::run(ws, inbound_tx, outbound_rx, cancel, close_reason).await })
    };

    let handles = engine.handles();
    let session_config = SessionConfig {
        queue_depth: engine.config.outbound_queue_depth,
        heartbeat_timeout: engine.config.heartbeat_loss_timeout(),
        catchup: crate::catchup::CatchupConfig {
            chunk_size: engine.config.catchup_chunk_size,
            ack_timeout: engine.config.ack_timeout(),
        },
    };

    let handler_result = handler::run(
        session_id,
        client_id,
        identity.profile_id,
        identity.subject_id,
        &handles,
        &session_config,
        inbound_rx,
        outbound_tx,
        cancel.clone(),
        close_reason,
    )
    .await;

    cancel.cancel();
    let _ = transport_handle.await;
    engine.active_sessions.remove_if_current(client_id, session_id);

    info!(%session_id, "session closed");
    handler_result.map_err(ConnError::from)
}
