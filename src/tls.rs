//! Server-side TLS for the WebSocket listener (spec.md §6 "wss://").
//!
//! Grounded in the teacher's `net/tls.rs::build_acceptor`, trimmed to just
//! the accept side: this service never connects out over TLS itself, and
//! unlike the teacher's `ArcSwapOption<TlsAcceptor>` there is no SIGHUP-driven
//! hot reload here -- the acceptor is built once from the startup `Config`
//! and handed down alongside everything else `Engine` owns.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read TLS certificate/key: {0}")]
    Pem(#[from] tokio_rustls::rustls::pki_types::pem::Error),

    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),
}

/// Build a [`TlsAcceptor`] from a PEM certificate and private key. Returns
/// `None` when no TLS paths are configured, in which case the listener
/// serves plain WebSocket -- acceptable behind a TLS-terminating load
/// balancer.
pub fn build_acceptor(cert: Option<&Path>, key: Option<&Path>) -> Result<Option<TlsAcceptor>, Error> {
    let (Some(cert), Some(key)) = (cert, key) else {
        return Ok(None);
    };

    let cert = CertificateDer::from_pem_file(cert)?;
    let key = PrivateKeyDer::from_pem_file(key)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
