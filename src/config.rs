//! Configuration (spec.md §6, §4.14 [AMBIENT]).
//!
//! One immutable [`Config`] value, deserialized from TOML with `serde` +
//! `toml` the way `config::core::ConfigAndUsers::load` reads `pgdog.toml`,
//! field-by-field defaulted the way `config::General` is
//! (`#[serde(default = "...")]` per field). Unlike the teacher, this value
//! is never stashed behind a process-wide `ArcSwap` singleton -- it is
//! constructed once at startup and passed down explicitly to the `Engine`
//! and every session task (spec.md §9 design note).

use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read \"{path}\": {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse \"{path}\": {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("DATABASE_URL is not set and no database_url was configured")]
    MissingDatabaseUrl,
}

/// Selects the `tracing-subscriber` formatter layer (§4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, for local development.
    #[default]
    Pretty,
    /// Structured JSON, for production log aggregation.
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Postgres connection string. Falls back to the `DATABASE_URL`
    /// environment variable when absent from the file, matching the
    /// teacher's CLI `--database-url` override convention.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Address the WebSocket listener binds.
    #[serde(default = "Config::host")]
    pub host: String,

    /// Port the WebSocket listener binds.
    #[serde(default = "Config::port")]
    pub port: u16,

    /// Name of the logical replication slot (`REPLICATION_SLOT_NAME`).
    #[serde(default = "Config::replication_slot_name")]
    pub replication_slot_name: String,

    /// Name of the publication the slot decodes (not in spec.md's
    /// enumerated list, but required to start logical replication at all;
    /// grounded in `backend/replication/logical/publisher/queries.rs`'s
    /// `CREATE PUBLICATION` handling).
    #[serde(default = "Config::publication_name")]
    pub publication_name: String,

    /// `CATCHUP_CHUNK_SIZE`.
    #[serde(default = "Config::catchup_chunk_size")]
    pub catchup_chunk_size: usize,

    /// `HEARTBEAT_INTERVAL_SEC`.
    #[serde(default = "Config::heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,

    /// `ACK_TIMEOUT_SEC`.
    #[serde(default = "Config::ack_timeout_sec")]
    pub ack_timeout_sec: u64,

    /// `OUTBOUND_QUEUE_DEPTH`.
    #[serde(default = "Config::outbound_queue_depth")]
    pub outbound_queue_depth: usize,

    /// `BACKPRESSURE_TIMEOUT_SEC`.
    #[serde(default = "Config::backpressure_timeout_sec")]
    pub backpressure_timeout_sec: u64,

    /// Socket write timeout, `T_w` (spec.md §5).
    #[serde(default = "Config::socket_write_timeout_sec")]
    pub socket_write_timeout_sec: u64,

    /// `ALLOWED_ORIGINS`.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Shared secret checked against a connecting client's opaque `auth`
    /// token (§6.2 identity boundary). Empty disables auth -- only ever
    /// appropriate in tests/local dev.
    #[serde(default)]
    pub auth_shared_secret: String,

    /// TLS certificate/key pair. Absent means the listener serves plain
    /// WebSocket (acceptable behind a TLS-terminating load balancer; the
    /// wire protocol itself specifies WebSocket-over-TLS end to end).
    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,
    #[serde(default)]
    pub tls_private_key: Option<PathBuf>,

    /// Port for the `/healthz` + `/readyz` HTTP surface (§6.1). `None`
    /// disables it.
    #[serde(default = "Config::healthcheck_port")]
    pub healthcheck_port: Option<u16>,

    /// `tracing-subscriber` formatter selection.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Number of Tokio worker threads; `0` lets Tokio pick based on CPU
    /// count, matching `General::workers`'s "spawn this many" semantics.
    #[serde(default = "Config::workers")]
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            host: Self::host(),
            port: Self::port(),
            replication_slot_name: Self::replication_slot_name(),
            publication_name: Self::publication_name(),
            catchup_chunk_size: Self::catchup_chunk_size(),
            heartbeat_interval_sec: Self::heartbeat_interval_sec(),
            ack_timeout_sec: Self::ack_timeout_sec(),
            outbound_queue_depth: Self::outbound_queue_depth(),
            backpressure_timeout_sec: Self::backpressure_timeout_sec(),
            socket_write_timeout_sec: Self::socket_write_timeout_sec(),
            allowed_origins: Vec::new(),
            auth_shared_secret: String::new(),
            tls_certificate: None,
            tls_private_key: None,
            healthcheck_port: Self::healthcheck_port(),
            log_format: LogFormat::default(),
            workers: Self::workers(),
        }
    }
}

impl Config {
    fn host() -> String {
        "0.0.0.0".into()
    }
    fn port() -> u16 {
        6432
    }
    fn replication_slot_name() -> String {
        "vibestack_replication".into()
    }
    fn publication_name() -> String {
        "vibestack_sync".into()
    }
    fn catchup_chunk_size() -> usize {
        500
    }
    fn heartbeat_interval_sec() -> u64 {
        10
    }
    fn ack_timeout_sec() -> u64 {
        10
    }
    fn outbound_queue_depth() -> usize {
        256
    }
    fn backpressure_timeout_sec() -> u64 {
        30
    }
    fn socket_write_timeout_sec() -> u64 {
        5
    }
    fn healthcheck_port() -> Option<u16> {
        Some(9090)
    }
    fn workers() -> usize {
        0
    }

    /// Load `path`, falling back to defaults if it doesn't exist -- same
    /// "warn and continue" behavior as `ConfigAndUsers::load`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config = match read_to_string(path) {
            Ok(contents) => {
                let config: Config = toml::from_str(&contents).map_err(|source| Error::Parse {
                    path: path.to_owned(),
                    source,
                })?;
                info!(path = %path.display(), "loaded configuration");
                config
            }
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Config::default()
            }
            Err(source) => {
                return Err(Error::Read {
                    path: path.to_owned(),
                    source,
                })
            }
        };
        Ok(config)
    }

    /// Resolve the effective database URL: the config file's value, else
    /// the `DATABASE_URL` environment variable.
    pub fn database_url(&self) -> Result<String, Error> {
        self.database_url
            .clone()
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .ok_or(Error::MissingDatabaseUrl)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_sec)
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_secs(self.backpressure_timeout_sec)
    }

    pub fn socket_write_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_write_timeout_sec)
    }

    /// `3H` per spec.md §4.9: heartbeats must be missed three times in a
    /// row before a session is deemed dead.
    pub fn heartbeat_loss_timeout(&self) -> Duration {
        self.heartbeat_interval() * 3
    }

    /// Overlay CLI-provided overrides (clap's `Option<T>` fields) onto a
    /// loaded config, matching the teacher's `Run { pool_size, .. }`
    /// subcommand overrides in `cli.rs`.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database_url = Some(database_url);
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(slot_name) = overrides.replication_slot_name {
            self.replication_slot_name = slot_name;
        }
    }
}

/// CLI-provided overrides layered on top of a loaded [`Config`] (§4.15).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub port: Option<u16>,
    pub replication_slot_name: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_spec_enumerated_values() {
        let config = Config::default();
        assert_eq!(config.replication_slot_name, "vibestack_replication");
        assert_eq!(config.catchup_chunk_size, 500);
        assert_eq!(config.heartbeat_interval_sec, 10);
        assert_eq!(config.ack_timeout_sec, 10);
        assert_eq!(config.outbound_queue_depth, 256);
        assert_eq!(config.backpressure_timeout_sec, 30);
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/vibestack.toml")).unwrap();
        assert_eq!(config.port, Config::port());
    }

    #[test]
    fn parses_partial_toml_with_defaults_for_the_rest() {
        let toml = r#"
            replication_slot_name = "custom_slot"
            catchup_chunk_size = 250
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.replication_slot_name, "custom_slot");
        assert_eq!(config.catchup_chunk_size, 250);
        assert_eq!(config.ack_timeout_sec, 10);
    }

    #[test]
    fn overrides_apply_on_top_of_loaded_config() {
        let mut config = Config::default();
        config.apply_overrides(ConfigOverrides {
            database_url: Some("postgres://x".into()),
            port: Some(7000),
            replication_slot_name: None,
        });
        assert_eq!(config.database_url.as_deref(), Some("postgres://x"));
        assert_eq!(config.port, 7000);
        assert_eq!(config.replication_slot_name, "vibestack_replication");
    }

    #[test]
    fn heartbeat_loss_timeout_is_three_times_interval() {
        let config = Config::default();
        assert_eq!(config.heartbeat_loss_timeout(), Duration::from_secs(30));
    }
}
