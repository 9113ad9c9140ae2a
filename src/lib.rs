//! vibestack-sync: a real-time bidirectional data-sync engine backed by
//! PostgreSQL logical replication, speaking a JSON-over-WebSocket protocol
//! to its clients.

pub mod auth;
pub mod broadcast;
pub mod catchup;
pub mod cli;
pub mod config;
pub mod conflict;
pub mod dedupe;
pub mod engine;
pub mod healthcheck;
pub mod ledger;
pub mod listener;
pub mod logging;
pub mod lsn;
pub mod model;
pub mod registry;
pub mod replication;
pub mod session;
pub mod submission;
pub mod tls;
