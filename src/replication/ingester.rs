//! The replication ingester (C5, spec.md §4.5): subscribes to the
//! logical replication stream, decodes each transaction, appends its row
//! changes to the change-history ledger in commit order, and hands the
//! batch to whoever broadcasts it to live sessions.
//!
//! Grounded in the dispatch loop of
//! `backend/replication/logical/subscriber/stream.rs::StreamSubscriber::handle`,
//! which matches on `XLogPayload` variants and tracks a `lsn`/`lsn_changed`
//! checkpoint the same way this ingester tracks `last_confirmed`.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use postgres_protocol::message::backend::{LogicalReplicationMessage, ReplicationMessage};
use postgres_types::PgLsn;
use tokio::time::{interval, MissedTickBehavior};
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::replication::LogicalReplicationStream;
use tokio_postgres::{Config, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ledger::ChangeLedger;
use crate::lsn::Lsn;
use crate::model::{Change, Op, Table};

use super::decode::{decode_delete, decode_insert, decode_timestamp, decode_update, RelationCache};
use super::slot;
use super::Error;

/// Receives each transaction's committed changes once the ingester has
/// durably appended them to the ledger. Implemented by the live
/// broadcaster (C8); a [`NullSink`] is used where only the ledger side
/// matters.
#[async_trait]
pub trait IngestSink: Send + Sync {
    async fn on_committed(&self, changes: Vec<Change>);
}

pub struct NullSink;

#[async_trait]
impl IngestSink for NullSink {
    async fn on_committed(&self, _changes: Vec<Change>) {}
}

#[derive(Debug, Clone)]
pub struct IngesterConfig {
    pub slot_name: String,
    pub publication_name: String,
    pub status_interval: Duration,
    pub reconnect_min_backoff: Duration,
    pub reconnect_max_backoff: Duration,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            slot_name: "vibestack_sync".to_string(),
            publication_name: "vibestack_sync".to_string(),
            status_interval: Duration::from_secs(10),
            reconnect_min_backoff: Duration::from_millis(500),
            reconnect_max_backoff: Duration::from_secs(30),
        }
    }
}

pub struct Ingester {
    connect_config: Config,
    config: IngesterConfig,
    ledger: Arc<dyn ChangeLedger>,
    sink: Arc<dyn IngestSink>,
}

impl Ingester {
    pub fn new(
        connect_config: Config,
        config: IngesterConfig,
        ledger: Arc<dyn ChangeLedger>,
        sink: Arc<dyn IngestSink>,
    ) -> Self {
        Self {
            connect_config,
            config,
            ledger,
            sink,
        }
    }

    /// Run until `cancel` fires. Reconnects with exponential backoff on any
    /// stream error; never advances `last_confirmed` (and so never tells
    /// Postgres it can discard WAL) past the last change it actually
    /// appended to the ledger.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), Error> {
        let mut backoff = self.config.reconnect_min_backoff;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.run_once(&cancel).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    error!(error = %err, backoff = ?backoff, "replication stream failed, reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Ok(()),
                    }
                    backoff = (backoff * 2).min(self.config.reconnect_max_backoff);
                }
            }
        }
    }

    async fn connect(&self) -> Result<tokio_postgres::Client, Error> {
        let mut config = self.connect_config.clone();
        config.replication_mode(ReplicationMode::Logical);
        let (client, connection) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "replication connection closed with error");
            }
        });
        Ok(client)
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let client = self.connect().await?;

        let created = slot::ensure_slot(&client, &self.config.slot_name).await?;
        let start_lsn = match created {
            Some(lsn) => lsn,
            None => self.ledger.head_lsn().await?,
        };

        info!(slot = %self.config.slot_name, from = %start_lsn, "starting logical replication");

        let query = format!(
            r#"START_REPLICATION SLOT "{}" LOGICAL {} (proto_version '1', publication_names '{}')"#,
            self.config.slot_name, start_lsn, self.config.publication_name
        );
        let copy_stream = client.copy_both_simple::<bytes::Bytes>(&query).await?;
        let stream = LogicalReplicationStream::new(copy_stream);
        tokio::pin!(stream);

        let mut relations = RelationCache::new();
        let mut pending: Vec<(Table, Op, serde_json::Value)> = Vec::new();
        let mut last_confirmed = start_lsn;

        let mut ticker = interval(self.config.status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    send_status_update(stream.as_mut(), last_confirmed).await?;
                }
                message = stream.next() => {
                    let Some(message) = message else { return Err(Error::StreamClosed) };
                    match message? {
                        ReplicationMessage::XLogData(xlog) => {
                            match xlog.into_data() {
                                LogicalReplicationMessage::Begin(_) => {
                                    pending.clear();
                                }
                                LogicalReplicationMessage::Relation(body) => {
                                    relations.observe(&body)?;
                                }
                                LogicalReplicationMessage::Insert(body) => {
                                    if let Some(row) = decode_insert(&relations, &body)? {
                                        pending.push((row.table, row.op, row.data));
                                    }
                                }
                                LogicalReplicationMessage::Update(body) => {
                                    if let Some(row) = decode_update(&relations, &body)? {
                                        pending.push((row.table, row.op, row.data));
                                    }
                                }
                                LogicalReplicationMessage::Delete(body) => {
                                    if let Some(row) = decode_delete(&relations, &body)? {
                                        pending.push((row.table, row.op, row.data));
                                    }
                                }
                                LogicalReplicationMessage::Commit(body) => {
                                    let lsn = Lsn::from_u64(body.commit_lsn());
                                    let commit_ts = decode_timestamp(body.timestamp());
                                    let changes = drain_commit(&mut pending, lsn, commit_ts);

                                    for change in &changes {
                                        self.ledger.append(change.clone()).await?;
                                    }
                                    if !changes.is_empty() {
                                        self.sink.on_committed(changes).await;
                                    }

                                    last_confirmed = lsn;
                                    send_status_update(stream.as_mut(), last_confirmed).await?;
                                }
                                _ => {}
                            }
                        }
                        ReplicationMessage::PrimaryKeepAlive(keepalive) => {
                            if keepalive.reply() == 1 {
                                send_status_update(stream.as_mut(), last_confirmed).await?;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

fn drain_commit(
    pending: &mut Vec<(Table, Op, serde_json::Value)>,
    lsn: Lsn,
    commit_ts: DateTime<Utc>,
) -> Vec<Change> {
    pending
        .drain(..)
        .map(|(table, op, data)| {
            let updated_at = data
                .get("updatedAt")
                .and_then(serde_json::Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(commit_ts);
            Change::new(table, op, data, lsn, updated_at)
        })
        .collect()
}

async fn send_status_update(
    stream: Pin<&mut LogicalReplicationStream>,
    lsn: Lsn,
) -> Result<(), Error> {
    let write_lsn = PgLsn::from(lsn.as_u64());
    stream
        .standby_status_update(write_lsn, write_lsn, write_lsn, postgres_epoch_micros(), 0)
        .await?;
    Ok(())
}

fn postgres_epoch_micros() -> i64 {
    let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    (Utc::now() - epoch).num_microseconds().unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn drain_commit_prefers_row_updated_at_over_commit_time() {
        let commit_ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let row_ts = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let mut pending = vec![(
            Table::Tasks,
            Op::Insert,
            json!({"id": "t1", "updatedAt": row_ts.to_rfc3339()}),
        )];

        let changes = drain_commit(&mut pending, Lsn::parse("0/10").unwrap(), commit_ts);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].updated_at, row_ts);
        assert!(pending.is_empty());
    }

    #[test]
    fn drain_commit_falls_back_to_commit_time() {
        let commit_ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut pending = vec![(Table::Tasks, Op::Insert, json!({"id": "t1"}))];

        let changes = drain_commit(&mut pending, Lsn::parse("0/10").unwrap(), commit_ts);
        assert_eq!(changes[0].updated_at, commit_ts);
    }
}
