//! Catch-up replay (C7, spec.md §4.7): ships a client's history gap in
//! ack-gated chunks from its last-acknowledged LSN up to the head of the
//! ledger as observed when catch-up began.

use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dedupe::dedupe;
use crate::ledger::ChangeLedger;
use crate::lsn::Lsn;
use crate::session::protocol::{Sequence, ServerMessage};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Ledger(#[from] crate::ledger::Error),

    #[error("catch-up cancelled")]
    Cancelled,

    #[error("client did not acknowledge chunk {0} within the ack timeout")]
    AckTimeout(u32),

    #[error("outbound channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct CatchupConfig {
    pub chunk_size: usize,
    pub ack_timeout: Duration,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            ack_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct CatchupReport {
    pub last_lsn: Lsn,
    pub chunks_sent: u32,
}

/// Replays `ledger` from `from_lsn` (exclusive) to the ledger's head at the
/// time catch-up starts, in chunks of `config.chunk_size`. Each chunk is
/// sent on `outbound` and must be acknowledged (its chunk number observed
/// on `ack_rx`) before the next one ships; a missing ack within
/// `config.ack_timeout` aborts catch-up so the caller can close the
/// session — the client reconnects and resumes from its last persisted
/// `lastAckLSN`, per spec.md's stated preference for per-chunk
/// advancement over an all-or-nothing `catchup_completed` gate.
pub async fn run(
    client_id: Uuid,
    from_lsn: Lsn,
    ledger: &dyn ChangeLedger,
    config: &CatchupConfig,
    outbound: &mpsc::Sender<ServerMessage>,
    ack_rx: &mut mpsc::Receiver<u32>,
    cancel: &CancellationToken,
) -> Result<CatchupReport, Error> {
    let head = ledger.head_lsn().await?;

    if Lsn::compare(&from_lsn, &head) >= 0 {
        send_completed(client_id, outbound, head).await?;
        return Ok(CatchupReport {
            last_lsn: head,
            chunks_sent: 0,
        });
    }

    let total_rows = ledger.count_after(from_lsn).await?;
    let total_chunks = total_rows.div_ceil(config.chunk_size as u64).max(1) as u32;

    let mut cursor = from_lsn;
    let mut chunk_number = 0u32;

    loop {
        if Lsn::compare(&cursor, &head) >= 0 {
            break;
        }

        let batch = ledger.read_after(cursor, config.chunk_size).await?;
        if batch.is_empty() {
            break;
        }

        chunk_number += 1;
        let chunk_last_lsn = batch.last().map(|c| c.lsn).unwrap_or(cursor);

        // Origin-filtered so a client never receives its own submitted
        // changes echoed back during catch-up (spec.md §8 property 7).
        let deduped = dedupe(batch, Some(client_id)).changes;

        outbound
            .send(ServerMessage::CatchupChanges {
                client_id,
                message_id: None,
                timestamp: Utc::now(),
                changes: deduped,
                sequence: Sequence {
                    chunk: chunk_number,
                    total: total_chunks,
                },
                last_lsn: chunk_last_lsn,
            })
            .await
            .map_err(|_| Error::ChannelClosed)?;

        await_ack(chunk_number, ack_rx, config.ack_timeout, cancel).await?;

        cursor = chunk_last_lsn;
    }

    send_completed(client_id, outbound, head).await?;
    Ok(CatchupReport {
        last_lsn: head,
        chunks_sent: chunk_number,
    })
}

async fn send_completed(
    client_id: Uuid,
    outbound: &mpsc::Sender<ServerMessage>,
    last_lsn: Lsn,
) -> Result<(), Error> {
    outbound
        .send(ServerMessage::CatchupCompleted {
            client_id,
            message_id: None,
            timestamp: Utc::now(),
            last_lsn,
        })
        .await
        .map_err(|_| Error::ChannelClosed)
}

async fn await_ack(
    expected_chunk: u32,
    ack_rx: &mut mpsc::Receiver<u32>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            ack = tokio::time::timeout(timeout, ack_rx.recv()) => {
                match ack {
                    Ok(Some(chunk)) if chunk == expected_chunk => return Ok(()),
                    Ok(Some(_stale)) => continue,
                    Ok(None) => return Err(Error::ChannelClosed),
                    Err(_elapsed) => return Err(Error::AckTimeout(expected_chunk)),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ledger::memory::InMemoryLedger;
    use crate::model::{Op, Table};
    use serde_json::json;

    fn change(lsn: &str, id: &str) -> crate::model::Change {
        crate::model::Change::new(Table::Tasks, Op::Insert, json!({"id": id}), Lsn::parse(lsn).unwrap(), Utc::now())
    }

    #[tokio::test]
    async fn empty_gap_completes_immediately_with_zero_chunks() {
        let ledger = InMemoryLedger::new();
        ledger.append(change("0/1", "a")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let (_ack_tx, mut ack_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let report = run(
            Uuid::new_v4(),
            Lsn::parse("0/1").unwrap(),
            &ledger,
            &CatchupConfig::default(),
            &tx,
            &mut ack_rx,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(report.chunks_sent, 0);
        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::CatchupCompleted { .. }));
    }

    #[tokio::test]
    async fn multi_chunk_replay_waits_for_each_ack() {
        let ledger = InMemoryLedger::new();
        for i in 1..=5u32 {
            ledger.append(change(&format!("0/{i}"), &format!("row{i}"))).await.unwrap();
        }

        let (tx, mut rx) = mpsc::channel(8);
        let (ack_tx, mut ack_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let config = CatchupConfig { chunk_size: 2, ack_timeout: Duration::from_secs(5) };
        let client_id = Uuid::new_v4();

        let handle = tokio::spawn(async move {
            run(client_id, Lsn::ZERO, &ledger, &config, &tx, &mut ack_rx, &cancel).await
        });

        let first = rx.recv().await.unwrap();
        let ServerMessage::CatchupChanges { sequence, .. } = &first else {
            panic!("expected catchup_changes");
        };
        assert_eq!(sequence.chunk, 1);
        assert_eq!(sequence.total, 3);
        ack_tx.send(1).await.unwrap();

        let second = rx.recv().await.unwrap();
        assert!(matches!(second, ServerMessage::CatchupChanges { .. }));
        ack_tx.send(2).await.unwrap();

        let third = rx.recv().await.unwrap();
        assert!(matches!(third, ServerMessage::CatchupChanges { .. }));
        ack_tx.send(3).await.unwrap();

        let completed = rx.recv().await.unwrap();
        assert!(matches!(completed, ServerMessage::CatchupCompleted { .. }));

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.chunks_sent, 3);
    }

    #[tokio::test]
    async fn missing_ack_times_out() {
        let ledger = InMemoryLedger::new();
        ledger.append(change("0/1", "a")).await.unwrap();
        ledger.append(change("0/2", "b")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let (_ack_tx, mut ack_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let config = CatchupConfig { chunk_size: 1, ack_timeout: Duration::from_millis(20) };

        let result = run(Uuid::new_v4(), Lsn::ZERO, &ledger, &config, &tx, &mut ack_rx, &cancel).await;
        assert!(matches!(result, Err(Error::AckTimeout(1))));
        drop(rx);
    }
}
