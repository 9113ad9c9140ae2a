//! Session handler (C9, spec.md §4.9): owns one client's state machine
//! from `Opening` through `Closed`, coordinating the catch-up engine (C7),
//! the live broadcaster (C8), and the submission path (C10).

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use deadpool_postgres::Pool;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catchup::{self, CatchupConfig};
use crate::broadcast::LiveBroadcaster;
use crate::ledger::ChangeLedger;
use crate::registry::{ClientRecord, ClientRegistry};
use crate::submission;

use super::protocol::{ClientMessage, CloseCode, ServerMessage};
use super::state::{SessionState, SessionStateMachine};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Registry(#[from] crate::registry::Error),

    #[error(transparent)]
    Ledger(#[from] crate::ledger::Error),

    #[error(transparent)]
    Catchup(#[from] catchup::Error),

    #[error(transparent)]
    Submission(#[from] submission::Error),

    #[error("outbound channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub queue_depth: usize,
    pub heartbeat_timeout: Duration,
    pub catchup: CatchupConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            heartbeat_timeout: Duration::from_secs(45),
            catchup: CatchupConfig::default(),
        }
    }
}

/// The shared engine state a session needs to do its job; one set of
/// handles backs every concurrently running session.
pub struct SessionHandles {
    pub registry: Arc<dyn ClientRegistry>,
    pub ledger: Arc<dyn ChangeLedger>,
    pub broadcaster: Arc<LiveBroadcaster>,
    pub pool: Pool,
}

/// Drives one session end to end. Returns once the session is closed,
/// either because the peer disconnected, a protocol violation occurred,
/// or `cancel` fired (server shutdown or a broadcaster-initiated close for
/// backpressure).
#[allow(clippy::too_many_arguments)]
pub async fn run(
    session_id: Uuid,
    client_id: Uuid,
    profile_id: Uuid,
    subject_id: Option<String>,
    handles: &SessionHandles,
    config: &SessionConfig,
    mut inbound: mpsc::Receiver<ClientMessage>,
    outbound: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
    close_reason: Arc<parking_lot::Mutex<Option<CloseCode>>>,
) -> Result<(), Error> {
    let mut state = SessionStateMachine::new();
    state.transition(SessionState::AwaitingCatchup).expect("Opening -> AwaitingCatchup always legal");

    handles
        .registry
        .upsert(ClientRecord::new(client_id, profile_id, subject_id, Utc::now()))
        .await?;

    // Subscribed before catch-up starts reading the ledger, so nothing
    // committed after catch-up's snapshot of "head" is ever missed: it
    // simply queues in this channel until we start draining it in Live.
    // `close_reason` is shared with the transport pump driving this same
    // socket, so a broadcaster-initiated close (backpressure) surfaces the
    // right WebSocket close code instead of the transport defaulting to
    // `Normal`.
    let subscription = handles
        .broadcaster
        .subscribe(session_id, client_id, config.queue_depth, cancel.clone(), close_reason);
    let mut live_rx = subscription.receiver;

    let record = handles
        .registry
        .get(client_id)
        .await?
        .expect("just upserted above");
    let from_lsn = record.last_ack_lsn;

    state.transition(SessionState::Catchup).expect("AwaitingCatchup -> Catchup always legal");

    let (ack_tx, mut ack_rx) = mpsc::channel::<u32>(4);
    let catchup_handle = {
        let ledger = handles.ledger.clone();
        let catchup_config = config.catchup.clone();
        let outbound = outbound.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { catchup::run(client_id, from_lsn, ledger.as_ref(), &catchup_config, &outbound, &mut ack_rx, &cancel).await })
    };
    tokio::pin!(catchup_handle);
    let mut catchup_done = false;

    let mut last_heartbeat = Instant::now();
    let mut heartbeat_check = tokio::time::interval(config.heartbeat_timeout / 2);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,

            result = &mut catchup_handle, if !catchup_done => {
                catchup_done = true;
                match result {
                    Ok(Ok(report)) => {
                        info!(%session_id, %client_id, chunks = report.chunks_sent, "catch-up complete");
                        state.transition(SessionState::Live).expect("Catchup -> Live always legal");
                    }
                    Ok(Err(err)) => {
                        warn!(%session_id, error = %err, "catch-up failed");
                        close_with(&cancel, &subscription.close_reason, CloseCode::ProtocolError);
                        break;
                    }
                    Err(join_err) => {
                        warn!(%session_id, error = %join_err, "catch-up task panicked");
                        close_with(&cancel, &subscription.close_reason, CloseCode::ProtocolError);
                        break;
                    }
                }
            }

            Some(live_msg) = live_rx.recv(), if state.current() == SessionState::Live => {
                if outbound.send(live_msg).await.is_err() {
                    break;
                }
            }

            _ = heartbeat_check.tick() => {
                if last_heartbeat.elapsed() > config.heartbeat_timeout {
                    warn!(%session_id, "no heartbeat within timeout, closing");
                    close_with(&cancel, &subscription.close_reason, CloseCode::HeartbeatLost);
                    break;
                }
            }

            msg = inbound.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    ClientMessage::Heartbeat { .. } => {
                        last_heartbeat = Instant::now();
                    }
                    ClientMessage::CatchupReceived { chunk, .. } => {
                        let _ = ack_tx.send(chunk).await;
                    }
                    ClientMessage::ChangesReceived { last_lsn, .. } => {
                        handles.registry.update_last_ack_lsn(client_id, last_lsn).await?;
                    }
                    ClientMessage::Submit { client_id: msg_client_id, message_id, batch_id, changes, .. } => {
                        if msg_client_id != client_id || !submission::changes_belong_to_client(&changes, client_id) {
                            warn!(%session_id, "submit batch carried a foreign clientId, closing");
                            close_with(&cancel, &subscription.close_reason, CloseCode::ProtocolError);
                            break;
                        }

                        let outcome = submission::apply(&handles.pool, client_id, changes).await?;
                        let reply = match outcome {
                            submission::SubmissionOutcome::Accepted { resulting_lsn } => {
                                handles.registry.update_last_ack_lsn(client_id, resulting_lsn).await?;
                                ServerMessage::SubmitAck {
                                    client_id,
                                    message_id,
                                    timestamp: Utc::now(),
                                    batch_id,
                                    resulting_lsn,
                                }
                            }
                            submission::SubmissionOutcome::Rejected { reason, rejected } => {
                                ServerMessage::SubmitNack {
                                    client_id,
                                    message_id,
                                    timestamp: Utc::now(),
                                    batch_id,
                                    reason,
                                    rejected,
                                }
                            }
                        };
                        if outbound.send(reply).await.is_err() {
                            break;
                        }
                    }
                    ClientMessage::CatchupRequest { .. } => {
                        // Catch-up is driven unconditionally from the
                        // registry's last_ack_lsn on connect; an explicit
                        // re-request mid-session is a no-op today.
                    }
                    ClientMessage::Disconnect { .. } => break,
                }
            }
        }
    }

    state.transition(SessionState::Closing).ok();
    handles.broadcaster.unsubscribe(session_id);
    state.transition(SessionState::Closed).ok();

    Ok(())
}

fn close_with(cancel: &CancellationToken, close_reason: &parking_lot::Mutex<Option<CloseCode>>, code: CloseCode) {
    *close_reason.lock() = Some(code);
    cancel.cancel();
}
