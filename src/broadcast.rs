//! Live broadcaster (C8, spec.md §4.8): fans out each committed batch from
//! the replication ingester (C5) to every subscribed session, filtering out
//! a session's own submitted changes and enforcing per-session backpressure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::model::Change;
use crate::replication::IngestSink;
use crate::session::protocol::{CloseCode, ServerMessage};

struct Subscriber {
    client_id: Uuid,
    sender: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
    close_reason: Arc<Mutex<Option<CloseCode>>>,
}

/// A subscribed session's handle back from [`LiveBroadcaster::subscribe`].
/// `close_reason` is set before `cancel` fires when the broadcaster itself
/// ends the session (currently only for backpressure); the session's owner
/// should check it when tearing down to pick the right WebSocket close
/// code instead of defaulting to `Normal`.
pub struct Subscription {
    pub receiver: mpsc::Receiver<ServerMessage>,
    pub close_reason: Arc<Mutex<Option<CloseCode>>>,
}

pub struct LiveBroadcaster {
    subscribers: DashMap<Uuid, Subscriber>,
    backpressure_timeout: Duration,
}

impl LiveBroadcaster {
    pub fn new(backpressure_timeout: Duration) -> Self {
        Self {
            subscribers: DashMap::new(),
            backpressure_timeout,
        }
    }

    /// `close_reason` is supplied by the caller rather than created here so
    /// that the session's WebSocket transport pump (which owns the same
    /// cell) observes whatever code the broadcaster sets before cancelling
    /// a slow consumer, instead of defaulting to `Normal`.
    pub fn subscribe(
        &self,
        session_id: Uuid,
        client_id: Uuid,
        queue_depth: usize,
        cancel: CancellationToken,
        close_reason: Arc<Mutex<Option<CloseCode>>>,
    ) -> Subscription {
        let (sender, receiver) = mpsc::channel(queue_depth);
        self.subscribers.insert(
            session_id,
            Subscriber {
                client_id,
                sender,
                cancel,
                close_reason: close_reason.clone(),
            },
        );
        Subscription { receiver, close_reason }
    }

    pub fn unsubscribe(&self, session_id: Uuid) {
        self.subscribers.remove(&session_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver a committed batch to every subscriber, excluding (per
    /// subscriber) any change whose embedded `clientId` matches the
    /// subscriber's own — a session never sees its own submission echoed
    /// back as a live change (spec.md §8 property 7). A subscriber that
    /// doesn't drain its queue within the backpressure timeout is closed
    /// with [`CloseCode::SlowConsumer`] and removed.
    pub async fn broadcast(&self, changes: Vec<Change>) {
        if changes.is_empty() {
            return;
        }

        let max_lsn = changes.iter().map(|c| c.lsn).max().expect("non-empty");
        let message_id = Uuid::new_v4().to_string();
        let timeout = self.backpressure_timeout;

        let targets: Vec<(Uuid, Uuid, mpsc::Sender<ServerMessage>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.client_id, entry.sender.clone()))
            .collect();

        let sends = targets.into_iter().map(|(session_id, client_id, sender)| {
            let changes = changes.clone();
            let message_id = message_id.clone();
            async move {
                let filtered: Vec<Change> = changes
                    .into_iter()
                    .filter(|c| c.client_id() != Some(client_id))
                    .collect();
                if filtered.is_empty() {
                    return None;
                }

                let msg = ServerMessage::LiveChanges {
                    client_id,
                    message_id,
                    timestamp: Utc::now(),
                    changes: filtered,
                    last_lsn: max_lsn,
                };

                match tokio::time::timeout(timeout, sender.send(msg)).await {
                    Ok(Ok(())) => None,
                    _ => Some(session_id),
                }
            }
        });

        let slow: Vec<Uuid> = futures::future::join_all(sends).await.into_iter().flatten().collect();

        for session_id in slow {
            if let Some((_, subscriber)) = self.subscribers.remove(&session_id) {
                *subscriber.close_reason.lock() = Some(CloseCode::SlowConsumer);
                subscriber.cancel.cancel();
            }
        }
    }
}

#[async_trait]
impl IngestSink for LiveBroadcaster {
    async fn on_committed(&self, changes: Vec<Change>) {
        self.broadcast(changes).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lsn::Lsn;
    use crate::model::{Op, Table};
    use serde_json::json;

    fn change(id: &str, client_id: Option<Uuid>) -> Change {
        let mut data = json!({"id": id});
        if let Some(client_id) = client_id {
            data["clientId"] = json!(client_id.to_string());
        }
        Change::new(Table::Tasks, Op::Insert, data, Lsn::parse("0/1").unwrap(), Utc::now())
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_its_own_change() {
        let broadcaster = LiveBroadcaster::new(Duration::from_secs(1));
        let client_id = Uuid::new_v4();
        let mut sub = broadcaster.subscribe(
            Uuid::new_v4(),
            client_id,
            8,
            CancellationToken::new(),
            Arc::new(Mutex::new(None)),
        );

        broadcaster.broadcast(vec![change("t1", Some(client_id))]).await;

        tokio::time::timeout(Duration::from_millis(50), sub.receiver.recv())
            .await
            .expect_err("no message should have been delivered");
    }

    #[tokio::test]
    async fn other_subscriber_receives_the_change() {
        let broadcaster = LiveBroadcaster::new(Duration::from_secs(1));
        let origin = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut sub = broadcaster.subscribe(
            Uuid::new_v4(),
            other,
            8,
            CancellationToken::new(),
            Arc::new(Mutex::new(None)),
        );

        broadcaster.broadcast(vec![change("t1", Some(origin))]).await;

        let msg = sub.receiver.recv().await.expect("message delivered");
        assert!(matches!(msg, ServerMessage::LiveChanges { .. }));
    }

    #[tokio::test]
    async fn slow_consumer_is_closed_with_backpressure_code() {
        let broadcaster = LiveBroadcaster::new(Duration::from_millis(20));
        let session_id = Uuid::new_v4();
        let sub = broadcaster.subscribe(
            session_id,
            Uuid::new_v4(),
            1,
            CancellationToken::new(),
            Arc::new(Mutex::new(None)),
        );

        // Fill the queue without anyone draining it.
        broadcaster.broadcast(vec![change("t1", None)]).await;
        broadcaster.broadcast(vec![change("t2", None)]).await;

        assert_eq!(*sub.close_reason.lock(), Some(CloseCode::SlowConsumer));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
