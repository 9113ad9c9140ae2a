//! Tracks the one session currently active per `clientId`, so a
//! reconnecting client forces its predecessor closed instead of the two
//! running side by side (spec.md §4.9 "Reconnection": "on any new
//! connection bearing a known `clientId`, prior `Session` is force-closed
//! before the new one enters `Opening`").
//!
//! Distinct from [`crate::registry::ClientRegistry`] (C6): that's the
//! durable `lastAckLSN` ledger, keyed by `clientId` and surviving restarts;
//! this is purely in-memory bookkeeping for the currently connected socket,
//! scoped to this process and gone the moment it ends.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::CloseCode;

struct ActiveSession {
    session_id: Uuid,
    cancel: CancellationToken,
    close_reason: Arc<Mutex<Option<CloseCode>>>,
}

#[derive(Default)]
pub struct ActiveSessions {
    by_client: DashMap<Uuid, ActiveSession>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session_id` as the active session for `client_id`. If a
    /// different session was already registered for this client, it is
    /// force-closed with [`CloseCode::Superseded`] first.
    pub fn take_over(
        &self,
        client_id: Uuid,
        session_id: Uuid,
        cancel: CancellationToken,
        close_reason: Arc<Mutex<Option<CloseCode>>>,
    ) {
        if let Some((_, previous)) = self.by_client.remove(&client_id) {
            *previous.close_reason.lock() = Some(CloseCode::Superseded);
            previous.cancel.cancel();
        }

        self.by_client.insert(
            client_id,
            ActiveSession {
                session_id,
                cancel,
                close_reason,
            },
        );
    }

    /// Removes the tracked session for `client_id`, but only if it is still
    /// `session_id` -- a session that was itself superseded must not clobber
    /// whatever newer session has since taken its place.
    pub fn remove_if_current(&self, client_id: Uuid, session_id: Uuid) {
        self.by_client
            .remove_if(&client_id, |_, active| active.session_id == session_id);
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn close_cell() -> Arc<Mutex<Option<CloseCode>>> {
        Arc::new(Mutex::new(None))
    }

    #[test]
    fn first_connection_registers_cleanly() {
        let sessions = ActiveSessions::new();
        let client_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        sessions.take_over(client_id, Uuid::new_v4(), cancel.clone(), close_cell());
        assert_eq!(sessions.len(), 1);
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn reconnect_supersedes_prior_session() {
        let sessions = ActiveSessions::new();
        let client_id = Uuid::new_v4();

        let first_cancel = CancellationToken::new();
        let first_close = close_cell();
        sessions.take_over(client_id, Uuid::new_v4(), first_cancel.clone(), first_close.clone());

        let second_cancel = CancellationToken::new();
        sessions.take_over(client_id, Uuid::new_v4(), second_cancel.clone(), close_cell());

        assert!(first_cancel.is_cancelled());
        assert_eq!(*first_close.lock(), Some(CloseCode::Superseded));
        assert!(!second_cancel.is_cancelled());
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn removing_a_superseded_session_does_not_evict_the_new_one() {
        let sessions = ActiveSessions::new();
        let client_id = Uuid::new_v4();

        let old_session_id = Uuid::new_v4();
        sessions.take_over(client_id, old_session_id, CancellationToken::new(), close_cell());

        let new_session_id = Uuid::new_v4();
        sessions.take_over(client_id, new_session_id, CancellationToken::new(), close_cell());

        // The old session's cleanup path runs after it's already been superseded.
        sessions.remove_if_current(client_id, old_session_id);
        assert_eq!(sessions.len(), 1);

        sessions.remove_if_current(client_id, new_session_id);
        assert!(sessions.is_empty());
    }
}
