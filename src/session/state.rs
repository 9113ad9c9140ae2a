//! Session state machine (C9, spec.md §4.9):
//! `Opening -> AwaitingCatchup -> Catchup -> Live -> Closing -> Closed`.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Opening,
    AwaitingCatchup,
    Catchup,
    Live,
    Closing,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    /// Whether `self -> next` is an allowed edge. `Closing`/`Closed` are
    /// reachable from any state (a session can be torn down at any point).
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Closing) | (_, Closed) => true,
            (Closing, _) => false,
            (Closed, _) => false,
            (Opening, AwaitingCatchup) => true,
            (AwaitingCatchup, Catchup) => true,
            (Catchup, Live) => true,
            _ => false,
        }
    }
}

/// Owns the current state and rejects illegal transitions, rather than
/// letting callers mutate a bare enum field.
#[derive(Debug, Clone, Copy)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            state: SessionState::Opening,
        }
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use SessionState::*;

    #[test]
    fn happy_path_transitions_in_order() {
        let mut sm = SessionStateMachine::new();
        assert_eq!(sm.current(), Opening);
        sm.transition(AwaitingCatchup).unwrap();
        sm.transition(Catchup).unwrap();
        sm.transition(Live).unwrap();
        sm.transition(Closing).unwrap();
        sm.transition(Closed).unwrap();
        assert_eq!(sm.current(), Closed);
    }

    #[test]
    fn cannot_skip_catchup() {
        let mut sm = SessionStateMachine::new();
        sm.transition(AwaitingCatchup).unwrap();
        assert!(sm.transition(Live).is_err());
    }

    #[test]
    fn can_close_from_any_live_state() {
        let mut sm = SessionStateMachine::new();
        sm.transition(AwaitingCatchup).unwrap();
        sm.transition(Catchup).unwrap();
        assert!(sm.transition(Closing).is_ok());
    }

    #[test]
    fn closed_is_terminal() {
        let mut sm = SessionStateMachine::new();
        sm.transition(Closing).unwrap();
        sm.transition(Closed).unwrap();
        assert!(sm.transition(Opening).is_err());
    }
}
