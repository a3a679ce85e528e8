//! Per-session state machine shared by the relay and the agent

use std::fmt;
use tokio::sync::watch;
use tracing::trace;

/// Where a host session is in its life
///
/// `Connecting → Registered → AwaitingTarget → Matched → Relaying → Closed`. Any state may
/// jump straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    AwaitingTarget,
    Matched,
    Relaying,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Connecting, Registered)
                | (Registered, AwaitingTarget)
                | (AwaitingTarget, Matched)
                | (Matched, Relaying)
                | (_, Closed)
        ) && self != Closed
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Registered => "registered",
            SessionState::AwaitingTarget => "awaiting-target",
            SessionState::Matched => "matched",
            SessionState::Relaying => "relaying",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Observable holder of a [`SessionState`]
///
/// Invalid transitions are refused and leave the state untouched.
#[derive(Debug)]
pub struct SessionStateCell {
    tx: watch::Sender<SessionState>,
}

impl SessionStateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Connecting);
        Self { tx }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Move to `next`; returns false if the transition is not allowed
    pub fn advance(&self, next: SessionState) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                trace!(from = %state, to = %next, "Session state");
                *state = next;
                applied = true;
            }
            applied
        });
        applied
    }

    /// Start a new session cycle back at `Connecting`
    pub fn reset(&self) {
        self.tx.send_replace(SessionState::Connecting);
    }

    pub fn close(&self) {
        self.advance(SessionState::Closed);
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let cell = SessionStateCell::new();
        assert!(cell.advance(SessionState::Registered));
        assert!(cell.advance(SessionState::AwaitingTarget));
        assert!(cell.advance(SessionState::Matched));
        assert!(cell.advance(SessionState::Relaying));
        assert!(cell.advance(SessionState::Closed));
        assert!(cell.get().is_terminal());
    }

    #[test]
    fn test_skipping_states_is_refused() {
        let cell = SessionStateCell::new();
        assert!(!cell.advance(SessionState::Relaying));
        assert_eq!(cell.get(), SessionState::Connecting);
    }

    #[test]
    fn test_closed_is_terminal() {
        let cell = SessionStateCell::new();
        cell.close();
        assert!(!cell.advance(SessionState::Registered));
        assert!(!cell.advance(SessionState::Closed));

        cell.reset();
        assert_eq!(cell.get(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let cell = SessionStateCell::new();
        let mut rx = cell.subscribe();

        cell.advance(SessionState::Registered);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Registered);
    }
}
