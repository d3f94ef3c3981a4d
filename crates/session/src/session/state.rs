//! Session lifecycle state machine.
//!
//! ```text
//! Idle ─▶ Dialing ─▶ PtyRequested ─▶ ShellRunning ─▶ Closing ─▶ Closed
//!   │        │             │               │
//!   └────────┴─────────────┴───────────────┴──▶ Failed
//! ```
//!
//! Every state is entered at most once per session.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Lifecycle state of a [`TerminalSession`](super::TerminalSession).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, nothing acquired yet.
    Idle,
    /// Dialing the transport and opening the channel.
    Dialing,
    /// Pseudo-terminal allocated on the remote side.
    PtyRequested,
    /// Remote shell started; pumps and listeners are live.
    ShellRunning,
    /// Teardown in progress.
    Closing,
    /// Everything released.
    Closed,
    /// Connect failed; whatever was acquired has been released.
    Failed,
}

impl SessionState {
    /// Returns true once the session can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Returns true if moving from `self` to `next` is a legal step.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Idle, Dialing)
            | (Dialing, PtyRequested)
            | (PtyRequested, ShellRunning)
            | (ShellRunning, Closing)
            | (Closing, Closed)
            | (Idle, Closed) => true,
            (from, Failed) => !from.is_terminal() && from != Closing,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Dialing => "dialing",
            SessionState::PtyRequested => "pty-requested",
            SessionState::ShellRunning => "shell-running",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Shared, checked holder of the current state.
#[derive(Debug)]
pub(crate) struct StateCell {
    state: Mutex<SessionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.lock()
    }

    /// Moves to `next` if the step is legal; otherwise returns the current state.
    pub(crate) fn transition(&self, next: SessionState) -> Result<(), SessionState> {
        let mut state = self.lock();
        if !state.can_transition_to(next) {
            return Err(*state);
        }

        tracing::debug!(from = %*state, to = %next, "Session state change");
        *state = next;
        Ok(())
    }

    /// Claims the right to tear down. Only the first caller wins; it gets
    /// the state teardown started from.
    pub(crate) fn begin_close(&self) -> Option<SessionState> {
        let mut state = self.lock();
        let from = *state;
        let next = match from {
            SessionState::Idle => SessionState::Closed,
            SessionState::Closing | SessionState::Closed | SessionState::Failed => return None,
            _ => SessionState::Closing,
        };

        tracing::debug!(from = %from, to = %next, "Session teardown claimed");
        *state = next;
        Some(from)
    }

    /// Forces the final state at the end of teardown or a failed connect.
    pub(crate) fn finish(&self, last: SessionState) {
        let mut state = self.lock();
        tracing::debug!(from = %*state, to = %last, "Session state change");
        *state = last;
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::Idle);
        assert!(cell.transition(SessionState::Dialing).is_ok());
        assert!(cell.transition(SessionState::PtyRequested).is_ok());
        assert!(cell.transition(SessionState::ShellRunning).is_ok());
        assert_eq!(cell.begin_close(), Some(SessionState::ShellRunning));
        assert_eq!(cell.get(), SessionState::Closing);
    }

    #[test]
    fn test_no_state_is_entered_twice() {
        let cell = StateCell::new();
        cell.transition(SessionState::Dialing).unwrap();
        assert_eq!(
            cell.transition(SessionState::Dialing),
            Err(SessionState::Dialing)
        );
        assert_eq!(
            cell.transition(SessionState::ShellRunning),
            Err(SessionState::Dialing)
        );
    }

    #[test]
    fn test_failed_is_reachable_from_non_terminal_states() {
        for from in [
            SessionState::Idle,
            SessionState::Dialing,
            SessionState::PtyRequested,
            SessionState::ShellRunning,
        ] {
            assert!(from.can_transition_to(SessionState::Failed), "{from}");
        }
        assert!(!SessionState::Closed.can_transition_to(SessionState::Failed));
        assert!(!SessionState::Failed.can_transition_to(SessionState::Failed));
    }

    #[test]
    fn test_begin_close_only_once() {
        let cell = StateCell::new();
        cell.transition(SessionState::Dialing).unwrap();
        assert_eq!(cell.begin_close(), Some(SessionState::Dialing));
        assert_eq!(cell.begin_close(), None);

        cell.finish(SessionState::Closed);
        assert_eq!(cell.begin_close(), None);
    }

    #[test]
    fn test_begin_close_from_idle_goes_straight_to_closed() {
        let cell = StateCell::new();
        assert_eq!(cell.begin_close(), Some(SessionState::Idle));
        assert_eq!(cell.get(), SessionState::Closed);
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionState::ShellRunning.to_string(), "shell-running");
        assert_eq!(SessionState::PtyRequested.to_string(), "pty-requested");
    }
}
