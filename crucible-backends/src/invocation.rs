//! Per-invocation state machine shared by all backends.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;

/// States an invocation moves through inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    /// Spec accepted, sandbox not yet prepared.
    Created,
    /// Sandbox resources are being allocated.
    Starting,
    /// The sandboxed program is running.
    Running,
    /// The program completed; an [`crucible_primitives::ExecutionResult`]
    /// was produced.
    Succeeded,
    /// The program or the sandbox failed.
    Failed,
    /// The deadline fired and the sandbox was torn down.
    TimedOut,
    /// The caller cancelled the invocation.
    Cancelled,
}

impl InvocationState {
    /// Returns `true` once the invocation reached a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

/// Events that drive invocation transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationEvent {
    /// Begin allocating sandbox resources.
    Start,
    /// The sandboxed program began executing.
    Launch,
    /// The program completed normally.
    Succeed,
    /// The program or sandbox failed.
    Fail,
    /// The deadline expired.
    Expire,
    /// The caller cancelled. Final; terminal states are unaffected.
    Cancel,
}

/// Tracks one invocation's state and elapsed wall time.
#[derive(Debug, Clone, Copy)]
pub struct Invocation {
    state: InvocationState,
    created: Instant,
    finished: Option<Instant>,
}

impl Invocation {
    /// Starts tracking a freshly accepted invocation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: InvocationState::Created,
            created: Instant::now(),
            finished: None,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> InvocationState {
        self.state
    }

    /// Elapsed wall time: up to now while in flight, frozen at the terminal
    /// transition afterwards.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        match self.finished {
            Some(at) => at.duration_since(self.created),
            None => self.created.elapsed(),
        }
    }

    /// Applies an event, returning the resulting state.
    ///
    /// Cancellation is sticky: cancelling an already-terminal invocation is
    /// a no-op rather than an error, since the signal races completion.
    ///
    /// # Errors
    ///
    /// Returns [`InvocationError::InvalidTransition`] when the event is not
    /// allowed from the current state.
    pub fn transition(&mut self, event: InvocationEvent) -> Result<InvocationState, InvocationError> {
        use InvocationEvent as E;
        use InvocationState as S;

        let next = match (self.state, event) {
            (S::Created, E::Start) => Some(S::Starting),
            (S::Starting, E::Launch) => Some(S::Running),
            (S::Running, E::Succeed) => Some(S::Succeeded),
            (S::Created | S::Starting | S::Running, E::Fail) => Some(S::Failed),
            (S::Starting | S::Running, E::Expire) => Some(S::TimedOut),
            (state, E::Cancel) if state.is_terminal() => Some(state),
            (_, E::Cancel) => Some(S::Cancelled),
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(InvocationError::InvalidTransition {
                from: self.state,
                event,
            });
        };

        if next_state != self.state {
            trace!(?self.state, ?next_state, ?event, "invocation transition");
            self.state = next_state;
            if next_state.is_terminal() {
                self.finished = Some(Instant::now());
            }
        }

        Ok(self.state)
    }
}

impl Default for Invocation {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors emitted by the invocation tracker.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// Transition was not permitted from the current state.
    #[error("invalid invocation transition from {from:?} via {event:?}")]
    InvalidTransition {
        /// State prior to the attempted transition.
        from: InvocationState,
        /// Event that triggered the failure.
        event: InvocationEvent,
    },
}
