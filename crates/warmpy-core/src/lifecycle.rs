//! Worker lifecycle state machine.
//!
//! ```text
//!              ┌──────────┐  handshake ok   ┌───────┐  dispatch  ┌───────────┐
//!   new ──────▶│ Starting │────────────────▶│ Ready │───────────▶│ Executing │
//!              └────┬─────┘                 └──┬─▲──┘◀───────────└─────┬─────┘
//!                   │ handshake failed         │ │     response        │ timeout /
//!                   ▼                 budget / │ │ handshake ok        │ protocol error
//!              ┌────────┐   failed   ┌─────────▼─┴┐                    │
//!              │  Dead  │◀───────────│ Restarting │◀───────────────────┘
//!              └───┬────┘            └────────────┘
//!                  │ revive
//!                  └──────────▶ Starting
//! ```
//!
//! `shutdown` moves `Ready` straight to `Dead`.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of an executor's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No worker yet, or the first worker is being started.
    Starting,
    /// A worker has completed its handshake and is idle.
    Ready,
    /// A request has been dispatched and its response is pending.
    Executing,
    /// The worker is being replaced.
    Restarting,
    /// A worker failed its handshake, or the executor was shut down.
    /// Calls fail until revived.
    Dead,
}

impl WorkerState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Starting, Ready)
                | (Starting, Dead)
                | (Ready, Executing)
                | (Ready, Restarting)
                | (Ready, Dead)
                | (Executing, Ready)
                | (Executing, Restarting)
                | (Restarting, Ready)
                | (Restarting, Dead)
                | (Dead, Starting)
        )
    }

    /// Whether the executor can accept calls in this state.
    pub fn is_available(self) -> bool {
        self != WorkerState::Dead
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Executing => "executing",
            WorkerState::Restarting => "restarting",
            WorkerState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Current lifecycle state plus the reason the executor died, if it did.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: WorkerState,
    dead_reason: Option<String>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: WorkerState::Starting,
            dead_reason: None,
        }
    }
}

impl Lifecycle {
    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Why the executor entered `Dead`.
    pub fn dead_reason(&self) -> Option<&str> {
        self.dead_reason.as_deref()
    }

    /// Move to `next`.
    ///
    /// Transitions are driven only by the executor, so an illegal one is a
    /// bug; it is logged and applied anyway so the executor never wedges.
    pub fn advance(&mut self, next: WorkerState) {
        if !self.state.can_transition_to(next) {
            tracing::error!(from = %self.state, to = %next, "Illegal worker state transition");
            debug_assert!(false, "illegal transition {} -> {}", self.state, next);
        }
        tracing::trace!(from = %self.state, to = %next, "Worker state transition");
        if next != WorkerState::Dead {
            self.dead_reason = None;
        }
        self.state = next;
    }

    /// Move to `Dead`, remembering why.
    pub fn kill(&mut self, reason: impl Into<String>) {
        self.advance(WorkerState::Dead);
        self.dead_reason = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerState::*;

    const ALL: [WorkerState; 5] = [Starting, Ready, Executing, Restarting, Dead];

    #[test]
    fn test_transition_table() {
        let legal = [
            (Starting, Ready),
            (Starting, Dead),
            (Ready, Executing),
            (Ready, Restarting),
            (Ready, Dead),
            (Executing, Ready),
            (Executing, Restarting),
            (Restarting, Ready),
            (Restarting, Dead),
            (Dead, Starting),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_dead_is_only_left_by_revive() {
        for to in ALL {
            if to != Starting {
                assert!(!Dead.can_transition_to(to));
            }
        }
        assert!(!Dead.is_available());
        assert!(Restarting.is_available());
    }

    #[test]
    fn test_lifecycle_tracks_dead_reason() {
        let mut lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.state(), Starting);

        lifecycle.kill("no READY within 10s");
        assert_eq!(lifecycle.state(), Dead);
        assert_eq!(lifecycle.dead_reason(), Some("no READY within 10s"));

        lifecycle.advance(Starting);
        assert_eq!(lifecycle.dead_reason(), None);
        lifecycle.advance(Ready);
        assert_eq!(lifecycle.state(), Ready);
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Restarting).unwrap(), "\"restarting\"");
        assert_eq!(Executing.to_string(), "executing");
    }
}
