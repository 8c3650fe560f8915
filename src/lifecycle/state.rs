//! Orchestrator state machine.

use std::fmt;

/// Lifecycle of one orchestrated run.
///
/// ```text
/// Idle -> TunnelOpening -> TunnelOpen -> PoolOpening -> Ready -> Working -> Closing -> Closed
///            |                              |                      |
///            +------------> Failed <--------+----------------------+
/// ```
///
/// `Closing` is reachable from every state once cleanup starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    TunnelOpening,
    TunnelOpen,
    PoolOpening,
    Ready,
    Working,
    Failed,
    Closing,
    Closed,
}

impl LifecycleState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, next) {
            (Closed, _) => false,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Closing) => true,
            (TunnelOpening | PoolOpening | Working, Failed) => true,
            (Idle, TunnelOpening)
            | (TunnelOpening, TunnelOpen)
            | (TunnelOpen, PoolOpening)
            | (PoolOpening, Ready)
            | (Ready, Working) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Closed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::TunnelOpening => "tunnel-opening",
            LifecycleState::TunnelOpen => "tunnel-open",
            LifecycleState::PoolOpening => "pool-opening",
            LifecycleState::Ready => "ready",
            LifecycleState::Working => "working",
            LifecycleState::Failed => "failed",
            LifecycleState::Closing => "closing",
            LifecycleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Current state plus every state visited so far.
#[derive(Debug, Clone)]
pub struct StateLog {
    current: LifecycleState,
    history: Vec<LifecycleState>,
}

impl Default for StateLog {
    fn default() -> Self {
        Self {
            current: LifecycleState::Idle,
            history: vec![LifecycleState::Idle],
        }
    }
}

impl StateLog {
    pub fn current(&self) -> LifecycleState {
        self.current
    }

    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    /// Advance to `next`. Illegal transitions are ignored and reported.
    pub fn advance(&mut self, next: LifecycleState) -> bool {
        if !self.current.can_transition_to(next) {
            tracing::debug!("Ignoring lifecycle transition {} -> {}", self.current, next);
            return false;
        }
        tracing::debug!("Lifecycle {} -> {}", self.current, next);
        self.current = next;
        self.history.push(next);
        true
    }
}
