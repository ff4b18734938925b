//! Phase state machine.
//!
//! `Idle -> Configuring -> Executing -> CleaningUp -> Idle`. A failure while
//! configuring goes straight to `CleaningUp`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Coarse phase of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseState {
    /// No block is running.
    Idle,
    /// Preparing the instrument before the first step.
    Configuring,
    /// Running steps.
    Executing,
    /// Returning the instrument to a safe state.
    CleaningUp,
}

impl PhaseState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: PhaseState) -> bool {
        use PhaseState::*;
        matches!(
            (self, next),
            (Idle, Configuring)
                | (Configuring, Executing)
                | (Configuring, CleaningUp)
                | (Executing, CleaningUp)
                | (CleaningUp, Idle)
        )
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PhaseState::Idle => "Idle",
            PhaseState::Configuring => "Configuring",
            PhaseState::Executing => "Executing",
            PhaseState::CleaningUp => "CleaningUp",
        };
        f.write_str(name)
    }
}

/// Observable current phase, with the sequence of phases visited.
#[derive(Clone)]
pub struct PhaseTracker {
    sender: watch::Sender<PhaseState>,
    history: Arc<Mutex<Vec<PhaseState>>>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    /// Tracker starting in `Idle`.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(PhaseState::Idle);
        Self {
            sender,
            history: Arc::new(Mutex::new(vec![PhaseState::Idle])),
        }
    }

    /// Current phase.
    pub fn get(&self) -> PhaseState {
        *self.sender.borrow()
    }

    /// Receiver notified on every transition.
    pub fn subscribe(&self) -> watch::Receiver<PhaseState> {
        self.sender.subscribe()
    }

    /// Every state entered since creation, starting with `Idle`.
    pub fn history(&self) -> Vec<PhaseState> {
        self.history.lock().clone()
    }

    pub(crate) fn transition(&self, next: PhaseState) {
        let current = self.get();
        debug_assert!(
            current.can_transition_to(next),
            "illegal phase transition {current} -> {next}"
        );
        debug!(from = %current, to = %next, "Phase transition");
        self.history.lock().push(next);
        self.sender.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert!(PhaseState::Idle.can_transition_to(PhaseState::Configuring));
        assert!(PhaseState::Configuring.can_transition_to(PhaseState::CleaningUp));
        assert!(!PhaseState::Idle.can_transition_to(PhaseState::Executing));
        assert!(!PhaseState::CleaningUp.can_transition_to(PhaseState::Executing));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let tracker = PhaseTracker::new();
        let mut rx = tracker.subscribe();

        tracker.transition(PhaseState::Configuring);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), PhaseState::Configuring);

        tracker.transition(PhaseState::CleaningUp);
        tracker.transition(PhaseState::Idle);
        assert_eq!(
            tracker.history(),
            vec![
                PhaseState::Idle,
                PhaseState::Configuring,
                PhaseState::CleaningUp,
                PhaseState::Idle
            ]
        );
    }
}
