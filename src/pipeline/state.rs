//! Controller state machine

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{trace, warn};

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// A startup step failed; shutdown of the completed steps is pending
    Failed,
}

impl PipelineState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: PipelineState) -> bool {
        use PipelineState::*;

        matches!(
            (self, target),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Failed, Stopping)
                | (Stopping, Idle)
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Starting => "Starting",
            PipelineState::Running => "Running",
            PipelineState::Stopping => "Stopping",
            PipelineState::Failed => "Failed",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, PipelineState::Idle)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Published controller state, readable from any thread without locking
#[derive(Debug, Clone)]
pub struct StateCell {
    inner: Arc<ArcSwap<PipelineState>>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(PipelineState::Idle)),
        }
    }
}

impl StateCell {
    pub fn get(&self) -> PipelineState {
        **self.inner.load()
    }

    /// Move to `target`. Invalid transitions are logged, not rejected.
    pub(crate) fn set(&self, target: PipelineState) {
        let current = self.get();
        if !current.can_transition_to(target) {
            warn!(%current, %target, "Unexpected pipeline state transition");
        }
        trace!(%current, %target, "Pipeline state");
        self.inner.store(Arc::new(target));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_cycle_is_valid() {
        use PipelineState::*;
        let path = [Idle, Starting, Running, Stopping, Idle];
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
    }

    #[test]
    fn failure_cycle_is_valid() {
        use PipelineState::*;
        let path = [Idle, Starting, Failed, Stopping, Idle];
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
    }

    #[test]
    fn cannot_skip_startup() {
        assert!(!PipelineState::Idle.can_transition_to(PipelineState::Running));
        assert!(!PipelineState::Running.can_transition_to(PipelineState::Idle));
    }

    #[test]
    fn cell_is_shared() {
        let cell = StateCell::default();
        let observer = cell.clone();
        cell.set(PipelineState::Starting);
        assert_eq!(observer.get(), PipelineState::Starting);
    }
}
