//! Stub load state machine
//!
//! ```text
//! New ──▶ Loading ──▶ Replaying ──▶ Active ──▶ Closed
//!  │         │                        ▲
//!  │         └────────────────────────┤
//!  └──────────────────────────────────┘
//!  any non-terminal state ──(fatal load/replay error)──▶ Closed
//! ```
//!
//! Only `Active` dispatches. `New`, `Loading` and `Replaying` defer arrivals
//! to the stub's pending list; `Closed` rejects them.

use serde::{Deserialize, Serialize};

/// Load state of one stub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadState {
    /// Created, nothing started
    New,
    /// `on_load` outstanding
    Loading,
    /// Journal replay outstanding
    Replaying,
    /// Ready for dispatch
    Active,
    /// Shut down or failed to load
    Closed,
}

impl LoadState {
    /// Check if the transition is legal
    pub fn can_transition_to(&self, next: LoadState) -> bool {
        use LoadState::*;
        matches!(
            (self, next),
            (New, Loading)
                | (New, Replaying)
                | (New, Active)
                | (Loading, Replaying)
                | (Loading, Active)
                | (Replaying, Active)
                | (New | Loading | Replaying | Active, Closed)
        )
    }

    /// Messages arriving in this state are dispatched immediately
    pub fn accepts_dispatch(&self) -> bool {
        matches!(self, LoadState::Active)
    }

    /// Messages arriving in this state wait on the pending list
    pub fn defers(&self) -> bool {
        matches!(self, LoadState::New | LoadState::Loading | LoadState::Replaying)
    }

    /// A load or replay is outstanding
    pub fn is_loading(&self) -> bool {
        matches!(self, LoadState::Loading | LoadState::Replaying)
    }

    /// No transition leaves this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadState::Closed)
    }
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoadState::New => "new",
            LoadState::Loading => "loading",
            LoadState::Replaying => "replaying",
            LoadState::Active => "active",
            LoadState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How a stub is shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShutdownMode {
    /// Run a final checkpoint, then close
    #[default]
    Graceful,
    /// Close immediately
    Forced,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        assert!(LoadState::New.can_transition_to(LoadState::Loading));
        assert!(LoadState::New.can_transition_to(LoadState::Active));
        assert!(LoadState::Loading.can_transition_to(LoadState::Replaying));
        assert!(LoadState::Replaying.can_transition_to(LoadState::Active));
        assert!(LoadState::Active.can_transition_to(LoadState::Closed));
    }

    #[test]
    fn test_no_backward_transitions() {
        assert!(!LoadState::Active.can_transition_to(LoadState::Loading));
        assert!(!LoadState::Replaying.can_transition_to(LoadState::Loading));
        assert!(!LoadState::Closed.can_transition_to(LoadState::Active));
        assert!(!LoadState::Closed.can_transition_to(LoadState::Closed));
    }

    #[test]
    fn test_routing_predicates() {
        assert!(LoadState::Active.accepts_dispatch());
        assert!(!LoadState::Loading.accepts_dispatch());
        assert!(LoadState::New.defers());
        assert!(LoadState::Replaying.defers());
        assert!(!LoadState::Closed.defers());
        assert!(LoadState::Closed.is_terminal());
    }
}
