//! Agent status state machine.
//!
//! ```text
//! starting ──► working ──► completed
//!    │            │    └──► failed
//!    │            └──► stopped
//!    ├──► failed
//!    └──► stopped
//! ```
//!
//! `interrupted` never appears as a live transition; it is assigned only when
//! a persisted non-terminal record is loaded after a restart.

use super::types::AgentStatus;

impl AgentStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Interrupted
        )
    }

    /// Whether a live transition from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::{Completed, Failed, Starting, Stopped, Working};
        // A worker may emit its terminal result before anything else, so
        // `starting` can skip straight to a terminal state.
        matches!(
            (self, next),
            (Starting, Working) | (Starting | Working, Completed | Failed | Stopped)
        )
    }

    /// Status to assign when a persisted record is loaded at startup.
    pub fn on_restart(self) -> AgentStatus {
        if self.is_terminal() {
            self
        } else {
            AgentStatus::Interrupted
        }
    }
}
