//! Session phase state machine.
//!
//! ```text
//!            start            end
//!   Idle ────────────► Running ─────► Ended
//!    ▲                   │              │
//!    └──── reset ────────┴──── reset ───┘
//! ```
//!
//! There is no `Ended → Running` edge; a finished session must be reset first.
//! `initialize` seeds an empty backend and is only accepted while `Idle`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionPhase {
    #[default]
    Idle,
    Running,
    Ended,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Ended => write!(f, "Ended"),
        }
    }
}

/// Session controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseAction {
    Initialize,
    Start,
    End,
    Reset,
}

impl std::fmt::Display for PhaseAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialize => write!(f, "initialize"),
            Self::Start => write!(f, "start"),
            Self::End => write!(f, "end"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

impl SessionPhase {
    /// Phase reached by applying `action`, or the refused edge.
    pub fn after(self, action: PhaseAction) -> Result<SessionPhase, InvalidTransition> {
        match (self, action) {
            (SessionPhase::Idle, PhaseAction::Initialize) => Ok(SessionPhase::Idle),
            (SessionPhase::Idle, PhaseAction::Start) => Ok(SessionPhase::Running),
            (SessionPhase::Running, PhaseAction::End) => Ok(SessionPhase::Ended),
            (_, PhaseAction::Reset) => Ok(SessionPhase::Idle),
            (from, action) => Err(InvalidTransition { from, action }),
        }
    }
}

/// A control action that is not an edge of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SessionPhase,
    pub action: PhaseAction,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot {} a session that is {}", self.action, self.from)
    }
}

impl std::error::Error for InvalidTransition {}
