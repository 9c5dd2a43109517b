//! Negotiation role and phase

use crate::error::NegotiationError;
use std::fmt;

/// Which side of the offer/answer exchange this peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Undetermined,
    Offerer,
    Answerer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Undetermined => "undetermined",
            Role::Offerer => "offerer",
            Role::Answerer => "answerer",
        }
    }

    /// Decide the role. Only `undetermined` may move, and only once.
    pub fn decide(self, next: Role) -> Result<Role, NegotiationError> {
        match (self, next) {
            (Role::Undetermined, Role::Offerer | Role::Answerer) => Ok(next),
            _ => Err(NegotiationError::InvalidTransition {
                machine: "role",
                from: self.as_str(),
                to: next.as_str(),
            }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection phase of a negotiation session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Failed => "failed",
            Phase::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closed)
    }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (*self, next),
            (Idle, Connecting)
                | (Idle, Failed)
                | (Idle, Closed)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Closed)
                | (Connected, Failed)
                | (Connected, Closed)
                | (Failed, Closed)
        )
    }

    pub fn transition(self, next: Phase) -> Result<Phase, NegotiationError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(NegotiationError::InvalidTransition {
                machine: "phase",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
