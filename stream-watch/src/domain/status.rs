//! Target lifecycle states.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Stream target lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamStatus {
    /// No reader session is open. Initial state, and the state a target is
    /// left in before it is removed.
    #[default]
    Stopped,
    /// A reader session is open and the target is being read.
    Running,
    /// The last start or read failed; a retry deadline is armed.
    Waiting,
    /// Query sentinel for a target that is not registered. Never stored.
    NotFound,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Running => "Running",
            Self::Waiting => "Waiting",
            Self::NotFound => "NotFound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Stopped" => Some(Self::Stopped),
            "Running" => Some(Self::Running),
            "Waiting" => Some(Self::Waiting),
            "NotFound" => Some(Self::NotFound),
            _ => None,
        }
    }

    /// Whether the target is being supervised (running or backing off).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Waiting)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: StreamStatus) -> bool {
        use StreamStatus::*;

        match (self, target) {
            // NotFound only ever describes an absent target
            (NotFound, _) | (_, NotFound) => false,

            (from, to) if *from == to => true,

            // start succeeded / start failed
            (Stopped, Running | Waiting) => true,

            // MaxFails reached / stop
            (Running, Waiting | Stopped) => true,

            // backoff elapsed and restart succeeded / stop
            (Waiting, Running | Stopped) => true,

            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: StreamStatus) -> Result<StreamStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::validation(format!(
                "cannot transition from {} to {}",
                self, target
            )))
        }
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
