use serde::{Deserialize, Serialize};

/// Per-engine election state. Never shared across processes except through
/// the coordination backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionState {
    /// Constructed but not started.
    Idle,
    /// Trying to create the election key or watching it for deletion.
    Campaigning,
    /// Holding the election key and renewing its lease.
    Leader,
    /// Leadership was lost; re-campaign is pending.
    Demoted,
    /// Stopped for good; no further transitions.
    Stopped,
}

impl ElectionState {
    /// Returns stable state value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Campaigning => "campaigning",
            Self::Leader => "leader",
            Self::Demoted => "demoted",
            Self::Stopped => "stopped",
        }
    }
}

/// Leadership transition emitted by the election engine.
///
/// Every `Elected` is followed by exactly one `Lost` carrying the same term
/// before the next `Elected` is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeadershipEvent {
    /// This instance won the election key.
    Elected {
        /// Local leadership term number.
        term: u64,
    },
    /// This instance no longer holds the election key.
    Lost {
        /// Term that ended.
        term: u64,
    },
}

impl LeadershipEvent {
    /// Returns the term this event belongs to.
    #[must_use]
    pub fn term(self) -> u64 {
        match self {
            Self::Elected { term } | Self::Lost { term } => term,
        }
    }

    /// Returns the leadership flag carried by the event.
    #[must_use]
    pub fn is_leader(self) -> bool {
        matches!(self, Self::Elected { .. })
    }
}
