//! Processing state machine over the two transport-held marker facets.

use serde::{Deserialize, Serialize};

/// The two independent marker bits a transport keeps per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkerState {
    /// True until the message has been processed successfully.
    pub unread: bool,
    /// True while an engine holds the message.
    pub claimed: bool,
}

impl MarkerState {
    /// Fresh inbound message.
    pub const PENDING: Self = Self {
        unread: true,
        claimed: false,
    };
    pub const CLAIMED: Self = Self {
        unread: true,
        claimed: true,
    };
    pub const DONE: Self = Self {
        unread: false,
        claimed: false,
    };

    pub fn state(&self) -> ProcessingState {
        ProcessingState::from(*self)
    }
}

/// Processing state of a message, derived purely from its markers.
///
/// A failed message returns to `Pending`: retry needs no extra bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    /// Eligible for claiming (new or previously failed).
    Pending,
    /// Held by exactly one engine.
    Claimed,
    /// Processed successfully. Never revisited.
    Done,
}

impl ProcessingState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ProcessingState) -> bool {
        use ProcessingState::*;

        matches!(
            (self, target),
            // Claim on list, or operator marks it handled
            (Pending, Claimed) | (Pending, Done) |
            // Commit outcome
            (Claimed, Done) | (Claimed, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Whether `list_claimable` may return a message in this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Marker bits that encode this state.
    pub fn markers(&self) -> MarkerState {
        match self {
            Self::Pending => MarkerState::PENDING,
            Self::Claimed => MarkerState::CLAIMED,
            Self::Done => MarkerState::DONE,
        }
    }
}

impl From<MarkerState> for ProcessingState {
    fn from(markers: MarkerState) -> Self {
        match (markers.unread, markers.claimed) {
            (true, false) => Self::Pending,
            (true, true) => Self::Claimed,
            // A read message with a leftover claim is a success commit that was
            // interrupted between its two writes; it is never listed again.
            (false, _) => Self::Done,
        }
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}
