//! Negotiation status and its transition table.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use haggle_core::DomainError;

/// Negotiation lifecycle status.
///
/// ```text
/// Open ──┬─> Countered ─┬─> Countered (loop)
///        │              ├─> Accepted | Rejected | Cancelled | Expired
///        └──────────────┴─> Accepted | Rejected | Cancelled | Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationStatus {
    Open,
    Countered,
    Accepted,
    Rejected,
    Cancelled,
    Expired,
}

impl NegotiationStatus {
    pub const ALL: [NegotiationStatus; 6] = [
        NegotiationStatus::Open,
        NegotiationStatus::Countered,
        NegotiationStatus::Accepted,
        NegotiationStatus::Rejected,
        NegotiationStatus::Cancelled,
        NegotiationStatus::Expired,
    ];

    /// Terminal statuses have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NegotiationStatus::Accepted
                | NegotiationStatus::Rejected
                | NegotiationStatus::Cancelled
                | NegotiationStatus::Expired
        )
    }

    /// Active negotiations can still be countered, concluded or reaped.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// The transition table. `Open` is only ever an initial state.
    pub fn can_transition_to(self, next: NegotiationStatus) -> bool {
        use NegotiationStatus::*;
        matches!(
            (self, next),
            (
                Open | Countered,
                Countered | Accepted | Rejected | Cancelled | Expired
            )
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationStatus::Open => "open",
            NegotiationStatus::Countered => "countered",
            NegotiationStatus::Accepted => "accepted",
            NegotiationStatus::Rejected => "rejected",
            NegotiationStatus::Cancelled => "cancelled",
            NegotiationStatus::Expired => "expired",
        }
    }
}

impl core::fmt::Display for NegotiationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NegotiationStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NegotiationStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::invalid_argument(format!("unknown negotiation status '{s}'")))
    }
}
