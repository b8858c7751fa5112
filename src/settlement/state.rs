//! Settlement FSM State Definitions
//!
//! State IDs are stored in PostgreSQL as SMALLINT.
//!
//! ```text
//! PENDING ──fee──▶ READY ──credited──▶ COMPLETED
//!                    │
//!                    └────rejected───▶ FAILED
//! ```
//!
//! Every mutation goes through [`SettlementStatus::transition_to`]; call sites
//! never compare statuses by hand.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Settlement FSM States
///
/// Terminal states: COMPLETED (30), FAILED (-10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum SettlementStatus {
    /// Recorded by intake, fee not computed yet
    Pending = 0,

    /// Fee and net amount persisted, waiting for the wallet credit
    Ready = 10,

    /// Terminal: wallet credited
    Completed = 30,

    /// Terminal: wallet rejected the credit
    Failed = -10,
}

/// Verdict of the transition table for a requested status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Legal edge: perform the compare-and-swap
    Apply,
    /// Already in (or past) the requested state: idempotent no-op
    AlreadyApplied,
    /// Would move one terminal state to another (or backwards): ignore and warn
    Conflict,
    /// Requested state is not reachable yet (e.g. outcome before READY)
    Premature,
}

impl SettlementStatus {
    pub const ALL: [SettlementStatus; 4] = [
        SettlementStatus::Pending,
        SettlementStatus::Ready,
        SettlementStatus::Completed,
        SettlementStatus::Failed,
    ];

    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SettlementStatus::Completed | SettlementStatus::Failed)
    }

    /// The state-transition table.
    ///
    /// Only `PENDING→READY` and `READY→{COMPLETED,FAILED}` are applied;
    /// everything else is classified so the caller can ack, warn or retry.
    pub fn transition_to(self, next: SettlementStatus) -> Transition {
        use SettlementStatus::*;

        match (self, next) {
            (Pending, Ready) | (Ready, Completed) | (Ready, Failed) => Transition::Apply,
            (current, requested) if current == requested => Transition::AlreadyApplied,
            // Fee step re-run after the settlement already moved on
            (Completed | Failed, Ready) => Transition::AlreadyApplied,
            (Pending, Completed | Failed) => Transition::Premature,
            // Terminal flips and anything moving back to PENDING
            _ => Transition::Conflict,
        }
    }

    /// Get the numeric state ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(SettlementStatus::Pending),
            10 => Some(SettlementStatus::Ready),
            30 => Some(SettlementStatus::Completed),
            -10 => Some(SettlementStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Ready => "READY",
            SettlementStatus::Completed => "COMPLETED",
            SettlementStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SettlementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettlementStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown settlement status: {}", s))
    }
}

impl TryFrom<i16> for SettlementStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        SettlementStatus::from_id(value).ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::SettlementStatus::*;
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Pending.is_terminal());
        assert!(!Ready.is_terminal());
    }

    #[test]
    fn test_legal_edges() {
        assert_eq!(Pending.transition_to(Ready), Transition::Apply);
        assert_eq!(Ready.transition_to(Completed), Transition::Apply);
        assert_eq!(Ready.transition_to(Failed), Transition::Apply);
    }

    #[test]
    fn test_duplicates_are_noops() {
        assert_eq!(Ready.transition_to(Ready), Transition::AlreadyApplied);
        assert_eq!(Completed.transition_to(Completed), Transition::AlreadyApplied);
        assert_eq!(Failed.transition_to(Failed), Transition::AlreadyApplied);
        assert_eq!(Completed.transition_to(Ready), Transition::AlreadyApplied);
        assert_eq!(Failed.transition_to(Ready), Transition::AlreadyApplied);
    }

    #[test]
    fn test_terminal_never_flips() {
        assert_eq!(Completed.transition_to(Failed), Transition::Conflict);
        assert_eq!(Failed.transition_to(Completed), Transition::Conflict);
        for state in SettlementStatus::ALL {
            if state.is_terminal() {
                for next in SettlementStatus::ALL {
                    assert_ne!(state.transition_to(next), Transition::Apply);
                }
            }
        }
    }

    #[test]
    fn test_outcome_before_ready_is_premature() {
        assert_eq!(Pending.transition_to(Completed), Transition::Premature);
        assert_eq!(Pending.transition_to(Failed), Transition::Premature);
    }

    #[test]
    fn test_state_id_roundtrip() {
        for state in SettlementStatus::ALL {
            assert_eq!(SettlementStatus::from_id(state.id()), Some(state));
            assert_eq!(state.as_str().parse::<SettlementStatus>(), Ok(state));
        }
        assert!(SettlementStatus::from_id(999).is_none());
    }
}
