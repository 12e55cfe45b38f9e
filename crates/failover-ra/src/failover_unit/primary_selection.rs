//! New-primary selection after GetLSN.
//!
//! Pure functions over the LSNs collected in phase 1. The caller removes
//! dropped replicas before calling.

use failover_types::{DeactivationInfo, Lsn, NodeId};

use crate::replica::LsnState;

/// One replica's phase 1 answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub node: NodeId,
    pub is_up: bool,
    pub lsn: LsnState,
    pub deactivation_info: DeactivationInfo,
    pub supports_deactivation_info: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionInput<'a> {
    pub candidates: &'a [Candidate],
    pub local: NodeId,
    pub is_failover: bool,
    /// Unknown LSNs are treated as zero instead of excluded.
    pub data_loss: bool,
}

/// Picks the new primary, or `None` when no replica is eligible.
///
/// Ties on the last LSN go to the first candidate in node order. For a
/// failover that picked the local replica, a tied replica that can catch up
/// more of the log (lower first LSN) is preferred.
pub fn select_primary(input: &SelectionInput<'_>) -> Option<NodeId> {
    let mut eligible: Vec<&Candidate> = input
        .candidates
        .iter()
        .filter(|c| {
            c.is_up
                && match c.lsn {
                    LsnState::Known { .. } => true,
                    LsnState::Unknown => input.data_loss,
                    LsnState::Unset => false,
                }
        })
        .collect();
    if eligible.is_empty() {
        return None;
    }

    if eligible.iter().all(|c| c.supports_deactivation_info) {
        if let Some(newest) = eligible.iter().map(|c| c.deactivation_info.epoch).max() {
            eligible.retain(|c| c.deactivation_info.epoch >= newest);
        }
    }

    let best_last = eligible.iter().map(|c| last_of(c)).max()?;
    let tied: Vec<&Candidate> = eligible
        .into_iter()
        .filter(|c| last_of(c) == best_last)
        .collect();
    let pick = tied.first()?;

    if input.is_failover && pick.node == input.local {
        let best_first = tied.iter().map(|c| first_of(c)).min()?;
        let local_first = first_of(pick);
        if local_first > best_first {
            return tied
                .iter()
                .find(|c| first_of(c) == best_first)
                .map(|c| c.node);
        }
    }
    Some(pick.node)
}

fn last_of(c: &Candidate) -> Lsn {
    c.lsn.last().unwrap_or(Lsn::ZERO)
}

fn first_of(c: &Candidate) -> Lsn {
    c.lsn.first().unwrap_or(Lsn::new(u64::MAX))
}

/// Whether a remote replica cannot be caught up from the local log and
/// must be restarted instead.
pub fn lacks_catchup_capability(local_first: Lsn, local_last: Lsn, remote: LsnState) -> bool {
    let LsnState::Known { last, .. } = remote else {
        return true;
    };
    local_last > last
        && (local_first == Lsn::ZERO || last.as_u64() < local_first.as_u64().saturating_sub(1))
}
