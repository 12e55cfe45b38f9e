//! Reconfiguration bookkeeping of a failover unit.

use std::time::Duration;

use failover_types::Timestamp;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReconfigurationStage {
    #[default]
    None,
    Phase0Demote,
    Phase1GetLsn,
    Phase2Catchup,
    Phase3Deactivate,
    Phase4Activate,
    AbortPhase0Demote,
}

impl std::fmt::Display for ReconfigurationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReconfigurationStage::None => "None",
            ReconfigurationStage::Phase0Demote => "Phase0_Demote",
            ReconfigurationStage::Phase1GetLsn => "Phase1_GetLSN",
            ReconfigurationStage::Phase2Catchup => "Phase2_Catchup",
            ReconfigurationStage::Phase3Deactivate => "Phase3_Deactivate",
            ReconfigurationStage::Phase4Activate => "Phase4_Activate",
            ReconfigurationStage::AbortPhase0Demote => "Abort_Phase0_Demote",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReconfigurationType {
    #[default]
    None,
    SwapPrimary,
    Failover,
    Other,
}

/// Outcome of the last finished reconfiguration. Decides what is resent
/// when FM repeats a DoReconfiguration for the same epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconfigurationResult {
    Completed,
    ChangeConfiguration,
    DemoteCompleted,
    AbortSwapPrimary,
}

/// Why a reconfiguration is waiting. Reported on stuck-reconfiguration health events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitReason {
    WaitingForGetLsn,
    WaitingForReadQuorum,
    DataLossReported,
    CatchupPending,
    DeactivatePending,
    UpReadyReplicasPending,
    ReplicaStuckInBuild,
    ReplicaPendingRestart,
    LocalReplicaNotReplied,
    ReplicatorConfigurationUpdatePending,
    ReplicaPending,
    ReplicatorRemovePending,
    AbortPending,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigurationState {
    pub stage: ReconfigurationStage,
    pub kind: ReconfigurationType,
    pub last_result: Option<ReconfigurationResult>,
    pub started_at: Option<Timestamp>,
    pub phase_started_at: Option<Timestamp>,
    /// Carried on the swap-primary hand-off.
    pub phase0_duration: Option<Duration>,
    /// FM raised the data loss version; selection also considers unknown LSNs.
    pub data_loss_mode: bool,
    pub wait_reason: Option<WaitReason>,
    pub health_reported: bool,
}

impl ReconfigurationState {
    pub fn is_reconfiguring(&self) -> bool {
        self.stage != ReconfigurationStage::None
    }

    pub fn start(&mut self, kind: ReconfigurationType, stage: ReconfigurationStage, now: Timestamp) {
        self.kind = kind;
        self.stage = stage;
        self.started_at = Some(now);
        self.phase_started_at = Some(now);
        self.wait_reason = None;
    }

    pub fn enter_phase(&mut self, stage: ReconfigurationStage, now: Timestamp) {
        self.stage = stage;
        self.phase_started_at = Some(now);
        self.wait_reason = None;
    }

    /// Ends the reconfiguration. Returns true if a stuck warning must be cleared.
    pub fn finish(&mut self, result: ReconfigurationResult) -> bool {
        let cleared = self.health_reported;
        self.stage = ReconfigurationStage::None;
        self.kind = ReconfigurationType::None;
        self.last_result = Some(result);
        self.started_at = None;
        self.phase_started_at = None;
        self.phase0_duration = None;
        self.data_loss_mode = false;
        self.wait_reason = None;
        self.health_reported = false;
        cleared
    }

    pub fn phase_elapsed(&self, now: Timestamp) -> Duration {
        self.phase_started_at
            .map_or(Duration::ZERO, |start| now.saturating_since(start))
    }

    pub fn total_elapsed(&self, now: Timestamp) -> Duration {
        self.started_at
            .map_or(Duration::ZERO, |start| now.saturating_since(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_records_result_and_clears_timing() {
        let mut state = ReconfigurationState::default();
        state.start(
            ReconfigurationType::Failover,
            ReconfigurationStage::Phase1GetLsn,
            Timestamp::from_millis(10),
        );
        state.health_reported = true;
        assert!(state.is_reconfiguring());
        assert_eq!(
            state.total_elapsed(Timestamp::from_millis(110)),
            Duration::from_millis(100)
        );

        assert!(state.finish(ReconfigurationResult::Completed));
        assert!(!state.is_reconfiguring());
        assert_eq!(state.last_result, Some(ReconfigurationResult::Completed));
        assert_eq!(state.total_elapsed(Timestamp::from_millis(500)), Duration::ZERO);
    }
}
