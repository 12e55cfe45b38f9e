//! The failover unit: one partition as seen from this node.
//!
//! A [`FailoverUnit`] owns the replica set, the epoch history, the
//! reconfiguration stage and the local replica's open/close condition. It is
//! the unit of concurrency: every mutation happens inside one job item.
//!
//! Submodules:
//! - `lifecycle`: open, reopen, close, registration and fault handling
//! - `reconfiguration`: the GetLSN, catchup, deactivate and activate phases
//! - `peer`: the secondary side of reconfiguration and replica builds
//! - `primary_selection`: pure new-primary selection

mod lifecycle;
mod peer;
pub mod primary_selection;
mod reconfiguration;

use std::collections::BTreeMap;

use failover_types::{
    Authority, DeactivationInfo, Epoch, FailoverUnitId, NodeId, OperationId, ReplicaInstance,
    ReplicaRole, ReplicaState, Timestamp,
};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{ErrorCode, RaError, Result};
use crate::message::{
    CloseMode, FailoverUnitDescription, FmOutbound, OpenMode, PeerMessage, ReplicaDescription,
    ReplicaReplyBody, ReplicaUpEntry, ServiceDescription, ServiceTypeRegistration,
};
use crate::output::{HealthEvent, HealthLevel, HealthProperty};
use crate::reconfiguration_state::{ReconfigurationStage, ReconfigurationState};
use crate::replica::{LsnState, Replica};
use crate::retryable_error::{RetryDecision, RetryableErrorKind, RetryableErrorState};
use crate::staleness::FailoverUnitView;

// ============================================================================
// Local Replica Condition
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverUnitState {
    Open,
    /// The local replica is gone. A higher-instance open recreates the unit.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    /// Waiting for Hosting to find the service type registration.
    Pending,
    Registered(ServiceTypeRegistration),
}

/// Open/close condition of the local replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalOpenStatus {
    Opening {
        mode: OpenMode,
        registration: RegistrationState,
    },
    Opened {
        registration: ServiceTypeRegistration,
    },
    Closing {
        mode: CloseMode,
        registration: ServiceTypeRegistration,
    },
    Closed,
}

impl LocalOpenStatus {
    pub fn registration(&self) -> Option<&ServiceTypeRegistration> {
        match self {
            LocalOpenStatus::Opening {
                registration: RegistrationState::Registered(r),
                ..
            }
            | LocalOpenStatus::Opened { registration: r }
            | LocalOpenStatus::Closing { registration: r, .. } => Some(r),
            _ => None,
        }
    }

    pub fn is_opened(&self) -> bool {
        matches!(self, LocalOpenStatus::Opened { .. })
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, LocalOpenStatus::Closing { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, LocalOpenStatus::Closed)
    }
}

/// Requester owed a reply once the local open or close settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingReply {
    AddPrimary,
    AddInstance,
    CreateReplica { to: NodeId },
    RemoveInstance,
    DeleteReplica,
    Activate { to: NodeId },
}

/// Pending entry in the next ReplicaUp batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaUpKind {
    Up,
    Down,
    Dropped,
}

// ============================================================================
// Failover Unit
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverUnit {
    pub(crate) id: FailoverUnitId,
    pub(crate) service: ServiceDescription,
    pub(crate) local_node: NodeId,
    pub(crate) state: FailoverUnitState,
    pub(crate) local_open: LocalOpenStatus,
    pub(crate) replicas: BTreeMap<NodeId, Replica>,

    pub(crate) pc_epoch: Epoch,
    pub(crate) ic_epoch: Epoch,
    pub(crate) cc_epoch: Epoch,
    pub(crate) deactivation_info: DeactivationInfo,
    pub(crate) deactivation_info_supported: bool,

    pub(crate) reconfig: ReconfigurationState,
    pub(crate) update_replicator_pending: bool,
    pub(crate) data_loss_version_to_report: Option<u64>,

    /// Peer waiting for a GetLSN reply from this node, and the epoch it asked for.
    pub(crate) sender_node: Option<(NodeId, Epoch)>,
    pub(crate) pending_reply: Option<PendingReply>,
    pub(crate) pending_operation: Option<OperationId>,

    pub(crate) proxy_errors: RetryableErrorState,
    pub(crate) hosting_errors: RetryableErrorState,
    pub(crate) retry_required: bool,

    pub(crate) replica_up_pending: Option<ReplicaUpKind>,
    pub(crate) deleted: bool,
    pub(crate) held_for_upgrade: bool,
    pub(crate) close_started_at: Option<Timestamp>,
}

impl FailoverUnit {
    /// Creates an open unit whose local replica is about to be opened.
    pub(crate) fn new(
        id: FailoverUnitId,
        local_node: NodeId,
        service: ServiceDescription,
        ft: &FailoverUnitDescription,
        local: Replica,
        deactivation_info_supported: bool,
    ) -> Self {
        let mut replicas = BTreeMap::new();
        replicas.insert(local_node, local);
        Self {
            id,
            service,
            local_node,
            state: FailoverUnitState::Open,
            local_open: LocalOpenStatus::Opening {
                mode: OpenMode::Open,
                registration: RegistrationState::Pending,
            },
            replicas,
            pc_epoch: ft.pc,
            ic_epoch: Epoch::INVALID,
            cc_epoch: ft.cc,
            deactivation_info: DeactivationInfo::INVALID,
            deactivation_info_supported,
            reconfig: ReconfigurationState::default(),
            update_replicator_pending: false,
            data_loss_version_to_report: None,
            sender_node: None,
            pending_reply: None,
            pending_operation: None,
            proxy_errors: RetryableErrorState::new(),
            hosting_errors: RetryableErrorState::new(),
            retry_required: false,
            replica_up_pending: None,
            deleted: false,
            held_for_upgrade: false,
            close_started_at: None,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn id(&self) -> FailoverUnitId {
        self.id
    }

    pub fn owner(&self) -> Authority {
        self.id.owner()
    }

    pub fn service(&self) -> &ServiceDescription {
        &self.service
    }

    pub fn state(&self) -> FailoverUnitState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == FailoverUnitState::Open
    }

    pub fn local_open(&self) -> &LocalOpenStatus {
        &self.local_open
    }

    pub fn local_replica(&self) -> Option<&Replica> {
        self.replicas.get(&self.local_node)
    }

    pub(crate) fn local_replica_mut(&mut self) -> Option<&mut Replica> {
        self.replicas.get_mut(&self.local_node)
    }

    pub fn local_instance(&self) -> ReplicaInstance {
        self.local_replica().map(|r| r.instance).unwrap_or_default()
    }

    pub fn replica(&self, node: NodeId) -> Option<&Replica> {
        self.replicas.get(&node)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.values()
    }

    pub fn pc_epoch(&self) -> Epoch {
        self.pc_epoch
    }

    pub fn ic_epoch(&self) -> Epoch {
        self.ic_epoch
    }

    pub fn cc_epoch(&self) -> Epoch {
        self.cc_epoch
    }

    pub fn deactivation_info(&self) -> DeactivationInfo {
        self.deactivation_info
    }

    pub fn reconfiguration(&self) -> &ReconfigurationState {
        &self.reconfig
    }

    pub fn replica_up_pending(&self) -> Option<ReplicaUpKind> {
        self.replica_up_pending
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_held_for_upgrade(&self) -> bool {
        self.held_for_upgrade
    }

    pub fn registration(&self) -> Option<&ServiceTypeRegistration> {
        self.local_open.registration()
    }

    pub fn is_local_up(&self) -> bool {
        self.is_open() && self.local_replica().is_some_and(|r| r.is_up)
    }

    pub fn is_local_ready(&self) -> bool {
        self.local_replica()
            .is_some_and(|r| r.state == ReplicaState::Ready && r.is_up)
    }

    pub(crate) fn is_persisted(&self) -> bool {
        self.service.has_persisted_state
    }

    pub(crate) fn remote_nodes(&self) -> Vec<NodeId> {
        self.replicas
            .keys()
            .copied()
            .filter(|n| *n != self.local_node)
            .collect()
    }

    // ------------------------------------------------------------------------
    // Wire Forms
    // ------------------------------------------------------------------------

    pub fn description(&self) -> FailoverUnitDescription {
        FailoverUnitDescription::new(self.id, self.pc_epoch, self.cc_epoch)
    }

    pub fn replica_descriptions(&self) -> Vec<ReplicaDescription> {
        self.replicas.values().map(Replica::to_description).collect()
    }

    pub fn local_description(&self) -> Option<ReplicaDescription> {
        self.local_replica().map(Replica::to_description)
    }

    pub(crate) fn replica_up_entry(&self) -> Option<ReplicaUpEntry> {
        Some(ReplicaUpEntry {
            ft: self.description(),
            replica: self.local_description()?,
        })
    }

    pub(crate) fn reply_body(&self, error: ErrorCode) -> Option<ReplicaReplyBody> {
        Some(ReplicaReplyBody {
            ft: self.description(),
            replica: self.local_description()?,
            error,
        })
    }

    pub fn staleness_view(&self) -> FailoverUnitView {
        FailoverUnitView {
            cc: self.cc_epoch,
            local_instance: self.local_instance(),
            is_closing: self.local_open.is_closing(),
            is_in_create: self
                .local_replica()
                .is_some_and(|r| r.state == ReplicaState::InCreate),
            is_local_up: self.is_local_up(),
        }
    }

    // ------------------------------------------------------------------------
    // Shared Helpers
    // ------------------------------------------------------------------------

    /// Sends the reply owed to the requester, if any.
    pub(crate) fn send_pending_reply(&mut self, cx: &mut Context<'_>, error: ErrorCode) {
        let Some(pending) = self.pending_reply.take() else {
            return;
        };
        let Some(body) = self.reply_body(error) else {
            return;
        };
        let owner = self.owner();
        match pending {
            PendingReply::AddPrimary => cx.send_fm(owner, FmOutbound::AddPrimaryReply(body)),
            PendingReply::AddInstance => cx.send_fm(owner, FmOutbound::AddInstanceReply(body)),
            PendingReply::RemoveInstance => {
                cx.send_fm(owner, FmOutbound::RemoveInstanceReply(body));
            }
            PendingReply::DeleteReplica => {
                cx.send_fm(owner, FmOutbound::DeleteReplicaReply(body));
            }
            PendingReply::CreateReplica { to } => {
                cx.send_peer(to, PeerMessage::CreateReplicaReply(body));
            }
            PendingReply::Activate { to } => cx.send_peer(to, PeerMessage::ActivateReply(body)),
        }
    }

    /// Records a retryable failure and emits the matching health event.
    pub(crate) fn record_failure(
        &mut self,
        cx: &mut Context<'_>,
        kind: RetryableErrorKind,
        hosting: bool,
    ) -> RetryDecision {
        let thresholds = kind.thresholds(&cx.config.retry);
        let errors = if hosting {
            &mut self.hosting_errors
        } else {
            &mut self.proxy_errors
        };
        if errors.enter(kind) {
            cx.health(self.retry_health(kind, HealthLevel::Ok));
        }
        let errors = if hosting {
            &mut self.hosting_errors
        } else {
            &mut self.proxy_errors
        };
        let decision = errors.increment(kind, thresholds);
        let count = errors.failure_count();

        match decision {
            RetryDecision::AtWarning => {
                crate::instrumentation::METRICS.increment_health_warnings();
                tracing::warn!(ft = %self.id, ?kind, count, "retryable operation crossed warning threshold");
                cx.health(self.retry_health(kind, HealthLevel::Warning));
            }
            RetryDecision::AtDrop => {
                tracing::warn!(ft = %self.id, ?kind, count, "retryable operation reached drop threshold");
            }
            RetryDecision::BelowWarning => {
                tracing::debug!(ft = %self.id, ?kind, count, "retrying operation");
            }
        }
        if decision != RetryDecision::AtDrop {
            self.retry_required = true;
        }
        decision
    }

    /// Records success of the current operation kind.
    pub(crate) fn record_success(&mut self, cx: &mut Context<'_>, hosting: bool) {
        let errors = if hosting {
            &mut self.hosting_errors
        } else {
            &mut self.proxy_errors
        };
        let kind = errors.kind();
        if errors.success() {
            if let Some(kind) = kind {
                cx.health(self.retry_health(kind, HealthLevel::Ok));
            }
        }
        self.retry_required = false;
    }

    fn retry_health(&self, kind: RetryableErrorKind, level: HealthLevel) -> HealthEvent {
        HealthEvent {
            ft: self.id,
            property: HealthProperty::Retry(kind),
            level,
            detail: format!("{kind:?} on replica {}", self.local_instance()),
        }
    }

    /// Whether the retry timer has work for this unit.
    pub fn is_retry_required(&self) -> bool {
        if self.retry_required || self.reconfig.is_reconfiguring() || self.sender_node.is_some() {
            return true;
        }
        if matches!(
            self.local_open,
            LocalOpenStatus::Opening { .. } | LocalOpenStatus::Closing { .. }
        ) {
            return true;
        }
        self.replicas.values().any(|r| {
            r.node != self.local_node && (r.is_pending() || r.replicator_remove_pending)
        })
    }

    /// Re-sends whatever this unit is waiting on.
    pub(crate) fn retry(&mut self, cx: &mut Context<'_>) {
        self.retry_required = false;
        match self.local_open.clone() {
            LocalOpenStatus::Opening {
                registration: RegistrationState::Pending,
                ..
            } => self.start_registration(cx),
            LocalOpenStatus::Opening {
                mode,
                registration: RegistrationState::Registered(_),
            } => self.send_open(cx, mode),
            LocalOpenStatus::Closing { mode, .. } => self.send_close(cx, mode),
            LocalOpenStatus::Opened { .. } => {
                if self.reconfig.is_reconfiguring() {
                    self.retry_reconfiguration(cx);
                }
                self.retry_peer_work(cx);
            }
            LocalOpenStatus::Closed => {}
        }
    }

    // ------------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------------

    /// Checks cluster-wide invariants that cannot be repaired locally.
    pub fn check_invariants(&self) -> Result<()> {
        let stage = self.reconfig.stage;
        let swapping = matches!(
            stage,
            ReconfigurationStage::Phase0Demote | ReconfigurationStage::AbortPhase0Demote
        );
        let primaries = self
            .replicas
            .values()
            .filter(|r| !r.is_dropped() && r.cc_role == ReplicaRole::Primary)
            .count();
        if primaries > 1 && !swapping {
            return Err(self.violation(format!(
                "{primaries} primaries in configuration {}",
                self.cc_epoch
            )));
        }

        for replica in self.replicas.values() {
            if let LsnState::Known { first, last } = replica.lsn {
                if first > last {
                    return Err(self.violation(format!(
                        "replica {} reported first lsn {first} above last lsn {last}",
                        replica.instance
                    )));
                }
            }
        }

        if self.pc_epoch.is_valid() && self.pc_epoch > self.cc_epoch {
            return Err(self.violation(format!(
                "previous epoch {} above current epoch {}",
                self.pc_epoch, self.cc_epoch
            )));
        }

        Ok(())
    }

    fn violation(&self, detail: String) -> RaError {
        RaError::ProtocolInvariantViolation { ft: self.id, detail }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use failover_types::PackageVersionInstance;

    pub fn service(persisted: bool) -> ServiceDescription {
        ServiceDescription {
            name: "fabric:/app/svc".to_string(),
            application: "fabric:/app".to_string(),
            service_type: "SvcType".to_string(),
            has_persisted_state: persisted,
            is_adhoc: false,
            package: PackageVersionInstance::new("1.0", 1),
        }
    }

    /// Open unit with a ready, opened local replica.
    pub fn ready_unit(
        local_node: u64,
        role: ReplicaRole,
        cc: Epoch,
        persisted: bool,
    ) -> FailoverUnit {
        let node = NodeId::new(local_node);
        let mut local = Replica::new(node, ReplicaInstance::new(local_node, 1), role);
        local.state = ReplicaState::Ready;
        let mut ft = FailoverUnit::new(
            FailoverUnitId::new(1),
            node,
            service(persisted),
            &FailoverUnitDescription::new(FailoverUnitId::new(1), Epoch::INVALID, cc),
            local,
            true,
        );
        ft.local_open = LocalOpenStatus::Opened {
            registration: ServiceTypeRegistration {
                host_id: "host-1".to_string(),
                runtime_id: "runtime-1".to_string(),
            },
        };
        ft
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ready_unit;
    use super::*;

    #[test]
    fn two_primaries_outside_swap_is_a_violation() {
        let mut ft = ready_unit(1, ReplicaRole::Primary, Epoch::new(4, 11), true);
        let mut other = Replica::new(NodeId::new(2), ReplicaInstance::new(2, 1), ReplicaRole::Primary);
        other.state = ReplicaState::Ready;
        ft.replicas.insert(NodeId::new(2), other);

        assert!(matches!(
            ft.check_invariants(),
            Err(RaError::ProtocolInvariantViolation { .. })
        ));

        ft.reconfig.stage = ReconfigurationStage::Phase0Demote;
        assert!(ft.check_invariants().is_ok());
    }

    #[test]
    fn inverted_lsn_is_a_violation() {
        let mut ft = ready_unit(1, ReplicaRole::Primary, Epoch::new(4, 11), true);
        if let Some(local) = ft.local_replica_mut() {
            local.lsn = LsnState::Known {
                first: failover_types::Lsn::new(9),
                last: failover_types::Lsn::new(3),
            };
        }
        assert!(ft.check_invariants().is_err());
    }

    #[test]
    fn staleness_view_reflects_local_replica() {
        let ft = ready_unit(1, ReplicaRole::Secondary, Epoch::new(4, 11), true);
        let view = ft.staleness_view();
        assert_eq!(view.cc, Epoch::new(4, 11));
        assert_eq!(view.local_instance, ReplicaInstance::new(1, 1));
        assert!(view.is_local_up);
        assert!(!view.is_closing);
        assert!(!view.is_in_create);
    }

    #[test]
    fn opened_ready_unit_needs_no_retry() {
        let ft = ready_unit(1, ReplicaRole::Primary, Epoch::new(4, 11), true);
        assert!(!ft.is_retry_required());
    }
}
