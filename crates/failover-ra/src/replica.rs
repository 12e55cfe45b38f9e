//! One node's view of a replica within a failover unit.

use failover_types::{
    DeactivationInfo, Lsn, NodeId, PackageVersionInstance, ReplicaInstance, ReplicaRole,
    ReplicaState,
};
use serde::{Deserialize, Serialize};

use crate::message::ReplicaDescription;

/// LSN slot filled during GetLSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LsnState {
    /// Not queried yet, or the reply has not arrived.
    #[default]
    Unset,
    /// The replica answered but could not report its progress.
    Unknown,
    Known { first: Lsn, last: Lsn },
}

impl LsnState {
    pub fn is_known(&self) -> bool {
        matches!(self, LsnState::Known { .. })
    }

    pub fn last(&self) -> Option<Lsn> {
        match self {
            LsnState::Known { last, .. } => Some(*last),
            _ => None,
        }
    }

    pub fn first(&self) -> Option<Lsn> {
        match self {
            LsnState::Known { first, .. } => Some(*first),
            _ => None,
        }
    }
}

/// Outstanding request to a replica during reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageStage {
    #[default]
    None,
    /// Waiting for a peer agent.
    RaReplyPending,
    /// Waiting for the local proxy.
    ProxyReplyPending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub node: NodeId,
    pub instance: ReplicaInstance,
    pub pc_role: ReplicaRole,
    pub ic_role: ReplicaRole,
    pub cc_role: ReplicaRole,
    pub state: ReplicaState,
    pub is_up: bool,
    pub lsn: LsnState,
    pub package: PackageVersionInstance,
    pub message_stage: MessageStage,
    /// Deactivation info this replica reported in its GetLSN reply.
    pub deactivation_info: DeactivationInfo,
    pub to_be_restarted: bool,
    pub to_be_deactivated: bool,
    pub to_be_activated: bool,
    pub replicator_remove_pending: bool,
}

impl Replica {
    pub fn new(node: NodeId, instance: ReplicaInstance, cc_role: ReplicaRole) -> Self {
        Self {
            node,
            instance,
            pc_role: ReplicaRole::None,
            ic_role: ReplicaRole::None,
            cc_role,
            state: ReplicaState::InCreate,
            is_up: true,
            lsn: LsnState::Unset,
            package: PackageVersionInstance::default(),
            message_stage: MessageStage::None,
            deactivation_info: DeactivationInfo::INVALID,
            to_be_restarted: false,
            to_be_deactivated: false,
            to_be_activated: false,
            replicator_remove_pending: false,
        }
    }

    pub fn from_description(desc: &ReplicaDescription) -> Self {
        let mut replica = Self::new(desc.node, desc.instance, desc.cc_role);
        replica.update_from_description(desc);
        replica
    }

    /// Adopts roles and status from the wire. Local flags are untouched.
    pub fn update_from_description(&mut self, desc: &ReplicaDescription) {
        self.instance = desc.instance;
        self.pc_role = desc.pc_role;
        self.cc_role = desc.cc_role;
        self.state = desc.state;
        self.is_up = desc.is_up;
        self.package = desc.package.clone();
    }

    pub fn to_description(&self) -> ReplicaDescription {
        ReplicaDescription {
            node: self.node,
            instance: self.instance,
            pc_role: self.pc_role,
            cc_role: self.cc_role,
            state: self.state,
            is_up: self.is_up,
            first_lsn: self.lsn.first(),
            last_lsn: self.lsn.last(),
            package: self.package.clone(),
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.state == ReplicaState::Dropped
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReplicaState::Ready
    }

    pub fn is_in_build(&self) -> bool {
        self.state == ReplicaState::InBuild
    }

    pub fn is_in_pc(&self) -> bool {
        self.pc_role.is_in_configuration()
    }

    pub fn is_in_cc(&self) -> bool {
        self.cc_role.is_in_configuration()
    }

    pub fn is_in_configuration(&self) -> bool {
        self.is_in_pc() || self.is_in_cc()
    }

    pub fn is_pending(&self) -> bool {
        self.message_stage != MessageStage::None
    }

    /// Clears the per-reconfiguration bookkeeping.
    pub fn clear_reconfiguration_state(&mut self) {
        self.lsn = LsnState::Unset;
        self.message_stage = MessageStage::None;
        self.to_be_restarted = false;
        self.to_be_deactivated = false;
        self.to_be_activated = false;
    }
}
