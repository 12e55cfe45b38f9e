//! Message types exchanged by the reconfiguration agent.
//!
//! Inbound traffic arrives from four sources:
//! - the Failover Manager or FMM ([`FmEnvelope`])
//! - peer agents on other nodes ([`PeerMessage`])
//! - the local Reconfiguration Agent Proxy ([`ProxyReply`])
//! - Hosting ([`HostingEvent`], plus completions of [`HostingRequest`]s)
//!
//! Outbound traffic is [`FmOutbound`], [`PeerMessage`] and [`ProxyRequest`].
//! Clients use [`ClientReportFaultRequest`] and [`ClientReportFaultReply`].

use std::time::Duration;

use failover_types::{
    Authority, DeactivationInfo, Epoch, FailoverUnitId, Generation, Lsn, NodeId,
    PackageVersionInstance, ReplicaId, ReplicaInstance, ReplicaRole, ReplicaState,
    UpgradeInstanceId,
};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ErrorKind};

// ============================================================================
// Descriptions
// ============================================================================

/// Static description of the service a partition belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub name: String,
    pub application: String,
    pub service_type: String,
    pub has_persisted_state: bool,
    /// Hosted outside the platform's activation (ad-hoc host).
    pub is_adhoc: bool,
    pub package: PackageVersionInstance,
}

/// Epoch header of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverUnitDescription {
    pub id: FailoverUnitId,
    pub pc: Epoch,
    pub cc: Epoch,
}

impl FailoverUnitDescription {
    pub fn new(id: FailoverUnitId, pc: Epoch, cc: Epoch) -> Self {
        Self { id, pc, cc }
    }
}

/// Wire form of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescription {
    pub node: NodeId,
    pub instance: ReplicaInstance,
    pub pc_role: ReplicaRole,
    pub cc_role: ReplicaRole,
    pub state: ReplicaState,
    pub is_up: bool,
    pub first_lsn: Option<Lsn>,
    pub last_lsn: Option<Lsn>,
    pub package: PackageVersionInstance,
}

impl ReplicaDescription {
    /// Replica outside any reconfiguration: no previous role, no LSNs.
    pub fn new(
        node: NodeId,
        instance: ReplicaInstance,
        cc_role: ReplicaRole,
        state: ReplicaState,
        is_up: bool,
    ) -> Self {
        Self {
            node,
            instance,
            pc_role: ReplicaRole::None,
            cc_role,
            state,
            is_up,
            first_lsn: None,
            last_lsn: None,
            package: PackageVersionInstance::default(),
        }
    }

    pub fn with_pc_role(mut self, role: ReplicaRole) -> Self {
        self.pc_role = role;
        self
    }
}

/// Body of messages that target a single replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMessageBody {
    pub ft: FailoverUnitDescription,
    pub service: ServiceDescription,
    pub replica: ReplicaDescription,
}

/// Body of messages that carry a whole configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationBody {
    pub ft: FailoverUnitDescription,
    pub service: ServiceDescription,
    pub replicas: Vec<ReplicaDescription>,
    pub deactivation_info: DeactivationInfo,
    /// Present on swap-primary reconfigurations forwarded by the old primary.
    pub phase0_duration: Option<Duration>,
}

impl ConfigurationBody {
    pub fn replica_on(&self, node: NodeId) -> Option<&ReplicaDescription> {
        self.replicas.iter().find(|r| r.node == node)
    }

    /// Node whose current-configuration role is primary.
    pub fn cc_primary(&self) -> Option<NodeId> {
        self.replicas
            .iter()
            .find(|r| r.cc_role == ReplicaRole::Primary)
            .map(|r| r.node)
    }

    pub fn pc_primary(&self) -> Option<NodeId> {
        self.replicas
            .iter()
            .find(|r| r.pc_role == ReplicaRole::Primary)
            .map(|r| r.node)
    }
}

// ============================================================================
// Failover Manager Messages
// ============================================================================

/// Generation header stamped on every FM/FMM message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationHeader {
    pub generation: Generation,
    pub authority: Authority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FmEnvelope {
    pub header: GenerationHeader,
    pub message: FmMessage,
}

/// Application upgrade request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationUpgradeSpec {
    pub application: String,
    pub instance: UpgradeInstanceId,
    pub version: String,
    /// Service types whose packages are part of the new version.
    pub service_types: Vec<String>,
    /// Service types removed from the application by this upgrade.
    pub removed_service_types: Vec<String>,
}

/// Fabric (platform code) upgrade request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricUpgradeSpec {
    pub instance: UpgradeInstanceId,
    pub version: String,
    /// Whether the new code supports deactivation info.
    pub deactivation_info_supported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaUpAck {
    pub ft: FailoverUnitId,
    pub instance: ReplicaInstance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FmMessage {
    AddInstance(ReplicaMessageBody),
    AddPrimary(ReplicaMessageBody),
    AddReplica(ReplicaMessageBody),
    RemoveInstance(ReplicaMessageBody),
    RemoveReplica(ReplicaMessageBody),
    DeleteReplica(ReplicaMessageBody),
    DoReconfiguration(ConfigurationBody),
    NodeUpgradeRequest(ApplicationUpgradeSpec),
    CancelApplicationUpgradeRequest(ApplicationUpgradeSpec),
    NodeFabricUpgradeRequest(FabricUpgradeSpec),
    CancelFabricUpgradeRequest(FabricUpgradeSpec),
    GenerationProposal { proposed: Generation },
    GenerationUpdate { generation: Generation },
    NodeUpdateServiceRequest {
        ft: FailoverUnitId,
        service: ServiceDescription,
    },
    ReplicaUpReply { acknowledged: Vec<ReplicaUpAck> },
    LfumUploadReply { generation: Generation },
}

impl FmMessage {
    /// Partition the message addresses, if it is partition-scoped.
    pub fn failover_unit(&self) -> Option<FailoverUnitId> {
        match self {
            FmMessage::AddInstance(b)
            | FmMessage::AddPrimary(b)
            | FmMessage::AddReplica(b)
            | FmMessage::RemoveInstance(b)
            | FmMessage::RemoveReplica(b)
            | FmMessage::DeleteReplica(b) => Some(b.ft.id),
            FmMessage::DoReconfiguration(b) => Some(b.ft.id),
            FmMessage::NodeUpdateServiceRequest { ft, .. } => Some(*ft),
            _ => None,
        }
    }

    /// Generation messages establish the header and are not checked against it.
    pub fn is_generation_handshake(&self) -> bool {
        matches!(
            self,
            FmMessage::GenerationProposal { .. } | FmMessage::GenerationUpdate { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            FmMessage::AddInstance(_) => "AddInstance",
            FmMessage::AddPrimary(_) => "AddPrimary",
            FmMessage::AddReplica(_) => "AddReplica",
            FmMessage::RemoveInstance(_) => "RemoveInstance",
            FmMessage::RemoveReplica(_) => "RemoveReplica",
            FmMessage::DeleteReplica(_) => "DeleteReplica",
            FmMessage::DoReconfiguration(_) => "DoReconfiguration",
            FmMessage::NodeUpgradeRequest(_) => "NodeUpgradeRequest",
            FmMessage::CancelApplicationUpgradeRequest(_) => "CancelApplicationUpgradeRequest",
            FmMessage::NodeFabricUpgradeRequest(_) => "NodeFabricUpgradeRequest",
            FmMessage::CancelFabricUpgradeRequest(_) => "CancelFabricUpgradeRequest",
            FmMessage::GenerationProposal { .. } => "GenerationProposal",
            FmMessage::GenerationUpdate { .. } => "GenerationUpdate",
            FmMessage::NodeUpdateServiceRequest { .. } => "NodeUpdateServiceRequest",
            FmMessage::ReplicaUpReply { .. } => "ReplicaUpReply",
            FmMessage::LfumUploadReply { .. } => "LfumUploadReply",
        }
    }
}

/// Reply about a single replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaReplyBody {
    pub ft: FailoverUnitDescription,
    pub replica: ReplicaDescription,
    pub error: ErrorCode,
}

/// Reply or report about a whole configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationReplyBody {
    pub ft: FailoverUnitDescription,
    pub replicas: Vec<ReplicaDescription>,
    pub error: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaUpEntry {
    pub ft: FailoverUnitDescription,
    pub replica: ReplicaDescription,
}

/// Outcome of an upgrade cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelUpgradeResult {
    Success,
    NotAllowed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FmOutbound {
    AddInstanceReply(ReplicaReplyBody),
    AddPrimaryReply(ReplicaReplyBody),
    AddReplicaReply(ReplicaReplyBody),
    RemoveInstanceReply(ReplicaReplyBody),
    RemoveReplicaReply(ReplicaReplyBody),
    DeleteReplicaReply(ReplicaReplyBody),
    DoReconfigurationReply(ConfigurationReplyBody),
    ChangeConfiguration(ConfigurationReplyBody),
    DataLossReport(ConfigurationReplyBody),
    GenerationProposalReply {
        receive: Generation,
        proposed: Generation,
    },
    /// Batched report of replicas that came up, went down or were dropped.
    ReplicaUp {
        up: Vec<ReplicaUpEntry>,
        dropped: Vec<ReplicaUpEntry>,
    },
    LfumUpload {
        generation: Generation,
        units: Vec<ReplicaUpEntry>,
    },
    NodeUpgradeReply {
        application: String,
        instance: UpgradeInstanceId,
    },
    CancelApplicationUpgradeReply {
        application: String,
        instance: UpgradeInstanceId,
        result: CancelUpgradeResult,
    },
    NodeFabricUpgradeReply {
        instance: UpgradeInstanceId,
    },
    CancelFabricUpgradeReply {
        instance: UpgradeInstanceId,
        result: CancelUpgradeResult,
    },
    NodeUpdateServiceReply {
        ft: FailoverUnitId,
        instance: UpgradeInstanceId,
    },
}

// ============================================================================
// Peer Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLsnReplyBody {
    pub ft: FailoverUnitDescription,
    /// The replying replica, with its LSNs filled in.
    pub replica: ReplicaDescription,
    pub deactivation_info: DeactivationInfo,
    pub error: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    CreateReplica(ReplicaMessageBody),
    CreateReplicaReply(ReplicaReplyBody),
    GetLsn(ReplicaMessageBody),
    GetLsnReply(GetLsnReplyBody),
    Deactivate {
        body: ConfigurationBody,
        /// Close the target instead of deactivating it.
        force: bool,
    },
    DeactivateReply(ReplicaReplyBody),
    Activate(ConfigurationBody),
    ActivateReply(ReplicaReplyBody),
    /// Swap-primary hand-off from the demoted primary to the primary-elect.
    ContinueSwapPrimary(ConfigurationBody),
}

impl PeerMessage {
    pub fn failover_unit(&self) -> FailoverUnitId {
        match self {
            PeerMessage::CreateReplica(b) | PeerMessage::GetLsn(b) => b.ft.id,
            PeerMessage::CreateReplicaReply(b)
            | PeerMessage::DeactivateReply(b)
            | PeerMessage::ActivateReply(b) => b.ft.id,
            PeerMessage::GetLsnReply(b) => b.ft.id,
            PeerMessage::Deactivate { body, .. } => body.ft.id,
            PeerMessage::Activate(b) | PeerMessage::ContinueSwapPrimary(b) => b.ft.id,
        }
    }
}

// ============================================================================
// Proxy (RAP) Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenMode {
    Open,
    Reopen,
}

/// How the local replica is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseMode {
    /// Full close of a non-persisted replica.
    Close,
    /// Persisted restart; reopened later.
    Restart,
    Drop,
    Delete,
    /// Permanent fault reported by the replica or a client.
    Abort,
    /// Forced permanent fault.
    Obliterate,
}

impl CloseMode {
    /// A pending close is only replaced by a strictly stronger mode.
    pub fn strength(self) -> u8 {
        match self {
            CloseMode::Close | CloseMode::Restart => 1,
            CloseMode::Drop | CloseMode::Abort => 2,
            CloseMode::Delete => 3,
            CloseMode::Obliterate => 4,
        }
    }

    /// Whether the replica's state survives the close.
    pub fn preserves_replica(self) -> bool {
        self == CloseMode::Restart
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateConfigurationKind {
    Catchup,
    SwapPrimaryDemote,
    EndReconfiguration,
    ChangeRole(ReplicaRole),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyRequest {
    Open {
        ft: FailoverUnitDescription,
        service: ServiceDescription,
        replica: ReplicaDescription,
        /// Set on the final retry.
        abort_on_failure: bool,
    },
    Reopen {
        ft: FailoverUnitDescription,
        service: ServiceDescription,
        replica: ReplicaDescription,
        abort_on_failure: bool,
    },
    Close {
        instance: ReplicaInstance,
        mode: CloseMode,
    },
    UpdateConfiguration {
        ft: FailoverUnitDescription,
        kind: UpdateConfigurationKind,
        replicas: Vec<ReplicaDescription>,
    },
    BuildIdleReplica {
        ft: FailoverUnitDescription,
        replica: ReplicaDescription,
    },
    RemoveIdleReplica {
        ft: FailoverUnitDescription,
        replica: ReplicaDescription,
    },
    ReplicatorGetStatus {
        instance: ReplicaInstance,
    },
    ReplicatorUpdateEpochAndGetStatus {
        instance: ReplicaInstance,
        epoch: Epoch,
    },
    CancelCatchupReplicaSet {
        instance: ReplicaInstance,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorStatus {
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupOutcome {
    pub last_acked_lsn: Lsn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultType {
    Transient,
    Permanent,
}

/// Reply from the local proxy. Every reply names the local replica instance
/// it was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyReply {
    ReplicaOpen {
        instance: ReplicaInstance,
        result: Result<(), ErrorKind>,
    },
    ReplicaClose {
        instance: ReplicaInstance,
        mode: CloseMode,
        result: Result<(), ErrorKind>,
    },
    StatefulServiceReopen {
        instance: ReplicaInstance,
        result: Result<(), ErrorKind>,
    },
    UpdateConfiguration {
        instance: ReplicaInstance,
        kind: UpdateConfigurationKind,
        result: Result<CatchupOutcome, ErrorKind>,
    },
    BuildIdleReplica {
        instance: ReplicaInstance,
        target: ReplicaInstance,
        result: Result<(), ErrorKind>,
    },
    RemoveIdleReplica {
        instance: ReplicaInstance,
        target: ReplicaInstance,
        result: Result<(), ErrorKind>,
    },
    ReplicatorGetStatus {
        instance: ReplicaInstance,
        result: Result<ReplicatorStatus, ErrorKind>,
    },
    ReplicatorUpdateEpochAndGetStatus {
        instance: ReplicaInstance,
        result: Result<ReplicatorStatus, ErrorKind>,
    },
    CancelCatchupReplicaSet {
        instance: ReplicaInstance,
        result: Result<(), ErrorKind>,
    },
    ReportFault {
        instance: ReplicaInstance,
        kind: FaultType,
    },
}

impl ProxyReply {
    pub fn instance(&self) -> ReplicaInstance {
        match self {
            ProxyReply::ReplicaOpen { instance, .. }
            | ProxyReply::ReplicaClose { instance, .. }
            | ProxyReply::StatefulServiceReopen { instance, .. }
            | ProxyReply::UpdateConfiguration { instance, .. }
            | ProxyReply::BuildIdleReplica { instance, .. }
            | ProxyReply::RemoveIdleReplica { instance, .. }
            | ProxyReply::ReplicatorGetStatus { instance, .. }
            | ProxyReply::ReplicatorUpdateEpochAndGetStatus { instance, .. }
            | ProxyReply::CancelCatchupReplicaSet { instance, .. }
            | ProxyReply::ReportFault { instance, .. } => *instance,
        }
    }
}

// ============================================================================
// Hosting
// ============================================================================

/// Where a registered service type is hosted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceTypeRegistration {
    pub host_id: String,
    pub runtime_id: String,
}

/// Target of an upgrade state machine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UpgradeKey {
    Application(String),
    Fabric,
}

impl std::fmt::Display for UpgradeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeKey::Application(name) => write!(f, "application:{name}"),
            UpgradeKey::Fabric => write!(f, "fabric"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostingRequest {
    FindServiceTypeRegistration {
        service_type: String,
        package: PackageVersionInstance,
    },
    Download {
        key: UpgradeKey,
        version: String,
        service_types: Vec<String>,
    },
    Analyze {
        key: UpgradeKey,
        version: String,
        service_types: Vec<String>,
    },
    Upgrade {
        key: UpgradeKey,
        version: String,
        service_types: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostingOutcome {
    Registered(ServiceTypeRegistration),
    Downloaded,
    /// Service types whose running code is affected by the upgrade.
    Analyzed { affected_service_types: Vec<String> },
    Upgraded,
}

/// Unsolicited notification from Hosting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostingEvent {
    ServiceTypeRegistered {
        service_type: String,
        registration: ServiceTypeRegistration,
    },
    AppHostClosed { host_id: String },
    RuntimeClosed { runtime_id: String },
}

// ============================================================================
// Client RPC
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReportFaultRequest {
    pub node: NodeId,
    pub ft: FailoverUnitId,
    pub replica_id: ReplicaId,
    pub kind: FaultType,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReportFaultReply {
    pub ft: FailoverUnitId,
    pub replica_id: ReplicaId,
    pub error: ErrorCode,
    pub message: String,
}

impl ClientReportFaultReply {
    pub fn new(request: &ClientReportFaultRequest, error: ErrorCode) -> Self {
        Self {
            ft: request.ft,
            replica_id: request.replica_id,
            error,
            message: error.message().to_string(),
        }
    }
}
