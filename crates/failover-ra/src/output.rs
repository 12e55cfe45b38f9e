//! Output of the agent state machine.
//!
//! The caller (the node shell) is responsible for:
//! 1. Delivering the outgoing messages
//! 2. Executing the effects (Hosting calls, timers, checkpoints)
//! 3. Forwarding health events to the health store

use std::time::Duration;

use failover_types::{Authority, FailoverUnitId, NodeId, OperationId};

use crate::failover_unit::FailoverUnit;
use crate::message::{
    ClientReportFaultReply, FmOutbound, HostingRequest, PeerMessage, ProxyRequest, UpgradeKey,
};
use crate::retryable_error::RetryableErrorKind;

// ============================================================================
// Messages
// ============================================================================

/// A message leaving the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Fm {
        authority: Authority,
        message: FmOutbound,
    },
    Peer {
        to: NodeId,
        message: PeerMessage,
    },
    Proxy {
        ft: FailoverUnitId,
        request: ProxyRequest,
    },
    Client(ClientReportFaultReply),
}

// ============================================================================
// Effects
// ============================================================================

/// Timers owned by the agent. Arming a timer that is already armed replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Re-sends outstanding per-partition work.
    MessageRetry,
    /// Flushes the batched ReplicaUp report.
    ReplicaUpUpload,
    /// Re-checks an upgrade's completion predicates.
    Upgrade(UpgradeKey),
}

/// Owner of an asynchronous Hosting operation. Completions are delivered
/// on the owner's job queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationOwner {
    FailoverUnit(FailoverUnitId),
    Upgrade(UpgradeKey),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    BeginHosting {
        op: OperationId,
        owner: OperationOwner,
        request: HostingRequest,
    },
    CancelOperation(OperationId),
    ArmTimer {
        timer: TimerKind,
        after: Duration,
    },
    /// Kill the host process of a replica that will not close.
    TerminateServiceHost { host_id: String },
    /// Checkpoint a changed partition to the local failover unit map.
    Persist(Box<FailoverUnit>),
    /// The partition left the in-memory table; remove its checkpoint.
    Forget(FailoverUnitId),
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthProperty {
    Retry(RetryableErrorKind),
    ReconfigurationStuck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthLevel {
    Warning,
    Ok,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub ft: FailoverUnitId,
    pub property: HealthProperty,
    pub level: HealthLevel,
    pub detail: String,
}

// ============================================================================
// Agent Output
// ============================================================================

#[derive(Debug, Default, PartialEq)]
pub struct RaOutput {
    pub messages: Vec<Outbound>,
    pub effects: Vec<Effect>,
    pub health: Vec<HealthEvent>,
}

impl RaOutput {
    /// Creates an empty output (no messages, no effects).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates output with only messages.
    pub fn with_messages(messages: Vec<Outbound>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Returns true if there are no messages, effects or health events.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.effects.is_empty() && self.health.is_empty()
    }

    /// Merges another output into this one.
    pub fn merge(&mut self, other: RaOutput) {
        self.messages.extend(other.messages);
        self.effects.extend(other.effects);
        self.health.extend(other.health);
    }

    pub fn fm_messages(&self) -> impl Iterator<Item = &FmOutbound> {
        self.messages.iter().filter_map(|m| match m {
            Outbound::Fm { message, .. } => Some(message),
            _ => None,
        })
    }

    pub fn peer_messages(&self) -> impl Iterator<Item = (NodeId, &PeerMessage)> {
        self.messages.iter().filter_map(|m| match m {
            Outbound::Peer { to, message } => Some((*to, message)),
            _ => None,
        })
    }

    pub fn proxy_requests(&self) -> impl Iterator<Item = &ProxyRequest> {
        self.messages.iter().filter_map(|m| match m {
            Outbound::Proxy { request, .. } => Some(request),
            _ => None,
        })
    }

    pub fn hosting_requests(&self) -> impl Iterator<Item = (OperationId, &HostingRequest)> {
        self.effects.iter().filter_map(|e| match e {
            Effect::BeginHosting { op, request, .. } => Some((*op, request)),
            _ => None,
        })
    }

    pub fn client_replies(&self) -> impl Iterator<Item = &ClientReportFaultReply> {
        self.messages.iter().filter_map(|m| match m {
            Outbound::Client(reply) => Some(reply),
            _ => None,
        })
    }
}
