//! Agent inputs and the job items they become.

use failover_types::{Authority, FailoverUnitId, NodeId, OperationId, ReplicaInstance};

use crate::error::ErrorKind;
use crate::message::{
    ClientReportFaultRequest, FmEnvelope, FmMessage, HostingEvent, HostingOutcome, PeerMessage,
    ProxyReply, ServiceTypeRegistration, UpgradeKey,
};
use crate::output::{OperationOwner, TimerKind};
use crate::upgrade::FtUpgradeWork;

/// Everything the agent reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum RaEvent {
    /// Message from FM or FMM.
    Fm(FmEnvelope),
    /// Message from the agent on another node.
    Peer { from: NodeId, message: PeerMessage },
    /// Reply from the local proxy about one partition.
    Proxy { ft: FailoverUnitId, reply: ProxyReply },
    /// Unsolicited Hosting notification.
    Hosting(HostingEvent),
    /// Completion of an asynchronous Hosting operation.
    HostingCompleted {
        owner: OperationOwner,
        op: OperationId,
        result: Result<HostingOutcome, ErrorKind>,
    },
    ClientReportFault(ClientReportFaultRequest),
    Timer(TimerKind),
}

impl RaEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RaEvent::Fm(envelope) => envelope.message.name(),
            RaEvent::Peer { .. } => "Peer",
            RaEvent::Proxy { .. } => "Proxy",
            RaEvent::Hosting(_) => "Hosting",
            RaEvent::HostingCompleted { .. } => "HostingCompleted",
            RaEvent::ClientReportFault(_) => "ClientReportFault",
            RaEvent::Timer(_) => "Timer",
        }
    }
}

// ============================================================================
// Job Items
// ============================================================================

/// Serialization domain of a job item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum JobKey {
    /// Generation, upgrade and batching work shared by every partition.
    Node,
    FailoverUnit(FailoverUnitId),
}

/// Work against one failover unit.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FtJob {
    Fm {
        authority: Authority,
        message: FmMessage,
    },
    Peer {
        from: NodeId,
        message: PeerMessage,
    },
    Proxy(ProxyReply),
    HostingCompleted {
        op: OperationId,
        result: Result<HostingOutcome, ErrorKind>,
    },
    ServiceTypeRegistered(ServiceTypeRegistration),
    HostClosed,
    ReplicaUpAcknowledged(ReplicaInstance),
    GenerationAdvanced,
    Retry,
    Upgrade(FtUpgradeWork),
    ClientReportFault(ClientReportFaultRequest),
}

/// Node-scoped work.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeJob {
    Fm {
        authority: Authority,
        message: FmMessage,
    },
    Hosting(HostingEvent),
    UpgradeCompleted {
        key: UpgradeKey,
        op: OperationId,
        result: Result<HostingOutcome, ErrorKind>,
    },
    Timer(TimerKind),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Job {
    Ft(FtJob),
    Node(NodeJob),
}

impl Job {
    /// Routes an accepted event to its serialization domain.
    pub(crate) fn route(event: RaEvent) -> (JobKey, Job) {
        match event {
            RaEvent::Fm(FmEnvelope { header, message }) => {
                let authority = header.authority;
                match message.failover_unit() {
                    Some(ft) => (
                        JobKey::FailoverUnit(ft),
                        Job::Ft(FtJob::Fm { authority, message }),
                    ),
                    None => (JobKey::Node, Job::Node(NodeJob::Fm { authority, message })),
                }
            }
            RaEvent::Peer { from, message } => (
                JobKey::FailoverUnit(message.failover_unit()),
                Job::Ft(FtJob::Peer { from, message }),
            ),
            RaEvent::Proxy { ft, reply } => (JobKey::FailoverUnit(ft), Job::Ft(FtJob::Proxy(reply))),
            RaEvent::Hosting(event) => (JobKey::Node, Job::Node(NodeJob::Hosting(event))),
            RaEvent::HostingCompleted { owner, op, result } => match owner {
                OperationOwner::FailoverUnit(ft) => (
                    JobKey::FailoverUnit(ft),
                    Job::Ft(FtJob::HostingCompleted { op, result }),
                ),
                OperationOwner::Upgrade(key) => (
                    JobKey::Node,
                    Job::Node(NodeJob::UpgradeCompleted { key, op, result }),
                ),
            },
            RaEvent::ClientReportFault(request) => (
                JobKey::FailoverUnit(request.ft),
                Job::Ft(FtJob::ClientReportFault(request)),
            ),
            RaEvent::Timer(timer) => (JobKey::Node, Job::Node(NodeJob::Timer(timer))),
        }
    }
}
