//! Collaborators the driver executes agent output against.
//!
//! Sends are fire-and-forget: delivery is best effort and the agent retries
//! whatever it still needs. Hosting operations are the only calls with a
//! result, and they run as cancellable tasks.

use std::future::Future;

use failover_ra::error::ErrorKind;
use failover_ra::{
    ClientReportFaultReply, FailoverUnit, FmOutbound, HealthEvent, HostingOutcome,
    HostingRequest, PeerMessage, ProxyRequest,
};
use failover_types::{Authority, FailoverUnitId, NodeId};

/// Network delivery to the authorities, peer agents, clients and the health
/// store.
pub trait Transport: Send + Sync + 'static {
    fn send_fm(&self, authority: Authority, message: FmOutbound);

    fn send_peer(&self, to: NodeId, message: PeerMessage);

    fn reply_client(&self, reply: ClientReportFaultReply);

    fn report_health(&self, event: HealthEvent);
}

/// The local Reconfiguration Agent Proxy. Replies come back to the driver
/// as [`failover_ra::RaEvent::Proxy`].
pub trait Proxy: Send + Sync + 'static {
    fn send(&self, ft: FailoverUnitId, request: ProxyRequest);
}

/// Service activation on this node.
pub trait Hosting: Send + Sync + 'static {
    /// Runs one asynchronous Hosting operation. The future is dropped if the
    /// agent cancels the operation.
    fn execute(
        &self,
        request: HostingRequest,
    ) -> impl Future<Output = Result<HostingOutcome, ErrorKind>> + Send;

    /// Kills the host process of a replica that will not close.
    fn terminate_service_host(&self, host_id: &str);
}

/// Receiver of failover unit checkpoints.
pub trait CheckpointSink: Send + Sync + 'static {
    fn persist(&self, ft: &FailoverUnit);

    fn forget(&self, id: FailoverUnitId);
}
