//! Execution context handed to every job item.

use failover_config::RaConfig;
use failover_types::{Authority, FailoverUnitId, NodeId, OperationId, Timestamp};

use crate::message::{ClientReportFaultReply, FmOutbound, HostingRequest, PeerMessage, ProxyRequest};
use crate::output::{Effect, HealthEvent, OperationOwner, Outbound, RaOutput};

/// Borrowed agent state plus the output being accumulated by one job item.
pub(crate) struct Context<'a> {
    pub node: NodeId,
    pub config: &'a RaConfig,
    pub now: Timestamp,
    pub output: RaOutput,
    next_operation: &'a mut OperationId,
}

impl<'a> Context<'a> {
    pub fn new(
        node: NodeId,
        config: &'a RaConfig,
        now: Timestamp,
        next_operation: &'a mut OperationId,
    ) -> Self {
        Self {
            node,
            config,
            now,
            output: RaOutput::empty(),
            next_operation,
        }
    }

    pub fn send_fm(&mut self, authority: Authority, message: FmOutbound) {
        self.output.messages.push(Outbound::Fm { authority, message });
    }

    pub fn send_peer(&mut self, to: NodeId, message: PeerMessage) {
        self.output.messages.push(Outbound::Peer { to, message });
    }

    pub fn send_proxy(&mut self, ft: FailoverUnitId, request: ProxyRequest) {
        self.output.messages.push(Outbound::Proxy { ft, request });
    }

    pub fn reply_client(&mut self, reply: ClientReportFaultReply) {
        self.output.messages.push(Outbound::Client(reply));
    }

    /// Starts an asynchronous Hosting operation and returns its handle.
    pub fn begin_hosting(&mut self, owner: OperationOwner, request: HostingRequest) -> OperationId {
        *self.next_operation = self.next_operation.next();
        let op = *self.next_operation;
        self.output.effects.push(Effect::BeginHosting { op, owner, request });
        op
    }

    pub fn effect(&mut self, effect: Effect) {
        self.output.effects.push(effect);
    }

    pub fn health(&mut self, event: HealthEvent) {
        self.output.health.push(event);
    }

    pub fn into_output(self) -> RaOutput {
        self.output
    }
}
