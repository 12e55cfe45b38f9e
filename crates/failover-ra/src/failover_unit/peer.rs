//! Secondary side of reconfiguration, plus idle replica builds driven by
//! the primary.

use failover_types::{Epoch, NodeId, ReplicaInstance, ReplicaRole, ReplicaState};

use super::{FailoverUnit, PendingReply};
use crate::context::Context;
use crate::error::{ErrorCode, ErrorKind};
use crate::message::{
    CloseMode, ConfigurationBody, FmOutbound, GetLsnReplyBody, PeerMessage, ProxyRequest,
    ReplicaDescription, ReplicaMessageBody, ReplicaReplyBody, ReplicatorStatus,
    UpdateConfigurationKind,
};
use crate::replica::{MessageStage, Replica};

impl FailoverUnit {
    // ========================================================================
    // GetLSN
    // ========================================================================

    pub(crate) fn on_get_lsn(&mut self, cx: &mut Context<'_>, from: NodeId, body: &ReplicaMessageBody) {
        self.sender_node = Some((from, body.ft.cc));
        self.send_update_epoch(cx, body.ft.cc);
    }

    fn send_update_epoch(&mut self, cx: &mut Context<'_>, epoch: Epoch) {
        if let Some(local) = self.local_replica_mut() {
            local.message_stage = MessageStage::ProxyReplyPending;
        }
        cx.send_proxy(
            self.id,
            ProxyRequest::ReplicatorUpdateEpochAndGetStatus {
                instance: self.local_instance(),
                epoch,
            },
        );
    }

    pub(crate) fn on_update_epoch_reply(
        &mut self,
        cx: &mut Context<'_>,
        result: Result<ReplicatorStatus, ErrorKind>,
    ) {
        let Some((to, _)) = self.sender_node else {
            return;
        };
        let Some(mut replica) = self.local_description() else {
            return;
        };
        let error = match result {
            Ok(status) => {
                replica.first_lsn = Some(status.first_lsn);
                replica.last_lsn = Some(status.last_lsn);
                ErrorCode::Success
            }
            Err(ErrorKind::Cancelled) => return,
            Err(ErrorKind::Retryable) => {
                self.retry_required = true;
                return;
            }
            Err(_) => ErrorCode::NotReady,
        };

        self.sender_node = None;
        if let Some(local) = self.local_replica_mut() {
            local.message_stage = MessageStage::None;
        }
        cx.send_peer(
            to,
            PeerMessage::GetLsnReply(GetLsnReplyBody {
                ft: self.description(),
                replica,
                deactivation_info: self.deactivation_info,
                error,
            }),
        );
    }

    // ========================================================================
    // Deactivate / Activate
    // ========================================================================

    /// Adopts epochs, deactivation info and the local roles from the primary.
    fn adopt_peer_configuration(
        &mut self,
        cx: &Context<'_>,
        body: &ConfigurationBody,
        replace_remotes: bool,
    ) {
        if body.ft.cc >= self.cc_epoch {
            self.pc_epoch = body.ft.pc;
            self.cc_epoch = body.ft.cc;
        }
        if cx.config.reconfiguration.is_deactivation_info_enabled
            && self.deactivation_info_supported
            && body.deactivation_info.epoch > self.deactivation_info.epoch
        {
            self.deactivation_info = body.deactivation_info;
        }

        let local_node = self.local_node;
        if let (Some(desc), Some(local)) = (body.replica_on(local_node), self.replicas.get_mut(&local_node)) {
            local.pc_role = desc.pc_role;
            local.cc_role = desc.cc_role;
        }
        if !replace_remotes {
            return;
        }

        self.replicas
            .retain(|node, _| *node == local_node || body.replica_on(*node).is_some());
        for desc in body.replicas.iter().filter(|d| d.node != local_node) {
            match self.replicas.get_mut(&desc.node) {
                Some(replica) => replica.update_from_description(desc),
                None => {
                    self.replicas.insert(desc.node, Replica::from_description(desc));
                }
            }
        }
    }

    pub(crate) fn on_deactivate(
        &mut self,
        cx: &mut Context<'_>,
        from: NodeId,
        body: &ConfigurationBody,
        force: bool,
    ) {
        if force {
            let mode = if self.is_persisted() {
                CloseMode::Restart
            } else {
                CloseMode::Drop
            };
            tracing::info!(ft = %self.id, from = %from, ?mode, "forced deactivate closes local replica");
            self.start_close(cx, mode);
            return;
        }

        self.adopt_peer_configuration(cx, body, false);
        if let Some(reply) = self.reply_body(ErrorCode::Success) {
            cx.send_peer(from, PeerMessage::DeactivateReply(reply));
        }
    }

    pub(crate) fn on_activate(&mut self, cx: &mut Context<'_>, from: NodeId, body: &ConfigurationBody) {
        let previous = self.local_replica().map(|r| r.cc_role);
        self.adopt_peer_configuration(cx, body, true);
        let current = self.local_replica().map(|r| r.cc_role);

        if previous != current {
            tracing::info!(ft = %self.id, ?previous, ?current, "activate changes local role");
            self.pending_reply = Some(PendingReply::Activate { to: from });
            self.send_change_role(cx);
        } else if let Some(reply) = self.reply_body(ErrorCode::Success) {
            cx.send_peer(from, PeerMessage::ActivateReply(reply));
        }
    }

    fn send_change_role(&mut self, cx: &mut Context<'_>) {
        let Some(local) = self.local_replica_mut() else {
            return;
        };
        local.message_stage = MessageStage::ProxyReplyPending;
        let role = local.cc_role;
        cx.send_proxy(
            self.id,
            ProxyRequest::UpdateConfiguration {
                ft: self.description(),
                kind: UpdateConfigurationKind::ChangeRole(role),
                replicas: self.replica_descriptions(),
            },
        );
    }

    pub(crate) fn on_change_role_reply(&mut self, cx: &mut Context<'_>, result: Result<(), ErrorKind>) {
        if !matches!(self.pending_reply, Some(PendingReply::Activate { .. })) {
            return;
        }
        match result {
            Ok(()) => {
                if let Some(local) = self.local_replica_mut() {
                    local.message_stage = MessageStage::None;
                    if local.is_in_build() && local.is_in_cc() {
                        local.state = ReplicaState::Ready;
                    }
                }
                self.send_pending_reply(cx, ErrorCode::Success);
            }
            Err(ErrorKind::Cancelled) => {}
            Err(_) => self.retry_required = true,
        }
    }

    // ========================================================================
    // CreateReplica (target side)
    // ========================================================================

    /// CreateReplica for the instance this unit already hosts.
    pub(crate) fn on_create_replica(&mut self, cx: &mut Context<'_>, from: NodeId, body: &ReplicaMessageBody) {
        if body.replica.instance != self.local_instance() {
            return;
        }
        if self.local_open.is_opened() {
            if let Some(reply) = self.reply_body(ErrorCode::Success) {
                cx.send_peer(from, PeerMessage::CreateReplicaReply(reply));
            }
        } else {
            self.pending_reply = Some(PendingReply::CreateReplica { to: from });
        }
    }

    // ========================================================================
    // Idle Replica Builds (primary side)
    // ========================================================================

    fn send_replica_reply(
        &self,
        cx: &mut Context<'_>,
        replica: ReplicaDescription,
        error: ErrorCode,
        remove: bool,
    ) {
        let body = ReplicaReplyBody {
            ft: self.description(),
            replica,
            error,
        };
        let message = if remove {
            FmOutbound::RemoveReplicaReply(body)
        } else {
            FmOutbound::AddReplicaReply(body)
        };
        cx.send_fm(self.owner(), message);
    }

    fn create_replica_body(&self, replica: &Replica) -> ReplicaMessageBody {
        ReplicaMessageBody {
            ft: self.description(),
            service: self.service.clone(),
            replica: replica.to_description(),
        }
    }

    pub(crate) fn on_add_replica(&mut self, cx: &mut Context<'_>, body: &ReplicaMessageBody) {
        let desc = &body.replica;
        if desc.node == self.local_node {
            self.send_replica_reply(cx, desc.clone(), ErrorCode::InvalidReplicaOperation, false);
            return;
        }
        let is_primary = self
            .local_replica()
            .is_some_and(|r| r.cc_role == ReplicaRole::Primary);
        if !is_primary || !self.is_local_ready() {
            self.send_replica_reply(cx, desc.clone(), ErrorCode::NotReady, false);
            return;
        }

        match self.replicas.get(&desc.node) {
            Some(existing) if existing.instance == desc.instance => {
                if existing.is_ready() && !existing.is_pending() {
                    let reply = existing.to_description();
                    self.send_replica_reply(cx, reply, ErrorCode::Success, false);
                }
                return;
            }
            Some(existing) if existing.instance > desc.instance => {
                self.send_replica_reply(cx, desc.clone(), ErrorCode::StaleRequest, false);
                return;
            }
            _ => {}
        }

        let mut replica = Replica::from_description(desc);
        replica.pc_role = ReplicaRole::None;
        replica.cc_role = ReplicaRole::Idle;
        replica.state = ReplicaState::InCreate;
        replica.message_stage = MessageStage::RaReplyPending;
        let message = self.create_replica_body(&replica);
        tracing::info!(ft = %self.id, node = %desc.node, replica = %desc.instance, "building idle replica");
        self.replicas.insert(desc.node, replica);
        cx.send_peer(desc.node, PeerMessage::CreateReplica(message));
    }

    /// CreateReplicaReply from the target of an idle build.
    pub(crate) fn on_create_replica_reply(
        &mut self,
        cx: &mut Context<'_>,
        from: NodeId,
        body: &ReplicaReplyBody,
    ) {
        if from == self.local_node {
            return;
        }
        let Some(replica) = self.replicas.get_mut(&from) else {
            return;
        };
        if replica.instance != body.replica.instance
            || replica.cc_role != ReplicaRole::Idle
            || replica.message_stage != MessageStage::RaReplyPending
        {
            return;
        }

        if body.error.is_success() {
            replica.state = ReplicaState::InBuild;
            replica.message_stage = MessageStage::ProxyReplyPending;
            let desc = replica.to_description();
            cx.send_proxy(
                self.id,
                ProxyRequest::BuildIdleReplica {
                    ft: self.description(),
                    replica: desc,
                },
            );
        } else {
            tracing::info!(ft = %self.id, node = %from, error = ?body.error, "idle replica creation refused");
            self.replicas.remove(&from);
            self.send_replica_reply(cx, body.replica.clone(), body.error, false);
        }
    }

    fn find_remote_mut(&mut self, instance: ReplicaInstance) -> Option<&mut Replica> {
        let local_node = self.local_node;
        self.replicas
            .values_mut()
            .find(|r| r.node != local_node && r.instance == instance)
    }

    pub(crate) fn on_build_idle_reply(
        &mut self,
        cx: &mut Context<'_>,
        target: ReplicaInstance,
        result: Result<(), ErrorKind>,
    ) {
        let Some(replica) = self.find_remote_mut(target) else {
            return;
        };
        if replica.message_stage != MessageStage::ProxyReplyPending {
            return;
        }
        match result {
            Ok(()) => {
                replica.state = ReplicaState::Ready;
                replica.message_stage = MessageStage::None;
                let desc = replica.to_description();
                self.send_replica_reply(cx, desc, ErrorCode::Success, false);
            }
            Err(ErrorKind::Cancelled) => {}
            Err(ErrorKind::Retryable) => self.retry_required = true,
            Err(_) => {
                let node = replica.node;
                let desc = replica.to_description();
                self.replicas.remove(&node);
                self.send_replica_reply(cx, desc, ErrorCode::ReplicaOperationFailed, false);
            }
        }
    }

    pub(crate) fn on_remove_replica(&mut self, cx: &mut Context<'_>, body: &ReplicaMessageBody) {
        let desc = &body.replica;
        let local_node = self.local_node;
        match self.replicas.get_mut(&desc.node) {
            Some(replica) if desc.node != local_node && replica.instance <= desc.instance => {
                replica.replicator_remove_pending = true;
                let replica = replica.to_description();
                cx.send_proxy(
                    self.id,
                    ProxyRequest::RemoveIdleReplica {
                        ft: self.description(),
                        replica,
                    },
                );
            }
            _ => self.send_replica_reply(cx, desc.clone(), ErrorCode::Success, true),
        }
    }

    pub(crate) fn on_remove_idle_reply(
        &mut self,
        cx: &mut Context<'_>,
        target: ReplicaInstance,
        result: Result<(), ErrorKind>,
    ) {
        let Some(replica) = self.find_remote_mut(target) else {
            return;
        };
        if !replica.replicator_remove_pending {
            return;
        }
        match result {
            Ok(()) => {
                let node = replica.node;
                let desc = replica.to_description();
                self.replicas.remove(&node);
                self.send_replica_reply(cx, desc, ErrorCode::Success, true);
            }
            Err(ErrorKind::Cancelled) => {}
            Err(_) => self.retry_required = true,
        }
    }

    // ========================================================================
    // Retry
    // ========================================================================

    /// Re-sends peer-side requests and idle builds still in flight.
    pub(crate) fn retry_peer_work(&mut self, cx: &mut Context<'_>) {
        if let Some((_, epoch)) = self.sender_node {
            self.send_update_epoch(cx, epoch);
        }
        if matches!(self.pending_reply, Some(PendingReply::Activate { .. })) {
            self.send_change_role(cx);
        }

        let ft = self.description();
        let local_node = self.local_node;
        for replica in self.replicas.values().filter(|r| r.node != local_node) {
            if replica.replicator_remove_pending {
                cx.send_proxy(
                    self.id,
                    ProxyRequest::RemoveIdleReplica {
                        ft,
                        replica: replica.to_description(),
                    },
                );
                continue;
            }
            if replica.cc_role != ReplicaRole::Idle {
                continue;
            }
            match replica.message_stage {
                MessageStage::RaReplyPending => {
                    cx.send_peer(replica.node, PeerMessage::CreateReplica(self.create_replica_body(replica)));
                }
                MessageStage::ProxyReplyPending => cx.send_proxy(
                    self.id,
                    ProxyRequest::BuildIdleReplica {
                        ft,
                        replica: replica.to_description(),
                    },
                ),
                MessageStage::None => {}
            }
        }
    }
}
