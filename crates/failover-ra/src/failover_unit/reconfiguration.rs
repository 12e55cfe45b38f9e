//! Primary side of reconfiguration.
//!
//! Stages advance only from reply handlers and the retry timer. Each stage
//! has a send step (`run_phase`) and a progress check that moves to the next
//! stage once its exit condition holds.

use std::time::Duration;

use failover_types::{DeactivationInfo, Epoch, NodeId, ReplicaRole, ReplicaState};

use super::FailoverUnit;
use super::primary_selection::{self, Candidate, SelectionInput};
use crate::context::Context;
use crate::error::{ErrorCode, ErrorKind};
use crate::instrumentation::METRICS;
use crate::message::{
    CatchupOutcome, CloseMode, ConfigurationBody, ConfigurationReplyBody, FmOutbound,
    GetLsnReplyBody, PeerMessage, ProxyRequest, ReplicaDescription, ReplicaMessageBody,
    ReplicaReplyBody, ReplicatorStatus, UpdateConfigurationKind,
};
use crate::output::{HealthEvent, HealthLevel, HealthProperty};
use crate::reconfiguration_state::{
    ReconfigurationResult, ReconfigurationStage, ReconfigurationType, WaitReason,
};
use crate::replica::{LsnState, MessageStage, Replica};

/// Per-configuration progress of a phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct QuorumCounts {
    replicas: usize,
    completed: usize,
    up_waiting: usize,
    down_waiting: usize,
}

impl QuorumCounts {
    fn read_quorum(&self) -> usize {
        (self.replicas + 1) / 2
    }

    fn is_below_read_quorum(&self) -> bool {
        self.replicas > 0 && self.completed < self.read_quorum()
    }
}

fn is_deactivation_target(r: &Replica) -> bool {
    r.is_up
        && r.state != ReplicaState::InCreate
        && !r.to_be_restarted
        && (!r.is_in_build() || r.to_be_deactivated)
}

impl FailoverUnit {
    // ========================================================================
    // Wire Helpers
    // ========================================================================

    pub(crate) fn configuration_body(&self) -> ConfigurationBody {
        ConfigurationBody {
            ft: self.description(),
            service: self.service.clone(),
            replicas: self.replica_descriptions(),
            deactivation_info: self.deactivation_info,
            phase0_duration: None,
        }
    }

    fn configuration_reply(&self) -> ConfigurationReplyBody {
        ConfigurationReplyBody {
            ft: self.description(),
            replicas: self.replica_descriptions(),
            error: ErrorCode::Success,
        }
    }

    /// Replica set handed to the replicator. Restarting and dropped
    /// replicas are excluded.
    fn replication_configuration(&self) -> Vec<ReplicaDescription> {
        self.replicas
            .values()
            .filter(|r| {
                !r.is_dropped()
                    && !r.to_be_restarted
                    && (r.node == self.local_node || r.is_in_configuration())
            })
            .map(Replica::to_description)
            .collect()
    }

    fn set_local_stage(&mut self, stage: MessageStage) {
        if let Some(local) = self.local_replica_mut() {
            local.message_stage = stage;
        }
    }

    fn local_stage(&self) -> MessageStage {
        self.local_replica()
            .map_or(MessageStage::None, |r| r.message_stage)
    }

    fn wait(&mut self, reason: WaitReason) {
        self.reconfig.wait_reason = Some(reason);
    }

    fn enter_phase(&mut self, cx: &mut Context<'_>, stage: ReconfigurationStage) {
        tracing::debug!(ft = %self.id, from = %self.reconfig.stage, to = %stage, "reconfiguration phase");
        self.reconfig.enter_phase(stage, cx.now);
        self.run_phase(cx);
    }

    // ========================================================================
    // DoReconfiguration
    // ========================================================================

    /// Handles DoReconfiguration from FM, and the swap-primary hand-off from
    /// the demoted primary.
    pub(crate) fn on_do_reconfiguration(&mut self, cx: &mut Context<'_>, body: &ConfigurationBody) {
        if body.ft.cc == self.cc_epoch {
            if self.reconfig.is_reconfiguring() {
                self.retry_reconfiguration(cx);
            } else {
                self.resend_reconfiguration_result(cx);
            }
            return;
        }

        match self.reconfig.stage {
            ReconfigurationStage::AbortPhase0Demote => return,
            ReconfigurationStage::Phase0Demote => {
                tracing::info!(ft = %self.id, epoch = %body.ft.cc, "newer configuration aborts swap primary");
                self.reconfig.enter_phase(ReconfigurationStage::AbortPhase0Demote, cx.now);
                self.run_phase(cx);
                return;
            }
            _ => {}
        }

        let kind = self.reconfiguration_type(body);
        let was_primary = self
            .local_replica()
            .is_some_and(|r| r.cc_role == ReplicaRole::Primary);
        let data_loss_mode = self
            .data_loss_version_to_report
            .is_some_and(|reported| body.ft.cc.data_loss_version > reported);

        self.adopt_configuration(body);

        let stays_primary = self
            .local_replica()
            .is_some_and(|r| r.cc_role == ReplicaRole::Primary);
        let stage = match kind {
            ReconfigurationType::SwapPrimary if was_primary && !stays_primary => {
                ReconfigurationStage::Phase0Demote
            }
            ReconfigurationType::Failover => ReconfigurationStage::Phase1GetLsn,
            _ => ReconfigurationStage::Phase2Catchup,
        };

        self.reconfig.start(kind, stage, cx.now);
        self.reconfig.phase0_duration = body.phase0_duration;
        self.reconfig.data_loss_mode = data_loss_mode;
        METRICS.increment_reconfigurations_started();
        tracing::info!(
            ft = %self.id,
            epoch = %self.cc_epoch,
            ?kind,
            %stage,
            data_loss_mode,
            "reconfiguration started"
        );
        self.run_phase(cx);
    }

    /// Classifies a reconfiguration before the new epochs are adopted.
    fn reconfiguration_type(&self, body: &ConfigurationBody) -> ReconfigurationType {
        let local_new = body
            .replica_on(self.local_node)
            .map_or(ReplicaRole::None, |r| r.cc_role);
        let local = self.local_replica();
        let local_current = local.map_or(ReplicaRole::None, |r| r.cc_role);
        let primary_changes = body.pc_primary() != body.cc_primary();
        let last = self.reconfig.last_result;

        if body.phase0_duration.is_some() {
            return ReconfigurationType::SwapPrimary;
        }
        if primary_changes
            && local_new == ReplicaRole::Secondary
            && local_current == ReplicaRole::Primary
        {
            return ReconfigurationType::SwapPrimary;
        }
        if !primary_changes {
            return ReconfigurationType::Other;
        }
        if last == Some(ReconfigurationResult::AbortSwapPrimary) {
            return ReconfigurationType::Other;
        }
        // A failover superseded mid-flight already adopted the primary role.
        if self.reconfig.kind == ReconfigurationType::Failover {
            return ReconfigurationType::Failover;
        }
        let ready_primary = local.is_some_and(|r| r.is_ready() && r.cc_role == ReplicaRole::Primary);
        if ready_primary
            && local_new == ReplicaRole::Primary
            && last != Some(ReconfigurationResult::ChangeConfiguration)
        {
            return ReconfigurationType::Other;
        }
        ReconfigurationType::Failover
    }

    fn adopt_configuration(&mut self, body: &ConfigurationBody) {
        self.pc_epoch = body.ft.pc;
        self.cc_epoch = body.ft.cc;
        self.sender_node = None;

        let local_node = self.local_node;
        self.replicas
            .retain(|node, _| *node == local_node || body.replica_on(*node).is_some());

        for desc in &body.replicas {
            if desc.node == local_node {
                if let Some(local) = self.replicas.get_mut(&local_node) {
                    local.pc_role = desc.pc_role;
                    local.cc_role = desc.cc_role;
                }
                continue;
            }
            match self.replicas.get_mut(&desc.node) {
                Some(replica) if replica.instance > desc.instance => {
                    replica.pc_role = desc.pc_role;
                    replica.cc_role = desc.cc_role;
                }
                Some(replica) => replica.update_from_description(desc),
                None => {
                    self.replicas
                        .insert(desc.node, Replica::from_description(desc));
                }
            }
        }

        for replica in self.replicas.values_mut() {
            if replica.node == local_node || replica.is_in_configuration() {
                replica.clear_reconfiguration_state();
            }
            if replica.node != local_node && replica.is_in_build() && replica.is_in_cc() {
                replica.state = ReplicaState::StandBy;
            }
        }
    }

    /// FM repeated a DoReconfiguration for an epoch that already finished.
    fn resend_reconfiguration_result(&mut self, cx: &mut Context<'_>) {
        let owner = self.owner();
        match self.reconfig.last_result {
            Some(ReconfigurationResult::Completed) => {
                cx.send_fm(owner, FmOutbound::DoReconfigurationReply(self.configuration_reply()));
            }
            Some(ReconfigurationResult::ChangeConfiguration) => {
                cx.send_fm(owner, FmOutbound::ChangeConfiguration(self.configuration_reply()));
            }
            Some(ReconfigurationResult::DemoteCompleted) => {
                if let Some(to) = self.remote_cc_primary() {
                    let mut body = self.configuration_body();
                    body.phase0_duration = Some(Duration::ZERO);
                    cx.send_peer(to, PeerMessage::ContinueSwapPrimary(body));
                }
            }
            Some(ReconfigurationResult::AbortSwapPrimary) | None => {}
        }
    }

    fn remote_cc_primary(&self) -> Option<NodeId> {
        self.replicas
            .values()
            .find(|r| r.node != self.local_node && r.cc_role == ReplicaRole::Primary)
            .map(|r| r.node)
    }

    fn run_phase(&mut self, cx: &mut Context<'_>) {
        match self.reconfig.stage {
            ReconfigurationStage::None => {}
            ReconfigurationStage::Phase0Demote => self.send_demote(cx),
            ReconfigurationStage::AbortPhase0Demote => self.send_cancel_catchup(cx),
            ReconfigurationStage::Phase1GetLsn => {
                self.send_get_lsn(cx);
                self.check_get_lsn_progress(cx);
            }
            ReconfigurationStage::Phase2Catchup => self.send_catchup(cx),
            ReconfigurationStage::Phase3Deactivate => self.start_deactivate(cx),
            ReconfigurationStage::Phase4Activate => self.start_activate(cx),
        }
    }

    // ========================================================================
    // Phase 0: Demote
    // ========================================================================

    fn send_demote(&mut self, cx: &mut Context<'_>) {
        self.set_local_stage(MessageStage::ProxyReplyPending);
        self.wait(WaitReason::LocalReplicaNotReplied);
        cx.send_proxy(
            self.id,
            ProxyRequest::UpdateConfiguration {
                ft: self.description(),
                kind: UpdateConfigurationKind::SwapPrimaryDemote,
                replicas: self.replication_configuration(),
            },
        );
    }

    fn finish_demote(&mut self, cx: &mut Context<'_>) {
        let duration = self.reconfig.phase_elapsed(cx.now);
        self.set_local_stage(MessageStage::None);

        let mut body = self.configuration_body();
        body.phase0_duration = Some(duration);
        if let Some(to) = self.remote_cc_primary() {
            cx.send_peer(to, PeerMessage::ContinueSwapPrimary(body));
        }

        tracing::info!(ft = %self.id, epoch = %self.cc_epoch, phase0_ms = duration.as_millis() as u64, "swap primary demote completed");
        self.finish_reconfiguration(cx, ReconfigurationResult::DemoteCompleted);
        METRICS.increment_reconfigurations_completed();
    }

    fn send_cancel_catchup(&mut self, cx: &mut Context<'_>) {
        self.wait(WaitReason::AbortPending);
        cx.send_proxy(
            self.id,
            ProxyRequest::CancelCatchupReplicaSet {
                instance: self.local_instance(),
            },
        );
    }

    pub(crate) fn on_cancel_catchup_reply(
        &mut self,
        cx: &mut Context<'_>,
        result: Result<(), ErrorKind>,
    ) {
        if self.reconfig.stage != ReconfigurationStage::AbortPhase0Demote {
            return;
        }
        match result {
            Ok(()) => {
                tracing::info!(ft = %self.id, "swap primary aborted");
                self.revert_configuration(cx, ReconfigurationResult::AbortSwapPrimary);
            }
            Err(ErrorKind::DemoteCompleted) => self.finish_demote(cx),
            Err(ErrorKind::Cancelled) => {}
            Err(_) => self.retry_required = true,
        }
    }

    // ========================================================================
    // Phase 1: GetLSN
    // ========================================================================

    fn send_get_lsn(&mut self, cx: &mut Context<'_>) {
        let ft = self.description();
        let local_node = self.local_node;
        let mut requests = Vec::new();
        for replica in self.replicas.values_mut() {
            if replica.node == local_node
                || !replica.is_up
                || replica.is_dropped()
                || !replica.is_in_configuration()
                || replica.lsn != LsnState::Unset
            {
                continue;
            }
            replica.message_stage = MessageStage::RaReplyPending;
            requests.push((replica.node, replica.to_description()));
        }
        for (to, replica) in requests {
            cx.send_peer(
                to,
                PeerMessage::GetLsn(ReplicaMessageBody {
                    ft,
                    service: self.service.clone(),
                    replica,
                }),
            );
        }

        if self
            .local_replica()
            .is_some_and(|r| r.lsn == LsnState::Unset)
        {
            self.set_local_stage(MessageStage::ProxyReplyPending);
            cx.send_proxy(
                self.id,
                ProxyRequest::ReplicatorGetStatus {
                    instance: self.local_instance(),
                },
            );
        }
    }

    pub(crate) fn on_get_lsn_reply(
        &mut self,
        cx: &mut Context<'_>,
        from: NodeId,
        body: &GetLsnReplyBody,
    ) {
        if self.reconfig.stage != ReconfigurationStage::Phase1GetLsn || from == self.local_node {
            return;
        }
        let Some(replica) = self.replicas.get_mut(&from) else {
            return;
        };
        if replica.instance != body.replica.instance {
            return;
        }
        replica.lsn = match (body.error, body.replica.first_lsn, body.replica.last_lsn) {
            (ErrorCode::Success, Some(first), Some(last)) => LsnState::Known { first, last },
            _ => LsnState::Unknown,
        };
        replica.deactivation_info = body.deactivation_info;
        replica.message_stage = MessageStage::None;
        self.check_get_lsn_progress(cx);
    }

    /// Local replicator status for phase 1.
    pub(crate) fn on_replicator_status(
        &mut self,
        cx: &mut Context<'_>,
        result: Result<ReplicatorStatus, ErrorKind>,
    ) {
        if self.reconfig.stage != ReconfigurationStage::Phase1GetLsn {
            return;
        }
        let lsn = match result {
            Ok(status) => LsnState::Known {
                first: status.first_lsn,
                last: status.last_lsn,
            },
            Err(ErrorKind::Cancelled) => return,
            Err(ErrorKind::Retryable) => {
                self.retry_required = true;
                return;
            }
            Err(_) => LsnState::Unknown,
        };
        if let Some(local) = self.local_replica_mut() {
            local.lsn = lsn;
            local.message_stage = MessageStage::None;
        }
        self.check_get_lsn_progress(cx);
    }

    fn quorum_counts(&self, in_config: impl Fn(&Replica) -> bool) -> QuorumCounts {
        let mut counts = QuorumCounts::default();
        for replica in self.replicas.values().filter(|r| !r.is_dropped() && in_config(r)) {
            counts.replicas += 1;
            match (replica.lsn, replica.is_up) {
                (LsnState::Unset, true) => counts.up_waiting += 1,
                (LsnState::Unset, false) => counts.down_waiting += 1,
                _ => counts.completed += 1,
            }
        }
        counts
    }

    fn check_get_lsn_progress(&mut self, cx: &mut Context<'_>) {
        if self.reconfig.stage != ReconfigurationStage::Phase1GetLsn {
            return;
        }
        if self
            .local_replica()
            .is_none_or(|r| r.lsn == LsnState::Unset)
        {
            self.wait(WaitReason::LocalReplicaNotReplied);
            return;
        }

        let pc = self.quorum_counts(Replica::is_in_pc);
        let cc = self.quorum_counts(Replica::is_in_cc);
        let up_waiting = pc.up_waiting + cc.up_waiting;

        if up_waiting > 0
            && self.reconfig.phase_elapsed(cx.now)
                < cx.config.timing.remote_replica_progress_query_wait()
        {
            self.wait(WaitReason::WaitingForGetLsn);
            return;
        }
        if (pc.is_below_read_quorum() || cc.is_below_read_quorum()) && up_waiting > 0 {
            self.wait(WaitReason::WaitingForReadQuorum);
            return;
        }

        if self.reconfig.kind != ReconfigurationType::SwapPrimary && !self.reconfig.data_loss_mode {
            let cc_data_loss = self.cc_epoch.data_loss_version;
            let reported = self
                .data_loss_version_to_report
                .is_some_and(|v| v >= cc_data_loss);
            let data_loss = (pc.is_below_read_quorum()
                && cc_data_loss == self.pc_epoch.data_loss_version)
                || (cc.is_below_read_quorum() && !reported);
            if data_loss {
                tracing::debug!(ft = %self.id, ?pc, ?cc, "read quorum lost");
                self.report_data_loss(cx, false);
                return;
            }
        }

        self.select_new_primary(cx);
    }

    fn report_data_loss(&mut self, cx: &mut Context<'_>, resend: bool) {
        let version = self.cc_epoch.data_loss_version;
        self.wait(WaitReason::DataLossReported);
        if !resend && self.data_loss_version_to_report == Some(version) {
            return;
        }
        self.data_loss_version_to_report = Some(version);
        tracing::warn!(ft = %self.id, epoch = %self.cc_epoch, "reporting data loss");
        cx.send_fm(self.owner(), FmOutbound::DataLossReport(self.configuration_reply()));
    }

    fn select_new_primary(&mut self, cx: &mut Context<'_>) {
        let Some((local_first, local_last)) = self
            .local_replica()
            .and_then(|r| Some((r.lsn.first()?, r.lsn.last()?)))
        else {
            let mode = if self.is_persisted() {
                CloseMode::Restart
            } else {
                CloseMode::Drop
            };
            tracing::warn!(ft = %self.id, ?mode, "local replica reported no progress; closing it");
            self.start_close(cx, mode);
            return;
        };

        let deactivation_enabled =
            cx.config.reconfiguration.is_deactivation_info_enabled && self.deactivation_info_supported;
        let candidates: Vec<Candidate> = self
            .replicas
            .values()
            .filter(|r| !r.is_dropped() && (r.node == self.local_node || r.is_in_configuration()))
            .map(|r| {
                let info = if r.node == self.local_node {
                    self.deactivation_info
                } else {
                    r.deactivation_info
                };
                Candidate {
                    node: r.node,
                    is_up: r.is_up,
                    lsn: r.lsn,
                    deactivation_info: info,
                    supports_deactivation_info: deactivation_enabled && info.is_valid(),
                }
            })
            .collect();

        let pick = primary_selection::select_primary(&SelectionInput {
            candidates: &candidates,
            local: self.local_node,
            is_failover: self.reconfig.kind == ReconfigurationType::Failover,
            data_loss: self.reconfig.data_loss_mode,
        });

        if let Some(winner) = pick.filter(|n| *n != self.local_node) {
            tracing::info!(ft = %self.id, winner = %winner, "another replica is a better primary");
            cx.send_fm(self.owner(), FmOutbound::ChangeConfiguration(self.configuration_reply()));
            self.revert_configuration(cx, ReconfigurationResult::ChangeConfiguration);
            return;
        }

        self.restart_replicas_without_catchup(cx, |r| {
            primary_selection::lacks_catchup_capability(local_first, local_last, r.lsn)
        });
        self.enter_phase(cx, ReconfigurationStage::Phase2Catchup);
    }

    /// Marks matching up, ready, in-configuration remotes for restart and
    /// sends them a forced Deactivate.
    fn restart_replicas_without_catchup(
        &mut self,
        cx: &mut Context<'_>,
        lacks_catchup: impl Fn(&Replica) -> bool,
    ) {
        let body = self.configuration_body();
        let local_node = self.local_node;
        let mut targets = Vec::new();
        for replica in self.replicas.values_mut() {
            if replica.node != local_node
                && replica.is_up
                && replica.is_in_cc()
                && replica.is_ready()
                && !replica.to_be_restarted
                && lacks_catchup(replica)
            {
                replica.to_be_restarted = true;
                targets.push(replica.node);
            }
        }
        for to in targets {
            tracing::info!(ft = %self.id, node = %to, "restarting replica that cannot be caught up");
            cx.send_peer(
                to,
                PeerMessage::Deactivate {
                    body: body.clone(),
                    force: true,
                },
            );
        }
    }

    /// Abandons the reconfiguration and falls back to the previous
    /// configuration. The current epoch is kept.
    fn revert_configuration(&mut self, cx: &mut Context<'_>, result: ReconfigurationResult) {
        let local_node = self.local_node;
        self.replicas
            .retain(|node, r| *node == local_node || r.pc_role != ReplicaRole::Idle);
        for replica in self.replicas.values_mut() {
            replica.cc_role = replica.pc_role;
            replica.pc_role = ReplicaRole::None;
            replica.ic_role = ReplicaRole::None;
            replica.clear_reconfiguration_state();
        }
        self.pc_epoch = Epoch::INVALID;
        self.ic_epoch = Epoch::INVALID;
        self.finish_reconfiguration(cx, result);
        METRICS.increment_reconfigurations_aborted();
    }

    fn finish_reconfiguration(&mut self, cx: &mut Context<'_>, result: ReconfigurationResult) {
        if self.reconfig.finish(result) {
            cx.health(self.stuck_health(HealthLevel::Ok));
        }
    }

    // ========================================================================
    // Phase 2: Catchup
    // ========================================================================

    fn send_catchup(&mut self, cx: &mut Context<'_>) {
        self.set_local_stage(MessageStage::ProxyReplyPending);
        self.wait(WaitReason::CatchupPending);
        cx.send_proxy(
            self.id,
            ProxyRequest::UpdateConfiguration {
                ft: self.description(),
                kind: UpdateConfigurationKind::Catchup,
                replicas: self.replication_configuration(),
            },
        );
    }

    fn on_catchup_reply(&mut self, cx: &mut Context<'_>, result: Result<CatchupOutcome, ErrorKind>) {
        match result {
            Ok(outcome) => {
                self.deactivation_info = DeactivationInfo::new(self.cc_epoch, outcome.last_acked_lsn);
                self.set_local_stage(MessageStage::None);
                self.enter_phase(cx, ReconfigurationStage::Phase3Deactivate);
            }
            Err(ErrorKind::StateChangedOnDataLoss) => {
                tracing::info!(ft = %self.id, "replica state changed on data loss; restarting secondaries");
                self.restart_replicas_without_catchup(cx, |_| true);
                self.retry_required = true;
            }
            Err(ErrorKind::Cancelled) => {}
            Err(_) => self.retry_required = true,
        }
    }

    /// Routes an UpdateConfiguration reply from the proxy.
    pub(crate) fn on_update_configuration_reply(
        &mut self,
        cx: &mut Context<'_>,
        kind: UpdateConfigurationKind,
        result: Result<CatchupOutcome, ErrorKind>,
    ) {
        let stage = self.reconfig.stage;
        match kind {
            UpdateConfigurationKind::ChangeRole(_) => {
                self.on_change_role_reply(cx, result.map(|_| ()));
            }
            UpdateConfigurationKind::SwapPrimaryDemote => {
                if !matches!(
                    stage,
                    ReconfigurationStage::Phase0Demote | ReconfigurationStage::AbortPhase0Demote
                ) {
                    return;
                }
                match result {
                    Ok(_) | Err(ErrorKind::DemoteCompleted) => self.finish_demote(cx),
                    Err(ErrorKind::Cancelled) => {}
                    Err(_) => self.retry_required = true,
                }
            }
            UpdateConfigurationKind::Catchup => {
                if stage == ReconfigurationStage::Phase2Catchup {
                    self.on_catchup_reply(cx, result);
                }
            }
            UpdateConfigurationKind::EndReconfiguration => {
                if stage != ReconfigurationStage::Phase4Activate {
                    return;
                }
                match result {
                    Ok(_) => {
                        self.update_replicator_pending = false;
                        self.set_local_stage(MessageStage::None);
                        self.check_activate_progress(cx);
                    }
                    Err(ErrorKind::Cancelled) => {}
                    Err(_) => self.retry_required = true,
                }
            }
        }
    }

    // ========================================================================
    // Phase 3: Deactivate
    // ========================================================================

    fn start_deactivate(&mut self, cx: &mut Context<'_>) {
        let unchanged = self.replicas.values().all(|r| r.pc_role == r.cc_role);
        if cx.config.reconfiguration.enable_phase3_phase4_in_parallel && unchanged {
            self.enter_phase(cx, ReconfigurationStage::Phase4Activate);
            return;
        }

        self.ic_epoch = self.cc_epoch;
        for replica in self.replicas.values_mut() {
            replica.ic_role = replica.cc_role;
        }

        let local_node = self.local_node;
        let mut targets = Vec::new();
        for replica in self.replicas.values_mut() {
            if replica.node != local_node
                && !replica.is_dropped()
                && replica.is_in_pc()
                && is_deactivation_target(replica)
            {
                replica.message_stage = MessageStage::RaReplyPending;
                targets.push(replica.node);
            }
        }
        self.send_deactivate_to(cx, &targets);
        self.check_deactivate_progress(cx);
    }

    fn send_deactivate_to(&self, cx: &mut Context<'_>, targets: &[NodeId]) {
        if targets.is_empty() {
            return;
        }
        let body = self.configuration_body();
        for to in targets {
            cx.send_peer(
                *to,
                PeerMessage::Deactivate {
                    body: body.clone(),
                    force: false,
                },
            );
        }
    }

    pub(crate) fn on_deactivate_reply(
        &mut self,
        cx: &mut Context<'_>,
        from: NodeId,
        body: &ReplicaReplyBody,
    ) {
        if self.reconfig.stage != ReconfigurationStage::Phase3Deactivate {
            return;
        }
        if !self.clear_remote_stage(from, body) {
            return;
        }
        self.check_deactivate_progress(cx);
    }

    fn clear_remote_stage(&mut self, from: NodeId, body: &ReplicaReplyBody) -> bool {
        if from == self.local_node {
            return false;
        }
        match self.replicas.get_mut(&from) {
            Some(replica)
                if replica.instance == body.replica.instance
                    && replica.message_stage == MessageStage::RaReplyPending =>
            {
                replica.message_stage = MessageStage::None;
                true
            }
            _ => false,
        }
    }

    fn check_deactivate_progress(&mut self, cx: &mut Context<'_>) {
        let local_node = self.local_node;
        let pc: Vec<&Replica> = self
            .replicas
            .values()
            .filter(|r| !r.is_dropped() && r.is_in_pc())
            .collect();
        let completed = pc
            .iter()
            .filter(|r| r.node == local_node || (is_deactivation_target(r) && !r.is_pending()))
            .count();
        let quorum = QuorumCounts {
            replicas: pc.len(),
            completed,
            ..QuorumCounts::default()
        };
        let up_waiting = self
            .replicas
            .values()
            .any(|r| r.node != local_node && r.is_up && r.is_pending());

        if up_waiting || quorum.is_below_read_quorum() {
            self.wait(WaitReason::DeactivatePending);
            return;
        }
        self.enter_phase(cx, ReconfigurationStage::Phase4Activate);
    }

    // ========================================================================
    // Phase 4: Activate
    // ========================================================================

    fn start_activate(&mut self, cx: &mut Context<'_>) {
        self.ic_epoch = self.cc_epoch;
        let local_node = self.local_node;
        let mut targets = Vec::new();
        for replica in self.replicas.values_mut() {
            replica.ic_role = replica.cc_role;
            if replica.node != local_node
                && !replica.is_dropped()
                && replica.is_in_cc()
                && replica.is_up
                && !replica.to_be_restarted
            {
                replica.message_stage = MessageStage::RaReplyPending;
                targets.push(replica.node);
            }
        }
        if self
            .local_replica()
            .is_some_and(|r| r.cc_role == ReplicaRole::Primary)
        {
            self.set_local_stage(MessageStage::ProxyReplyPending);
        }

        self.send_activate_to(cx, &targets);
        self.check_activate_progress(cx);
    }

    fn send_activate_to(&self, cx: &mut Context<'_>, targets: &[NodeId]) {
        if targets.is_empty() {
            return;
        }
        let body = self.configuration_body();
        for to in targets {
            cx.send_peer(*to, PeerMessage::Activate(body.clone()));
        }
    }

    fn send_end_reconfiguration(&mut self, cx: &mut Context<'_>) {
        self.update_replicator_pending = true;
        cx.send_proxy(
            self.id,
            ProxyRequest::UpdateConfiguration {
                ft: self.description(),
                kind: UpdateConfigurationKind::EndReconfiguration,
                replicas: self.replication_configuration(),
            },
        );
    }

    pub(crate) fn on_activate_reply(
        &mut self,
        cx: &mut Context<'_>,
        from: NodeId,
        body: &ReplicaReplyBody,
    ) {
        if self.reconfig.stage != ReconfigurationStage::Phase4Activate {
            return;
        }
        if !self.clear_remote_stage(from, body) {
            return;
        }
        self.check_activate_progress(cx);
    }

    fn check_activate_progress(&mut self, cx: &mut Context<'_>) {
        let local_node = self.local_node;
        let remotes = || self.replicas.values().filter(|r| r.node != local_node);
        let up_ready_pending = remotes().any(|r| r.is_pending() && r.is_up && r.is_ready());
        let remote_pending = remotes().any(Replica::is_pending);
        let local_pending = self.local_stage() == MessageStage::ProxyReplyPending;

        if !up_ready_pending && local_pending && !self.update_replicator_pending {
            self.send_end_reconfiguration(cx);
        }

        if remote_pending {
            self.wait(WaitReason::ReplicaPending);
        } else if local_pending || self.update_replicator_pending {
            self.wait(WaitReason::ReplicatorConfigurationUpdatePending);
        } else {
            self.complete_reconfiguration(cx);
        }
    }

    fn complete_reconfiguration(&mut self, cx: &mut Context<'_>) {
        let local_node = self.local_node;
        self.replicas.retain(|node, r| {
            *node == local_node
                || r.is_in_cc()
                || (r.cc_role == ReplicaRole::Idle && r.is_up && (r.is_ready() || r.is_in_build()))
        });
        for replica in self.replicas.values_mut() {
            replica.pc_role = ReplicaRole::None;
            replica.ic_role = ReplicaRole::None;
            if replica.cc_role != ReplicaRole::Idle {
                replica.clear_reconfiguration_state();
            }
        }
        self.pc_epoch = Epoch::INVALID;
        self.ic_epoch = Epoch::INVALID;

        let elapsed = self.reconfig.total_elapsed(cx.now);
        cx.send_fm(self.owner(), FmOutbound::DoReconfigurationReply(self.configuration_reply()));
        self.finish_reconfiguration(cx, ReconfigurationResult::Completed);
        METRICS.increment_reconfigurations_completed();
        tracing::info!(ft = %self.id, epoch = %self.cc_epoch, elapsed_ms = elapsed.as_millis() as u64, "reconfiguration completed");
    }

    // ========================================================================
    // Retry And Health
    // ========================================================================

    /// Re-sends the requests the current stage is waiting on.
    pub(crate) fn retry_reconfiguration(&mut self, cx: &mut Context<'_>) {
        let local_node = self.local_node;
        let pending_up: Vec<NodeId> = self
            .replicas
            .values()
            .filter(|r| r.node != local_node && r.is_up && r.message_stage == MessageStage::RaReplyPending)
            .map(|r| r.node)
            .collect();

        match self.reconfig.stage {
            ReconfigurationStage::None => return,
            ReconfigurationStage::Phase0Demote => self.send_demote(cx),
            ReconfigurationStage::AbortPhase0Demote => self.send_cancel_catchup(cx),
            ReconfigurationStage::Phase1GetLsn => {
                self.send_get_lsn(cx);
                if self.reconfig.wait_reason == Some(WaitReason::DataLossReported) {
                    self.report_data_loss(cx, true);
                } else {
                    self.check_get_lsn_progress(cx);
                }
            }
            ReconfigurationStage::Phase2Catchup => self.send_catchup(cx),
            ReconfigurationStage::Phase3Deactivate => {
                self.send_deactivate_to(cx, &pending_up);
                self.check_deactivate_progress(cx);
            }
            ReconfigurationStage::Phase4Activate => {
                self.send_activate_to(cx, &pending_up);
                if self.update_replicator_pending {
                    self.send_end_reconfiguration(cx);
                }
                self.check_activate_progress(cx);
            }
        }
        self.check_reconfiguration_health(cx);
    }

    fn check_reconfiguration_health(&mut self, cx: &mut Context<'_>) {
        if !self.reconfig.is_reconfiguring() || self.reconfig.health_reported {
            return;
        }
        let elapsed = self.reconfig.total_elapsed(cx.now);
        if elapsed < cx.config.timing.reconfiguration_health_report_threshold() {
            return;
        }
        self.reconfig.health_reported = true;
        METRICS.increment_health_warnings();
        tracing::warn!(
            ft = %self.id,
            stage = %self.reconfig.stage,
            wait = ?self.reconfig.wait_reason,
            elapsed_ms = elapsed.as_millis() as u64,
            "reconfiguration stuck"
        );
        cx.health(self.stuck_health(HealthLevel::Warning));
    }

    fn stuck_health(&self, level: HealthLevel) -> HealthEvent {
        HealthEvent {
            ft: self.id,
            property: HealthProperty::ReconfigurationStuck,
            level,
            detail: format!(
                "{} waiting on {:?} in epoch {}",
                self.reconfig.stage, self.reconfig.wait_reason, self.cc_epoch
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::ready_unit;
    use super::*;
    use failover_config::RaConfig;
    use failover_types::{FailoverUnitId, Lsn, OperationId, ReplicaInstance, Timestamp};

    use crate::message::FailoverUnitDescription;
    use crate::output::RaOutput;

    fn step(
        config: &RaConfig,
        now: u64,
        ft: &mut FailoverUnit,
        f: impl FnOnce(&mut FailoverUnit, &mut Context<'_>),
    ) -> RaOutput {
        let mut next = OperationId::new(0);
        let mut cx = Context::new(ft.local_node, config, Timestamp::from_millis(now), &mut next);
        f(ft, &mut cx);
        cx.into_output()
    }

    fn desc(node: u64, pc: ReplicaRole, cc: ReplicaRole, up: bool) -> ReplicaDescription {
        ReplicaDescription::new(
            NodeId::new(node),
            ReplicaInstance::new(node, 1),
            cc,
            if up { ReplicaState::Ready } else { ReplicaState::StandBy },
            up,
        )
        .with_pc_role(pc)
    }

    fn body(pc: Epoch, cc: Epoch, replicas: Vec<ReplicaDescription>, ft: &FailoverUnit) -> ConfigurationBody {
        ConfigurationBody {
            ft: FailoverUnitDescription::new(FailoverUnitId::new(1), pc, cc),
            service: ft.service.clone(),
            replicas,
            deactivation_info: DeactivationInfo::INVALID,
            phase0_duration: None,
        }
    }

    fn lsn_reply(ft: &FailoverUnit, node: u64, first: u64, last: u64) -> GetLsnReplyBody {
        let mut replica = desc(node, ReplicaRole::Secondary, ReplicaRole::Secondary, true);
        replica.first_lsn = Some(Lsn::new(first));
        replica.last_lsn = Some(Lsn::new(last));
        GetLsnReplyBody {
            ft: ft.description(),
            replica,
            deactivation_info: DeactivationInfo::INVALID,
            error: ErrorCode::Success,
        }
    }

    fn status(first: u64, last: u64) -> Result<ReplicatorStatus, ErrorKind> {
        Ok(ReplicatorStatus {
            first_lsn: Lsn::new(first),
            last_lsn: Lsn::new(last),
        })
    }

    /// Secondary on node 1 promoted after the primary on node 3 went down.
    fn failover_unit() -> (FailoverUnit, ConfigurationBody) {
        let ft = ready_unit(1, ReplicaRole::Secondary, Epoch::new(1, 5), true);
        let body = body(
            Epoch::new(1, 5),
            Epoch::new(1, 6),
            vec![
                desc(1, ReplicaRole::Secondary, ReplicaRole::Primary, true),
                desc(2, ReplicaRole::Secondary, ReplicaRole::Secondary, true),
                desc(3, ReplicaRole::Primary, ReplicaRole::Secondary, false),
            ],
            &ft,
        );
        (ft, body)
    }

    #[test]
    fn failover_restarts_replica_that_cannot_catch_up() {
        let config = RaConfig::default();
        let (mut ft, body) = failover_unit();

        let out = step(&config, 0, &mut ft, |ft, cx| ft.on_do_reconfiguration(cx, &body));
        assert_eq!(ft.reconfig.stage, ReconfigurationStage::Phase1GetLsn);
        assert_eq!(ft.reconfig.kind, ReconfigurationType::Failover);
        let get_lsn: Vec<NodeId> = out
            .peer_messages()
            .filter(|(_, m)| matches!(m, PeerMessage::GetLsn(_)))
            .map(|(to, _)| to)
            .collect();
        assert_eq!(get_lsn, vec![NodeId::new(2)]);
        assert!(matches!(
            out.proxy_requests().next(),
            Some(ProxyRequest::ReplicatorGetStatus { .. })
        ));

        step(&config, 10, &mut ft, |ft, cx| ft.on_replicator_status(cx, status(5, 10)));
        assert_eq!(ft.reconfig.wait_reason, Some(WaitReason::WaitingForGetLsn));

        let reply = lsn_reply(&ft, 2, 1, 3);
        let out = step(&config, 20, &mut ft, |ft, cx| ft.on_get_lsn_reply(cx, NodeId::new(2), &reply));

        assert!(out.peer_messages().any(|(to, m)| to == NodeId::new(2)
            && matches!(m, PeerMessage::Deactivate { force: true, .. })));
        assert!(ft.replica(NodeId::new(2)).is_some_and(|r| r.to_be_restarted));
        assert_eq!(ft.reconfig.stage, ReconfigurationStage::Phase2Catchup);

        let catchup = out.proxy_requests().find_map(|r| match r {
            ProxyRequest::UpdateConfiguration {
                kind: UpdateConfigurationKind::Catchup,
                replicas,
                ..
            } => Some(replicas.clone()),
            _ => None,
        });
        let catchup = catchup.expect("catchup sent");
        assert!(catchup.iter().all(|r| r.node != NodeId::new(2)));
        assert!(catchup.iter().any(|r| r.node == NodeId::new(1)));
    }

    #[test]
    fn better_remote_replica_reverts_to_previous_configuration() {
        let config = RaConfig::default();
        let (mut ft, body) = failover_unit();
        step(&config, 0, &mut ft, |ft, cx| ft.on_do_reconfiguration(cx, &body));
        step(&config, 1, &mut ft, |ft, cx| ft.on_replicator_status(cx, status(1, 5)));

        let reply = lsn_reply(&ft, 2, 1, 9);
        let out = step(&config, 2, &mut ft, |ft, cx| ft.on_get_lsn_reply(cx, NodeId::new(2), &reply));

        assert!(out.fm_messages().any(|m| matches!(m, FmOutbound::ChangeConfiguration(_))));
        assert!(!ft.reconfig.is_reconfiguring());
        assert_eq!(ft.reconfig.last_result, Some(ReconfigurationResult::ChangeConfiguration));
        assert_eq!(ft.cc_epoch, Epoch::new(1, 6));
        assert_eq!(ft.pc_epoch, Epoch::INVALID);
        assert_eq!(ft.local_replica().map(|r| r.cc_role), Some(ReplicaRole::Secondary));
        assert!(ft.check_invariants().is_ok());

        // A repeat for the same epoch resends the result only.
        let out = step(&config, 3, &mut ft, |ft, cx| ft.on_do_reconfiguration(cx, &body));
        assert_eq!(out.fm_messages().count(), 1);
        assert!(!ft.reconfig.is_reconfiguring());
    }

    #[test]
    fn lost_read_quorum_reports_data_loss_once() {
        let config = RaConfig::development();
        let ft0 = ready_unit(1, ReplicaRole::Secondary, Epoch::new(1, 5), true);
        let body = body(
            Epoch::new(1, 5),
            Epoch::new(1, 6),
            vec![
                desc(1, ReplicaRole::Secondary, ReplicaRole::Primary, true),
                desc(2, ReplicaRole::Secondary, ReplicaRole::Secondary, false),
                desc(3, ReplicaRole::Primary, ReplicaRole::Secondary, false),
            ],
            &ft0,
        );
        let mut ft = ft0;
        step(&config, 0, &mut ft, |ft, cx| ft.on_do_reconfiguration(cx, &body));
        let out = step(&config, 1, &mut ft, |ft, cx| ft.on_replicator_status(cx, status(1, 5)));

        assert_eq!(out.fm_messages().filter(|m| matches!(m, FmOutbound::DataLossReport(_))).count(), 1);
        assert_eq!(ft.reconfig.wait_reason, Some(WaitReason::DataLossReported));
        assert_eq!(ft.data_loss_version_to_report, Some(1));

        // FM answers with a higher data loss version.
        let mut resumed = body.clone();
        resumed.ft.cc = Epoch::new(2, 7);
        step(&config, 2, &mut ft, |ft, cx| ft.on_do_reconfiguration(cx, &resumed));
        assert!(ft.reconfig.data_loss_mode);
        assert_eq!(ft.reconfig.stage, ReconfigurationStage::Phase1GetLsn);
        let out = step(&config, 3, &mut ft, |ft, cx| ft.on_replicator_status(cx, status(1, 5)));
        assert!(out.fm_messages().all(|m| !matches!(m, FmOutbound::DataLossReport(_))));
        assert_eq!(ft.reconfig.stage, ReconfigurationStage::Phase2Catchup);
    }

    #[test]
    fn other_reconfiguration_runs_catchup_to_completion() {
        let config = RaConfig::default();
        let mut ft = ready_unit(1, ReplicaRole::Primary, Epoch::new(1, 5), true);
        let body = body(
            Epoch::new(1, 5),
            Epoch::new(1, 6),
            vec![
                desc(1, ReplicaRole::Primary, ReplicaRole::Primary, true),
                desc(2, ReplicaRole::Secondary, ReplicaRole::Secondary, true),
                desc(3, ReplicaRole::None, ReplicaRole::Secondary, true),
            ],
            &ft,
        );

        step(&config, 0, &mut ft, |ft, cx| ft.on_do_reconfiguration(cx, &body));
        assert_eq!(ft.reconfig.kind, ReconfigurationType::Other);
        assert_eq!(ft.reconfig.stage, ReconfigurationStage::Phase2Catchup);

        let out = step(&config, 1, &mut ft, |ft, cx| {
            ft.on_update_configuration_reply(
                cx,
                UpdateConfigurationKind::Catchup,
                Ok(CatchupOutcome { last_acked_lsn: Lsn::new(42) }),
            );
        });
        assert_eq!(ft.deactivation_info, DeactivationInfo::new(Epoch::new(1, 6), Lsn::new(42)));
        // Node 3 joins, so roles differ and phase 3 runs.
        assert_eq!(ft.reconfig.stage, ReconfigurationStage::Phase3Deactivate);
        assert_eq!(out.peer_messages().count(), 1);

        let reply = ReplicaReplyBody {
            ft: ft.description(),
            replica: desc(2, ReplicaRole::Secondary, ReplicaRole::Secondary, true),
            error: ErrorCode::Success,
        };
        let out = step(&config, 2, &mut ft, |ft, cx| ft.on_deactivate_reply(cx, NodeId::new(2), &reply));
        assert_eq!(ft.reconfig.stage, ReconfigurationStage::Phase4Activate);
        assert_eq!(
            out.peer_messages().filter(|(_, m)| matches!(m, PeerMessage::Activate(_))).count(),
            2
        );

        step(&config, 3, &mut ft, |ft, cx| ft.on_activate_reply(cx, NodeId::new(2), &reply));
        let mut reply3 = reply.clone();
        reply3.replica = desc(3, ReplicaRole::None, ReplicaRole::Secondary, true);
        let out = step(&config, 4, &mut ft, |ft, cx| ft.on_activate_reply(cx, NodeId::new(3), &reply3));
        assert!(out.proxy_requests().any(|r| matches!(
            r,
            ProxyRequest::UpdateConfiguration { kind: UpdateConfigurationKind::EndReconfiguration, .. }
        )));

        let out = step(&config, 5, &mut ft, |ft, cx| {
            ft.on_update_configuration_reply(
                cx,
                UpdateConfigurationKind::EndReconfiguration,
                Ok(CatchupOutcome { last_acked_lsn: Lsn::new(42) }),
            );
        });
        assert!(out.fm_messages().any(|m| matches!(m, FmOutbound::DoReconfigurationReply(_))));
        assert!(!ft.reconfig.is_reconfiguring());
        assert_eq!(ft.pc_epoch, Epoch::INVALID);
        assert_eq!(ft.replicas.len(), 3);
    }

    #[test]
    fn newer_configuration_aborts_swap_primary() {
        let config = RaConfig::default();
        let mut ft = ready_unit(1, ReplicaRole::Primary, Epoch::new(1, 5), true);
        let swap = body(
            Epoch::new(1, 5),
            Epoch::new(1, 6),
            vec![
                desc(1, ReplicaRole::Primary, ReplicaRole::Secondary, true),
                desc(2, ReplicaRole::Secondary, ReplicaRole::Primary, true),
            ],
            &ft,
        );
        step(&config, 0, &mut ft, |ft, cx| ft.on_do_reconfiguration(cx, &swap));
        assert_eq!(ft.reconfig.kind, ReconfigurationType::SwapPrimary);
        assert_eq!(ft.reconfig.stage, ReconfigurationStage::Phase0Demote);

        let mut newer = swap.clone();
        newer.ft.cc = Epoch::new(1, 7);
        let out = step(&config, 1, &mut ft, |ft, cx| ft.on_do_reconfiguration(cx, &newer));
        assert_eq!(ft.reconfig.stage, ReconfigurationStage::AbortPhase0Demote);
        assert!(matches!(
            out.proxy_requests().next(),
            Some(ProxyRequest::CancelCatchupReplicaSet { .. })
        ));

        // Further configurations wait for the abort.
        assert!(step(&config, 2, &mut ft, |ft, cx| ft.on_do_reconfiguration(cx, &newer)).is_empty());

        step(&config, 3, &mut ft, |ft, cx| ft.on_cancel_catchup_reply(cx, Ok(())));
        assert_eq!(ft.reconfig.last_result, Some(ReconfigurationResult::AbortSwapPrimary));
        assert_eq!(ft.local_replica().map(|r| r.cc_role), Some(ReplicaRole::Primary));
        assert_eq!(ft.replica(NodeId::new(2)).map(|r| r.cc_role), Some(ReplicaRole::Secondary));
        assert_eq!(ft.cc_epoch, Epoch::new(1, 6));
    }

    #[test]
    fn demote_completion_hands_off_to_primary_elect() {
        let config = RaConfig::default();
        let mut ft = ready_unit(1, ReplicaRole::Primary, Epoch::new(1, 5), true);
        let swap = body(
            Epoch::new(1, 5),
            Epoch::new(1, 6),
            vec![
                desc(1, ReplicaRole::Primary, ReplicaRole::Secondary, true),
                desc(2, ReplicaRole::Secondary, ReplicaRole::Primary, true),
            ],
            &ft,
        );
        step(&config, 100, &mut ft, |ft, cx| ft.on_do_reconfiguration(cx, &swap));
        let out = step(&config, 350, &mut ft, |ft, cx| {
            ft.on_update_configuration_reply(
                cx,
                UpdateConfigurationKind::SwapPrimaryDemote,
                Ok(CatchupOutcome { last_acked_lsn: Lsn::new(7) }),
            );
        });

        let handoff = out.peer_messages().find_map(|(to, m)| match m {
            PeerMessage::ContinueSwapPrimary(b) => Some((to, b.phase0_duration)),
            _ => None,
        });
        assert_eq!(handoff, Some((NodeId::new(2), Some(Duration::from_millis(250)))));
        assert_eq!(ft.reconfig.last_result, Some(ReconfigurationResult::DemoteCompleted));
        assert!(ft.check_invariants().is_ok());
    }

    #[test]
    fn stuck_reconfiguration_warns_once_and_clears_on_completion() {
        let config = RaConfig::development();
        let threshold = config.timing.reconfiguration_health_report_threshold_ms;
        let (mut ft, body) = failover_unit();
        step(&config, 0, &mut ft, |ft, cx| ft.on_do_reconfiguration(cx, &body));

        let out = step(&config, threshold, &mut ft, |ft, cx| ft.retry_reconfiguration(cx));
        assert_eq!(out.health.len(), 1);
        assert_eq!(out.health[0].level, HealthLevel::Warning);

        let out = step(&config, threshold + 1, &mut ft, |ft, cx| ft.retry_reconfiguration(cx));
        assert!(out.health.is_empty());

        step(&config, threshold + 2, &mut ft, |ft, cx| ft.on_replicator_status(cx, status(1, 5)));
        let reply = lsn_reply(&ft, 2, 1, 9);
        let out = step(&config, threshold + 3, &mut ft, |ft, cx| {
            ft.on_get_lsn_reply(cx, NodeId::new(2), &reply);
        });
        assert!(out
            .health
            .iter()
            .any(|h| h.property == HealthProperty::ReconfigurationStuck && h.level == HealthLevel::Ok));
    }
}
