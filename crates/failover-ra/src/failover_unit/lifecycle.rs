//! Local replica lifecycle: registration, open, reopen, close, faults.

use failover_types::{Epoch, ReplicaInstance, ReplicaState, UpgradeInstanceId};

use super::{
    FailoverUnit, FailoverUnitState, LocalOpenStatus, PendingReply, RegistrationState,
    ReplicaUpKind,
};
use crate::context::Context;
use crate::error::{ErrorCode, ErrorKind};
use crate::instrumentation::METRICS;
use crate::message::{
    ClientReportFaultRequest, CloseMode, FaultType, HostingOutcome, HostingRequest, OpenMode,
    ProxyRequest, ServiceTypeRegistration,
};
use crate::output::{Effect, OperationOwner};
use crate::reconfiguration_state::ReconfigurationState;
use crate::replica::LsnState;
use crate::retryable_error::{RetryDecision, RetryableErrorKind};

fn registration_kind(mode: OpenMode) -> RetryableErrorKind {
    match mode {
        OpenMode::Open => RetryableErrorKind::FindRegistrationAtOpen,
        OpenMode::Reopen => RetryableErrorKind::FindRegistrationAtReopen,
    }
}

fn open_kind(mode: OpenMode) -> RetryableErrorKind {
    match mode {
        OpenMode::Open => RetryableErrorKind::ReplicaOpen,
        OpenMode::Reopen => RetryableErrorKind::ReplicaReopen,
    }
}

impl FailoverUnit {
    // ========================================================================
    // Service Type Registration
    // ========================================================================

    pub(crate) fn start_registration(&mut self, cx: &mut Context<'_>) {
        if !matches!(
            self.local_open,
            LocalOpenStatus::Opening {
                registration: RegistrationState::Pending,
                ..
            }
        ) {
            return;
        }

        let op = cx.begin_hosting(
            OperationOwner::FailoverUnit(self.id),
            HostingRequest::FindServiceTypeRegistration {
                service_type: self.service.service_type.clone(),
                package: self.service.package.clone(),
            },
        );
        if let Some(previous) = self.pending_operation.replace(op) {
            cx.effect(Effect::CancelOperation(previous));
        }
    }

    pub(crate) fn on_hosting_completed(
        &mut self,
        cx: &mut Context<'_>,
        op: failover_types::OperationId,
        result: Result<HostingOutcome, ErrorKind>,
    ) {
        if self.pending_operation != Some(op) {
            tracing::debug!(ft = %self.id, op = %op, "dropping completion of superseded operation");
            return;
        }
        self.pending_operation = None;

        let LocalOpenStatus::Opening {
            mode,
            registration: RegistrationState::Pending,
        } = self.local_open.clone()
        else {
            return;
        };

        match result {
            Ok(HostingOutcome::Registered(registration)) => {
                self.on_registered(cx, mode, registration);
            }
            Ok(other) => {
                tracing::warn!(ft = %self.id, ?other, "unexpected hosting outcome for registration");
            }
            Err(ErrorKind::Cancelled) => {}
            Err(ErrorKind::Fatal) => {
                tracing::warn!(ft = %self.id, "service type registration failed permanently");
                self.abandon_open(cx);
            }
            Err(_) => {
                if self.record_failure(cx, registration_kind(mode), true) == RetryDecision::AtDrop {
                    self.abandon_open(cx);
                }
            }
        }
    }

    fn on_registered(
        &mut self,
        cx: &mut Context<'_>,
        mode: OpenMode,
        registration: ServiceTypeRegistration,
    ) {
        self.record_success(cx, true);
        self.local_open = LocalOpenStatus::Opening {
            mode,
            registration: RegistrationState::Registered(registration),
        };
        self.send_open(cx, mode);
    }

    /// Hosting reports the service type registered before our lookup returned.
    pub(crate) fn on_service_type_registered(
        &mut self,
        cx: &mut Context<'_>,
        registration: ServiceTypeRegistration,
    ) {
        let LocalOpenStatus::Opening {
            mode,
            registration: RegistrationState::Pending,
        } = self.local_open
        else {
            return;
        };
        if let Some(op) = self.pending_operation.take() {
            cx.effect(Effect::CancelOperation(op));
        }
        self.on_registered(cx, mode, registration);
    }

    // ========================================================================
    // Open / Reopen
    // ========================================================================

    pub(crate) fn send_open(&mut self, cx: &mut Context<'_>, mode: OpenMode) {
        let Some(replica) = self.local_description() else {
            return;
        };
        let kind = open_kind(mode);
        let abort_on_failure = self.proxy_errors.kind() == Some(kind)
            && self
                .proxy_errors
                .is_last_retry(kind.thresholds(&cx.config.retry));

        let request = match mode {
            OpenMode::Open => ProxyRequest::Open {
                ft: self.description(),
                service: self.service.clone(),
                replica,
                abort_on_failure,
            },
            OpenMode::Reopen => ProxyRequest::Reopen {
                ft: self.description(),
                service: self.service.clone(),
                replica,
                abort_on_failure,
            },
        };
        cx.send_proxy(self.id, request);
    }

    pub(crate) fn on_open_reply(
        &mut self,
        cx: &mut Context<'_>,
        mode: OpenMode,
        result: Result<(), ErrorKind>,
    ) {
        let LocalOpenStatus::Opening {
            mode: current,
            registration: RegistrationState::Registered(registration),
        } = self.local_open.clone()
        else {
            tracing::debug!(ft = %self.id, "open reply without open in progress");
            return;
        };
        if current != mode {
            return;
        }

        match result {
            Ok(()) => {
                self.record_success(cx, false);
                self.local_open = LocalOpenStatus::Opened { registration };
                if let Some(local) = self.local_replica_mut() {
                    local.is_up = true;
                    local.state = if local.cc_role == failover_types::ReplicaRole::Idle {
                        ReplicaState::InBuild
                    } else {
                        ReplicaState::Ready
                    };
                }
                if mode == OpenMode::Reopen {
                    self.replica_up_pending = Some(ReplicaUpKind::Up);
                }
                tracing::info!(ft = %self.id, replica = %self.local_instance(), ?mode, "local replica opened");
                self.send_pending_reply(cx, ErrorCode::Success);
            }
            Err(ErrorKind::Cancelled) => {}
            Err(ErrorKind::Fatal) => self.abandon_open(cx),
            Err(_) => {
                if self.record_failure(cx, open_kind(mode), false) == RetryDecision::AtDrop {
                    self.abandon_open(cx);
                }
            }
        }
    }

    /// Reopens a persisted replica that was closed with restart.
    pub(crate) fn start_reopen(&mut self, cx: &mut Context<'_>) {
        if !self.is_open() || !self.is_persisted() || !self.local_open.is_closed() {
            return;
        }
        self.local_open = LocalOpenStatus::Opening {
            mode: OpenMode::Reopen,
            registration: RegistrationState::Pending,
        };
        self.start_registration(cx);
    }

    /// Gives up on an open that never reached the proxy, or failed there.
    fn abandon_open(&mut self, cx: &mut Context<'_>) {
        if let Some(op) = self.pending_operation.take() {
            cx.effect(Effect::CancelOperation(op));
        }
        self.mark_dropped();
        self.send_pending_reply(cx, ErrorCode::ReplicaOperationFailed);
        tracing::warn!(ft = %self.id, replica = %self.local_instance(), "local replica dropped after open failure");
    }

    fn mark_dropped(&mut self) {
        if let Some(local) = self.local_replica_mut() {
            local.state = ReplicaState::Dropped;
            local.is_up = false;
            local.lsn = LsnState::Unset;
        }
        self.state = FailoverUnitState::Closed;
        self.local_open = LocalOpenStatus::Closed;
        self.replica_up_pending = Some(ReplicaUpKind::Dropped);
        self.retry_required = false;
        METRICS.increment_replicas_dropped();
    }

    // ========================================================================
    // Close
    // ========================================================================

    pub(crate) fn start_close(&mut self, cx: &mut Context<'_>, mode: CloseMode) {
        match self.local_open.clone() {
            LocalOpenStatus::Closed => {}
            LocalOpenStatus::Opening {
                registration: RegistrationState::Pending,
                ..
            } => {
                if let Some(op) = self.pending_operation.take() {
                    cx.effect(Effect::CancelOperation(op));
                }
                self.finish_close(cx, mode);
            }
            LocalOpenStatus::Opening {
                registration: RegistrationState::Registered(registration),
                ..
            }
            | LocalOpenStatus::Opened { registration } => {
                tracing::info!(ft = %self.id, replica = %self.local_instance(), ?mode, "closing local replica");
                self.local_open = LocalOpenStatus::Closing { mode, registration };
                self.close_started_at = Some(cx.now);
                self.send_close(cx, mode);
            }
            LocalOpenStatus::Closing {
                mode: current,
                registration,
            } => {
                if mode.strength() > current.strength() {
                    tracing::info!(ft = %self.id, from = ?current, to = ?mode, "escalating pending close");
                    self.local_open = LocalOpenStatus::Closing { mode, registration };
                    self.send_close(cx, mode);
                }
            }
        }
    }

    pub(crate) fn send_close(&mut self, cx: &mut Context<'_>, mode: CloseMode) {
        cx.send_proxy(
            self.id,
            ProxyRequest::Close {
                instance: self.local_instance(),
                mode,
            },
        );
    }

    pub(crate) fn on_close_reply(
        &mut self,
        cx: &mut Context<'_>,
        mode: CloseMode,
        result: Result<(), ErrorKind>,
    ) {
        let LocalOpenStatus::Closing {
            mode: current,
            registration,
        } = self.local_open.clone()
        else {
            return;
        };
        if mode != current {
            return;
        }

        match result {
            Ok(()) => {
                self.record_success(cx, false);
                self.finish_close(cx, mode);
            }
            Err(ErrorKind::Cancelled) => {}
            Err(_) => {
                if self.record_failure(cx, RetryableErrorKind::ReplicaClose, false)
                    == RetryDecision::AtDrop
                {
                    tracing::warn!(ft = %self.id, host = %registration.host_id, "terminating host of replica that will not close");
                    cx.effect(Effect::TerminateServiceHost {
                        host_id: registration.host_id,
                    });
                    self.finish_close(cx, mode);
                }
            }
        }
    }

    /// Applies the outcome of a completed close.
    fn finish_close(&mut self, cx: &mut Context<'_>, mode: CloseMode) {
        self.close_started_at = None;
        self.sender_node = None;
        self.update_replicator_pending = false;
        self.reconfig = ReconfigurationState {
            last_result: self.reconfig.last_result,
            ..ReconfigurationState::default()
        };
        for replica in self.replicas.values_mut() {
            replica.clear_reconfiguration_state();
        }

        let reply = match self.pending_reply {
            Some(PendingReply::RemoveInstance | PendingReply::DeleteReplica) => ErrorCode::Success,
            _ => ErrorCode::ReplicaOperationFailed,
        };

        match mode {
            CloseMode::Restart if self.is_persisted() => {
                if let Some(local) = self.local_replica_mut() {
                    local.state = ReplicaState::StandBy;
                    local.is_up = false;
                }
                self.local_open = LocalOpenStatus::Closed;
                self.replica_up_pending = Some(ReplicaUpKind::Down);
                self.send_pending_reply(cx, reply);
                tracing::info!(ft = %self.id, replica = %self.local_instance(), "local replica restarted");
                if !self.held_for_upgrade {
                    self.start_reopen(cx);
                }
            }
            CloseMode::Delete => {
                self.mark_dropped();
                self.deleted = true;
                self.replica_up_pending = None;
                self.send_pending_reply(cx, reply);
                tracing::info!(ft = %self.id, replica = %self.local_instance(), "local replica deleted");
            }
            // A volatile replica does not survive any close.
            CloseMode::Restart
            | CloseMode::Close
            | CloseMode::Drop
            | CloseMode::Abort
            | CloseMode::Obliterate => {
                self.mark_dropped();
                self.send_pending_reply(cx, reply);
                tracing::info!(ft = %self.id, replica = %self.local_instance(), ?mode, "local replica dropped");
            }
        }
    }

    /// The host process of the local replica exited.
    pub(crate) fn on_host_closed(&mut self, cx: &mut Context<'_>) {
        match self.local_open.clone() {
            LocalOpenStatus::Closing { mode, .. } => self.finish_close(cx, mode),
            LocalOpenStatus::Opened { .. }
            | LocalOpenStatus::Opening {
                registration: RegistrationState::Registered(_),
                ..
            } => {
                let mode = if self.is_persisted() {
                    CloseMode::Restart
                } else {
                    CloseMode::Drop
                };
                tracing::info!(ft = %self.id, ?mode, "host of local replica closed");
                self.finish_close(cx, mode);
            }
            _ => {}
        }
    }

    /// Brings a checkpointed unit back after the node restarted. Nothing the
    /// unit was waiting on survived the restart.
    pub(crate) fn recover_after_restart(&mut self, cx: &mut Context<'_>) {
        self.pending_operation = None;
        self.pending_reply = None;
        self.held_for_upgrade = false;
        self.retry_required = false;
        if !self.is_open() {
            return;
        }
        match self.local_open.clone() {
            LocalOpenStatus::Closed => self.start_reopen(cx),
            LocalOpenStatus::Closing { mode, .. } if !mode.preserves_replica() => {
                self.finish_close(cx, mode);
            }
            _ => {
                let mode = if self.is_persisted() {
                    CloseMode::Restart
                } else {
                    CloseMode::Drop
                };
                self.finish_close(cx, mode);
            }
        }
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// Fault reported by the replica through the proxy. Ignored while a
    /// close is already pending.
    pub(crate) fn on_report_fault(&mut self, cx: &mut Context<'_>, kind: FaultType) {
        if self.local_open.is_closing() {
            tracing::debug!(ft = %self.id, ?kind, "ignoring fault for closing replica");
            return;
        }
        let mode = self.close_mode_for_fault(kind);
        self.start_close(cx, mode);
    }

    fn close_mode_for_fault(&self, kind: FaultType) -> CloseMode {
        match kind {
            FaultType::Permanent => CloseMode::Abort,
            FaultType::Transient if self.is_persisted() => CloseMode::Restart,
            FaultType::Transient => CloseMode::Drop,
        }
    }

    /// Validates and applies a client ReportFault. Node and partition
    /// existence are checked by the caller.
    pub(crate) fn on_client_report_fault(
        &mut self,
        cx: &mut Context<'_>,
        request: &ClientReportFaultRequest,
    ) -> ErrorCode {
        if request.force && self.service.is_adhoc {
            return ErrorCode::ForceNotSupportedForReplicaOperation;
        }
        if !self.is_persisted() && request.kind == FaultType::Transient {
            return ErrorCode::InvalidReplicaOperation;
        }
        if !self.is_open() || self.local_instance().replica_id != request.replica_id {
            return ErrorCode::ReplicaDoesNotExist;
        }
        if !request.force && (!self.local_open.is_opened() || !self.is_local_ready()) {
            return ErrorCode::InvalidReplicaStateForReplicaOperation;
        }

        let mode = if request.force {
            CloseMode::Obliterate
        } else {
            self.close_mode_for_fault(request.kind)
        };
        self.start_close(cx, mode);
        ErrorCode::Success
    }

    // ========================================================================
    // Closed Units
    // ========================================================================

    /// Tracks a higher instance seen for a closed unit without reopening it.
    pub(crate) fn update_instance_for_closed(&mut self, instance: ReplicaInstance, cc: Epoch) {
        if self.is_open() {
            return;
        }
        if cc > self.cc_epoch {
            self.cc_epoch = cc;
        }
        if let Some(local) = self.local_replica_mut() {
            if instance > local.instance {
                local.instance = instance;
            }
        }
    }

    // ========================================================================
    // Replica Up Reporting
    // ========================================================================

    pub(crate) fn on_replica_up_acknowledged(&mut self, instance: ReplicaInstance) {
        if self.replica_up_pending.is_some() && instance == self.local_instance() {
            self.replica_up_pending = None;
        }
    }

    /// The owning authority moved to a new generation. Pending reports for a
    /// replica it has already forgotten are marked processed.
    pub(crate) fn on_generation_advanced(&mut self) -> bool {
        if !self.is_open() && self.replica_up_pending == Some(ReplicaUpKind::Dropped) {
            self.replica_up_pending = None;
            return true;
        }
        false
    }

    // ========================================================================
    // Upgrade Hooks
    // ========================================================================

    pub(crate) fn begin_upgrade_close(&mut self, cx: &mut Context<'_>) {
        self.held_for_upgrade = true;
        if !self.is_open() {
            return;
        }
        let mode = if self.is_persisted() {
            CloseMode::Restart
        } else {
            CloseMode::Close
        };
        self.start_close(cx, mode);
    }

    /// Re-sends an outstanding close. No-op unless the replica is closing.
    pub(crate) fn resend_close(&mut self, cx: &mut Context<'_>) {
        if let LocalOpenStatus::Closing { mode, .. } = self.local_open {
            self.send_close(cx, mode);
        }
    }

    /// Drops a replica whose package was removed by an upgrade. A replica
    /// already closed for the upgrade is dropped in place.
    pub(crate) fn drop_for_upgrade(&mut self, cx: &mut Context<'_>) {
        self.held_for_upgrade = false;
        if !self.is_open() {
            return;
        }
        if self.local_open.is_closed() {
            self.finish_close(cx, CloseMode::Drop);
        } else {
            self.start_close(cx, CloseMode::Drop);
        }
    }

    pub(crate) fn finish_application_upgrade(
        &mut self,
        cx: &mut Context<'_>,
        instance: UpgradeInstanceId,
        version: &str,
        service_types: &[String],
    ) {
        self.held_for_upgrade = false;
        let upgraded = service_types.iter().any(|t| *t == self.service.service_type);
        if upgraded && instance > self.service.package.instance {
            self.service.package.version = version.to_string();
            self.service.package.instance = instance;
            let package = self.service.package.clone();
            if let Some(local) = self.local_replica_mut() {
                local.package = package;
            }
        }
        self.start_reopen(cx);
    }

    pub(crate) fn finish_fabric_upgrade(&mut self, cx: &mut Context<'_>, deactivation_info_supported: bool) {
        self.held_for_upgrade = false;
        self.deactivation_info_supported = deactivation_info_supported;
        self.start_reopen(cx);
    }

    /// Applies a NodeUpdateService request. Returns the instance now in effect.
    pub(crate) fn update_service(
        &mut self,
        service: &crate::message::ServiceDescription,
    ) -> UpgradeInstanceId {
        if service.package.instance > self.service.package.instance {
            self.service = service.clone();
        }
        self.service.package.instance
    }
}
