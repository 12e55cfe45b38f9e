//! Job items against a single failover unit.
//!
//! Every partition-scoped message is classified by the staleness filter
//! against the unit as it is when the job runs, then handed to the unit.

use failover_types::{Authority, FailoverUnitId, NodeId, ReplicaRole, ReplicaState};

use super::event::FtJob;
use crate::context::Context;
use crate::error::ErrorCode;
use crate::failover_unit::{FailoverUnit, PendingReply};
use crate::instrumentation::METRICS;
use crate::message::{
    ClientReportFaultReply, ClientReportFaultRequest, CloseMode, FaultType, FmMessage, FmOutbound,
    OpenMode, PeerMessage, ProxyReply, ReplicaMessageBody, ReplicaReplyBody,
};
use crate::replica::{LsnState, Replica};
use crate::staleness::{self, MessageContext, Staleness, TransitionKind};
use crate::table::FailoverUnitTable;
use crate::upgrade::FtUpgradeWork;

/// Executes one job item.
pub(super) fn execute(
    table: &mut FailoverUnitTable,
    cx: &mut Context<'_>,
    id: FailoverUnitId,
    job: FtJob,
    deactivation_info_supported: bool,
) {
    match job {
        FtJob::Fm { authority, message } => {
            let msg = fm_context(cx.node, &message);
            if admit(table, cx, id, &msg, message.name(), |ft, cx, code| {
                stale_fm_reply(ft, cx, authority, &message, code);
            }) {
                on_fm_message(table, cx, id, authority, message, deactivation_info_supported);
            }
        }
        FtJob::Peer { from, message } => {
            let msg = peer_context(cx.node, &message);
            if admit(table, cx, id, &msg, "Peer", |ft, cx, code| {
                stale_peer_reply(ft, cx, from, &message, code);
            }) {
                on_peer_message(table, cx, id, from, message, deactivation_info_supported);
            }
        }
        FtJob::Proxy(reply) => on_proxy_reply(table, cx, id, reply),
        FtJob::ClientReportFault(request) => on_client_report_fault(table, cx, &request),
        job => {
            let Some(ft) = table.get_mut(id) else {
                tracing::debug!(ft = %id, ?job, "job for unknown failover unit");
                return;
            };
            on_local_job(ft, cx, job);
        }
    }
}

// ============================================================================
// Staleness
// ============================================================================

/// Runs the staleness filter. Returns true when the handler should run.
fn admit(
    table: &FailoverUnitTable,
    cx: &mut Context<'_>,
    id: FailoverUnitId,
    msg: &MessageContext,
    name: &'static str,
    reply: impl FnOnce(Option<&FailoverUnit>, &mut Context<'_>, ErrorCode),
) -> bool {
    let ft = table.get(id);
    let view = ft.map(FailoverUnit::staleness_view);
    match staleness::classify(view.as_ref(), msg) {
        Staleness::Accept => {
            METRICS.increment_messages_accepted();
            true
        }
        Staleness::ReadOnly(code) => {
            METRICS.increment_messages_read_only();
            tracing::debug!(ft = %id, message = name, ?code, "replying to stale message without change");
            reply(ft, cx, code);
            false
        }
        Staleness::Drop => {
            METRICS.increment_messages_stale();
            tracing::debug!(ft = %id, message = name, epoch = ?msg.epoch, instance = ?msg.instance, "dropping stale message");
            false
        }
    }
}

fn replica_context(kind: TransitionKind, body: &ReplicaMessageBody) -> MessageContext {
    MessageContext::new(kind)
        .with_epoch(body.ft.cc)
        .with_instance(body.replica.instance)
}

fn fm_context(node: NodeId, message: &FmMessage) -> MessageContext {
    match message {
        FmMessage::AddPrimary(body) | FmMessage::AddInstance(body) => {
            replica_context(TransitionKind::Open, body).with_reply()
        }
        FmMessage::RemoveInstance(body) | FmMessage::DeleteReplica(body) => {
            MessageContext::new(TransitionKind::Close)
                .with_instance(body.replica.instance)
                .with_reply()
        }
        FmMessage::AddReplica(body) | FmMessage::RemoveReplica(body) => {
            MessageContext::new(TransitionKind::Query).with_epoch(body.ft.cc)
        }
        FmMessage::DoReconfiguration(body) => {
            let msg = MessageContext::new(TransitionKind::Reconfigure)
                .with_epoch(body.ft.cc)
                .expecting_up();
            match body.replica_on(node) {
                Some(local) => msg.with_instance(local.instance),
                None => msg,
            }
        }
        _ => MessageContext::new(TransitionKind::Query),
    }
}

fn peer_context(node: NodeId, message: &PeerMessage) -> MessageContext {
    match message {
        PeerMessage::CreateReplica(body) => replica_context(TransitionKind::Open, body).with_reply(),
        PeerMessage::GetLsn(body) => replica_context(TransitionKind::Reconfigure, body).expecting_up(),
        PeerMessage::Deactivate { body, force: true } => {
            let msg = MessageContext::new(TransitionKind::Close);
            match body.replica_on(node) {
                Some(local) => msg.with_instance(local.instance),
                None => msg,
            }
        }
        PeerMessage::Deactivate { body, .. }
        | PeerMessage::Activate(body)
        | PeerMessage::ContinueSwapPrimary(body) => {
            let msg = MessageContext::new(TransitionKind::Reconfigure)
                .with_epoch(body.ft.cc)
                .expecting_up();
            match body.replica_on(node) {
                Some(local) => msg.with_instance(local.instance),
                None => msg,
            }
        }
        // Replies carry the sender's epoch; the handlers match them against
        // the phase in progress.
        PeerMessage::CreateReplicaReply(_)
        | PeerMessage::GetLsnReply(_)
        | PeerMessage::DeactivateReply(_)
        | PeerMessage::ActivateReply(_) => MessageContext::new(TransitionKind::Query),
    }
}

fn reply_body_for(
    ft: Option<&FailoverUnit>,
    body: &ReplicaMessageBody,
    code: ErrorCode,
) -> ReplicaReplyBody {
    ft.and_then(|ft| ft.reply_body(code))
        .unwrap_or_else(|| ReplicaReplyBody {
            ft: body.ft,
            replica: body.replica.clone(),
            error: code,
        })
}

fn stale_fm_reply(
    ft: Option<&FailoverUnit>,
    cx: &mut Context<'_>,
    authority: Authority,
    message: &FmMessage,
    code: ErrorCode,
) {
    let reply = match message {
        FmMessage::AddPrimary(body) => FmOutbound::AddPrimaryReply(reply_body_for(ft, body, code)),
        FmMessage::AddInstance(body) => FmOutbound::AddInstanceReply(reply_body_for(ft, body, code)),
        FmMessage::RemoveInstance(body) => {
            FmOutbound::RemoveInstanceReply(reply_body_for(ft, body, code))
        }
        FmMessage::DeleteReplica(body) => {
            FmOutbound::DeleteReplicaReply(reply_body_for(ft, body, code))
        }
        _ => return,
    };
    cx.send_fm(authority, reply);
}

fn stale_peer_reply(
    ft: Option<&FailoverUnit>,
    cx: &mut Context<'_>,
    from: NodeId,
    message: &PeerMessage,
    code: ErrorCode,
) {
    if let PeerMessage::CreateReplica(body) = message {
        cx.send_peer(
            from,
            PeerMessage::CreateReplicaReply(reply_body_for(ft, body, code)),
        );
    }
}

// ============================================================================
// Failover Manager Messages
// ============================================================================

fn on_fm_message(
    table: &mut FailoverUnitTable,
    cx: &mut Context<'_>,
    id: FailoverUnitId,
    authority: Authority,
    message: FmMessage,
    deactivation_info_supported: bool,
) {
    match message {
        FmMessage::AddPrimary(body) => on_add(
            table,
            cx,
            authority,
            &body,
            PendingReply::AddPrimary,
            deactivation_info_supported,
        ),
        FmMessage::AddInstance(body) => on_add(
            table,
            cx,
            authority,
            &body,
            PendingReply::AddInstance,
            deactivation_info_supported,
        ),
        FmMessage::RemoveInstance(body) => on_remove(table, cx, authority, &body, false),
        FmMessage::DeleteReplica(body) => on_remove(table, cx, authority, &body, true),
        FmMessage::AddReplica(body) => match table.get_mut(id) {
            Some(ft) if ft.is_open() => ft.on_add_replica(cx, &body),
            _ => cx.send_fm(
                authority,
                FmOutbound::AddReplicaReply(reply_body_for(None, &body, ErrorCode::NotReady)),
            ),
        },
        FmMessage::RemoveReplica(body) => match table.get_mut(id) {
            Some(ft) if ft.is_open() => ft.on_remove_replica(cx, &body),
            _ => cx.send_fm(
                authority,
                FmOutbound::RemoveReplicaReply(reply_body_for(None, &body, ErrorCode::NotReady)),
            ),
        },
        FmMessage::DoReconfiguration(body) => match table.get_mut(id) {
            Some(ft) if ft.is_open() => ft.on_do_reconfiguration(cx, &body),
            _ => tracing::debug!(ft = %id, "DoReconfiguration for a partition not open on this node"),
        },
        FmMessage::NodeUpdateServiceRequest { ft: ft_id, service } => {
            let instance = match table.get_mut(ft_id) {
                Some(ft) => ft.update_service(&service),
                None => service.package.instance,
            };
            cx.send_fm(
                authority,
                FmOutbound::NodeUpdateServiceReply {
                    ft: ft_id,
                    instance,
                },
            );
        }
        other => {
            tracing::debug!(ft = %id, message = other.name(), "node-scoped message on partition queue");
        }
    }
}

/// Builds a new unit whose local replica is about to be opened.
fn create_unit(
    table: &mut FailoverUnitTable,
    cx: &mut Context<'_>,
    body: &ReplicaMessageBody,
    role: ReplicaRole,
    pending: PendingReply,
    deactivation_info_supported: bool,
) {
    let mut local = Replica::from_description(&body.replica);
    local.node = cx.node;
    local.cc_role = role;
    local.state = ReplicaState::InCreate;
    local.is_up = true;
    local.lsn = LsnState::Unset;
    local.package = body.service.package.clone();

    let mut ft = FailoverUnit::new(
        body.ft.id,
        cx.node,
        body.service.clone(),
        &body.ft,
        local,
        deactivation_info_supported,
    );
    ft.pending_reply = Some(pending);
    tracing::info!(ft = %body.ft.id, replica = %body.replica.instance, ?role, "creating failover unit");
    ft.start_registration(cx);
    table.insert(ft);
}

fn on_add(
    table: &mut FailoverUnitTable,
    cx: &mut Context<'_>,
    authority: Authority,
    body: &ReplicaMessageBody,
    pending: PendingReply,
    deactivation_info_supported: bool,
) {
    let role = match pending {
        PendingReply::AddPrimary => ReplicaRole::Primary,
        _ => body.replica.cc_role,
    };
    let reply = |ft: &FailoverUnit, code: ErrorCode| {
        let body = reply_body_for(Some(ft), body, code);
        match pending {
            PendingReply::AddPrimary => FmOutbound::AddPrimaryReply(body),
            _ => FmOutbound::AddInstanceReply(body),
        }
    };

    let Some(ft) = table.get_mut(body.ft.id) else {
        create_unit(table, cx, body, role, pending, deactivation_info_supported);
        return;
    };

    let local = ft.local_instance();
    if !ft.is_open() {
        if body.replica.instance > local {
            create_unit(table, cx, body, role, pending, deactivation_info_supported);
        } else {
            cx.send_fm(authority, reply(&*ft, ErrorCode::StaleRequest));
        }
        return;
    }

    if body.replica.instance > local {
        tracing::info!(ft = %ft.id(), replica = %local, newer = %body.replica.instance, "newer instance requested; dropping local replica");
        ft.start_close(cx, CloseMode::Drop);
        return;
    }

    if ft.local_open().is_opened() && ft.is_local_ready() {
        cx.send_fm(authority, reply(&*ft, ErrorCode::Success));
    } else if !ft.local_open().is_closing() {
        ft.pending_reply = Some(pending);
    }
}

fn on_remove(
    table: &mut FailoverUnitTable,
    cx: &mut Context<'_>,
    authority: Authority,
    body: &ReplicaMessageBody,
    delete: bool,
) {
    let reply = |body: ReplicaReplyBody| {
        if delete {
            FmOutbound::DeleteReplicaReply(body)
        } else {
            FmOutbound::RemoveInstanceReply(body)
        }
    };

    match table.get_mut(body.ft.id) {
        None => cx.send_fm(authority, reply(reply_body_for(None, body, ErrorCode::Success))),
        Some(ft) if !ft.is_open() => {
            if delete {
                ft.deleted = true;
                ft.replica_up_pending = None;
            }
            cx.send_fm(authority, reply(reply_body_for(Some(&*ft), body, ErrorCode::Success)));
        }
        Some(ft) => {
            let (pending, mode) = if delete {
                (PendingReply::DeleteReplica, CloseMode::Delete)
            } else {
                (PendingReply::RemoveInstance, CloseMode::Drop)
            };
            ft.pending_reply = Some(pending);
            ft.start_close(cx, mode);
        }
    }
}

// ============================================================================
// Peer Messages
// ============================================================================

fn on_peer_message(
    table: &mut FailoverUnitTable,
    cx: &mut Context<'_>,
    id: FailoverUnitId,
    from: NodeId,
    message: PeerMessage,
    deactivation_info_supported: bool,
) {
    if let PeerMessage::CreateReplica(body) = &message {
        on_create_replica(table, cx, from, body, deactivation_info_supported);
        return;
    }

    let Some(ft) = table.get_mut(id).filter(|ft| ft.is_open()) else {
        tracing::debug!(ft = %id, from = %from, "peer message for a partition not open on this node");
        return;
    };
    match message {
        PeerMessage::CreateReplica(_) => {}
        PeerMessage::CreateReplicaReply(body) => ft.on_create_replica_reply(cx, from, &body),
        PeerMessage::GetLsn(body) => ft.on_get_lsn(cx, from, &body),
        PeerMessage::GetLsnReply(body) => ft.on_get_lsn_reply(cx, from, &body),
        PeerMessage::Deactivate { body, force } => ft.on_deactivate(cx, from, &body, force),
        PeerMessage::DeactivateReply(body) => ft.on_deactivate_reply(cx, from, &body),
        PeerMessage::Activate(body) => ft.on_activate(cx, from, &body),
        PeerMessage::ActivateReply(body) => ft.on_activate_reply(cx, from, &body),
        PeerMessage::ContinueSwapPrimary(body) => ft.on_do_reconfiguration(cx, &body),
    }
}

fn on_create_replica(
    table: &mut FailoverUnitTable,
    cx: &mut Context<'_>,
    from: NodeId,
    body: &ReplicaMessageBody,
    deactivation_info_supported: bool,
) {
    let Some(ft) = table.get_mut(body.ft.id) else {
        create_unit(
            table,
            cx,
            body,
            ReplicaRole::Idle,
            PendingReply::CreateReplica { to: from },
            deactivation_info_supported,
        );
        return;
    };

    if !ft.is_open() {
        // A closed unit is never reopened by a peer.
        ft.update_instance_for_closed(body.replica.instance, body.ft.cc);
        let reply = reply_body_for(Some(&*ft), body, ErrorCode::StaleRequest);
        cx.send_peer(from, PeerMessage::CreateReplicaReply(reply));
        return;
    }

    if body.replica.instance > ft.local_instance() {
        tracing::info!(ft = %ft.id(), replica = %ft.local_instance(), newer = %body.replica.instance, "peer requested newer instance; dropping local replica");
        ft.start_close(cx, CloseMode::Drop);
        return;
    }
    ft.on_create_replica(cx, from, body);
}

// ============================================================================
// Proxy Replies
// ============================================================================

fn on_proxy_reply(
    table: &mut FailoverUnitTable,
    cx: &mut Context<'_>,
    id: FailoverUnitId,
    reply: ProxyReply,
) {
    let Some(ft) = table.get_mut(id) else {
        tracing::debug!(ft = %id, "proxy reply for unknown failover unit");
        return;
    };
    if reply.instance() != ft.local_instance() {
        METRICS.increment_messages_stale();
        tracing::debug!(ft = %id, replica = %reply.instance(), current = %ft.local_instance(), "dropping proxy reply for another instance");
        return;
    }

    match reply {
        ProxyReply::ReplicaOpen { result, .. } => ft.on_open_reply(cx, OpenMode::Open, result),
        ProxyReply::StatefulServiceReopen { result, .. } => {
            ft.on_open_reply(cx, OpenMode::Reopen, result);
        }
        ProxyReply::ReplicaClose { mode, result, .. } => ft.on_close_reply(cx, mode, result),
        ProxyReply::UpdateConfiguration { kind, result, .. } => {
            ft.on_update_configuration_reply(cx, kind, result);
        }
        ProxyReply::BuildIdleReplica { target, result, .. } => {
            ft.on_build_idle_reply(cx, target, result);
        }
        ProxyReply::RemoveIdleReplica { target, result, .. } => {
            ft.on_remove_idle_reply(cx, target, result);
        }
        ProxyReply::ReplicatorGetStatus { result, .. } => ft.on_replicator_status(cx, result),
        ProxyReply::ReplicatorUpdateEpochAndGetStatus { result, .. } => {
            ft.on_update_epoch_reply(cx, result);
        }
        ProxyReply::CancelCatchupReplicaSet { result, .. } => {
            ft.on_cancel_catchup_reply(cx, result);
        }
        ProxyReply::ReportFault { kind, .. } => {
            tracing::info!(ft = %id, ?kind, "replica reported fault");
            ft.on_report_fault(cx, kind);
        }
    }
}

// ============================================================================
// Client RPC
// ============================================================================

fn on_client_report_fault(
    table: &mut FailoverUnitTable,
    cx: &mut Context<'_>,
    request: &ClientReportFaultRequest,
) {
    let code = if request.force && request.kind == FaultType::Transient {
        ErrorCode::ForceNotSupportedForReplicaOperation
    } else if request.node != cx.node {
        ErrorCode::ReplicaDoesNotExist
    } else {
        match table.get_mut(request.ft) {
            Some(ft) => ft.on_client_report_fault(cx, request),
            None => ErrorCode::ReplicaDoesNotExist,
        }
    };
    tracing::info!(ft = %request.ft, replica = %request.replica_id, kind = ?request.kind, force = request.force, ?code, "client report fault");
    cx.reply_client(ClientReportFaultReply::new(request, code));
}

// ============================================================================
// Local Jobs
// ============================================================================

fn on_local_job(ft: &mut FailoverUnit, cx: &mut Context<'_>, job: FtJob) {
    match job {
        FtJob::HostingCompleted { op, result } => ft.on_hosting_completed(cx, op, result),
        FtJob::ServiceTypeRegistered(registration) => {
            ft.on_service_type_registered(cx, registration);
        }
        FtJob::HostClosed => ft.on_host_closed(cx),
        FtJob::ReplicaUpAcknowledged(instance) => ft.on_replica_up_acknowledged(instance),
        FtJob::GenerationAdvanced => {
            if ft.on_generation_advanced() {
                tracing::debug!(ft = %ft.id(), "dropped replica forgotten by new generation");
            }
        }
        FtJob::Retry => {
            if ft.is_retry_required() {
                ft.retry(cx);
            }
        }
        FtJob::Upgrade(work) => match work {
            FtUpgradeWork::Close => ft.begin_upgrade_close(cx),
            FtUpgradeWork::ResendClose => ft.resend_close(cx),
            FtUpgradeWork::Drop => ft.drop_for_upgrade(cx),
            FtUpgradeWork::ApplicationCompleted {
                instance,
                version,
                service_types,
            } => ft.finish_application_upgrade(cx, instance, &version, &service_types),
            FtUpgradeWork::FabricCompleted {
                deactivation_info_supported,
            } => ft.finish_fabric_upgrade(cx, deactivation_info_supported),
        },
        FtJob::Fm { .. } | FtJob::Peer { .. } | FtJob::Proxy(_) | FtJob::ClientReportFault(_) => {}
    }
}
