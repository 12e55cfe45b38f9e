//! End-to-end tests of the agent: events in, output out.

use failover_config::RaConfig;
use failover_types::{
    Authority, DeactivationInfo, Epoch, FailoverUnitId, Generation, Lsn, NodeId, ReplicaId,
    ReplicaInstance, ReplicaRole, ReplicaState, Timestamp, UpgradeInstanceId,
};
use proptest::prelude::*;
use test_case::test_case;

use super::*;
use crate::error::{ErrorCode, RaError};
use crate::failover_unit::test_support::{ready_unit, service};
use crate::failover_unit::{FailoverUnitState, LocalOpenStatus, ReplicaUpKind};
use crate::message::{
    ApplicationUpgradeSpec, ClientReportFaultRequest, CloseMode, ConfigurationBody,
    FailoverUnitDescription, FaultType, FmEnvelope, FmMessage, FmOutbound, GenerationHeader,
    GetLsnReplyBody, HostingOutcome, HostingRequest, PeerMessage, ProxyReply, ProxyRequest,
    ReplicaDescription, ReplicaMessageBody, ReplicaUpAck, ReplicatorStatus,
    ServiceTypeRegistration, UpdateConfigurationKind,
};
use crate::output::{Effect, OperationOwner, Outbound, TimerKind};
use crate::replica::Replica;

// ============================================================================
// Helpers
// ============================================================================

const FT: FailoverUnitId = FailoverUnitId::new(1);

fn agent() -> ReconfigurationAgent {
    ReconfigurationAgent::new(NodeId::new(1), RaConfig::development())
}

fn at(millis: u64) -> Timestamp {
    Timestamp::from_millis(millis)
}

fn fm(generation: u64, message: FmMessage) -> RaEvent {
    RaEvent::Fm(FmEnvelope {
        header: GenerationHeader {
            generation: Generation::new(generation),
            authority: Authority::Fm,
        },
        message,
    })
}

fn replica_body(cc: Epoch, node: u64, instance: ReplicaInstance, role: ReplicaRole) -> ReplicaMessageBody {
    ReplicaMessageBody {
        ft: FailoverUnitDescription::new(FT, Epoch::INVALID, cc),
        service: service(true),
        replica: ReplicaDescription::new(NodeId::new(node), instance, role, ReplicaState::InCreate, true),
    }
}

fn registration() -> ServiceTypeRegistration {
    ServiceTypeRegistration {
        host_id: "host-1".to_string(),
        runtime_id: "runtime-1".to_string(),
    }
}

/// Unit whose local replica 1:1 was dropped.
fn closed_unit(cc: Epoch) -> FailoverUnit {
    let mut ft = ready_unit(1, ReplicaRole::Secondary, cc, true);
    ft.state = FailoverUnitState::Closed;
    ft.local_open = LocalOpenStatus::Closed;
    if let Some(local) = ft.local_replica_mut() {
        local.state = ReplicaState::Dropped;
        local.is_up = false;
    }
    ft
}

fn run(agent: &mut ReconfigurationAgent, now: u64, event: RaEvent) -> RaOutput {
    agent.process(at(now), event).expect("agent run")
}

fn armed(output: &RaOutput, kind: &TimerKind) -> bool {
    output
        .effects
        .iter()
        .any(|e| matches!(e, Effect::ArmTimer { timer, .. } if timer == kind))
}

// ============================================================================
// Replica Lifecycle
// ============================================================================

#[test]
fn add_primary_opens_local_replica_and_replies_when_ready() {
    let mut ra = agent();
    let body = replica_body(Epoch::new(1, 1), 1, ReplicaInstance::new(1, 1), ReplicaRole::Primary);

    let out = run(&mut ra, 0, fm(0, FmMessage::AddPrimary(body)));
    let (op, request) = out.hosting_requests().next().expect("registration lookup");
    assert!(matches!(request, HostingRequest::FindServiceTypeRegistration { .. }));
    assert_eq!(out.fm_messages().count(), 0);
    assert!(out.effects.iter().any(|e| matches!(e, Effect::Persist(_))));
    assert!(armed(&out, &TimerKind::MessageRetry));

    let out = run(
        &mut ra,
        10,
        RaEvent::HostingCompleted {
            owner: OperationOwner::FailoverUnit(FT),
            op,
            result: Ok(HostingOutcome::Registered(registration())),
        },
    );
    assert!(matches!(out.proxy_requests().next(), Some(ProxyRequest::Open { .. })));
    assert!(!armed(&out, &TimerKind::MessageRetry));

    let out = run(
        &mut ra,
        20,
        RaEvent::Proxy {
            ft: FT,
            reply: ProxyReply::ReplicaOpen {
                instance: ReplicaInstance::new(1, 1),
                result: Ok(()),
            },
        },
    );
    let replies: Vec<_> = out
        .fm_messages()
        .filter_map(|m| match m {
            FmOutbound::AddPrimaryReply(reply) => Some(reply.error),
            _ => None,
        })
        .collect();
    assert_eq!(replies, vec![ErrorCode::Success]);

    let ft = ra.failover_unit(FT).expect("unit exists");
    assert!(ft.local_open().is_opened());
    assert!(ft.is_local_ready());
    assert_eq!(ft.local_replica().map(|r| r.cc_role), Some(ReplicaRole::Primary));
}

#[test]
fn add_primary_for_ready_replica_replies_without_proxy_call() {
    let mut ra = agent();
    ra.table.insert(ready_unit(1, ReplicaRole::Primary, Epoch::new(4, 11), true));

    let body = replica_body(Epoch::new(4, 11), 1, ReplicaInstance::new(1, 1), ReplicaRole::Primary);
    let out = run(&mut ra, 0, fm(0, FmMessage::AddPrimary(body)));

    assert_eq!(out.proxy_requests().count(), 0);
    assert!(out.fm_messages().any(|m| matches!(
        m,
        FmOutbound::AddPrimaryReply(reply) if reply.error == ErrorCode::Success
    )));
    assert!(out.effects.iter().all(|e| !matches!(e, Effect::Persist(_))));
}

#[test_case(ReplicaInstance::new(1, 1) ; "same instance")]
#[test_case(ReplicaInstance::new(2, 1) ; "higher instance")]
fn create_replica_for_closed_unit_tracks_instance_and_replies_stale(instance: ReplicaInstance) {
    let mut ra = agent();
    ra.table.insert(closed_unit(Epoch::new(1, 1)));

    let body = replica_body(Epoch::new(1, 1), 1, instance, ReplicaRole::Idle);
    let out = run(
        &mut ra,
        0,
        RaEvent::Peer {
            from: NodeId::new(2),
            message: PeerMessage::CreateReplica(body),
        },
    );

    let reply = out
        .peer_messages()
        .find_map(|(to, m)| match m {
            PeerMessage::CreateReplicaReply(reply) if to == NodeId::new(2) => Some(reply.error),
            _ => None,
        })
        .expect("reply to the primary");
    assert_eq!(reply, ErrorCode::StaleRequest);

    let ft = ra.failover_unit(FT).expect("tombstone kept");
    assert!(!ft.is_open());
    assert_eq!(ft.local_instance(), instance);
    assert_eq!(out.proxy_requests().count(), 0);
}

#[test]
fn add_primary_for_older_instance_gets_stale_reply() {
    let mut ra = agent();
    let mut ft = ready_unit(1, ReplicaRole::Primary, Epoch::new(4, 11), true);
    if let Some(local) = ft.local_replica_mut() {
        local.instance = ReplicaInstance::new(1, 3);
    }
    ra.table.insert(ft);

    let body = replica_body(Epoch::new(4, 11), 1, ReplicaInstance::new(1, 2), ReplicaRole::Primary);
    let out = run(&mut ra, 0, fm(0, FmMessage::AddPrimary(body)));

    assert!(out.fm_messages().any(|m| matches!(
        m,
        FmOutbound::AddPrimaryReply(reply) if reply.error == ErrorCode::StaleRequest
    )));
    assert_eq!(ra.failover_unit(FT).map(FailoverUnit::local_instance), Some(ReplicaInstance::new(1, 3)));
}

#[test]
fn delete_replica_closes_then_forgets_unit() {
    let mut ra = agent();
    ra.table.insert(ready_unit(1, ReplicaRole::Secondary, Epoch::new(1, 1), true));

    let body = replica_body(Epoch::new(1, 1), 1, ReplicaInstance::new(1, 1), ReplicaRole::Secondary);
    let out = run(&mut ra, 0, fm(0, FmMessage::DeleteReplica(body)));
    assert!(out.proxy_requests().any(|r| matches!(
        r,
        ProxyRequest::Close { mode: CloseMode::Delete, .. }
    )));
    assert_eq!(out.fm_messages().count(), 0);

    let out = run(
        &mut ra,
        10,
        RaEvent::Proxy {
            ft: FT,
            reply: ProxyReply::ReplicaClose {
                instance: ReplicaInstance::new(1, 1),
                mode: CloseMode::Delete,
                result: Ok(()),
            },
        },
    );
    assert!(out.fm_messages().any(|m| matches!(
        m,
        FmOutbound::DeleteReplicaReply(reply) if reply.error == ErrorCode::Success
    )));
    assert!(out.effects.contains(&Effect::Forget(FT)));
    assert!(ra.failover_unit(FT).is_none());
}

#[test]
fn proxy_reply_for_previous_instance_is_ignored() {
    let mut ra = agent();
    let mut ft = ready_unit(1, ReplicaRole::Secondary, Epoch::new(1, 1), true);
    ft.local_open = LocalOpenStatus::Closing {
        mode: CloseMode::Drop,
        registration: registration(),
    };
    ra.table.insert(ft);

    let out = run(
        &mut ra,
        0,
        RaEvent::Proxy {
            ft: FT,
            reply: ProxyReply::ReplicaClose {
                instance: ReplicaInstance::new(1, 0),
                mode: CloseMode::Drop,
                result: Ok(()),
            },
        },
    );
    assert!(out.messages.is_empty());
    assert!(ra.failover_unit(FT).is_some_and(FailoverUnit::is_open));
}

#[test]
fn retry_timer_reissues_pending_registration() {
    let mut ra = agent();
    let body = replica_body(Epoch::new(1, 1), 1, ReplicaInstance::new(1, 1), ReplicaRole::Primary);
    let out = run(&mut ra, 0, fm(0, FmMessage::AddPrimary(body)));
    let (first, _) = out.hosting_requests().next().expect("registration lookup");

    let out = run(&mut ra, 100, RaEvent::Timer(TimerKind::MessageRetry));
    let (second, _) = out.hosting_requests().next().expect("lookup reissued");
    assert_ne!(first, second);
    assert!(out.effects.contains(&Effect::CancelOperation(first)));
    assert!(armed(&out, &TimerKind::MessageRetry));

    // The superseded completion changes nothing.
    let out = run(
        &mut ra,
        110,
        RaEvent::HostingCompleted {
            owner: OperationOwner::FailoverUnit(FT),
            op: first,
            result: Ok(HostingOutcome::Registered(registration())),
        },
    );
    assert_eq!(out.proxy_requests().count(), 0);
}

#[test]
fn invariant_violation_surfaces_as_error() {
    let mut ra = agent();
    let mut ft = ready_unit(1, ReplicaRole::Primary, Epoch::new(4, 11), true);
    let mut other = Replica::new(NodeId::new(2), ReplicaInstance::new(2, 1), ReplicaRole::Primary);
    other.state = ReplicaState::Ready;
    ft.replicas.insert(NodeId::new(2), other);
    ra.table.insert(ft);

    let err = ra
        .process(
            at(0),
            fm(
                0,
                FmMessage::NodeUpdateServiceRequest {
                    ft: FT,
                    service: service(true),
                },
            ),
        )
        .expect_err("two primaries");
    assert!(matches!(err, RaError::ProtocolInvariantViolation { ft, .. } if ft == FT));
    assert!(!ra.has_pending_jobs());
}

// ============================================================================
// Reconfiguration
// ============================================================================

fn configuration_replica(node: u64, pc: ReplicaRole, cc: ReplicaRole, up: bool) -> ReplicaDescription {
    let state = if up { ReplicaState::Ready } else { ReplicaState::StandBy };
    ReplicaDescription::new(NodeId::new(node), ReplicaInstance::new(node, 1), cc, state, up)
        .with_pc_role(pc)
}

#[test]
fn failover_deactivates_replica_that_cannot_catch_up() {
    let mut ra = agent();
    ra.table.insert(ready_unit(1, ReplicaRole::Secondary, Epoch::new(4, 11), true));

    let body = ConfigurationBody {
        ft: FailoverUnitDescription::new(FT, Epoch::new(4, 11), Epoch::new(4, 22)),
        service: service(true),
        replicas: vec![
            configuration_replica(1, ReplicaRole::Secondary, ReplicaRole::Primary, true),
            configuration_replica(2, ReplicaRole::Secondary, ReplicaRole::Secondary, true),
            configuration_replica(3, ReplicaRole::Primary, ReplicaRole::Secondary, false),
        ],
        deactivation_info: DeactivationInfo::INVALID,
        phase0_duration: None,
    };
    let out = run(&mut ra, 0, fm(0, FmMessage::DoReconfiguration(body)));
    let get_lsn: Vec<NodeId> = out
        .peer_messages()
        .filter(|(_, m)| matches!(m, PeerMessage::GetLsn(_)))
        .map(|(to, _)| to)
        .collect();
    assert_eq!(get_lsn, vec![NodeId::new(2)]);

    run(
        &mut ra,
        10,
        RaEvent::Proxy {
            ft: FT,
            reply: ProxyReply::ReplicatorGetStatus {
                instance: ReplicaInstance::new(1, 1),
                result: Ok(ReplicatorStatus {
                    first_lsn: Lsn::new(5),
                    last_lsn: Lsn::new(10),
                }),
            },
        },
    );

    // Node 2 ends its log before the local log begins.
    let mut remote = configuration_replica(2, ReplicaRole::Secondary, ReplicaRole::Secondary, true);
    remote.first_lsn = Some(Lsn::new(1));
    remote.last_lsn = Some(Lsn::new(3));
    let reply = GetLsnReplyBody {
        ft: FailoverUnitDescription::new(FT, Epoch::new(4, 11), Epoch::new(4, 22)),
        replica: remote,
        deactivation_info: DeactivationInfo::INVALID,
        error: ErrorCode::Success,
    };
    let out = run(
        &mut ra,
        20,
        RaEvent::Peer {
            from: NodeId::new(2),
            message: PeerMessage::GetLsnReply(reply),
        },
    );

    assert!(out.peer_messages().any(|(to, m)| to == NodeId::new(2)
        && matches!(m, PeerMessage::Deactivate { force: true, .. })));
    assert!(!out.fm_messages().any(|m| matches!(m, FmOutbound::ChangeConfiguration(_))));
    let catchup = out
        .proxy_requests()
        .find_map(|r| match r {
            ProxyRequest::UpdateConfiguration {
                kind: UpdateConfigurationKind::Catchup,
                replicas,
                ..
            } => Some(replicas.clone()),
            _ => None,
        })
        .expect("catchup sent");
    assert!(catchup.iter().all(|r| r.node != NodeId::new(2)));
    assert!(catchup.iter().any(|r| r.node == NodeId::new(1)));
}

// ============================================================================
// Generations
// ============================================================================

#[test]
fn generation_update_uploads_units_and_fences_old_messages() {
    let mut ra = agent();
    ra.table.insert(ready_unit(1, ReplicaRole::Primary, Epoch::new(4, 11), true));

    let out = run(
        &mut ra,
        0,
        fm(
            0,
            FmMessage::GenerationProposal {
                proposed: Generation::new(3),
            },
        ),
    );
    assert_eq!(
        out.fm_messages().next(),
        Some(&FmOutbound::GenerationProposalReply {
            receive: Generation::new(0),
            proposed: Generation::new(3),
        })
    );

    let out = run(
        &mut ra,
        1,
        fm(
            3,
            FmMessage::GenerationUpdate {
                generation: Generation::new(3),
            },
        ),
    );
    let uploaded = out.fm_messages().find_map(|m| match m {
        FmOutbound::LfumUpload { generation, units } => Some((*generation, units.len())),
        _ => None,
    });
    assert_eq!(uploaded, Some((Generation::new(3), 1)));

    let body = replica_body(Epoch::new(4, 11), 1, ReplicaInstance::new(1, 1), ReplicaRole::Primary);
    assert!(!ra.submit(fm(0, FmMessage::AddPrimary(body.clone()))));
    assert!(ra.submit(fm(3, FmMessage::AddPrimary(body))));

    let out = run(
        &mut ra,
        2,
        fm(
            3,
            FmMessage::LfumUploadReply {
                generation: Generation::new(3),
            },
        ),
    );
    assert!(out.fm_messages().any(|m| matches!(m, FmOutbound::AddPrimaryReply(_))));
    assert_eq!(ra.generations().get(Authority::Fm).send, Generation::new(3));
    assert_eq!(ra.generations().get(Authority::Fmm).receive, Generation::new(0));
}

// ============================================================================
// Restart and ReplicaUp
// ============================================================================

#[test]
fn restore_reopens_persisted_and_reports_replica_up() {
    let mut ra = agent();
    let persisted = ready_unit(1, ReplicaRole::Secondary, Epoch::new(1, 1), true);
    let mut volatile = ready_unit(1, ReplicaRole::Secondary, Epoch::new(1, 1), false);
    volatile.id = FailoverUnitId::new(2);

    let out = ra.restore(at(0), vec![persisted, volatile]);
    assert_eq!(out.hosting_requests().count(), 1);
    assert!(armed(&out, &TimerKind::ReplicaUpUpload));
    assert_eq!(
        ra.failover_unit(FT).and_then(FailoverUnit::replica_up_pending),
        Some(ReplicaUpKind::Down)
    );
    assert!(ra.failover_unit(FailoverUnitId::new(2)).is_some_and(|ft| !ft.is_open()));

    let out = run(&mut ra, 50, RaEvent::Timer(TimerKind::ReplicaUpUpload));
    let batch = out.fm_messages().find_map(|m| match m {
        FmOutbound::ReplicaUp { up, dropped } => Some((up.len(), dropped.len())),
        _ => None,
    });
    assert_eq!(batch, Some((1, 1)));
    assert!(armed(&out, &TimerKind::ReplicaUpUpload));

    let acknowledged = vec![
        ReplicaUpAck {
            ft: FT,
            instance: ReplicaInstance::new(1, 1),
        },
        ReplicaUpAck {
            ft: FailoverUnitId::new(2),
            instance: ReplicaInstance::new(1, 1),
        },
    ];
    run(&mut ra, 60, fm(0, FmMessage::ReplicaUpReply { acknowledged }));
    assert!(ra.table().iter().all(|ft| ft.replica_up_pending().is_none()));

    let out = run(&mut ra, 100, RaEvent::Timer(TimerKind::ReplicaUpUpload));
    assert_eq!(out.fm_messages().count(), 0);
    assert!(!armed(&out, &TimerKind::ReplicaUpUpload));
}

// ============================================================================
// Client Report Fault
// ============================================================================

fn report_fault(node: u64, kind: FaultType, force: bool) -> RaEvent {
    RaEvent::ClientReportFault(ClientReportFaultRequest {
        node: NodeId::new(node),
        ft: FT,
        replica_id: ReplicaId::new(1),
        kind,
        force,
    })
}

#[test]
fn client_report_fault_validation() {
    let mut ra = agent();
    ra.table.insert(ready_unit(1, ReplicaRole::Secondary, Epoch::new(1, 1), true));

    let out = run(&mut ra, 0, report_fault(1, FaultType::Transient, true));
    assert_eq!(
        out.client_replies().next().map(|r| r.error),
        Some(ErrorCode::ForceNotSupportedForReplicaOperation)
    );

    let out = run(&mut ra, 1, report_fault(7, FaultType::Permanent, false));
    assert_eq!(
        out.client_replies().next().map(|r| r.error),
        Some(ErrorCode::ReplicaDoesNotExist)
    );

    let out = run(&mut ra, 2, report_fault(1, FaultType::Transient, false));
    let reply = out.client_replies().next().expect("client reply");
    assert_eq!(reply.error, ErrorCode::Success);
    assert_eq!(reply.message, ErrorCode::Success.message());
    assert!(out.proxy_requests().any(|r| matches!(
        r,
        ProxyRequest::Close { mode: CloseMode::Restart, .. }
    )));
}

// ============================================================================
// Upgrades
// ============================================================================

#[test]
fn cancelled_upgrade_instance_is_replayed_as_complete() {
    let mut ra = agent();
    let spec = ApplicationUpgradeSpec {
        application: "fabric:/app".to_string(),
        instance: UpgradeInstanceId::new(5),
        version: "2.0".to_string(),
        service_types: vec!["SvcType".to_string()],
        removed_service_types: Vec::new(),
    };

    let out = run(&mut ra, 0, fm(0, FmMessage::CancelApplicationUpgradeRequest(spec.clone())));
    assert!(matches!(
        out.fm_messages().next(),
        Some(FmOutbound::CancelApplicationUpgradeReply { .. })
    ));

    let out = run(&mut ra, 1, fm(0, FmMessage::NodeUpgradeRequest(spec)));
    assert_eq!(out.hosting_requests().count(), 0);
    assert_eq!(
        out.messages,
        vec![Outbound::Fm {
            authority: Authority::Fm,
            message: FmOutbound::NodeUpgradeReply {
                application: "fabric:/app".to_string(),
                instance: UpgradeInstanceId::new(5),
            },
        }]
    );
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// A message for an older configuration never changes the unit.
    #[test]
    fn stale_epoch_never_mutates(dlv in 0u64..4, ccv in 0u64..50) {
        let cc = Epoch::new(4, 50);
        let stale = Epoch::new(dlv, ccv);
        prop_assume!(stale < cc);

        let mut ra = agent();
        ra.table.insert(ready_unit(1, ReplicaRole::Secondary, cc, true));
        let before = ra.failover_unit(FT).cloned();

        let body = replica_body(stale, 1, ReplicaInstance::new(1, 1), ReplicaRole::Primary);
        let out = run(&mut ra, 0, fm(0, FmMessage::AddReplica(body.clone())));
        prop_assert!(out.is_empty());
        let out = run(&mut ra, 1, RaEvent::Peer {
            from: NodeId::new(2),
            message: PeerMessage::GetLsn(body),
        });
        prop_assert!(out.is_empty());
        prop_assert_eq!(ra.failover_unit(FT).cloned(), before);
    }

    /// The local instance of a unit only moves forward.
    #[test]
    fn closed_unit_instance_is_monotonic(
        instances in proptest::collection::vec((1u64..4, 1u64..4), 1..12)
    ) {
        let mut ra = agent();
        ra.table.insert(closed_unit(Epoch::new(1, 1)));
        let mut highest = ReplicaInstance::new(1, 1);

        for (i, (replica, instance)) in instances.into_iter().enumerate() {
            let requested = ReplicaInstance::new(replica, instance);
            let body = replica_body(Epoch::new(1, 1), 1, requested, ReplicaRole::Idle);
            run(&mut ra, i as u64, RaEvent::Peer {
                from: NodeId::new(2),
                message: PeerMessage::CreateReplica(body),
            });
            highest = highest.max(requested);
            let ft = ra.failover_unit(FT).expect("tombstone kept");
            prop_assert_eq!(ft.local_instance(), highest);
            prop_assert!(!ft.is_open());
        }
    }

    /// Interleaving independent partitions does not change the outcome of
    /// either.
    #[test]
    fn partitions_are_independent(swap in any::<bool>()) {
        let mut ra = agent();
        let mut second = ready_unit(1, ReplicaRole::Secondary, Epoch::new(1, 1), true);
        second.id = FailoverUnitId::new(2);
        ra.table.insert(ready_unit(1, ReplicaRole::Secondary, Epoch::new(1, 1), true));
        ra.table.insert(second);

        let delete = |id: u64| {
            let mut body = replica_body(Epoch::new(1, 1), 1, ReplicaInstance::new(1, 1), ReplicaRole::Secondary);
            body.ft.id = FailoverUnitId::new(id);
            fm(0, FmMessage::DeleteReplica(body))
        };
        let fault = ClientReportFaultRequest {
            node: NodeId::new(1),
            ft: FailoverUnitId::new(2),
            replica_id: ReplicaId::new(1),
            kind: FaultType::Permanent,
            force: false,
        };

        let events = if swap {
            vec![RaEvent::ClientReportFault(fault), delete(1)]
        } else {
            vec![delete(1), RaEvent::ClientReportFault(fault)]
        };
        for event in events {
            prop_assert!(ra.submit(event));
        }
        ra.run(at(0)).expect("run");

        let first = ra.failover_unit(FT).expect("unit 1");
        let second = ra.failover_unit(FailoverUnitId::new(2)).expect("unit 2");
        prop_assert!(matches!(first.local_open(), LocalOpenStatus::Closing { mode: CloseMode::Delete, .. }), "first should be Closing with mode Delete");
        prop_assert!(matches!(second.local_open(), LocalOpenStatus::Closing { mode: CloseMode::Abort, .. }), "second should be Closing with mode Abort");
    }
}
