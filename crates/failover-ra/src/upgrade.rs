//! Upgrade orchestration.
//!
//! One state machine per [`UpgradeKey`], running beside the failover units:
//!
//! ```text
//! Download → Analyze → WaitForCloseCompletion → UpgradeHosting
//!          → WaitForDropCompletion → WaitForReplicaDownCompletion → Completed
//! ```
//!
//! Fabric upgrades skip `Analyze` (every unit is affected) and have nothing
//! to drop. The machine never mutates a failover unit directly: it returns
//! [`FtUpgradeWork`] items that the agent queues on each unit's job queue,
//! and it re-checks the units' state on every `Upgrade` timer.

use std::collections::{BTreeMap, BTreeSet};

use failover_types::{Authority, FailoverUnitId, OperationId, Timestamp, UpgradeInstanceId};

use crate::context::Context;
use crate::error::ErrorKind;
use crate::failover_unit::FailoverUnit;
use crate::instrumentation::METRICS;
use crate::message::{
    ApplicationUpgradeSpec, CancelUpgradeResult, FabricUpgradeSpec, FmOutbound, HostingOutcome,
    HostingRequest, UpgradeKey,
};
use crate::output::{Effect, OperationOwner, TimerKind};
use crate::table::FailoverUnitTable;

// ============================================================================
// Requests and Work Items
// ============================================================================

/// An application or fabric upgrade request, normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub key: UpgradeKey,
    pub instance: UpgradeInstanceId,
    pub version: String,
    pub service_types: Vec<String>,
    pub removed_service_types: Vec<String>,
    pub deactivation_info_supported: bool,
}

impl From<&ApplicationUpgradeSpec> for UpgradeRequest {
    fn from(spec: &ApplicationUpgradeSpec) -> Self {
        Self {
            key: UpgradeKey::Application(spec.application.clone()),
            instance: spec.instance,
            version: spec.version.clone(),
            service_types: spec.service_types.clone(),
            removed_service_types: spec.removed_service_types.clone(),
            deactivation_info_supported: false,
        }
    }
}

impl From<&FabricUpgradeSpec> for UpgradeRequest {
    fn from(spec: &FabricUpgradeSpec) -> Self {
        Self {
            key: UpgradeKey::Fabric,
            instance: spec.instance,
            version: spec.version.clone(),
            service_types: Vec::new(),
            removed_service_types: Vec::new(),
            deactivation_info_supported: spec.deactivation_info_supported,
        }
    }
}

impl UpgradeRequest {
    /// Packages still present after the upgrade.
    fn present_service_types(&self) -> Vec<String> {
        self.service_types
            .iter()
            .filter(|t| !self.removed_service_types.contains(t))
            .cloned()
            .collect()
    }
}

/// Work an upgrade queues on one failover unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FtUpgradeWork {
    Close,
    ResendClose,
    Drop,
    ApplicationCompleted {
        instance: UpgradeInstanceId,
        version: String,
        service_types: Vec<String>,
    },
    FabricCompleted {
        deactivation_info_supported: bool,
    },
}

pub(crate) type FanOut = Vec<(FailoverUnitId, FtUpgradeWork)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpgradeState {
    Download,
    Analyze,
    WaitForCloseCompletion,
    UpgradeHosting,
    WaitForDropCompletion,
    WaitForReplicaDownCompletion,
    Completed,
}

// ============================================================================
// Upgrade Machine
// ============================================================================

#[derive(Debug, Clone)]
struct UpgradeMachine {
    request: UpgradeRequest,
    authority: Authority,
    state: UpgradeState,
    pending_operation: Option<OperationId>,
    affected: BTreeSet<FailoverUnitId>,
    to_drop: BTreeSet<FailoverUnitId>,
    /// Units that were open when closing started; FM must acknowledge them down.
    down_pending: BTreeSet<FailoverUnitId>,
    close_started_at: Option<Timestamp>,
    terminated_hosts: BTreeSet<String>,
}

impl UpgradeMachine {
    fn new(request: UpgradeRequest, authority: Authority) -> Self {
        Self {
            request,
            authority,
            state: UpgradeState::Download,
            pending_operation: None,
            affected: BTreeSet::new(),
            to_drop: BTreeSet::new(),
            down_pending: BTreeSet::new(),
            close_started_at: None,
            terminated_hosts: BTreeSet::new(),
        }
    }

    fn key(&self) -> &UpgradeKey {
        &self.request.key
    }

    fn enter(&mut self, state: UpgradeState) {
        tracing::info!(upgrade = %self.request.key, instance = %self.request.instance, ?state, "upgrade state changed");
        self.state = state;
    }

    fn arm_timer(&self, cx: &mut Context<'_>) {
        cx.effect(Effect::ArmTimer {
            timer: TimerKind::Upgrade(self.key().clone()),
            after: cx.config.timing.upgrade_check_interval(),
        });
    }

    fn hosting_request(&self) -> Option<HostingRequest> {
        let key = self.key().clone();
        let version = self.request.version.clone();
        let service_types = self.request.present_service_types();
        match self.state {
            UpgradeState::Download => Some(HostingRequest::Download {
                key,
                version,
                service_types,
            }),
            UpgradeState::Analyze => Some(HostingRequest::Analyze {
                key,
                version,
                service_types,
            }),
            UpgradeState::UpgradeHosting => Some(HostingRequest::Upgrade {
                key,
                version,
                service_types,
            }),
            _ => None,
        }
    }

    fn issue_hosting(&mut self, cx: &mut Context<'_>) {
        let Some(request) = self.hosting_request() else {
            return;
        };
        let op = cx.begin_hosting(OperationOwner::Upgrade(self.key().clone()), request);
        self.pending_operation = Some(op);
    }

    fn affects(&self, ft: &FailoverUnit, service_types: &[String]) -> bool {
        match self.key() {
            UpgradeKey::Fabric => true,
            UpgradeKey::Application(name) => {
                ft.service().application == *name
                    && service_types.contains(&ft.service().service_type)
            }
        }
    }

    fn in_application(&self, ft: &FailoverUnit) -> bool {
        match self.key() {
            UpgradeKey::Fabric => true,
            UpgradeKey::Application(name) => ft.service().application == *name,
        }
    }

    fn start_closing(
        &mut self,
        cx: &mut Context<'_>,
        table: &FailoverUnitTable,
        affected_service_types: &[String],
    ) -> FanOut {
        let affected = table.ids_where(|ft| ft.is_open() && self.affects(ft, affected_service_types));
        let to_drop = match self.key() {
            UpgradeKey::Fabric => Vec::new(),
            UpgradeKey::Application(_) => table.ids_where(|ft| {
                ft.is_open()
                    && self.in_application(ft)
                    && self
                        .request
                        .removed_service_types
                        .contains(&ft.service().service_type)
            }),
        };

        self.affected = affected.iter().copied().collect();
        self.down_pending = self.affected.clone();
        self.to_drop = to_drop.into_iter().collect();
        self.close_started_at = Some(cx.now);
        self.enter(UpgradeState::WaitForCloseCompletion);
        tracing::info!(
            upgrade = %self.request.key,
            affected = self.affected.len(),
            to_drop = self.to_drop.len(),
            "closing replicas for upgrade"
        );

        let mut fan: FanOut = affected.into_iter().map(|id| (id, FtUpgradeWork::Close)).collect();
        fan.extend(self.advance(cx, table));
        fan
    }

    /// Moves through every state whose completion predicate already holds.
    fn advance(&mut self, cx: &mut Context<'_>, table: &FailoverUnitTable) -> FanOut {
        loop {
            match self.state {
                UpgradeState::WaitForCloseCompletion => {
                    if !self.pending_closes(table).is_empty() {
                        self.arm_timer(cx);
                        return Vec::new();
                    }
                    self.enter(UpgradeState::UpgradeHosting);
                    self.issue_hosting(cx);
                    return Vec::new();
                }
                UpgradeState::WaitForDropCompletion => {
                    if !self.pending_drops(table).is_empty() {
                        self.arm_timer(cx);
                        return Vec::new();
                    }
                    self.enter(UpgradeState::WaitForReplicaDownCompletion);
                }
                UpgradeState::WaitForReplicaDownCompletion => {
                    let waiting = self.down_pending.iter().any(|id| {
                        table
                            .get(*id)
                            .is_some_and(|ft| ft.replica_up_pending().is_some())
                    });
                    if waiting {
                        self.arm_timer(cx);
                        return Vec::new();
                    }
                    return self.complete(cx, table);
                }
                _ => return Vec::new(),
            }
        }
    }

    fn pending_closes(&self, table: &FailoverUnitTable) -> Vec<FailoverUnitId> {
        self.affected
            .iter()
            .copied()
            .filter(|id| {
                table
                    .get(*id)
                    .is_some_and(|ft| ft.is_open() && !ft.local_open().is_closed())
            })
            .collect()
    }

    fn pending_drops(&self, table: &FailoverUnitTable) -> Vec<FailoverUnitId> {
        self.to_drop
            .iter()
            .copied()
            .filter(|id| table.get(*id).is_some_and(FailoverUnit::is_open))
            .collect()
    }

    fn complete(&mut self, cx: &mut Context<'_>, table: &FailoverUnitTable) -> FanOut {
        self.enter(UpgradeState::Completed);
        let work = match self.key() {
            UpgradeKey::Fabric => FtUpgradeWork::FabricCompleted {
                deactivation_info_supported: self.request.deactivation_info_supported,
            },
            UpgradeKey::Application(_) => FtUpgradeWork::ApplicationCompleted {
                instance: self.request.instance,
                version: self.request.version.clone(),
                service_types: self.request.present_service_types(),
            },
        };
        let fan = table
            .ids_where(|ft| self.in_application(ft))
            .into_iter()
            .map(|id| (id, work.clone()))
            .collect();
        cx.send_fm(
            self.authority,
            completion_reply(self.key(), self.request.instance),
        );
        METRICS.increment_upgrades_completed();
        fan
    }

    /// Re-sends closes and drops still outstanding. Hosts of replicas that
    /// exceeded the close deadline are terminated once.
    fn resend(&mut self, cx: &mut Context<'_>, table: &FailoverUnitTable) -> FanOut {
        match self.state {
            UpgradeState::WaitForCloseCompletion => {
                let pending = self.pending_closes(table);
                let overdue = self.close_started_at.is_some_and(|start| {
                    cx.now.saturating_since(start)
                        >= cx.config.timing.upgrade_max_replica_close_duration()
                });
                if overdue {
                    for id in &pending {
                        let Some(host) = table.get(*id).and_then(FailoverUnit::registration) else {
                            continue;
                        };
                        if self.terminated_hosts.insert(host.host_id.clone()) {
                            tracing::warn!(upgrade = %self.request.key, ft = %id, host = %host.host_id, "replica exceeded upgrade close deadline");
                            cx.effect(Effect::TerminateServiceHost {
                                host_id: host.host_id.clone(),
                            });
                        }
                    }
                }
                pending
                    .into_iter()
                    .map(|id| {
                        let closing = table.get(id).is_some_and(|ft| ft.local_open().is_closing());
                        let work = if closing {
                            FtUpgradeWork::ResendClose
                        } else {
                            FtUpgradeWork::Close
                        };
                        (id, work)
                    })
                    .collect()
            }
            UpgradeState::WaitForDropCompletion => self
                .pending_drops(table)
                .into_iter()
                .map(|id| {
                    let closing = table.get(id).is_some_and(|ft| ft.local_open().is_closing());
                    let work = if closing {
                        FtUpgradeWork::ResendClose
                    } else {
                        FtUpgradeWork::Drop
                    };
                    (id, work)
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn completion_reply(key: &UpgradeKey, instance: UpgradeInstanceId) -> FmOutbound {
    match key {
        UpgradeKey::Application(application) => FmOutbound::NodeUpgradeReply {
            application: application.clone(),
            instance,
        },
        UpgradeKey::Fabric => FmOutbound::NodeFabricUpgradeReply { instance },
    }
}

fn cancel_reply(
    key: &UpgradeKey,
    instance: UpgradeInstanceId,
    result: CancelUpgradeResult,
) -> FmOutbound {
    match key {
        UpgradeKey::Application(application) => FmOutbound::CancelApplicationUpgradeReply {
            application: application.clone(),
            instance,
            result,
        },
        UpgradeKey::Fabric => FmOutbound::CancelFabricUpgradeReply { instance, result },
    }
}

// ============================================================================
// Upgrade Processor
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct UpgradeProcessor {
    active: BTreeMap<UpgradeKey, UpgradeMachine>,
    completed: BTreeMap<UpgradeKey, UpgradeInstanceId>,
}

impl UpgradeProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &UpgradeKey) -> Option<UpgradeState> {
        self.active.get(key).map(|m| m.state)
    }

    pub fn active_instance(&self, key: &UpgradeKey) -> Option<UpgradeInstanceId> {
        self.active.get(key).map(|m| m.request.instance)
    }

    pub fn last_completed(&self, key: &UpgradeKey) -> Option<UpgradeInstanceId> {
        self.completed.get(key).copied()
    }

    pub(crate) fn on_request(
        &mut self,
        cx: &mut Context<'_>,
        authority: Authority,
        request: UpgradeRequest,
    ) {
        let key = request.key.clone();
        let instance = request.instance;

        if self.completed.get(&key).is_some_and(|done| instance <= *done) {
            tracing::debug!(upgrade = %key, %instance, "replaying reply for completed upgrade");
            cx.send_fm(authority, completion_reply(&key, instance));
            return;
        }

        if let Some(active) = self.active.get(&key) {
            let current = active.request.instance;
            if instance == current {
                tracing::debug!(upgrade = %key, %instance, "upgrade already in progress");
                return;
            }
            if instance < current {
                tracing::debug!(upgrade = %key, %instance, %current, "dropping stale upgrade request");
                return;
            }
            tracing::info!(upgrade = %key, %instance, superseded = %current, "upgrade superseded");
            if let Some(op) = active.pending_operation {
                cx.effect(Effect::CancelOperation(op));
            }
        }

        tracing::info!(upgrade = %key, %instance, version = %request.version, "upgrade started");
        let mut machine = UpgradeMachine::new(request, authority);
        machine.issue_hosting(cx);
        self.active.insert(key, machine);
    }

    pub(crate) fn on_cancel(
        &mut self,
        cx: &mut Context<'_>,
        authority: Authority,
        key: &UpgradeKey,
        instance: UpgradeInstanceId,
    ) {
        let result = match self.active.get(key) {
            Some(machine) if machine.request.instance == instance => {
                if matches!(machine.state, UpgradeState::Download | UpgradeState::Analyze) {
                    if let Some(op) = machine.pending_operation {
                        cx.effect(Effect::CancelOperation(op));
                    }
                    self.active.remove(key);
                    self.completed.insert(key.clone(), instance);
                    tracing::info!(upgrade = %key, %instance, "upgrade cancelled");
                    CancelUpgradeResult::Success
                } else {
                    CancelUpgradeResult::NotAllowed
                }
            }
            Some(_) => CancelUpgradeResult::NotAllowed,
            None if self.completed.get(key).is_some_and(|done| instance <= *done) => {
                CancelUpgradeResult::NotAllowed
            }
            None => {
                self.completed.insert(key.clone(), instance);
                CancelUpgradeResult::Success
            }
        };
        cx.send_fm(authority, cancel_reply(key, instance, result));
    }

    pub(crate) fn on_hosting_completed(
        &mut self,
        cx: &mut Context<'_>,
        table: &FailoverUnitTable,
        key: &UpgradeKey,
        op: OperationId,
        result: Result<HostingOutcome, ErrorKind>,
    ) -> FanOut {
        let Some(machine) = self.active.get_mut(key) else {
            return Vec::new();
        };
        if machine.pending_operation != Some(op) {
            tracing::debug!(upgrade = %key, op = %op, "dropping completion of superseded upgrade operation");
            return Vec::new();
        }
        machine.pending_operation = None;

        let fan = match (machine.state, result) {
            (_, Err(ErrorKind::Cancelled)) => Vec::new(),
            (state, Err(error)) => {
                tracing::warn!(upgrade = %key, ?state, %error, "upgrade hosting operation failed");
                machine.arm_timer(cx);
                Vec::new()
            }
            (UpgradeState::Download, Ok(HostingOutcome::Downloaded)) => match key {
                UpgradeKey::Fabric => machine.start_closing(cx, table, &[]),
                UpgradeKey::Application(_) => {
                    machine.enter(UpgradeState::Analyze);
                    machine.issue_hosting(cx);
                    Vec::new()
                }
            },
            (UpgradeState::Analyze, Ok(HostingOutcome::Analyzed { affected_service_types })) => {
                machine.start_closing(cx, table, &affected_service_types)
            }
            (UpgradeState::UpgradeHosting, Ok(HostingOutcome::Upgraded)) => {
                machine.enter(UpgradeState::WaitForDropCompletion);
                let mut fan: FanOut = machine
                    .to_drop
                    .iter()
                    .map(|id| (*id, FtUpgradeWork::Drop))
                    .collect();
                fan.extend(machine.advance(cx, table));
                fan
            }
            (state, Ok(outcome)) => {
                tracing::warn!(upgrade = %key, ?state, ?outcome, "unexpected hosting outcome for upgrade");
                Vec::new()
            }
        };
        self.retire_if_completed(key);
        fan
    }

    pub(crate) fn on_timer(
        &mut self,
        cx: &mut Context<'_>,
        table: &FailoverUnitTable,
        key: &UpgradeKey,
    ) -> FanOut {
        let Some(machine) = self.active.get_mut(key) else {
            return Vec::new();
        };

        let fan = match machine.state {
            UpgradeState::Download | UpgradeState::Analyze | UpgradeState::UpgradeHosting => {
                if machine.pending_operation.is_none() {
                    machine.issue_hosting(cx);
                }
                Vec::new()
            }
            UpgradeState::Completed => Vec::new(),
            _ => {
                let mut fan = machine.advance(cx, table);
                if fan.is_empty() && machine.state != UpgradeState::Completed {
                    fan = machine.resend(cx, table);
                }
                fan
            }
        };
        self.retire_if_completed(key);
        fan
    }

    fn retire_if_completed(&mut self, key: &UpgradeKey) {
        if self
            .active
            .get(key)
            .is_some_and(|m| m.state == UpgradeState::Completed)
        {
            if let Some(machine) = self.active.remove(key) {
                tracing::info!(upgrade = %key, instance = %machine.request.instance, "upgrade completed");
                self.completed.insert(key.clone(), machine.request.instance);
            }
        }
    }
}
