//! Node-scoped job items: generation handshake, upgrades, Hosting
//! notifications, timers and the ReplicaUp batch.
//!
//! Node jobs never mutate a failover unit. Work for a unit is returned as a
//! job item and queued on that unit's own key.

use failover_types::{Authority, FailoverUnitId};

use super::event::{FtJob, NodeJob};
use crate::context::Context;
use crate::failover_unit::{FailoverUnit, ReplicaUpKind};
use crate::generation::{GenerationStateManager, GenerationUpdateOutcome};
use crate::instrumentation::METRICS;
use crate::message::{FmMessage, FmOutbound, HostingEvent, UpgradeKey};
use crate::output::TimerKind;
use crate::table::FailoverUnitTable;
use crate::upgrade::{FanOut, FtUpgradeWork, UpgradeProcessor, UpgradeRequest};

/// Agent-wide timers currently armed in the shell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ArmedTimers {
    pub retry: bool,
    pub replica_up: bool,
}

pub(super) type FtWork = Vec<(FailoverUnitId, FtJob)>;

/// Borrowed node-level state for one job item.
pub(super) struct NodeScope<'a> {
    pub table: &'a FailoverUnitTable,
    pub generations: &'a mut GenerationStateManager,
    pub upgrades: &'a mut UpgradeProcessor,
    pub timers: &'a mut ArmedTimers,
    pub deactivation_info_supported: &'a mut bool,
}

impl NodeScope<'_> {
    pub(super) fn execute(&mut self, cx: &mut Context<'_>, job: NodeJob) -> FtWork {
        match job {
            NodeJob::Fm { authority, message } => self.on_fm_message(cx, authority, message),
            NodeJob::Hosting(event) => self.on_hosting_event(event),
            NodeJob::UpgradeCompleted { key, op, result } => {
                let fan = self
                    .upgrades
                    .on_hosting_completed(cx, self.table, &key, op, result);
                self.upgrade_work(fan)
            }
            NodeJob::Timer(timer) => self.on_timer(cx, timer),
        }
    }

    // ------------------------------------------------------------------------
    // Failover Manager
    // ------------------------------------------------------------------------

    fn on_fm_message(
        &mut self,
        cx: &mut Context<'_>,
        authority: Authority,
        message: FmMessage,
    ) -> FtWork {
        match message {
            FmMessage::GenerationProposal { proposed } => {
                let (receive, proposed) = self.generations.on_proposal(authority, proposed);
                tracing::debug!(%authority, %receive, %proposed, "generation proposal");
                cx.send_fm(authority, FmOutbound::GenerationProposalReply { receive, proposed });
                Vec::new()
            }
            FmMessage::GenerationUpdate { generation } => {
                match self.generations.on_update(authority, generation) {
                    GenerationUpdateOutcome::Stale => {
                        METRICS.increment_messages_generation_rejected();
                        tracing::debug!(%authority, %generation, "dropping stale generation update");
                        Vec::new()
                    }
                    GenerationUpdateOutcome::Accepted { previous } => {
                        tracing::info!(%authority, %previous, %generation, "generation advanced");
                        let units = self
                            .table
                            .owned_by(authority)
                            .filter_map(FailoverUnit::replica_up_entry)
                            .collect();
                        cx.send_fm(authority, FmOutbound::LfumUpload { generation, units });
                        self.table
                            .owned_by(authority)
                            .map(|ft| (ft.id(), FtJob::GenerationAdvanced))
                            .collect()
                    }
                }
            }
            FmMessage::LfumUploadReply { generation } => {
                if self.generations.on_lfum_upload_reply(authority, generation) {
                    tracing::info!(%authority, %generation, "failover unit map upload acknowledged");
                } else {
                    tracing::debug!(%authority, %generation, "dropping stale upload reply");
                }
                Vec::new()
            }
            FmMessage::ReplicaUpReply { acknowledged } => acknowledged
                .into_iter()
                .map(|ack| (ack.ft, FtJob::ReplicaUpAcknowledged(ack.instance)))
                .collect(),
            FmMessage::NodeUpgradeRequest(spec) => {
                self.upgrades
                    .on_request(cx, authority, UpgradeRequest::from(&spec));
                Vec::new()
            }
            FmMessage::NodeFabricUpgradeRequest(spec) => {
                self.upgrades
                    .on_request(cx, authority, UpgradeRequest::from(&spec));
                Vec::new()
            }
            FmMessage::CancelApplicationUpgradeRequest(spec) => {
                let key = UpgradeKey::Application(spec.application);
                self.upgrades.on_cancel(cx, authority, &key, spec.instance);
                Vec::new()
            }
            FmMessage::CancelFabricUpgradeRequest(spec) => {
                self.upgrades
                    .on_cancel(cx, authority, &UpgradeKey::Fabric, spec.instance);
                Vec::new()
            }
            other => {
                tracing::debug!(message = other.name(), "partition message on node queue");
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------------
    // Hosting
    // ------------------------------------------------------------------------

    fn on_hosting_event(&mut self, event: HostingEvent) -> FtWork {
        match event {
            HostingEvent::ServiceTypeRegistered {
                service_type,
                registration,
            } => self
                .table
                .ids_where(|ft| ft.is_open() && ft.service().service_type == service_type)
                .into_iter()
                .map(|id| (id, FtJob::ServiceTypeRegistered(registration.clone())))
                .collect(),
            HostingEvent::AppHostClosed { host_id } => {
                tracing::info!(host = %host_id, "application host closed");
                self.table
                    .ids_where(|ft| ft.registration().is_some_and(|r| r.host_id == host_id))
                    .into_iter()
                    .map(|id| (id, FtJob::HostClosed))
                    .collect()
            }
            HostingEvent::RuntimeClosed { runtime_id } => {
                tracing::info!(runtime = %runtime_id, "runtime closed");
                self.table
                    .ids_where(|ft| ft.registration().is_some_and(|r| r.runtime_id == runtime_id))
                    .into_iter()
                    .map(|id| (id, FtJob::HostClosed))
                    .collect()
            }
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn on_timer(&mut self, cx: &mut Context<'_>, timer: TimerKind) -> FtWork {
        match timer {
            TimerKind::MessageRetry => {
                self.timers.retry = false;
                self.table
                    .ids_where(FailoverUnit::is_retry_required)
                    .into_iter()
                    .map(|id| (id, FtJob::Retry))
                    .collect()
            }
            TimerKind::ReplicaUpUpload => {
                self.timers.replica_up = false;
                self.upload_replica_up(cx, Authority::Fm);
                self.upload_replica_up(cx, Authority::Fmm);
                Vec::new()
            }
            TimerKind::Upgrade(key) => {
                let fan = self.upgrades.on_timer(cx, self.table, &key);
                self.upgrade_work(fan)
            }
        }
    }

    /// Sends one ReplicaUp batch with every pending report for `authority`.
    fn upload_replica_up(&self, cx: &mut Context<'_>, authority: Authority) {
        let mut up = Vec::new();
        let mut dropped = Vec::new();
        for ft in self.table.owned_by(authority) {
            let Some(kind) = ft.replica_up_pending() else {
                continue;
            };
            let Some(entry) = ft.replica_up_entry() else {
                continue;
            };
            match kind {
                ReplicaUpKind::Up | ReplicaUpKind::Down => up.push(entry),
                ReplicaUpKind::Dropped => dropped.push(entry),
            }
        }
        if up.is_empty() && dropped.is_empty() {
            return;
        }
        tracing::debug!(%authority, up = up.len(), dropped = dropped.len(), "uploading replica up batch");
        cx.send_fm(authority, FmOutbound::ReplicaUp { up, dropped });
    }

    fn upgrade_work(&mut self, fan: FanOut) -> FtWork {
        for (_, work) in &fan {
            if let FtUpgradeWork::FabricCompleted {
                deactivation_info_supported,
            } = work
            {
                *self.deactivation_info_supported = *deactivation_info_supported;
            }
        }
        fan.into_iter()
            .map(|(id, work)| (id, FtJob::Upgrade(work)))
            .collect()
    }
}
