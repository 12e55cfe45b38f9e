//! The reconfiguration agent.
//!
//! [`ReconfigurationAgent`] is the top-level router of the functional core.
//! Events are checked against the authority generation when they are
//! submitted, routed to a job key (one partition or the node), and executed
//! one job item at a time:
//!
//! ```text
//! submit(event) ──► generation check ──► JobQueue<JobKey, Job>
//!                                              │
//! run(now) ◄───────────────────────────────────┘
//!   ├─ Ft job:   staleness filter ──► FailoverUnit handler ──► invariants ──► Persist/Forget
//!   └─ Node job: generation / upgrade / timers ──► fan-out Ft jobs
//! ```
//!
//! Nothing here performs I/O. The caller delivers [`RaOutput`] and feeds
//! completions and timer expiries back in as [`RaEvent`]s.

mod dispatch;
mod event;
mod node;

#[cfg(test)]
mod tests;

pub use event::RaEvent;

use failover_config::RaConfig;
use failover_types::{FailoverUnitId, NodeId, OperationId, Timestamp};

use self::event::{FtJob, Job, JobKey, NodeJob};
use self::node::{ArmedTimers, NodeScope};
use crate::context::Context;
use crate::error::Result;
use crate::failover_unit::FailoverUnit;
use crate::generation::GenerationStateManager;
use crate::instrumentation::METRICS;
use crate::job_queue::JobQueue;
use crate::output::{Effect, RaOutput, TimerKind};
use crate::table::FailoverUnitTable;
use crate::upgrade::UpgradeProcessor;

#[derive(Debug)]
pub struct ReconfigurationAgent {
    node: NodeId,
    config: RaConfig,
    table: FailoverUnitTable,
    generations: GenerationStateManager,
    upgrades: UpgradeProcessor,
    jobs: JobQueue<JobKey, Job>,
    next_operation: OperationId,
    timers: ArmedTimers,
    /// Whether the running platform code supports deactivation info.
    deactivation_info_supported: bool,
}

impl ReconfigurationAgent {
    pub fn new(node: NodeId, config: RaConfig) -> Self {
        let deactivation_info_supported = config.reconfiguration.is_deactivation_info_enabled;
        Self {
            node,
            config,
            table: FailoverUnitTable::new(),
            generations: GenerationStateManager::new(),
            upgrades: UpgradeProcessor::new(),
            jobs: JobQueue::new(),
            next_operation: OperationId::new(0),
            timers: ArmedTimers::default(),
            deactivation_info_supported,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn config(&self) -> &RaConfig {
        &self.config
    }

    pub fn table(&self) -> &FailoverUnitTable {
        &self.table
    }

    pub fn failover_unit(&self, id: FailoverUnitId) -> Option<&FailoverUnit> {
        self.table.get(id)
    }

    pub fn generations(&self) -> &GenerationStateManager {
        &self.generations
    }

    pub fn upgrades(&self) -> &UpgradeProcessor {
        &self.upgrades
    }

    pub fn has_pending_jobs(&self) -> bool {
        !self.jobs.is_empty()
    }

    /// Loads checkpointed units after a node restart. Local replicas did not
    /// survive the restart: persisted ones are reopened, the rest dropped.
    pub fn restore(
        &mut self,
        now: Timestamp,
        units: impl IntoIterator<Item = FailoverUnit>,
    ) -> RaOutput {
        let mut cx = Context::new(self.node, &self.config, now, &mut self.next_operation);
        let mut restored = 0usize;
        for mut ft in units {
            ft.recover_after_restart(&mut cx);
            self.table.insert(ft);
            restored += 1;
        }
        let mut output = cx.into_output();
        tracing::info!(node = %self.node, restored, "restored failover units");
        self.arm_timers(&mut output);
        METRICS.set_failover_units(self.table.len() as u64);
        output
    }

    /// Queues an event. Messages stamped with a generation other than the
    /// authority's current one are dropped here. Returns whether the event
    /// was queued.
    pub fn submit(&mut self, event: RaEvent) -> bool {
        if let RaEvent::Fm(envelope) = &event {
            if !envelope.message.is_generation_handshake()
                && !self.generations.is_current(&envelope.header)
            {
                METRICS.increment_messages_generation_rejected();
                tracing::debug!(
                    authority = %envelope.header.authority,
                    generation = %envelope.header.generation,
                    message = envelope.message.name(),
                    "dropping message from another generation"
                );
                return false;
            }
        }
        let (key, job) = Job::route(event);
        self.jobs.push(key, job);
        METRICS.set_pending_jobs(self.jobs.len() as u64);
        true
    }

    /// Executes queued job items, at most `runtime.max_jobs_per_drain` of
    /// them. Call again while [`Self::has_pending_jobs`] is true.
    pub fn run(&mut self, now: Timestamp) -> Result<RaOutput> {
        let mut output = RaOutput::empty();
        let mut executed = 0;
        while executed < self.config.runtime.max_jobs_per_drain {
            let Some((key, job)) = self.jobs.pop() else {
                break;
            };
            executed += 1;
            let result = self.execute(now, key, job);
            self.jobs.complete(&key);
            output.merge(result?);
        }

        self.arm_timers(&mut output);
        METRICS.set_failover_units(self.table.len() as u64);
        METRICS.set_pending_jobs(self.jobs.len() as u64);
        Ok(output)
    }

    /// Submits one event and runs the queue.
    pub fn process(&mut self, now: Timestamp, event: RaEvent) -> Result<RaOutput> {
        self.submit(event);
        self.run(now)
    }

    // ========================================================================
    // Job Execution
    // ========================================================================

    fn execute(&mut self, now: Timestamp, key: JobKey, job: Job) -> Result<RaOutput> {
        METRICS.increment_jobs_executed();
        match (key, job) {
            (JobKey::FailoverUnit(id), Job::Ft(job)) => self.execute_ft(now, id, job),
            (JobKey::Node, Job::Node(job)) => Ok(self.execute_node(now, job)),
            (key, job) => {
                tracing::warn!(?key, ?job, "job item queued under the wrong key");
                Ok(RaOutput::empty())
            }
        }
    }

    fn execute_ft(&mut self, now: Timestamp, id: FailoverUnitId, job: FtJob) -> Result<RaOutput> {
        let before = self.table.get(id).cloned();
        let mut cx = Context::new(self.node, &self.config, now, &mut self.next_operation);
        dispatch::execute(
            &mut self.table,
            &mut cx,
            id,
            job,
            self.deactivation_info_supported,
        );
        let mut output = cx.into_output();

        let Some(ft) = self.table.get(id) else {
            return Ok(output);
        };
        if let Err(error) = ft.check_invariants() {
            tracing::error!(ft = %id, %error, "protocol invariant violated");
            return Err(error);
        }

        let forget = !ft.is_open() && ft.is_deleted() && ft.replica_up_pending().is_none();
        if forget {
            self.table.remove(id);
            tracing::info!(ft = %id, "failover unit removed");
            output.effects.push(Effect::Forget(id));
        } else if before.as_ref() != Some(ft) {
            output.effects.push(Effect::Persist(Box::new(ft.clone())));
        }
        Ok(output)
    }

    fn execute_node(&mut self, now: Timestamp, job: NodeJob) -> RaOutput {
        let mut cx = Context::new(self.node, &self.config, now, &mut self.next_operation);
        let mut scope = NodeScope {
            table: &self.table,
            generations: &mut self.generations,
            upgrades: &mut self.upgrades,
            timers: &mut self.timers,
            deactivation_info_supported: &mut self.deactivation_info_supported,
        };
        let work = scope.execute(&mut cx, job);
        for (id, job) in work {
            self.jobs.push(JobKey::FailoverUnit(id), Job::Ft(job));
        }
        cx.into_output()
    }

    /// Arms the agent-wide timers that have work and are not armed yet.
    fn arm_timers(&mut self, output: &mut RaOutput) {
        if !self.timers.retry && self.table.iter().any(FailoverUnit::is_retry_required) {
            self.timers.retry = true;
            output.effects.push(Effect::ArmTimer {
                timer: TimerKind::MessageRetry,
                after: self.config.timing.message_retry_interval(),
            });
        }
        if !self.timers.replica_up
            && self
                .table
                .iter()
                .any(|ft| ft.replica_up_pending().is_some())
        {
            self.timers.replica_up = true;
            output.effects.push(Effect::ArmTimer {
                timer: TimerKind::ReplicaUpUpload,
                after: self.config.timing.replica_up_batch_interval(),
            });
        }
    }
}
