//! The node driver.
//!
//! [`NodeDriver`] owns the agent and runs it on a tokio task:
//!
//! 1. Events arrive in the bounded [`Inbox`] from any task or thread
//! 2. The driver drains the inbox into the agent and runs its job queue
//! 3. The output is executed: sends, Hosting tasks, timers, checkpoints
//! 4. Hosting completions and timer expiries come back through the inbox
//!
//! The agent never blocks the driver. Hosting operations run as spawned
//! tasks whose handles are kept per [`OperationId`] so they can be aborted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use failover_config::{ConfigLoader, RaConfig};
use failover_ra::{
    Effect, FailoverUnit, HostingRequest, Inbox, METRICS, OperationOwner, Outbound, RaEvent,
    RaOutput, ReconfigurationAgent, TimerKind,
};
use failover_types::{NodeId, OperationId, Timestamp};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{NodeError, NodeResult};
use crate::services::{CheckpointSink, Hosting, Proxy, Transport};

/// Delay before a background task retries delivery into a full inbox.
const REDELIVERY_DELAY: Duration = Duration::from_millis(10);

// ============================================================================
// Mailbox
// ============================================================================

#[derive(Debug, Clone)]
struct Mailbox {
    inbox: Arc<Inbox>,
    wake: Arc<Notify>,
}

impl Mailbox {
    fn deliver(&self, event: RaEvent) -> NodeResult<()> {
        self.inbox.push(event)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Delivery from a timer or Hosting task. These events cannot be
    /// regenerated, so a full inbox is waited out.
    async fn deliver_eventually(&self, event: RaEvent) {
        loop {
            match self.deliver(event.clone()) {
                Ok(()) => return,
                Err(error) => {
                    tracing::warn!(%error, event = event.name(), "redelivering into full inbox");
                    tokio::time::sleep(REDELIVERY_DELAY).await;
                }
            }
        }
    }
}

/// Handle for feeding events to a running driver.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    mailbox: Mailbox,
    shutdown: Arc<watch::Sender<bool>>,
}

impl NodeHandle {
    /// Queues an event. Fails with [`RaError::InboxFull`] under backpressure.
    ///
    /// [`RaError::InboxFull`]: failover_ra::RaError::InboxFull
    pub fn submit(&self, event: RaEvent) -> NodeResult<()> {
        if *self.shutdown.borrow() {
            return Err(NodeError::Stopped);
        }
        self.mailbox.deliver(event)
    }

    /// Stops the driver after its current drain.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

// ============================================================================
// Driver
// ============================================================================

/// The external collaborators of one node.
pub struct Services<T, P, H, C> {
    pub transport: T,
    pub proxy: P,
    pub hosting: H,
    pub checkpoints: C,
}

pub struct NodeDriver<T, P, H, C> {
    agent: ReconfigurationAgent,
    mailbox: Mailbox,
    shutdown: watch::Receiver<bool>,
    transport: T,
    proxy: P,
    hosting: Arc<H>,
    checkpoints: C,
    /// Origin of the agent's clock.
    started: Instant,
    operations: HashMap<OperationId, JoinHandle<()>>,
    timers: HashMap<TimerKind, JoinHandle<()>>,
}

impl<T, P, H, C> NodeDriver<T, P, H, C>
where
    T: Transport,
    P: Proxy,
    H: Hosting,
    C: CheckpointSink,
{
    pub fn new(
        node: NodeId,
        config: RaConfig,
        services: Services<T, P, H, C>,
    ) -> NodeResult<(Self, NodeHandle)> {
        config.validate()?;
        let mailbox = Mailbox {
            inbox: Arc::new(Inbox::new(config.runtime.inbox_capacity)),
            wake: Arc::new(Notify::new()),
        };
        let (shutdown_tx, shutdown) = watch::channel(false);
        let handle = NodeHandle {
            mailbox: mailbox.clone(),
            shutdown: Arc::new(shutdown_tx),
        };

        let driver = Self {
            agent: ReconfigurationAgent::new(node, config),
            mailbox,
            shutdown,
            transport: services.transport,
            proxy: services.proxy,
            hosting: Arc::new(services.hosting),
            checkpoints: services.checkpoints,
            started: Instant::now(),
            operations: HashMap::new(),
            timers: HashMap::new(),
        };
        Ok((driver, handle))
    }

    /// Builds a driver from the layered node configuration.
    pub fn with_loader(
        node: NodeId,
        loader: ConfigLoader,
        services: Services<T, P, H, C>,
    ) -> NodeResult<(Self, NodeHandle)> {
        for (layer, path) in loader.layers() {
            tracing::info!(node = %node, ?layer, path = %path.display(), "loading configuration layer");
        }
        let config = loader.load()?;
        Self::new(node, config, services)
    }

    pub fn agent(&self) -> &ReconfigurationAgent {
        &self.agent
    }

    /// Loads checkpointed failover units. Call before [`Self::run`].
    pub fn restore(&mut self, units: impl IntoIterator<Item = FailoverUnit>) {
        let output = self.agent.restore(self.now(), units);
        self.apply(output);
    }

    /// Runs until [`NodeHandle::shutdown`] or an invariant violation.
    pub async fn run(mut self) -> NodeResult<()> {
        tracing::info!(node = %self.agent.node(), "reconfiguration agent started");
        let result = self.serve().await;
        self.stop_tasks();
        match &result {
            Ok(()) => tracing::info!(node = %self.agent.node(), "reconfiguration agent stopped"),
            Err(error) => {
                tracing::error!(node = %self.agent.node(), %error, "reconfiguration agent failed");
            }
        }
        result
    }

    async fn serve(&mut self) -> NodeResult<()> {
        let wake = Arc::clone(&self.mailbox.wake);
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            self.drain()?;

            let closed = tokio::select! {
                () = wake.notified() => false,
                changed = self.shutdown.changed() => changed.is_err(),
            };
            if closed {
                return Ok(());
            }
        }
    }

    /// Feeds queued events to the agent until both the inbox and the job
    /// queue are empty.
    fn drain(&mut self) -> NodeResult<()> {
        let batch = self.agent.config().runtime.max_jobs_per_drain;
        loop {
            for event in self.mailbox.inbox.drain(batch) {
                if let RaEvent::HostingCompleted { op, .. } = &event {
                    self.operations.remove(op);
                }
                self.agent.submit(event);
            }
            if !self.agent.has_pending_jobs() {
                return Ok(());
            }

            let started = std::time::Instant::now();
            let output = self.agent.run(self.now())?;
            METRICS.record_job_latency(started.elapsed());
            self.apply(output);
        }
    }

    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.started.elapsed().as_millis() as u64)
    }

    // ========================================================================
    // Output Execution
    // ========================================================================

    fn apply(&mut self, output: RaOutput) {
        for message in output.messages {
            match message {
                Outbound::Fm { authority, message } => self.transport.send_fm(authority, message),
                Outbound::Peer { to, message } => self.transport.send_peer(to, message),
                Outbound::Proxy { ft, request } => self.proxy.send(ft, request),
                Outbound::Client(reply) => self.transport.reply_client(reply),
            }
        }
        for effect in output.effects {
            self.apply_effect(effect);
        }
        for event in output.health {
            self.transport.report_health(event);
        }
    }

    fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::BeginHosting { op, owner, request } => self.begin_hosting(op, owner, request),
            Effect::CancelOperation(op) => {
                if let Some(task) = self.operations.remove(&op) {
                    tracing::debug!(op = %op, "cancelling hosting operation");
                    task.abort();
                }
            }
            Effect::ArmTimer { timer, after } => self.arm_timer(timer, after),
            Effect::TerminateServiceHost { host_id } => {
                tracing::warn!(host = %host_id, "terminating service host");
                self.hosting.terminate_service_host(&host_id);
            }
            Effect::Persist(ft) => self.checkpoints.persist(&ft),
            Effect::Forget(id) => self.checkpoints.forget(id),
        }
    }

    fn begin_hosting(&mut self, op: OperationId, owner: OperationOwner, request: HostingRequest) {
        let hosting = Arc::clone(&self.hosting);
        let mailbox = self.mailbox.clone();
        let task = tokio::spawn(async move {
            let result = hosting.execute(request).await;
            mailbox
                .deliver_eventually(RaEvent::HostingCompleted { owner, op, result })
                .await;
        });
        self.operations.insert(op, task);
    }

    /// Arms `timer`, replacing an armed timer of the same kind.
    fn arm_timer(&mut self, timer: TimerKind, after: Duration) {
        let mailbox = self.mailbox.clone();
        let kind = timer.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            mailbox.deliver_eventually(RaEvent::Timer(kind)).await;
        });
        if let Some(previous) = self.timers.insert(timer, task) {
            previous.abort();
        }
    }

    fn stop_tasks(&mut self) {
        for (_, task) in self.operations.drain() {
            task.abort();
        }
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::future::Future;
    use std::sync::Mutex;

    use failover_ra::error::{ErrorCode, ErrorKind, RaError};
    use failover_ra::message::{
        FailoverUnitDescription, ReplicaDescription, ReplicaMessageBody, ServiceDescription,
        ServiceTypeRegistration,
    };
    use failover_ra::{
        ClientReportFaultReply, FmEnvelope, FmMessage, FmOutbound, GenerationHeader, HealthEvent,
        HostingOutcome, PeerMessage, ProxyReply, ProxyRequest,
    };
    use failover_types::{
        Authority, Epoch, FailoverUnitId, Generation, PackageVersionInstance, ReplicaInstance,
        ReplicaRole, ReplicaState,
    };
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
    use tracing_subscriber::EnvFilter;

    use super::*;

    const FT: FailoverUnitId = FailoverUnitId::new(1);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    // ------------------------------------------------------------------------
    // Test Doubles
    // ------------------------------------------------------------------------

    struct ChannelTransport {
        fm: UnboundedSender<FmOutbound>,
    }

    impl Transport for ChannelTransport {
        fn send_fm(&self, _authority: Authority, message: FmOutbound) {
            let _ = self.fm.send(message);
        }

        fn send_peer(&self, _to: NodeId, _message: PeerMessage) {}

        fn reply_client(&self, _reply: ClientReportFaultReply) {}

        fn report_health(&self, _event: HealthEvent) {}
    }

    struct ChannelProxy {
        requests: UnboundedSender<(FailoverUnitId, ProxyRequest)>,
    }

    impl Proxy for ChannelProxy {
        fn send(&self, ft: FailoverUnitId, request: ProxyRequest) {
            let _ = self.requests.send((ft, request));
        }
    }

    /// Answers registration lookups, or leaves them hanging.
    struct ScriptedHosting {
        requests: UnboundedSender<HostingRequest>,
        registers: bool,
    }

    impl Hosting for ScriptedHosting {
        fn execute(
            &self,
            request: HostingRequest,
        ) -> impl Future<Output = Result<HostingOutcome, ErrorKind>> + Send {
            let _ = self.requests.send(request.clone());
            let registers = self.registers;
            async move {
                match request {
                    HostingRequest::FindServiceTypeRegistration { .. } if registers => {
                        Ok(HostingOutcome::Registered(ServiceTypeRegistration {
                            host_id: "host-1".to_string(),
                            runtime_id: "runtime-1".to_string(),
                        }))
                    }
                    HostingRequest::FindServiceTypeRegistration { .. } => {
                        std::future::pending().await
                    }
                    _ => Err(ErrorKind::Fatal),
                }
            }
        }

        fn terminate_service_host(&self, _host_id: &str) {}
    }

    #[derive(Clone, Default)]
    struct MemoryCheckpoints {
        units: Arc<Mutex<BTreeMap<FailoverUnitId, FailoverUnit>>>,
    }

    impl MemoryCheckpoints {
        fn snapshot(&self) -> Vec<FailoverUnit> {
            self.units.lock().expect("lock").values().cloned().collect()
        }
    }

    impl CheckpointSink for MemoryCheckpoints {
        fn persist(&self, ft: &FailoverUnit) {
            self.units.lock().expect("lock").insert(ft.id(), ft.clone());
        }

        fn forget(&self, id: FailoverUnitId) {
            self.units.lock().expect("lock").remove(&id);
        }
    }

    type TestServices = Services<ChannelTransport, ChannelProxy, ScriptedHosting, MemoryCheckpoints>;

    struct Harness {
        fm: UnboundedReceiver<FmOutbound>,
        proxy: UnboundedReceiver<(FailoverUnitId, ProxyRequest)>,
        hosting: UnboundedReceiver<HostingRequest>,
        checkpoints: MemoryCheckpoints,
    }

    fn harness(registers: bool) -> (Harness, TestServices) {
        let (fm_tx, fm) = unbounded_channel();
        let (proxy_tx, proxy) = unbounded_channel();
        let (hosting_tx, hosting) = unbounded_channel();
        let checkpoints = MemoryCheckpoints::default();
        let services = Services {
            transport: ChannelTransport { fm: fm_tx },
            proxy: ChannelProxy { requests: proxy_tx },
            hosting: ScriptedHosting {
                requests: hosting_tx,
                registers,
            },
            checkpoints: checkpoints.clone(),
        };
        let harness = Harness {
            fm,
            proxy,
            hosting,
            checkpoints,
        };
        (harness, services)
    }

    fn add_primary() -> RaEvent {
        RaEvent::Fm(FmEnvelope {
            header: GenerationHeader {
                generation: Generation::new(0),
                authority: Authority::Fm,
            },
            message: FmMessage::AddPrimary(ReplicaMessageBody {
                ft: FailoverUnitDescription::new(FT, Epoch::INVALID, Epoch::new(1, 1)),
                service: ServiceDescription {
                    name: "fabric:/app/svc".to_string(),
                    application: "fabric:/app".to_string(),
                    service_type: "SvcType".to_string(),
                    has_persisted_state: true,
                    is_adhoc: false,
                    package: PackageVersionInstance::new("1.0", 1),
                },
                replica: ReplicaDescription::new(
                    NodeId::new(1),
                    ReplicaInstance::new(1, 1),
                    ReplicaRole::Primary,
                    ReplicaState::InCreate,
                    true,
                ),
            }),
        })
    }

    /// Drives AddPrimary through registration and open.
    async fn open_primary(handle: &NodeHandle, harness: &mut Harness) {
        handle.submit(add_primary()).expect("submit");
        let request = harness.hosting.recv().await.expect("registration lookup");
        assert!(matches!(request, HostingRequest::FindServiceTypeRegistration { .. }));

        let (ft, request) = harness.proxy.recv().await.expect("open request");
        assert_eq!(ft, FT);
        assert!(matches!(request, ProxyRequest::Open { .. }));

        handle
            .submit(RaEvent::Proxy {
                ft: FT,
                reply: ProxyReply::ReplicaOpen {
                    instance: ReplicaInstance::new(1, 1),
                    result: Ok(()),
                },
            })
            .expect("submit");
        let reply = harness.fm.recv().await.expect("reply to FM");
        assert!(matches!(
            reply,
            FmOutbound::AddPrimaryReply(body) if body.error == ErrorCode::Success
        ));
    }

    // ------------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn add_primary_round_trip_checkpoints_ready_unit() {
        init_tracing();
        let (mut harness, services) = harness(true);
        let (driver, handle) =
            NodeDriver::new(NodeId::new(1), RaConfig::development(), services).expect("driver");
        let task = tokio::spawn(driver.run());

        open_primary(&handle, &mut harness).await;

        handle.shutdown();
        task.await.expect("join").expect("clean shutdown");
        assert!(matches!(handle.submit(add_primary()), Err(NodeError::Stopped)));

        let units = harness.checkpoints.snapshot();
        assert_eq!(units.len(), 1);
        assert!(units[0].is_local_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_timer_reissues_hung_registration() {
        init_tracing();
        let (mut harness, services) = harness(false);
        let (driver, handle) =
            NodeDriver::new(NodeId::new(1), RaConfig::development(), services).expect("driver");
        let task = tokio::spawn(driver.run());

        handle.submit(add_primary()).expect("submit");
        harness.hosting.recv().await.expect("first lookup");
        // The paused clock advances to the retry timer once every task idles.
        let retried = harness.hosting.recv().await.expect("second lookup");
        assert!(matches!(retried, HostingRequest::FindServiceTypeRegistration { .. }));
        assert!(harness.proxy.try_recv().is_err());

        handle.shutdown();
        task.await.expect("join").expect("clean shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn restored_unit_reopens_and_reports_up() {
        init_tracing();
        let (mut first, services) = harness(true);
        let (driver, handle) =
            NodeDriver::new(NodeId::new(1), RaConfig::development(), services).expect("driver");
        let task = tokio::spawn(driver.run());
        open_primary(&handle, &mut first).await;
        handle.shutdown();
        task.await.expect("join").expect("clean shutdown");

        let (mut second, services) = harness(true);
        let (mut driver, handle) =
            NodeDriver::new(NodeId::new(1), RaConfig::development(), services).expect("driver");
        driver.restore(first.checkpoints.snapshot());
        assert_eq!(driver.agent().table().len(), 1);
        let task = tokio::spawn(driver.run());

        let request = second.hosting.recv().await.expect("reopen lookup");
        assert!(matches!(request, HostingRequest::FindServiceTypeRegistration { .. }));
        let (_, request) = second.proxy.recv().await.expect("reopen request");
        assert!(matches!(request, ProxyRequest::Reopen { .. }));

        let batch = second.fm.recv().await.expect("replica up batch");
        assert!(matches!(batch, FmOutbound::ReplicaUp { ref up, .. } if up.len() == 1));

        handle.shutdown();
        task.await.expect("join").expect("clean shutdown");
    }

    #[tokio::test]
    async fn full_inbox_pushes_back_on_submit() {
        let (_harness, services) = harness(true);
        let mut config = RaConfig::development();
        config.runtime.inbox_capacity = 1;
        let (_driver, handle) = NodeDriver::new(NodeId::new(1), config, services).expect("driver");

        handle.submit(add_primary()).expect("first event fits");
        let err = handle.submit(add_primary()).expect_err("second event rejected");
        assert!(matches!(err, NodeError::Ra(RaError::InboxFull { capacity: 1 })));
    }

    #[tokio::test]
    async fn driver_uses_layered_node_configuration() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(failover_config::PROJECT_FILE),
            "[runtime]\ninbox_capacity = 8\n",
        )
        .expect("write project config");
        std::fs::write(
            dir.path().join(failover_config::LOCAL_FILE),
            "[runtime]\ninbox_capacity = 1\n",
        )
        .expect("write local config");

        let loader = ConfigLoader::new()
            .with_project_dir(dir.path())
            .with_env_prefix("FAILOVER_NODE_TEST_LAYERS")
            .without_user_config();
        let (_harness, services) = harness(true);
        let (driver, handle) =
            NodeDriver::with_loader(NodeId::new(1), loader, services).expect("driver");
        assert_eq!(driver.agent().config().runtime.inbox_capacity, 1);

        handle.submit(add_primary()).expect("first event fits");
        assert!(matches!(
            handle.submit(add_primary()),
            Err(NodeError::Ra(RaError::InboxFull { capacity: 1 }))
        ));
    }

    #[tokio::test]
    async fn invalid_layered_configuration_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(failover_config::PROJECT_FILE),
            "[runtime]\nmax_jobs_per_drain = 0\n",
        )
        .expect("write project config");

        let loader = ConfigLoader::new()
            .with_project_dir(dir.path())
            .with_env_prefix("FAILOVER_NODE_TEST_INVALID")
            .without_user_config();
        let (_harness, services) = harness(true);
        assert!(matches!(
            NodeDriver::with_loader(NodeId::new(1), loader, services),
            Err(NodeError::Config(failover_config::ConfigError::Invalid { .. }))
        ));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let (_harness, services) = harness(true);
        let mut config = RaConfig::default();
        config.runtime.max_jobs_per_drain = 0;
        assert!(matches!(
            NodeDriver::new(NodeId::new(1), config, services),
            Err(NodeError::Config(_))
        ));
    }
}
