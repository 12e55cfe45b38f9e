//! # failover-ra: Per-node reconfiguration agent
//!
//! The reconfiguration agent (RA) runs on every node of the cluster. It is
//! the local executor of the Failover Manager's decisions: it opens, closes
//! and reconfigures the replicas hosted on this node, drives the primary's
//! side of every reconfiguration, and reports replica health back to the
//! authority that owns each partition.
//!
//! ## Key Principles
//!
//! - **No IO**: The agent never touches the network, disk or Hosting directly
//! - **No clocks**: `now` is passed in by the node driver with every drain
//! - **Serialized per partition**: every mutation of a failover unit runs
//!   inside one job item, and job items for one key never overlap
//! - **Explicit effects**: replies, proxy requests, Hosting calls, timers and
//!   checkpoints are returned in [`RaOutput`]
//!
//! ## Architecture
//!
//! - [`agent`]: [`ReconfigurationAgent`], the router and job executor
//! - [`failover_unit`]: the per-partition state machine
//! - [`staleness`]: epoch and instance filtering of inbound messages
//! - [`generation`]: generation handshake with FM and FMM
//! - [`upgrade`]: application and fabric upgrade state machines
//! - [`message`]: every message the agent sends or receives
//! - [`output`]: messages, effects and health events for the driver
//!
//! ## Example
//!
//! ```ignore
//! use failover_config::RaConfig;
//! use failover_ra::{RaEvent, ReconfigurationAgent};
//! use failover_types::{NodeId, Timestamp};
//!
//! let mut agent = ReconfigurationAgent::new(NodeId::new(1), RaConfig::default());
//! agent.submit(RaEvent::Fm(envelope));
//! let output = agent.run(Timestamp::from_millis(10))?;
//! for message in output.messages {
//!     // Deliver via the transport...
//! }
//! ```

pub mod agent;
mod context;
pub mod error;
pub mod failover_unit;
pub mod generation;
pub mod inbox;
pub mod instrumentation;
pub mod job_queue;
pub mod message;
pub mod output;
pub mod reconfiguration_state;
pub mod replica;
pub mod retryable_error;
pub mod staleness;
pub mod table;
pub mod upgrade;

// Re-export commonly used items
pub use agent::{RaEvent, ReconfigurationAgent};
pub use error::{ErrorCode, ErrorKind, RaError, Result};
pub use failover_unit::{FailoverUnit, FailoverUnitState, LocalOpenStatus};
pub use generation::GenerationStateManager;
pub use inbox::Inbox;
pub use instrumentation::{METRICS, Metrics, MetricsSnapshot};
pub use message::{
    ClientReportFaultReply, ClientReportFaultRequest, FmEnvelope, FmMessage, FmOutbound,
    GenerationHeader, HostingEvent, HostingOutcome, HostingRequest, PeerMessage, ProxyReply,
    ProxyRequest, UpgradeKey,
};
pub use output::{Effect, HealthEvent, OperationOwner, Outbound, RaOutput, TimerKind};
pub use table::FailoverUnitTable;
pub use upgrade::{UpgradeProcessor, UpgradeState};
