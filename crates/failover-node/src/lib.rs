//! # failover-node: Tokio driver for the reconfiguration agent
//!
//! Hosts one [`failover_ra::ReconfigurationAgent`] per node and executes its
//! output against the node's collaborators. The driver is the only place
//! where clocks, tasks and IO exist; the agent stays a pure state machine.
//!
//! ```ignore
//! let services = Services { transport, proxy, hosting, checkpoints };
//! let (mut driver, handle) = NodeDriver::new(node, config, services)?;
//! driver.restore(checkpointed_units);
//! tokio::spawn(driver.run());
//! handle.submit(RaEvent::Fm(envelope))?;
//! ```

mod driver;
mod error;
pub mod services;

pub use driver::{NodeDriver, NodeHandle, Services};
pub use error::{NodeError, NodeResult};
pub use services::{CheckpointSink, Hosting, Proxy, Transport};
