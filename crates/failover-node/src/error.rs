//! Driver error types.

use failover_config::ConfigError;
use failover_ra::RaError;
use thiserror::Error;

/// Result type for driver operations.
pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    /// The agent rejected an event or hit an invariant violation.
    #[error("agent error: {0}")]
    Ra(#[from] RaError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The driver was shut down.
    #[error("driver stopped")]
    Stopped,
}
