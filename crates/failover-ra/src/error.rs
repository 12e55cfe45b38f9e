//! Error types for the reconfiguration agent.
//!
//! Three layers:
//! - [`RaError`]: failures of the agent itself. Only invariant violations
//!   and inbox backpressure surface here.
//! - [`ErrorCode`]: reply codes carried on the wire to FM, peers and clients.
//! - [`ErrorKind`]: typed failure of an asynchronous RAP or Hosting operation.

use failover_types::FailoverUnitId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for agent operations.
pub type Result<T> = std::result::Result<T, RaError>;

/// Agent-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaError {
    /// A cluster-wide invariant no longer holds for this failover unit.
    ///
    /// Fatal to the process: the state cannot be repaired locally.
    #[error("protocol invariant violated on failover unit {ft}: {detail}")]
    ProtocolInvariantViolation { ft: FailoverUnitId, detail: String },

    /// The inbox is at capacity.
    #[error("inbox full (capacity {capacity})")]
    InboxFull { capacity: usize },

    #[error("completion for unknown operation")]
    UnknownOperation,
}

/// Reply code carried on authority, peer and client replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Success,
    StaleRequest,
    ReplicaDoesNotExist,
    InvalidReplicaStateForReplicaOperation,
    InvalidReplicaOperation,
    ForceNotSupportedForReplicaOperation,
    ReplicaOperationFailed,
    NotReady,
}

impl ErrorCode {
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    /// Human-readable text returned alongside client replies.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Success => "the operation completed successfully",
            ErrorCode::StaleRequest => "the request is older than the replica it targets",
            ErrorCode::ReplicaDoesNotExist => "the replica does not exist on this node",
            ErrorCode::InvalidReplicaStateForReplicaOperation => {
                "the replica is not in a state that allows this operation"
            }
            ErrorCode::InvalidReplicaOperation => {
                "transient faults are only supported for persisted replicas"
            }
            ErrorCode::ForceNotSupportedForReplicaOperation => {
                "force is only supported for permanent faults on non ad-hoc replicas"
            }
            ErrorCode::ReplicaOperationFailed => "the replica operation failed",
            ErrorCode::NotReady => "the replica is not ready",
        }
    }
}

/// Failure of an asynchronous RAP or Hosting operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
pub enum ErrorKind {
    #[error("retryable failure")]
    Retryable,
    #[error("fatal failure")]
    Fatal,
    #[error("operation cancelled")]
    Cancelled,
    /// Catch-up cancellation raced with a demote that already finished.
    #[error("demote already completed")]
    DemoteCompleted,
    /// Catch-up succeeded but the replica set state changed on data loss.
    #[error("state changed on data loss")]
    StateChangedOnDataLoss,
}
