//! # failover-types: Core types for the reconfiguration agent
//!
//! This crate contains the value types shared by the agent and its shell:
//! - Entity IDs ([`FailoverUnitId`], [`NodeId`], [`ReplicaId`], [`InstanceId`])
//! - Logical clocks ([`Epoch`], [`ReplicaInstance`], [`Generation`], [`UpgradeInstanceId`])
//! - Replica classification ([`ReplicaRole`], [`ReplicaState`])
//! - Authorities ([`Authority`])
//! - Replication progress ([`Lsn`], [`DeactivationInfo`])
//! - Packaging ([`PackageVersionInstance`])
//! - Temporal types ([`Timestamp`])
//! - Async operation tracking ([`OperationId`])

use std::{
    fmt::{Debug, Display},
    ops::Add,
    time::Duration,
};

use serde::{Deserialize, Serialize};

// ============================================================================
// Entity IDs - All Copy (cheap 8-byte values)
// ============================================================================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        pub struct $name(u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(
    /// Identifier of a partition (failover unit).
    FailoverUnitId
);

define_id!(
    /// Identifier of a cluster node.
    NodeId
);

define_id!(
    /// Logical replica slot within a failover unit.
    ReplicaId
);

define_id!(
    /// Restart counter of a replica slot. Strictly increasing.
    InstanceId
);

define_id!(
    /// Handshake generation issued by an authority.
    Generation
);

define_id!(
    /// Monotonic upgrade instance issued by the failover manager.
    UpgradeInstanceId
);

define_id!(
    /// Handle of an asynchronous Hosting operation.
    OperationId
);

impl FailoverUnitId {
    /// The failover manager's own partition. Owned by the FMM.
    pub const FM_SERVICE: FailoverUnitId = FailoverUnitId(0);

    /// Authority responsible for this partition.
    pub fn owner(self) -> Authority {
        if self == Self::FM_SERVICE {
            Authority::Fmm
        } else {
            Authority::Fm
        }
    }
}

impl Generation {
    /// Returns the next generation.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl OperationId {
    /// Returns the next operation id.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

// ============================================================================
// Authority
// ============================================================================

/// Cluster-wide authority that owns a failover unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Authority {
    /// Failover Manager. Owns every user partition.
    Fm,
    /// Failover Manager Master. Owns the FM's own partition.
    Fmm,
}

impl Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authority::Fm => write!(f, "FM"),
            Authority::Fmm => write!(f, "FMM"),
        }
    }
}

// ============================================================================
// Epoch
// ============================================================================

/// Configuration epoch.
///
/// Totally ordered: the data loss version is compared first, then the
/// configuration version. The zero epoch is the invalid epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch {
    pub data_loss_version: u64,
    pub configuration_version: u64,
}

impl Epoch {
    /// The invalid epoch ("000").
    pub const INVALID: Epoch = Epoch {
        data_loss_version: 0,
        configuration_version: 0,
    };

    pub const fn new(data_loss_version: u64, configuration_version: u64) -> Self {
        Self {
            data_loss_version,
            configuration_version,
        }
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.data_loss_version, self.configuration_version)
    }
}

// ============================================================================
// Replica Instance
// ============================================================================

/// (replica id, instance id) pair.
///
/// Ordered lexicographically: a new replica slot always outranks every
/// instance of an older slot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReplicaInstance {
    pub replica_id: ReplicaId,
    pub instance_id: InstanceId,
}

impl ReplicaInstance {
    pub const fn new(replica_id: u64, instance_id: u64) -> Self {
        Self {
            replica_id: ReplicaId::new(replica_id),
            instance_id: InstanceId::new(instance_id),
        }
    }
}

impl Display for ReplicaInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.replica_id, self.instance_id)
    }
}

// ============================================================================
// Replica Classification
// ============================================================================

/// Role of a replica within one configuration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum ReplicaRole {
    /// Not part of the configuration.
    #[default]
    None,
    /// Being built; receives replication but does not count towards quorum.
    Idle,
    Secondary,
    Primary,
}

impl ReplicaRole {
    /// Returns true for roles that count towards a configuration's quorum.
    pub fn is_in_configuration(self) -> bool {
        matches!(self, ReplicaRole::Primary | ReplicaRole::Secondary)
    }
}

impl Display for ReplicaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            ReplicaRole::None => "N",
            ReplicaRole::Idle => "I",
            ReplicaRole::Secondary => "S",
            ReplicaRole::Primary => "P",
        };
        f.write_str(code)
    }
}

/// Lifecycle state of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReplicaState {
    #[default]
    InCreate,
    InBuild,
    StandBy,
    Ready,
    Dropped,
}

impl Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            ReplicaState::InCreate => "IC",
            ReplicaState::InBuild => "IB",
            ReplicaState::StandBy => "SB",
            ReplicaState::Ready => "RD",
            ReplicaState::Dropped => "DD",
        };
        f.write_str(code)
    }
}

// ============================================================================
// Replication Progress
// ============================================================================

/// Log sequence number reported by the replicator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Lsn(u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Last epoch in which a replica was deactivated, with its catch-up LSN.
///
/// An invalid epoch means the sender does not support deactivation info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct DeactivationInfo {
    pub epoch: Epoch,
    pub catchup_lsn: Lsn,
}

impl DeactivationInfo {
    pub const INVALID: DeactivationInfo = DeactivationInfo {
        epoch: Epoch::INVALID,
        catchup_lsn: Lsn::ZERO,
    };

    pub const fn new(epoch: Epoch, catchup_lsn: Lsn) -> Self {
        Self { epoch, catchup_lsn }
    }

    pub fn is_valid(&self) -> bool {
        self.epoch.is_valid()
    }
}

// ============================================================================
// Packaging
// ============================================================================

/// Code package version of a service together with the upgrade instance
/// that installed it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct PackageVersionInstance {
    pub version: String,
    pub instance: UpgradeInstanceId,
}

impl PackageVersionInstance {
    pub fn new(version: impl Into<String>, instance: u64) -> Self {
        Self {
            version: version.into(),
            instance: UpgradeInstanceId::new(instance),
        }
    }
}

// ============================================================================
// Temporal Types
// ============================================================================

/// Milliseconds on the agent's monotonic clock.
///
/// The state machine never reads a clock; the shell passes `now` with every
/// event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`. Saturates at zero.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(Epoch::new(4, 11), Epoch::new(4, 22) ; "configuration version breaks ties")]
    #[test_case(Epoch::new(3, 99), Epoch::new(4, 0) ; "data loss version dominates")]
    #[test_case(Epoch::INVALID, Epoch::new(0, 1) ; "invalid epoch is lowest")]
    fn epoch_ordering(lower: Epoch, higher: Epoch) {
        assert!(lower < higher);
    }

    #[test]
    fn replica_instance_orders_by_replica_id_first() {
        assert!(ReplicaInstance::new(1, 9) < ReplicaInstance::new(2, 1));
        assert!(ReplicaInstance::new(2, 1) < ReplicaInstance::new(2, 2));
    }

    #[test]
    fn fm_service_is_owned_by_fmm() {
        assert_eq!(FailoverUnitId::FM_SERVICE.owner(), Authority::Fmm);
        assert_eq!(FailoverUnitId::new(7).owner(), Authority::Fm);
    }

    #[test]
    fn deactivation_info_validity_follows_epoch() {
        assert!(!DeactivationInfo::INVALID.is_valid());
        assert!(DeactivationInfo::new(Epoch::new(4, 11), Lsn::new(3)).is_valid());
    }

    #[test]
    fn role_quorum_membership() {
        assert!(ReplicaRole::Primary.is_in_configuration());
        assert!(ReplicaRole::Secondary.is_in_configuration());
        assert!(!ReplicaRole::Idle.is_in_configuration());
        assert!(!ReplicaRole::None.is_in_configuration());
    }

    #[test]
    fn epoch_serde_shape() {
        let json = serde_json::to_string(&Epoch::new(4, 11)).expect("serialize");
        assert_eq!(json, r#"{"data_loss_version":4,"configuration_version":11}"#);
    }

    proptest! {
        #[test]
        fn timestamp_since_is_inverse_of_add(start in 0u64..1_000_000, delta in 0u64..1_000_000) {
            let t0 = Timestamp::from_millis(start);
            let t1 = t0 + Duration::from_millis(delta);
            prop_assert_eq!(t1.saturating_since(t0), Duration::from_millis(delta));
            prop_assert_eq!(t0.saturating_since(t1), Duration::ZERO);
        }
    }
}
