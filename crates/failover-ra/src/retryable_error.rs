//! Bounded retry with escalation.
//!
//! A [`RetryableErrorState`] counts consecutive failures of one operation
//! kind. Crossing the warning threshold yields exactly one
//! [`RetryDecision::AtWarning`]; reaching the drop threshold yields
//! [`RetryDecision::AtDrop`]. Success or a change of kind resets the count.

use failover_config::{RetryConfig, RetryThresholds};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryableErrorKind {
    ReplicaOpen,
    ReplicaReopen,
    ReplicaClose,
    FindRegistrationAtOpen,
    FindRegistrationAtReopen,
}

impl RetryableErrorKind {
    pub fn thresholds(self, config: &RetryConfig) -> RetryThresholds {
        match self {
            RetryableErrorKind::ReplicaOpen => config.replica_open,
            RetryableErrorKind::ReplicaReopen => config.replica_reopen,
            RetryableErrorKind::ReplicaClose => config.replica_close,
            RetryableErrorKind::FindRegistrationAtOpen => config.registration_at_open,
            RetryableErrorKind::FindRegistrationAtReopen => config.registration_at_reopen,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry silently.
    BelowWarning,
    /// Retry and emit one health warning.
    AtWarning,
    /// Give up on this replica instance.
    AtDrop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryableErrorState {
    kind: Option<RetryableErrorKind>,
    failure_count: u32,
    warning_emitted: bool,
}

impl RetryableErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(&self) -> Option<RetryableErrorKind> {
        self.kind
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn is_warning_emitted(&self) -> bool {
        self.warning_emitted
    }

    /// Switches to `kind`, resetting the counter if it differs from the
    /// current one. Returns true when an outstanding warning was cleared.
    pub fn enter(&mut self, kind: RetryableErrorKind) -> bool {
        if self.kind == Some(kind) {
            return false;
        }
        let cleared = self.warning_emitted;
        self.kind = Some(kind);
        self.failure_count = 0;
        self.warning_emitted = false;
        cleared
    }

    /// Records one failure of `kind`.
    pub fn increment(
        &mut self,
        kind: RetryableErrorKind,
        thresholds: RetryThresholds,
    ) -> RetryDecision {
        self.enter(kind);
        self.failure_count = self.failure_count.saturating_add(1);

        if thresholds.drop != 0 && self.failure_count >= thresholds.drop {
            return RetryDecision::AtDrop;
        }

        if self.failure_count >= thresholds.warning && !self.warning_emitted {
            self.warning_emitted = true;
            return RetryDecision::AtWarning;
        }

        RetryDecision::BelowWarning
    }

    /// The next failure would reach the drop threshold.
    pub fn is_last_retry(&self, thresholds: RetryThresholds) -> bool {
        thresholds.drop != 0 && self.failure_count.saturating_add(1) >= thresholds.drop
    }

    /// Resets the counter. Returns true when an outstanding warning was cleared.
    pub fn success(&mut self) -> bool {
        let cleared = self.warning_emitted;
        self.failure_count = 0;
        self.warning_emitted = false;
        cleared
    }

    /// Forgets the kind entirely.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const OPEN: RetryableErrorKind = RetryableErrorKind::ReplicaOpen;

    #[test]
    fn test_escalation_sequence() {
        let mut state = RetryableErrorState::new();
        let t = RetryThresholds::new(2, 4);

        assert_eq!(state.increment(OPEN, t), RetryDecision::BelowWarning);
        assert_eq!(state.increment(OPEN, t), RetryDecision::AtWarning);
        assert_eq!(state.increment(OPEN, t), RetryDecision::BelowWarning);
        assert!(state.is_last_retry(t));
        assert_eq!(state.increment(OPEN, t), RetryDecision::AtDrop);
    }

    #[test]
    fn test_success_resets_and_reports_cleared_warning() {
        let mut state = RetryableErrorState::new();
        let t = RetryThresholds::new(1, 10);

        assert_eq!(state.increment(OPEN, t), RetryDecision::AtWarning);
        assert!(state.success());
        assert_eq!(state.failure_count(), 0);
        assert!(!state.success());

        // Warning can be emitted again after a success.
        assert_eq!(state.increment(OPEN, t), RetryDecision::AtWarning);
    }

    #[test]
    fn test_kind_change_resets_counter() {
        let mut state = RetryableErrorState::new();
        let t = RetryThresholds::new(1, 3);

        state.increment(OPEN, t);
        state.increment(OPEN, t);
        assert_eq!(
            state.increment(RetryableErrorKind::ReplicaClose, t),
            RetryDecision::AtWarning
        );
        assert_eq!(state.failure_count(), 1);
        assert!(state.enter(OPEN));
    }

    #[test]
    fn test_zero_drop_threshold_never_drops() {
        let mut state = RetryableErrorState::new();
        let t = RetryThresholds::new(240, 0);

        for _ in 0..1_000 {
            assert_ne!(
                state.increment(RetryableErrorKind::FindRegistrationAtReopen, t),
                RetryDecision::AtDrop
            );
        }
        assert!(!state.is_last_retry(t));
    }

    #[test]
    fn test_thresholds_come_from_config() {
        let config = RetryConfig::default();
        assert_eq!(OPEN.thresholds(&config), config.replica_open);
        assert_eq!(
            RetryableErrorKind::FindRegistrationAtOpen.thresholds(&config),
            config.registration_at_open
        );
    }

    proptest! {
        #[test]
        fn drop_exactly_at_threshold(warning in 1u32..20, extra in 1u32..20) {
            let drop = warning + extra;
            let t = RetryThresholds::new(warning, drop);
            let mut state = RetryableErrorState::new();
            let mut warnings = 0;

            for attempt in 1..drop {
                match state.increment(OPEN, t) {
                    RetryDecision::AtDrop => prop_assert!(false, "dropped early at {}", attempt),
                    RetryDecision::AtWarning => warnings += 1,
                    RetryDecision::BelowWarning => {}
                }
            }
            prop_assert_eq!(warnings, 1);
            prop_assert_eq!(state.increment(OPEN, t), RetryDecision::AtDrop);

            state.success();
            prop_assert_eq!(state.failure_count(), 0);
        }
    }
}
