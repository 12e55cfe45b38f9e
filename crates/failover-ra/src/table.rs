//! In-memory failover unit table.
//!
//! Owns every [`FailoverUnit`] by id. Job items resolve their unit through
//! the table each time they run; nothing else holds a reference to a unit.

use std::collections::BTreeMap;

use failover_types::{Authority, FailoverUnitId};

use crate::failover_unit::FailoverUnit;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailoverUnitTable {
    units: BTreeMap<FailoverUnitId, FailoverUnit>,
}

impl FailoverUnitTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: FailoverUnitId) -> Option<&FailoverUnit> {
        self.units.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: FailoverUnitId) -> Option<&mut FailoverUnit> {
        self.units.get_mut(&id)
    }

    /// Inserts or replaces a unit. Returns the replaced unit.
    pub(crate) fn insert(&mut self, ft: FailoverUnit) -> Option<FailoverUnit> {
        self.units.insert(ft.id(), ft)
    }

    pub(crate) fn remove(&mut self, id: FailoverUnitId) -> Option<FailoverUnit> {
        self.units.remove(&id)
    }

    pub fn contains(&self, id: FailoverUnitId) -> bool {
        self.units.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FailoverUnit> {
        self.units.values()
    }

    /// Ids of the units matching `predicate`, in id order.
    pub fn ids_where(&self, predicate: impl Fn(&FailoverUnit) -> bool) -> Vec<FailoverUnitId> {
        self.units
            .values()
            .filter(|ft| predicate(ft))
            .map(FailoverUnit::id)
            .collect()
    }

    /// Units owned by `authority`.
    pub fn owned_by(&self, authority: Authority) -> impl Iterator<Item = &FailoverUnit> {
        self.units.values().filter(move |ft| ft.owner() == authority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover_unit::test_support::ready_unit;
    use failover_types::{Epoch, ReplicaRole};

    #[test]
    fn insert_replaces_by_id() {
        let mut table = FailoverUnitTable::new();
        let ft = ready_unit(1, ReplicaRole::Primary, Epoch::new(4, 11), true);
        assert!(table.insert(ft.clone()).is_none());
        assert!(table.insert(ft).is_some());
        assert_eq!(table.len(), 1);
        assert!(table.owned_by(Authority::Fm).next().is_some());
        assert!(table.owned_by(Authority::Fmm).next().is_none());
    }
}
