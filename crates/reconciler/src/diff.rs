//! Identity-keyed diff between desired and actual snapshots.

use std::collections::{BTreeMap, BTreeSet};

/// A key present on both sides whose payloads differ.
#[derive(Debug, Clone, PartialEq)]
pub struct Update<V> {
    pub desired: V,
    pub actual: V,
}

/// Three disjoint sets: create, update and delete.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff<K: Ord, V> {
    /// Desired with no actual counterpart.
    pub to_create: BTreeMap<K, V>,
    /// On both sides with differing payload.
    pub to_update: BTreeMap<K, Update<V>>,
    /// Actual with no desired counterpart.
    pub to_delete: BTreeMap<K, V>,
}

impl<K: Ord, V> Diff<K, V> {
    /// Diff two keyed snapshots; `same` decides whether a pair needs no update.
    pub fn compute<F>(desired: BTreeMap<K, V>, mut actual: BTreeMap<K, V>, same: F) -> Self
    where
        F: Fn(&V, &V) -> bool,
    {
        let mut to_create = BTreeMap::new();
        let mut to_update = BTreeMap::new();

        for (key, wanted) in desired {
            match actual.remove(&key) {
                None => {
                    to_create.insert(key, wanted);
                }
                Some(current) if !same(&wanted, &current) => {
                    to_update.insert(
                        key,
                        Update {
                            desired: wanted,
                            actual: current,
                        },
                    );
                }
                Some(_) => {}
            }
        }

        Self {
            to_create,
            to_update,
            to_delete: actual,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

impl<K: Ord> Diff<K, ()> {
    /// Diff two sets where identity is the whole value.
    pub fn of_sets(desired: BTreeSet<K>, actual: BTreeSet<K>) -> Self {
        Self::compute(
            desired.into_iter().map(|k| (k, ())).collect(),
            actual.into_iter().map(|k| (k, ())).collect(),
            |_, _| true,
        )
    }
}
