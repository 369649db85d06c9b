//! In-process materialized view of one store topic.

use std::collections::BTreeMap;

use keel_core::NOOP_KEY;

/// Offset value meaning "nothing observed / nothing known".
pub const UNKNOWN_OFFSET: i64 = -1;

/// Map of key to latest value, derived from replaying the log in order.
///
/// The map reflects exactly the upsert/tombstone history up to
/// `last_observed`, which never decreases.
#[derive(Debug, Clone, PartialEq)]
pub struct Replica<T> {
    entries: BTreeMap<String, T>,
    last_observed: i64,
}

impl<T> Default for Replica<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            last_observed: UNKNOWN_OFFSET,
        }
    }
}

impl<T: Clone> Replica<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one consumed record. Returns `false` for redelivered offsets.
    ///
    /// `NOOP` only advances the observed offset; an absent value removes the
    /// key; anything else upserts it.
    pub fn apply_record(&mut self, offset: i64, key: &str, value: Option<T>) -> bool {
        if offset <= self.last_observed {
            return false;
        }

        if key != NOOP_KEY {
            match value {
                Some(value) => {
                    self.entries.insert(key.to_string(), value);
                }
                None => {
                    self.entries.remove(key);
                }
            }
        }

        self.last_observed = offset;
        true
    }

    /// Advance past a record whose value could not be decoded.
    pub fn skip_record(&mut self, offset: i64) -> bool {
        if offset <= self.last_observed {
            return false;
        }
        self.last_observed = offset;
        true
    }

    /// Highest offset applied so far.
    pub const fn last_observed(&self) -> i64 {
        self.last_observed
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries.get(key)
    }

    /// Values in key order.
    pub fn values(&self) -> Vec<T> {
        self.entries.values().cloned().collect()
    }

    pub fn entries(&self) -> &BTreeMap<String, T> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
