//! Physical properties published by optimized nodes: the guarantees
//! downstream operators and the optimizer's elision rules may rely on.

use crate::types::AttrId;

/// One ordering term over an output attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrOrdering {
    pub attr: AttrId,
    pub desc: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhysicalProperties {
    /// Output row order, when guaranteed.
    pub ordering: Vec<AttrOrdering>,
    /// Attribute sets unique over the output.
    pub unique_keys: Vec<Vec<AttrId>>,
    pub deterministic: bool,
    pub read_only: bool,
    /// True when the node yields the same single row set on every execution
    /// regardless of database state (e.g. VALUES of literals).
    pub constant: bool,
}

impl PhysicalProperties {
    pub fn deterministic_default() -> Self {
        Self {
            ordering: Vec::new(),
            unique_keys: Vec::new(),
            deterministic: true,
            read_only: true,
            constant: false,
        }
    }

    /// Does this node's ordering satisfy `wanted` as a prefix?
    pub fn satisfies_ordering(&self, wanted: &[AttrOrdering]) -> bool {
        wanted.len() <= self.ordering.len()
            && self.ordering.iter().zip(wanted).all(|(have, want)| have == want)
    }

    /// Is some unique key fully contained in `attrs`? Used for DISTINCT
    /// elision: rows already unique on a subset of the projected columns
    /// cannot contain duplicates.
    pub fn key_covered_by(&self, attrs: &[AttrId]) -> bool {
        self.unique_keys
            .iter()
            .any(|key| !key.is_empty() && key.iter().all(|a| attrs.contains(a)))
    }
}
