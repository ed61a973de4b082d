//! Attribute identity. Producer nodes assign attributes; scalar expressions
//! reference them by id, never by name or ordinal, so rewrites can move
//! columns freely without re-resolution.

use std::sync::atomic::{AtomicU64, Ordering};

use super::ScalarType;

/// Process-wide attribute identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttrId(pub u64);

impl std::fmt::Display for AttrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_ATTR_ID: AtomicU64 = AtomicU64::new(1);

/// Issue a fresh attribute id. The counter is append-only and safe to read
/// concurrently; ids are never reused within a process.
pub fn next_attr_id() -> AttrId {
    AttrId(NEXT_ATTR_ID.fetch_add(1, Ordering::Relaxed))
}

/// A named, typed output column of a relational node. Hidden attributes
/// resolve by name but are excluded from `*` expansion (the argument
/// columns of eponymous virtual tables).
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub id: AttrId,
    pub name: String,
    pub ty: ScalarType,
    pub hidden: bool,
}

impl Attribute {
    pub fn new(name: impl Into<String>, ty: ScalarType) -> Self {
        Self {
            id: next_attr_id(),
            name: name.into(),
            ty,
            hidden: false,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Same name and type under a fresh id. Used when an operator re-emits a
    /// column it does not simply pass through (e.g. set operations).
    pub fn renumbered(&self) -> Self {
        Self {
            id: next_attr_id(),
            name: self.name.clone(),
            ty: self.ty.clone(),
            hidden: self.hidden,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScalarType;

    #[test]
    fn test_attr_ids_monotonic() {
        let a = next_attr_id();
        let b = next_attr_id();
        assert!(b.0 > a.0);
    }

    #[test]
    fn test_renumbered_keeps_name_and_type() {
        let attr = Attribute::new("id", ScalarType::integer());
        let copy = attr.renumbered();
        assert_ne!(attr.id, copy.id);
        assert_eq!(attr.name, copy.name);
        assert_eq!(attr.ty, copy.ty);
    }
}
