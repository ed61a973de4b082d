//! Scalar value model: SQL values, type affinity, collations, and the
//! attribute identities that tie plan nodes to runtime rows.

pub mod attribute;
pub mod value;

pub use attribute::{next_attr_id, AttrId, Attribute};
pub use value::{Affinity, Collation, SqlValue};

use serde::{Deserialize, Serialize};

/// Static type of a scalar expression or column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarType {
    pub affinity: Affinity,
    pub nullable: bool,
    pub collation: Collation,
    pub read_only: bool,
}

impl ScalarType {
    pub fn new(affinity: Affinity) -> Self {
        Self {
            affinity,
            nullable: true,
            collation: Collation::Binary,
            read_only: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_collation(mut self, collation: Collation) -> Self {
        self.collation = collation;
        self
    }

    /// Type of an untyped NULL literal.
    pub fn null() -> Self {
        Self::new(Affinity::Null)
    }

    pub fn integer() -> Self {
        Self::new(Affinity::Integer)
    }

    pub fn real() -> Self {
        Self::new(Affinity::Real)
    }

    pub fn numeric() -> Self {
        Self::new(Affinity::Numeric)
    }

    pub fn text() -> Self {
        Self::new(Affinity::Text)
    }

    pub fn blob() -> Self {
        Self::new(Affinity::Blob)
    }
}

/// Shape of a relational node's output: an ordered attribute list plus the
/// key and mutability facts consumers may rely on.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationType {
    pub attributes: Vec<Attribute>,
    /// Attribute-id sets that are unique over the relation's rows.
    pub unique_keys: Vec<Vec<AttrId>>,
    pub read_only: bool,
    /// True when the relation carries no duplicate rows.
    pub is_set: bool,
}

impl RelationType {
    pub fn new(attributes: Vec<Attribute>) -> Self {
        Self {
            attributes,
            unique_keys: Vec::new(),
            read_only: true,
            is_set: false,
        }
    }

    pub fn with_keys(mut self, unique_keys: Vec<Vec<AttrId>>) -> Self {
        self.is_set = !unique_keys.is_empty();
        self.unique_keys = unique_keys;
        self
    }

    pub fn attribute_ids(&self) -> Vec<AttrId> {
        self.attributes.iter().map(|a| a.id).collect()
    }

    pub fn arity(&self) -> usize {
        self.attributes.len()
    }
}
