//! Name resolution scopes. A scope holds the relations visible to one query
//! level; subqueries chain to their outer scope so correlated references
//! resolve to outer attribute ids unchanged.

use crate::error::{QuereusError, Result};
use crate::types::Attribute;

/// One visible relation: an alias plus its output attributes.
#[derive(Debug, Clone)]
pub struct ScopeRelation {
    pub alias: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Default)]
pub struct Scope<'a> {
    parent: Option<&'a Scope<'a>>,
    relations: Vec<ScopeRelation>,
}

impl<'a> Scope<'a> {
    pub fn new() -> Self {
        Self {
            parent: None,
            relations: Vec::new(),
        }
    }

    pub fn child(parent: &'a Scope<'a>) -> Self {
        Self {
            parent: Some(parent),
            relations: Vec::new(),
        }
    }

    pub fn add_relation(&mut self, alias: impl Into<String>, attributes: Vec<Attribute>) {
        self.relations.push(ScopeRelation {
            alias: alias.into(),
            attributes,
        });
    }

    /// All attributes `*` expands to, in relation order. Hidden attributes
    /// stay resolvable by name but never appear in a wildcard.
    pub fn visible_attributes(&self) -> Vec<Attribute> {
        self.relations
            .iter()
            .flat_map(|r| r.attributes.iter().filter(|a| !a.hidden).cloned())
            .collect()
    }

    /// Attributes of one qualified relation, for `alias.*`.
    pub fn relation_attributes(&self, qualifier: &str) -> Result<Vec<Attribute>> {
        self.relations
            .iter()
            .find(|r| r.alias.eq_ignore_ascii_case(qualifier))
            .map(|r| {
                r.attributes
                    .iter()
                    .filter(|a| !a.hidden)
                    .cloned()
                    .collect()
            })
            .ok_or_else(|| QuereusError::planning(format!("no such table: {qualifier}")))
    }

    /// Resolve a possibly-qualified column name. An unqualified name must
    /// match exactly one visible attribute at the nearest level that matches
    /// at all; two matches at the same level are ambiguous.
    pub fn resolve(&self, qualifier: Option<&str>, name: &str) -> Result<Attribute> {
        let mut matches: Vec<&Attribute> = Vec::new();
        for relation in &self.relations {
            if let Some(q) = qualifier {
                if !relation.alias.eq_ignore_ascii_case(q) {
                    continue;
                }
            }
            for attr in &relation.attributes {
                if attr.name.eq_ignore_ascii_case(name) {
                    matches.push(attr);
                }
            }
        }
        match matches.len() {
            1 => Ok(matches[0].clone()),
            0 => match self.parent {
                Some(parent) => parent.resolve(qualifier, name),
                None => Err(QuereusError::planning(match qualifier {
                    Some(q) => format!("no such column: {q}.{name}"),
                    None => format!("no such column: {name}"),
                })),
            },
            _ => Err(QuereusError::planning(format!(
                "ambiguous column name: {name}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScalarType;

    #[test]
    fn test_unqualified_single_match() {
        let mut scope = Scope::new();
        scope.add_relation(
            "t",
            vec![
                Attribute::new("id", ScalarType::integer()),
                Attribute::new("v", ScalarType::text()),
            ],
        );
        let attr = scope.resolve(None, "V").unwrap();
        assert_eq!(attr.name, "v");
    }

    #[test]
    fn test_ambiguous_column_is_error() {
        let mut scope = Scope::new();
        scope.add_relation("a", vec![Attribute::new("id", ScalarType::integer())]);
        scope.add_relation("b", vec![Attribute::new("id", ScalarType::integer())]);
        assert!(scope.resolve(None, "id").is_err());
        assert!(scope.resolve(Some("a"), "id").is_ok());
    }

    #[test]
    fn test_correlated_resolution_reaches_parent() {
        let mut outer = Scope::new();
        let outer_attr = Attribute::new("x", ScalarType::integer());
        let outer_id = outer_attr.id;
        outer.add_relation("o", vec![outer_attr]);

        let mut inner = Scope::child(&outer);
        inner.add_relation("i", vec![Attribute::new("y", ScalarType::integer())]);

        let resolved = inner.resolve(None, "x").unwrap();
        assert_eq!(resolved.id, outer_id);
    }

    #[test]
    fn test_unknown_column_reports_name() {
        let scope = Scope::new();
        let err = scope.resolve(None, "missing").unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
