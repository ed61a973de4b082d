//! Statement-level plans. `Block` is the unit the session prepares, caches,
//! and executes: a statement plan plus the snapshot of the SQL parameter
//! shape captured during planning.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{QuereusError, Result};
use crate::schema::{AssertionSchema, CheckConstraint, IndexSchema, TableSchema, ViewSchema};
use crate::types::{Attribute, SqlValue};

use super::node::RelNode;

/// Snapshot of the parameters a statement's SQL text mentions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamShape {
    /// Highest 1-based positional slot referenced.
    pub positional: usize,
    pub named: BTreeSet<String>,
}

impl ParamShape {
    pub fn note_positional(&mut self, index: usize) {
        self.positional = self.positional.max(index);
    }

    pub fn note_named(&mut self, name: &str) {
        self.named.insert(name.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.positional == 0 && self.named.is_empty()
    }

    /// Cache-key rendering of the shape.
    pub fn fingerprint(&self) -> String {
        let mut out = format!("p{}", self.positional);
        for name in &self.named {
            out.push(':');
            out.push_str(name);
        }
        out
    }
}

#[derive(Debug, Clone)]
pub enum DdlStatement {
    CreateTable {
        schema: TableSchema,
        if_not_exists: bool,
    },
    CreateIndex {
        table: String,
        index: IndexSchema,
        if_not_exists: bool,
    },
    CreateView {
        view: ViewSchema,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    DropView {
        name: String,
        if_exists: bool,
    },
    AddConstraint {
        table: String,
        check: CheckConstraint,
    },
    CreateAssertion(AssertionSchema),
    DropAssertion {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatement {
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    Release(String),
    RollbackTo(String),
}

#[derive(Debug, Clone)]
pub struct PragmaStatement {
    pub name: String,
    pub value: Option<SqlValue>,
}

/// Declarative-schema verbs.
#[derive(Debug, Clone)]
pub enum SchemaVerb {
    /// Target DDL statements, as SQL text.
    Declare(Vec<String>),
    Diff,
    Apply { with_seed: bool },
    Explain,
}

#[derive(Debug, Clone)]
pub enum StatementPlan {
    Query(Arc<RelNode>),
    /// DML rooted at a `Sink` (plain) or `Returning` node.
    Dml {
        plan: Arc<RelNode>,
        returning: bool,
    },
    Ddl(DdlStatement),
    Tx(TxStatement),
    Pragma(PragmaStatement),
    Analyze { table: Option<String> },
    Explain(Box<Block>),
    Schema(SchemaVerb),
}

/// A fully planned statement.
#[derive(Debug, Clone)]
pub struct Block {
    pub plan: StatementPlan,
    pub parameters: ParamShape,
    /// Output column metadata for statements that yield rows.
    pub columns: Vec<Attribute>,
    pub sql: String,
}

impl Block {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|a| a.name.clone()).collect()
    }

    /// Validate supplied bindings against the recorded shape.
    pub fn check_bindings(&self, positional: usize, named: &BTreeSet<String>) -> Result<()> {
        if positional < self.parameters.positional {
            return Err(QuereusError::Misuse(format!(
                "statement expects {} positional parameters, {} supplied",
                self.parameters.positional, positional
            )));
        }
        for name in &self.parameters.named {
            if !named.contains(name) {
                return Err(QuereusError::Misuse(format!(
                    "missing value for parameter :{name}"
                )));
            }
        }
        Ok(())
    }
}
