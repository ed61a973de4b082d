//! Catalog: table schemas, views, assertions, statistics, and the function
//! registry. The catalog is shared by every session of a database handle and
//! carries a version stamp that DDL bumps so prepared plans can be keyed to
//! the schema they were built against.

pub mod function;

pub use function::{Accumulator, FunctionKind, FunctionRegistry, ResolvedFunction};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{QuereusError, Result};
use crate::types::{Affinity, Collation};

// Column definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub affinity: Affinity,
    pub nullable: bool,
    /// Raw SQL of the DEFAULT expression, planned at DML build time.
    pub default_sql: Option<String>,
    pub collation: Collation,
    pub hidden: bool,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, affinity: Affinity) -> Self {
        Self {
            name: name.into(),
            affinity,
            nullable: true,
            default_sql: None,
            collation: Collation::Binary,
            hidden: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// One component of the primary-key definition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrimaryKeyPart {
    pub column_index: usize,
    pub desc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexSchema {
    pub name: String,
    pub columns: Vec<PrimaryKeyPart>,
    pub unique: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckConstraint {
    pub name: Option<String>,
    /// Raw SQL of the predicate, planned against the row being written.
    pub expr_sql: String,
}

// Table schema
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    /// Ordered primary-key parts. Empty means every column is part of the
    /// key and the table holds at most one row per full-row value.
    pub primary_key: Vec<PrimaryKeyPart>,
    pub checks: Vec<CheckConstraint>,
    pub indexes: Vec<IndexSchema>,
    /// Virtual-table module backing this table.
    pub module: String,
    pub module_args: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: Vec::new(),
            checks: Vec::new(),
            indexes: Vec::new(),
            module: "memory".to_string(),
            module_args: Vec::new(),
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Effective primary-key parts: the declared key, or every column in
    /// declaration order when no key was declared.
    pub fn effective_primary_key(&self) -> Vec<PrimaryKeyPart> {
        if self.primary_key.is_empty() {
            (0..self.columns.len())
                .map(|column_index| PrimaryKeyPart {
                    column_index,
                    desc: false,
                })
                .collect()
        } else {
            self.primary_key.clone()
        }
    }

    pub fn is_pk_column(&self, column_index: usize) -> bool {
        self.effective_primary_key()
            .iter()
            .any(|p| p.column_index == column_index)
    }
}

// View definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewSchema {
    pub name: String,
    pub sql: String,
    pub columns: Vec<String>,
}

/// A database-wide assertion: a predicate re-checked after every DML
/// statement. A violated assertion aborts the statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionSchema {
    pub name: String,
    /// SQL of a query returning violating rows; any row is a violation.
    pub check_sql: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TableStats {
    pub row_count: u64,
}

/// Engine tunables, adjusted through PRAGMAs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum recursive-CTE iterations; 0 means no limit.
    pub recursive_cte_limit: u64,
    /// Row-cache spill threshold.
    pub cache_threshold: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            recursive_cte_limit: 1000,
            cache_threshold: 10_000,
        }
    }
}

// Catalog manages database metadata
#[derive(Clone)]
pub struct Catalog {
    tables: Arc<RwLock<HashMap<String, Arc<TableSchema>>>>,
    views: Arc<RwLock<HashMap<String, ViewSchema>>>,
    assertions: Arc<RwLock<HashMap<String, AssertionSchema>>>,
    stats: Arc<RwLock<HashMap<String, TableStats>>>,
    version: Arc<RwLock<u64>>,
    functions: Arc<FunctionRegistry>,
    settings: Arc<RwLock<Settings>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            views: Arc::new(RwLock::new(HashMap::new())),
            assertions: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(HashMap::new())),
            version: Arc::new(RwLock::new(1)),
            functions: Arc::new(FunctionRegistry::with_builtins()),
            settings: Arc::new(RwLock::new(Settings::default())),
        }
    }

    pub fn settings(&self) -> Settings {
        *self.settings.read()
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.settings.write());
    }

    pub fn version(&self) -> u64 {
        *self.version.read()
    }

    fn bump_version(&self) {
        *self.version.write() += 1;
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn create_table(&self, schema: TableSchema) -> Result<Arc<TableSchema>> {
        let mut tables = self.tables.write();
        let key = schema.name.to_ascii_lowercase();
        if tables.contains_key(&key) || self.views.read().contains_key(&key) {
            return Err(QuereusError::planning(format!(
                "table {} already exists",
                schema.name
            )));
        }
        let schema = Arc::new(schema);
        tables.insert(key, Arc::clone(&schema));
        self.bump_version();
        Ok(schema)
    }

    /// Replace an existing table's schema in place (ALTER TABLE).
    pub fn replace_table(&self, schema: TableSchema) -> Result<Arc<TableSchema>> {
        let mut tables = self.tables.write();
        let key = schema.name.to_ascii_lowercase();
        if !tables.contains_key(&key) {
            return Err(QuereusError::planning(format!(
                "no such table: {}",
                schema.name
            )));
        }
        let schema = Arc::new(schema);
        tables.insert(key, Arc::clone(&schema));
        self.bump_version();
        Ok(schema)
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<TableSchema>> {
        self.tables
            .read()
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| QuereusError::planning(format!("no such table: {name}")))
    }

    pub fn try_get_table(&self, name: &str) -> Option<Arc<TableSchema>> {
        self.tables.read().get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn drop_table(&self, name: &str) -> Result<Arc<TableSchema>> {
        let removed = self
            .tables
            .write()
            .remove(&name.to_ascii_lowercase())
            .ok_or_else(|| QuereusError::planning(format!("no such table: {name}")))?;
        self.stats.write().remove(&name.to_ascii_lowercase());
        self.bump_version();
        Ok(removed)
    }

    pub fn list_tables(&self) -> Vec<Arc<TableSchema>> {
        let mut tables: Vec<_> = self.tables.read().values().cloned().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        tables
    }

    pub fn create_view(&self, view: ViewSchema) -> Result<()> {
        let mut views = self.views.write();
        let key = view.name.to_ascii_lowercase();
        if views.contains_key(&key) || self.tables.read().contains_key(&key) {
            return Err(QuereusError::planning(format!(
                "view {} already exists",
                view.name
            )));
        }
        views.insert(key, view);
        self.bump_version();
        Ok(())
    }

    pub fn get_view(&self, name: &str) -> Option<ViewSchema> {
        self.views.read().get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn drop_view(&self, name: &str) -> Result<()> {
        self.views
            .write()
            .remove(&name.to_ascii_lowercase())
            .ok_or_else(|| QuereusError::planning(format!("no such view: {name}")))?;
        self.bump_version();
        Ok(())
    }

    pub fn list_views(&self) -> Vec<ViewSchema> {
        let mut views: Vec<_> = self.views.read().values().cloned().collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    pub fn create_assertion(&self, assertion: AssertionSchema) -> Result<()> {
        let mut assertions = self.assertions.write();
        let key = assertion.name.to_ascii_lowercase();
        if assertions.contains_key(&key) {
            return Err(QuereusError::planning(format!(
                "assertion {} already exists",
                assertion.name
            )));
        }
        assertions.insert(key, assertion);
        self.bump_version();
        Ok(())
    }

    pub fn drop_assertion(&self, name: &str) -> Result<()> {
        self.assertions
            .write()
            .remove(&name.to_ascii_lowercase())
            .ok_or_else(|| QuereusError::planning(format!("no such assertion: {name}")))?;
        self.bump_version();
        Ok(())
    }

    pub fn list_assertions(&self) -> Vec<AssertionSchema> {
        let mut all: Vec<_> = self.assertions.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn set_stats(&self, table: &str, stats: TableStats) {
        self.stats
            .write()
            .insert(table.to_ascii_lowercase(), stats);
    }

    pub fn get_stats(&self, table: &str) -> Option<TableStats> {
        self.stats.read().get(&table.to_ascii_lowercase()).copied()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_schema() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                ColumnSchema::new("id", Affinity::Integer).not_null(),
                ColumnSchema::new("name", Affinity::Text),
            ],
        )
    }

    #[test]
    fn test_create_and_get_table() {
        let catalog = Catalog::new();
        catalog.create_table(users_schema()).unwrap();
        let schema = catalog.get_table("USERS").unwrap();
        assert_eq!(schema.columns.len(), 2);
        assert!(catalog.create_table(users_schema()).is_err());
    }

    #[test]
    fn test_version_bumps_on_ddl() {
        let catalog = Catalog::new();
        let v0 = catalog.version();
        catalog.create_table(users_schema()).unwrap();
        assert!(catalog.version() > v0);
        let v1 = catalog.version();
        catalog.drop_table("users").unwrap();
        assert!(catalog.version() > v1);
    }

    #[test]
    fn test_empty_pk_means_all_columns() {
        let schema = users_schema();
        let pk = schema.effective_primary_key();
        assert_eq!(pk.len(), 2);
        assert_eq!(pk[0].column_index, 0);
        assert_eq!(pk[1].column_index, 1);
    }
}
