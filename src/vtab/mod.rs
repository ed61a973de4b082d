//! Virtual-table contract: the surface the query core consumes from storage
//! modules. A module manufactures tables; a table serves filtered row scans
//! and applies mutations; a connection object (when the module provides one)
//! carries transaction state for a session. Access-path negotiation happens
//! through `best_access_plan`, which is the only way the optimizer chooses
//! how a table is read.

pub mod series;

use std::any::Any;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{QuereusError, Result};
use crate::schema::{ColumnSchema, IndexSchema, TableSchema};
use crate::types::SqlValue;

/// A materialized row: positional values aligned with the producing
/// relation's attributes.
pub type Row = Vec<SqlValue>;

/// Async pull stream of rows.
pub type RowStream = Pin<Box<dyn Stream<Item = Result<Row>> + Send>>;

/// Constraint operators a module may be offered for push-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    Match,
    Like,
    Glob,
    IsNull,
    IsNotNull,
    In,
    NotIn,
}

/// One predicate conjunct offered to `best_access_plan`.
#[derive(Debug, Clone)]
pub struct FilterConstraint {
    pub column_index: usize,
    pub op: ConstraintOp,
    /// Constant value when known at plan time (literals only; parameters
    /// and correlated values are supplied at execution).
    pub value: Option<SqlValue>,
    /// False when the value cannot be supplied before the scan starts.
    pub usable: bool,
}

/// One ordering term, by table column index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderingTerm {
    pub column_index: usize,
    pub desc: bool,
}

/// Access-path request handed to the module.
#[derive(Debug, Clone)]
pub struct AccessPlanRequest {
    pub columns: Vec<ColumnSchema>,
    pub filters: Vec<FilterConstraint>,
    /// Ordering an enclosing sort requires, if any.
    pub required_ordering: Option<Vec<OrderingTerm>>,
    pub limit: Option<u64>,
    pub estimated_rows: Option<f64>,
}

/// The module's chosen strategy for a scan.
#[derive(Debug, Clone)]
pub struct AccessPlan {
    /// Parallel to the request's filters; true marks a conjunct the module
    /// fully enforces so the core drops it from the residual filter.
    pub handled_filters: Vec<bool>,
    pub cost: f64,
    pub rows: Option<f64>,
    /// Output ordering the scan guarantees, if any.
    pub provides_ordering: Option<Vec<OrderingTerm>>,
    /// True when the scan yields no duplicate rows.
    pub is_set: bool,
    pub explains: Option<String>,
}

impl AccessPlan {
    /// Contract checks: `handled_filters` must cover every offered filter
    /// and cost/rows must be non-negative.
    pub fn validate(&self, request: &AccessPlanRequest) -> Result<()> {
        if self.handled_filters.len() != request.filters.len() {
            return Err(QuereusError::Internal(format!(
                "access plan answered {} of {} filters",
                self.handled_filters.len(),
                request.filters.len()
            )));
        }
        if self.cost < 0.0 {
            return Err(QuereusError::Internal("negative access-plan cost".into()));
        }
        if matches!(self.rows, Some(r) if r < 0.0) {
            return Err(QuereusError::Internal("negative access-plan rows".into()));
        }
        Ok(())
    }
}

/// A pushed-down constraint with its value resolved, as delivered to
/// `query` at execution time.
#[derive(Debug, Clone)]
pub struct EvaluatedConstraint {
    pub column_index: usize,
    pub op: ConstraintOp,
    pub value: SqlValue,
}

/// Runtime scan arguments.
#[derive(Debug, Clone, Default)]
pub struct FilterArgs {
    pub constraints: Vec<EvaluatedConstraint>,
    /// Ordering the plan relies on this scan to produce.
    pub ordering: Option<Vec<OrderingTerm>>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmlOp {
    Insert,
    Update,
    Delete,
}

/// SQLite-style conflict resolution requested by a DML statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    Abort,
    Rollback,
    Replace,
    Ignore,
    Fail,
}

/// Row-change notification published by tables that support events.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: String,
    pub op: DmlOp,
    pub key: Vec<SqlValue>,
}

/// A module's claim that it can execute an entire plan subtree itself.
#[derive(Debug, Clone, Copy)]
pub struct SubtreeSupport {
    pub cost: f64,
}

/// A storage module: the factory side of the contract.
#[async_trait]
pub trait VtabModule: Send + Sync {
    fn name(&self) -> &str;

    /// Create the backing storage for a new table.
    async fn create(&self, schema: Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>>;

    /// Connect to existing backing storage.
    async fn connect(&self, schema: Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>>;

    /// Choose an access path for a scan. Modules that cannot plan access
    /// paths keep the default; a module that also answers `supports` with
    /// `None` makes any statement touching its tables an internal error
    /// rather than silently scanning.
    fn best_access_plan(
        &self,
        _schema: &TableSchema,
        _request: &AccessPlanRequest,
    ) -> Result<AccessPlan> {
        Err(QuereusError::Internal(format!(
            "module {} offers no access planner",
            self.name()
        )))
    }

    fn provides_access_planner(&self) -> bool {
        false
    }

    /// Subtree push-down probe: a module may offer to run a whole plan
    /// subtree itself instead of serving row scans.
    fn supports(&self, _plan: &crate::plan::RelNode) -> Option<SubtreeSupport> {
        None
    }

    /// Execute a subtree previously accepted by `supports`.
    async fn execute_plan(&self, _plan: Arc<crate::plan::RelNode>) -> Result<RowStream> {
        Err(QuereusError::Internal(format!(
            "module {} accepted a subtree it cannot execute",
            self.name()
        )))
    }

    async fn destroy(&self, schema: Arc<TableSchema>) -> Result<()>;
}

/// A table instance served by a module.
#[async_trait]
pub trait VirtualTable: Send + Sync {
    fn schema(&self) -> Arc<TableSchema>;

    /// Stream rows matching the pushed-down constraints. `conn` is the
    /// session's connection for this table when one exists; reads through a
    /// connection observe its uncommitted writes.
    async fn query(
        &self,
        conn: Option<&dyn VtabConnection>,
        filters: FilterArgs,
    ) -> Result<RowStream>;

    /// Apply one mutation. Returns the stored row for inserts/updates (with
    /// defaults and coercions applied) when the operation took effect.
    async fn update(
        &self,
        conn: Option<&dyn VtabConnection>,
        op: DmlOp,
        new_row: Option<Row>,
        old_key: Option<Vec<SqlValue>>,
        on_conflict: ConflictPolicy,
    ) -> Result<Option<Row>>;

    /// Tables with connection-scoped transaction state return a fresh
    /// connection per session. Tables without one fall back to the plain
    /// table-level hooks (auto-commit per statement).
    fn create_connection(&self, _session: &str) -> Result<Option<Arc<dyn VtabConnection>>> {
        Ok(None)
    }

    fn create_index(&self, _index: &IndexSchema) -> Result<()> {
        Err(QuereusError::Runtime(format!(
            "table {} does not support CREATE INDEX",
            self.schema().name
        )))
    }

    /// Committed cardinality, for ANALYZE.
    fn committed_row_count(&self) -> Option<u64> {
        None
    }

    fn subscribe_changes(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        None
    }
}

/// Per-session transaction state for a table.
#[async_trait]
pub trait VtabConnection: Send + Sync {
    fn table_name(&self) -> &str;

    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    /// Re-synchronize an idle auto-commit connection to the latest
    /// committed state before a new statement reads through it. Must be a
    /// no-op once a transaction or pending write exists.
    fn refresh(&self) {}

    /// Savepoints address immutable snapshots by index; the session maps
    /// SQL savepoint names onto indexes.
    async fn savepoint(&self, index: u32) -> Result<()>;
    async fn release(&self, index: u32) -> Result<()>;
    async fn rollback_to(&self, index: u32) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Process-wide module registry. Append-only; reads are lock-free.
pub struct ModuleRegistry {
    modules: DashMap<String, Arc<dyn VtabModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: DashMap::new(),
        }
    }

    pub fn register(&self, module: Arc<dyn VtabModule>) {
        self.modules
            .insert(module.name().to_ascii_lowercase(), module);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn VtabModule>> {
        self.modules
            .get(&name.to_ascii_lowercase())
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| QuereusError::planning(format!("no such module: {name}")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.modules.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
