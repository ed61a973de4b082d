//! Runtime context: parameter bindings, the row-context frame stack, the
//! per-transaction virtual-table connection cache, CTE working tables, and
//! cooperative cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{QuereusError, Result};
use crate::plan::ParamRef;
use crate::schema::{Catalog, TableSchema};
use crate::types::{AttrId, SqlValue};
use crate::vtab::{ModuleRegistry, Row, VirtualTable, VtabConnection};

use super::scheduler::Tracer;

/// Maps attribute ids to column positions in a concrete row.
#[derive(Debug, Clone, Default)]
pub struct RowDescriptor(Vec<(AttrId, usize)>);

impl RowDescriptor {
    pub fn new(pairs: Vec<(AttrId, usize)>) -> Self {
        Self(pairs)
    }

    pub fn from_attrs(attrs: &[crate::types::Attribute]) -> Self {
        Self(attrs.iter().enumerate().map(|(i, a)| (a.id, i)).collect())
    }

    pub fn get(&self, attr: AttrId) -> Option<usize> {
        self.0
            .iter()
            .find_map(|(id, idx)| (*id == attr).then_some(*idx))
    }
}

struct Frame {
    id: u64,
    descriptor: Arc<RowDescriptor>,
    row: Row,
}

/// Supplied statement parameters.
#[derive(Debug, Clone, Default)]
pub struct ParamBindings {
    pub positional: Vec<SqlValue>,
    pub named: HashMap<String, SqlValue>,
}

impl ParamBindings {
    pub fn positional(values: Vec<SqlValue>) -> Self {
        Self {
            positional: values,
            named: HashMap::new(),
        }
    }

    pub fn named(values: HashMap<String, SqlValue>) -> Self {
        Self {
            positional: Vec::new(),
            named: values,
        }
    }

    pub fn lookup(&self, param: &ParamRef) -> Result<SqlValue> {
        match param {
            ParamRef::Positional(index) => self
                .positional
                .get(index - 1)
                .cloned()
                .ok_or_else(|| {
                    QuereusError::Misuse(format!("no value bound for parameter ?{index}"))
                }),
            ParamRef::Named(name) => self.named.get(name).cloned().ok_or_else(|| {
                QuereusError::Misuse(format!("no value bound for parameter :{name}"))
            }),
        }
    }
}

/// Cooperative cancellation token, checked between rows and before awaits.
#[derive(Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clear the flag once the interrupted statement has unwound.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Shared, transaction-scoped connection cache. Owned by the session and
/// lent to each statement's context so connections survive across the
/// statements of one transaction.
pub type ConnectionMap = Arc<Mutex<HashMap<String, Arc<dyn VtabConnection>>>>;

pub struct RuntimeContext {
    pub catalog: Catalog,
    pub registry: Arc<ModuleRegistry>,
    pub params: ParamBindings,
    pub tracer: Option<Arc<dyn Tracer>>,
    cancellation: Cancellation,
    frames: Mutex<Vec<Frame>>,
    next_frame_id: AtomicU64,
    /// vtab instances, keyed by lowercased table name.
    tables: Mutex<HashMap<String, Arc<dyn VirtualTable>>>,
    connections: ConnectionMap,
    /// Connections already re-synchronized by this statement, so one
    /// statement never mixes two snapshots of the same table.
    refreshed: Mutex<std::collections::HashSet<String>>,
    /// Savepoint indexes to replay onto connections created mid-transaction.
    replay: Mutex<Vec<ReplayOp>>,
    /// CTE working tables, keyed by the plan's working-table key.
    cte_tables: Mutex<HashMap<String, Arc<Vec<Row>>>>,
    changes: AtomicI64,
    rollback_requested: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOp {
    Begin,
    Savepoint(u32),
}

impl RuntimeContext {
    pub fn new(
        catalog: Catalog,
        registry: Arc<ModuleRegistry>,
        params: ParamBindings,
        connections: ConnectionMap,
        cancellation: Cancellation,
        tracer: Option<Arc<dyn Tracer>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            registry,
            params,
            tracer,
            cancellation,
            frames: Mutex::new(Vec::new()),
            next_frame_id: AtomicU64::new(1),
            tables: Mutex::new(HashMap::new()),
            connections,
            refreshed: Mutex::new(std::collections::HashSet::new()),
            replay: Mutex::new(Vec::new()),
            cte_tables: Mutex::new(HashMap::new()),
            changes: AtomicI64::new(0),
            rollback_requested: AtomicBool::new(false),
        })
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(QuereusError::Cancelled);
        }
        Ok(())
    }

    /// Push a row-context frame; the returned guard removes it on drop, so
    /// abandoning a stream mid-iteration cannot leak frames.
    pub fn push_frame(
        self: &Arc<Self>,
        descriptor: Arc<RowDescriptor>,
        row: Row,
    ) -> FrameGuard {
        let id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        self.frames.lock().push(Frame {
            id,
            descriptor,
            row,
        });
        FrameGuard {
            ctx: Arc::clone(self),
            id,
        }
    }

    /// Resolve a column reference through the frame stack, newest-first. A
    /// missing binding is an internal error: the plan referenced an
    /// attribute no producer put in scope.
    pub fn resolve_column(&self, attr: AttrId) -> Result<SqlValue> {
        let frames = self.frames.lock();
        for frame in frames.iter().rev() {
            if let Some(index) = frame.descriptor.get(attr) {
                return frame.row.get(index).cloned().ok_or_else(|| {
                    QuereusError::Internal(format!(
                        "row descriptor maps {attr} to column {index}, row has {}",
                        frame.row.len()
                    ))
                });
            }
        }
        Err(QuereusError::Internal(format!(
            "no row context binds attribute {attr}"
        )))
    }

    /// The vtab instance serving a table, connected on first use.
    pub async fn table(&self, schema: &Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        let key = schema.name.to_ascii_lowercase();
        if let Some(table) = self.tables.lock().get(&key) {
            return Ok(Arc::clone(table));
        }
        let module = self.registry.get(&schema.module)?;
        let table = module.connect(Arc::clone(schema)).await?;
        self.tables
            .lock()
            .insert(key, Arc::clone(&table));
        Ok(table)
    }

    /// The session's connection for a table, created on first use within
    /// the transaction and replayed up to the transaction's current state.
    pub async fn connection(
        &self,
        schema: &Arc<TableSchema>,
    ) -> Result<Option<Arc<dyn VtabConnection>>> {
        let key = schema.name.to_ascii_lowercase();
        let cached = self.connections.lock().get(&key).cloned();
        if let Some(conn) = cached {
            // First touch this statement re-synchronizes an idle
            // connection's snapshot.
            if self.refreshed.lock().insert(key) {
                conn.refresh();
            }
            return Ok(Some(conn));
        }
        let table = self.table(schema).await?;
        let Some(conn) = table.create_connection(&schema.name)? else {
            return Ok(None);
        };
        let replay = self.replay.lock().clone();
        for op in replay {
            match op {
                ReplayOp::Begin => conn.begin().await?,
                ReplayOp::Savepoint(index) => conn.savepoint(index).await?,
            }
        }
        self.refreshed.lock().insert(key.clone());
        self.connections.lock().insert(key, Arc::clone(&conn));
        Ok(Some(conn))
    }

    pub fn set_replay(&self, ops: Vec<ReplayOp>) {
        *self.replay.lock() = ops;
    }

    pub fn install_cte_table(&self, key: &str, rows: Arc<Vec<Row>>) {
        self.cte_tables.lock().insert(key.to_string(), rows);
    }

    pub fn cte_table(&self, key: &str) -> Result<Arc<Vec<Row>>> {
        self.cte_tables
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| {
                QuereusError::Internal(format!("no working table installed for {key}"))
            })
    }

    pub fn record_change(&self) {
        self.changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn changes(&self) -> i64 {
        self.changes.load(Ordering::Relaxed)
    }

    /// A ROLLBACK-policy constraint failure asks the session to discard the
    /// enclosing transaction after the statement error propagates.
    pub fn request_txn_rollback(&self) {
        self.rollback_requested.store(true, Ordering::Relaxed);
    }

    pub fn txn_rollback_requested(&self) -> bool {
        self.rollback_requested.load(Ordering::Relaxed)
    }
}

/// Removes its frame when dropped.
pub struct FrameGuard {
    ctx: Arc<RuntimeContext>,
    id: u64,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let mut frames = self.ctx.frames.lock();
        if let Some(pos) = frames.iter().rposition(|f| f.id == self.id) {
            frames.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Attribute, ScalarType};

    fn ctx() -> Arc<RuntimeContext> {
        RuntimeContext::new(
            Catalog::new(),
            Arc::new(ModuleRegistry::new()),
            ParamBindings::default(),
            Arc::new(Mutex::new(HashMap::new())),
            Cancellation::default(),
            None,
        )
    }

    #[test]
    fn test_newest_frame_wins() {
        let ctx = ctx();
        let attr = Attribute::new("x", ScalarType::integer());
        let descriptor = Arc::new(RowDescriptor::from_attrs(&[attr.clone()]));

        let _outer = ctx.push_frame(Arc::clone(&descriptor), vec![SqlValue::Integer(1)]);
        {
            let _inner = ctx.push_frame(Arc::clone(&descriptor), vec![SqlValue::Integer(2)]);
            let v = ctx.resolve_column(attr.id).unwrap();
            assert!(matches!(v, SqlValue::Integer(2)));
        }
        // Inner frame dropped; the outer binding is visible again.
        let v = ctx.resolve_column(attr.id).unwrap();
        assert!(matches!(v, SqlValue::Integer(1)));
    }

    #[test]
    fn test_missing_binding_is_internal_error() {
        let ctx = ctx();
        let attr = Attribute::new("x", ScalarType::integer());
        let err = ctx.resolve_column(attr.id).unwrap_err();
        assert!(matches!(err, QuereusError::Internal(_)));
    }

    #[test]
    fn test_cancellation_checked() {
        let ctx = ctx();
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancellation.cancel();
        assert!(matches!(
            ctx.check_cancelled(),
            Err(QuereusError::Cancelled)
        ));
    }

    #[test]
    fn test_param_lookup() {
        let params = ParamBindings::positional(vec![SqlValue::Integer(7)]);
        assert!(matches!(
            params.lookup(&ParamRef::Positional(1)).unwrap(),
            SqlValue::Integer(7)
        ));
        assert!(params.lookup(&ParamRef::Positional(2)).is_err());
        assert!(params.lookup(&ParamRef::Named("x".into())).is_err());
    }
}
