//! Database handle and sessions. A `Database` owns the catalog, the module
//! registry, and the process-wide plan cache; a `Session` owns its
//! transaction state and virtual-table connections and executes statements
//! one at a time.

mod schema_ops;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use sqlparser::ast::Statement;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::error::{QuereusError, Result};
use crate::exec::{
    compile_rel_program, Cancellation, ConnectionMap, ParamBindings, ReplayOp, RuntimeContext,
    Scheduler, Tracer,
};
use crate::memory::MemoryModule;
use crate::optimizer::Optimizer;
use crate::plan::{
    render_plan, Block, DdlStatement, PragmaStatement, RelNode, SchemaVerb, StatementPlan,
    TxStatement,
};
use crate::planner::{self, StatementBuilder};
use crate::schema::{Catalog, TableSchema};
use crate::types::{Attribute, ScalarType, SqlValue};
use crate::vtab::{ModuleRegistry, Row, VtabModule};

/// Name used for the internal statement-scoped savepoint that makes a
/// failed DML statement atomic inside an explicit transaction. SQL
/// savepoint names cannot start with `#`, so it can never collide.
const STATEMENT_SAVEPOINT: &str = "#statement";

pub(crate) struct DatabaseShared {
    pub catalog: Catalog,
    pub registry: Arc<ModuleRegistry>,
    plan_cache: DashMap<(String, u64), Arc<Block>>,
    /// Declared-schema script, one statement per entry.
    pub(crate) declared: RwLock<Vec<String>>,
}

/// An embeddable database instance.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseShared>,
}

impl Database {
    pub fn new() -> Self {
        let registry = Arc::new(ModuleRegistry::new());
        registry.register(Arc::new(MemoryModule::new()));
        let catalog = Catalog::new();
        // Table-valued functions ship as eponymous virtual tables.
        crate::vtab::series::install(&registry, &catalog)
            .unwrap_or_else(|_| unreachable!("series installs into an empty catalog"));
        Self {
            inner: Arc::new(DatabaseShared {
                catalog,
                registry,
                plan_cache: DashMap::new(),
                declared: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn register_module(&self, module: Arc<dyn VtabModule>) {
        self.inner.registry.register(module);
    }

    /// The vtab instance backing a table, e.g. to subscribe to its change
    /// events.
    pub async fn table(&self, name: &str) -> Result<Arc<dyn crate::vtab::VirtualTable>> {
        let schema = self.inner.catalog.get_table(name)?;
        let module = self.inner.registry.get(&schema.module)?;
        module.connect(schema).await
    }

    pub fn session(&self) -> Session {
        Session {
            db: Arc::clone(&self.inner),
            connections: Arc::new(Mutex::new(HashMap::new())),
            state: Mutex::new(TxnState::default()),
            cancellation: Cancellation::default(),
            tracer: RwLock::new(None),
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct TxnState {
    explicit: bool,
    /// (name, index) in creation order; includes the internal statement
    /// savepoint while a DML statement is in flight.
    savepoints: Vec<(String, u32)>,
    next_savepoint: u32,
}

impl TxnState {
    fn replay_ops(&self) -> Vec<ReplayOp> {
        let mut ops = Vec::new();
        if self.explicit {
            ops.push(ReplayOp::Begin);
        }
        for (_, index) in &self.savepoints {
            ops.push(ReplayOp::Savepoint(*index));
        }
        ops
    }
}

/// Rows plus output column metadata.
#[derive(Debug)]
pub struct QueryResult {
    pub columns: Vec<Attribute>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|a| a.name.clone()).collect()
    }

    /// The single value of a single-row, single-column result.
    pub fn scalar(&self) -> Option<&SqlValue> {
        match self.rows.as_slice() {
            [row] => row.first(),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum ExecOutcome {
    Rows(QueryResult),
    Affected(i64),
    Done,
}

/// A prepared statement: the optimized block plus its column metadata,
/// reusable across executions with different bindings.
#[derive(Clone)]
pub struct Prepared {
    block: Arc<Block>,
}

impl Prepared {
    pub fn columns(&self) -> &[Attribute] {
        &self.block.columns
    }

    pub fn sql(&self) -> &str {
        &self.block.sql
    }
}

pub struct Session {
    db: Arc<DatabaseShared>,
    connections: ConnectionMap,
    state: Mutex<TxnState>,
    cancellation: Cancellation,
    tracer: RwLock<Option<Arc<dyn Tracer>>>,
}

impl Session {
    /// Execute every statement in `sql`; the last statement's outcome is
    /// returned.
    pub async fn execute(&self, sql: &str) -> Result<ExecOutcome> {
        self.execute_with(sql, ParamBindings::default()).await
    }

    pub async fn execute_with(&self, sql: &str, params: ParamBindings) -> Result<ExecOutcome> {
        let result = self.execute_inner(sql, params).await;
        // An interrupt only covers the statement it unwound.
        self.cancellation.reset();
        result
    }

    async fn execute_inner(&self, sql: &str, params: ParamBindings) -> Result<ExecOutcome> {
        if let Some(block) = planner::plan_special(sql)? {
            let block = Arc::new(block);
            return self.execute_block(&block, params).await;
        }
        let statements = Parser::parse_sql(&SQLiteDialect {}, sql)?;
        if statements.is_empty() {
            return Ok(ExecOutcome::Done);
        }
        let mut outcome = ExecOutcome::Done;
        for statement in &statements {
            let block = self.prepare_statement(statement)?;
            outcome = self.execute_block(&block, params.clone()).await?;
        }
        Ok(outcome)
    }

    /// Execute a query and collect its rows.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        self.query_with(sql, ParamBindings::default()).await
    }

    pub async fn query_with(&self, sql: &str, params: ParamBindings) -> Result<QueryResult> {
        match self.execute_with(sql, params).await? {
            ExecOutcome::Rows(result) => Ok(result),
            _ => Err(QuereusError::Misuse(
                "statement did not produce rows".into(),
            )),
        }
    }

    /// Prepare the single statement in `sql` for repeated execution.
    pub fn prepare(&self, sql: &str) -> Result<Prepared> {
        let statements = Parser::parse_sql(&SQLiteDialect {}, sql)?;
        let [statement] = statements.as_slice() else {
            return Err(QuereusError::Misuse(
                "prepare expects exactly one statement".into(),
            ));
        };
        Ok(Prepared {
            block: self.prepare_statement(statement)?,
        })
    }

    pub async fn execute_prepared(
        &self,
        prepared: &Prepared,
        params: ParamBindings,
    ) -> Result<ExecOutcome> {
        self.execute_block(&prepared.block, params).await
    }

    /// Request cooperative cancellation of the in-flight statement.
    pub fn interrupt(&self) {
        self.cancellation.cancel();
    }

    pub fn set_tracer(&self, tracer: Option<Arc<dyn Tracer>>) {
        *self.tracer.write() = tracer;
    }

    /// Plan and optimize one statement, consulting the plan cache. Planning
    /// is pure given (SQL text, schema version, parameter shape), so the
    /// cache keys on text and version.
    fn prepare_statement(&self, statement: &Statement) -> Result<Arc<Block>> {
        let sql = statement.to_string();
        let version = self.db.catalog.version();
        let key = (sql.clone(), version);
        if let Some(cached) = self.db.plan_cache.get(&key) {
            return Ok(Arc::clone(cached.value()));
        }

        let mut builder = StatementBuilder::new(self.db.catalog.clone());
        let block = builder.plan_statement(statement, &sql)?;
        let optimizer = Optimizer::new(Arc::clone(&self.db.registry), self.db.catalog.clone());
        let block = Arc::new(optimizer.optimize_block(block)?);

        if matches!(
            block.plan,
            StatementPlan::Query(_) | StatementPlan::Dml { .. }
        ) {
            self.db.plan_cache.insert(key, Arc::clone(&block));
        }
        Ok(block)
    }

    fn make_ctx(&self, params: ParamBindings) -> Arc<RuntimeContext> {
        let ctx = RuntimeContext::new(
            self.db.catalog.clone(),
            Arc::clone(&self.db.registry),
            params,
            Arc::clone(&self.connections),
            self.cancellation.clone(),
            self.tracer.read().clone(),
        );
        ctx.set_replay(self.state.lock().replay_ops());
        ctx
    }

    async fn execute_block(&self, block: &Arc<Block>, params: ParamBindings) -> Result<ExecOutcome> {
        let named: BTreeSet<String> = params.named.keys().cloned().collect();
        block.check_bindings(params.positional.len(), &named)?;
        debug!(sql = %block.sql, "executing statement");

        match &block.plan {
            StatementPlan::Query(node) => {
                let ctx = self.make_ctx(params);
                let result = self.run_query(node, &block.columns, &ctx).await;
                self.finish_statement(result.is_ok()).await?;
                Ok(ExecOutcome::Rows(result?))
            }
            StatementPlan::Dml { plan, returning } => {
                self.run_dml(plan, *returning, &block.columns, params).await
            }
            StatementPlan::Ddl(ddl) => {
                self.run_ddl(ddl).await?;
                Ok(ExecOutcome::Done)
            }
            StatementPlan::Tx(tx) => {
                self.run_tx(tx).await?;
                Ok(ExecOutcome::Done)
            }
            StatementPlan::Pragma(pragma) => self.run_pragma(pragma).await,
            StatementPlan::Analyze { table } => {
                self.run_analyze(table.as_deref()).await?;
                Ok(ExecOutcome::Done)
            }
            StatementPlan::Explain(inner) => Ok(ExecOutcome::Rows(self.render_explain(inner))),
            StatementPlan::Schema(verb) => self.run_schema_verb(verb).await,
        }
    }

    async fn run_query(
        &self,
        node: &Arc<RelNode>,
        columns: &[Attribute],
        ctx: &Arc<RuntimeContext>,
    ) -> Result<QueryResult> {
        let program = compile_rel_program(node, &self.db.catalog)?;
        let mut stream = Scheduler::run(&program, ctx).await?.into_stream()?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await {
            ctx.check_cancelled()?;
            rows.push(row?);
        }
        Ok(QueryResult {
            columns: columns.to_vec(),
            rows,
        })
    }

    async fn run_dml(
        &self,
        plan: &Arc<RelNode>,
        returning: bool,
        columns: &[Attribute],
        params: ParamBindings,
    ) -> Result<ExecOutcome> {
        let in_txn = self.state.lock().explicit;

        // Statement atomicity inside an explicit transaction: wrap the
        // statement in an internal savepoint and roll back to it on error.
        let statement_savepoint = if in_txn {
            Some(self.create_savepoint(STATEMENT_SAVEPOINT).await?)
        } else {
            None
        };

        let ctx = self.make_ctx(params);
        let result = self.run_dml_inner(plan, returning, columns, &ctx).await;
        let result = match result {
            Ok(outcome) => match self.check_assertions().await {
                Ok(()) => Ok(outcome),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match &result {
            Ok(_) => {
                if let Some(index) = statement_savepoint {
                    self.drop_savepoint(index, false).await?;
                }
                self.finish_statement(true).await?;
            }
            Err(_) => {
                if ctx.txn_rollback_requested() {
                    // ROLLBACK conflict policy: discard the transaction.
                    self.rollback_all().await?;
                } else if let Some(index) = statement_savepoint {
                    self.drop_savepoint(index, true).await?;
                } else {
                    self.finish_statement(false).await?;
                }
            }
        }
        result
    }

    async fn run_dml_inner(
        &self,
        plan: &Arc<RelNode>,
        returning: bool,
        columns: &[Attribute],
        ctx: &Arc<RuntimeContext>,
    ) -> Result<ExecOutcome> {
        let program = compile_rel_program(plan, &self.db.catalog)?;
        let output = Scheduler::run(&program, ctx).await?;
        if returning {
            let mut stream = output.into_stream()?;
            let mut rows = Vec::new();
            while let Some(row) = stream.next().await {
                ctx.check_cancelled()?;
                rows.push(row?);
            }
            Ok(ExecOutcome::Rows(QueryResult {
                columns: columns.to_vec(),
                rows,
            }))
        } else {
            let count = output.into_value()?;
            match count {
                SqlValue::Integer(n) => Ok(ExecOutcome::Affected(n)),
                other => Err(QuereusError::Internal(format!(
                    "sink yielded a non-integer count: {other}"
                ))),
            }
        }
    }

    /// Re-check every assertion after a mutation; any violating row aborts
    /// the statement.
    async fn check_assertions(&self) -> Result<()> {
        let assertions = self.db.catalog.list_assertions();
        for assertion in assertions {
            let sql = format!("SELECT 1 WHERE NOT ({})", assertion.check_sql);
            let statements = Parser::parse_sql(&SQLiteDialect {}, &sql)?;
            let [statement] = statements.as_slice() else {
                return Err(QuereusError::Internal(format!(
                    "assertion {} produced multiple statements",
                    assertion.name
                )));
            };
            let block = self.prepare_statement(statement)?;
            let StatementPlan::Query(node) = &block.plan else {
                return Err(QuereusError::Internal(format!(
                    "assertion {} is not a query",
                    assertion.name
                )));
            };
            let ctx = self.make_ctx(ParamBindings::default());
            let result = self.run_query(node, &block.columns, &ctx).await?;
            if !result.rows.is_empty() {
                return Err(QuereusError::Constraint(format!(
                    "assertion {} violated",
                    assertion.name
                )));
            }
        }
        Ok(())
    }

    /// End-of-statement connection handling. Outside an explicit
    /// transaction every statement auto-commits (or rolls back) each cached
    /// connection, which also refreshes their read snapshots.
    async fn finish_statement(&self, ok: bool) -> Result<()> {
        let explicit = self.state.lock().explicit;
        if explicit {
            return Ok(());
        }
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        for conn in connections {
            if ok {
                conn.commit().await?;
            } else {
                conn.rollback().await?;
            }
        }
        Ok(())
    }

    async fn run_tx(&self, tx: &TxStatement) -> Result<()> {
        match tx {
            TxStatement::Begin => {
                {
                    let mut state = self.state.lock();
                    if state.explicit {
                        return Err(QuereusError::Misuse(
                            "cannot start a transaction within a transaction".into(),
                        ));
                    }
                    state.explicit = true;
                }
                let connections: Vec<_> =
                    self.connections.lock().values().cloned().collect();
                for conn in connections {
                    conn.begin().await?;
                }
                Ok(())
            }
            TxStatement::Commit => {
                if !self.state.lock().explicit {
                    return Err(QuereusError::Misuse(
                        "cannot commit - no transaction is active".into(),
                    ));
                }
                let connections: Vec<_> =
                    self.connections.lock().values().cloned().collect();
                for conn in connections {
                    conn.commit().await?;
                }
                let mut state = self.state.lock();
                state.explicit = false;
                state.savepoints.clear();
                Ok(())
            }
            TxStatement::Rollback => {
                if !self.state.lock().explicit {
                    return Err(QuereusError::Misuse(
                        "cannot rollback - no transaction is active".into(),
                    ));
                }
                self.rollback_all().await
            }
            TxStatement::Savepoint(name) => {
                self.create_savepoint(name).await?;
                Ok(())
            }
            TxStatement::Release(name) => {
                let index = self.find_savepoint(name)?;
                self.drop_savepoint(index, false).await
            }
            TxStatement::RollbackTo(name) => {
                let index = self.find_savepoint(name)?;
                let connections: Vec<_> =
                    self.connections.lock().values().cloned().collect();
                for conn in connections {
                    conn.rollback_to(index).await?;
                }
                // The target savepoint itself survives.
                self.state
                    .lock()
                    .savepoints
                    .retain(|(_, i)| *i <= index);
                Ok(())
            }
        }
    }

    async fn rollback_all(&self) -> Result<()> {
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        for conn in connections {
            conn.rollback().await?;
        }
        let mut state = self.state.lock();
        state.explicit = false;
        state.savepoints.clear();
        Ok(())
    }

    async fn create_savepoint(&self, name: &str) -> Result<u32> {
        let index = {
            let mut state = self.state.lock();
            state.next_savepoint += 1;
            let index = state.next_savepoint;
            state.savepoints.push((name.to_string(), index));
            // A savepoint upgrades an auto-commit session to an explicit
            // transaction so following statements don't invalidate it.
            state.explicit = true;
            index
        };
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        for conn in connections {
            conn.savepoint(index).await?;
        }
        Ok(index)
    }

    /// Release a savepoint, optionally restoring its snapshot first.
    async fn drop_savepoint(&self, index: u32, restore: bool) -> Result<()> {
        let connections: Vec<_> = self.connections.lock().values().cloned().collect();
        for conn in connections {
            if restore {
                conn.rollback_to(index).await?;
            }
            conn.release(index).await?;
        }
        self.state.lock().savepoints.retain(|(_, i)| *i < index);
        Ok(())
    }

    fn find_savepoint(&self, name: &str) -> Result<u32> {
        self.state
            .lock()
            .savepoints
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, i)| *i)
            .ok_or_else(|| QuereusError::Misuse(format!("no such savepoint: {name}")))
    }

    async fn run_ddl(&self, ddl: &DdlStatement) -> Result<()> {
        match ddl {
            DdlStatement::CreateTable {
                schema,
                if_not_exists,
            } => {
                if self.db.catalog.try_get_table(&schema.name).is_some() {
                    if *if_not_exists {
                        return Ok(());
                    }
                    return Err(QuereusError::planning(format!(
                        "table {} already exists",
                        schema.name
                    )));
                }
                let module = self.db.registry.get(&schema.module)?;
                let created = self.db.catalog.create_table(schema.clone())?;
                if let Err(err) = module.create(Arc::clone(&created)).await {
                    self.db.catalog.drop_table(&schema.name)?;
                    return Err(err);
                }
                Ok(())
            }
            DdlStatement::CreateIndex {
                table,
                index,
                if_not_exists,
            } => {
                let schema = self.db.catalog.get_table(table)?;
                if schema.indexes.iter().any(|i| i.name == index.name) {
                    if *if_not_exists {
                        return Ok(());
                    }
                    return Err(QuereusError::planning(format!(
                        "index {} already exists",
                        index.name
                    )));
                }
                let module = self.db.registry.get(&schema.module)?;
                let vtab = module.connect(Arc::clone(&schema)).await?;
                vtab.create_index(index)?;
                let mut updated = (*schema).clone();
                updated.indexes.push(index.clone());
                self.db.catalog.replace_table(updated)?;
                Ok(())
            }
            DdlStatement::CreateView { view } => {
                // The view body must plan against the current catalog.
                planner::parse_single_query(&view.sql)?;
                self.db.catalog.create_view(view.clone())
            }
            DdlStatement::DropTable { name, if_exists } => {
                if self.db.catalog.try_get_table(name).is_none() {
                    if *if_exists {
                        return Ok(());
                    }
                    return Err(QuereusError::planning(format!("no such table: {name}")));
                }
                let schema = self.db.catalog.drop_table(name)?;
                let module = self.db.registry.get(&schema.module)?;
                module.destroy(schema).await?;
                self.connections.lock().remove(&name.to_ascii_lowercase());
                Ok(())
            }
            DdlStatement::DropView { name, if_exists } => {
                match self.db.catalog.drop_view(name) {
                    Ok(()) => Ok(()),
                    Err(_) if *if_exists => Ok(()),
                    Err(err) => Err(err),
                }
            }
            DdlStatement::AddConstraint { table, check } => {
                let schema = self.db.catalog.get_table(table)?;
                planner::parse_expr_sql(&check.expr_sql)?;
                let mut updated = (*schema).clone();
                updated.checks.push(check.clone());
                self.db.catalog.replace_table(updated)?;
                Ok(())
            }
            DdlStatement::CreateAssertion(assertion) => {
                self.db.catalog.create_assertion(assertion.clone())?;
                // Existing data must already satisfy the assertion.
                if let Err(err) = self.check_assertions().await {
                    self.db.catalog.drop_assertion(&assertion.name)?;
                    return Err(err);
                }
                Ok(())
            }
            DdlStatement::DropAssertion { name } => self.db.catalog.drop_assertion(name),
        }
    }

    async fn run_pragma(&self, pragma: &PragmaStatement) -> Result<ExecOutcome> {
        let name = pragma.name.to_ascii_lowercase();
        let int_value = |v: &SqlValue| match v.clone().cast(crate::types::Affinity::Integer) {
            SqlValue::Integer(i) => i,
            _ => 0,
        };
        match name.as_str() {
            "recursive_cte_limit" => {
                if let Some(value) = &pragma.value {
                    let limit = int_value(value).max(0) as u64;
                    self.db
                        .catalog
                        .update_settings(|s| s.recursive_cte_limit = limit);
                }
                let current = self.db.catalog.settings().recursive_cte_limit;
                Ok(pragma_row(&name, SqlValue::Integer(current as i64)))
            }
            "cache_threshold" => {
                if let Some(value) = &pragma.value {
                    let threshold = int_value(value).max(0) as usize;
                    self.db
                        .catalog
                        .update_settings(|s| s.cache_threshold = threshold);
                }
                let current = self.db.catalog.settings().cache_threshold;
                Ok(pragma_row(&name, SqlValue::Integer(current as i64)))
            }
            "schema_version" => Ok(pragma_row(
                &name,
                SqlValue::Integer(self.db.catalog.version() as i64),
            )),
            "module_list" => {
                let rows: Vec<Row> = self
                    .db
                    .registry
                    .names()
                    .into_iter()
                    .map(|n| vec![SqlValue::Text(n)])
                    .collect();
                Ok(ExecOutcome::Rows(QueryResult {
                    columns: vec![Attribute::new("name", ScalarType::text())],
                    rows,
                }))
            }
            "table_info" => {
                let table = match &pragma.value {
                    Some(SqlValue::Text(t)) => t.clone(),
                    _ => {
                        return Err(QuereusError::Misuse(
                            "PRAGMA table_info requires a table name".into(),
                        ))
                    }
                };
                let schema = self.db.catalog.get_table(&table)?;
                let rows = table_info_rows(&schema);
                Ok(ExecOutcome::Rows(QueryResult {
                    columns: vec![
                        Attribute::new("cid", ScalarType::integer()),
                        Attribute::new("name", ScalarType::text()),
                        Attribute::new("type", ScalarType::text()),
                        Attribute::new("notnull", ScalarType::integer()),
                        Attribute::new("dflt_value", ScalarType::text()),
                        Attribute::new("pk", ScalarType::integer()),
                    ],
                    rows,
                }))
            }
            // Unknown pragmas are ignored, as SQLite does.
            _ => Ok(ExecOutcome::Done),
        }
    }

    async fn run_analyze(&self, table: Option<&str>) -> Result<()> {
        let targets: Vec<Arc<TableSchema>> = match table {
            Some(name) => vec![self.db.catalog.get_table(name)?],
            None => self.db.catalog.list_tables(),
        };
        for schema in targets {
            let module = self.db.registry.get(&schema.module)?;
            let vtab = module.connect(Arc::clone(&schema)).await?;
            if let Some(rows) = vtab.committed_row_count() {
                self.db
                    .catalog
                    .set_stats(&schema.name, crate::schema::TableStats { row_count: rows });
            }
        }
        Ok(())
    }

    fn render_explain(&self, inner: &Block) -> QueryResult {
        let lines: Vec<String> = match &inner.plan {
            StatementPlan::Query(node) => render_plan(node),
            StatementPlan::Dml { plan, .. } => render_plan(plan),
            other => vec![format!("{other:?}")],
        };
        QueryResult {
            columns: vec![Attribute::new("plan", ScalarType::text())],
            rows: lines.into_iter().map(|l| vec![SqlValue::Text(l)]).collect(),
        }
    }
}

fn pragma_row(name: &str, value: SqlValue) -> ExecOutcome {
    ExecOutcome::Rows(QueryResult {
        columns: vec![Attribute::new(name, ScalarType::numeric())],
        rows: vec![vec![value]],
    })
}

fn table_info_rows(schema: &TableSchema) -> Vec<Row> {
    let pk = schema.effective_primary_key();
    schema
        .columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let pk_position = pk
                .iter()
                .position(|p| p.column_index == i)
                .map(|p| p as i64 + 1)
                .unwrap_or(0);
            vec![
                SqlValue::Integer(i as i64),
                SqlValue::Text(column.name.clone()),
                SqlValue::Text(format!("{:?}", column.affinity).to_uppercase()),
                SqlValue::from(!column.nullable),
                column
                    .default_sql
                    .clone()
                    .map(SqlValue::Text)
                    .unwrap_or(SqlValue::Null),
                SqlValue::Integer(pk_position),
            ]
        })
        .collect()
}
