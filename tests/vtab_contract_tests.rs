//! The module contract from the consumer side: a custom module registered
//! by an embedder, subtree push-down via `supports`/`execute_plan`, and the
//! no-silent-fallback rule for modules that cannot plan access paths.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use quereus::error::{QuereusError, Result};
use quereus::plan::RelNode;
use quereus::schema::{ColumnSchema, TableSchema};
use quereus::types::Affinity;
use quereus::vtab::{
    ConflictPolicy, DmlOp, FilterArgs, Row, RowStream, SubtreeSupport, VirtualTable,
    VtabConnection, VtabModule,
};
use quereus::{Database, SqlValue};

/// A module that refuses row scans but executes whole subtrees itself.
struct PushdownModule;

struct PushdownTable {
    schema: Arc<TableSchema>,
}

#[async_trait]
impl VtabModule for PushdownModule {
    fn name(&self) -> &str {
        "pushdown"
    }

    async fn create(&self, schema: Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        Ok(Arc::new(PushdownTable { schema }))
    }

    async fn connect(&self, schema: Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        Ok(Arc::new(PushdownTable { schema }))
    }

    fn supports(&self, _plan: &RelNode) -> Option<SubtreeSupport> {
        Some(SubtreeSupport { cost: 10.0 })
    }

    async fn execute_plan(&self, plan: Arc<RelNode>) -> Result<RowStream> {
        // Answer any subtree with a fixed two-row result of the right arity.
        let arity = plan.attributes().len();
        let rows: Vec<Result<Row>> = (1..=2)
            .map(|i| Ok(vec![SqlValue::Integer(i); arity]))
            .collect();
        Ok(Box::pin(stream::iter(rows)))
    }

    async fn destroy(&self, _schema: Arc<TableSchema>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl VirtualTable for PushdownTable {
    fn schema(&self) -> Arc<TableSchema> {
        Arc::clone(&self.schema)
    }

    async fn query(
        &self,
        _conn: Option<&dyn VtabConnection>,
        _filters: FilterArgs,
    ) -> Result<RowStream> {
        Err(QuereusError::Internal(
            "pushdown tables never serve row scans".into(),
        ))
    }

    async fn update(
        &self,
        _conn: Option<&dyn VtabConnection>,
        _op: DmlOp,
        _new_row: Option<Row>,
        _old_key: Option<Vec<SqlValue>>,
        _on_conflict: ConflictPolicy,
    ) -> Result<Option<Row>> {
        Err(QuereusError::Runtime("pushdown tables are read-only".into()))
    }
}

/// A module with neither an access planner nor subtree support.
struct OpaqueModule;

#[async_trait]
impl VtabModule for OpaqueModule {
    fn name(&self) -> &str {
        "opaque"
    }

    async fn create(&self, schema: Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        Ok(Arc::new(PushdownTable { schema }))
    }

    async fn connect(&self, schema: Arc<TableSchema>) -> Result<Arc<dyn VirtualTable>> {
        Ok(Arc::new(PushdownTable { schema }))
    }

    async fn destroy(&self, _schema: Arc<TableSchema>) -> Result<()> {
        Ok(())
    }
}

fn external_schema(name: &str, module: &str) -> TableSchema {
    let mut schema = TableSchema::new(
        name,
        vec![
            ColumnSchema::new("id", Affinity::Integer),
            ColumnSchema::new("v", Affinity::Text),
        ],
    );
    schema.module = module.to_string();
    schema
}

#[tokio::test]
async fn test_subtree_pushdown_executes_through_module() {
    let db = Database::new();
    db.register_module(Arc::new(PushdownModule));
    db.catalog()
        .create_table(external_schema("ext", "pushdown"))
        .unwrap();

    let session = db.session();
    let result = session.query("SELECT id, v FROM ext").await.unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0][0].to_string(), "1");
    assert_eq!(result.rows[1][0].to_string(), "2");

    let plan = session.query("EXPLAIN SELECT id, v FROM ext").await.unwrap();
    let rendered: String = plan
        .rows
        .iter()
        .map(|r| r[0].to_string())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(rendered.contains("ModuleExec"), "plan was {rendered}");
}

#[tokio::test]
async fn test_module_without_planner_or_support_is_internal_error() {
    let db = Database::new();
    db.register_module(Arc::new(OpaqueModule));
    db.catalog()
        .create_table(external_schema("dark", "opaque"))
        .unwrap();

    let session = db.session();
    let err = session.query("SELECT id FROM dark").await.unwrap_err();
    assert!(matches!(err, QuereusError::Internal(_)));
}
