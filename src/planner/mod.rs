//! Plan builder: SQL text (via the sqlparser AST) into `Block` statement
//! plans. A thin keyword pre-scanner in front of the parser recognizes the
//! statements outside its grammar: the declarative-schema verbs and
//! assertions.

pub mod ddl;
pub mod dml;
pub mod expression;
pub mod scope;
pub mod select;

use std::collections::HashMap;

use sqlparser::ast::{Expr as SqlExpr, ObjectName, Query, Statement};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::error::{QuereusError, Result};
use crate::plan::{
    Block, DdlStatement, ParamShape, SchemaVerb, StatementPlan,
};
use crate::schema::{AssertionSchema, Catalog};
use crate::types::{Attribute, ScalarType};

use scope::Scope;
use select::CteBinding;

/// Per-statement planning state: the catalog snapshot, the parameter shape
/// being collected, and the CTE binding stack.
pub struct StatementBuilder {
    pub(crate) catalog: Catalog,
    pub(crate) params: ParamShape,
    pub(crate) param_auto: usize,
    pub(crate) ctes: Vec<HashMap<String, CteBinding>>,
    working_counter: u64,
}

impl StatementBuilder {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            params: ParamShape::default(),
            param_auto: 0,
            ctes: Vec::new(),
            working_counter: 0,
        }
    }

    pub(crate) fn fresh_working_key(&mut self, name: &str) -> String {
        self.working_counter += 1;
        format!("{name}#{}", self.working_counter)
    }

    /// Plan one parsed statement into a `Block`.
    pub fn plan_statement(&mut self, stmt: &Statement, sql: &str) -> Result<Block> {
        let plan = self.dispatch(stmt)?;
        let columns = match &plan {
            StatementPlan::Query(node) => node.attributes(),
            StatementPlan::Dml { plan, returning } if *returning => plan.attributes(),
            StatementPlan::Explain(_) => vec![Attribute::new("plan", ScalarType::text())],
            StatementPlan::Schema(SchemaVerb::Diff) | StatementPlan::Schema(SchemaVerb::Explain) => {
                vec![Attribute::new("sql", ScalarType::text())]
            }
            _ => Vec::new(),
        };
        debug!(sql, params = %self.params.fingerprint(), "planned statement");
        Ok(Block {
            plan,
            parameters: std::mem::take(&mut self.params),
            columns,
            sql: sql.to_string(),
        })
    }

    fn dispatch(&mut self, stmt: &Statement) -> Result<StatementPlan> {
        match stmt {
            Statement::Query(query) => {
                let scope = Scope::new();
                let node = self.plan_query(&scope, query)?;
                Ok(StatementPlan::Query(node))
            }
            Statement::Insert(insert) => {
                let (plan, columns) = self.plan_insert(insert)?;
                Ok(StatementPlan::Dml {
                    plan,
                    returning: !columns.is_empty(),
                })
            }
            Statement::Update {
                table,
                assignments,
                selection,
                returning,
                ..
            } => {
                let (plan, columns) =
                    self.plan_update(table, assignments, selection.as_ref(), returning.as_deref())?;
                Ok(StatementPlan::Dml {
                    plan,
                    returning: !columns.is_empty(),
                })
            }
            Statement::Delete(delete) => {
                let (plan, columns) = self.plan_delete(delete)?;
                Ok(StatementPlan::Dml {
                    plan,
                    returning: !columns.is_empty(),
                })
            }
            Statement::CreateTable(create) => {
                Ok(StatementPlan::Ddl(self.build_create_table(create)?))
            }
            Statement::CreateVirtualTable {
                name,
                if_not_exists,
                module_name,
                module_args,
            } => Ok(StatementPlan::Ddl(self.build_create_virtual_table(
                name,
                *if_not_exists,
                module_name,
                module_args,
            )?)),
            Statement::CreateIndex(create) => {
                Ok(StatementPlan::Ddl(self.build_create_index(create)?))
            }
            Statement::CreateView { .. } => Ok(StatementPlan::Ddl(self.build_create_view(stmt)?)),
            Statement::Drop { .. } => Ok(StatementPlan::Ddl(self.build_drop(stmt)?)),
            Statement::AlterTable {
                name, operations, ..
            } => Ok(StatementPlan::Ddl(self.build_alter_table(name, operations)?)),
            Statement::StartTransaction { .. }
            | Statement::Commit { .. }
            | Statement::Rollback { .. }
            | Statement::Savepoint { .. }
            | Statement::ReleaseSavepoint { .. } => Ok(StatementPlan::Tx(self.build_tx(stmt)?)),
            Statement::Pragma { name, value, .. } => {
                Ok(StatementPlan::Pragma(self.build_pragma(name, value.as_ref())?))
            }
            Statement::Analyze { table_name, .. } => Ok(StatementPlan::Analyze {
                table: Some(object_name_str(table_name)),
            }),
            Statement::Explain { statement, .. } => {
                let mut inner_builder = StatementBuilder::new(self.catalog.clone());
                let inner = inner_builder.plan_statement(statement, &statement.to_string())?;
                self.params = inner.parameters.clone();
                Ok(StatementPlan::Explain(Box::new(inner)))
            }
            other => Err(QuereusError::planning(format!(
                "unsupported statement: {other}"
            ))),
        }
    }
}

/// Plan a whole SQL script. The declarative-schema verbs and assertion
/// statements are recognized before the parser runs; everything else parses
/// as a normal statement list.
pub fn plan_script(catalog: &Catalog, sql: &str) -> Result<Vec<Block>> {
    if let Some(block) = plan_special(sql)? {
        return Ok(vec![block]);
    }
    let statements = Parser::parse_sql(&SQLiteDialect {}, sql)?;
    statements
        .iter()
        .map(|stmt| {
            let mut builder = StatementBuilder::new(catalog.clone());
            builder.plan_statement(stmt, &stmt.to_string())
        })
        .collect()
}

/// Recognize the statements that live outside the parser's grammar. They
/// are only accepted as a standalone script.
pub fn plan_special(sql: &str) -> Result<Option<Block>> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_ascii_uppercase();

    let plan = if upper.starts_with("DECLARE SCHEMA") {
        let payload = trimmed["DECLARE SCHEMA".len()..].trim().to_string();
        if payload.is_empty() {
            return Err(QuereusError::Parse("DECLARE SCHEMA requires DDL".into()));
        }
        let statements = split_ddl_script(&payload)?;
        Some(StatementPlan::Schema(SchemaVerb::Declare(statements)))
    } else if upper == "DIFF SCHEMA" {
        Some(StatementPlan::Schema(SchemaVerb::Diff))
    } else if upper == "EXPLAIN SCHEMA" {
        Some(StatementPlan::Schema(SchemaVerb::Explain))
    } else if upper == "APPLY SCHEMA" {
        Some(StatementPlan::Schema(SchemaVerb::Apply { with_seed: false }))
    } else if upper == "APPLY SCHEMA WITH SEED" {
        Some(StatementPlan::Schema(SchemaVerb::Apply { with_seed: true }))
    } else if upper.starts_with("CREATE ASSERTION") {
        Some(StatementPlan::Ddl(parse_create_assertion(trimmed)?))
    } else if let Some(rest) = upper.strip_prefix("DROP ASSERTION") {
        let name = rest.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(QuereusError::Parse("DROP ASSERTION requires a name".into()));
        }
        Some(StatementPlan::Ddl(DdlStatement::DropAssertion {
            name: name.to_ascii_lowercase(),
        }))
    } else {
        None
    };

    Ok(plan.map(|plan| {
        let columns = match &plan {
            StatementPlan::Schema(SchemaVerb::Diff) | StatementPlan::Schema(SchemaVerb::Explain) => {
                vec![Attribute::new("sql", ScalarType::text())]
            }
            _ => Vec::new(),
        };
        Block {
            plan,
            parameters: ParamShape::default(),
            columns,
            sql: sql.to_string(),
        }
    }))
}

/// `CREATE ASSERTION <name> CHECK ( <condition> )`.
fn parse_create_assertion(sql: &str) -> Result<DdlStatement> {
    let rest = &sql["CREATE ASSERTION".len()..];
    let rest = rest.trim_start();
    let name_end = rest
        .find(char::is_whitespace)
        .ok_or_else(|| QuereusError::Parse("CREATE ASSERTION requires CHECK".into()))?;
    let name = rest[..name_end].to_string();
    let rest = rest[name_end..].trim_start();
    let upper = rest.to_ascii_uppercase();
    if !upper.starts_with("CHECK") {
        return Err(QuereusError::Parse(
            "CREATE ASSERTION requires a CHECK clause".into(),
        ));
    }
    let rest = rest["CHECK".len()..].trim();
    if !rest.starts_with('(') || !rest.ends_with(')') {
        return Err(QuereusError::Parse(
            "CHECK condition must be parenthesized".into(),
        ));
    }
    let condition = rest[1..rest.len() - 1].trim().to_string();
    // Validate the condition parses now rather than at first DML.
    parse_expr_sql(&condition)?;
    Ok(DdlStatement::CreateAssertion(AssertionSchema {
        name: name.to_ascii_lowercase(),
        check_sql: condition,
    }))
}

/// Split a DECLARE SCHEMA payload into individual DDL statements, validating
/// each parses.
fn split_ddl_script(sql: &str) -> Result<Vec<String>> {
    let statements = Parser::parse_sql(&SQLiteDialect {}, sql)?;
    Ok(statements.iter().map(|s| s.to_string()).collect())
}

pub(crate) fn object_name_str(name: &ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_default()
}

pub fn parse_single_query(sql: &str) -> Result<Box<Query>> {
    let statements = Parser::parse_sql(&SQLiteDialect {}, sql)?;
    match statements.into_iter().next() {
        Some(Statement::Query(query)) => Ok(query),
        _ => Err(QuereusError::planning("expected a single query")),
    }
}

pub fn parse_expr_sql(sql: &str) -> Result<SqlExpr> {
    let mut parser = Parser::new(&SQLiteDialect {}).try_with_sql(sql)?;
    Ok(parser.parse_expr()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{RelOp, StatementPlan};
    use crate::schema::{ColumnSchema, PrimaryKeyPart, TableSchema};
    use crate::types::Affinity;

    fn catalog() -> Catalog {
        let catalog = Catalog::new();
        let mut schema = TableSchema::new(
            "t",
            vec![
                ColumnSchema::new("id", Affinity::Integer).not_null(),
                ColumnSchema::new("v", Affinity::Text),
            ],
        );
        schema.primary_key = vec![PrimaryKeyPart {
            column_index: 0,
            desc: false,
        }];
        catalog.create_table(schema).unwrap();
        catalog
    }

    #[test]
    fn test_plan_simple_select() {
        let blocks = plan_script(&catalog(), "SELECT v FROM t WHERE id = 1").unwrap();
        assert_eq!(blocks.len(), 1);
        let StatementPlan::Query(node) = &blocks[0].plan else {
            panic!("expected a query plan");
        };
        assert_eq!(blocks[0].columns.len(), 1);
        assert_eq!(blocks[0].columns[0].name, "v");
        assert!(matches!(node.op, RelOp::Project { .. }));
    }

    #[test]
    fn test_unknown_column_is_planning_error() {
        let err = plan_script(&catalog(), "SELECT missing FROM t").unwrap_err();
        assert!(matches!(err, QuereusError::Planning { .. }));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_parameters_recorded_on_block() {
        let blocks =
            plan_script(&catalog(), "SELECT v FROM t WHERE id = ? AND v = :name").unwrap();
        let params = &blocks[0].parameters;
        assert_eq!(params.positional, 1);
        assert!(params.named.contains("name"));
    }

    #[test]
    fn test_ambiguous_column_is_error() {
        let err =
            plan_script(&catalog(), "SELECT id FROM t a JOIN t b ON a.id = b.id").unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn test_declare_schema_prescan() {
        let blocks = plan_script(
            &Catalog::new(),
            "DECLARE SCHEMA CREATE TABLE s(x INTEGER PRIMARY KEY)",
        )
        .unwrap();
        let StatementPlan::Schema(SchemaVerb::Declare(ddl)) = &blocks[0].plan else {
            panic!("expected DECLARE SCHEMA");
        };
        assert_eq!(ddl.len(), 1);
        assert!(ddl[0].to_uppercase().contains("CREATE TABLE"));
    }

    #[test]
    fn test_create_assertion_prescan() {
        let blocks = plan_script(
            &catalog(),
            "CREATE ASSERTION small CHECK ((SELECT count(*) FROM t) <= 10)",
        )
        .unwrap();
        let StatementPlan::Ddl(DdlStatement::CreateAssertion(assertion)) = &blocks[0].plan
        else {
            panic!("expected CREATE ASSERTION");
        };
        assert_eq!(assertion.name, "small");
        assert!(assertion.check_sql.contains("count"));
    }

    #[test]
    fn test_aggregate_in_where_rejected() {
        let err = plan_script(&catalog(), "SELECT v FROM t WHERE count(*) > 1").unwrap_err();
        assert!(err.to_string().contains("aggregate"));
    }

    #[test]
    fn test_recursive_cte_plans() {
        let sql = "WITH RECURSIVE r(n) AS (SELECT 1 UNION ALL SELECT n+1 FROM r WHERE n < 5) \
                   SELECT n FROM r";
        let blocks = plan_script(&catalog(), sql).unwrap();
        let StatementPlan::Query(node) = &blocks[0].plan else {
            panic!("expected query");
        };
        // Project over the recursive CTE expansion.
        let mut found = false;
        fn walk(node: &crate::plan::RelNode, found: &mut bool) {
            if matches!(node.op, RelOp::RecursiveCte { .. }) {
                *found = true;
            }
            for child in node.relations() {
                walk(&child, found);
            }
        }
        walk(node, &mut found);
        assert!(found, "plan should contain a RecursiveCte node");
    }
}
