//! Declarative-schema verbs: DECLARE SCHEMA stores a target DDL script;
//! DIFF SCHEMA renders the DDL that would migrate the live catalog to the
//! declared one; APPLY SCHEMA executes that diff (optionally followed by
//! the declaration's seed INSERTs); EXPLAIN SCHEMA renders the declared
//! target.

use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::error::{QuereusError, Result};
use crate::exec::ParamBindings;
use crate::plan::{SchemaVerb, StatementPlan};
use crate::planner::StatementBuilder;
use crate::schema::{Catalog, IndexSchema, TableSchema, ViewSchema};
use crate::types::{Affinity, ScalarType, SqlValue};
use crate::types::Attribute;

use super::{ExecOutcome, QueryResult, Session};

impl Session {
    pub(super) async fn run_schema_verb(&self, verb: &SchemaVerb) -> Result<ExecOutcome> {
        match verb {
            SchemaVerb::Declare(statements) => {
                *self.db_shared().declared.write() = statements.clone();
                debug!(statements = statements.len(), "declared schema");
                Ok(ExecOutcome::Done)
            }
            SchemaVerb::Diff => {
                let ddl = self.schema_diff()?;
                Ok(sql_rows(ddl))
            }
            SchemaVerb::Explain => {
                let declared = self.db_shared().declared.read().clone();
                if declared.is_empty() {
                    // Without a declaration, render the live schema.
                    return Ok(sql_rows(render_catalog(&self.db_shared().catalog)));
                }
                Ok(sql_rows(declared))
            }
            SchemaVerb::Apply { with_seed } => {
                // The diff itself re-plans the declaration, so a malformed
                // declaration fails here before anything is mutated.
                let ddl = self.schema_diff()?;
                for sql in &ddl {
                    Box::pin(self.execute_with(sql, ParamBindings::default())).await?;
                }
                if *with_seed {
                    let declared = self.db_shared().declared.read().clone();
                    for sql in declared {
                        if sql.trim_start().to_ascii_uppercase().starts_with("INSERT") {
                            Box::pin(self.execute_with(&sql, ParamBindings::default()))
                                .await?;
                        }
                    }
                }
                Ok(ExecOutcome::Done)
            }
        }
    }

    fn db_shared(&self) -> &super::DatabaseShared {
        &self.db
    }

    /// DDL statements migrating the live catalog to the declared schema.
    fn schema_diff(&self) -> Result<Vec<String>> {
        let declared = self.db_shared().declared.read().clone();
        if declared.is_empty() {
            return Err(QuereusError::Misuse("no schema has been declared".into()));
        }

        // Materialize the declared DDL into a scratch catalog.
        let scratch = Catalog::new();
        for sql in &declared {
            let upper = sql.trim_start().to_ascii_uppercase();
            if upper.starts_with("INSERT") {
                continue;
            }
            let statements = Parser::parse_sql(&SQLiteDialect {}, sql)?;
            for statement in &statements {
                let mut builder = StatementBuilder::new(scratch.clone());
                let block = builder.plan_statement(statement, sql)?;
                match block.plan {
                    StatementPlan::Ddl(ddl) => apply_to_scratch(&scratch, ddl)?,
                    _ => {
                        return Err(QuereusError::planning(format!(
                            "DECLARE SCHEMA accepts only DDL and seed INSERTs: {sql}"
                        )))
                    }
                }
            }
        }

        let live = &self.db_shared().catalog;
        let mut out = Vec::new();

        // The declarative schema governs storage tables only; eponymous
        // module tables (e.g. generate_series) are outside its scope.
        for table in live
            .list_tables()
            .into_iter()
            .filter(|t| t.module == "memory")
        {
            match scratch.try_get_table(&table.name) {
                None => out.push(format!("DROP TABLE {}", table.name)),
                Some(desired) if !tables_equal_ignoring_indexes(&table, &desired) => {
                    out.push(format!("DROP TABLE {}", table.name));
                    out.push(render_create_table(&desired));
                    for index in &desired.indexes {
                        out.push(render_create_index(&desired, index));
                    }
                }
                Some(desired) => {
                    // Same shape; reconcile indexes only.
                    for index in &desired.indexes {
                        if !table.indexes.iter().any(|i| i == index) {
                            out.push(render_create_index(&desired, index));
                        }
                    }
                }
            }
        }
        // Brand-new tables.
        for desired in scratch.list_tables() {
            if live.try_get_table(&desired.name).is_none() {
                out.push(render_create_table(&desired));
                for index in &desired.indexes {
                    out.push(render_create_index(&desired, index));
                }
            }
        }

        // Views.
        for view in live.list_views() {
            match scratch.get_view(&view.name) {
                None => out.push(format!("DROP VIEW {}", view.name)),
                Some(desired) if desired.sql != view.sql => {
                    out.push(format!("DROP VIEW {}", view.name));
                    out.push(render_create_view(&desired));
                }
                Some(_) => {}
            }
        }
        for desired in scratch.list_views() {
            if live.get_view(&desired.name).is_none() {
                out.push(render_create_view(&desired));
            }
        }

        Ok(out)
    }
}

fn apply_to_scratch(scratch: &Catalog, ddl: crate::plan::DdlStatement) -> Result<()> {
    use crate::plan::DdlStatement as D;
    match ddl {
        D::CreateTable { schema, .. } => {
            scratch.create_table(schema)?;
        }
        D::CreateIndex { table, index, .. } => {
            let schema = scratch.get_table(&table)?;
            let mut updated = (*schema).clone();
            updated.indexes.push(index);
            scratch.replace_table(updated)?;
        }
        D::CreateView { view } => scratch.create_view(view)?,
        other => {
            return Err(QuereusError::planning(format!(
                "unsupported statement in DECLARE SCHEMA: {other:?}"
            )))
        }
    }
    Ok(())
}

fn tables_equal_ignoring_indexes(a: &TableSchema, b: &TableSchema) -> bool {
    a.columns == b.columns
        && a.primary_key == b.primary_key
        && a.checks == b.checks
        && a.module == b.module
        && a.module_args == b.module_args
}

fn affinity_type_name(affinity: Affinity) -> &'static str {
    match affinity {
        Affinity::Integer => "INTEGER",
        Affinity::Real => "REAL",
        Affinity::Numeric => "NUMERIC",
        Affinity::Text => "TEXT",
        Affinity::Blob => "BLOB",
        Affinity::Null => "",
    }
}

pub(super) fn render_create_table(schema: &TableSchema) -> String {
    let mut parts: Vec<String> = Vec::new();
    for column in &schema.columns {
        let mut part = format!("{} {}", column.name, affinity_type_name(column.affinity));
        if !column.nullable {
            part.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default_sql {
            part.push_str(&format!(" DEFAULT {default}"));
        }
        parts.push(part.trim_end().to_string());
    }
    if !schema.primary_key.is_empty() {
        let key: Vec<String> = schema
            .primary_key
            .iter()
            .map(|p| {
                let name = &schema.columns[p.column_index].name;
                if p.desc {
                    format!("{name} DESC")
                } else {
                    name.clone()
                }
            })
            .collect();
        parts.push(format!("PRIMARY KEY ({})", key.join(", ")));
    }
    for check in &schema.checks {
        parts.push(format!("CHECK ({})", check.expr_sql));
    }
    format!("CREATE TABLE {} ({})", schema.name, parts.join(", "))
}

pub(super) fn render_create_index(table: &TableSchema, index: &IndexSchema) -> String {
    let unique = if index.unique { "UNIQUE " } else { "" };
    let columns: Vec<String> = index
        .columns
        .iter()
        .map(|p| {
            let name = &table.columns[p.column_index].name;
            if p.desc {
                format!("{name} DESC")
            } else {
                name.clone()
            }
        })
        .collect();
    format!(
        "CREATE {unique}INDEX {} ON {} ({})",
        index.name,
        table.name,
        columns.join(", ")
    )
}

pub(super) fn render_create_view(view: &ViewSchema) -> String {
    if view.columns.is_empty() {
        format!("CREATE VIEW {} AS {}", view.name, view.sql)
    } else {
        format!(
            "CREATE VIEW {} ({}) AS {}",
            view.name,
            view.columns.join(", "),
            view.sql
        )
    }
}

fn render_catalog(catalog: &Catalog) -> Vec<String> {
    let mut out = Vec::new();
    for table in catalog.list_tables() {
        out.push(render_create_table(&table));
        for index in &table.indexes {
            out.push(render_create_index(&table, index));
        }
    }
    for view in catalog.list_views() {
        out.push(render_create_view(&view));
    }
    out
}

fn sql_rows(lines: Vec<String>) -> ExecOutcome {
    ExecOutcome::Rows(QueryResult {
        columns: vec![Attribute::new("sql", ScalarType::text())],
        rows: lines
            .into_iter()
            .map(|l| vec![SqlValue::Text(l)])
            .collect(),
    })
}
