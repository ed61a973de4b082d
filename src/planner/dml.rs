//! DML planning. Every mutation becomes a pipeline that assembles flat
//! `OLD|NEW` rows and feeds them to a single `DmlExecutor` node; RETURNING
//! projects over the executor's output, and a `Sink` drains it otherwise.

use std::sync::Arc;

use sqlparser::ast::{
    AssignmentTarget, Delete, Expr as SqlExpr, FromTable, Insert, OnConflictAction, OnInsert,
    SelectItem, SqliteOnConflict, TableFactor, TableWithJoins,
};

use crate::error::{QuereusError, Result};
use crate::plan::{table_attributes, RelNode, RelOp, ScalarExpr};
use crate::schema::TableSchema;
use crate::types::{Attribute, SqlValue};
use crate::vtab::{ConflictPolicy, DmlOp};

use super::scope::Scope;
use super::{object_name_str, parse_expr_sql, StatementBuilder};

impl StatementBuilder {
    pub(crate) fn plan_insert(
        &mut self,
        insert: &Insert,
    ) -> Result<(Arc<RelNode>, Vec<Attribute>)> {
        let table = self.catalog.get_table(&object_name_str(&insert.table_name))?;

        let column_indexes: Vec<usize> = if insert.columns.is_empty() {
            (0..table.columns.len()).collect()
        } else {
            insert
                .columns
                .iter()
                .map(|ident| {
                    table.column_index(&ident.value).ok_or_else(|| {
                        QuereusError::planning(format!(
                            "table {} has no column named {}",
                            table.name, ident.value
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };

        let source_query = insert.source.as_ref().ok_or_else(|| {
            QuereusError::planning("INSERT without a source is not supported")
        })?;
        let scope = Scope::new();
        let source = self.plan_query(&scope, source_query)?;
        let source_attrs = source.attributes();
        if source_attrs.len() != column_indexes.len() {
            return Err(QuereusError::planning(format!(
                "{} values for {} columns",
                source_attrs.len(),
                column_indexes.len()
            )));
        }

        let on_conflict = insert_conflict_policy(insert)?;

        // Flat row: OLD side all null for inserts, NEW side the supplied
        // values with DEFAULTs filled in.
        let (old_attrs, new_attrs) = mint_flat_attrs(&table);
        let mut exprs: Vec<(ScalarExpr, Attribute)> = old_attrs
            .iter()
            .map(|attr| (ScalarExpr::Literal(SqlValue::Null), attr.clone()))
            .collect();
        for (i, column) in table.columns.iter().enumerate() {
            let expr = match column_indexes.iter().position(|&c| c == i) {
                Some(j) => {
                    let a = &source_attrs[j];
                    ScalarExpr::column(a.id, a.name.clone(), a.ty.clone())
                }
                None => self.default_expr(column.default_sql.as_deref())?,
            };
            exprs.push((expr, new_attrs[i].clone()));
        }
        let flat = RelNode::logical(RelOp::Project {
            input: source,
            exprs,
        });

        let checks = self.build_checks(&table, &new_attrs)?;
        let dml = RelNode::logical(RelOp::DmlExecutor {
            table: Arc::clone(&table),
            op: DmlOp::Insert,
            source: flat,
            old_attrs,
            new_attrs: new_attrs.clone(),
            on_conflict,
            checks,
        });

        self.finish_dml(dml, insert.returning.as_deref(), &table, &new_attrs)
    }

    pub(crate) fn plan_update(
        &mut self,
        table: &TableWithJoins,
        assignments: &[sqlparser::ast::Assignment],
        selection: Option<&SqlExpr>,
        returning: Option<&[SelectItem]>,
    ) -> Result<(Arc<RelNode>, Vec<Attribute>)> {
        let (schema, alias) = target_table(table)?;
        let schema = self.catalog.get_table(&schema)?;
        let (mut node, scope, old_attrs) = self.scan_target(&schema, &alias);

        if let Some(selection) = selection {
            let predicate = self.build_expr(&scope, selection)?;
            node = RelNode::logical(RelOp::Filter {
                input: node,
                predicate,
            });
        }

        // Column index → assigned expression.
        let mut assigned: Vec<Option<ScalarExpr>> = vec![None; schema.columns.len()];
        for assignment in assignments {
            let AssignmentTarget::ColumnName(name) = &assignment.target else {
                return Err(QuereusError::planning(
                    "only plain column assignments are supported",
                ));
            };
            let column = object_name_str(name);
            let index = schema.column_index(&column).ok_or_else(|| {
                QuereusError::planning(format!(
                    "table {} has no column named {column}",
                    schema.name
                ))
            })?;
            assigned[index] = Some(self.build_expr(&scope, &assignment.value)?);
        }

        let new_attrs = mint_new_attrs(&schema);
        let mut exprs: Vec<(ScalarExpr, Attribute)> = old_attrs
            .iter()
            .map(|attr| {
                (
                    ScalarExpr::column(attr.id, attr.name.clone(), attr.ty.clone()),
                    attr.clone(),
                )
            })
            .collect();
        for (i, attr) in new_attrs.iter().enumerate() {
            let expr = match assigned[i].take() {
                Some(expr) => expr,
                None => {
                    let old = &old_attrs[i];
                    ScalarExpr::column(old.id, old.name.clone(), old.ty.clone())
                }
            };
            exprs.push((expr, attr.clone()));
        }
        let flat = RelNode::logical(RelOp::Project { input: node, exprs });

        let checks = self.build_checks(&schema, &new_attrs)?;
        let dml = RelNode::logical(RelOp::DmlExecutor {
            table: Arc::clone(&schema),
            op: DmlOp::Update,
            source: flat,
            old_attrs,
            new_attrs: new_attrs.clone(),
            on_conflict: ConflictPolicy::Abort,
            checks,
        });

        self.finish_dml(dml, returning, &schema, &new_attrs)
    }

    pub(crate) fn plan_delete(&mut self, delete: &Delete) -> Result<(Arc<RelNode>, Vec<Attribute>)> {
        if !delete.tables.is_empty() {
            return Err(QuereusError::planning(
                "multi-table DELETE is not supported",
            ));
        }
        let from = match &delete.from {
            FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
        };
        let [table] = from.as_slice() else {
            return Err(QuereusError::planning(
                "DELETE requires exactly one target table",
            ));
        };
        let (name, alias) = target_table(table)?;
        let schema = self.catalog.get_table(&name)?;
        let (mut node, scope, old_attrs) = self.scan_target(&schema, &alias);

        if let Some(selection) = &delete.selection {
            let predicate = self.build_expr(&scope, selection)?;
            node = RelNode::logical(RelOp::Filter {
                input: node,
                predicate,
            });
        }

        let new_attrs = mint_new_attrs(&schema);
        let mut exprs: Vec<(ScalarExpr, Attribute)> = old_attrs
            .iter()
            .map(|attr| {
                (
                    ScalarExpr::column(attr.id, attr.name.clone(), attr.ty.clone()),
                    attr.clone(),
                )
            })
            .collect();
        for attr in &new_attrs {
            exprs.push((ScalarExpr::Literal(SqlValue::Null), attr.clone()));
        }
        let flat = RelNode::logical(RelOp::Project { input: node, exprs });

        let dml = RelNode::logical(RelOp::DmlExecutor {
            table: Arc::clone(&schema),
            op: DmlOp::Delete,
            source: flat,
            old_attrs: old_attrs.clone(),
            new_attrs,
            on_conflict: ConflictPolicy::Abort,
            checks: Vec::new(),
        });

        // DELETE ... RETURNING projects the deleted row's old values.
        self.finish_dml(dml, delete.returning.as_deref(), &schema, &old_attrs)
    }

    /// Scan pipeline for an UPDATE/DELETE target; the scan's attributes
    /// double as the flat row's OLD attributes.
    fn scan_target<'a>(
        &mut self,
        schema: &Arc<TableSchema>,
        alias: &str,
    ) -> (Arc<RelNode>, Scope<'a>, Vec<Attribute>) {
        let attributes = table_attributes(schema);
        let mut scope = Scope::new();
        scope.add_relation(alias.to_string(), attributes.clone());
        let reference = RelNode::logical(RelOp::TableReference {
            table: Arc::clone(schema),
            alias: alias.to_string(),
            attributes: attributes.clone(),
        });
        let node = RelNode::logical(RelOp::Retrieve { input: reference });
        (node, scope, attributes)
    }

    fn default_expr(&mut self, default_sql: Option<&str>) -> Result<ScalarExpr> {
        match default_sql {
            None => Ok(ScalarExpr::Literal(SqlValue::Null)),
            Some(sql) => {
                let ast = parse_expr_sql(sql)?;
                let scope = Scope::new();
                self.build_expr(&scope, &ast)
            }
        }
    }

    /// Compile the table's CHECK constraints against the NEW attributes.
    pub(crate) fn build_checks(
        &mut self,
        schema: &TableSchema,
        new_attrs: &[Attribute],
    ) -> Result<Vec<ScalarExpr>> {
        let mut scope = Scope::new();
        scope.add_relation(schema.name.clone(), new_attrs.to_vec());
        schema
            .checks
            .iter()
            .map(|check| {
                let ast = parse_expr_sql(&check.expr_sql)?;
                self.build_expr(&scope, &ast)
            })
            .collect()
    }

    /// Wrap the executor in RETURNING or a sink.
    fn finish_dml(
        &mut self,
        dml: Arc<RelNode>,
        returning: Option<&[SelectItem]>,
        schema: &TableSchema,
        visible_attrs: &[Attribute],
    ) -> Result<(Arc<RelNode>, Vec<Attribute>)> {
        match returning {
            None => {
                let node = RelNode::logical(RelOp::Sink { input: dml });
                Ok((node, Vec::new()))
            }
            Some(items) => {
                let mut scope = Scope::new();
                scope.add_relation(schema.name.clone(), visible_attrs.to_vec());
                let mut exprs: Vec<(ScalarExpr, Attribute)> = Vec::new();
                for item in items {
                    match item {
                        SelectItem::UnnamedExpr(expr) => {
                            let built = self.build_expr(&scope, expr)?;
                            let name = built.output_name();
                            let attr = Attribute::new(name, built.result_type());
                            exprs.push((built, attr));
                        }
                        SelectItem::ExprWithAlias { expr, alias } => {
                            let built = self.build_expr(&scope, expr)?;
                            let attr = Attribute::new(alias.value.clone(), built.result_type());
                            exprs.push((built, attr));
                        }
                        SelectItem::Wildcard(_) => {
                            for attr in visible_attrs {
                                exprs.push((
                                    ScalarExpr::column(
                                        attr.id,
                                        attr.name.clone(),
                                        attr.ty.clone(),
                                    ),
                                    Attribute::new(attr.name.clone(), attr.ty.clone()),
                                ));
                            }
                        }
                        other => {
                            return Err(QuereusError::planning(format!(
                                "unsupported RETURNING item: {other}"
                            )))
                        }
                    }
                }
                let columns: Vec<Attribute> = exprs.iter().map(|(_, a)| a.clone()).collect();
                let node = RelNode::logical(RelOp::Returning { input: dml, exprs });
                Ok((node, columns))
            }
        }
    }
}

fn mint_flat_attrs(schema: &TableSchema) -> (Vec<Attribute>, Vec<Attribute>) {
    (mint_new_attrs(schema), mint_new_attrs(schema))
}

fn mint_new_attrs(schema: &TableSchema) -> Vec<Attribute> {
    table_attributes(schema)
}

fn insert_conflict_policy(insert: &Insert) -> Result<ConflictPolicy> {
    if let Some(or) = &insert.or {
        return Ok(match or {
            SqliteOnConflict::Rollback => ConflictPolicy::Rollback,
            SqliteOnConflict::Abort => ConflictPolicy::Abort,
            SqliteOnConflict::Fail => ConflictPolicy::Fail,
            SqliteOnConflict::Ignore => ConflictPolicy::Ignore,
            SqliteOnConflict::Replace => ConflictPolicy::Replace,
        });
    }
    match &insert.on {
        None => Ok(ConflictPolicy::Abort),
        Some(OnInsert::OnConflict(on_conflict)) => match &on_conflict.action {
            OnConflictAction::DoNothing => Ok(ConflictPolicy::Ignore),
            other => Err(QuereusError::planning(format!(
                "unsupported ON CONFLICT action: {other}"
            ))),
        },
        Some(other) => Err(QuereusError::planning(format!(
            "unsupported INSERT conflict clause: {other:?}"
        ))),
    }
}

fn target_table(table: &TableWithJoins) -> Result<(String, String)> {
    if !table.joins.is_empty() {
        return Err(QuereusError::planning(
            "joined tables cannot be a DML target",
        ));
    }
    match &table.relation {
        TableFactor::Table { name, alias, .. } => {
            let table_name = object_name_str(name);
            let alias_name = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| table_name.clone());
            Ok((table_name, alias_name))
        }
        other => Err(QuereusError::planning(format!(
            "unsupported DML target: {other}"
        ))),
    }
}
