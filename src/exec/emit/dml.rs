//! The DML executor: the sole point of mutation. Pulls flat `OLD|NEW` rows
//! from its source — materialized first, so a statement's scan never
//! observes its own writes — applies affinity coercion and constraint
//! checks, extracts the old primary key, drives the vtab's `update`, and
//! yields the flat row for RETURNING.

use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;

use crate::error::{QuereusError, Result};
use crate::plan::{RelNode, ScalarExpr};
use crate::schema::{Catalog, TableSchema};
use crate::types::{Attribute, SqlValue};
use crate::vtab::{ConflictPolicy, DmlOp, Row, VtabConnection};

use super::super::context::{RowDescriptor, RuntimeContext};
use super::super::expr::{compile_expr_program, eval_value};
use super::super::instruction::{InstrId, Output, ProgramBuilder};
use super::compile_rel;

#[allow(clippy::too_many_arguments)]
pub(super) fn emit_dml(
    table: &Arc<TableSchema>,
    op: DmlOp,
    source: &Arc<RelNode>,
    old_attrs: &[Attribute],
    new_attrs: &[Attribute],
    on_conflict: ConflictPolicy,
    checks: &[ScalarExpr],
    builder: &mut ProgramBuilder,
    catalog: &Catalog,
) -> Result<InstrId> {
    let source_instr = compile_rel(source, builder, catalog)?;

    let flat_attrs: Vec<Attribute> = old_attrs
        .iter()
        .chain(new_attrs.iter())
        .cloned()
        .collect();
    let descriptor = Arc::new(RowDescriptor::from_attrs(&flat_attrs));

    let check_programs = checks
        .iter()
        .map(|c| compile_expr_program(c, catalog))
        .collect::<Result<Vec<_>>>()?;

    let table = Arc::clone(table);
    let width = table.columns.len();
    let pk_columns: Vec<usize> = table
        .effective_primary_key()
        .iter()
        .map(|p| p.column_index)
        .collect();

    Ok(builder.emit(
        format!("dml {op:?} {}", table.name),
        vec![source_instr],
        check_programs,
        Arc::new(move |ctx, mut args, subs| {
            let table = Arc::clone(&table);
            let descriptor = Arc::clone(&descriptor);
            let pk_columns = pk_columns.clone();
            Box::pin(async move {
                let mut source = super::take_stream(&mut args)?;
                let stream = try_stream! {
                    // Halloween protection: capture the target rows before
                    // any write lands in the pending layer.
                    let mut pending_rows: Vec<Row> = Vec::new();
                    while let Some(row) = source.next().await {
                        ctx.check_cancelled()?;
                        pending_rows.push(row?);
                    }

                    let vtab = ctx.table(&table).await?;
                    let conn = ctx.connection(&table).await?;

                    for mut flat in pending_rows {
                        ctx.check_cancelled()?;
                        if flat.len() != width * 2 {
                            Err(QuereusError::Internal(format!(
                                "flat DML row has {} columns, expected {}",
                                flat.len(),
                                width * 2
                            )))?;
                        }

                        if matches!(op, DmlOp::Insert | DmlOp::Update) {
                            // Affinity coercion on the NEW image.
                            for (i, column) in table.columns.iter().enumerate() {
                                let cell = &mut flat[width + i];
                                *cell = cell.clone().apply_affinity(column.affinity);
                            }
                            match enforce_row_constraints(
                                &ctx, &table, &descriptor, &flat, &subs, width,
                            )
                            .await
                            {
                                Ok(()) => {}
                                Err(err) => {
                                    if skip_or_raise(&ctx, on_conflict, err)? {
                                        continue;
                                    }
                                }
                            }
                        }

                        let new_row: Option<Row> = match op {
                            DmlOp::Delete => None,
                            _ => Some(flat[width..].to_vec()),
                        };
                        let old_key: Option<Vec<SqlValue>> = match op {
                            DmlOp::Insert => None,
                            _ => Some(
                                pk_columns.iter().map(|&i| flat[i].clone()).collect(),
                            ),
                        };

                        let conn_ref: Option<&dyn VtabConnection> =
                            conn.as_ref().map(|c| c.as_ref() as &dyn VtabConnection);
                        let outcome = vtab
                            .update(conn_ref, op, new_row, old_key, on_conflict)
                            .await;

                        match outcome {
                            Ok(Some(stored)) => {
                                // RETURNING sees the stored image.
                                for (i, value) in stored.into_iter().enumerate() {
                                    if matches!(op, DmlOp::Delete) {
                                        flat[i] = value;
                                    } else {
                                        flat[width + i] = value;
                                    }
                                }
                                ctx.record_change();
                                yield flat;
                            }
                            Ok(None) => match op {
                                // The module reported the row as skipped.
                                DmlOp::Insert | DmlOp::Update => continue,
                                DmlOp::Delete => {
                                    ctx.record_change();
                                    yield flat;
                                }
                            },
                            Err(err) => {
                                if skip_or_raise(&ctx, on_conflict, err)? {
                                    continue;
                                }
                            }
                        }
                    }
                };
                Ok(Output::Stream(Box::pin(stream)))
            })
        }),
    ))
}

/// NOT NULL and CHECK enforcement over the NEW image. A CHECK passes on
/// true or unknown; only a definite false is a violation.
async fn enforce_row_constraints(
    ctx: &Arc<RuntimeContext>,
    table: &TableSchema,
    descriptor: &Arc<RowDescriptor>,
    flat: &[SqlValue],
    checks: &[Arc<super::super::instruction::Program>],
    width: usize,
) -> Result<()> {
    for (i, column) in table.columns.iter().enumerate() {
        if !column.nullable && flat[width + i].is_null() {
            return Err(QuereusError::Constraint(format!(
                "NOT NULL constraint failed: {}.{}",
                table.name, column.name
            )));
        }
    }
    if !checks.is_empty() {
        let _frame = ctx.push_frame(Arc::clone(descriptor), flat.to_vec());
        for check in checks {
            let verdict = eval_value(check, ctx).await?;
            if !verdict.is_null() && !verdict.is_truthy() {
                return Err(QuereusError::Constraint(format!(
                    "CHECK constraint failed: {}",
                    table.name
                )));
            }
        }
    }
    Ok(())
}

/// Apply the statement's conflict policy to a constraint error: IGNORE
/// swallows the row, ROLLBACK additionally asks the session to discard the
/// enclosing transaction, everything else aborts the statement.
fn skip_or_raise(
    ctx: &Arc<RuntimeContext>,
    policy: ConflictPolicy,
    err: QuereusError,
) -> Result<bool> {
    if !err.is_constraint() {
        return Err(err);
    }
    match policy {
        ConflictPolicy::Ignore => Ok(true),
        ConflictPolicy::Rollback => {
            ctx.request_txn_rollback();
            Err(err)
        }
        _ => Err(err),
    }
}
