//! Table-scan emitter: evaluates the pushed-down constraint values, obtains
//! the session's connection for the table, and streams rows from the
//! module. Reads through a connection observe that connection's layered
//! view (pending transaction layer over its snapshot).

use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;

use crate::error::{QuereusError, Result};
use crate::plan::{RelNode, RelOp};
use crate::schema::Catalog;
use crate::vtab::{EvaluatedConstraint, FilterArgs, VtabConnection};

use super::super::expr::{compile_expr_program, eval_value};
use super::super::instruction::{InstrId, Output, ProgramBuilder};

pub(super) fn emit_table_scan(
    node: &Arc<RelNode>,
    builder: &mut ProgramBuilder,
    catalog: &Catalog,
) -> Result<InstrId> {
    let RelOp::TableScan {
        table, filter_info, ..
    } = &node.op
    else {
        return Err(QuereusError::Internal("emit_table_scan misuse".into()));
    };

    // Constraint values become sub-programs evaluated when the scan opens;
    // they are row-independent by construction.
    let mut value_programs = Vec::new();
    let mut shapes = Vec::new();
    for constraint in &filter_info.constraints {
        let slot = match &constraint.value {
            Some(expr) => {
                value_programs.push(compile_expr_program(expr, catalog)?);
                Some(value_programs.len() - 1)
            }
            None => None,
        };
        shapes.push((constraint.column_index, constraint.op, slot));
    }

    let table = Arc::clone(table);
    let ordering = filter_info.ordering.clone();
    let limit = filter_info.limit;
    let note = format!(
        "scan {}{}",
        table.name,
        filter_info
            .explains
            .as_deref()
            .map(|e| format!(" ({e})"))
            .unwrap_or_default()
    );

    Ok(builder.emit(
        note,
        vec![],
        value_programs,
        Arc::new(move |ctx, _, subs| {
            let table = Arc::clone(&table);
            let shapes = shapes.clone();
            let ordering = ordering.clone();
            Box::pin(async move {
                let mut constraints = Vec::with_capacity(shapes.len());
                for (column_index, op, slot) in &shapes {
                    let value = match slot {
                        Some(slot) => eval_value(&subs[*slot], &ctx).await?,
                        None => crate::types::SqlValue::Null,
                    };
                    constraints.push(EvaluatedConstraint {
                        column_index: *column_index,
                        op: *op,
                        value,
                    });
                }
                let args = FilterArgs {
                    constraints,
                    ordering,
                    limit,
                };

                let vtab = ctx.table(&table).await?;
                let conn = ctx.connection(&table).await?;
                let conn_ref: Option<&dyn VtabConnection> =
                    conn.as_ref().map(|c| c.as_ref() as &dyn VtabConnection);
                let mut rows = vtab.query(conn_ref, args).await?;

                let stream = try_stream! {
                    while let Some(row) = rows.next().await {
                        ctx.check_cancelled()?;
                        yield row?;
                    }
                };
                Ok(Output::Stream(Box::pin(stream)))
            })
        }),
    ))
}
