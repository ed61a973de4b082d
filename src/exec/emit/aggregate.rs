//! Streaming aggregation over group-key-clustered input, and window
//! evaluation over partition-sorted input.

use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;

use crate::error::{QuereusError, Result};
use crate::plan::{AggregateExpr, RelNode, ScalarExpr, WindowFuncExpr};
use crate::schema::function::AccumulatorFactory;
use crate::schema::{Catalog, ResolvedFunction};
use crate::types::{Attribute, Collation, SqlValue};

use super::super::expr::{compile_expr_program, eval_value};
use super::super::instruction::{InstrId, Output, Program, ProgramBuilder};
use super::{compile_rel, descriptor_of, CanonRow};

pub(super) fn emit_stream_aggregate(
    input: &Arc<RelNode>,
    group_by: &[(ScalarExpr, Attribute)],
    aggregates: &[AggregateExpr],
    builder: &mut ProgramBuilder,
    catalog: &Catalog,
) -> Result<InstrId> {
    let source = compile_rel(input, builder, catalog)?;
    let descriptor = descriptor_of(input);

    let group_collations: Arc<Vec<Collation>> = Arc::new(
        group_by
            .iter()
            .map(|(e, _)| e.result_type().collation)
            .collect(),
    );

    let mut subs = Vec::new();
    for (expr, _) in group_by {
        subs.push(compile_expr_program(expr, catalog)?);
    }
    let n_groups = group_by.len();

    let mut factories: Vec<Arc<AccumulatorFactory>> = Vec::new();
    let mut arg_slots: Vec<(usize, usize)> = Vec::new();
    for aggregate in aggregates {
        let resolved = catalog
            .functions()
            .resolve(&aggregate.function, aggregate.args.len())?;
        let ResolvedFunction::Aggregate(factory) = resolved else {
            return Err(QuereusError::Internal(format!(
                "{} resolved to a non-aggregate at emit time",
                aggregate.function
            )));
        };
        factories.push(factory);
        let start = subs.len();
        for arg in &aggregate.args {
            subs.push(compile_expr_program(arg, catalog)?);
        }
        arg_slots.push((start, aggregate.args.len()));
    }

    Ok(builder.emit(
        format!("stream aggregate ({n_groups} keys, {} fns)", factories.len()),
        vec![source],
        subs,
        Arc::new(move |ctx, mut args, subs| {
            let descriptor = Arc::clone(&descriptor);
            let group_collations = Arc::clone(&group_collations);
            let factories = factories.clone();
            let arg_slots = arg_slots.clone();
            Box::pin(async move {
                let mut source = super::take_stream(&mut args)?;
                let stream = try_stream! {
                    let mut current: Option<Vec<SqlValue>> = None;
                    let mut accumulators: Vec<_> =
                        factories.iter().map(|f| f()).collect();

                    while let Some(row) = source.next().await {
                        let row = row?;
                        ctx.check_cancelled()?;
                        let _frame = ctx.push_frame(Arc::clone(&descriptor), row);

                        let mut key = Vec::with_capacity(n_groups);
                        for program in &subs[..n_groups] {
                            key.push(eval_value(program, &ctx).await?);
                        }

                        let boundary = match &current {
                            None => false,
                            Some(prev) => {
                                CanonRow::new(prev.clone(), Arc::clone(&group_collations))
                                    != CanonRow::new(key.clone(), Arc::clone(&group_collations))
                            }
                        };
                        if boundary {
                            let prev = current.take().ok_or_else(|| {
                                QuereusError::Internal("group boundary without a group".into())
                            })?;
                            let mut out = prev;
                            for acc in &mut accumulators {
                                out.push(acc.finish()?);
                            }
                            yield out;
                            accumulators = factories.iter().map(|f| f()).collect();
                        }
                        if current.is_none() {
                            current = Some(key);
                        }

                        for (acc, (start, len)) in
                            accumulators.iter_mut().zip(&arg_slots)
                        {
                            let mut values = Vec::with_capacity(*len);
                            for program in &subs[*start..*start + *len] {
                                values.push(eval_value(program, &ctx).await?);
                            }
                            acc.step(&values)?;
                        }
                    }

                    // A grouped aggregate over empty input yields nothing;
                    // with no GROUP BY the single group always emits.
                    match current {
                        Some(key) => {
                            let mut out = key;
                            for acc in &mut accumulators {
                                out.push(acc.finish()?);
                            }
                            yield out;
                        }
                        None if n_groups == 0 => {
                            let mut out = Vec::new();
                            for acc in &mut accumulators {
                                out.push(acc.finish()?);
                            }
                            yield out;
                        }
                        None => {}
                    }
                };
                Ok(Output::Stream(Box::pin(stream)))
            })
        }),
    ))
}

pub(super) fn emit_window(
    input: &Arc<RelNode>,
    partition_by: &[ScalarExpr],
    functions: &[WindowFuncExpr],
    builder: &mut ProgramBuilder,
    catalog: &Catalog,
) -> Result<InstrId> {
    let source = compile_rel(input, builder, catalog)?;
    let descriptor = descriptor_of(input);
    let partition_collations: Arc<Vec<Collation>> = Arc::new(
        partition_by
            .iter()
            .map(|e| e.result_type().collation)
            .collect(),
    );
    let subs: Vec<Arc<Program>> = partition_by
        .iter()
        .map(|e| compile_expr_program(e, catalog))
        .collect::<Result<Vec<_>>>()?;

    // Only row_number is registered as a window function; the registry
    // guarantees nothing else reaches this emitter.
    let n_functions = functions.len();

    Ok(builder.emit(
        format!("window ({n_functions} fns)"),
        vec![source],
        subs,
        Arc::new(move |ctx, mut args, subs| {
            let descriptor = Arc::clone(&descriptor);
            let partition_collations = Arc::clone(&partition_collations);
            Box::pin(async move {
                let mut source = super::take_stream(&mut args)?;
                let stream = try_stream! {
                    let mut current_partition: Option<Vec<SqlValue>> = None;
                    // Running counter, reset at each partition boundary.
                    let mut row_number: i64 = 0;

                    while let Some(row) = source.next().await {
                        let row = row?;
                        ctx.check_cancelled()?;
                        let partition = {
                            let _frame =
                                ctx.push_frame(Arc::clone(&descriptor), row.clone());
                            let mut key = Vec::with_capacity(subs.len());
                            for program in &subs {
                                key.push(eval_value(program, &ctx).await?);
                            }
                            key
                        };

                        let boundary = match &current_partition {
                            None => true,
                            Some(prev) => {
                                CanonRow::new(prev.clone(), Arc::clone(&partition_collations))
                                    != CanonRow::new(
                                        partition.clone(),
                                        Arc::clone(&partition_collations),
                                    )
                            }
                        };
                        if boundary {
                            current_partition = Some(partition);
                            row_number = 0;
                        }
                        row_number += 1;

                        let mut out = row;
                        for _ in 0..n_functions {
                            out.push(SqlValue::Integer(row_number));
                        }
                        yield out;
                    }
                };
                Ok(Output::Stream(Box::pin(stream)))
            })
        }),
    ))
}
