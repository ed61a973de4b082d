//! Join emitters. The nested loop re-executes its inner side per outer row
//! through a sub-program factory; the hash (bloom) join builds a keyed map
//! of its right side and probes it with the left stream. Both track
//! build-side matches so RIGHT and FULL joins emit null-padded unmatched
//! rows at end of stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;

use crate::error::Result;
use crate::plan::{JoinKind, RelNode, ScalarExpr};
use crate::schema::Catalog;
use crate::types::{Affinity, Collation, SqlValue};
use crate::vtab::Row;

use super::super::expr::{compile_expr_program, eval_value};
use super::super::instruction::{InstrId, Output, Program, ProgramBuilder};
use super::super::scheduler::Scheduler;
use super::{compile_rel, compile_rel_program, descriptor_of, CanonRow};

pub(super) fn emit_loop_join(
    left: &Arc<RelNode>,
    right: &Arc<RelNode>,
    kind: JoinKind,
    condition: Option<&ScalarExpr>,
    builder: &mut ProgramBuilder,
    catalog: &Catalog,
) -> Result<InstrId> {
    let outer = compile_rel(left, builder, catalog)?;
    let left_descriptor = descriptor_of(left);
    let right_descriptor = descriptor_of(right);
    let left_arity = left.attributes().len();
    let right_arity = right.attributes().len();

    let mut subs = vec![compile_rel_program(right, catalog)?];
    let has_condition = condition.is_some();
    if let Some(condition) = condition {
        subs.push(compile_expr_program(condition, catalog)?);
    }

    Ok(builder.emit(
        format!("loop join ({kind:?})"),
        vec![outer],
        subs,
        Arc::new(move |ctx, mut args, subs| {
            let left_descriptor = Arc::clone(&left_descriptor);
            let right_descriptor = Arc::clone(&right_descriptor);
            Box::pin(async move {
                let mut outer = super::take_stream(&mut args)?;
                let inner_program = Arc::clone(&subs[0]);
                let condition = has_condition.then(|| Arc::clone(&subs[1]));

                let stream = try_stream! {
                    // RIGHT/FULL need build-side match tracking, so the
                    // inner side is materialized once up front.
                    let materialized = if kind.pads_left() {
                        let mut rows = Vec::new();
                        let mut inner =
                            Scheduler::run(&inner_program, &ctx).await?.into_stream()?;
                        while let Some(row) = inner.next().await {
                            rows.push(row?);
                        }
                        Some(rows)
                    } else {
                        None
                    };
                    let mut inner_matched =
                        vec![false; materialized.as_ref().map_or(0, Vec::len)];

                    while let Some(outer_row) = outer.next().await {
                        let outer_row = outer_row?;
                        ctx.check_cancelled()?;
                        let outer_frame =
                            ctx.push_frame(Arc::clone(&left_descriptor), outer_row.clone());
                        let mut outer_matched = false;

                        let inner_rows: Vec<Row> = match &materialized {
                            Some(rows) => rows.clone(),
                            None => {
                                // Fresh inner execution per outer row: the
                                // call-factory pattern.
                                let mut inner = Scheduler::run(&inner_program, &ctx)
                                    .await?
                                    .into_stream()?;
                                let mut rows = Vec::new();
                                while let Some(row) = inner.next().await {
                                    rows.push(row?);
                                }
                                rows
                            }
                        };

                        for (index, inner_row) in inner_rows.iter().enumerate() {
                            ctx.check_cancelled()?;
                            let passes = match &condition {
                                None => true,
                                Some(program) => {
                                    let _inner_frame = ctx.push_frame(
                                        Arc::clone(&right_descriptor),
                                        inner_row.clone(),
                                    );
                                    eval_value(program, &ctx).await?.is_truthy()
                                }
                            };
                            if passes {
                                outer_matched = true;
                                if index < inner_matched.len() {
                                    inner_matched[index] = true;
                                }
                                let mut combined = outer_row.clone();
                                combined.extend(inner_row.iter().cloned());
                                yield combined;
                            }
                        }

                        if !outer_matched && kind.pads_right() {
                            let mut combined = outer_row.clone();
                            combined.extend(std::iter::repeat(SqlValue::Null).take(right_arity));
                            yield combined;
                        }
                        drop(outer_frame);
                    }

                    if let Some(rows) = materialized {
                        for (row, matched) in rows.into_iter().zip(inner_matched) {
                            if !matched {
                                let mut combined: Row = std::iter::repeat(SqlValue::Null)
                                    .take(left_arity)
                                    .collect();
                                combined.extend(row);
                                yield combined;
                            }
                        }
                    }
                };
                Ok(Output::Stream(Box::pin(stream)))
            })
        }),
    ))
}

#[allow(clippy::too_many_arguments)]
pub(super) fn emit_bloom_join(
    left: &Arc<RelNode>,
    right: &Arc<RelNode>,
    kind: JoinKind,
    equi: &[(ScalarExpr, ScalarExpr)],
    residual: Option<&ScalarExpr>,
    builder: &mut ProgramBuilder,
    catalog: &Catalog,
) -> Result<InstrId> {
    let probe = compile_rel(left, builder, catalog)?;
    let left_descriptor = descriptor_of(left);
    let right_descriptor = descriptor_of(right);
    let left_arity = left.attributes().len();
    let right_arity = right.attributes().len();

    // Per-pair comparison semantics fixed at compile time.
    let pair_collations: Arc<Vec<Collation>> = Arc::new(
        equi.iter()
            .map(|(p, b)| {
                let pt = p.result_type();
                if pt.collation != Collation::Binary {
                    pt.collation
                } else {
                    b.result_type().collation
                }
            })
            .collect(),
    );
    let pair_numeric: Vec<bool> = equi
        .iter()
        .map(|(p, b)| {
            p.result_type().affinity.is_numeric() || b.result_type().affinity.is_numeric()
        })
        .collect();

    let mut subs = vec![compile_rel_program(right, catalog)?];
    for (probe_key, _) in equi {
        subs.push(compile_expr_program(probe_key, catalog)?);
    }
    for (_, build_key) in equi {
        subs.push(compile_expr_program(build_key, catalog)?);
    }
    let has_residual = residual.is_some();
    if let Some(residual) = residual {
        subs.push(compile_expr_program(residual, catalog)?);
    }
    let n_keys = equi.len();

    Ok(builder.emit(
        format!("hash join ({kind:?}, {n_keys} keys)"),
        vec![probe],
        subs,
        Arc::new(move |ctx, mut args, subs| {
            let left_descriptor = Arc::clone(&left_descriptor);
            let right_descriptor = Arc::clone(&right_descriptor);
            let pair_collations = Arc::clone(&pair_collations);
            let pair_numeric = pair_numeric.clone();
            Box::pin(async move {
                let mut probe_stream = super::take_stream(&mut args)?;
                let build_program = Arc::clone(&subs[0]);
                let probe_keys: Vec<Arc<Program>> =
                    subs[1..1 + n_keys].iter().map(Arc::clone).collect();
                let build_keys: Vec<Arc<Program>> = subs[1 + n_keys..1 + 2 * n_keys]
                    .iter()
                    .map(Arc::clone)
                    .collect();
                let residual = has_residual.then(|| Arc::clone(&subs[1 + 2 * n_keys]));

                let stream = try_stream! {
                    // Build side: key every right row; null keys can never
                    // match but stay emittable for RIGHT/FULL padding.
                    let mut build_rows: Vec<Row> = Vec::new();
                    let mut matched: Vec<bool> = Vec::new();
                    let mut table: BTreeMap<CanonRow, Vec<usize>> = BTreeMap::new();
                    {
                        let mut build =
                            Scheduler::run(&build_program, &ctx).await?.into_stream()?;
                        while let Some(row) = build.next().await {
                            let row = row?;
                            ctx.check_cancelled()?;
                            let key = {
                                let _frame = ctx
                                    .push_frame(Arc::clone(&right_descriptor), row.clone());
                                let mut key = Vec::with_capacity(n_keys);
                                for (i, program) in build_keys.iter().enumerate() {
                                    let mut v = eval_value(program, &ctx).await?;
                                    if pair_numeric[i] {
                                        v = v.apply_affinity(Affinity::Numeric);
                                    }
                                    key.push(v);
                                }
                                key
                            };
                            let index = build_rows.len();
                            build_rows.push(row);
                            matched.push(false);
                            if !key.iter().any(SqlValue::is_null) {
                                table
                                    .entry(CanonRow::new(key, Arc::clone(&pair_collations)))
                                    .or_default()
                                    .push(index);
                            }
                        }
                    }

                    while let Some(probe_row) = probe_stream.next().await {
                        let probe_row = probe_row?;
                        ctx.check_cancelled()?;
                        let probe_frame =
                            ctx.push_frame(Arc::clone(&left_descriptor), probe_row.clone());

                        let mut key = Vec::with_capacity(n_keys);
                        for (i, program) in probe_keys.iter().enumerate() {
                            let mut v = eval_value(program, &ctx).await?;
                            if pair_numeric[i] {
                                v = v.apply_affinity(Affinity::Numeric);
                            }
                            key.push(v);
                        }

                        let mut row_matched = false;
                        if !key.iter().any(SqlValue::is_null) {
                            let lookup = CanonRow::new(key, Arc::clone(&pair_collations));
                            if let Some(candidates) = table.get(&lookup) {
                                for &index in candidates {
                                    let build_row = &build_rows[index];
                                    let passes = match &residual {
                                        None => true,
                                        Some(program) => {
                                            let _frame = ctx.push_frame(
                                                Arc::clone(&right_descriptor),
                                                build_row.clone(),
                                            );
                                            eval_value(program, &ctx).await?.is_truthy()
                                        }
                                    };
                                    if passes {
                                        row_matched = true;
                                        matched[index] = true;
                                        let mut combined = probe_row.clone();
                                        combined.extend(build_row.iter().cloned());
                                        yield combined;
                                    }
                                }
                            }
                        }

                        if !row_matched && kind.pads_right() {
                            let mut combined = probe_row.clone();
                            combined
                                .extend(std::iter::repeat(SqlValue::Null).take(right_arity));
                            yield combined;
                        }
                        drop(probe_frame);
                    }

                    if kind.pads_left() {
                        for (row, was_matched) in build_rows.into_iter().zip(matched) {
                            if !was_matched {
                                let mut combined: Row = std::iter::repeat(SqlValue::Null)
                                    .take(left_arity)
                                    .collect();
                                combined.extend(row);
                                yield combined;
                            }
                        }
                    }
                };
                Ok(Output::Stream(Box::pin(stream)))
            })
        }),
    ))
}

