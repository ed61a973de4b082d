//! Set-operation emitters and the seminaïve recursive-CTE loop.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;

use crate::error::{QuereusError, Result};
use crate::plan::{RelNode, SetOpKind};
use crate::schema::Catalog;
use crate::vtab::Row;

use super::super::instruction::{InstrId, Output, ProgramBuilder};
use super::super::scheduler::Scheduler;
use super::{attr_collations, compile_rel, compile_rel_program, CanonRow};

pub(super) fn emit_set_operation(
    op: SetOpKind,
    left: &Arc<RelNode>,
    right: &Arc<RelNode>,
    builder: &mut ProgramBuilder,
    catalog: &Catalog,
) -> Result<InstrId> {
    let left_instr = compile_rel(left, builder, catalog)?;
    let right_instr = compile_rel(right, builder, catalog)?;
    let collations = attr_collations(left);

    Ok(builder.emit(
        format!("set op {op:?}"),
        vec![left_instr, right_instr],
        vec![],
        Arc::new(move |ctx, mut args, _| {
            let collations = Arc::clone(&collations);
            Box::pin(async move {
                let right = super::take_stream(&mut args)?;
                let left = super::take_stream(&mut args)?;
                let stream = try_stream! {
                    match op {
                        SetOpKind::UnionAll => {
                            let mut left = left;
                            while let Some(row) = left.next().await {
                                ctx.check_cancelled()?;
                                yield row?;
                            }
                            let mut right = right;
                            while let Some(row) = right.next().await {
                                ctx.check_cancelled()?;
                                yield row?;
                            }
                        }
                        SetOpKind::Union => {
                            let mut seen = BTreeSet::new();
                            let mut left = left;
                            while let Some(row) = left.next().await {
                                let row = row?;
                                ctx.check_cancelled()?;
                                if seen.insert(CanonRow::new(row.clone(), Arc::clone(&collations))) {
                                    yield row;
                                }
                            }
                            let mut right = right;
                            while let Some(row) = right.next().await {
                                let row = row?;
                                ctx.check_cancelled()?;
                                if seen.insert(CanonRow::new(row.clone(), Arc::clone(&collations))) {
                                    yield row;
                                }
                            }
                        }
                        SetOpKind::Intersect => {
                            let right_set = collect_set(right, &collations).await?;
                            let mut emitted = BTreeSet::new();
                            let mut left = left;
                            while let Some(row) = left.next().await {
                                let row = row?;
                                ctx.check_cancelled()?;
                                let key = CanonRow::new(row.clone(), Arc::clone(&collations));
                                if right_set.contains(&key) && emitted.insert(key) {
                                    yield row;
                                }
                            }
                        }
                        SetOpKind::Except => {
                            let right_set = collect_set(right, &collations).await?;
                            let mut emitted = BTreeSet::new();
                            let mut left = left;
                            while let Some(row) = left.next().await {
                                let row = row?;
                                ctx.check_cancelled()?;
                                let key = CanonRow::new(row.clone(), Arc::clone(&collations));
                                if !right_set.contains(&key) && emitted.insert(key) {
                                    yield row;
                                }
                            }
                        }
                        SetOpKind::Diff => {
                            // Symmetric difference: rows in exactly one side.
                            let mut left_rows: Vec<Row> = Vec::new();
                            let mut left_set = BTreeSet::new();
                            let mut left = left;
                            while let Some(row) = left.next().await {
                                let row = row?;
                                ctx.check_cancelled()?;
                                if left_set
                                    .insert(CanonRow::new(row.clone(), Arc::clone(&collations)))
                                {
                                    left_rows.push(row);
                                }
                            }
                            let mut right_rows: Vec<Row> = Vec::new();
                            let mut right_set = BTreeSet::new();
                            let mut right = right;
                            while let Some(row) = right.next().await {
                                let row = row?;
                                ctx.check_cancelled()?;
                                if right_set
                                    .insert(CanonRow::new(row.clone(), Arc::clone(&collations)))
                                {
                                    right_rows.push(row);
                                }
                            }
                            for row in left_rows {
                                let key = CanonRow::new(row.clone(), Arc::clone(&collations));
                                if !right_set.contains(&key) {
                                    yield row;
                                }
                            }
                            for row in right_rows {
                                let key = CanonRow::new(row.clone(), Arc::clone(&collations));
                                if !left_set.contains(&key) {
                                    yield row;
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

async fn collect_set(
    mut stream: crate::vtab::RowStream,
    collations: &Arc<Vec<crate::types::Collation>>,
) -> Result<BTreeSet<CanonRow>> {
    let mut set = BTreeSet::new();
    while let Some(row) = stream.next().await {
        set.insert(CanonRow::new(row?, Arc::clone(collations)));
    }
    Ok(set)
}

/// Seminaïve iteration: run the base branch, seeding the working table;
/// then repeatedly bind the working table, run the recursive branch, keep
/// the genuinely new rows as the next working table, until a fixpoint or
/// the configured iteration limit.
pub(super) fn emit_recursive_cte(
    name: &str,
    base: &Arc<RelNode>,
    recursive: &Arc<RelNode>,
    union_all: bool,
    arity: usize,
    builder: &mut ProgramBuilder,
    catalog: &Catalog,
) -> Result<InstrId> {
    let base_instr = compile_rel(base, builder, catalog)?;
    let recursive_program = compile_rel_program(recursive, catalog)?;
    let collations = attr_collations(base);
    let key = name.to_string();
    let limit = catalog.settings().recursive_cte_limit;

    Ok(builder.emit(
        format!("recursive cte {name}"),
        vec![base_instr],
        vec![recursive_program],
        Arc::new(move |ctx, mut args, subs| {
            let collations = Arc::clone(&collations);
            let key = key.clone();
            Box::pin(async move {
                let mut base = super::take_stream(&mut args)?;
                let recursive_program = Arc::clone(&subs[0]);
                let stream = try_stream! {
                    let mut seen: BTreeSet<CanonRow> = BTreeSet::new();
                    let mut working: Vec<Row> = Vec::new();

                    while let Some(row) = base.next().await {
                        let mut row = row?;
                        ctx.check_cancelled()?;
                        row.truncate(arity);
                        let fresh = union_all
                            || seen.insert(CanonRow::new(row.clone(), Arc::clone(&collations)));
                        if fresh {
                            working.push(row.clone());
                            yield row;
                        }
                    }

                    let mut iterations: u64 = 0;
                    while !working.is_empty() {
                        iterations += 1;
                        if limit > 0 && iterations > limit {
                            Err(QuereusError::Runtime(format!(
                                "recursive query {key} exceeded {limit} iterations"
                            )))?;
                        }
                        ctx.install_cte_table(&key, Arc::new(std::mem::take(&mut working)));

                        let mut batch: Vec<Row> = Vec::new();
                        let mut rows = Scheduler::run(&recursive_program, &ctx)
                            .await?
                            .into_stream()?;
                        while let Some(row) = rows.next().await {
                            let mut row = row?;
                            ctx.check_cancelled()?;
                            row.truncate(arity);
                            let fresh = union_all
                                || seen.insert(CanonRow::new(
                                    row.clone(),
                                    Arc::clone(&collations),
                                ));
                            if fresh {
                                batch.push(row.clone());
                                yield row;
                            }
                        }
                        working = batch;
                    }
                };
                Ok(Output::Stream(Box::pin(stream)))
            })
        }),
    ))
}
