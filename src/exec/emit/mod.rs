//! Relational emitters: compile each physical plan node into one
//! instruction. A node's streaming input is an instruction parameter
//! (consumed once per program run); sub-plans that re-execute — nested-loop
//! inner sides, recursive branches, cached sources, predicates and
//! projection lists — are compiled into sub-programs.

mod aggregate;
mod dml;
mod join;
mod scan;
mod set_op;

use std::cmp::Ordering;
use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;

use crate::error::{QuereusError, Result};
use crate::plan::{RelNode, RelOp, SortKey};
use crate::schema::Catalog;
use crate::types::{Affinity, Collation, SqlValue};
use crate::vtab::Row;

use super::context::{RowDescriptor, RuntimeContext};
use super::expr::{compile_expr_program, eval_value};
use super::instruction::{InstrId, Output, Program, ProgramBuilder};
use super::scheduler::Scheduler;

/// Compile a relational plan into a standalone program.
pub fn compile_rel_program(node: &Arc<RelNode>, catalog: &Catalog) -> Result<Arc<Program>> {
    let mut builder = ProgramBuilder::new();
    let root = compile_rel(node, &mut builder, catalog)?;
    Ok(builder.finish(root))
}

/// Compile one node into the current program, returning its instruction id.
pub fn compile_rel(
    node: &Arc<RelNode>,
    builder: &mut ProgramBuilder,
    catalog: &Catalog,
) -> Result<InstrId> {
    if node.physical.is_none() {
        return Err(QuereusError::Internal(format!(
            "{} node reached emission without physical properties",
            node.operator_name()
        )));
    }
    match &node.op {
        RelOp::TableScan { .. } => scan::emit_table_scan(node, builder, catalog),
        RelOp::ModuleExec {
            module,
            plan,
            ..
        } => {
            let module = module.clone();
            let plan = Arc::clone(plan);
            Ok(builder.emit(
                format!("module exec ({module})"),
                vec![],
                vec![],
                Arc::new(move |ctx, _, _| {
                    let module = module.clone();
                    let plan = Arc::clone(&plan);
                    Box::pin(async move {
                        let module = ctx.registry.get(&module)?;
                        let rows = module.execute_plan(plan).await?;
                        Ok(Output::Stream(rows))
                    })
                }),
            ))
        }
        RelOp::Values { rows, attributes } => {
            emit_values(rows, attributes.len(), builder, catalog)
        }
        RelOp::CteRef { name, .. } => emit_cte_ref(name, builder),
        RelOp::Filter { input, predicate } => {
            let source = compile_rel(input, builder, catalog)?;
            let descriptor = descriptor_of(input);
            let predicate = compile_expr_program(predicate, catalog)?;
            Ok(builder.emit(
                "filter",
                vec![source],
                vec![predicate],
                Arc::new(move |ctx, mut args, subs| {
                    let descriptor = Arc::clone(&descriptor);
                    Box::pin(async move {
                        let mut source = take_stream(&mut args)?;
                        let predicate = Arc::clone(&subs[0]);
                        let stream = try_stream! {
                            while let Some(row) = source.next().await {
                                let row = row?;
                                ctx.check_cancelled()?;
                                let keep = {
                                    let _frame =
                                        ctx.push_frame(Arc::clone(&descriptor), row.clone());
                                    eval_value(&predicate, &ctx).await?.is_truthy()
                                };
                                if keep {
                                    yield row;
                                }
                            }
                        };
                        Ok(Output::Stream(Box::pin(stream)))
                    })
                }),
            ))
        }
        RelOp::Project { input, exprs } | RelOp::Returning { input, exprs } => {
            let source = compile_rel(input, builder, catalog)?;
            let descriptor = descriptor_of(input);
            let programs = exprs
                .iter()
                .map(|(e, _)| compile_expr_program(e, catalog))
                .collect::<Result<Vec<_>>>()?;
            let note = if matches!(node.op, RelOp::Returning { .. }) {
                "returning"
            } else {
                "project"
            };
            Ok(builder.emit(
                note,
                vec![source],
                programs,
                Arc::new(move |ctx, mut args, subs| {
                    let descriptor = Arc::clone(&descriptor);
                    Box::pin(async move {
                        let mut source = take_stream(&mut args)?;
                        let stream = try_stream! {
                            while let Some(row) = source.next().await {
                                let row = row?;
                                ctx.check_cancelled()?;
                                let mut out = Vec::with_capacity(subs.len());
                                {
                                    let _frame =
                                        ctx.push_frame(Arc::clone(&descriptor), row);
                                    for program in &subs {
                                        out.push(eval_value(program, &ctx).await?);
                                    }
                                }
                                yield out;
                            }
                        };
                        Ok(Output::Stream(Box::pin(stream)))
                    })
                }),
            ))
        }
        RelOp::Sort { input, keys } => {
            let source = compile_rel(input, builder, catalog)?;
            let descriptor = descriptor_of(input);
            let compiled = compile_sort_keys(keys, catalog)?;
            Ok(builder.emit(
                "sort",
                vec![source],
                compiled.iter().map(|k| Arc::clone(&k.program)).collect(),
                Arc::new(move |ctx, mut args, _| {
                    let descriptor = Arc::clone(&descriptor);
                    let compiled = compiled.clone();
                    Box::pin(async move {
                        let source = take_stream(&mut args)?;
                        let stream = try_stream! {
                            let rows =
                                sort_rows(source, &ctx, &descriptor, &compiled).await?;
                            for row in rows {
                                ctx.check_cancelled()?;
                                yield row;
                            }
                        };
                        Ok(Output::Stream(Box::pin(stream)))
                    })
                }),
            ))
        }
        RelOp::Distinct { input } => {
            let source = compile_rel(input, builder, catalog)?;
            let collations = attr_collations(input);
            Ok(builder.emit(
                "distinct",
                vec![source],
                vec![],
                Arc::new(move |ctx, mut args, _| {
                    let collations = Arc::clone(&collations);
                    Box::pin(async move {
                        let mut source = take_stream(&mut args)?;
                        let stream = try_stream! {
                            let mut seen = std::collections::BTreeSet::new();
                            while let Some(row) = source.next().await {
                                let row = row?;
                                ctx.check_cancelled()?;
                                let key = CanonRow::new(row.clone(), Arc::clone(&collations));
                                if seen.insert(key) {
                                    yield row;
                                }
                            }
                        };
                        Ok(Output::Stream(Box::pin(stream)))
                    })
                }),
            ))
        }
        RelOp::LimitOffset {
            input,
            limit,
            offset,
        } => {
            let source = compile_rel(input, builder, catalog)?;
            let limit = limit
                .as_ref()
                .map(|e| compile_expr_program(e, catalog))
                .transpose()?;
            let offset = offset
                .as_ref()
                .map(|e| compile_expr_program(e, catalog))
                .transpose()?;
            let mut subs = Vec::new();
            let has_limit = limit.is_some();
            if let Some(p) = limit {
                subs.push(p);
            }
            if let Some(p) = offset {
                subs.push(p);
            }
            Ok(builder.emit(
                "limit/offset",
                vec![source],
                subs,
                Arc::new(move |ctx, mut args, subs| {
                    Box::pin(async move {
                        let mut source = take_stream(&mut args)?;
                        let mut cursor = 0;
                        let limit = if has_limit {
                            cursor = 1;
                            let v = eval_value(&subs[0], &ctx).await?.cast(Affinity::Integer);
                            match v {
                                SqlValue::Integer(i) if i >= 0 => Some(i as u64),
                                _ => None,
                            }
                        } else {
                            None
                        };
                        let offset = match subs.get(cursor) {
                            Some(program) => {
                                let v =
                                    eval_value(program, &ctx).await?.cast(Affinity::Integer);
                                match v {
                                    SqlValue::Integer(i) if i > 0 => i as u64,
                                    _ => 0,
                                }
                            }
                            None => 0,
                        };
                        let stream = try_stream! {
                            let mut skipped = 0u64;
                            let mut taken = 0u64;
                            while let Some(row) = source.next().await {
                                let row = row?;
                                ctx.check_cancelled()?;
                                if skipped < offset {
                                    skipped += 1;
                                    continue;
                                }
                                if let Some(limit) = limit {
                                    if taken >= limit {
                                        break;
                                    }
                                }
                                taken += 1;
                                yield row;
                            }
                        };
                        Ok(Output::Stream(Box::pin(stream)))
                    })
                }),
            ))
        }
        RelOp::Cache { input, threshold } => emit_cache(input, *threshold, builder, catalog),
        RelOp::Sink { input } => {
            let source = compile_rel(input, builder, catalog)?;
            Ok(builder.emit(
                "sink",
                vec![source],
                vec![],
                Arc::new(move |ctx, mut args, _| {
                    Box::pin(async move {
                        let mut source = take_stream(&mut args)?;
                        let mut count = 0i64;
                        while let Some(row) = source.next().await {
                            row?;
                            ctx.check_cancelled()?;
                            count += 1;
                        }
                        Ok(Output::Value(SqlValue::Integer(count)))
                    })
                }),
            ))
        }
        RelOp::StreamAggregate {
            input,
            group_by,
            aggregates,
        } => aggregate::emit_stream_aggregate(input, group_by, aggregates, builder, catalog),
        RelOp::Window {
            input,
            partition_by,
            functions,
            ..
        } => aggregate::emit_window(input, partition_by, functions, builder, catalog),
        RelOp::Join {
            left,
            right,
            kind,
            condition,
        } => join::emit_loop_join(left, right, *kind, condition.as_ref(), builder, catalog),
        RelOp::BloomJoin {
            left,
            right,
            kind,
            equi,
            residual,
        } => join::emit_bloom_join(left, right, *kind, equi, residual.as_ref(), builder, catalog),
        RelOp::SetOperation {
            op, left, right, ..
        } => set_op::emit_set_operation(*op, left, right, builder, catalog),
        RelOp::RecursiveCte {
            name,
            base,
            recursive,
            union_all,
            attributes,
        } => set_op::emit_recursive_cte(
            name,
            base,
            recursive,
            *union_all,
            attributes.len(),
            builder,
            catalog,
        ),
        RelOp::DmlExecutor {
            table,
            op,
            source,
            old_attrs,
            new_attrs,
            on_conflict,
            checks,
        } => dml::emit_dml(
            table, *op, source, old_attrs, new_attrs, *on_conflict, checks, builder, catalog,
        ),
        RelOp::TableReference { .. } | RelOp::Retrieve { .. } | RelOp::Aggregate { .. } => {
            Err(QuereusError::Internal(format!(
                "logical {} node reached emission",
                node.operator_name()
            )))
        }
    }
}

fn emit_values(
    rows: &[Vec<crate::plan::ScalarExpr>],
    arity: usize,
    builder: &mut ProgramBuilder,
    catalog: &Catalog,
) -> Result<InstrId> {
    let mut programs = Vec::new();
    for row in rows {
        for expr in row {
            programs.push(compile_expr_program(expr, catalog)?);
        }
    }
    let n_rows = rows.len();
    Ok(builder.emit(
        format!("values ({n_rows} rows)"),
        vec![],
        programs,
        Arc::new(move |ctx, _, subs| {
            Box::pin(async move {
                let stream = try_stream! {
                    for row_index in 0..n_rows {
                        ctx.check_cancelled()?;
                        let mut row = Vec::with_capacity(arity);
                        for col in 0..arity {
                            let program = &subs[row_index * arity + col];
                            row.push(eval_value(program, &ctx).await?);
                        }
                        yield row;
                    }
                };
                Ok(Output::Stream(Box::pin(stream)))
            })
        }),
    ))
}

fn emit_cte_ref(name: &str, builder: &mut ProgramBuilder) -> Result<InstrId> {
    let key = name.to_string();
    Ok(builder.emit(
        format!("cte ref {name}"),
        vec![],
        vec![],
        Arc::new(move |ctx, _, _| {
            let key = key.clone();
            Box::pin(async move {
                let rows = ctx.cte_table(&key)?;
                let stream = try_stream! {
                    for row in rows.iter() {
                        ctx.check_cancelled()?;
                        yield row.clone();
                    }
                };
                Ok(Output::Stream(Box::pin(stream)))
            })
        }),
    ))
}

/// Streaming-first cache: rows pass through while being copied into a
/// buffer; past the threshold the buffer is abandoned and later passes
/// re-execute the source. The first pass is never delayed.
fn emit_cache(
    input: &Arc<RelNode>,
    threshold: usize,
    builder: &mut ProgramBuilder,
    catalog: &Catalog,
) -> Result<InstrId> {
    let source_program = compile_rel_program(input, catalog)?;
    let state: Arc<parking_lot::Mutex<CacheState>> =
        Arc::new(parking_lot::Mutex::new(CacheState::Cold));
    Ok(builder.emit(
        format!("cache (threshold {threshold})"),
        vec![],
        vec![source_program],
        Arc::new(move |ctx, _, subs| {
            let state = Arc::clone(&state);
            Box::pin(async move {
                let cached = match &*state.lock() {
                    CacheState::Filled(rows) => Some(Arc::clone(rows)),
                    _ => None,
                };
                if let Some(rows) = cached {
                    let stream = try_stream! {
                        for row in rows.iter() {
                            ctx.check_cancelled()?;
                            yield row.clone();
                        }
                    };
                    return Ok(Output::Stream(Box::pin(stream)));
                }
                let mut source = Scheduler::run(&subs[0], &ctx).await?.into_stream()?;
                let stream = try_stream! {
                    let mut buffer: Option<Vec<Row>> = Some(Vec::new());
                    while let Some(row) = source.next().await {
                        let row = row?;
                        ctx.check_cancelled()?;
                        if let Some(buf) = &mut buffer {
                            if buf.len() >= threshold {
                                // Spill: stop copying, stay pass-through.
                                buffer = None;
                                *state.lock() = CacheState::Overflowed;
                            } else {
                                buf.push(row.clone());
                            }
                        }
                        yield row;
                    }
                    if let Some(buf) = buffer {
                        *state.lock() = CacheState::Filled(Arc::new(buf));
                    }
                };
                Ok(Output::Stream(Box::pin(stream)))
            })
        }),
    ))
}

enum CacheState {
    Cold,
    Filled(Arc<Vec<Row>>),
    Overflowed,
}

// Shared helpers

pub(crate) fn take_stream(args: &mut Vec<Output>) -> Result<crate::vtab::RowStream> {
    args.pop()
        .ok_or_else(|| QuereusError::Internal("instruction missing stream parameter".into()))?
        .into_stream()
}

pub(crate) fn descriptor_of(node: &Arc<RelNode>) -> Arc<RowDescriptor> {
    Arc::new(RowDescriptor::from_attrs(&node.attributes()))
}

pub(crate) fn attr_collations(node: &Arc<RelNode>) -> Arc<Vec<Collation>> {
    Arc::new(
        node.attributes()
            .iter()
            .map(|a| a.ty.collation)
            .collect(),
    )
}

/// A row wrapped with per-column collations under the canonical total
/// order, usable as a tree key for dedup and set operations.
#[derive(Clone)]
pub(crate) struct CanonRow {
    values: Vec<SqlValue>,
    collations: Arc<Vec<Collation>>,
}

impl CanonRow {
    pub fn new(values: Vec<SqlValue>, collations: Arc<Vec<Collation>>) -> Self {
        Self { values, collations }
    }
}

impl PartialEq for CanonRow {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CanonRow {}

impl PartialOrd for CanonRow {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CanonRow {
    fn cmp(&self, other: &Self) -> Ordering {
        for (i, (a, b)) in self.values.iter().zip(&other.values).enumerate() {
            let collation = self
                .collations
                .get(i)
                .copied()
                .unwrap_or(Collation::Binary);
            let ord = a.canonical_cmp(b, collation);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.values.len().cmp(&other.values.len())
    }
}

#[derive(Clone)]
pub(crate) struct CompiledSortKey {
    pub program: Arc<Program>,
    pub desc: bool,
    pub nulls_first: Option<bool>,
    pub collation: Collation,
}

pub(crate) fn compile_sort_keys(
    keys: &[SortKey],
    catalog: &Catalog,
) -> Result<Vec<CompiledSortKey>> {
    keys.iter()
        .map(|key| {
            Ok(CompiledSortKey {
                program: compile_expr_program(&key.expr, catalog)?,
                desc: key.desc,
                nulls_first: key.nulls_first,
                collation: key.collation(),
            })
        })
        .collect()
}

/// Materialize and stably sort a stream by the compiled keys. Nulls sort
/// first ascending and last descending unless NULLS FIRST/LAST overrides.
pub(crate) async fn sort_rows(
    mut source: crate::vtab::RowStream,
    ctx: &Arc<RuntimeContext>,
    descriptor: &Arc<RowDescriptor>,
    keys: &[CompiledSortKey],
) -> Result<Vec<Row>> {
    let mut keyed: Vec<(Vec<SqlValue>, Row)> = Vec::new();
    while let Some(row) = source.next().await {
        let row = row?;
        ctx.check_cancelled()?;
        let mut key_values = Vec::with_capacity(keys.len());
        {
            let _frame = ctx.push_frame(Arc::clone(descriptor), row.clone());
            for key in keys {
                key_values.push(eval_value(&key.program, ctx).await?);
            }
        }
        keyed.push((key_values, row));
    }

    keyed.sort_by(|(a, _), (b, _)| {
        for (i, key) in keys.iter().enumerate() {
            let (va, vb) = (&a[i], &b[i]);
            if let Some(nulls_first) = key.nulls_first {
                match (va.is_null(), vb.is_null()) {
                    (true, false) => {
                        return if nulls_first {
                            Ordering::Less
                        } else {
                            Ordering::Greater
                        }
                    }
                    (false, true) => {
                        return if nulls_first {
                            Ordering::Greater
                        } else {
                            Ordering::Less
                        }
                    }
                    _ => {}
                }
            }
            let mut ord = va.canonical_cmp(vb, key.collation);
            if key.desc {
                ord = ord.reverse();
            }
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });

    Ok(keyed.into_iter().map(|(_, row)| row).collect())
}
