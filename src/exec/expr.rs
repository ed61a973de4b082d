//! Scalar emitters: compile a `ScalarExpr` tree into a program. Eagerly
//! evaluated operators take their operands as instruction parameters;
//! short-circuiting operators (AND/OR, CASE) and subqueries take theirs as
//! sub-programs and run them on demand against the current row context.

use std::cmp::Ordering;
use std::sync::Arc;

use futures::StreamExt;

use crate::error::{QuereusError, Result};
use crate::plan::{BinaryOp, ParamRef, ScalarExpr, UnaryOp};
use crate::schema::{Catalog, ResolvedFunction};
use crate::schema::function::like_match;
use crate::types::{Affinity, Collation, SqlValue};

use super::context::RuntimeContext;
use super::emit::compile_rel_program;
use super::instruction::{InstrId, Output, Program, ProgramBuilder};
use super::scheduler::Scheduler;

/// Compile an expression into a standalone sub-program.
pub fn compile_expr_program(expr: &ScalarExpr, catalog: &Catalog) -> Result<Arc<Program>> {
    let mut builder = ProgramBuilder::new();
    let root = compile_expr(expr, &mut builder, catalog)?;
    Ok(builder.finish(root))
}

/// Evaluate a compiled scalar sub-program against the current context.
pub async fn eval_value(program: &Arc<Program>, ctx: &Arc<RuntimeContext>) -> Result<SqlValue> {
    Scheduler::run(program, ctx).await?.into_value()
}

/// Three-valued boolean to SQL value.
fn tvl(value: Option<bool>) -> SqlValue {
    match value {
        None => SqlValue::Null,
        Some(b) => SqlValue::from(b),
    }
}

/// Three-valued view of a value: Null ⇒ unknown.
fn as_tvl(value: &SqlValue) -> Option<bool> {
    if value.is_null() {
        None
    } else {
        Some(value.is_truthy())
    }
}

fn negate_tvl(value: Option<bool>, negated: bool) -> Option<bool> {
    if negated {
        value.map(|b| !b)
    } else {
        value
    }
}

/// The collation a comparison uses: an explicit COLLATE wins, else the
/// left operand's column collation, else the right's.
fn comparison_collation(left: &ScalarExpr, right: &ScalarExpr) -> Collation {
    fn of(expr: &ScalarExpr) -> Option<Collation> {
        match expr {
            ScalarExpr::Collate { collation, .. } => Some(*collation),
            ScalarExpr::ColumnRef { ty, .. } if ty.collation != Collation::Binary => {
                Some(ty.collation)
            }
            _ => None,
        }
    }
    of(left).or_else(|| of(right)).unwrap_or_default()
}

/// Whether a comparison coerces both sides through numeric affinity first.
fn comparison_is_numeric(left: &ScalarExpr, right: &ScalarExpr) -> bool {
    left.result_type().affinity.is_numeric() || right.result_type().affinity.is_numeric()
}

pub fn compare_sql(
    left: &SqlValue,
    right: &SqlValue,
    collation: Collation,
    numeric: bool,
) -> Option<Ordering> {
    if numeric {
        let l = left.clone().apply_affinity(Affinity::Numeric);
        let r = right.clone().apply_affinity(Affinity::Numeric);
        l.compare(&r, collation)
    } else {
        left.compare(right, collation)
    }
}

pub fn compile_expr(
    expr: &ScalarExpr,
    builder: &mut ProgramBuilder,
    catalog: &Catalog,
) -> Result<InstrId> {
    match expr {
        ScalarExpr::Literal(value) => {
            let value = value.clone();
            Ok(builder.emit(
                format!("literal {value}"),
                vec![],
                vec![],
                Arc::new(move |_, _, _| {
                    let value = value.clone();
                    Box::pin(async move { Ok(Output::Value(value)) })
                }),
            ))
        }
        ScalarExpr::ColumnRef { attr, name, .. } => {
            let attr = *attr;
            Ok(builder.emit(
                format!("column {name}{attr}"),
                vec![],
                vec![],
                Arc::new(move |ctx, _, _| {
                    Box::pin(async move { Ok(Output::Value(ctx.resolve_column(attr)?)) })
                }),
            ))
        }
        ScalarExpr::Parameter(param) => {
            let param = param.clone();
            let note = match &param {
                ParamRef::Positional(i) => format!("param ?{i}"),
                ParamRef::Named(n) => format!("param :{n}"),
            };
            Ok(builder.emit(
                note,
                vec![],
                vec![],
                Arc::new(move |ctx, _, _| {
                    let param = param.clone();
                    Box::pin(async move { Ok(Output::Value(ctx.params.lookup(&param)?)) })
                }),
            ))
        }
        ScalarExpr::BinaryOp { op, left, right } => match op {
            BinaryOp::And | BinaryOp::Or => {
                let left_program = compile_expr_program(left, catalog)?;
                let right_program = compile_expr_program(right, catalog)?;
                let is_and = *op == BinaryOp::And;
                Ok(builder.emit(
                    if is_and { "and" } else { "or" },
                    vec![],
                    vec![left_program, right_program],
                    Arc::new(move |ctx, _, subs| {
                        Box::pin(async move {
                            let lhs = as_tvl(&eval_value(&subs[0], &ctx).await?);
                            // Short-circuit: AND with a false side and OR
                            // with a true side never run the other side.
                            if is_and && lhs == Some(false) {
                                return Ok(Output::Value(SqlValue::from(false)));
                            }
                            if !is_and && lhs == Some(true) {
                                return Ok(Output::Value(SqlValue::from(true)));
                            }
                            let rhs = as_tvl(&eval_value(&subs[1], &ctx).await?);
                            let out = if is_and {
                                match (lhs, rhs) {
                                    (Some(false), _) | (_, Some(false)) => Some(false),
                                    (Some(true), Some(true)) => Some(true),
                                    _ => None,
                                }
                            } else {
                                match (lhs, rhs) {
                                    (Some(true), _) | (_, Some(true)) => Some(true),
                                    (Some(false), Some(false)) => Some(false),
                                    _ => None,
                                }
                            };
                            Ok(Output::Value(tvl(out)))
                        })
                    }),
                ))
            }
            _ => {
                let lhs = compile_expr(left, builder, catalog)?;
                let rhs = compile_expr(right, builder, catalog)?;
                let op = *op;
                let collation = comparison_collation(left, right);
                let numeric = comparison_is_numeric(left, right);
                Ok(builder.emit(
                    format!("{op:?}"),
                    vec![lhs, rhs],
                    vec![],
                    Arc::new(move |_, mut args, _| {
                        Box::pin(async move {
                            let right = args.pop().map(Output::into_value).transpose()?;
                            let left = args.pop().map(Output::into_value).transpose()?;
                            let (Some(left), Some(right)) = (left, right) else {
                                return Err(QuereusError::Internal(
                                    "binary operator missing operands".into(),
                                ));
                            };
                            let out = match op {
                                BinaryOp::Add => left.add(&right)?,
                                BinaryOp::Subtract => left.sub(&right)?,
                                BinaryOp::Multiply => left.mul(&right)?,
                                BinaryOp::Divide => left.div(&right)?,
                                BinaryOp::Modulo => left.rem(&right)?,
                                BinaryOp::Concat => left.concat(&right),
                                op => {
                                    let ord = compare_sql(&left, &right, collation, numeric);
                                    let result = ord.map(|ord| match op {
                                        BinaryOp::Eq => ord == Ordering::Equal,
                                        BinaryOp::NotEq => ord != Ordering::Equal,
                                        BinaryOp::Lt => ord == Ordering::Less,
                                        BinaryOp::LtEq => ord != Ordering::Greater,
                                        BinaryOp::Gt => ord == Ordering::Greater,
                                        BinaryOp::GtEq => ord != Ordering::Less,
                                        _ => false,
                                    });
                                    tvl(result)
                                }
                            };
                            Ok(Output::Value(out))
                        })
                    }),
                ))
            }
        },
        ScalarExpr::UnaryOp { op, operand } => {
            let input = compile_expr(operand, builder, catalog)?;
            let op = *op;
            Ok(builder.emit(
                format!("{op:?}"),
                vec![input],
                vec![],
                Arc::new(move |_, mut args, _| {
                    Box::pin(async move {
                        let value = args
                            .pop()
                            .ok_or_else(|| {
                                QuereusError::Internal("unary operator missing operand".into())
                            })?
                            .into_value()?;
                        let out = match op {
                            UnaryOp::Plus => value,
                            UnaryOp::Negate => value.neg()?,
                            UnaryOp::Not => tvl(as_tvl(&value).map(|b| !b)),
                        };
                        Ok(Output::Value(out))
                    })
                }),
            ))
        }
        ScalarExpr::Cast { operand, affinity } => {
            let input = compile_expr(operand, builder, catalog)?;
            let affinity = *affinity;
            Ok(builder.emit(
                format!("cast {affinity:?}"),
                vec![input],
                vec![],
                Arc::new(move |_, mut args, _| {
                    Box::pin(async move {
                        let value = args
                            .pop()
                            .ok_or_else(|| {
                                QuereusError::Internal("cast missing operand".into())
                            })?
                            .into_value()?;
                        Ok(Output::Value(value.cast(affinity)))
                    })
                }),
            ))
        }
        // Collation is a compile-time property of comparisons; the value
        // passes through unchanged.
        ScalarExpr::Collate { operand, .. } => compile_expr(operand, builder, catalog),
        ScalarExpr::Case {
            operand,
            whens,
            else_expr,
        } => {
            let mut subs = Vec::new();
            let has_operand = operand.is_some();
            if let Some(op) = operand {
                subs.push(compile_expr_program(op, catalog)?);
            }
            for (when, then) in whens {
                subs.push(compile_expr_program(when, catalog)?);
                subs.push(compile_expr_program(then, catalog)?);
            }
            let has_else = else_expr.is_some();
            if let Some(els) = else_expr {
                subs.push(compile_expr_program(els, catalog)?);
            }
            let n_whens = whens.len();
            Ok(builder.emit(
                "case",
                vec![],
                subs,
                Arc::new(move |ctx, _, subs| {
                    Box::pin(async move {
                        let mut cursor = 0;
                        let base = match has_operand {
                            true => {
                                cursor = 1;
                                Some(eval_value(&subs[0], &ctx).await?)
                            }
                            false => None,
                        };
                        for i in 0..n_whens {
                            let when = eval_value(&subs[cursor + i * 2], &ctx).await?;
                            let hit = match &base {
                                Some(base) => {
                                    base.sql_eq(&when, Collation::Binary) == Some(true)
                                }
                                None => when.is_truthy(),
                            };
                            if hit {
                                let then =
                                    eval_value(&subs[cursor + i * 2 + 1], &ctx).await?;
                                return Ok(Output::Value(then));
                            }
                        }
                        if has_else {
                            let els =
                                eval_value(&subs[cursor + n_whens * 2], &ctx).await?;
                            return Ok(Output::Value(els));
                        }
                        Ok(Output::Value(SqlValue::Null))
                    })
                }),
            ))
        }
        ScalarExpr::Between {
            operand,
            low,
            high,
            negated,
        } => {
            let value = compile_expr(operand, builder, catalog)?;
            let lo = compile_expr(low, builder, catalog)?;
            let hi = compile_expr(high, builder, catalog)?;
            let negated = *negated;
            let collation = comparison_collation(operand, low);
            let numeric = comparison_is_numeric(operand, low);
            Ok(builder.emit(
                "between",
                vec![value, lo, hi],
                vec![],
                Arc::new(move |_, mut args, _| {
                    Box::pin(async move {
                        let hi = args.pop();
                        let lo = args.pop();
                        let value = args.pop();
                        let (Some(value), Some(lo), Some(hi)) = (value, lo, hi) else {
                            return Err(QuereusError::Internal(
                                "between missing operands".into(),
                            ));
                        };
                        let value = value.into_value()?;
                        let lo = lo.into_value()?;
                        let hi = hi.into_value()?;
                        let ge = compare_sql(&value, &lo, collation, numeric)
                            .map(|o| o != Ordering::Less);
                        let le = compare_sql(&value, &hi, collation, numeric)
                            .map(|o| o != Ordering::Greater);
                        let both = match (ge, le) {
                            (Some(false), _) | (_, Some(false)) => Some(false),
                            (Some(true), Some(true)) => Some(true),
                            _ => None,
                        };
                        Ok(Output::Value(tvl(negate_tvl(both, negated))))
                    })
                }),
            ))
        }
        ScalarExpr::Like {
            operand,
            pattern,
            escape,
            negated,
        } => {
            let value = compile_expr(operand, builder, catalog)?;
            let pat = compile_expr(pattern, builder, catalog)?;
            let escape = *escape;
            let negated = *negated;
            Ok(builder.emit(
                "like",
                vec![value, pat],
                vec![],
                Arc::new(move |_, mut args, _| {
                    Box::pin(async move {
                        let pattern = args.pop().map(Output::into_value).transpose()?;
                        let value = args.pop().map(Output::into_value).transpose()?;
                        let (Some(pattern), Some(value)) = (pattern, value) else {
                            return Err(QuereusError::Internal("like missing operands".into()));
                        };
                        if pattern.is_null() || value.is_null() {
                            return Ok(Output::Value(SqlValue::Null));
                        }
                        let hit =
                            like_match(&pattern.to_string(), &value.to_string(), escape);
                        Ok(Output::Value(tvl(negate_tvl(Some(hit), negated))))
                    })
                }),
            ))
        }
        ScalarExpr::IsNull { operand, negated } => {
            let input = compile_expr(operand, builder, catalog)?;
            let negated = *negated;
            Ok(builder.emit(
                if negated { "is not null" } else { "is null" },
                vec![input],
                vec![],
                Arc::new(move |_, mut args, _| {
                    Box::pin(async move {
                        let value = args
                            .pop()
                            .ok_or_else(|| {
                                QuereusError::Internal("is-null missing operand".into())
                            })?
                            .into_value()?;
                        Ok(Output::Value(SqlValue::from(value.is_null() != negated)))
                    })
                }),
            ))
        }
        ScalarExpr::InList {
            operand,
            items,
            negated,
        } => {
            let mut params = vec![compile_expr(operand, builder, catalog)?];
            for item in items {
                params.push(compile_expr(item, builder, catalog)?);
            }
            let negated = *negated;
            let numeric = items
                .first()
                .map(|first| comparison_is_numeric(operand, first))
                .unwrap_or(false);
            let collation = items
                .first()
                .map(|first| comparison_collation(operand, first))
                .unwrap_or_default();
            Ok(builder.emit(
                "in list",
                params,
                vec![],
                Arc::new(move |_, mut args, _| {
                    Box::pin(async move {
                        let mut values = Vec::with_capacity(args.len());
                        for arg in args.drain(..) {
                            values.push(arg.into_value()?);
                        }
                        let needle = values.remove(0);
                        let verdict = in_membership(&needle, &values, collation, numeric);
                        Ok(Output::Value(tvl(negate_tvl(verdict, negated))))
                    })
                }),
            ))
        }
        ScalarExpr::ScalarSubquery(plan) => {
            let program = compile_rel_program(plan, catalog)?;
            Ok(builder.emit(
                "scalar subquery",
                vec![],
                vec![program],
                Arc::new(move |ctx, _, subs| {
                    Box::pin(async move {
                        let mut stream =
                            Scheduler::run(&subs[0], &ctx).await?.into_stream()?;
                        let first = match stream.next().await {
                            None => return Ok(Output::Value(SqlValue::Null)),
                            Some(row) => row?,
                        };
                        if stream.next().await.is_some() {
                            return Err(QuereusError::Runtime(
                                "scalar subquery returned more than one row".into(),
                            ));
                        }
                        Ok(Output::Value(
                            first.into_iter().next().unwrap_or(SqlValue::Null),
                        ))
                    })
                }),
            ))
        }
        ScalarExpr::InSubquery {
            operand,
            subquery,
            negated,
        } => {
            let needle = compile_expr(operand, builder, catalog)?;
            let program = compile_rel_program(subquery, catalog)?;
            let negated = *negated;
            let numeric = operand.result_type().affinity.is_numeric();
            let collation = comparison_collation(operand, operand);
            Ok(builder.emit(
                "in subquery",
                vec![needle],
                vec![program],
                Arc::new(move |ctx, mut args, subs| {
                    Box::pin(async move {
                        let needle = args
                            .pop()
                            .ok_or_else(|| {
                                QuereusError::Internal("in-subquery missing operand".into())
                            })?
                            .into_value()?;
                        let mut stream =
                            Scheduler::run(&subs[0], &ctx).await?.into_stream()?;
                        let mut values = Vec::new();
                        while let Some(row) = stream.next().await {
                            let mut row = row?;
                            values.push(row.drain(..).next().unwrap_or(SqlValue::Null));
                        }
                        let verdict = in_membership(&needle, &values, collation, numeric);
                        Ok(Output::Value(tvl(negate_tvl(verdict, negated))))
                    })
                }),
            ))
        }
        ScalarExpr::Exists { subquery, negated } => {
            let program = compile_rel_program(subquery, catalog)?;
            let negated = *negated;
            Ok(builder.emit(
                "exists",
                vec![],
                vec![program],
                Arc::new(move |ctx, _, subs| {
                    Box::pin(async move {
                        let mut stream =
                            Scheduler::run(&subs[0], &ctx).await?.into_stream()?;
                        let mut any = false;
                        if let Some(row) = stream.next().await {
                            row?;
                            any = true;
                        }
                        Ok(Output::Value(SqlValue::from(any != negated)))
                    })
                }),
            ))
        }
        ScalarExpr::ScalarFunctionCall { name, args } => {
            let resolved = catalog.functions().resolve(name, args.len())?;
            let ResolvedFunction::Scalar(func) = resolved else {
                return Err(QuereusError::Internal(format!(
                    "{name} resolved to a non-scalar function at emit time"
                )));
            };
            let mut params = Vec::with_capacity(args.len());
            for arg in args {
                params.push(compile_expr(arg, builder, catalog)?);
            }
            let note = format!("call {name}");
            Ok(builder.emit(
                note,
                params,
                vec![],
                Arc::new(move |_, mut args, _| {
                    let func = Arc::clone(&func);
                    Box::pin(async move {
                        let mut values = Vec::with_capacity(args.len());
                        for arg in args.drain(..) {
                            values.push(arg.into_value()?);
                        }
                        Ok(Output::Value(func(&values)?))
                    })
                }),
            ))
        }
        ScalarExpr::AggregateFunctionCall { name, .. } => Err(QuereusError::Internal(format!(
            "aggregate {name} was not extracted before emission"
        ))),
        ScalarExpr::WindowFunctionCall { name, .. } => Err(QuereusError::Internal(format!(
            "window function {name} was not extracted before emission"
        ))),
    }
}

/// SQL IN membership with three-valued logic: a match is true; otherwise a
/// null needle or any null member makes the result unknown.
fn in_membership(
    needle: &SqlValue,
    values: &[SqlValue],
    collation: Collation,
    numeric: bool,
) -> Option<bool> {
    if needle.is_null() {
        return None;
    }
    let mut saw_null = false;
    for value in values {
        match compare_sql(needle, value, collation, numeric) {
            None => saw_null = true,
            Some(Ordering::Equal) => return Some(true),
            Some(_) => {}
        }
    }
    if saw_null {
        None
    } else {
        Some(false)
    }
}
