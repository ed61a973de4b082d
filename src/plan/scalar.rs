//! Scalar expression nodes. Expressions are immutable values; column
//! references carry the attribute id minted by the producing relational node
//! and nothing else ties an expression to a position in a row.

use std::sync::Arc;

use crate::types::{Affinity, AttrId, Collation, ScalarType};
use crate::types::SqlValue;

use super::node::RelNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Concat,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Plus,
    Not,
}

/// How a parameter was written in the SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamRef {
    /// `?` / `?N` — 1-based position.
    Positional(usize),
    /// `:name`.
    Named(String),
}

#[derive(Debug, Clone)]
pub enum ScalarExpr {
    Literal(SqlValue),
    ColumnRef {
        attr: AttrId,
        name: String,
        ty: ScalarType,
    },
    Parameter(ParamRef),
    BinaryOp {
        op: BinaryOp,
        left: Box<ScalarExpr>,
        right: Box<ScalarExpr>,
    },
    UnaryOp {
        op: UnaryOp,
        operand: Box<ScalarExpr>,
    },
    Cast {
        operand: Box<ScalarExpr>,
        affinity: Affinity,
    },
    Case {
        operand: Option<Box<ScalarExpr>>,
        whens: Vec<(ScalarExpr, ScalarExpr)>,
        else_expr: Option<Box<ScalarExpr>>,
    },
    Between {
        operand: Box<ScalarExpr>,
        low: Box<ScalarExpr>,
        high: Box<ScalarExpr>,
        negated: bool,
    },
    ScalarFunctionCall {
        name: String,
        args: Vec<ScalarExpr>,
    },
    /// Present only while the builder is collecting aggregates; the
    /// aggregate-extraction pass replaces each with a `ColumnRef` to the
    /// aggregate node's output attribute.
    AggregateFunctionCall {
        name: String,
        args: Vec<ScalarExpr>,
    },
    /// Present only while the builder is collecting window calls; the
    /// window-extraction pass replaces each with a `ColumnRef` to the window
    /// node's output attribute.
    WindowFunctionCall {
        name: String,
        partition_by: Vec<ScalarExpr>,
        order_by: Vec<(ScalarExpr, bool)>,
    },
    ScalarSubquery(Arc<RelNode>),
    InList {
        operand: Box<ScalarExpr>,
        items: Vec<ScalarExpr>,
        negated: bool,
    },
    InSubquery {
        operand: Box<ScalarExpr>,
        subquery: Arc<RelNode>,
        negated: bool,
    },
    Exists {
        subquery: Arc<RelNode>,
        negated: bool,
    },
    Collate {
        operand: Box<ScalarExpr>,
        collation: Collation,
    },
    Like {
        operand: Box<ScalarExpr>,
        pattern: Box<ScalarExpr>,
        escape: Option<char>,
        negated: bool,
    },
    IsNull {
        operand: Box<ScalarExpr>,
        negated: bool,
    },
}

impl ScalarExpr {
    pub fn column(attr: AttrId, name: impl Into<String>, ty: ScalarType) -> Self {
        ScalarExpr::ColumnRef {
            attr,
            name: name.into(),
            ty,
        }
    }

    pub fn literal(value: impl Into<SqlValue>) -> Self {
        ScalarExpr::Literal(value.into())
    }

    /// Static result type, used for output column metadata and parameter
    /// shape inference. Conservative: unknown shapes resolve to Numeric.
    pub fn result_type(&self) -> ScalarType {
        match self {
            ScalarExpr::Literal(v) => match v {
                SqlValue::Null => ScalarType::null(),
                SqlValue::Integer(_) => ScalarType::integer(),
                SqlValue::Real(_) => ScalarType::real(),
                SqlValue::Text(_) => ScalarType::text(),
                SqlValue::Blob(_) => ScalarType::blob(),
            },
            ScalarExpr::ColumnRef { ty, .. } => ty.clone(),
            ScalarExpr::Parameter(_) => ScalarType::null(),
            ScalarExpr::BinaryOp { op, left, .. } => match op {
                BinaryOp::Concat => ScalarType::text(),
                op if op.is_comparison() => ScalarType::integer(),
                BinaryOp::And | BinaryOp::Or => ScalarType::integer(),
                _ => {
                    let lt = left.result_type();
                    if lt.affinity == Affinity::Real {
                        ScalarType::real()
                    } else {
                        ScalarType::numeric()
                    }
                }
            },
            ScalarExpr::UnaryOp { op, operand } => match op {
                UnaryOp::Not => ScalarType::integer(),
                _ => operand.result_type(),
            },
            ScalarExpr::Cast { affinity, .. } => ScalarType::new(*affinity),
            ScalarExpr::Case {
                whens, else_expr, ..
            } => whens
                .first()
                .map(|(_, r)| r.result_type())
                .or_else(|| else_expr.as_ref().map(|e| e.result_type()))
                .unwrap_or_else(ScalarType::null),
            ScalarExpr::Between { .. }
            | ScalarExpr::InList { .. }
            | ScalarExpr::InSubquery { .. }
            | ScalarExpr::Exists { .. }
            | ScalarExpr::Like { .. }
            | ScalarExpr::IsNull { .. } => ScalarType::integer(),
            ScalarExpr::ScalarFunctionCall { name, .. }
            | ScalarExpr::AggregateFunctionCall { name, .. }
            | ScalarExpr::WindowFunctionCall { name, .. } => {
                match name.to_ascii_lowercase().as_str() {
                    "count" | "row_number" | "length" | "typeof" => ScalarType::integer(),
                    "avg" | "total" => ScalarType::real(),
                    "lower" | "upper" | "substr" | "group_concat" => ScalarType::text(),
                    _ => ScalarType::numeric(),
                }
            }
            ScalarExpr::ScalarSubquery(plan) => plan
                .attributes()
                .first()
                .map(|a| a.ty.clone())
                .unwrap_or_else(ScalarType::null),
            ScalarExpr::Collate { operand, collation } => {
                operand.result_type().with_collation(*collation)
            }
        }
    }

    /// Display name for an unaliased projection of this expression.
    pub fn output_name(&self) -> String {
        match self {
            ScalarExpr::ColumnRef { name, .. } => name.clone(),
            ScalarExpr::ScalarFunctionCall { name, .. }
            | ScalarExpr::AggregateFunctionCall { name, .. }
            | ScalarExpr::WindowFunctionCall { name, .. } => name.clone(),
            ScalarExpr::Literal(v) => v.to_string(),
            ScalarExpr::Cast { operand, .. } | ScalarExpr::Collate { operand, .. } => {
                operand.output_name()
            }
            _ => "expr".to_string(),
        }
    }

    /// Child expressions, for generic walks.
    pub fn children(&self) -> Vec<&ScalarExpr> {
        match self {
            ScalarExpr::Literal(_)
            | ScalarExpr::ColumnRef { .. }
            | ScalarExpr::Parameter(_)
            | ScalarExpr::ScalarSubquery(_)
            | ScalarExpr::Exists { .. } => Vec::new(),
            ScalarExpr::BinaryOp { left, right, .. } => vec![left, right],
            ScalarExpr::UnaryOp { operand, .. }
            | ScalarExpr::Cast { operand, .. }
            | ScalarExpr::Collate { operand, .. }
            | ScalarExpr::IsNull { operand, .. } => vec![operand],
            ScalarExpr::Case {
                operand,
                whens,
                else_expr,
            } => {
                let mut out: Vec<&ScalarExpr> = Vec::new();
                if let Some(op) = operand {
                    out.push(op);
                }
                for (w, t) in whens {
                    out.push(w);
                    out.push(t);
                }
                if let Some(e) = else_expr {
                    out.push(e);
                }
                out
            }
            ScalarExpr::Between {
                operand, low, high, ..
            } => vec![operand, low, high],
            ScalarExpr::ScalarFunctionCall { args, .. }
            | ScalarExpr::AggregateFunctionCall { args, .. } => args.iter().collect(),
            ScalarExpr::WindowFunctionCall {
                partition_by,
                order_by,
                ..
            } => partition_by
                .iter()
                .chain(order_by.iter().map(|(e, _)| e))
                .collect(),
            ScalarExpr::InList { operand, items, .. } => {
                let mut out = vec![operand.as_ref()];
                out.extend(items.iter());
                out
            }
            ScalarExpr::InSubquery { operand, .. } => vec![operand],
            ScalarExpr::Like {
                operand, pattern, ..
            } => vec![operand, pattern],
        }
    }

    /// Attribute ids this expression reads (not descending into subqueries,
    /// whose correlated references resolve through the row-context stack at
    /// runtime).
    pub fn referenced_attrs(&self) -> Vec<AttrId> {
        let mut out = Vec::new();
        self.collect_attrs(&mut out);
        out
    }

    fn collect_attrs(&self, out: &mut Vec<AttrId>) {
        if let ScalarExpr::ColumnRef { attr, .. } = self {
            if !out.contains(attr) {
                out.push(*attr);
            }
        }
        for child in self.children() {
            child.collect_attrs(out);
        }
    }

    /// True when evaluation depends on no row context: literals, parameters,
    /// and functions of those.
    pub fn is_row_independent(&self) -> bool {
        match self {
            ScalarExpr::ColumnRef { .. } => false,
            ScalarExpr::ScalarSubquery(_)
            | ScalarExpr::InSubquery { .. }
            | ScalarExpr::Exists { .. } => false,
            ScalarExpr::AggregateFunctionCall { .. } => false,
            _ => self.children().iter().all(|c| c.is_row_independent()),
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        if matches!(self, ScalarExpr::AggregateFunctionCall { .. }) {
            return true;
        }
        self.children().iter().any(|c| c.contains_aggregate())
    }

    pub fn contains_window(&self) -> bool {
        if matches!(self, ScalarExpr::WindowFunctionCall { .. }) {
            return true;
        }
        self.children().iter().any(|c| c.contains_window())
    }

    /// Structural equality, used to match projection expressions against
    /// GROUP BY keys. Subquery-bearing expressions never match.
    pub fn structurally_equal(&self, other: &ScalarExpr) -> bool {
        use ScalarExpr::*;
        match (self, other) {
            (Literal(a), Literal(b)) => {
                (a.is_null() && b.is_null()) || a.sql_eq(b, Collation::Binary) == Some(true)
            }
            (ColumnRef { attr: a, .. }, ColumnRef { attr: b, .. }) => a == b,
            (Parameter(a), Parameter(b)) => a == b,
            (
                BinaryOp {
                    op: oa,
                    left: la,
                    right: ra,
                },
                BinaryOp {
                    op: ob,
                    left: lb,
                    right: rb,
                },
            ) => oa == ob && la.structurally_equal(lb) && ra.structurally_equal(rb),
            (
                UnaryOp {
                    op: oa,
                    operand: ea,
                },
                UnaryOp {
                    op: ob,
                    operand: eb,
                },
            ) => oa == ob && ea.structurally_equal(eb),
            (
                Cast {
                    operand: ea,
                    affinity: aa,
                },
                Cast {
                    operand: eb,
                    affinity: ab,
                },
            ) => aa == ab && ea.structurally_equal(eb),
            (
                Collate {
                    operand: ea,
                    collation: ca,
                },
                Collate {
                    operand: eb,
                    collation: cb,
                },
            ) => ca == cb && ea.structurally_equal(eb),
            (
                ScalarFunctionCall { name: na, args: aa },
                ScalarFunctionCall { name: nb, args: ab },
            )
            | (
                AggregateFunctionCall { name: na, args: aa },
                AggregateFunctionCall { name: nb, args: ab },
            ) => {
                na.eq_ignore_ascii_case(nb)
                    && aa.len() == ab.len()
                    && aa.iter().zip(ab).all(|(x, y)| x.structurally_equal(y))
            }
            _ => false,
        }
    }

    /// Rebuild this expression bottom-up, pre-transforming each node with
    /// `f`. `Replace` stops descent at that node; `Descend` recurses into
    /// the (possibly substituted) node's children.
    pub fn rewrite(
        self,
        f: &mut dyn FnMut(ScalarExpr) -> crate::error::Result<RewriteAction>,
    ) -> crate::error::Result<ScalarExpr> {
        let node = match f(self)? {
            RewriteAction::Replace(replaced) => return Ok(replaced),
            RewriteAction::Descend(node) => node,
        };
        Ok(match node {
            ScalarExpr::BinaryOp { op, left, right } => ScalarExpr::BinaryOp {
                op,
                left: Box::new(left.rewrite(f)?),
                right: Box::new(right.rewrite(f)?),
            },
            ScalarExpr::UnaryOp { op, operand } => ScalarExpr::UnaryOp {
                op,
                operand: Box::new(operand.rewrite(f)?),
            },
            ScalarExpr::Cast { operand, affinity } => ScalarExpr::Cast {
                operand: Box::new(operand.rewrite(f)?),
                affinity,
            },
            ScalarExpr::Case {
                operand,
                whens,
                else_expr,
            } => ScalarExpr::Case {
                operand: match operand {
                    Some(op) => Some(Box::new(op.rewrite(f)?)),
                    None => None,
                },
                whens: whens
                    .into_iter()
                    .map(|(w, t)| Ok((w.rewrite(f)?, t.rewrite(f)?)))
                    .collect::<crate::error::Result<Vec<_>>>()?,
                else_expr: match else_expr {
                    Some(e) => Some(Box::new(e.rewrite(f)?)),
                    None => None,
                },
            },
            ScalarExpr::Between {
                operand,
                low,
                high,
                negated,
            } => ScalarExpr::Between {
                operand: Box::new(operand.rewrite(f)?),
                low: Box::new(low.rewrite(f)?),
                high: Box::new(high.rewrite(f)?),
                negated,
            },
            ScalarExpr::ScalarFunctionCall { name, args } => ScalarExpr::ScalarFunctionCall {
                name,
                args: args
                    .into_iter()
                    .map(|a| a.rewrite(f))
                    .collect::<crate::error::Result<Vec<_>>>()?,
            },
            ScalarExpr::AggregateFunctionCall { name, args } => {
                ScalarExpr::AggregateFunctionCall {
                    name,
                    args: args
                        .into_iter()
                        .map(|a| a.rewrite(f))
                        .collect::<crate::error::Result<Vec<_>>>()?,
                }
            }
            ScalarExpr::WindowFunctionCall {
                name,
                partition_by,
                order_by,
            } => ScalarExpr::WindowFunctionCall {
                name,
                partition_by: partition_by
                    .into_iter()
                    .map(|a| a.rewrite(f))
                    .collect::<crate::error::Result<Vec<_>>>()?,
                order_by: order_by
                    .into_iter()
                    .map(|(e, d)| Ok((e.rewrite(f)?, d)))
                    .collect::<crate::error::Result<Vec<_>>>()?,
            },
            ScalarExpr::InList {
                operand,
                items,
                negated,
            } => ScalarExpr::InList {
                operand: Box::new(operand.rewrite(f)?),
                items: items
                    .into_iter()
                    .map(|a| a.rewrite(f))
                    .collect::<crate::error::Result<Vec<_>>>()?,
                negated,
            },
            ScalarExpr::InSubquery {
                operand,
                subquery,
                negated,
            } => ScalarExpr::InSubquery {
                operand: Box::new(operand.rewrite(f)?),
                subquery,
                negated,
            },
            ScalarExpr::Collate { operand, collation } => ScalarExpr::Collate {
                operand: Box::new(operand.rewrite(f)?),
                collation,
            },
            ScalarExpr::Like {
                operand,
                pattern,
                escape,
                negated,
            } => ScalarExpr::Like {
                operand: Box::new(operand.rewrite(f)?),
                pattern: Box::new(pattern.rewrite(f)?),
                escape,
                negated,
            },
            ScalarExpr::IsNull { operand, negated } => ScalarExpr::IsNull {
                operand: Box::new(operand.rewrite(f)?),
                negated,
            },
            leaf => leaf,
        })
    }
}

/// Controls `ScalarExpr::rewrite` descent.
pub enum RewriteAction {
    /// Use this expression as-is; do not descend.
    Replace(ScalarExpr),
    /// Continue into this expression's children.
    Descend(ScalarExpr),
}
