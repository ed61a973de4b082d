//! Access-path selection. Every `Retrieve` placeholder is resolved by
//! offering the surrounding filter conjuncts and any required ordering to
//! the table's module through `best_access_plan`; the answer decides which
//! conjuncts the scan enforces, what ordering it provides, and what residual
//! filtering remains in the plan.

use std::sync::Arc;

use tracing::debug;

use crate::error::{QuereusError, Result};
use crate::plan::{
    AttrOrdering, BinaryOp, PhysicalProperties, PushedConstraint, RelNode, RelOp, ScalarExpr,
    ScanFilterInfo,
};
use crate::schema::{Catalog, TableSchema};
use crate::types::{Attribute, AttrId};
use crate::vtab::{
    AccessPlanRequest, ConstraintOp, FilterConstraint, ModuleRegistry, OrderingTerm,
};

use super::cost::DEFAULT_UNKNOWN_ROWS;

/// One WHERE conjunct, with the push-down constraint extracted from it when
/// its shape allows.
pub(crate) struct Conjunct {
    pub expr: ScalarExpr,
    pub constraint: Option<ExtractedConstraint>,
}

pub(crate) struct ExtractedConstraint {
    pub column_index: usize,
    pub op: ConstraintOp,
    pub value: Option<ScalarExpr>,
}

/// Split a predicate into AND-ed conjuncts.
pub(crate) fn split_conjuncts(expr: &ScalarExpr, out: &mut Vec<ScalarExpr>) {
    if let ScalarExpr::BinaryOp {
        op: BinaryOp::And,
        left,
        right,
    } = expr
    {
        split_conjuncts(left, out);
        split_conjuncts(right, out);
    } else {
        out.push(expr.clone());
    }
}

/// Rebuild an AND chain from conjuncts.
pub(crate) fn join_conjuncts(mut conjuncts: Vec<ScalarExpr>) -> Option<ScalarExpr> {
    let first = conjuncts.pop()?;
    Some(conjuncts.into_iter().fold(first, |acc, next| {
        ScalarExpr::BinaryOp {
            op: BinaryOp::And,
            left: Box::new(next),
            right: Box::new(acc),
        }
    }))
}

/// Try to express a conjunct as a single-column constraint on this scan.
pub(crate) fn extract_constraint(
    expr: &ScalarExpr,
    attributes: &[Attribute],
) -> Option<ExtractedConstraint> {
    let column_of = |candidate: &ScalarExpr| -> Option<usize> {
        if let ScalarExpr::ColumnRef { attr, .. } = candidate {
            attributes.iter().position(|a| a.id == *attr)
        } else {
            None
        }
    };

    match expr {
        ScalarExpr::BinaryOp { op, left, right } if op.is_comparison() => {
            let op = match op {
                BinaryOp::Eq => ConstraintOp::Eq,
                BinaryOp::Gt => ConstraintOp::Gt,
                BinaryOp::GtEq => ConstraintOp::Ge,
                BinaryOp::Lt => ConstraintOp::Lt,
                BinaryOp::LtEq => ConstraintOp::Le,
                _ => return None,
            };
            if let Some(column_index) = column_of(left) {
                if right.is_row_independent() {
                    return Some(ExtractedConstraint {
                        column_index,
                        op,
                        value: Some((**right).clone()),
                    });
                }
            }
            if let Some(column_index) = column_of(right) {
                if left.is_row_independent() {
                    let flipped = match op {
                        ConstraintOp::Gt => ConstraintOp::Lt,
                        ConstraintOp::Ge => ConstraintOp::Le,
                        ConstraintOp::Lt => ConstraintOp::Gt,
                        ConstraintOp::Le => ConstraintOp::Ge,
                        other => other,
                    };
                    return Some(ExtractedConstraint {
                        column_index,
                        op: flipped,
                        value: Some((**left).clone()),
                    });
                }
            }
            None
        }
        ScalarExpr::IsNull { operand, negated } => {
            let column_index = column_of(operand)?;
            Some(ExtractedConstraint {
                column_index,
                op: if *negated {
                    ConstraintOp::IsNotNull
                } else {
                    ConstraintOp::IsNull
                },
                value: None,
            })
        }
        ScalarExpr::Like {
            operand,
            pattern,
            escape: None,
            negated: false,
        } => {
            let column_index = column_of(operand)?;
            if pattern.is_row_independent() {
                Some(ExtractedConstraint {
                    column_index,
                    op: ConstraintOp::Like,
                    value: Some((**pattern).clone()),
                })
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Negotiate the access path for a `Retrieve`, given the conjuncts of the
/// nearest enclosing filter and any ordering an enclosing sort requires.
/// Returns the physical scan with residual filtering already applied above
/// it.
#[allow(clippy::too_many_arguments)]
pub(crate) fn negotiate_scan(
    registry: &ModuleRegistry,
    catalog: &Catalog,
    table: &Arc<TableSchema>,
    alias: &str,
    attributes: &[Attribute],
    predicate: Option<&ScalarExpr>,
    wanted_ordering: Option<&[AttrOrdering]>,
    limit_hint: Option<u64>,
) -> Result<Arc<RelNode>> {
    let module = registry.get(&table.module)?;
    if !module.provides_access_planner() {
        // No silent fallback: a module that cannot plan access paths makes
        // the whole statement unplannable.
        return Err(QuereusError::Internal(format!(
            "module {} provides neither supports() nor best_access_plan()",
            table.module
        )));
    }

    let mut conjuncts: Vec<Conjunct> = Vec::new();
    if let Some(predicate) = predicate {
        let mut raw = Vec::new();
        split_conjuncts(predicate, &mut raw);
        for expr in raw {
            let constraint = extract_constraint(&expr, attributes);
            conjuncts.push(Conjunct { expr, constraint });
        }
    }

    // Filters offered to the module, with back-pointers into `conjuncts`.
    let mut offered: Vec<FilterConstraint> = Vec::new();
    let mut offered_from: Vec<usize> = Vec::new();
    for (i, conjunct) in conjuncts.iter().enumerate() {
        if let Some(extracted) = &conjunct.constraint {
            let (value, usable) = match &extracted.value {
                Some(ScalarExpr::Literal(v)) => (Some(v.clone()), true),
                Some(expr) => (None, expr.is_row_independent()),
                None => (None, true),
            };
            offered.push(FilterConstraint {
                column_index: extracted.column_index,
                op: extracted.op,
                value,
                usable,
            });
            offered_from.push(i);
        }
    }

    let required_ordering = wanted_ordering.and_then(|wanted| {
        wanted
            .iter()
            .map(|term| {
                attributes
                    .iter()
                    .position(|a| a.id == term.attr)
                    .map(|column_index| OrderingTerm {
                        column_index,
                        desc: term.desc,
                    })
            })
            .collect::<Option<Vec<_>>>()
    });

    let request = AccessPlanRequest {
        columns: table.columns.clone(),
        filters: offered,
        required_ordering,
        limit: limit_hint,
        estimated_rows: catalog.get_stats(&table.name).map(|s| s.row_count as f64),
    };

    let access = module.best_access_plan(table, &request)?;
    access.validate(&request)?;
    let est_rows = access
        .rows
        .or(request.estimated_rows)
        .unwrap_or(DEFAULT_UNKNOWN_ROWS);

    // Handled conjuncts move into the scan; the rest stay as a residual
    // filter above it.
    let mut handled_conjuncts = vec![false; conjuncts.len()];
    let mut pushed = Vec::new();
    for (slot, &conjunct_index) in offered_from.iter().enumerate() {
        if access.handled_filters[slot] {
            handled_conjuncts[conjunct_index] = true;
            let extracted = conjuncts[conjunct_index]
                .constraint
                .as_ref()
                .ok_or_else(|| {
                    QuereusError::Internal("handled filter lost its constraint".into())
                })?;
            pushed.push(PushedConstraint {
                column_index: extracted.column_index,
                op: extracted.op,
                value: extracted.value.clone(),
            });
        }
    }

    let provided_attr_ordering: Vec<AttrOrdering> = access
        .provides_ordering
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .filter_map(|term| {
            attributes
                .get(term.column_index)
                .map(|attr| AttrOrdering {
                    attr: attr.id,
                    desc: term.desc,
                })
        })
        .collect();

    let mut unique_keys: Vec<Vec<AttrId>> = Vec::new();
    if access.is_set {
        let key: Option<Vec<AttrId>> = table
            .effective_primary_key()
            .iter()
            .map(|part| attributes.get(part.column_index).map(|a| a.id))
            .collect();
        if let Some(key) = key {
            unique_keys.push(key);
        }
    }

    let physical = PhysicalProperties {
        ordering: provided_attr_ordering,
        unique_keys,
        deterministic: true,
        read_only: true,
        constant: false,
    };

    debug!(
        table = %table.name,
        cost = access.cost,
        rows = est_rows,
        explains = access.explains.as_deref().unwrap_or(""),
        "chose access path"
    );

    let scan = RelNode::physical(
        RelOp::TableScan {
            table: Arc::clone(table),
            alias: alias.to_string(),
            attributes: attributes.to_vec(),
            filter_info: ScanFilterInfo {
                constraints: pushed,
                ordering: access.provides_ordering.clone(),
                limit: limit_hint,
                is_set: access.is_set,
                explains: access.explains.clone(),
            },
        },
        physical.clone(),
        est_rows,
    );

    // Residual filter.
    let residual: Vec<ScalarExpr> = conjuncts
        .into_iter()
        .zip(handled_conjuncts)
        .filter(|(_, handled)| !handled)
        .map(|(c, _)| c.expr)
        .collect();
    match join_conjuncts(residual) {
        None => Ok(scan),
        Some(predicate) => {
            let est = scan.est_rows * 0.5;
            Ok(RelNode::physical(
                RelOp::Filter {
                    input: scan,
                    predicate,
                },
                physical,
                est.max(1.0),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScalarType;
    use crate::types::SqlValue;

    #[test]
    fn test_split_and_rejoin_conjuncts() {
        let a = ScalarExpr::literal(1i64);
        let b = ScalarExpr::literal(2i64);
        let c = ScalarExpr::literal(3i64);
        let and = ScalarExpr::BinaryOp {
            op: BinaryOp::And,
            left: Box::new(ScalarExpr::BinaryOp {
                op: BinaryOp::And,
                left: Box::new(a),
                right: Box::new(b),
            }),
            right: Box::new(c),
        };
        let mut parts = Vec::new();
        split_conjuncts(&and, &mut parts);
        assert_eq!(parts.len(), 3);
        let rejoined = join_conjuncts(parts).unwrap();
        let mut again = Vec::new();
        split_conjuncts(&rejoined, &mut again);
        assert_eq!(again.len(), 3);
    }

    #[test]
    fn test_extract_flips_reversed_comparison() {
        let attr = Attribute::new("id", ScalarType::integer());
        let attrs = vec![attr.clone()];
        // 5 > id  ⇒  id < 5
        let expr = ScalarExpr::BinaryOp {
            op: BinaryOp::Gt,
            left: Box::new(ScalarExpr::Literal(SqlValue::Integer(5))),
            right: Box::new(ScalarExpr::column(attr.id, "id", attr.ty.clone())),
        };
        let extracted = extract_constraint(&expr, &attrs).unwrap();
        assert_eq!(extracted.op, ConstraintOp::Lt);
        assert_eq!(extracted.column_index, 0);
    }

    #[test]
    fn test_extract_rejects_column_to_column() {
        let a = Attribute::new("a", ScalarType::integer());
        let b = Attribute::new("b", ScalarType::integer());
        let attrs = vec![a.clone(), b.clone()];
        let expr = ScalarExpr::BinaryOp {
            op: BinaryOp::Eq,
            left: Box::new(ScalarExpr::column(a.id, "a", a.ty.clone())),
            right: Box::new(ScalarExpr::column(b.id, "b", b.ty.clone())),
        };
        assert!(extract_constraint(&expr, &attrs).is_none());
    }
}
