//! Rule-based optimizer: one bottom-up pass that resolves every `Retrieve`
//! through access-path selection, lowers logical operators to physical ones
//! (stream aggregation, hash joins, physical sorts), elides sorts and
//! distincts that access paths already satisfy, and stamps every node with
//! its physical properties. Optimizing an already-physical tree is a no-op.

pub mod access_path;
pub mod cost;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{QuereusError, Result};
use crate::plan::{
    AttrOrdering, BinaryOp, Block, PhysicalProperties, RelNode, RelOp, RewriteAction, ScalarExpr,
    SortKey, StatementPlan,
};
use crate::schema::Catalog;
use crate::vtab::ModuleRegistry;

use access_path::negotiate_scan;
use cost::HASH_BUILD_MAX_ROWS;

type Memo = HashMap<u64, Arc<RelNode>>;

pub struct Optimizer {
    registry: Arc<ModuleRegistry>,
    catalog: Catalog,
}

impl Optimizer {
    pub fn new(registry: Arc<ModuleRegistry>, catalog: Catalog) -> Self {
        Self { registry, catalog }
    }

    /// Optimize a statement block. Only query/DML plans carry relational
    /// trees; everything else passes through.
    pub fn optimize_block(&self, block: Block) -> Result<Block> {
        let plan = match block.plan {
            StatementPlan::Query(node) => {
                let mut memo = Memo::new();
                StatementPlan::Query(self.optimize_node(&node, &mut memo)?)
            }
            StatementPlan::Dml { plan, returning } => {
                let mut memo = Memo::new();
                StatementPlan::Dml {
                    plan: self.optimize_node(&plan, &mut memo)?,
                    returning,
                }
            }
            StatementPlan::Explain(inner) => {
                StatementPlan::Explain(Box::new(self.optimize_block(*inner)?))
            }
            other => other,
        };
        Ok(Block { plan, ..block })
    }

    pub fn optimize_node(&self, node: &Arc<RelNode>, memo: &mut Memo) -> Result<Arc<RelNode>> {
        if let Some(done) = memo.get(&node.id) {
            return Ok(Arc::clone(done));
        }
        // Idempotence: a node that already carries physical properties was
        // produced by a previous pass.
        if node.physical.is_some() {
            memo.insert(node.id, Arc::clone(node));
            return Ok(Arc::clone(node));
        }
        let optimized = self.lower(node, memo)?;
        debug!(
            from = node.operator_name(),
            to = optimized.operator_name(),
            rows = optimized.est_rows,
            "lowered node"
        );
        memo.insert(node.id, Arc::clone(&optimized));
        Ok(optimized)
    }

    fn lower(&self, node: &Arc<RelNode>, memo: &mut Memo) -> Result<Arc<RelNode>> {
        match &node.op {
            RelOp::TableReference { .. } => Err(QuereusError::Internal(
                "table reference escaped its Retrieve wrapper".into(),
            )),

            RelOp::Retrieve { .. } => self.lower_scan_chain(node, None, memo),
            RelOp::Filter { .. } => self.lower_scan_chain(node, None, memo),

            RelOp::Sort { input, keys } => {
                let wanted = attr_ordering_of_keys(keys);
                let child = match (&input.op, &wanted) {
                    (RelOp::Retrieve { .. } | RelOp::Filter { .. }, Some(wanted))
                        if input.physical.is_none() =>
                    {
                        self.lower_scan_chain(input, Some(wanted.as_slice()), memo)?
                    }
                    _ => self.optimize_node(input, memo)?,
                };
                if let (Some(wanted), Some(props)) = (&wanted, child.physical.as_ref()) {
                    if props.satisfies_ordering(wanted) {
                        // The access path already yields this order.
                        return Ok(child);
                    }
                }
                let keys = self.optimize_sort_keys(keys.clone(), memo)?;
                let est = child.est_rows;
                debug!(cost = cost::sort_cost(est), "materializing sort");
                Ok(self.finalize(RelOp::Sort { input: child, keys }, est))
            }

            RelOp::Distinct { input } => {
                let child = self.optimize_node(input, memo)?;
                let output_ids: Vec<_> = child.attributes().iter().map(|a| a.id).collect();
                if let Some(props) = child.physical.as_ref() {
                    if props.key_covered_by(&output_ids) {
                        // Rows are already unique on a key the output keeps.
                        return Ok(child);
                    }
                }
                let est = child.est_rows * 0.5;
                Ok(self.finalize(RelOp::Distinct { input: child }, est.max(1.0)))
            }

            RelOp::Aggregate {
                input,
                group_by,
                aggregates,
            } => {
                let child = self.optimize_node(input, memo)?;
                let group_by = group_by
                    .iter()
                    .map(|(e, a)| Ok((self.optimize_expr(e.clone(), memo)?, a.clone())))
                    .collect::<Result<Vec<_>>>()?;
                let aggregates = aggregates
                    .iter()
                    .map(|agg| {
                        Ok(crate::plan::AggregateExpr {
                            function: agg.function.clone(),
                            args: agg
                                .args
                                .iter()
                                .map(|a| self.optimize_expr(a.clone(), memo))
                                .collect::<Result<Vec<_>>>()?,
                            attr: agg.attr.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;

                let est = if group_by.is_empty() {
                    1.0
                } else {
                    (child.est_rows * 0.1).max(1.0)
                };

                // Stream aggregation needs group-key-clustered input: sort
                // unless the child's ordering already covers the keys.
                let child = if group_by.is_empty() {
                    child
                } else {
                    let wanted: Option<Vec<AttrOrdering>> = group_by
                        .iter()
                        .map(|(e, _)| match e {
                            ScalarExpr::ColumnRef { attr, .. } => Some(AttrOrdering {
                                attr: *attr,
                                desc: false,
                            }),
                            _ => None,
                        })
                        .collect();
                    let covered = match (&wanted, child.physical.as_ref()) {
                        (Some(wanted), Some(props)) => props.satisfies_ordering(wanted),
                        _ => false,
                    };
                    if covered {
                        child
                    } else {
                        let keys: Vec<SortKey> = group_by
                            .iter()
                            .map(|(e, _)| SortKey::asc(e.clone()))
                            .collect();
                        let est_rows = child.est_rows;
                        self.finalize(RelOp::Sort { input: child, keys }, est_rows)
                    }
                };

                Ok(self.finalize(
                    RelOp::StreamAggregate {
                        input: child,
                        group_by,
                        aggregates,
                    },
                    est,
                ))
            }

            RelOp::Join {
                left,
                right,
                kind,
                condition,
            } => {
                let left = self.optimize_node(left, memo)?;
                let right = self.optimize_node(right, memo)?;
                let condition = match condition {
                    Some(c) => Some(self.optimize_expr(c.clone(), memo)?),
                    None => None,
                };

                // An equi-key join with a bounded build side becomes a hash
                // join; everything else stays a nested loop.
                if let Some(condition) = &condition {
                    let left_ids: Vec<_> = left.attributes().iter().map(|a| a.id).collect();
                    let right_ids: Vec<_> = right.attributes().iter().map(|a| a.id).collect();
                    let (equi, residual) = split_equi_pairs(condition, &left_ids, &right_ids);
                    debug!(
                        hash = cost::hash_join_cost(left.est_rows, right.est_rows),
                        nested = cost::loop_join_cost(left.est_rows, right.est_rows),
                        "join strategy costs"
                    );
                    if !equi.is_empty() && right.est_rows <= HASH_BUILD_MAX_ROWS {
                        let est = (left.est_rows).max(1.0);
                        return Ok(self.finalize(
                            RelOp::BloomJoin {
                                left,
                                right,
                                kind: *kind,
                                equi,
                                residual,
                            },
                            est,
                        ));
                    }
                }

                // The nested loop re-executes its inner side per outer row;
                // a threshold cache keeps small inner relations from being
                // recomputed while spilling to pass-through on large ones.
                let right = if matches!(
                    right.op,
                    RelOp::Cache { .. } | RelOp::Values { .. } | RelOp::CteRef { .. }
                ) {
                    right
                } else {
                    let est_rows = right.est_rows;
                    let threshold = self.catalog.settings().cache_threshold;
                    self.finalize(
                        RelOp::Cache {
                            input: right,
                            threshold,
                        },
                        est_rows,
                    )
                };

                let est = (left.est_rows * right.est_rows * 0.1).max(left.est_rows);
                Ok(self.finalize(
                    RelOp::Join {
                        left,
                        right,
                        kind: *kind,
                        condition,
                    },
                    est,
                ))
            }

            // Structure-preserving lowerings.
            RelOp::Project { input, exprs } => {
                let child = self.optimize_node(input, memo)?;
                let exprs = exprs
                    .iter()
                    .map(|(e, a)| Ok((self.optimize_expr(e.clone(), memo)?, a.clone())))
                    .collect::<Result<Vec<_>>>()?;
                let est = child.est_rows;
                Ok(self.finalize(RelOp::Project { input: child, exprs }, est))
            }
            RelOp::LimitOffset {
                input,
                limit,
                offset,
            } => {
                let child = self.optimize_node(input, memo)?;
                let limit = limit
                    .as_ref()
                    .map(|e| self.optimize_expr(e.clone(), memo))
                    .transpose()?;
                let offset = offset
                    .as_ref()
                    .map(|e| self.optimize_expr(e.clone(), memo))
                    .transpose()?;
                let est = child.est_rows;
                Ok(self.finalize(
                    RelOp::LimitOffset {
                        input: child,
                        limit,
                        offset,
                    },
                    est,
                ))
            }
            RelOp::SetOperation {
                op,
                left,
                right,
                attributes,
            } => {
                let left = self.optimize_node(left, memo)?;
                let right = self.optimize_node(right, memo)?;
                let est = left.est_rows + right.est_rows;
                Ok(self.finalize(
                    RelOp::SetOperation {
                        op: *op,
                        left,
                        right,
                        attributes: attributes.clone(),
                    },
                    est,
                ))
            }
            RelOp::Values { rows, attributes } => {
                let rows = rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|e| self.optimize_expr(e.clone(), memo))
                            .collect::<Result<Vec<_>>>()
                    })
                    .collect::<Result<Vec<_>>>()?;
                let est = rows.len() as f64;
                let constant = rows
                    .iter()
                    .flatten()
                    .all(|e| matches!(e, ScalarExpr::Literal(_)));
                let mut props = PhysicalProperties::deterministic_default();
                props.constant = constant;
                Ok(RelNode::physical(
                    RelOp::Values {
                        rows,
                        attributes: attributes.clone(),
                    },
                    props,
                    est,
                ))
            }
            RelOp::CteRef { name, attributes } => Ok(self.finalize(
                RelOp::CteRef {
                    name: name.clone(),
                    attributes: attributes.clone(),
                },
                100.0,
            )),
            RelOp::RecursiveCte {
                name,
                attributes,
                base,
                recursive,
                union_all,
            } => {
                let base = self.optimize_node(base, memo)?;
                let recursive = self.optimize_node(recursive, memo)?;
                let est = base.est_rows * 10.0;
                Ok(self.finalize(
                    RelOp::RecursiveCte {
                        name: name.clone(),
                        attributes: attributes.clone(),
                        base,
                        recursive,
                        union_all: *union_all,
                    },
                    est,
                ))
            }
            RelOp::Window {
                input,
                partition_by,
                order_by,
                functions,
            } => {
                let child = self.optimize_node(input, memo)?;
                let partition_by = partition_by
                    .iter()
                    .map(|e| self.optimize_expr(e.clone(), memo))
                    .collect::<Result<Vec<_>>>()?;
                let order_by = self.optimize_sort_keys(order_by.clone(), memo)?;

                // Partition-clustered, order-sorted input.
                let mut keys: Vec<SortKey> =
                    partition_by.iter().cloned().map(SortKey::asc).collect();
                keys.extend(order_by.iter().cloned());
                let child = if keys.is_empty() {
                    child
                } else {
                    let est_rows = child.est_rows;
                    self.finalize(RelOp::Sort { input: child, keys }, est_rows)
                };

                let est = child.est_rows;
                Ok(self.finalize(
                    RelOp::Window {
                        input: child,
                        partition_by,
                        order_by,
                        functions: functions.clone(),
                    },
                    est,
                ))
            }
            RelOp::Cache { input, threshold } => {
                let child = self.optimize_node(input, memo)?;
                let est = child.est_rows;
                Ok(self.finalize(
                    RelOp::Cache {
                        input: child,
                        threshold: *threshold,
                    },
                    est,
                ))
            }
            RelOp::Sink { input } => {
                let child = self.optimize_node(input, memo)?;
                let est = child.est_rows;
                Ok(self.finalize(RelOp::Sink { input: child }, est))
            }
            RelOp::Returning { input, exprs } => {
                let child = self.optimize_node(input, memo)?;
                let exprs = exprs
                    .iter()
                    .map(|(e, a)| Ok((self.optimize_expr(e.clone(), memo)?, a.clone())))
                    .collect::<Result<Vec<_>>>()?;
                let est = child.est_rows;
                Ok(self.finalize(RelOp::Returning { input: child, exprs }, est))
            }
            RelOp::DmlExecutor {
                table,
                op,
                source,
                old_attrs,
                new_attrs,
                on_conflict,
                checks,
            } => {
                let source = self.optimize_node(source, memo)?;
                let checks = checks
                    .iter()
                    .map(|c| self.optimize_expr(c.clone(), memo))
                    .collect::<Result<Vec<_>>>()?;
                let est = source.est_rows;
                let mut props = PhysicalProperties::deterministic_default();
                props.read_only = false;
                Ok(RelNode::physical(
                    RelOp::DmlExecutor {
                        table: Arc::clone(table),
                        op: *op,
                        source,
                        old_attrs: old_attrs.clone(),
                        new_attrs: new_attrs.clone(),
                        on_conflict: *on_conflict,
                        checks,
                    },
                    props,
                    est,
                ))
            }

            // Already-physical operators only appear here if the builder
            // emitted them directly, which it does not.
            RelOp::TableScan { .. }
            | RelOp::ModuleExec { .. }
            | RelOp::StreamAggregate { .. }
            | RelOp::BloomJoin { .. } => Ok(Arc::clone(node)),
        }
    }

    /// Lower a `Filter(Retrieve)` / `Retrieve` chain through access-path
    /// negotiation.
    fn lower_scan_chain(
        &self,
        node: &Arc<RelNode>,
        wanted_ordering: Option<&[AttrOrdering]>,
        memo: &mut Memo,
    ) -> Result<Arc<RelNode>> {
        let (predicate, retrieve) = match &node.op {
            RelOp::Filter { input, predicate } if matches!(input.op, RelOp::Retrieve { .. }) => {
                (Some(predicate.clone()), Arc::clone(input))
            }
            RelOp::Retrieve { .. } => (None, Arc::clone(node)),
            RelOp::Filter { input, predicate } => {
                // Filter over a non-scan input: plain residual filter.
                let child = self.optimize_node(input, memo)?;
                let predicate = self.optimize_expr(predicate.clone(), memo)?;
                let est = (child.est_rows * 0.33).max(1.0);
                return Ok(self.finalize(
                    RelOp::Filter {
                        input: child,
                        predicate,
                    },
                    est,
                ));
            }
            _ => return Err(QuereusError::Internal("lower_scan_chain misuse".into())),
        };

        let RelOp::Retrieve { input: reference } = &retrieve.op else {
            return Err(QuereusError::Internal("retrieve without reference".into()));
        };
        let RelOp::TableReference {
            table,
            alias,
            attributes,
        } = &reference.op
        else {
            return Err(QuereusError::Internal(
                "retrieve over a non-table reference".into(),
            ));
        };

        // A module without an access planner may still claim the whole
        // subtree through `supports`; having neither is an internal error
        // (raised inside the negotiation).
        let module = self.registry.get(&table.module)?;
        if !module.provides_access_planner() {
            if let Some(support) = module.supports(node) {
                debug!(
                    table = %table.name,
                    cost = support.cost,
                    "module accepted subtree push-down"
                );
                return Ok(RelNode::physical(
                    RelOp::ModuleExec {
                        module: table.module.clone(),
                        plan: Arc::clone(node),
                        attributes: attributes.clone(),
                    },
                    PhysicalProperties::deterministic_default(),
                    node.est_rows,
                ));
            }
        }

        let predicate = predicate
            .map(|p| self.optimize_expr(p, memo))
            .transpose()?;

        negotiate_scan(
            &self.registry,
            &self.catalog,
            table,
            alias,
            attributes,
            predicate.as_ref(),
            wanted_ordering,
            None,
        )
    }

    fn optimize_sort_keys(&self, keys: Vec<SortKey>, memo: &mut Memo) -> Result<Vec<SortKey>> {
        keys.into_iter()
            .map(|key| {
                Ok(SortKey {
                    expr: self.optimize_expr(key.expr, memo)?,
                    desc: key.desc,
                    nulls_first: key.nulls_first,
                })
            })
            .collect()
    }

    /// Optimize subquery plans embedded in a scalar expression.
    fn optimize_expr(&self, expr: ScalarExpr, memo: &mut Memo) -> Result<ScalarExpr> {
        expr.rewrite(&mut |node| {
            Ok(match node {
                ScalarExpr::ScalarSubquery(plan) => RewriteAction::Replace(
                    ScalarExpr::ScalarSubquery(self.optimize_node(&plan, memo)?),
                ),
                ScalarExpr::InSubquery {
                    operand,
                    subquery,
                    negated,
                } => {
                    let operand = Box::new(self.optimize_expr(*operand, memo)?);
                    RewriteAction::Replace(ScalarExpr::InSubquery {
                        operand,
                        subquery: self.optimize_node(&subquery, memo)?,
                        negated,
                    })
                }
                ScalarExpr::Exists { subquery, negated } => {
                    RewriteAction::Replace(ScalarExpr::Exists {
                        subquery: self.optimize_node(&subquery, memo)?,
                        negated,
                    })
                }
                other => RewriteAction::Descend(other),
            })
        })
    }

    /// Wrap an operator into a physical node, deriving its properties from
    /// its (already physical) children.
    fn finalize(&self, op: RelOp, est_rows: f64) -> Arc<RelNode> {
        let tmp = RelNode::logical(op);
        let children = tmp.relations();
        let props: Vec<&PhysicalProperties> = children
            .iter()
            .filter_map(|c| c.physical.as_ref())
            .collect();
        let physical = tmp.derive_physical(&props);
        let inner = Arc::try_unwrap(tmp).unwrap_or_else(|arc| (*arc).clone());
        Arc::new(RelNode {
            id: inner.id,
            op: inner.op,
            physical: Some(physical),
            est_rows,
        })
    }
}

fn attr_ordering_of_keys(keys: &[SortKey]) -> Option<Vec<AttrOrdering>> {
    keys.iter()
        .map(|key| match &key.expr {
            ScalarExpr::ColumnRef { attr, .. } => Some(AttrOrdering {
                attr: *attr,
                desc: key.desc,
            }),
            _ => None,
        })
        .collect()
}

/// Partition a join condition into equi pairs (probe expr from the left
/// side, build expr from the right) and a residual predicate.
fn split_equi_pairs(
    condition: &ScalarExpr,
    left_ids: &[crate::types::AttrId],
    right_ids: &[crate::types::AttrId],
) -> (Vec<(ScalarExpr, ScalarExpr)>, Option<ScalarExpr>) {
    let mut conjuncts = Vec::new();
    access_path::split_conjuncts(condition, &mut conjuncts);

    let side_of = |expr: &ScalarExpr| -> Option<bool> {
        // true = left side only, false = right side only
        let attrs = expr.referenced_attrs();
        if attrs.is_empty() {
            return None;
        }
        if attrs.iter().all(|a| left_ids.contains(a)) {
            Some(true)
        } else if attrs.iter().all(|a| right_ids.contains(a)) {
            Some(false)
        } else {
            None
        }
    };

    let mut equi = Vec::new();
    let mut residual = Vec::new();
    for conjunct in conjuncts {
        if let ScalarExpr::BinaryOp {
            op: BinaryOp::Eq,
            left,
            right,
        } = &conjunct
        {
            match (side_of(left), side_of(right)) {
                (Some(true), Some(false)) => {
                    equi.push(((**left).clone(), (**right).clone()));
                    continue;
                }
                (Some(false), Some(true)) => {
                    equi.push(((**right).clone(), (**left).clone()));
                    continue;
                }
                _ => {}
            }
        }
        residual.push(conjunct);
    }
    (equi, access_path::join_conjuncts(residual))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryModule;
    use crate::planner::plan_script;
    use crate::schema::{ColumnSchema, PrimaryKeyPart, TableSchema};
    use crate::types::Affinity;

    async fn setup() -> (Arc<ModuleRegistry>, Catalog) {
        let registry = Arc::new(ModuleRegistry::new());
        let module = Arc::new(MemoryModule::new());
        registry.register(module.clone());

        let catalog = Catalog::new();
        let mut schema = TableSchema::new(
            "t",
            vec![
                ColumnSchema::new("id", Affinity::Integer).not_null(),
                ColumnSchema::new("v", Affinity::Text),
            ],
        );
        schema.primary_key = vec![PrimaryKeyPart {
            column_index: 0,
            desc: false,
        }];
        let schema = catalog.create_table(schema).unwrap();
        use crate::vtab::VtabModule;
        module.create(schema).await.unwrap();
        (registry, catalog)
    }

    fn query_plan(blocks: Vec<Block>) -> Arc<RelNode> {
        match blocks.into_iter().next().map(|b| b.plan) {
            Some(StatementPlan::Query(node)) => node,
            other => panic!("expected query plan, got {other:?}"),
        }
    }

    fn count_ops(node: &RelNode, name: &str) -> usize {
        let mut n = usize::from(node.operator_name() == name);
        for child in node.relations() {
            n += count_ops(&child, name);
        }
        n
    }

    #[tokio::test]
    async fn test_retrieve_becomes_table_scan() {
        let (registry, catalog) = setup().await;
        let optimizer = Optimizer::new(registry, catalog.clone());
        let node = query_plan(plan_script(&catalog, "SELECT v FROM t").unwrap());
        let block = optimizer
            .optimize_block(Block {
                plan: StatementPlan::Query(node),
                parameters: Default::default(),
                columns: Vec::new(),
                sql: String::new(),
            })
            .unwrap();
        let StatementPlan::Query(optimized) = block.plan else {
            panic!()
        };
        assert_eq!(count_ops(&optimized, "Retrieve"), 0);
        assert_eq!(count_ops(&optimized, "TableScan"), 1);
        assert!(all_physical(&optimized));
    }

    fn all_physical(node: &RelNode) -> bool {
        node.physical.is_some() && node.relations().iter().all(|c| all_physical(c))
    }

    #[tokio::test]
    async fn test_handled_equality_leaves_like_residual() {
        let (registry, catalog) = setup().await;
        let optimizer = Optimizer::new(registry, catalog.clone());
        let node = query_plan(
            plan_script(&catalog, "SELECT v FROM t WHERE id = 1 AND v LIKE 'a%'").unwrap(),
        );
        let mut memo = Memo::new();
        let optimized = optimizer.optimize_node(&node, &mut memo).unwrap();
        // Equality pushed into the scan, LIKE kept as residual.
        assert_eq!(count_ops(&optimized, "Filter"), 1);
        assert_eq!(count_ops(&optimized, "TableScan"), 1);
    }

    #[tokio::test]
    async fn test_sort_elided_when_scan_orders_by_pk() {
        let (registry, catalog) = setup().await;
        let optimizer = Optimizer::new(registry, catalog.clone());
        let node = query_plan(plan_script(&catalog, "SELECT v FROM t ORDER BY id").unwrap());
        let mut memo = Memo::new();
        let optimized = optimizer.optimize_node(&node, &mut memo).unwrap();
        assert_eq!(count_ops(&optimized, "Sort"), 0, "pk order satisfies ORDER BY");

        let node =
            query_plan(plan_script(&catalog, "SELECT v FROM t ORDER BY id DESC").unwrap());
        let mut memo = Memo::new();
        let optimized = optimizer.optimize_node(&node, &mut memo).unwrap();
        assert_eq!(count_ops(&optimized, "Sort"), 1, "desc order needs a sort");
    }

    #[tokio::test]
    async fn test_distinct_elided_when_key_covered() {
        let (registry, catalog) = setup().await;
        let optimizer = Optimizer::new(registry, catalog.clone());
        let node = query_plan(plan_script(&catalog, "SELECT DISTINCT id FROM t").unwrap());
        let mut memo = Memo::new();
        let optimized = optimizer.optimize_node(&node, &mut memo).unwrap();
        assert_eq!(count_ops(&optimized, "Distinct"), 0);

        let node = query_plan(plan_script(&catalog, "SELECT DISTINCT v FROM t").unwrap());
        let mut memo = Memo::new();
        let optimized = optimizer.optimize_node(&node, &mut memo).unwrap();
        assert_eq!(count_ops(&optimized, "Distinct"), 1);
    }

    #[tokio::test]
    async fn test_equi_join_becomes_hash_join() {
        let (registry, catalog) = setup().await;
        let optimizer = Optimizer::new(registry, catalog.clone());
        let node = query_plan(
            plan_script(
                &catalog,
                "SELECT a.id FROM t a JOIN t b ON a.id = b.id WHERE a.v LIKE 'a%'",
            )
            .unwrap(),
        );
        let mut memo = Memo::new();
        let optimized = optimizer.optimize_node(&node, &mut memo).unwrap();
        assert_eq!(count_ops(&optimized, "BloomJoin"), 1);
        assert_eq!(count_ops(&optimized, "Join"), 0);
    }

    #[tokio::test]
    async fn test_optimize_is_idempotent() {
        let (registry, catalog) = setup().await;
        let optimizer = Optimizer::new(registry, catalog.clone());
        let node = query_plan(
            plan_script(&catalog, "SELECT v, count(*) FROM t GROUP BY v").unwrap(),
        );
        let mut memo = Memo::new();
        let once = optimizer.optimize_node(&node, &mut memo).unwrap();
        let mut memo = Memo::new();
        let twice = optimizer.optimize_node(&once, &mut memo).unwrap();
        assert_eq!(once.id, twice.id, "optimizing a physical tree is a no-op");
        assert_eq!(count_ops(&once, "StreamAggregate"), 1);
    }
}
