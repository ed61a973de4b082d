//! Relational plan nodes. A plan is an immutable tree of `Arc<RelNode>`;
//! rewrites build new nodes and share unchanged subtrees. Nodes carry no
//! parent pointers; consumers reach children only through `relations()`.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::schema::TableSchema;
use crate::types::{AttrId, Attribute, Collation, RelationType, ScalarType};
use crate::vtab::{ConflictPolicy, ConstraintOp, DmlOp, OrderingTerm};

use super::physical::{AttrOrdering, PhysicalProperties};
use super::scalar::ScalarExpr;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

fn next_node_id() -> u64 {
    NEXT_NODE_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl JoinKind {
    pub fn pads_right(self) -> bool {
        matches!(self, JoinKind::Left | JoinKind::Full)
    }

    pub fn pads_left(self) -> bool {
        matches!(self, JoinKind::Right | JoinKind::Full)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    Union,
    UnionAll,
    Intersect,
    Except,
    /// Symmetric difference with UNION-like column alignment.
    Diff,
}

/// One sort key. Collation defaults to the key expression's type collation.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub expr: ScalarExpr,
    pub desc: bool,
    pub nulls_first: Option<bool>,
}

impl SortKey {
    pub fn asc(expr: ScalarExpr) -> Self {
        Self {
            expr,
            desc: false,
            nulls_first: None,
        }
    }

    pub fn collation(&self) -> Collation {
        self.expr.result_type().collation
    }
}

#[derive(Debug, Clone)]
pub struct AggregateExpr {
    pub function: String,
    pub args: Vec<ScalarExpr>,
    pub attr: Attribute,
}

#[derive(Debug, Clone)]
pub struct WindowFuncExpr {
    pub function: String,
    pub attr: Attribute,
}

/// A constraint chosen for push-down into a scan. The value expression is
/// evaluated when the scan starts (it is row-independent by construction).
#[derive(Debug, Clone)]
pub struct PushedConstraint {
    pub column_index: usize,
    pub op: ConstraintOp,
    pub value: Option<ScalarExpr>,
}

/// The access path the optimizer settled on for one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanFilterInfo {
    pub constraints: Vec<PushedConstraint>,
    /// Ordering the plan relies on the scan to produce.
    pub ordering: Option<Vec<OrderingTerm>>,
    pub limit: Option<u64>,
    pub is_set: bool,
    pub explains: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RelOp {
    /// Logical reference to a base table; attributes are minted per
    /// occurrence so self-joins stay distinguishable.
    TableReference {
        table: Arc<TableSchema>,
        alias: String,
        attributes: Vec<Attribute>,
    },
    /// Access-path placeholder the builder wraps around every table
    /// reference; the optimizer must replace it with a `TableScan`.
    Retrieve { input: Arc<RelNode> },
    /// Physical scan with a negotiated access path.
    TableScan {
        table: Arc<TableSchema>,
        alias: String,
        attributes: Vec<Attribute>,
        filter_info: ScanFilterInfo,
    },
    /// A whole subtree handed to its module via `supports`/`execute_plan`;
    /// the embedded plan is the module's input, not an executable child.
    ModuleExec {
        module: String,
        plan: Arc<RelNode>,
        attributes: Vec<Attribute>,
    },
    /// Literal row set.
    Values {
        rows: Vec<Vec<ScalarExpr>>,
        attributes: Vec<Attribute>,
    },
    Filter {
        input: Arc<RelNode>,
        predicate: ScalarExpr,
    },
    Project {
        input: Arc<RelNode>,
        exprs: Vec<(ScalarExpr, Attribute)>,
    },
    Sort {
        input: Arc<RelNode>,
        keys: Vec<SortKey>,
    },
    Distinct { input: Arc<RelNode> },
    LimitOffset {
        input: Arc<RelNode>,
        limit: Option<ScalarExpr>,
        offset: Option<ScalarExpr>,
    },
    /// Logical aggregation; lowered to `StreamAggregate` (plus a sort when
    /// needed) by the optimizer.
    Aggregate {
        input: Arc<RelNode>,
        group_by: Vec<(ScalarExpr, Attribute)>,
        aggregates: Vec<AggregateExpr>,
    },
    /// Physical aggregation over group-key-clustered input.
    StreamAggregate {
        input: Arc<RelNode>,
        group_by: Vec<(ScalarExpr, Attribute)>,
        aggregates: Vec<AggregateExpr>,
    },
    /// Nested-loop join; the inner side re-executes per outer row.
    Join {
        left: Arc<RelNode>,
        right: Arc<RelNode>,
        kind: JoinKind,
        condition: Option<ScalarExpr>,
    },
    /// Hash join on equi-pairs with the right side as the build side.
    BloomJoin {
        left: Arc<RelNode>,
        right: Arc<RelNode>,
        kind: JoinKind,
        /// (probe-side attr, build-side attr) pairs.
        equi: Vec<(ScalarExpr, ScalarExpr)>,
        residual: Option<ScalarExpr>,
    },
    SetOperation {
        op: SetOpKind,
        left: Arc<RelNode>,
        right: Arc<RelNode>,
        attributes: Vec<Attribute>,
    },
    /// Reference to a CTE working table installed in the runtime context.
    CteRef {
        name: String,
        attributes: Vec<Attribute>,
    },
    RecursiveCte {
        name: String,
        attributes: Vec<Attribute>,
        base: Arc<RelNode>,
        recursive: Arc<RelNode>,
        union_all: bool,
    },
    Window {
        input: Arc<RelNode>,
        partition_by: Vec<ScalarExpr>,
        order_by: Vec<SortKey>,
        functions: Vec<WindowFuncExpr>,
    },
    /// Streaming-first cache with threshold spill to pass-through.
    Cache {
        input: Arc<RelNode>,
        threshold: usize,
    },
    /// Drains its input for side effects, yielding a row count.
    Sink { input: Arc<RelNode> },
    /// Projects RETURNING expressions over the DML executor's flat rows.
    Returning {
        input: Arc<RelNode>,
        exprs: Vec<(ScalarExpr, Attribute)>,
    },
    /// Sole point of mutation. Pulls flat OLD|NEW rows from its source and
    /// drives the vtab's `update`.
    DmlExecutor {
        table: Arc<TableSchema>,
        op: DmlOp,
        source: Arc<RelNode>,
        old_attrs: Vec<Attribute>,
        new_attrs: Vec<Attribute>,
        on_conflict: ConflictPolicy,
        /// Check-constraint predicates compiled against the NEW attributes.
        checks: Vec<ScalarExpr>,
    },
}

#[derive(Debug, Clone)]
pub struct RelNode {
    pub id: u64,
    pub op: RelOp,
    /// Set by the optimizer; `None` marks a node as not yet executable.
    pub physical: Option<PhysicalProperties>,
    pub est_rows: f64,
}

impl RelNode {
    pub fn logical(op: RelOp) -> Arc<RelNode> {
        let est_rows = default_estimate(&op);
        Arc::new(RelNode {
            id: next_node_id(),
            op,
            physical: None,
            est_rows,
        })
    }

    pub fn physical(op: RelOp, physical: PhysicalProperties, est_rows: f64) -> Arc<RelNode> {
        Arc::new(RelNode {
            id: next_node_id(),
            op,
            physical: Some(physical),
            est_rows,
        })
    }

    pub fn operator_name(&self) -> &'static str {
        match &self.op {
            RelOp::TableReference { .. } => "TableReference",
            RelOp::Retrieve { .. } => "Retrieve",
            RelOp::TableScan { .. } => "TableScan",
            RelOp::ModuleExec { .. } => "ModuleExec",
            RelOp::Values { .. } => "Values",
            RelOp::Filter { .. } => "Filter",
            RelOp::Project { .. } => "Project",
            RelOp::Sort { .. } => "Sort",
            RelOp::Distinct { .. } => "Distinct",
            RelOp::LimitOffset { .. } => "LimitOffset",
            RelOp::Aggregate { .. } => "Aggregate",
            RelOp::StreamAggregate { .. } => "StreamAggregate",
            RelOp::Join { .. } => "Join",
            RelOp::BloomJoin { .. } => "BloomJoin",
            RelOp::SetOperation { .. } => "SetOperation",
            RelOp::CteRef { .. } => "CteRef",
            RelOp::RecursiveCte { .. } => "RecursiveCte",
            RelOp::Window { .. } => "Window",
            RelOp::Cache { .. } => "Cache",
            RelOp::Sink { .. } => "Sink",
            RelOp::Returning { .. } => "Returning",
            RelOp::DmlExecutor { .. } => "DmlExecutor",
        }
    }

    /// Output attributes, in positional order.
    pub fn attributes(&self) -> Vec<Attribute> {
        match &self.op {
            RelOp::TableReference { attributes, .. }
            | RelOp::TableScan { attributes, .. }
            | RelOp::ModuleExec { attributes, .. }
            | RelOp::Values { attributes, .. }
            | RelOp::SetOperation { attributes, .. }
            | RelOp::CteRef { attributes, .. }
            | RelOp::RecursiveCte { attributes, .. } => attributes.clone(),
            RelOp::Retrieve { input }
            | RelOp::Filter { input, .. }
            | RelOp::Sort { input, .. }
            | RelOp::Distinct { input }
            | RelOp::LimitOffset { input, .. }
            | RelOp::Cache { input, .. } => input.attributes(),
            RelOp::Project { exprs, .. } | RelOp::Returning { exprs, .. } => {
                exprs.iter().map(|(_, a)| a.clone()).collect()
            }
            RelOp::Aggregate {
                group_by,
                aggregates,
                ..
            }
            | RelOp::StreamAggregate {
                group_by,
                aggregates,
                ..
            } => group_by
                .iter()
                .map(|(_, a)| a.clone())
                .chain(aggregates.iter().map(|a| a.attr.clone()))
                .collect(),
            RelOp::Join { left, right, kind, .. } => {
                let mut attrs = left.attributes();
                if kind.pads_left() {
                    for a in &mut attrs {
                        a.ty.nullable = true;
                    }
                }
                let mut right_attrs = right.attributes();
                if kind.pads_right() {
                    for a in &mut right_attrs {
                        a.ty.nullable = true;
                    }
                }
                attrs.extend(right_attrs);
                attrs
            }
            RelOp::BloomJoin { left, right, kind, .. } => {
                let mut attrs = left.attributes();
                if kind.pads_left() {
                    for a in &mut attrs {
                        a.ty.nullable = true;
                    }
                }
                let mut right_attrs = right.attributes();
                if kind.pads_right() {
                    for a in &mut right_attrs {
                        a.ty.nullable = true;
                    }
                }
                attrs.extend(right_attrs);
                attrs
            }
            RelOp::Window {
                input, functions, ..
            } => {
                let mut attrs = input.attributes();
                attrs.extend(functions.iter().map(|f| f.attr.clone()));
                attrs
            }
            RelOp::Sink { .. } => Vec::new(),
            RelOp::DmlExecutor {
                old_attrs,
                new_attrs,
                ..
            } => old_attrs
                .iter()
                .chain(new_attrs.iter())
                .cloned()
                .collect(),
        }
    }

    pub fn relation_type(&self) -> RelationType {
        let mut ty = RelationType::new(self.attributes());
        if let Some(physical) = &self.physical {
            ty = ty.with_keys(physical.unique_keys.clone());
        }
        ty
    }

    /// Relational inputs, in declaration order.
    pub fn relations(&self) -> Vec<Arc<RelNode>> {
        match &self.op {
            RelOp::TableReference { .. }
            | RelOp::TableScan { .. }
            | RelOp::ModuleExec { .. }
            | RelOp::Values { .. }
            | RelOp::CteRef { .. } => Vec::new(),
            RelOp::Retrieve { input }
            | RelOp::Filter { input, .. }
            | RelOp::Project { input, .. }
            | RelOp::Sort { input, .. }
            | RelOp::Distinct { input }
            | RelOp::LimitOffset { input, .. }
            | RelOp::Aggregate { input, .. }
            | RelOp::StreamAggregate { input, .. }
            | RelOp::Window { input, .. }
            | RelOp::Cache { input, .. }
            | RelOp::Sink { input }
            | RelOp::Returning { input, .. } => vec![Arc::clone(input)],
            RelOp::Join { left, right, .. }
            | RelOp::BloomJoin { left, right, .. }
            | RelOp::SetOperation { left, right, .. } => {
                vec![Arc::clone(left), Arc::clone(right)]
            }
            RelOp::RecursiveCte {
                base, recursive, ..
            } => vec![Arc::clone(base), Arc::clone(recursive)],
            RelOp::DmlExecutor { source, .. } => vec![Arc::clone(source)],
        }
    }

    /// Scalar children, in declaration order.
    pub fn scalar_children(&self) -> Vec<&ScalarExpr> {
        match &self.op {
            RelOp::Filter { predicate, .. } => vec![predicate],
            RelOp::Project { exprs, .. } | RelOp::Returning { exprs, .. } => {
                exprs.iter().map(|(e, _)| e).collect()
            }
            RelOp::Values { rows, .. } => rows.iter().flatten().collect(),
            RelOp::Sort { keys, .. } => keys.iter().map(|k| &k.expr).collect(),
            RelOp::LimitOffset { limit, offset, .. } => {
                limit.iter().chain(offset.iter()).collect()
            }
            RelOp::Aggregate {
                group_by,
                aggregates,
                ..
            }
            | RelOp::StreamAggregate {
                group_by,
                aggregates,
                ..
            } => group_by
                .iter()
                .map(|(e, _)| e)
                .chain(aggregates.iter().flat_map(|a| a.args.iter()))
                .collect(),
            RelOp::Join { condition, .. } => condition.iter().collect(),
            RelOp::BloomJoin {
                equi, residual, ..
            } => equi
                .iter()
                .flat_map(|(l, r)| [l, r])
                .chain(residual.iter())
                .collect(),
            RelOp::Window {
                partition_by,
                order_by,
                ..
            } => partition_by
                .iter()
                .chain(order_by.iter().map(|k| &k.expr))
                .collect(),
            RelOp::TableScan { filter_info, .. } => filter_info
                .constraints
                .iter()
                .filter_map(|c| c.value.as_ref())
                .collect(),
            RelOp::DmlExecutor { checks, .. } => checks.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Physical properties derived from this operator and its children's.
    /// Used by the optimizer when materializing physical nodes.
    pub fn derive_physical(&self, children: &[&PhysicalProperties]) -> PhysicalProperties {
        let mut props = PhysicalProperties::deterministic_default();
        match &self.op {
            RelOp::Sort { keys, .. } => {
                if let Some(child) = children.first() {
                    props.unique_keys = child.unique_keys.clone();
                }
                props.ordering = keys
                    .iter()
                    .filter_map(|k| match &k.expr {
                        ScalarExpr::ColumnRef { attr, .. } => Some(AttrOrdering {
                            attr: *attr,
                            desc: k.desc,
                        }),
                        _ => None,
                    })
                    .collect();
            }
            RelOp::Distinct { .. } => {
                if let Some(child) = children.first() {
                    props.ordering = child.ordering.clone();
                }
                props.unique_keys = vec![self
                    .attributes()
                    .iter()
                    .map(|a| a.id)
                    .collect()];
            }
            RelOp::Filter { .. } | RelOp::LimitOffset { .. } | RelOp::Cache { .. } => {
                if let Some(child) = children.first() {
                    props.ordering = child.ordering.clone();
                    props.unique_keys = child.unique_keys.clone();
                }
            }
            RelOp::Project { exprs, .. } => {
                // Pass-through column orderings/keys survive projection,
                // remapped onto the projection's own output attributes.
                if let Some(child) = children.first() {
                    let remap: Vec<(AttrId, AttrId)> = exprs
                        .iter()
                        .filter_map(|(e, out)| match e {
                            ScalarExpr::ColumnRef { attr, .. } => Some((*attr, out.id)),
                            _ => None,
                        })
                        .collect();
                    let map = |source: AttrId| {
                        remap
                            .iter()
                            .find_map(|(from, to)| (*from == source).then_some(*to))
                    };
                    props.ordering = child
                        .ordering
                        .iter()
                        .map_while(|o| {
                            map(o.attr).map(|attr| AttrOrdering { attr, desc: o.desc })
                        })
                        .collect();
                    props.unique_keys = child
                        .unique_keys
                        .iter()
                        .filter_map(|key| key.iter().map(|a| map(*a)).collect())
                        .collect();
                }
            }
            RelOp::StreamAggregate { group_by, .. } => {
                if !group_by.is_empty() {
                    props.unique_keys = vec![group_by.iter().map(|(_, a)| a.id).collect()];
                }
            }
            _ => {}
        }
        props
    }
}

/// Attributes for a base-table occurrence, minted fresh per reference.
pub fn table_attributes(table: &TableSchema) -> Vec<Attribute> {
    table
        .columns
        .iter()
        .map(|c| {
            let mut ty = ScalarType::new(c.affinity).with_collation(c.collation);
            ty.nullable = c.nullable;
            let attr = Attribute::new(c.name.clone(), ty);
            if c.hidden {
                attr.hidden()
            } else {
                attr
            }
        })
        .collect()
}

fn default_estimate(op: &RelOp) -> f64 {
    match op {
        RelOp::TableReference { .. } | RelOp::TableScan { .. } => 1000.0,
        RelOp::ModuleExec { plan, .. } => plan.est_rows,
        RelOp::Values { rows, .. } => rows.len() as f64,
        RelOp::Retrieve { input }
        | RelOp::Sort { input, .. }
        | RelOp::Window { input, .. }
        | RelOp::Cache { input, .. }
        | RelOp::Sink { input }
        | RelOp::Returning { input, .. } => input.est_rows,
        RelOp::Filter { input, .. } => input.est_rows * 0.33,
        RelOp::Project { input, .. } => input.est_rows,
        RelOp::Distinct { input } => input.est_rows * 0.5,
        RelOp::LimitOffset { input, .. } => input.est_rows,
        RelOp::Aggregate {
            input, group_by, ..
        }
        | RelOp::StreamAggregate {
            input, group_by, ..
        } => {
            if group_by.is_empty() {
                1.0
            } else {
                (input.est_rows * 0.1).max(1.0)
            }
        }
        RelOp::Join { left, right, kind, .. } => match kind {
            JoinKind::Cross => left.est_rows * right.est_rows,
            _ => (left.est_rows * right.est_rows * 0.1).max(left.est_rows),
        },
        RelOp::BloomJoin { left, .. } => left.est_rows,
        RelOp::SetOperation { left, right, .. } => left.est_rows + right.est_rows,
        RelOp::CteRef { .. } => 100.0,
        RelOp::RecursiveCte { base, .. } => base.est_rows * 10.0,
        RelOp::DmlExecutor { source, .. } => source.est_rows,
    }
}
