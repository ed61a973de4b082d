//! Query planning: FROM/joins, WHERE, GROUP BY/HAVING with aggregate
//! extraction, window extraction, ORDER BY, set operations, CTEs (recursive
//! and not), and LIMIT/OFFSET.
//!
//! ORDER BY sorts below the final projection: keys naming select aliases or
//! ordinals are cloned from the projection expressions, so projection stays
//! a pure streaming map and never has to re-expose hidden sort columns.

use std::collections::HashMap;
use std::sync::Arc;

use sqlparser::ast::{
    Distinct as AstDistinct, Expr as SqlExpr, GroupByExpr, Join as AstJoin, JoinConstraint,
    JoinOperator, OrderByExpr, Query, Select, SelectItem, SetExpr, SetOperator, SetQuantifier,
    TableFactor, TableWithJoins, Value as AstValue,
};

use crate::error::{QuereusError, Result};
use crate::plan::{
    table_attributes, AggregateExpr, JoinKind, RelNode, RelOp, RewriteAction, ScalarExpr,
    SetOpKind, SortKey, WindowFuncExpr,
};
use crate::types::{Attribute, ScalarType};

use super::scope::Scope;
use super::{object_name_str, StatementBuilder};

/// A name bound by a WITH clause.
#[derive(Clone)]
pub(crate) enum CteBinding {
    /// Re-planned at each reference so every occurrence gets fresh
    /// attributes (views use the same mechanism).
    Inline {
        query: Box<Query>,
        columns: Vec<String>,
    },
    /// Self-reference inside a recursive CTE's recursive branch: resolves to
    /// the working table installed under `key`.
    Working {
        key: String,
        attributes: Vec<Attribute>,
    },
    /// A recursive CTE, expanded into a `RecursiveCte` node per reference.
    Recursive {
        query: Box<Query>,
        columns: Vec<String>,
        name: String,
    },
}

impl StatementBuilder {
    /// Plan a full query: WITH bindings, body, ORDER BY, LIMIT/OFFSET.
    pub(crate) fn plan_query(
        &mut self,
        outer: &Scope<'_>,
        query: &Query,
    ) -> Result<Arc<RelNode>> {
        let pushed = self.push_ctes(query)?;

        let order_exprs: &[OrderByExpr] = query
            .order_by
            .as_ref()
            .map(|o| o.exprs.as_slice())
            .unwrap_or(&[]);

        let result = (|| {
            let mut node = match query.body.as_ref() {
                SetExpr::Select(select) => self.plan_select(outer, select, order_exprs)?,
                body => {
                    let node = self.plan_set_expr(outer, body)?;
                    self.sort_set_output(node, order_exprs)?
                }
            };

            let limit = match &query.limit {
                Some(expr) => Some(self.build_row_independent(expr)?),
                None => None,
            };
            let offset = match &query.offset {
                Some(offset) => Some(self.build_row_independent(&offset.value)?),
                None => None,
            };
            if limit.is_some() || offset.is_some() {
                node = RelNode::logical(RelOp::LimitOffset {
                    input: node,
                    limit,
                    offset,
                });
            }
            Ok(node)
        })();

        if pushed {
            self.ctes.pop();
        }
        result
    }

    /// Subqueries plan against a child context whose scope parent is the
    /// outer scope, so correlated references capture outer attribute ids.
    pub(crate) fn plan_subquery(
        &mut self,
        outer: &Scope<'_>,
        query: &Query,
    ) -> Result<Arc<RelNode>> {
        self.plan_query(outer, query)
    }

    fn push_ctes(&mut self, query: &Query) -> Result<bool> {
        let Some(with) = &query.with else {
            return Ok(false);
        };
        let mut bindings = HashMap::new();
        for cte in &with.cte_tables {
            let name = cte.alias.name.value.to_ascii_lowercase();
            let columns: Vec<String> =
                cte.alias.columns.iter().map(|c| c.value.clone()).collect();
            let binding = if with.recursive && query_mentions_table(&cte.query, &name) {
                CteBinding::Recursive {
                    query: cte.query.clone(),
                    columns,
                    name: cte.alias.name.value.clone(),
                }
            } else {
                CteBinding::Inline {
                    query: cte.query.clone(),
                    columns,
                }
            };
            bindings.insert(name, binding);
        }
        self.ctes.push(bindings);
        Ok(true)
    }

    fn lookup_cte(&self, name: &str) -> Option<CteBinding> {
        let key = name.to_ascii_lowercase();
        self.ctes
            .iter()
            .rev()
            .find_map(|level| level.get(&key).cloned())
    }

    fn plan_set_expr(&mut self, outer: &Scope<'_>, body: &SetExpr) -> Result<Arc<RelNode>> {
        match body {
            SetExpr::Select(select) => self.plan_select(outer, select, &[]),
            SetExpr::Query(query) => self.plan_query(outer, query),
            SetExpr::Values(values) => self.plan_values(outer, &values.rows),
            SetExpr::SetOperation {
                op,
                set_quantifier,
                left,
                right,
            } => {
                let left = self.plan_set_expr(outer, left)?;
                let right = self.plan_set_expr(outer, right)?;
                let left_attrs = left.attributes();
                if left_attrs.len() != right.attributes().len() {
                    return Err(QuereusError::planning(
                        "set operation operands have different column counts",
                    ));
                }
                let all = matches!(
                    set_quantifier,
                    SetQuantifier::All | SetQuantifier::AllByName
                );
                let kind = match (op, all) {
                    (SetOperator::Union, true) => SetOpKind::UnionAll,
                    (SetOperator::Union, false) => SetOpKind::Union,
                    (SetOperator::Intersect, false) => SetOpKind::Intersect,
                    (SetOperator::Except, false) => SetOpKind::Except,
                    (op, _) => {
                        return Err(QuereusError::planning(format!(
                            "unsupported set operation: {op} {}",
                            if all { "ALL" } else { "" }
                        )))
                    }
                };
                let attributes = left_attrs.iter().map(Attribute::renumbered).collect();
                Ok(RelNode::logical(RelOp::SetOperation {
                    op: kind,
                    left,
                    right,
                    attributes,
                }))
            }
            other => Err(QuereusError::planning(format!(
                "unsupported query body: {other}"
            ))),
        }
    }

    pub(crate) fn plan_values(
        &mut self,
        outer: &Scope<'_>,
        rows: &[Vec<SqlExpr>],
    ) -> Result<Arc<RelNode>> {
        if rows.is_empty() {
            return Err(QuereusError::planning("empty VALUES"));
        }
        let arity = rows[0].len();
        let mut built = Vec::with_capacity(rows.len());
        for row in rows {
            if row.len() != arity {
                return Err(QuereusError::planning(
                    "VALUES rows have different column counts",
                ));
            }
            built.push(
                row.iter()
                    .map(|e| self.build_expr(outer, e))
                    .collect::<Result<Vec<_>>>()?,
            );
        }
        let attributes = (0..arity)
            .map(|i| {
                let ty = built[0][i].result_type();
                Attribute::new(format!("column{}", i + 1), ty)
            })
            .collect();
        Ok(RelNode::logical(RelOp::Values {
            rows: built,
            attributes,
        }))
    }

    /// ORDER BY over a set operation resolves only against the operation's
    /// output columns, by name or ordinal.
    fn sort_set_output(
        &mut self,
        node: Arc<RelNode>,
        order_exprs: &[OrderByExpr],
    ) -> Result<Arc<RelNode>> {
        if order_exprs.is_empty() {
            return Ok(node);
        }
        let attrs = node.attributes();
        let mut keys = Vec::with_capacity(order_exprs.len());
        for item in order_exprs {
            let attr = match &item.expr {
                SqlExpr::Value(AstValue::Number(n, _)) => {
                    let ordinal: usize = n.parse().map_err(|_| {
                        QuereusError::planning(format!("bad ORDER BY ordinal: {n}"))
                    })?;
                    attrs.get(ordinal.wrapping_sub(1)).cloned().ok_or_else(|| {
                        QuereusError::planning(format!("ORDER BY position {ordinal} out of range"))
                    })?
                }
                SqlExpr::Identifier(ident) => attrs
                    .iter()
                    .find(|a| a.name.eq_ignore_ascii_case(&ident.value))
                    .cloned()
                    .ok_or_else(|| {
                        QuereusError::planning(format!("no such column: {}", ident.value))
                    })?,
                other => {
                    return Err(QuereusError::planning(format!(
                        "ORDER BY over a set operation must name an output column: {other}"
                    )))
                }
            };
            keys.push(SortKey {
                expr: ScalarExpr::column(attr.id, attr.name.clone(), attr.ty.clone()),
                desc: item.asc == Some(false),
                nulls_first: item.nulls_first,
            });
        }
        Ok(RelNode::logical(RelOp::Sort { input: node, keys }))
    }

    fn plan_select(
        &mut self,
        outer: &Scope<'_>,
        select: &Select,
        order_exprs: &[OrderByExpr],
    ) -> Result<Arc<RelNode>> {
        // FROM
        let (mut node, from_scope) = self.plan_from(outer, &select.from)?;

        // WHERE
        if let Some(selection) = &select.selection {
            let predicate = self.build_expr(&from_scope, selection)?;
            if predicate.contains_aggregate() {
                return Err(QuereusError::planning("misuse of aggregate in WHERE"));
            }
            node = RelNode::logical(RelOp::Filter {
                input: node,
                predicate,
            });
        }

        // Projection list (pre-aggregation shape).
        let mut projections: Vec<(ScalarExpr, String)> = Vec::new();
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => {
                    let built = self.build_expr(&from_scope, expr)?;
                    let name = match expr {
                        SqlExpr::Identifier(ident) => ident.value.clone(),
                        SqlExpr::CompoundIdentifier(parts) => parts
                            .last()
                            .map(|i| i.value.clone())
                            .unwrap_or_else(|| built.output_name()),
                        _ => built.output_name(),
                    };
                    projections.push((built, name));
                }
                SelectItem::ExprWithAlias { expr, alias } => {
                    let built = self.build_expr(&from_scope, expr)?;
                    projections.push((built, alias.value.clone()));
                }
                SelectItem::Wildcard(_) => {
                    for attr in from_scope.visible_attributes() {
                        projections.push((
                            ScalarExpr::column(attr.id, attr.name.clone(), attr.ty.clone()),
                            attr.name,
                        ));
                    }
                }
                SelectItem::QualifiedWildcard(name, _) => {
                    let qualifier = object_name_str(name);
                    for attr in from_scope.relation_attributes(&qualifier)? {
                        projections.push((
                            ScalarExpr::column(attr.id, attr.name.clone(), attr.ty.clone()),
                            attr.name,
                        ));
                    }
                }
            }
        }
        if projections.is_empty() {
            return Err(QuereusError::planning("empty select list"));
        }

        // GROUP BY keys (expressions, select aliases, or ordinals).
        let group_exprs: Vec<ScalarExpr> = match &select.group_by {
            GroupByExpr::Expressions(exprs, _) => exprs
                .iter()
                .map(|e| self.resolve_output_expr(&from_scope, e, &projections))
                .collect::<Result<Vec<_>>>()?,
            GroupByExpr::All(_) => {
                return Err(QuereusError::planning("GROUP BY ALL is not supported"))
            }
        };

        let having = match &select.having {
            Some(expr) => Some(self.build_expr(&from_scope, expr)?),
            None => None,
        };

        // ORDER BY keys, built against the pre-projection scope so they can
        // take part in aggregate extraction.
        let mut order_keys: Vec<SortKey> = Vec::with_capacity(order_exprs.len());
        for item in order_exprs {
            let expr = self.resolve_output_expr(&from_scope, &item.expr, &projections)?;
            order_keys.push(SortKey {
                expr,
                desc: item.asc == Some(false),
                nulls_first: item.nulls_first,
            });
        }

        // Aggregation.
        let needs_aggregate = !group_exprs.is_empty()
            || projections.iter().any(|(e, _)| e.contains_aggregate())
            || having.as_ref().is_some_and(ScalarExpr::contains_aggregate)
            || order_keys.iter().any(|k| k.expr.contains_aggregate());

        let mut having = having;
        if needs_aggregate {
            let group_by: Vec<(ScalarExpr, Attribute)> = group_exprs
                .into_iter()
                .map(|expr| {
                    let attr = match &expr {
                        ScalarExpr::ColumnRef { attr, name, ty } => Attribute {
                            id: *attr,
                            name: name.clone(),
                            ty: ty.clone(),
                            hidden: false,
                        },
                        other => Attribute::new(other.output_name(), other.result_type()),
                    };
                    (expr, attr)
                })
                .collect();
            let mut aggregates: Vec<AggregateExpr> = Vec::new();

            for (expr, _) in &mut projections {
                *expr = extract_aggregates(expr.clone(), &group_by, &mut aggregates)?;
            }
            if let Some(h) = having.take() {
                having = Some(extract_aggregates(h, &group_by, &mut aggregates)?);
            }
            for key in &mut order_keys {
                key.expr = extract_aggregates(key.expr.clone(), &group_by, &mut aggregates)?;
            }

            node = RelNode::logical(RelOp::Aggregate {
                input: node,
                group_by,
                aggregates,
            });
        } else if let Some(h) = &having {
            if !h.contains_aggregate() {
                return Err(QuereusError::planning("HAVING without GROUP BY"));
            }
        }

        if let Some(predicate) = having {
            node = RelNode::logical(RelOp::Filter {
                input: node,
                predicate,
            });
        }

        // Window functions.
        let has_window = projections.iter().any(|(e, _)| e.contains_window())
            || order_keys.iter().any(|k| k.expr.contains_window());
        if has_window {
            let mut collected: Option<(Vec<ScalarExpr>, Vec<(ScalarExpr, bool)>)> = None;
            let mut functions: Vec<WindowFuncExpr> = Vec::new();
            for (expr, _) in &mut projections {
                *expr = extract_windows(expr.clone(), &mut collected, &mut functions)?;
            }
            for key in &mut order_keys {
                key.expr = extract_windows(key.expr.clone(), &mut collected, &mut functions)?;
            }
            let (partition_by, spec_order) = collected
                .ok_or_else(|| QuereusError::Internal("window extraction found no spec".into()))?;
            node = RelNode::logical(RelOp::Window {
                input: node,
                partition_by,
                order_by: spec_order
                    .into_iter()
                    .map(|(expr, desc)| SortKey {
                        expr,
                        desc,
                        nulls_first: None,
                    })
                    .collect(),
                functions,
            });
        }

        // ORDER BY sits below the projection.
        if !order_keys.is_empty() {
            node = RelNode::logical(RelOp::Sort {
                input: node,
                keys: order_keys,
            });
        }

        // Projection.
        let exprs: Vec<(ScalarExpr, Attribute)> = projections
            .into_iter()
            .map(|(expr, name)| {
                let attr = Attribute::new(name, expr.result_type());
                (expr, attr)
            })
            .collect();
        node = RelNode::logical(RelOp::Project { input: node, exprs });

        // DISTINCT.
        match &select.distinct {
            None => {}
            Some(AstDistinct::Distinct) => {
                node = RelNode::logical(RelOp::Distinct { input: node });
            }
            Some(AstDistinct::On(_)) => {
                return Err(QuereusError::planning("DISTINCT ON is not supported"))
            }
        }

        Ok(node)
    }

    /// Resolve a GROUP BY / ORDER BY item: ordinal, select alias, or plain
    /// expression in the given scope.
    fn resolve_output_expr(
        &mut self,
        scope: &Scope<'_>,
        expr: &SqlExpr,
        projections: &[(ScalarExpr, String)],
    ) -> Result<ScalarExpr> {
        match expr {
            SqlExpr::Value(AstValue::Number(n, _)) => {
                let ordinal: usize = n
                    .parse()
                    .map_err(|_| QuereusError::planning(format!("bad ordinal: {n}")))?;
                projections
                    .get(ordinal.wrapping_sub(1))
                    .map(|(e, _)| e.clone())
                    .ok_or_else(|| {
                        QuereusError::planning(format!("position {ordinal} out of range"))
                    })
            }
            SqlExpr::Identifier(ident) => {
                // A select alias wins over a source column of the same name
                // only when no source column matches.
                match scope.resolve(None, &ident.value) {
                    Ok(attr) => Ok(ScalarExpr::column(attr.id, attr.name, attr.ty)),
                    Err(_) => projections
                        .iter()
                        .find(|(_, name)| name.eq_ignore_ascii_case(&ident.value))
                        .map(|(e, _)| e.clone())
                        .ok_or_else(|| {
                            QuereusError::planning(format!("no such column: {}", ident.value))
                        }),
                }
            }
            other => self.build_expr(scope, other),
        }
    }

    /// Expressions that must not read rows: LIMIT/OFFSET counts.
    fn build_row_independent(&mut self, expr: &SqlExpr) -> Result<ScalarExpr> {
        let scope = Scope::new();
        let built = self.build_expr(&scope, expr)?;
        if !built.is_row_independent() {
            return Err(QuereusError::planning(
                "LIMIT/OFFSET must not reference columns",
            ));
        }
        Ok(built)
    }

    fn plan_from<'a>(
        &mut self,
        outer: &'a Scope<'a>,
        from: &[TableWithJoins],
    ) -> Result<(Arc<RelNode>, Scope<'a>)> {
        let mut scope = Scope::child(outer);
        if from.is_empty() {
            // SELECT without FROM: a single empty row.
            let node = RelNode::logical(RelOp::Values {
                rows: vec![Vec::new()],
                attributes: Vec::new(),
            });
            return Ok((node, scope));
        }

        let mut node: Option<Arc<RelNode>> = None;
        for twj in from {
            let entry = self.plan_table_with_joins(outer, &mut scope, twj)?;
            node = Some(match node {
                None => entry,
                // Comma-separated FROM entries form a cross join.
                Some(left) => RelNode::logical(RelOp::Join {
                    left,
                    right: entry,
                    kind: JoinKind::Cross,
                    condition: None,
                }),
            });
        }
        let node =
            node.ok_or_else(|| QuereusError::Internal("empty FROM after planning".into()))?;
        Ok((node, scope))
    }

    fn plan_table_with_joins<'a>(
        &mut self,
        outer: &'a Scope<'a>,
        scope: &mut Scope<'a>,
        twj: &TableWithJoins,
    ) -> Result<Arc<RelNode>> {
        let mut node = self.plan_table_factor(outer, scope, &twj.relation)?;
        for join in &twj.joins {
            node = self.plan_join(outer, scope, node, join)?;
        }
        Ok(node)
    }

    fn plan_join<'a>(
        &mut self,
        outer: &'a Scope<'a>,
        scope: &mut Scope<'a>,
        left: Arc<RelNode>,
        join: &AstJoin,
    ) -> Result<Arc<RelNode>> {
        let left_attrs = left.attributes();
        let right = self.plan_table_factor(outer, scope, &join.relation)?;
        let right_attrs = right.attributes();

        let (kind, constraint) = match &join.join_operator {
            JoinOperator::Inner(c) => (JoinKind::Inner, Some(c)),
            JoinOperator::LeftOuter(c) => (JoinKind::Left, Some(c)),
            JoinOperator::RightOuter(c) => (JoinKind::Right, Some(c)),
            JoinOperator::FullOuter(c) => (JoinKind::Full, Some(c)),
            JoinOperator::CrossJoin => (JoinKind::Cross, None),
            other => {
                return Err(QuereusError::planning(format!(
                    "unsupported join type: {other:?}"
                )))
            }
        };

        let condition = match constraint {
            None | Some(JoinConstraint::None) => None,
            Some(JoinConstraint::On(expr)) => Some(self.build_expr(scope, expr)?),
            Some(JoinConstraint::Using(columns)) => {
                let mut condition: Option<ScalarExpr> = None;
                for ident in columns {
                    let lhs = left_attrs
                        .iter()
                        .find(|a| a.name.eq_ignore_ascii_case(&ident.value))
                        .ok_or_else(|| {
                            QuereusError::planning(format!("no such column: {}", ident.value))
                        })?;
                    let rhs = right_attrs
                        .iter()
                        .find(|a| a.name.eq_ignore_ascii_case(&ident.value))
                        .ok_or_else(|| {
                            QuereusError::planning(format!("no such column: {}", ident.value))
                        })?;
                    let eq = ScalarExpr::BinaryOp {
                        op: crate::plan::BinaryOp::Eq,
                        left: Box::new(ScalarExpr::column(
                            lhs.id,
                            lhs.name.clone(),
                            lhs.ty.clone(),
                        )),
                        right: Box::new(ScalarExpr::column(
                            rhs.id,
                            rhs.name.clone(),
                            rhs.ty.clone(),
                        )),
                    };
                    condition = Some(match condition {
                        None => eq,
                        Some(acc) => ScalarExpr::BinaryOp {
                            op: crate::plan::BinaryOp::And,
                            left: Box::new(acc),
                            right: Box::new(eq),
                        },
                    });
                }
                condition
            }
            Some(JoinConstraint::Natural) => {
                return Err(QuereusError::planning("NATURAL JOIN is not supported"))
            }
        };

        Ok(RelNode::logical(RelOp::Join {
            left,
            right,
            kind,
            condition,
        }))
    }

    fn plan_table_factor<'a>(
        &mut self,
        outer: &'a Scope<'a>,
        scope: &mut Scope<'a>,
        factor: &TableFactor,
    ) -> Result<Arc<RelNode>> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let table_name = object_name_str(name);
                let alias_name = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| table_name.clone());

                if let Some(binding) = self.lookup_cte(&table_name) {
                    let node = self.instantiate_cte(outer, binding)?;
                    scope.add_relation(alias_name, node.attributes());
                    return Ok(node);
                }

                if let Some(view) = self.catalog.get_view(&table_name) {
                    let node = self.instantiate_view(outer, &view)?;
                    scope.add_relation(alias_name, node.attributes());
                    return Ok(node);
                }

                let table = self.catalog.get_table(&table_name)?;
                let attributes = table_attributes(&table);
                scope.add_relation(alias_name.clone(), attributes.clone());
                let reference = RelNode::logical(RelOp::TableReference {
                    table,
                    alias: alias_name,
                    attributes,
                });
                Ok(RelNode::logical(RelOp::Retrieve { input: reference }))
            }
            TableFactor::Derived {
                subquery, alias, ..
            } => {
                let node = self.plan_query(outer, subquery)?;
                let alias_name = alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| "subquery".to_string());
                let mut attributes = node.attributes();
                if let Some(alias) = alias {
                    for (attr, ident) in attributes.iter_mut().zip(&alias.columns) {
                        attr.name = ident.value.clone();
                    }
                }
                scope.add_relation(alias_name, attributes);
                Ok(node)
            }
            other => Err(QuereusError::planning(format!(
                "unsupported table factor: {other}"
            ))),
        }
    }

    fn instantiate_view(
        &mut self,
        outer: &Scope<'_>,
        view: &crate::schema::ViewSchema,
    ) -> Result<Arc<RelNode>> {
        let query = super::parse_single_query(&view.sql)?;
        let node = self.plan_query(outer, &query)?;
        Ok(rename_columns(node, &view.columns))
    }

    fn instantiate_cte(
        &mut self,
        outer: &Scope<'_>,
        binding: CteBinding,
    ) -> Result<Arc<RelNode>> {
        match binding {
            CteBinding::Inline { query, columns } => {
                let node = self.plan_query(outer, &query)?;
                Ok(rename_columns(node, &columns))
            }
            CteBinding::Working { key, attributes } => {
                // Fresh attributes per reference; rows map positionally.
                let attributes = attributes.iter().map(Attribute::renumbered).collect();
                Ok(RelNode::logical(RelOp::CteRef {
                    name: key,
                    attributes,
                }))
            }
            CteBinding::Recursive {
                query,
                columns,
                name,
            } => self.plan_recursive_cte(outer, &query, &columns, &name),
        }
    }

    fn plan_recursive_cte(
        &mut self,
        outer: &Scope<'_>,
        query: &Query,
        columns: &[String],
        name: &str,
    ) -> Result<Arc<RelNode>> {
        let SetExpr::SetOperation {
            op: SetOperator::Union,
            set_quantifier,
            left,
            right,
        } = query.body.as_ref()
        else {
            return Err(QuereusError::planning(format!(
                "recursive CTE {name} must be base UNION [ALL] recursive"
            )));
        };
        if query_mentions_table_set_expr(left, &name.to_ascii_lowercase()) {
            return Err(QuereusError::planning(format!(
                "recursive CTE {name} may reference itself only in the recursive branch"
            )));
        }
        let union_all = matches!(set_quantifier, SetQuantifier::All);

        let base = self.plan_set_expr(outer, left)?;
        let base_attrs = base.attributes();

        // The CTE's own attribute list: declared column names over the base
        // branch's types.
        let attributes: Vec<Attribute> = base_attrs
            .iter()
            .enumerate()
            .map(|(i, attr)| {
                let name = columns.get(i).cloned().unwrap_or_else(|| attr.name.clone());
                Attribute::new(name, attr.ty.clone())
            })
            .collect();

        let key = self.fresh_working_key(name);
        let mut level = HashMap::new();
        level.insert(
            name.to_ascii_lowercase(),
            CteBinding::Working {
                key: key.clone(),
                attributes: attributes.clone(),
            },
        );
        self.ctes.push(level);
        let recursive = self.plan_set_expr(outer, right);
        self.ctes.pop();
        let recursive = recursive?;

        if recursive.attributes().len() != attributes.len() {
            return Err(QuereusError::planning(format!(
                "recursive branch of {name} has a different column count"
            )));
        }

        Ok(RelNode::logical(RelOp::RecursiveCte {
            name: key,
            attributes,
            base,
            recursive,
            union_all,
        }))
    }
}

/// Rename a node's output columns by wrapping it in a projection with the
/// declared names. Used by views and CTE column lists.
fn rename_columns(node: Arc<RelNode>, columns: &[String]) -> Arc<RelNode> {
    let attrs = node.attributes();
    let exprs: Vec<(ScalarExpr, Attribute)> = attrs
        .iter()
        .enumerate()
        .map(|(i, attr)| {
            let name = columns.get(i).cloned().unwrap_or_else(|| attr.name.clone());
            (
                ScalarExpr::column(attr.id, attr.name.clone(), attr.ty.clone()),
                Attribute::new(name, attr.ty.clone()),
            )
        })
        .collect();
    RelNode::logical(RelOp::Project { input: node, exprs })
}

/// Replace group-key matches and aggregate calls with column references,
/// collecting new aggregates as they appear.
fn extract_aggregates(
    expr: ScalarExpr,
    group_by: &[(ScalarExpr, Attribute)],
    aggregates: &mut Vec<AggregateExpr>,
) -> Result<ScalarExpr> {
    expr.rewrite(&mut |node| {
        for (gexpr, gattr) in group_by {
            if node.structurally_equal(gexpr) {
                return Ok(RewriteAction::Replace(ScalarExpr::column(
                    gattr.id,
                    gattr.name.clone(),
                    gattr.ty.clone(),
                )));
            }
        }
        if let ScalarExpr::AggregateFunctionCall { name, args } = &node {
            if args.iter().any(ScalarExpr::contains_aggregate) {
                return Err(QuereusError::planning(format!(
                    "nested aggregate in {name}()"
                )));
            }
            for existing in aggregates.iter() {
                if existing.function.eq_ignore_ascii_case(name)
                    && existing.args.len() == args.len()
                    && existing
                        .args
                        .iter()
                        .zip(args)
                        .all(|(a, b)| a.structurally_equal(b))
                {
                    return Ok(RewriteAction::Replace(ScalarExpr::column(
                        existing.attr.id,
                        existing.attr.name.clone(),
                        existing.attr.ty.clone(),
                    )));
                }
            }
            let attr = Attribute::new(node.output_name(), node.result_type());
            aggregates.push(AggregateExpr {
                function: name.clone(),
                args: args.clone(),
                attr: attr.clone(),
            });
            return Ok(RewriteAction::Replace(ScalarExpr::column(
                attr.id,
                attr.name,
                attr.ty,
            )));
        }
        Ok(RewriteAction::Descend(node))
    })
}

/// Replace window calls with column references; all calls in one query level
/// must share a single window specification.
fn extract_windows(
    expr: ScalarExpr,
    collected: &mut Option<(Vec<ScalarExpr>, Vec<(ScalarExpr, bool)>)>,
    functions: &mut Vec<WindowFuncExpr>,
) -> Result<ScalarExpr> {
    expr.rewrite(&mut |node| {
        if let ScalarExpr::WindowFunctionCall {
            name,
            partition_by,
            order_by,
        } = &node
        {
            match collected {
                None => {
                    *collected = Some((partition_by.clone(), order_by.clone()));
                }
                Some((have_partition, have_order)) => {
                    let same = have_partition.len() == partition_by.len()
                        && have_partition
                            .iter()
                            .zip(partition_by)
                            .all(|(a, b)| a.structurally_equal(b))
                        && have_order.len() == order_by.len()
                        && have_order
                            .iter()
                            .zip(order_by)
                            .all(|((a, ad), (b, bd))| ad == bd && a.structurally_equal(b));
                    if !same {
                        return Err(QuereusError::planning(
                            "multiple window specifications in one query are not supported",
                        ));
                    }
                }
            }
            let attr = Attribute::new(name.clone(), ScalarType::integer());
            functions.push(WindowFuncExpr {
                function: name.clone(),
                attr: attr.clone(),
            });
            return Ok(RewriteAction::Replace(ScalarExpr::column(
                attr.id,
                attr.name,
                attr.ty,
            )));
        }
        Ok(RewriteAction::Descend(node))
    })
}

/// Does any FROM clause in the query's body reference `name`?
fn query_mentions_table(query: &Query, name: &str) -> bool {
    query_mentions_table_set_expr(&query.body, name)
}

fn query_mentions_table_set_expr(body: &SetExpr, name: &str) -> bool {
    match body {
        SetExpr::Select(select) => select.from.iter().any(|twj| {
            table_factor_mentions(&twj.relation, name)
                || twj
                    .joins
                    .iter()
                    .any(|j| table_factor_mentions(&j.relation, name))
        }),
        SetExpr::Query(query) => query_mentions_table(query, name),
        SetExpr::SetOperation { left, right, .. } => {
            query_mentions_table_set_expr(left, name)
                || query_mentions_table_set_expr(right, name)
        }
        _ => false,
    }
}

fn table_factor_mentions(factor: &TableFactor, name: &str) -> bool {
    match factor {
        TableFactor::Table { name: table, .. } => {
            object_name_str(table).eq_ignore_ascii_case(name)
        }
        TableFactor::Derived { subquery, .. } => query_mentions_table(subquery, name),
        _ => false,
    }
}

