//! AST expression translation: `sqlparser` expressions into `ScalarExpr`
//! trees, resolving columns through the scope chain and functions through
//! the registry.

use sqlparser::ast::{
    BinaryOperator as SqlBinaryOperator, DuplicateTreatment, Expr as SqlExpr, Function,
    FunctionArg, FunctionArgExpr, FunctionArguments, UnaryOperator as SqlUnaryOperator,
    Value as AstValue, WindowType,
};

use crate::error::{QuereusError, Result};
use crate::plan::{BinaryOp, ParamRef, ScalarExpr, UnaryOp};
use crate::schema::FunctionKind;
use crate::types::{Affinity, Collation, SqlValue};

use super::scope::Scope;
use super::{object_name_str, StatementBuilder};

impl StatementBuilder {
    pub(crate) fn build_expr(&mut self, scope: &Scope<'_>, expr: &SqlExpr) -> Result<ScalarExpr> {
        match expr {
            SqlExpr::Identifier(ident) => {
                let attr = scope.resolve(None, &ident.value)?;
                Ok(ScalarExpr::column(attr.id, attr.name, attr.ty))
            }
            SqlExpr::CompoundIdentifier(parts) => {
                if parts.len() < 2 {
                    return Err(QuereusError::planning("empty compound identifier"));
                }
                let column = &parts[parts.len() - 1].value;
                let qualifier = &parts[parts.len() - 2].value;
                let attr = scope.resolve(Some(qualifier), column)?;
                Ok(ScalarExpr::column(attr.id, attr.name, attr.ty))
            }
            SqlExpr::Value(value) => self.build_literal(value),
            SqlExpr::Nested(inner) => self.build_expr(scope, inner),
            SqlExpr::BinaryOp { left, op, right } => {
                let op = translate_binary_op(op)?;
                Ok(ScalarExpr::BinaryOp {
                    op,
                    left: Box::new(self.build_expr(scope, left)?),
                    right: Box::new(self.build_expr(scope, right)?),
                })
            }
            SqlExpr::UnaryOp { op, expr } => {
                let op = match op {
                    SqlUnaryOperator::Plus => UnaryOp::Plus,
                    SqlUnaryOperator::Minus => UnaryOp::Negate,
                    SqlUnaryOperator::Not => UnaryOp::Not,
                    other => {
                        return Err(QuereusError::planning(format!(
                            "unsupported unary operator: {other}"
                        )))
                    }
                };
                Ok(ScalarExpr::UnaryOp {
                    op,
                    operand: Box::new(self.build_expr(scope, expr)?),
                })
            }
            SqlExpr::Cast {
                expr, data_type, ..
            } => Ok(ScalarExpr::Cast {
                operand: Box::new(self.build_expr(scope, expr)?),
                affinity: Affinity::from_type_name(&data_type.to_string()),
            }),
            SqlExpr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                let operand = match operand {
                    Some(op) => Some(Box::new(self.build_expr(scope, op)?)),
                    None => None,
                };
                let whens = conditions
                    .iter()
                    .zip(results.iter())
                    .map(|(c, r)| Ok((self.build_expr(scope, c)?, self.build_expr(scope, r)?)))
                    .collect::<Result<Vec<_>>>()?;
                let else_expr = match else_result {
                    Some(e) => Some(Box::new(self.build_expr(scope, e)?)),
                    None => None,
                };
                Ok(ScalarExpr::Case {
                    operand,
                    whens,
                    else_expr,
                })
            }
            SqlExpr::Between {
                expr,
                negated,
                low,
                high,
            } => Ok(ScalarExpr::Between {
                operand: Box::new(self.build_expr(scope, expr)?),
                low: Box::new(self.build_expr(scope, low)?),
                high: Box::new(self.build_expr(scope, high)?),
                negated: *negated,
            }),
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => Ok(ScalarExpr::InList {
                operand: Box::new(self.build_expr(scope, expr)?),
                items: list
                    .iter()
                    .map(|e| self.build_expr(scope, e))
                    .collect::<Result<Vec<_>>>()?,
                negated: *negated,
            }),
            SqlExpr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let operand = Box::new(self.build_expr(scope, expr)?);
                let plan = self.plan_subquery(scope, subquery)?;
                if plan.attributes().len() != 1 {
                    return Err(QuereusError::planning(
                        "IN subquery must return exactly one column",
                    ));
                }
                Ok(ScalarExpr::InSubquery {
                    operand,
                    subquery: plan,
                    negated: *negated,
                })
            }
            SqlExpr::Subquery(query) => {
                let plan = self.plan_subquery(scope, query)?;
                if plan.attributes().len() != 1 {
                    return Err(QuereusError::planning(
                        "scalar subquery must return exactly one column",
                    ));
                }
                Ok(ScalarExpr::ScalarSubquery(plan))
            }
            SqlExpr::Exists { subquery, negated } => Ok(ScalarExpr::Exists {
                subquery: self.plan_subquery(scope, subquery)?,
                negated: *negated,
            }),
            SqlExpr::IsNull(inner) => Ok(ScalarExpr::IsNull {
                operand: Box::new(self.build_expr(scope, inner)?),
                negated: false,
            }),
            SqlExpr::IsNotNull(inner) => Ok(ScalarExpr::IsNull {
                operand: Box::new(self.build_expr(scope, inner)?),
                negated: true,
            }),
            SqlExpr::Like {
                negated,
                expr,
                pattern,
                escape_char,
                ..
            } => Ok(ScalarExpr::Like {
                operand: Box::new(self.build_expr(scope, expr)?),
                pattern: Box::new(self.build_expr(scope, pattern)?),
                escape: escape_char.as_ref().and_then(|s| s.chars().next()),
                negated: *negated,
            }),
            SqlExpr::Collate { expr, collation } => Ok(ScalarExpr::Collate {
                operand: Box::new(self.build_expr(scope, expr)?),
                collation: Collation::parse(&object_name_str(collation))?,
            }),
            SqlExpr::Function(func) => self.build_function(scope, func),
            other => Err(QuereusError::planning(format!(
                "unsupported expression: {other}"
            ))),
        }
    }

    fn build_literal(&mut self, value: &AstValue) -> Result<ScalarExpr> {
        Ok(match value {
            AstValue::Number(text, _) => match text.parse::<i64>() {
                Ok(i) => ScalarExpr::Literal(SqlValue::Integer(i)),
                Err(_) => text
                    .parse::<f64>()
                    .map(|f| ScalarExpr::Literal(SqlValue::Real(f)))
                    .map_err(|_| QuereusError::Parse(format!("malformed number: {text}")))?,
            },
            AstValue::SingleQuotedString(s) | AstValue::DoubleQuotedString(s) => {
                ScalarExpr::Literal(SqlValue::Text(s.clone()))
            }
            AstValue::HexStringLiteral(hex) => {
                let mut bytes = Vec::with_capacity(hex.len() / 2);
                let chars: Vec<char> = hex.chars().collect();
                for pair in chars.chunks(2) {
                    let byte_text: String = pair.iter().collect();
                    let byte = u8::from_str_radix(&byte_text, 16).map_err(|_| {
                        QuereusError::Parse(format!("malformed blob literal: x'{hex}'"))
                    })?;
                    bytes.push(byte);
                }
                ScalarExpr::Literal(SqlValue::Blob(bytes))
            }
            AstValue::Boolean(b) => ScalarExpr::Literal(SqlValue::from(*b)),
            AstValue::Null => ScalarExpr::Literal(SqlValue::Null),
            AstValue::Placeholder(text) => ScalarExpr::Parameter(self.note_placeholder(text)?),
            other => {
                return Err(QuereusError::planning(format!(
                    "unsupported literal: {other}"
                )))
            }
        })
    }

    /// Record a parameter occurrence on the enclosing block and return its
    /// reference. `?` takes the next slot, `?N` a specific one, `:name` /
    /// `@name` / `$name` a named one.
    pub(crate) fn note_placeholder(&mut self, text: &str) -> Result<ParamRef> {
        if text == "?" {
            self.param_auto += 1;
            self.params.note_positional(self.param_auto);
            return Ok(ParamRef::Positional(self.param_auto));
        }
        if let Some(rest) = text.strip_prefix('?') {
            let index: usize = rest
                .parse()
                .map_err(|_| QuereusError::Parse(format!("malformed parameter: {text}")))?;
            if index == 0 {
                return Err(QuereusError::Parse("parameter index must be >= 1".into()));
            }
            self.params.note_positional(index);
            return Ok(ParamRef::Positional(index));
        }
        for prefix in [':', '@', '$'] {
            if let Some(name) = text.strip_prefix(prefix) {
                self.params.note_named(name);
                return Ok(ParamRef::Named(name.to_string()));
            }
        }
        Err(QuereusError::Parse(format!(
            "malformed parameter: {text}"
        )))
    }

    fn build_function(&mut self, scope: &Scope<'_>, func: &Function) -> Result<ScalarExpr> {
        let name = object_name_str(&func.name);
        let mut args = Vec::new();
        let mut star = false;
        match &func.args {
            FunctionArguments::None => {}
            FunctionArguments::Subquery(_) => {
                return Err(QuereusError::planning(format!(
                    "subquery arguments to {name} are not supported"
                )))
            }
            FunctionArguments::List(list) => {
                if matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct)) {
                    return Err(QuereusError::planning(format!(
                        "DISTINCT aggregates are not supported: {name}"
                    )));
                }
                for arg in &list.args {
                    match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => {
                            args.push(self.build_expr(scope, e)?);
                        }
                        FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => star = true,
                        other => {
                            return Err(QuereusError::planning(format!(
                                "unsupported function argument: {other}"
                            )))
                        }
                    }
                }
            }
        }
        if star && !args.is_empty() {
            return Err(QuereusError::planning(format!(
                "cannot mix * with arguments in {name}()"
            )));
        }
        let arity = args.len();
        let resolved = self.catalog.functions().resolve(&name, arity)?;

        if let Some(over) = &func.over {
            if resolved.kind() != FunctionKind::Window {
                return Err(QuereusError::planning(format!(
                    "{name} may not be used as a window function"
                )));
            }
            let spec = match over {
                WindowType::WindowSpec(spec) => spec,
                WindowType::NamedWindow(ident) => {
                    return Err(QuereusError::planning(format!(
                        "named window {ident} is not supported"
                    )))
                }
            };
            let partition_by = spec
                .partition_by
                .iter()
                .map(|e| self.build_expr(scope, e))
                .collect::<Result<Vec<_>>>()?;
            let order_by = spec
                .order_by
                .iter()
                .map(|o| {
                    Ok((
                        self.build_expr(scope, &o.expr)?,
                        o.asc == Some(false),
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(ScalarExpr::WindowFunctionCall {
                name,
                partition_by,
                order_by,
            });
        }

        match resolved.kind() {
            FunctionKind::Scalar => Ok(ScalarExpr::ScalarFunctionCall { name, args }),
            FunctionKind::Aggregate => Ok(ScalarExpr::AggregateFunctionCall { name, args }),
            FunctionKind::Window => Err(QuereusError::planning(format!(
                "window function {name} requires an OVER clause"
            ))),
        }
    }
}

fn translate_binary_op(op: &SqlBinaryOperator) -> Result<BinaryOp> {
    Ok(match op {
        SqlBinaryOperator::Plus => BinaryOp::Add,
        SqlBinaryOperator::Minus => BinaryOp::Subtract,
        SqlBinaryOperator::Multiply => BinaryOp::Multiply,
        SqlBinaryOperator::Divide => BinaryOp::Divide,
        SqlBinaryOperator::Modulo => BinaryOp::Modulo,
        SqlBinaryOperator::StringConcat => BinaryOp::Concat,
        SqlBinaryOperator::Eq => BinaryOp::Eq,
        SqlBinaryOperator::NotEq => BinaryOp::NotEq,
        SqlBinaryOperator::Lt => BinaryOp::Lt,
        SqlBinaryOperator::LtEq => BinaryOp::LtEq,
        SqlBinaryOperator::Gt => BinaryOp::Gt,
        SqlBinaryOperator::GtEq => BinaryOp::GtEq,
        SqlBinaryOperator::And => BinaryOp::And,
        SqlBinaryOperator::Or => BinaryOp::Or,
        other => {
            return Err(QuereusError::planning(format!(
                "unsupported operator: {other}"
            )))
        }
    })
}
