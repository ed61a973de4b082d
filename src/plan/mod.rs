//! Plan representation: scalar expressions, relational operators, physical
//! properties, and statement blocks.

pub mod node;
pub mod physical;
pub mod scalar;
pub mod stmt;

pub use node::{
    table_attributes, AggregateExpr, JoinKind, PushedConstraint, RelNode, RelOp, ScanFilterInfo,
    SetOpKind, SortKey, WindowFuncExpr,
};
pub use physical::{AttrOrdering, PhysicalProperties};
pub use scalar::{BinaryOp, ParamRef, RewriteAction, ScalarExpr, UnaryOp};
pub use stmt::{
    Block, DdlStatement, ParamShape, PragmaStatement, SchemaVerb, StatementPlan, TxStatement,
};

use std::fmt::Write as _;

/// Render a plan tree as indented lines, one node per line. Used by EXPLAIN.
pub fn render_plan(root: &RelNode) -> Vec<String> {
    let mut out = Vec::new();
    render_into(root, 0, &mut out);
    out
}

fn render_into(node: &RelNode, depth: usize, out: &mut Vec<String>) {
    let mut line = String::new();
    for _ in 0..depth {
        line.push_str("  ");
    }
    line.push_str(node.operator_name());
    match &node.op {
        RelOp::TableReference { table, alias, .. } | RelOp::TableScan { table, alias, .. } => {
            let _ = write!(line, " {}", table.name);
            if !alias.is_empty() && !alias.eq_ignore_ascii_case(&table.name) {
                let _ = write!(line, " AS {alias}");
            }
        }
        RelOp::SetOperation { op, .. } => {
            let _ = write!(line, " {op:?}");
        }
        RelOp::Join { kind, .. } | RelOp::BloomJoin { kind, .. } => {
            let _ = write!(line, " {kind:?}");
        }
        RelOp::RecursiveCte { name, .. } | RelOp::CteRef { name, .. } => {
            let _ = write!(line, " {name}");
        }
        _ => {}
    }
    if let RelOp::TableScan { filter_info, .. } = &node.op {
        if let Some(explains) = &filter_info.explains {
            let _ = write!(line, " ({explains})");
        }
    }
    let _ = write!(line, "  [rows≈{:.0}]", node.est_rows);
    out.push(line);
    for child in node.relations() {
        render_into(&child, depth + 1, out);
    }
}
