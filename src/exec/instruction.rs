//! The compiled program representation: each plan node becomes one
//! `Instruction` whose `run` consumes the outputs of its parameter
//! instructions and yields a scalar, a row, or an async row stream.
//! Sub-plans that must re-execute per row (predicates, projections, inner
//! join sides, recursive branches) are compiled into sub-programs — the
//! call-factory pattern.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{QuereusError, Result};
use crate::types::SqlValue;
use crate::vtab::{Row, RowStream};

use super::context::RuntimeContext;

pub type InstrId = usize;

/// An instruction output.
pub enum Output {
    Value(SqlValue),
    Row(Row),
    Stream(RowStream),
}

impl Output {
    pub fn kind(&self) -> &'static str {
        match self {
            Output::Value(_) => "value",
            Output::Row(_) => "row",
            Output::Stream(_) => "stream",
        }
    }

    pub fn into_value(self) -> Result<SqlValue> {
        match self {
            Output::Value(v) => Ok(v),
            other => Err(QuereusError::Internal(format!(
                "expected a scalar output, got {}",
                other.kind()
            ))),
        }
    }

    pub fn into_stream(self) -> Result<RowStream> {
        match self {
            Output::Stream(s) => Ok(s),
            other => Err(QuereusError::Internal(format!(
                "expected a row stream, got {}",
                other.kind()
            ))),
        }
    }
}

pub type RunFn = Arc<
    dyn Fn(Arc<RuntimeContext>, Vec<Output>, Vec<Arc<Program>>) -> BoxFuture<'static, Result<Output>>
        + Send
        + Sync,
>;

pub struct Instruction {
    /// Outputs of these instructions arrive as `run` arguments, in order.
    pub params: Vec<InstrId>,
    /// Sub-programs the instruction re-executes on demand.
    pub sub_programs: Vec<Arc<Program>>,
    pub run: RunFn,
    pub note: String,
}

/// A linearized program: instructions in dependency order, children before
/// parents, with the statement's result in the root slot.
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub root: InstrId,
}

/// Accumulates instructions during emission.
#[derive(Default)]
pub struct ProgramBuilder {
    instructions: Vec<Instruction>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instruction: Instruction) -> InstrId {
        self.instructions.push(instruction);
        self.instructions.len() - 1
    }

    pub fn emit(
        &mut self,
        note: impl Into<String>,
        params: Vec<InstrId>,
        sub_programs: Vec<Arc<Program>>,
        run: RunFn,
    ) -> InstrId {
        self.push(Instruction {
            params,
            sub_programs,
            run,
            note: note.into(),
        })
    }

    pub fn finish(self, root: InstrId) -> Arc<Program> {
        Arc::new(Program {
            instructions: self.instructions,
            root,
        })
    }
}
