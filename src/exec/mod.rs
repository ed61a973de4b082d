//! Execution runtime: instruction compilation, the scheduler, scalar and
//! relational emitters, and the per-statement runtime context.

pub mod context;
pub mod emit;
pub mod expr;
pub mod instruction;
pub mod scheduler;

pub use context::{
    Cancellation, ConnectionMap, ParamBindings, ReplayOp, RowDescriptor, RuntimeContext,
};
pub use emit::{compile_rel, compile_rel_program};
pub use expr::{compile_expr_program, eval_value};
pub use instruction::{InstrId, Instruction, Output, Program, ProgramBuilder};
pub use scheduler::{CollectingTracer, Scheduler, Tracer};
