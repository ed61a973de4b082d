//! The scheduler drives a compiled program: each instruction runs exactly
//! once per program execution, in linearized order, with its parameters'
//! outputs moved out of their result slots. Streams stay lazy; only the
//! consumer that receives a stream pulls it.

use std::sync::Arc;

use tracing::trace;

use crate::error::{QuereusError, Result};

use super::context::RuntimeContext;
use super::instruction::{Output, Program};

/// Observation hooks for program execution. `EXPLAIN`-style tooling and
/// tests subscribe through this.
pub trait Tracer: Send + Sync {
    fn on_instruction(&self, _note: &str, _output_kind: &str) {}
    fn on_row(&self, _note: &str) {}
    fn on_error(&self, _note: &str, _error: &QuereusError) {}
    fn on_sub_program(&self, _parent: &str, _instructions: usize) {}
}

/// Tracer that records instruction notes, for tests and EXPLAIN rendering.
#[derive(Default)]
pub struct CollectingTracer {
    pub events: parking_lot::Mutex<Vec<String>>,
}

impl Tracer for CollectingTracer {
    fn on_instruction(&self, note: &str, output_kind: &str) {
        self.events.lock().push(format!("{note} -> {output_kind}"));
    }

    fn on_row(&self, note: &str) {
        self.events.lock().push(format!("{note} row"));
    }

    fn on_error(&self, note: &str, error: &QuereusError) {
        self.events.lock().push(format!("{note} error: {error}"));
    }

    fn on_sub_program(&self, parent: &str, instructions: usize) {
        self.events
            .lock()
            .push(format!("{parent} sub-program ({instructions})"));
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Execute a program against a context, returning the root output.
    pub async fn run(program: &Arc<Program>, ctx: &Arc<RuntimeContext>) -> Result<Output> {
        let mut slots: Vec<Option<Output>> = Vec::with_capacity(program.instructions.len());
        for _ in 0..program.instructions.len() {
            slots.push(None);
        }

        for (index, instruction) in program.instructions.iter().enumerate() {
            ctx.check_cancelled()?;

            let mut args = Vec::with_capacity(instruction.params.len());
            for &param in &instruction.params {
                let arg = slots
                    .get_mut(param)
                    .and_then(Option::take)
                    .ok_or_else(|| {
                        QuereusError::Internal(format!(
                            "instruction {index} consumed empty slot {param}"
                        ))
                    })?;
                args.push(arg);
            }

            if let Some(tracer) = &ctx.tracer {
                for sub in &instruction.sub_programs {
                    tracer.on_sub_program(&instruction.note, sub.instructions.len());
                }
            }

            let result = (instruction.run)(
                Arc::clone(ctx),
                args,
                instruction.sub_programs.clone(),
            )
            .await;

            match result {
                Ok(output) => {
                    trace!(note = %instruction.note, kind = output.kind(), "instruction");
                    if let Some(tracer) = &ctx.tracer {
                        tracer.on_instruction(&instruction.note, output.kind());
                    }
                    slots[index] = Some(output);
                }
                Err(error) => {
                    if let Some(tracer) = &ctx.tracer {
                        tracer.on_error(&instruction.note, &error);
                    }
                    return Err(error);
                }
            }
        }

        slots
            .get_mut(program.root)
            .and_then(Option::take)
            .ok_or_else(|| QuereusError::Internal("program root slot empty".into()))
    }
}
