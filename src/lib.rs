// Quereus - embeddable SQL engine over pluggable virtual tables
// Core library module

pub mod error;
pub mod exec;
pub mod memory;
pub mod optimizer;
pub mod plan;
pub mod planner;
pub mod schema;
pub mod session;
pub mod types;
pub mod vtab;

pub use error::{QuereusError, Result};
pub use exec::{CollectingTracer, ParamBindings, Tracer};
pub use session::{Database, ExecOutcome, Prepared, QueryResult, Session};
pub use types::SqlValue;

/// Install a `RUST_LOG`-driven tracing subscriber, for embedders and test
/// runs. Fails if a global subscriber is already set.
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| QuereusError::Misuse(e.to_string()))
}
