//! Heuristic cost constants. The model is row count times a per-operator
//! multiplier, used only for local tie-breaks (e.g. whether a join build
//! side is small enough to hash); it is not a join-order enumerator.

/// Cardinality assumed when a module reports `rows: None` and the request
/// carried no estimate.
pub const DEFAULT_UNKNOWN_ROWS: f64 = 1_000_000.0;

/// Largest estimated build side that still becomes a hash join.
pub const HASH_BUILD_MAX_ROWS: f64 = 100_000.0;

/// Default row cache spill threshold.
pub const DEFAULT_CACHE_THRESHOLD: usize = 10_000;

pub const FILTER_ROW_COST: f64 = 1.0;
pub const SORT_ROW_COST: f64 = 4.0;
pub const HASH_ROW_COST: f64 = 2.0;
pub const LOOP_JOIN_ROW_COST: f64 = 1.5;

pub fn sort_cost(rows: f64) -> f64 {
    let n = rows.max(1.0);
    n * n.log2().max(1.0) * SORT_ROW_COST
}

pub fn hash_join_cost(probe_rows: f64, build_rows: f64) -> f64 {
    (probe_rows + build_rows) * HASH_ROW_COST
}

pub fn loop_join_cost(outer_rows: f64, inner_rows: f64) -> f64 {
    outer_rows * inner_rows.max(1.0) * LOOP_JOIN_ROW_COST
}
