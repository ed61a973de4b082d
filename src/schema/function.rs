//! Function registry. Functions are looked up by `(lowercased name, arity)`
//! with arity `-1` denoting variadic; an exact-arity entry wins over a
//! variadic one. Aggregates and scalars share the namespace and are told
//! apart by the registered kind, which is how `min(x)` resolves to the
//! aggregate while `min(x, y)` resolves to the variadic scalar.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;

use crate::error::{QuereusError, Result};
use crate::types::{Affinity, Collation, SqlValue};

pub type ScalarFn = dyn Fn(&[SqlValue]) -> Result<SqlValue> + Send + Sync;
pub type AccumulatorFactory = dyn Fn() -> Box<dyn Accumulator> + Send + Sync;

/// Streaming aggregate state. One accumulator is created per group.
pub trait Accumulator: Send {
    fn step(&mut self, args: &[SqlValue]) -> Result<()>;
    fn finish(&mut self) -> Result<SqlValue>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Scalar,
    Aggregate,
    Window,
}

#[derive(Clone)]
pub enum ResolvedFunction {
    Scalar(Arc<ScalarFn>),
    Aggregate(Arc<AccumulatorFactory>),
    /// Window functions are realized by the window emitter; the registry
    /// only records their existence.
    Window,
}

impl ResolvedFunction {
    pub fn kind(&self) -> FunctionKind {
        match self {
            ResolvedFunction::Scalar(_) => FunctionKind::Scalar,
            ResolvedFunction::Aggregate(_) => FunctionKind::Aggregate,
            ResolvedFunction::Window => FunctionKind::Window,
        }
    }
}

pub struct FunctionRegistry {
    entries: RwLock<HashMap<(String, i32), ResolvedFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_builtins();
        registry
    }

    pub fn register_scalar(
        &self,
        name: &str,
        arity: i32,
        f: impl Fn(&[SqlValue]) -> Result<SqlValue> + Send + Sync + 'static,
    ) {
        self.entries.write().insert(
            (name.to_ascii_lowercase(), arity),
            ResolvedFunction::Scalar(Arc::new(f)),
        );
    }

    pub fn register_aggregate(
        &self,
        name: &str,
        arity: i32,
        factory: impl Fn() -> Box<dyn Accumulator> + Send + Sync + 'static,
    ) {
        self.entries.write().insert(
            (name.to_ascii_lowercase(), arity),
            ResolvedFunction::Aggregate(Arc::new(factory)),
        );
    }

    pub fn register_window(&self, name: &str, arity: i32) {
        self.entries
            .write()
            .insert((name.to_ascii_lowercase(), arity), ResolvedFunction::Window);
    }

    /// Resolve `(name, arity)`, preferring an exact-arity entry over a
    /// variadic one.
    pub fn resolve(&self, name: &str, arity: usize) -> Result<ResolvedFunction> {
        let key = name.to_ascii_lowercase();
        let entries = self.entries.read();
        if let Some(f) = entries.get(&(key.clone(), arity as i32)) {
            return Ok(f.clone());
        }
        if let Some(f) = entries.get(&(key, -1)) {
            return Ok(f.clone());
        }
        Err(QuereusError::planning(format!(
            "no such function: {name}/{arity}"
        )))
    }

    fn register_builtins(&self) {
        // Aggregates
        self.register_aggregate("count", 0, || Box::new(CountAccumulator::star()));
        self.register_aggregate("count", 1, || Box::new(CountAccumulator::of_arg()));
        self.register_aggregate("sum", 1, || Box::new(SumAccumulator::sum()));
        self.register_aggregate("total", 1, || Box::new(SumAccumulator::total()));
        self.register_aggregate("avg", 1, || Box::new(AvgAccumulator::default()));
        self.register_aggregate("min", 1, || Box::new(MinMaxAccumulator::min()));
        self.register_aggregate("max", 1, || Box::new(MinMaxAccumulator::max()));
        self.register_aggregate("group_concat", 1, || {
            Box::new(GroupConcatAccumulator::new(None))
        });
        self.register_aggregate("group_concat", 2, || {
            Box::new(GroupConcatAccumulator::new(None))
        });

        // Window
        self.register_window("row_number", 0);

        // Scalars
        self.register_scalar("lower", 1, |args| {
            Ok(match &args[0] {
                SqlValue::Text(s) => SqlValue::Text(s.to_lowercase()),
                SqlValue::Null => SqlValue::Null,
                other => other.clone(),
            })
        });
        self.register_scalar("upper", 1, |args| {
            Ok(match &args[0] {
                SqlValue::Text(s) => SqlValue::Text(s.to_uppercase()),
                SqlValue::Null => SqlValue::Null,
                other => other.clone(),
            })
        });
        self.register_scalar("length", 1, |args| {
            Ok(match &args[0] {
                SqlValue::Null => SqlValue::Null,
                SqlValue::Text(s) => SqlValue::Integer(s.chars().count() as i64),
                SqlValue::Blob(b) => SqlValue::Integer(b.len() as i64),
                other => SqlValue::Integer(other.to_string().len() as i64),
            })
        });
        self.register_scalar("substr", 2, |args| substr(args));
        self.register_scalar("substr", 3, |args| substr(args));
        self.register_scalar("abs", 1, |args| match &args[0] {
            SqlValue::Null => Ok(SqlValue::Null),
            SqlValue::Integer(i) => i
                .checked_abs()
                .map(SqlValue::Integer)
                .ok_or_else(|| QuereusError::Runtime("integer overflow".into())),
            SqlValue::Real(r) => Ok(SqlValue::Real(r.abs())),
            other => Ok(SqlValue::Real(other.as_number().unwrap_or(0.0).abs())),
        });
        self.register_scalar("coalesce", -1, |args| {
            Ok(args
                .iter()
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(SqlValue::Null))
        });
        self.register_scalar("ifnull", 2, |args| {
            Ok(if args[0].is_null() {
                args[1].clone()
            } else {
                args[0].clone()
            })
        });
        self.register_scalar("nullif", 2, |args| {
            Ok(match args[0].sql_eq(&args[1], Collation::Binary) {
                Some(true) => SqlValue::Null,
                _ => args[0].clone(),
            })
        });
        self.register_scalar("typeof", 1, |args| {
            Ok(SqlValue::Text(args[0].type_name().to_string()))
        });
        // SQLite's function forms: like(pattern, value), glob(pattern, value)
        self.register_scalar("like", 2, |args| {
            like_fn(&args[1], &args[0], None)
        });
        self.register_scalar("like", 3, |args| {
            let escape = match &args[2] {
                SqlValue::Text(s) => s.chars().next(),
                _ => None,
            };
            like_fn(&args[1], &args[0], escape)
        });
        self.register_scalar("glob", 2, |args| {
            if args[0].is_null() || args[1].is_null() {
                return Ok(SqlValue::Null);
            }
            let pattern = args[0].to_string();
            let value = args[1].to_string();
            Ok(SqlValue::from(glob_match(&pattern, &value)))
        });
        // Multi-argument scalar min/max; the single-argument forms resolve
        // to the aggregates.
        self.register_scalar("min", -1, |args| scalar_min_max(args, true));
        self.register_scalar("max", -1, |args| scalar_min_max(args, false));
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn substr(args: &[SqlValue]) -> Result<SqlValue> {
    if args[0].is_null() || args[1].is_null() {
        return Ok(SqlValue::Null);
    }
    let s = args[0].to_string();
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    let mut start = match args[1].clone().cast(Affinity::Integer) {
        SqlValue::Integer(i) => i,
        _ => 1,
    };
    // 1-based; negative counts from the end
    if start < 0 {
        start = (len + start).max(0) + 1;
    } else if start == 0 {
        start = 1;
    }
    let take = match args.get(2) {
        Some(v) if !v.is_null() => match v.clone().cast(Affinity::Integer) {
            SqlValue::Integer(i) => i.max(0),
            _ => len,
        },
        Some(_) => return Ok(SqlValue::Null),
        None => len,
    };
    let begin = ((start - 1).max(0) as usize).min(chars.len());
    let end = (begin + take as usize).min(chars.len());
    Ok(SqlValue::Text(chars[begin..end].iter().collect()))
}

fn scalar_min_max(args: &[SqlValue], want_min: bool) -> Result<SqlValue> {
    if args.iter().any(SqlValue::is_null) {
        return Ok(SqlValue::Null);
    }
    let mut best = args[0].clone();
    for v in &args[1..] {
        let cmp = v.canonical_cmp(&best, Collation::Binary);
        if (want_min && cmp == Ordering::Less) || (!want_min && cmp == Ordering::Greater) {
            best = v.clone();
        }
    }
    Ok(best)
}

fn like_fn(value: &SqlValue, pattern: &SqlValue, escape: Option<char>) -> Result<SqlValue> {
    if value.is_null() || pattern.is_null() {
        return Ok(SqlValue::Null);
    }
    Ok(SqlValue::from(like_match(
        &pattern.to_string(),
        &value.to_string(),
        escape,
    )))
}

/// SQL LIKE: `%` matches any run, `_` any single character; ASCII
/// case-insensitive, as SQLite's default.
pub fn like_match(pattern: &str, value: &str, escape: Option<char>) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push_str("(?is)^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if Some(c) == escape {
            if let Some(next) = chars.next() {
                regex.push_str(&regex::escape(&next.to_string()));
            }
            continue;
        }
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// SQLite GLOB: `*`/`?` wildcards, `[...]` classes, case-sensitive.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push_str("(?s)^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '[' => {
                regex.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    regex.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' {
                        regex.push_str("\\\\");
                    } else {
                        regex.push(inner);
                    }
                }
                regex.push(']');
            }
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

// Aggregate accumulators

struct CountAccumulator {
    count_nulls: bool,
    n: i64,
}

impl CountAccumulator {
    fn star() -> Self {
        Self {
            count_nulls: true,
            n: 0,
        }
    }

    fn of_arg() -> Self {
        Self {
            count_nulls: false,
            n: 0,
        }
    }
}

impl Accumulator for CountAccumulator {
    fn step(&mut self, args: &[SqlValue]) -> Result<()> {
        if self.count_nulls || args.first().map(|v| !v.is_null()).unwrap_or(false) {
            self.n += 1;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<SqlValue> {
        Ok(SqlValue::Integer(self.n))
    }
}

struct SumAccumulator {
    /// `total()` reports 0.0 over the empty input and always yields a real.
    total_mode: bool,
    int_sum: i64,
    real_sum: f64,
    use_real: bool,
    seen: bool,
}

impl SumAccumulator {
    fn sum() -> Self {
        Self {
            total_mode: false,
            int_sum: 0,
            real_sum: 0.0,
            use_real: false,
            seen: false,
        }
    }

    fn total() -> Self {
        Self {
            total_mode: true,
            ..Self::sum()
        }
    }
}

impl Accumulator for SumAccumulator {
    fn step(&mut self, args: &[SqlValue]) -> Result<()> {
        let v = args[0].clone().cast(Affinity::Numeric);
        match v {
            SqlValue::Null => {}
            SqlValue::Integer(i) if !self.use_real => {
                self.seen = true;
                match self.int_sum.checked_add(i) {
                    Some(s) => self.int_sum = s,
                    None => {
                        if self.total_mode {
                            self.use_real = true;
                            self.real_sum = self.int_sum as f64 + i as f64;
                        } else {
                            return Err(QuereusError::Runtime("integer overflow".into()));
                        }
                    }
                }
            }
            other => {
                self.seen = true;
                if !self.use_real {
                    self.use_real = true;
                    self.real_sum = self.int_sum as f64;
                }
                self.real_sum += other.as_number().unwrap_or(0.0);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<SqlValue> {
        if self.total_mode {
            let sum = if self.use_real {
                self.real_sum
            } else {
                self.int_sum as f64
            };
            return Ok(SqlValue::Real(sum));
        }
        if !self.seen {
            return Ok(SqlValue::Null);
        }
        Ok(if self.use_real {
            SqlValue::Real(self.real_sum)
        } else {
            SqlValue::Integer(self.int_sum)
        })
    }
}

#[derive(Default)]
struct AvgAccumulator {
    sum: f64,
    n: i64,
}

impl Accumulator for AvgAccumulator {
    fn step(&mut self, args: &[SqlValue]) -> Result<()> {
        if let Some(v) = args[0].as_number() {
            self.sum += v;
            self.n += 1;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<SqlValue> {
        if self.n == 0 {
            return Ok(SqlValue::Null);
        }
        Ok(SqlValue::Real(self.sum / self.n as f64))
    }
}

struct MinMaxAccumulator {
    want_min: bool,
    best: Option<SqlValue>,
}

impl MinMaxAccumulator {
    fn min() -> Self {
        Self {
            want_min: true,
            best: None,
        }
    }

    fn max() -> Self {
        Self {
            want_min: false,
            best: None,
        }
    }
}

impl Accumulator for MinMaxAccumulator {
    fn step(&mut self, args: &[SqlValue]) -> Result<()> {
        let v = &args[0];
        if v.is_null() {
            return Ok(());
        }
        match &self.best {
            None => self.best = Some(v.clone()),
            Some(cur) => {
                let cmp = v.canonical_cmp(cur, Collation::Binary);
                if (self.want_min && cmp == Ordering::Less)
                    || (!self.want_min && cmp == Ordering::Greater)
                {
                    self.best = Some(v.clone());
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<SqlValue> {
        Ok(self.best.take().unwrap_or(SqlValue::Null))
    }
}

struct GroupConcatAccumulator {
    sep: Option<String>,
    out: Option<String>,
}

impl GroupConcatAccumulator {
    fn new(sep: Option<String>) -> Self {
        Self { sep, out: None }
    }
}

impl Accumulator for GroupConcatAccumulator {
    fn step(&mut self, args: &[SqlValue]) -> Result<()> {
        if args[0].is_null() {
            return Ok(());
        }
        // second argument, when present, supplies the separator
        if self.sep.is_none() {
            self.sep = Some(match args.get(1) {
                Some(v) if !v.is_null() => v.to_string(),
                _ => ",".to_string(),
            });
        }
        let piece = args[0].to_string();
        match &mut self.out {
            None => self.out = Some(piece),
            Some(acc) => {
                acc.push_str(self.sep.as_deref().unwrap_or(","));
                acc.push_str(&piece);
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<SqlValue> {
        Ok(self
            .out
            .take()
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_exact_arity() {
        let registry = FunctionRegistry::with_builtins();
        assert_eq!(
            registry.resolve("min", 1).unwrap().kind(),
            FunctionKind::Aggregate
        );
        assert_eq!(
            registry.resolve("min", 2).unwrap().kind(),
            FunctionKind::Scalar
        );
        assert!(registry.resolve("no_such_fn", 1).is_err());
    }

    #[test]
    fn test_count_star_vs_count_arg() {
        let registry = FunctionRegistry::with_builtins();
        let ResolvedFunction::Aggregate(star) = registry.resolve("count", 0).unwrap() else {
            panic!("count/0 should be an aggregate");
        };
        let mut acc = star();
        acc.step(&[]).unwrap();
        acc.step(&[]).unwrap();
        assert!(matches!(acc.finish().unwrap(), SqlValue::Integer(2)));

        let ResolvedFunction::Aggregate(arg) = registry.resolve("count", 1).unwrap() else {
            panic!("count/1 should be an aggregate");
        };
        let mut acc = arg();
        acc.step(&[SqlValue::Integer(1)]).unwrap();
        acc.step(&[SqlValue::Null]).unwrap();
        assert!(matches!(acc.finish().unwrap(), SqlValue::Integer(1)));
    }

    #[test]
    fn test_sum_null_skipping_and_empty() {
        let registry = FunctionRegistry::with_builtins();
        let ResolvedFunction::Aggregate(sum) = registry.resolve("sum", 1).unwrap() else {
            panic!();
        };
        let mut acc = sum();
        assert!(acc.finish().unwrap().is_null());

        let mut acc = sum();
        acc.step(&[SqlValue::Integer(3)]).unwrap();
        acc.step(&[SqlValue::Null]).unwrap();
        acc.step(&[SqlValue::Integer(4)]).unwrap();
        assert!(matches!(acc.finish().unwrap(), SqlValue::Integer(7)));
    }

    #[test]
    fn test_like_match() {
        assert!(like_match("a%", "apple", None));
        assert!(like_match("A%", "apple", None));
        assert!(like_match("a_c", "abc", None));
        assert!(!like_match("a_c", "abbc", None));
        assert!(like_match("100\\%", "100%", Some('\\')));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("a*", "abc"));
        assert!(!glob_match("A*", "abc"));
        assert!(glob_match("a?c", "abc"));
        assert!(glob_match("[ab]x", "ax"));
        assert!(!glob_match("[^ab]x", "ax"));
    }

    #[test]
    fn test_substr_one_based() {
        let v = substr(&[
            SqlValue::Text("hello".into()),
            SqlValue::Integer(2),
            SqlValue::Integer(3),
        ])
        .unwrap();
        assert_eq!(v.to_string(), "ell");
    }
}
