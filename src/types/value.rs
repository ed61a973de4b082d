//! SQL values with SQLite-style type affinity.
//!
//! Null is a first-class value. Comparisons apply three-valued logic;
//! ordering for sorts and index keys uses a canonical total order that ranks
//! Null < numeric < Text < Blob, with numeric values compared across
//! Integer/Real and text compared under the active collation.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{QuereusError, Result};

/// Column/expression type affinity, following the SQLite model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Affinity {
    Integer,
    Real,
    Numeric,
    Text,
    Blob,
    /// No affinity; values are stored as supplied.
    Null,
}

impl Affinity {
    /// Affinity derived from a declared SQL type name, per the SQLite rules:
    /// INT ⇒ Integer; CHAR/CLOB/TEXT ⇒ Text; BLOB or empty ⇒ Blob;
    /// REAL/FLOA/DOUB ⇒ Real; anything else ⇒ Numeric.
    pub fn from_type_name(name: &str) -> Affinity {
        let upper = name.to_ascii_uppercase();
        if upper.contains("INT") {
            Affinity::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Affinity::Text
        } else if upper.contains("BLOB") || upper.is_empty() {
            Affinity::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Affinity::Integer | Affinity::Real | Affinity::Numeric)
    }
}

/// Text comparison rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Collation {
    #[default]
    Binary,
    NoCase,
    Rtrim,
}

impl Collation {
    pub fn parse(name: &str) -> Result<Collation> {
        match name.to_ascii_uppercase().as_str() {
            "BINARY" => Ok(Collation::Binary),
            "NOCASE" => Ok(Collation::NoCase),
            "RTRIM" => Ok(Collation::Rtrim),
            other => Err(QuereusError::planning(format!(
                "unknown collation: {other}"
            ))),
        }
    }

    pub fn compare(self, a: &str, b: &str) -> Ordering {
        match self {
            Collation::Binary => a.cmp(b),
            Collation::NoCase => a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()),
            Collation::Rtrim => a.trim_end().cmp(b.trim_end()),
        }
    }
}

/// A runtime SQL value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// SQLite type name, as reported by `typeof()`.
    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Integer(_) => "integer",
            SqlValue::Real(_) => "real",
            SqlValue::Text(_) => "text",
            SqlValue::Blob(_) => "blob",
        }
    }

    /// Truthiness for WHERE/HAVING/join conditions: the value is coerced to a
    /// number; non-zero is true, Null and non-numeric text are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            SqlValue::Null => false,
            SqlValue::Integer(i) => *i != 0,
            SqlValue::Real(r) => *r != 0.0,
            SqlValue::Text(s) => parse_leading_number(s).map(|n| n != 0.0).unwrap_or(false),
            SqlValue::Blob(_) => false,
        }
    }

    /// Numeric view of the value, if one exists.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SqlValue::Integer(i) => Some(*i as f64),
            SqlValue::Real(r) => Some(*r),
            SqlValue::Text(s) => parse_leading_number(s),
            _ => None,
        }
    }

    /// Apply a column affinity to an incoming value, per the SQLite storage
    /// rules: numeric affinities convert well-formed numeric text; Text
    /// affinity stringifies numbers; Blob and Null leave the value alone.
    pub fn apply_affinity(self, affinity: Affinity) -> SqlValue {
        match affinity {
            Affinity::Integer | Affinity::Numeric => match self {
                SqlValue::Text(s) => match parse_exact_number(&s) {
                    Some(Parsed::Int(i)) => SqlValue::Integer(i),
                    Some(Parsed::Float(f)) => coerce_real(f),
                    None => SqlValue::Text(s),
                },
                SqlValue::Real(r) => coerce_real(r),
                other => other,
            },
            Affinity::Real => match self {
                SqlValue::Integer(i) => SqlValue::Real(i as f64),
                SqlValue::Text(s) => match parse_exact_number(&s) {
                    Some(Parsed::Int(i)) => SqlValue::Real(i as f64),
                    Some(Parsed::Float(f)) => SqlValue::Real(f),
                    None => SqlValue::Text(s),
                },
                other => other,
            },
            Affinity::Text => match self {
                SqlValue::Integer(i) => SqlValue::Text(i.to_string()),
                SqlValue::Real(r) => SqlValue::Text(format_real(r)),
                other => other,
            },
            Affinity::Blob | Affinity::Null => self,
        }
    }

    /// CAST semantics: conversion failures fall back to the per-affinity
    /// default (0, 0.0, empty string, empty blob) rather than erroring.
    pub fn cast(self, affinity: Affinity) -> SqlValue {
        if self.is_null() {
            return SqlValue::Null;
        }
        match affinity {
            Affinity::Integer => match &self {
                SqlValue::Integer(i) => SqlValue::Integer(*i),
                SqlValue::Real(r) => SqlValue::Integer(*r as i64),
                SqlValue::Text(s) => {
                    SqlValue::Integer(parse_leading_number(s).map(|n| n as i64).unwrap_or(0))
                }
                SqlValue::Blob(_) => SqlValue::Integer(0),
                SqlValue::Null => SqlValue::Null,
            },
            Affinity::Real => match &self {
                SqlValue::Integer(i) => SqlValue::Real(*i as f64),
                SqlValue::Real(r) => SqlValue::Real(*r),
                SqlValue::Text(s) => SqlValue::Real(parse_leading_number(s).unwrap_or(0.0)),
                SqlValue::Blob(_) => SqlValue::Real(0.0),
                SqlValue::Null => SqlValue::Null,
            },
            Affinity::Numeric => {
                let as_int = self.clone().cast(Affinity::Integer);
                let as_real = self.cast(Affinity::Real);
                match (as_int, as_real) {
                    (SqlValue::Integer(i), SqlValue::Real(r)) if (i as f64) == r => {
                        SqlValue::Integer(i)
                    }
                    (_, real) => real,
                }
            }
            Affinity::Text => match self {
                SqlValue::Integer(i) => SqlValue::Text(i.to_string()),
                SqlValue::Real(r) => SqlValue::Text(format_real(r)),
                SqlValue::Text(s) => SqlValue::Text(s),
                SqlValue::Blob(b) => {
                    SqlValue::Text(String::from_utf8(b).unwrap_or_default())
                }
                SqlValue::Null => SqlValue::Null,
            },
            Affinity::Blob => match self {
                SqlValue::Blob(b) => SqlValue::Blob(b),
                SqlValue::Text(s) => SqlValue::Blob(s.into_bytes()),
                _ => SqlValue::Blob(Vec::new()),
            },
            Affinity::Null => self,
        }
    }

    /// Three-valued comparison: `None` when either side is Null, otherwise
    /// the canonical ordering under the given collation.
    pub fn compare(&self, other: &SqlValue, collation: Collation) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        Some(self.canonical_cmp(other, collation))
    }

    /// Total order used for sort keys, distinct trees, and index keys:
    /// Null < numeric < Text < Blob; numbers compare numerically across
    /// Integer/Real; text compares under the collation; blobs bytewise.
    pub fn canonical_cmp(&self, other: &SqlValue, collation: Collation) -> Ordering {
        use SqlValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Real(b)) => cmp_f64(*a as f64, *b),
            (Real(a), Integer(b)) => cmp_f64(*a, *b as f64),
            (Real(a), Real(b)) => cmp_f64(*a, *b),
            (Integer(_) | Real(_), Text(_) | Blob(_)) => Ordering::Less,
            (Text(_) | Blob(_), Integer(_) | Real(_)) => Ordering::Greater,
            (Text(a), Text(b)) => collation.compare(a, b),
            (Text(_), Blob(_)) => Ordering::Less,
            (Blob(_), Text(_)) => Ordering::Greater,
            (Blob(a), Blob(b)) => a.cmp(b),
        }
    }

    /// Equality under a collation, three-valued.
    pub fn sql_eq(&self, other: &SqlValue, collation: Collation) -> Option<bool> {
        self.compare(other, collation).map(|o| o == Ordering::Equal)
    }

    pub fn add(&self, other: &SqlValue) -> Result<SqlValue> {
        numeric_binop(self, other, |a, b| a.checked_add(b), |a, b| a + b)
    }

    pub fn sub(&self, other: &SqlValue) -> Result<SqlValue> {
        numeric_binop(self, other, |a, b| a.checked_sub(b), |a, b| a - b)
    }

    pub fn mul(&self, other: &SqlValue) -> Result<SqlValue> {
        numeric_binop(self, other, |a, b| a.checked_mul(b), |a, b| a * b)
    }

    /// Division by zero yields Null, matching SQLite.
    pub fn div(&self, other: &SqlValue) -> Result<SqlValue> {
        if self.is_null() || other.is_null() {
            return Ok(SqlValue::Null);
        }
        match other.as_number() {
            Some(n) if n == 0.0 => return Ok(SqlValue::Null),
            _ => {}
        }
        numeric_binop(self, other, |a, b| a.checked_div(b), |a, b| a / b)
    }

    pub fn rem(&self, other: &SqlValue) -> Result<SqlValue> {
        if self.is_null() || other.is_null() {
            return Ok(SqlValue::Null);
        }
        if matches!(other.as_number(), Some(n) if n == 0.0) {
            return Ok(SqlValue::Null);
        }
        numeric_binop(self, other, |a, b| a.checked_rem(b), |a, b| a % b)
    }

    pub fn neg(&self) -> Result<SqlValue> {
        match self {
            SqlValue::Null => Ok(SqlValue::Null),
            SqlValue::Integer(i) => i
                .checked_neg()
                .map(SqlValue::Integer)
                .ok_or_else(|| QuereusError::Runtime("integer overflow".into())),
            SqlValue::Real(r) => Ok(SqlValue::Real(-r)),
            other => {
                let n = other.as_number().unwrap_or(0.0);
                Ok(SqlValue::Real(-n))
            }
        }
    }

    pub fn concat(&self, other: &SqlValue) -> SqlValue {
        if self.is_null() || other.is_null() {
            return SqlValue::Null;
        }
        let mut s = self.clone().cast(Affinity::Text);
        if let (SqlValue::Text(a), SqlValue::Text(b)) =
            (&mut s, other.clone().cast(Affinity::Text))
        {
            a.push_str(&b);
        }
        s
    }
}

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Real(r) => write!(f, "{}", format_real(*r)),
            SqlValue::Text(s) => write!(f, "{s}"),
            SqlValue::Blob(b) => {
                write!(f, "x'")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                write!(f, "'")
            }
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(if v { 1 } else { 0 })
    }
}

enum Parsed {
    Int(i64),
    Float(f64),
}

fn parse_exact_number(s: &str) -> Option<Parsed> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(i) = t.parse::<i64>() {
        return Some(Parsed::Int(i));
    }
    t.parse::<f64>().ok().map(Parsed::Float)
}

/// Leading-prefix numeric parse used by CAST and truthiness: "12abc" ⇒ 12.
fn parse_leading_number(s: &str) -> Option<f64> {
    let t = s.trim_start();
    let mut end = 0usize;
    let bytes = t.as_bytes();
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < bytes.len() {
        let c = bytes[end] as char;
        match c {
            '+' | '-' if end == 0 => {}
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot && !seen_exp => seen_dot = true,
            'e' | 'E' if seen_digit && !seen_exp => {
                // exponent must be followed by digits, optionally signed
                let mut j = end + 1;
                if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j].is_ascii_digit() {
                    seen_exp = true;
                    end = j;
                } else {
                    break;
                }
            }
            _ => break,
        }
        end += 1;
    }
    if !seen_digit {
        return None;
    }
    t[..end].parse::<f64>().ok()
}

/// A real with no fractional part coming through numeric affinity becomes an
/// integer when it fits exactly.
fn coerce_real(f: f64) -> SqlValue {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        SqlValue::Integer(f as i64)
    } else {
        SqlValue::Real(f)
    }
}

fn format_real(r: f64) -> String {
    if r.fract() == 0.0 && r.abs() < 1e15 {
        format!("{:.1}", r)
    } else {
        format!("{}", r)
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

fn numeric_binop(
    a: &SqlValue,
    b: &SqlValue,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    real_op: impl Fn(f64, f64) -> f64,
) -> Result<SqlValue> {
    if a.is_null() || b.is_null() {
        return Ok(SqlValue::Null);
    }
    let ca = a.clone().cast(Affinity::Numeric);
    let cb = b.clone().cast(Affinity::Numeric);
    match (ca, cb) {
        (SqlValue::Integer(x), SqlValue::Integer(y)) => int_op(x, y)
            .map(SqlValue::Integer)
            .ok_or_else(|| QuereusError::Runtime("integer overflow".into())),
        (x, y) => {
            let fx = x.as_number().unwrap_or(0.0);
            let fy = y.as_number().unwrap_or(0.0);
            Ok(SqlValue::Real(real_op(fx, fy)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_from_type_name() {
        assert_eq!(Affinity::from_type_name("INTEGER"), Affinity::Integer);
        assert_eq!(Affinity::from_type_name("VARCHAR(20)"), Affinity::Text);
        assert_eq!(Affinity::from_type_name("BLOB"), Affinity::Blob);
        assert_eq!(Affinity::from_type_name("DOUBLE"), Affinity::Real);
        assert_eq!(Affinity::from_type_name("DECIMAL(10,2)"), Affinity::Numeric);
    }

    #[test]
    fn test_numeric_text_coercion() {
        let v = SqlValue::Text("42".into()).apply_affinity(Affinity::Integer);
        assert!(matches!(v, SqlValue::Integer(42)));
        let v = SqlValue::Text("4.5".into()).apply_affinity(Affinity::Numeric);
        assert!(matches!(v, SqlValue::Real(f) if f == 4.5));
        let v = SqlValue::Text("abc".into()).apply_affinity(Affinity::Integer);
        assert!(matches!(v, SqlValue::Text(_)));
    }

    #[test]
    fn test_cast_fallback_defaults() {
        assert!(matches!(
            SqlValue::Text("abc".into()).cast(Affinity::Integer),
            SqlValue::Integer(0)
        ));
        assert!(matches!(
            SqlValue::Text("12abc".into()).cast(Affinity::Integer),
            SqlValue::Integer(12)
        ));
        assert!(matches!(
            SqlValue::Blob(vec![1, 2]).cast(Affinity::Real),
            SqlValue::Real(f) if f == 0.0
        ));
    }

    #[test]
    fn test_cast_preserves_null() {
        assert!(SqlValue::Null.cast(Affinity::Integer).is_null());
        assert!(SqlValue::Null.cast(Affinity::Text).is_null());
    }

    #[test]
    fn test_three_valued_comparison() {
        let one = SqlValue::Integer(1);
        assert_eq!(one.compare(&SqlValue::Null, Collation::Binary), None);
        assert_eq!(
            one.compare(&SqlValue::Integer(2), Collation::Binary),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_canonical_type_ranking() {
        let n = SqlValue::Integer(99);
        let t = SqlValue::Text("a".into());
        let b = SqlValue::Blob(vec![0]);
        assert_eq!(n.canonical_cmp(&t, Collation::Binary), Ordering::Less);
        assert_eq!(t.canonical_cmp(&b, Collation::Binary), Ordering::Less);
        assert_eq!(
            SqlValue::Null.canonical_cmp(&n, Collation::Binary),
            Ordering::Less
        );
    }

    #[test]
    fn test_nocase_collation() {
        let a = SqlValue::Text("ABC".into());
        let b = SqlValue::Text("abc".into());
        assert_eq!(a.sql_eq(&b, Collation::NoCase), Some(true));
        assert_eq!(a.sql_eq(&b, Collation::Binary), Some(false));
    }

    #[test]
    fn test_division_by_zero_is_null() {
        let v = SqlValue::Integer(10)
            .div(&SqlValue::Integer(0))
            .unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn test_integer_overflow_errors() {
        let err = SqlValue::Integer(i64::MAX).add(&SqlValue::Integer(1));
        assert!(err.is_err());
    }

    #[test]
    fn test_mixed_arithmetic_promotes_to_real() {
        let v = SqlValue::Integer(1).add(&SqlValue::Real(0.5)).unwrap();
        assert!(matches!(v, SqlValue::Real(f) if f == 1.5));
    }
}
