//! Parsing for the loosely-typed values a raw load-test config carries.
//!
//! Callers hand the engine JSON where almost every field may be a number,
//! a string with a unit suffix, or a boolean-ish flag. Everything funnels
//! through [`Scalar`] and the small parsers below before the canonical
//! config is built.

use serde::Deserialize;

/// A raw config value: JSON number, string, or boolean.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Num(f64),
    Str(String),
}

/// Parses a human duration into milliseconds.
///
/// Bare numbers are treated as milliseconds and clamped to `>= 0`. Strings
/// must match `-?\d+(\.\d+)?\s*(ms|s|m|h)?` with the unit defaulting to
/// milliseconds. Empty input, malformed strings and negative string
/// results yield `None`.
pub fn parse_duration_ms(value: Option<&Scalar>) -> Option<u64> {
    match value? {
        Scalar::Bool(_) => None,
        Scalar::Num(n) => {
            if n.is_nan() {
                return None;
            }
            Some(n.max(0.0).round() as u64)
        }
        Scalar::Str(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            let (number, unit_ms) = split_unit(s);
            let number = number.trim_end();
            if !is_plain_decimal(number) {
                return None;
            }
            let n: f64 = number.parse().ok()?;
            let ms = n * unit_ms;
            if ms < 0.0 {
                return None;
            }
            Some(ms.round() as u64)
        }
    }
}

fn split_unit(s: &str) -> (&str, f64) {
    // "ms" before "m" and "s".
    if let Some(rest) = s.strip_suffix("ms") {
        (rest, 1.0)
    } else if let Some(rest) = s.strip_suffix('s') {
        (rest, 1_000.0)
    } else if let Some(rest) = s.strip_suffix('m') {
        (rest, 60_000.0)
    } else if let Some(rest) = s.strip_suffix('h') {
        (rest, 3_600_000.0)
    } else {
        (s, 1.0)
    }
}

/// Strict `-?\d+(\.\d+)?` check; rejects the exponents, leading dots and
/// `+` signs that `f64::from_str` would otherwise accept.
fn is_plain_decimal(s: &str) -> bool {
    let s = s.strip_prefix('-').unwrap_or(s);
    if s.is_empty() {
        return false;
    }
    let mut parts = s.splitn(2, '.');
    let int_part = parts.next().unwrap_or("");
    let frac_part = parts.next();
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    match frac_part {
        None => true,
        Some(f) => !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()),
    }
}

/// Parses a failure-rate threshold into a fraction clamped to `[0, 1]`.
///
/// Numbers greater than one are read as percentages (`5` means 5%), as are
/// strings with a trailing `%`.
pub fn parse_failure_rate_threshold(value: Option<&Scalar>) -> Option<f64> {
    match value? {
        Scalar::Bool(_) => None,
        Scalar::Num(n) => {
            if n.is_nan() {
                return None;
            }
            let frac = if *n > 1.0 { n / 100.0 } else { *n };
            Some(frac.clamp(0.0, 1.0))
        }
        Scalar::Str(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Some(rest) = s.strip_suffix('%') {
                let n: f64 = rest.trim().parse().ok()?;
                if n < 0.0 {
                    return None;
                }
                Some((n / 100.0).clamp(0.0, 1.0))
            } else {
                let n: f64 = s.parse().ok()?;
                if n < 0.0 {
                    return None;
                }
                let frac = if n > 1.0 { n / 100.0 } else { n };
                Some(frac.clamp(0.0, 1.0))
            }
        }
    }
}

/// Parses a whole-second quantity, treating strings as durations
/// (`"30s"`, `"2m"`, bare ms) and falling back on invalid input.
pub fn parse_seconds(value: Option<&Scalar>, fallback: u64) -> u64 {
    match value {
        Some(Scalar::Num(n)) if *n > 0.0 => (n.floor() as u64).max(1),
        Some(Scalar::Str(s)) => match parse_duration_ms(Some(&Scalar::Str(s.clone()))) {
            Some(ms) if ms > 0 => ((ms as f64 / 1_000.0).round() as u64).max(1),
            _ => fallback,
        },
        _ => fallback,
    }
}

/// Parses an integer count with a fallback; the caller applies any floor.
pub fn parse_count(value: Option<&Scalar>, fallback: i64) -> i64 {
    match value {
        Some(Scalar::Num(n)) if n.is_finite() => *n as i64,
        Some(Scalar::Str(s)) => s.trim().parse().unwrap_or(fallback),
        _ => fallback,
    }
}

/// Permissive boolean: accepts `true`, non-zero numbers and the truthy
/// string vocabulary `1/true/yes/y/on/enable/enabled`.
pub fn parse_flag(value: Option<&Scalar>) -> bool {
    match value {
        Some(Scalar::Bool(b)) => *b,
        Some(Scalar::Num(n)) => *n != 0.0,
        Some(Scalar::Str(s)) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on" | "enable" | "enabled"
        ),
        None => false,
    }
}

/// A strictly positive integer reading of a scalar, used by the alias
/// resolution chains where zero and negatives mean "not set".
pub fn parse_positive(value: Option<&Scalar>) -> Option<u64> {
    non_negative(value).filter(|v| *v > 0)
}

/// A non-negative integer reading of a scalar. Explicit zeroes survive.
pub fn non_negative(value: Option<&Scalar>) -> Option<u64> {
    match value? {
        Scalar::Num(n) if n.is_finite() && *n >= 0.0 => Some(n.floor() as u64),
        Scalar::Str(s) => s.trim().parse().ok(),
        _ => None,
    }
}
