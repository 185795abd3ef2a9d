//! Reusable field validators.
//!
//! A validator sees the non-null value about to be written and returns a
//! human-readable reason on rejection. Null values never reach validators;
//! presence is the job of `required()`.

use std::sync::Arc;

use entgraph_types::Value;
use regex::Regex;

use crate::error::{EntError, Result};

pub type Validator = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// Wrap a closure as a [`Validator`].
pub fn from_fn<F>(f: F) -> Validator
where
    F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Strings must be non-blank; string lists must be non-empty.
pub fn not_empty() -> Validator {
    from_fn(|v| match v {
        Value::String(s) if s.trim().is_empty() => Err("value is empty".to_string()),
        Value::Strings(items) if items.is_empty() => Err("list is empty".to_string()),
        _ => Ok(()),
    })
}

pub fn max_len(max: usize) -> Validator {
    from_fn(move |v| match v {
        Value::String(s) if s.chars().count() > max => {
            Err(format!("value is longer than {} characters", max))
        }
        Value::Strings(items) if items.len() > max => {
            Err(format!("list has more than {} elements", max))
        }
        _ => Ok(()),
    })
}

pub fn min_len(min: usize) -> Validator {
    from_fn(move |v| match v {
        Value::String(s) if s.chars().count() < min => {
            Err(format!("value is shorter than {} characters", min))
        }
        Value::Strings(items) if items.len() < min => {
            Err(format!("list has fewer than {} elements", min))
        }
        _ => Ok(()),
    })
}

/// Inclusive numeric range.
pub fn range(min: f64, max: f64) -> Validator {
    from_fn(move |v| match v.as_f64() {
        Some(n) if n < min || n > max => Err(format!("value {} outside [{}, {}]", n, min, max)),
        _ => Ok(()),
    })
}

/// String must be one of the listed variants (enum-like fields).
pub fn one_of(variants: &[&str]) -> Validator {
    let variants: Vec<String> = variants.iter().map(|s| s.to_string()).collect();
    from_fn(move |v| match v.as_str() {
        Some(s) if !variants.iter().any(|x| x == s) => {
            Err(format!("'{}' is not one of {:?}", s, variants))
        }
        _ => Ok(()),
    })
}

/// String must match `pattern`. An invalid pattern is a configuration error.
pub fn matches(pattern: &str) -> Result<Validator> {
    let re = Regex::new(pattern)
        .map_err(|e| EntError::config(format!("invalid validator pattern '{}': {}", pattern, e)))?;
    Ok(from_fn(move |v| match v.as_str() {
        Some(s) if !re.is_match(s) => Err(format!("'{}' does not match {}", s, re.as_str())),
        _ => Ok(()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_empty_rejects_blank_strings() {
        let v = not_empty();
        assert!(v(&Value::from("   ")).is_err());
        assert!(v(&Value::from("x")).is_ok());
        assert!(v(&Value::Strings(vec![])).is_err());
    }

    #[test]
    fn length_bounds_count_chars() {
        assert!(max_len(3)(&Value::from("äöü")).is_ok());
        assert!(max_len(2)(&Value::from("äöü")).is_err());
        assert!(min_len(2)(&Value::from("a")).is_err());
    }

    #[test]
    fn range_accepts_ints_and_floats() {
        let v = range(0.0, 10.0);
        assert!(v(&Value::Int(10)).is_ok());
        assert!(v(&Value::Float(10.5)).is_err());
    }

    #[test]
    fn one_of_lists_variants() {
        let v = one_of(&["draft", "published"]);
        assert!(v(&Value::from("draft")).is_ok());
        let reason = v(&Value::from("gone")).unwrap_err();
        assert!(reason.contains("gone"));
    }

    #[test]
    fn matches_reports_bad_patterns_as_configuration() {
        assert!(matches("(").err().unwrap().is_configuration());
        let v = matches(r"^[a-z0-9-]+$").unwrap();
        assert!(v(&Value::from("acme-1")).is_ok());
        assert!(v(&Value::from("Acme 1")).is_err());
    }
}
