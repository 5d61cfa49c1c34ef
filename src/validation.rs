//! Field validation utilities shared by config loading and manifest validation.

use std::time::Duration;

use crate::types::{Error, Result};

/// Validate that a string is not empty.
pub fn validate_non_empty(s: &str, field: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Validate that a value is positive.
pub fn validate_positive(n: impl Into<u64>, field: &str) -> Result<()> {
    if n.into() == 0 {
        return Err(Error::validation(format!("{} must be positive", field)));
    }
    Ok(())
}

/// Validate that a duration budget is non-zero.
pub fn validate_non_zero_duration(d: Duration, field: &str) -> Result<()> {
    if d.is_zero() {
        return Err(Error::validation(format!("{} must be greater than zero", field)));
    }
    Ok(())
}

/// Validate a module or command name: lowercase ascii, digits, `.`, `_`, `-`.
pub fn validate_identifier(s: &str, field: &str) -> Result<()> {
    validate_non_empty(s, field)?;
    let valid = s
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    if !valid || s.starts_with('.') || s.ends_with('.') {
        return Err(Error::validation(format!(
            "{} '{}' must use lowercase letters, digits, '.', '_' or '-'",
            field, s
        )));
    }
    Ok(())
}
