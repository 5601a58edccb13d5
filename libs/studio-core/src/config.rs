//! Environment lookups shared by the binaries.

use crate::CoreError;
use std::env;
use std::str::FromStr;

/// The variable's value, treating unset and blank alike.
pub fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parses the variable, falling back to `default` when it is unset.
pub fn parse_var<T>(key: &str, default: T) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CoreError::Configuration(format!("{key}='{raw}': {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_reports_the_key() {
        // SAFETY: no other test reads this variable.
        unsafe { env::set_var("STUDIO_TEST_PORT", "not-a-number") };
        let err = parse_var::<u16>("STUDIO_TEST_PORT", 1).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(ref msg) if msg.contains("STUDIO_TEST_PORT")));
        unsafe { env::remove_var("STUDIO_TEST_PORT") };

        assert_eq!(parse_var::<u16>("STUDIO_TEST_PORT", 7).unwrap(), 7);
    }

    #[test]
    fn test_blank_values_count_as_unset() {
        // SAFETY: no other test reads this variable.
        unsafe { env::set_var("STUDIO_TEST_BLANK", "   ") };
        assert!(optional_var("STUDIO_TEST_BLANK").is_none());
        assert_eq!(parse_var::<u64>("STUDIO_TEST_BLANK", 300).unwrap(), 300);
        unsafe { env::remove_var("STUDIO_TEST_BLANK") };
    }
}
