//! Utility functions and helpers

pub mod time;

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid duration: {0:?} (expected e.g. \"500ms\", \"3s\", \"1m\")")]
pub struct DurationError(pub String);

/// Parse a duration string (e.g., "500ms", "30s", "5m")
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let s = s.trim();
    let err = || DurationError(s.to_string());

    if let Some(num_str) = s.strip_suffix("ms") {
        let millis: u64 = num_str.trim().parse().map_err(|_| err())?;
        Ok(Duration::from_millis(millis))
    } else if let Some(num_str) = s.strip_suffix('s') {
        let secs: u64 = num_str.trim().parse().map_err(|_| err())?;
        Ok(Duration::from_secs(secs))
    } else if let Some(num_str) = s.strip_suffix('m') {
        let mins: u64 = num_str.trim().parse().map_err(|_| err())?;
        let secs = mins.checked_mul(60).ok_or_else(err)?;
        Ok(Duration::from_secs(secs))
    } else {
        // Default to seconds if no suffix
        let secs: u64 = s.parse().map_err(|_| err())?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("3s").unwrap().as_secs(), 3);
        assert_eq!(parse_duration("2m").unwrap().as_secs(), 120);
        assert_eq!(parse_duration(" 10 ").unwrap().as_secs(), 10);
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflowing_minutes() {
        let err = parse_duration("307445734561825861m").unwrap_err();
        assert_eq!(err, DurationError("307445734561825861m".to_string()));
        assert_eq!(
            parse_duration("307445734561825860m").unwrap().as_secs(),
            307445734561825860 * 60
        );
    }
}
