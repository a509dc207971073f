//! Time specifications for scheduling.
//!
//! A time specification is either relative ("2s", "500ms", "1m30s", "0.5s")
//! and resolved against the current instant when used, or an absolute
//! [`Instant`]. Integer forms are parsed with the `duration-string` crate;
//! fractional forms such as "0.5s" fall back to a small regex parser.

use duration_string::DurationString;
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::errors::TimeSpecError;

/// When a task should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    /// Relative to the moment the specification is resolved
    After(Duration),
    /// Absolute point in time
    At(Instant),
}

impl TimeSpec {
    /// Zero delay
    pub fn now() -> Self {
        TimeSpec::After(Duration::ZERO)
    }

    /// Parse a relative specification like "2s", "500ms" or "0.5s"
    pub fn parse(s: &str) -> Result<Self, TimeSpecError> {
        parse_duration(s).map(TimeSpec::After)
    }

    /// Resolve into an absolute deadline.
    ///
    /// Fails when the delay reaches past what an [`Instant`] can represent.
    pub fn deadline(&self, now: Instant) -> Result<Instant, TimeSpecError> {
        match self {
            TimeSpec::After(delay) => now
                .checked_add(*delay)
                .ok_or(TimeSpecError::OutOfRange { delay: *delay }),
            TimeSpec::At(at) => Ok(*at),
        }
    }
}

impl Default for TimeSpec {
    fn default() -> Self {
        TimeSpec::now()
    }
}

impl From<Duration> for TimeSpec {
    fn from(delay: Duration) -> Self {
        TimeSpec::After(delay)
    }
}

impl From<Instant> for TimeSpec {
    fn from(at: Instant) -> Self {
        TimeSpec::At(at)
    }
}

impl FromStr for TimeSpec {
    type Err = TimeSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeSpec::parse(s)
    }
}

impl TryFrom<&str> for TimeSpec {
    type Error = TimeSpecError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        TimeSpec::parse(s)
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeSpec::After(delay) => write!(f, "{}", format_duration(*delay)),
            TimeSpec::At(at) => write!(f, "{:?}", at),
        }
    }
}

fn fractional_regex() -> &'static Regex {
    static FRACTIONAL: OnceLock<Regex> = OnceLock::new();
    FRACTIONAL.get_or_init(|| {
        Regex::new(r"^(\d+(?:\.\d+)?)\s*(ms|s|m|h|d)?$").unwrap_or_else(|e| {
            unreachable!("fractional duration pattern is a valid regex: {}", e)
        })
    })
}

/// Parse a duration string into a [`Duration`].
///
/// Empty input means zero. A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, TimeSpecError> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Ok(Duration::ZERO);
    }

    if let Ok(parsed) = trimmed.parse::<DurationString>() {
        return Ok(parsed.into());
    }

    let captures = fractional_regex()
        .captures(trimmed)
        .ok_or_else(|| TimeSpecError::Invalid {
            input: s.to_string(),
            reason: "expected a duration like '500ms', '2s', '0.5s' or '1m30s'".to_string(),
        })?;

    let amount: f64 = captures[1].parse().map_err(|e| TimeSpecError::Invalid {
        input: s.to_string(),
        reason: format!("{}", e),
    })?;

    let unit_secs = match captures.get(2).map(|m| m.as_str()) {
        Some("ms") => 0.001,
        Some("m") => 60.0,
        Some("h") => 3600.0,
        Some("d") => 86400.0,
        _ => 1.0,
    };

    Duration::try_from_secs_f64(amount * unit_secs).map_err(|e| TimeSpecError::Invalid {
        input: s.to_string(),
        reason: e.to_string(),
    })
}

/// Render a duration the way [`parse_duration`] reads it back
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}

/// Serde adapter for optional durations written as strings ("5s")
pub mod serde_opt_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&super::format_duration(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer_durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_fractional_durations() {
        assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_empty_means_now() {
        assert_eq!(parse_duration("").unwrap(), Duration::ZERO);
        assert_eq!(TimeSpec::parse("0s").unwrap(), TimeSpec::now());
    }

    #[test]
    fn test_invalid_duration() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!("2 fortnights".parse::<TimeSpec>().is_err());
    }

    #[test]
    fn test_deadline_resolution() {
        let now = Instant::now();
        let relative = TimeSpec::parse("2s").unwrap();
        assert_eq!(relative.deadline(now).unwrap(), now + Duration::from_secs(2));

        let absolute = TimeSpec::At(now + Duration::from_millis(10));
        assert_eq!(absolute.deadline(Instant::now()).unwrap(), now + Duration::from_millis(10));
    }

    #[test]
    fn test_deadline_out_of_range() {
        let far = TimeSpec::After(Duration::MAX);
        assert!(matches!(
            far.deadline(Instant::now()),
            Err(TimeSpecError::OutOfRange { delay }) if delay == Duration::MAX
        ));
    }

    #[test]
    fn test_format_round_trips_through_parse() {
        for ms in [0u64, 250, 1000, 61_500] {
            let duration = Duration::from_millis(ms);
            assert_eq!(parse_duration(&format_duration(duration)).unwrap(), duration);
        }
    }
}
