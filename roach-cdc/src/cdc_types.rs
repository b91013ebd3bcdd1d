//! A module containing types related to change feed bookkeeping.
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const NANOS_IN_SECOND: i64 = 1_000_000_000;
const NANOS_DIGITS: usize = 9;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid logical timestamp '{input}': {reason}")]
pub struct ParseTimestampError {
    input: String,
    reason: &'static str,
}

impl ParseTimestampError {
    fn new(input: &str, reason: &'static str) -> Self {
        ParseTimestampError {
            input: input.to_string(),
            reason,
        }
    }
}

/// A hybrid logical clock value as rendered by the database in
/// change feed watermarks and `updated` fields.
///
/// Two renderings are understood:
/// * `"<wall-nanos>.<logical>"`, e.g. `"1634000000000000000.0000000001"`,
/// * `"<seconds>.<nanos>,<logical>"`, e.g. `"1634000000.000000000,0"`.
///
/// Ordering compares wall time first, then the logical counter.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct LogicalTimestamp {
    wall_time: i64,
    logical: u32,
}

impl LogicalTimestamp {
    pub fn new(wall_time: i64, logical: u32) -> LogicalTimestamp {
        LogicalTimestamp { wall_time, logical }
    }

    pub fn parse(s: &str) -> Result<LogicalTimestamp, ParseTimestampError> {
        let input = s.trim();
        if input.is_empty() {
            return Err(ParseTimestampError::new(s, "empty value"));
        }

        match input.split_once(',') {
            Some((wall, logical)) => {
                let (seconds, fraction) = wall.split_once('.').unwrap_or((wall, ""));
                let seconds = parse_digits::<i64>(s, seconds)?;
                let nanos = parse_fraction(s, fraction)?;
                let wall_time = seconds
                    .checked_mul(NANOS_IN_SECOND)
                    .and_then(|w| w.checked_add(nanos))
                    .ok_or_else(|| ParseTimestampError::new(s, "wall time out of range"))?;
                Ok(LogicalTimestamp::new(wall_time, parse_digits(s, logical)?))
            }
            None => {
                let (wall, logical) = input.split_once('.').unwrap_or((input, "0"));
                Ok(LogicalTimestamp::new(
                    parse_digits(s, wall)?,
                    parse_digits(s, logical)?,
                ))
            }
        }
    }

    /// Wall time component in nanoseconds since the Unix epoch.
    pub fn wall_time(&self) -> i64 {
        self.wall_time
    }

    pub fn logical(&self) -> u32 {
        self.logical
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.wall_time)
    }
}

fn parse_digits<T: FromStr>(input: &str, digits: &str) -> Result<T, ParseTimestampError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseTimestampError::new(input, "expected decimal digits"));
    }
    digits
        .parse::<T>()
        .map_err(|_| ParseTimestampError::new(input, "number out of range"))
}

// Fractional seconds, right-padded to nanosecond precision.
fn parse_fraction(input: &str, fraction: &str) -> Result<i64, ParseTimestampError> {
    if fraction.is_empty() {
        return Ok(0);
    }
    if fraction.len() > NANOS_DIGITS {
        return Err(ParseTimestampError::new(input, "sub-nanosecond precision"));
    }
    let nanos = parse_digits::<i64>(input, fraction)?;
    Ok(nanos * 10_i64.pow((NANOS_DIGITS - fraction.len()) as u32))
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:010}", self.wall_time, self.logical)
    }
}

impl FromStr for LogicalTimestamp {
    type Err = ParseTimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogicalTimestamp::parse(s)
    }
}

impl Serialize for LogicalTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LogicalTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        LogicalTimestamp::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hlc_rendering() {
        let ts = LogicalTimestamp::parse("1634000000000000000.0000000002").unwrap();
        assert_eq!(ts.wall_time(), 1_634_000_000_000_000_000);
        assert_eq!(ts.logical(), 2);
        assert_eq!(ts.to_string(), "1634000000000000000.0000000002");
    }

    #[test]
    fn test_parse_seconds_rendering() {
        let ts = LogicalTimestamp::parse("1634000000.000000000,0").unwrap();
        assert_eq!(ts.wall_time(), 1_634_000_000_000_000_000);
        assert_eq!(ts.logical(), 0);

        let ts = LogicalTimestamp::parse("1634000000.5,3").unwrap();
        assert_eq!(ts.wall_time(), 1_634_000_000_500_000_000);
        assert_eq!(ts.logical(), 3);
        assert_eq!(ts.to_datetime().timestamp(), 1_634_000_000);
    }

    #[test]
    fn test_parse_wall_only() {
        let ts = LogicalTimestamp::parse("42").unwrap();
        assert_eq!(ts, LogicalTimestamp::new(42, 0));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(LogicalTimestamp::parse("").is_err());
        assert!(LogicalTimestamp::parse("abc").is_err());
        assert!(LogicalTimestamp::parse("1.x").is_err());
        assert!(LogicalTimestamp::parse("-5.0").is_err());
        assert!(LogicalTimestamp::parse("1.0123456789,0").is_err());
    }

    #[test]
    fn test_ordering() {
        let a = LogicalTimestamp::new(10, 5);
        let b = LogicalTimestamp::new(10, 6);
        let c = LogicalTimestamp::new(11, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(
            LogicalTimestamp::parse("1634000000.000000000,0").unwrap(),
            LogicalTimestamp::parse("1634000000000000000.0000000000").unwrap()
        );
    }

    #[test]
    fn test_serde_as_string() {
        let ts = LogicalTimestamp::new(7, 1);
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"7.0000000001\"");
        let back: LogicalTimestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }
}
