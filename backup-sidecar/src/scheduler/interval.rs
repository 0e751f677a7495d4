//! `<n><H|M|S>` interval strings, e.g. `30M`, `1H`, `10S`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted interval: one year.
pub const MAX_INTERVAL_SECS: u64 = 366 * 24 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Hours,
    Minutes,
    Seconds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    value: u64,
    unit: IntervalUnit,
}

impl Interval {
    pub fn hours(value: u64) -> Self {
        Self {
            value,
            unit: IntervalUnit::Hours,
        }
    }

    pub fn minutes(value: u64) -> Self {
        Self {
            value,
            unit: IntervalUnit::Minutes,
        }
    }

    pub fn seconds(value: u64) -> Self {
        Self {
            value,
            unit: IntervalUnit::Seconds,
        }
    }

    fn unit_secs(&self) -> u64 {
        match self.unit {
            IntervalUnit::Hours => 3600,
            IntervalUnit::Minutes => 60,
            IntervalUnit::Seconds => 1,
        }
    }

    /// Clamped to [`MAX_INTERVAL_SECS`]; parsed intervals never exceed it.
    pub fn as_duration(&self) -> Duration {
        let secs = self
            .value
            .saturating_mul(self.unit_secs())
            .min(MAX_INTERVAL_SECS);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIntervalError(String);

impl fmt::Display for ParseIntervalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "malformed interval {:?}: expected <positive integer><H|M|S> of at most 366 days",
            self.0
        )
    }
}

impl std::error::Error for ParseIntervalError {}

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIntervalError(s.to_string());
        let trimmed = s.trim();
        let unit_char = trimmed.chars().last().ok_or_else(err)?;
        let unit = match unit_char.to_ascii_uppercase() {
            'H' => IntervalUnit::Hours,
            'M' => IntervalUnit::Minutes,
            'S' => IntervalUnit::Seconds,
            _ => return Err(err()),
        };
        let digits = &trimmed[..trimmed.len() - unit_char.len_utf8()];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let value: u64 = digits.parse().map_err(|_| err())?;
        if value == 0 {
            return Err(err());
        }
        let interval = Self { value, unit };
        match value.checked_mul(interval.unit_secs()) {
            Some(secs) if secs <= MAX_INTERVAL_SECS => Ok(interval),
            _ => Err(err()),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            IntervalUnit::Hours => 'H',
            IntervalUnit::Minutes => 'M',
            IntervalUnit::Seconds => 'S',
        };
        write!(f, "{}{}", self.value, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units_case_insensitively() {
        assert_eq!("30M".parse::<Interval>().unwrap().as_duration(), Duration::from_secs(1800));
        assert_eq!("1h".parse::<Interval>().unwrap().as_duration(), Duration::from_secs(3600));
        assert_eq!("10S".parse::<Interval>().unwrap().as_duration(), Duration::from_secs(10));
        assert_eq!("2H".parse::<Interval>().unwrap().to_string(), "2H");
    }

    #[test]
    fn rejects_intervals_longer_than_a_year() {
        assert_eq!(
            "8784H".parse::<Interval>().unwrap().as_duration(),
            Duration::from_secs(MAX_INTERVAL_SECS)
        );
        for huge in ["8785H", "10000000000000000H", "18446744073709551615S", "99999999999999999999M"] {
            assert!(huge.parse::<Interval>().is_err(), "{huge:?} should be rejected");
        }
        assert_eq!(Interval::hours(u64::MAX).as_duration(), Duration::from_secs(MAX_INTERVAL_SECS));
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "M", "0M", "-5M", "10D", "1.5H", "ten minutes", "30"] {
            assert!(bad.parse::<Interval>().is_err(), "{bad:?} should be rejected");
        }
    }
}
