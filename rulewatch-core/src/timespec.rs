//! Parsers for the free-form `settle_time` and `rate_limit` rule fields.
//!
//! Both formats share the unit suffixes `s`, `m`, `h`, `d` and `w`; a missing
//! or unknown unit means minutes.

use std::time::Duration;

const DEFAULT_UNIT: char = 'm';

fn unit_seconds(unit: char) -> Option<u64> {
    match unit {
        's' => Some(1),
        'm' => Some(60),
        'h' => Some(60 * 60),
        'd' => Some(24 * 60 * 60),
        'w' => Some(7 * 24 * 60 * 60),
        _ => None,
    }
}

/// Parse `N[unit]` into a duration.
///
/// `N` may be fractional. Empty input, an unknown unit suffix, or an
/// unparseable number all yield zero; negative values clamp to zero.
pub fn parse_time(raw: &str) -> Duration {
    let raw = raw.trim();
    let Some(last) = raw.chars().last() else {
        return Duration::ZERO;
    };

    let (value, unit) = if last.is_ascii_digit() {
        (raw, DEFAULT_UNIT)
    } else {
        match unit_seconds(last) {
            Some(_) => (&raw[..raw.len() - last.len_utf8()], last),
            None => return Duration::ZERO,
        }
    };

    let Ok(number) = value.trim().parse::<f64>() else {
        return Duration::ZERO;
    };
    let multiplier = unit_seconds(unit).unwrap_or(60) as f64;
    let secs = number * multiplier;
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs)
}

/// A `count` per `period` limit. A non-positive count means "no limit".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimit {
    pub count: i64,
    pub period: Duration,
}

impl RateLimit {
    pub const fn unlimited() -> Self {
        Self {
            count: -1,
            period: Duration::from_secs(60),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.count > 0 && !self.period.is_zero()
    }
}

/// Parse `N/unit` into a [`RateLimit`].
///
/// A non-numeric `N` (including an empty field) yields `count == -1`.
pub fn parse_rate(raw: &str) -> RateLimit {
    let raw = raw.trim();
    let (number, unit) = match raw.split_once('/') {
        Some((number, unit)) => (number.trim(), unit.trim()),
        None => (raw, ""),
    };

    let count = if !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit()) {
        number.parse::<i64>().unwrap_or(-1)
    } else {
        -1
    };

    let mut chars = unit.chars();
    let unit_secs = match (chars.next(), chars.next()) {
        (Some(unit), None) => unit_seconds(unit),
        _ => None,
    }
    .unwrap_or(60);

    RateLimit {
        count,
        period: Duration::from_secs(unit_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_time_scales_by_unit() {
        let units = [('s', 1_u64), ('m', 60), ('h', 3_600), ('d', 86_400), ('w', 604_800)];
        for n in [0_u64, 1, 7, 52, 1_000] {
            for (unit, secs) in units {
                assert_eq!(
                    parse_time(&format!("{n}{unit}")),
                    Duration::from_secs(n * secs),
                    "{n}{unit}"
                );
            }
        }
    }

    #[test]
    fn parse_time_rejects_garbage_and_clamps() {
        assert_eq!(parse_time(""), Duration::ZERO);
        assert_eq!(parse_time("abc"), Duration::ZERO);
        assert_eq!(parse_time("-5s"), Duration::ZERO);
        assert_eq!(parse_time("5q"), Duration::ZERO);
        assert_eq!(parse_time("1.5s"), Duration::from_millis(1_500));
    }

    #[test]
    fn parse_time_without_unit_means_minutes() {
        assert_eq!(parse_time("2"), Duration::from_secs(120));
    }

    #[test]
    fn parse_rate_handles_units_and_defaults() {
        let rate = |count, secs| RateLimit {
            count,
            period: Duration::from_secs(secs),
        };
        assert_eq!(parse_rate("3/m"), rate(3, 60));
        assert_eq!(parse_rate("52/h"), rate(52, 3_600));
        assert_eq!(parse_rate("x/h"), rate(-1, 3_600));
        assert_eq!(parse_rate("3"), rate(3, 60));
        assert_eq!(parse_rate("3/q"), rate(3, 60));
        assert_eq!(parse_rate(""), rate(-1, 60));
        assert!(!parse_rate("").is_limited());
        assert!(parse_rate("2/s").is_limited());
    }
}
