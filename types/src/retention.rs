use chrono::{DateTime, Duration, Utc};
use std::{fmt, str::FromStr};

/// A pool's retention policy: either a sliding window after last use
/// (ISO-8601 duration) or a fixed expiry instant.
#[derive(Debug, Clone, PartialEq)]
pub enum Retention {
    After(Duration),
    Until(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionError(pub String);

impl fmt::Display for RetentionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid retention: {}", self.0)
    }
}

impl std::error::Error for RetentionError {}

impl FromStr for Retention {
    type Err = RetentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.starts_with('P') {
            parse_iso8601_duration(s)
                .map(Retention::After)
                .ok_or_else(|| RetentionError(s.to_owned()))
        } else {
            DateTime::parse_from_rfc3339(s)
                .map(|t| Retention::Until(t.with_timezone(&Utc)))
                .map_err(|_| RetentionError(s.to_owned()))
        }
    }
}

impl Retention {
    /// Whether an assignment last used at `last_used` is still reserved
    /// at `now`.
    pub fn is_live(&self, last_used: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Retention::After(duration) => last_used + *duration > now,
            Retention::Until(instant) => *instant > now,
        }
    }
}

/// Parses the duration subset of ISO-8601 (`PnDTnHnMnS`, also week form
/// `PnW`). Years and months are rejected; a calendar-relative retention
/// would not be well-defined here.
fn parse_iso8601_duration(s: &str) -> Option<Duration> {
    let body = s.strip_prefix('P')?;
    if body.is_empty() {
        return None;
    }
    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) if !t.is_empty() => (d, Some(t)),
        Some(_) => return None,
        None => (body, None),
    };

    let mut total = Duration::zero();
    let mut saw_component = false;

    let mut number = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else {
            let value: i64 = number.parse().ok()?;
            number.clear();
            saw_component = true;
            total += match c {
                'W' => Duration::weeks(value),
                'D' => Duration::days(value),
                _ => return None,
            };
        }
    }
    if !number.is_empty() {
        return None;
    }

    if let Some(time_part) = time_part {
        for c in time_part.chars() {
            if c.is_ascii_digit() {
                number.push(c);
            } else {
                let value: i64 = number.parse().ok()?;
                number.clear();
                saw_component = true;
                total += match c {
                    'H' => Duration::hours(value),
                    'M' => Duration::minutes(value),
                    'S' => Duration::seconds(value),
                    _ => return None,
                };
            }
        }
        if !number.is_empty() {
            return None;
        }
    }

    saw_component.then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_duration_forms() {
        assert_eq!(
            "PT1H".parse::<Retention>().unwrap(),
            Retention::After(Duration::hours(1))
        );
        assert_eq!(
            "PT1H30M".parse::<Retention>().unwrap(),
            Retention::After(Duration::minutes(90))
        );
        assert_eq!(
            "P1DT12H".parse::<Retention>().unwrap(),
            Retention::After(Duration::hours(36))
        );
        assert_eq!(
            "P2W".parse::<Retention>().unwrap(),
            Retention::After(Duration::weeks(2))
        );
    }

    #[test]
    fn parses_instants() {
        let parsed = "2030-01-01T00:00:00Z".parse::<Retention>().unwrap();
        let expected = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parsed, Retention::Until(expected));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("".parse::<Retention>().is_err());
        assert!("P".parse::<Retention>().is_err());
        assert!("PT".parse::<Retention>().is_err());
        assert!("PT1X".parse::<Retention>().is_err());
        assert!("P1Y".parse::<Retention>().is_err());
        assert!("yesterday".parse::<Retention>().is_err());
        assert!("PT1H30".parse::<Retention>().is_err());
    }

    #[test]
    fn duration_liveness_is_a_sliding_window() {
        let retention = "PT1H".parse::<Retention>().unwrap();
        let last_used = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        assert!(retention.is_live(last_used, last_used + Duration::minutes(59)));
        assert!(!retention.is_live(last_used, last_used + Duration::minutes(61)));
    }

    #[test]
    fn instant_liveness_ignores_last_use() {
        let expiry = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let retention = Retention::Until(expiry);
        let last_used = expiry - Duration::days(30);
        assert!(retention.is_live(last_used, expiry - Duration::seconds(1)));
        assert!(!retention.is_live(last_used, expiry + Duration::seconds(1)));
    }
}
