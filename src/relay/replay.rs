//! Replay marker parsing
//!
//! A replay marker asks the relay to resend events this device missed. It is
//! either an RFC3339 timestamp or a duration counted back from now, and goes
//! over the wire as `since|timestamp|<value>` or `since|duration|<value>`.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::types::RelayError;

const NANOS_PER_MICRO: u128 = 1_000;
const NANOS_PER_MILLI: u128 = 1_000_000;
const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Duration units, longest prefix first so `ms` wins over `m`
const UNITS: &[(&str, u128)] = &[
    ("ns", 1),
    ("us", NANOS_PER_MICRO),
    ("\u{b5}s", NANOS_PER_MICRO),
    ("\u{3bc}s", NANOS_PER_MICRO),
    ("ms", NANOS_PER_MILLI),
    ("s", NANOS_PER_SECOND),
    ("m", 60 * NANOS_PER_SECOND),
    ("h", 3600 * NANOS_PER_SECOND),
];

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayMarker {
    /// Absolute point in time
    Timestamp { raw: String, cutoff: DateTime<Utc> },
    /// Relative window, resolved against the clock at parse time
    Duration {
        raw: String,
        window: Duration,
        cutoff: DateTime<Utc>,
    },
}

impl ReplayMarker {
    /// Parse an operator supplied marker; blank input means no replay
    pub fn parse(input: &str) -> Result<Option<Self>, RelayError> {
        Self::parse_at(input, Utc::now())
    }

    /// Parse against an explicit "now"
    pub fn parse_at(input: &str, now: DateTime<Utc>) -> Result<Option<Self>, RelayError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        let marker = match DateTime::parse_from_rfc3339(raw) {
            Ok(at) => ReplayMarker::Timestamp {
                raw: raw.to_string(),
                cutoff: at.with_timezone(&Utc),
            },
            Err(e) => {
                warn!(
                    "since is not a valid timestamp ({}), will try time duration",
                    e
                );
                let window = parse_go_duration(raw)
                    .ok_or_else(|| RelayError::InvalidReplayMarker(raw.to_string()))?;
                ReplayMarker::Duration {
                    raw: raw.to_string(),
                    window,
                    cutoff: now - window,
                }
            }
        };

        info!("will resend all discarded events after: {}", marker.cutoff());
        Ok(Some(marker))
    }

    /// Tagged form sent as the first text frame
    pub fn to_wire(&self) -> String {
        match self {
            ReplayMarker::Timestamp { raw, .. } => format!("since|timestamp|{}", raw),
            ReplayMarker::Duration { raw, .. } => format!("since|duration|{}", raw),
        }
    }

    /// Events discarded after this instant get resent
    pub fn cutoff(&self) -> DateTime<Utc> {
        match self {
            ReplayMarker::Timestamp { cutoff, .. } | ReplayMarker::Duration { cutoff, .. } => {
                *cutoff
            }
        }
    }
}

/// Parse a duration string such as `42m`, `1h30m`, `1.5h` or `300ms`
pub fn parse_go_duration(input: &str) -> Option<Duration> {
    let (negative, mut rest) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };

    if rest == "0" {
        return Some(Duration::zero());
    }
    if rest.is_empty() {
        return None;
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let (int_part, after_int) = rest.split_at(int_len);

        let (frac_part, after_number) = match after_int.strip_prefix('.') {
            Some(after_dot) => {
                let frac_len = after_dot.bytes().take_while(u8::is_ascii_digit).count();
                after_dot.split_at(frac_len)
            }
            None => ("", after_int),
        };

        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }

        let (unit, after_unit) = UNITS
            .iter()
            .find_map(|(name, nanos)| after_number.strip_prefix(name).map(|r| (*nanos, r)))?;

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().ok()?
        };
        let mut nanos = whole.checked_mul(unit)?;

        let mut scale = unit;
        for digit in frac_part.bytes() {
            scale /= 10;
            if scale == 0 {
                break;
            }
            nanos = nanos.checked_add(u128::from(digit - b'0') * scale)?;
        }

        total = total.checked_add(nanos)?;
        rest = after_unit;
    }

    let nanos = i64::try_from(total).ok()?;
    let duration = Duration::nanoseconds(nanos);
    Some(if negative { -duration } else { duration })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_blank_marker_is_absent() {
        assert_eq!(ReplayMarker::parse_at("", now()).unwrap(), None);
        assert_eq!(ReplayMarker::parse_at("   ", now()).unwrap(), None);
    }

    #[test]
    fn test_timestamp_marker() {
        let marker = ReplayMarker::parse_at("2013-01-02T13:23:37Z", now())
            .unwrap()
            .unwrap();

        assert_eq!(marker.to_wire(), "since|timestamp|2013-01-02T13:23:37Z");
        assert_eq!(
            marker.cutoff(),
            Utc.with_ymd_and_hms(2013, 1, 2, 13, 23, 37).unwrap()
        );
    }

    #[test]
    fn test_timestamp_marker_with_offset() {
        let marker = ReplayMarker::parse_at("2024-05-01T14:00:00+02:00", now())
            .unwrap()
            .unwrap();
        assert_eq!(marker.cutoff(), now());
        assert_eq!(marker.to_wire(), "since|timestamp|2024-05-01T14:00:00+02:00");
    }

    #[test]
    fn test_duration_marker_subtracts_from_now() {
        let marker = ReplayMarker::parse_at("42m", now()).unwrap().unwrap();

        assert_eq!(marker.to_wire(), "since|duration|42m");
        assert_eq!(marker.cutoff(), now() - Duration::minutes(42));
        assert!(matches!(
            marker,
            ReplayMarker::Duration { window, .. } if window == Duration::minutes(42)
        ));
    }

    #[test]
    fn test_invalid_marker_is_fatal() {
        for input in ["yesterday", "42", "2013-01-02", "1x", "h"] {
            let result = ReplayMarker::parse_at(input, now());
            assert!(
                matches!(result, Err(RelayError::InvalidReplayMarker(ref raw)) if raw == input),
                "{} should be rejected",
                input
            );
        }
    }

    #[test]
    fn test_go_duration_units() {
        assert_eq!(parse_go_duration("300ms"), Some(Duration::milliseconds(300)));
        assert_eq!(parse_go_duration("1h30m"), Some(Duration::minutes(90)));
        assert_eq!(parse_go_duration("1.5h"), Some(Duration::minutes(90)));
        assert_eq!(parse_go_duration(".5s"), Some(Duration::milliseconds(500)));
        assert_eq!(parse_go_duration("10us"), Some(Duration::microseconds(10)));
        assert_eq!(parse_go_duration("10\u{b5}s"), Some(Duration::microseconds(10)));
        assert_eq!(parse_go_duration("7ns"), Some(Duration::nanoseconds(7)));
        assert_eq!(parse_go_duration("2h45m10s"), Some(Duration::seconds(9910)));
        assert_eq!(parse_go_duration("0"), Some(Duration::zero()));
        assert_eq!(parse_go_duration("-1m"), Some(-Duration::minutes(1)));
    }

    #[test]
    fn test_go_duration_rejects_garbage() {
        for input in ["", "-", "5", "m", "1..5s", "5d", "1h ", "99999999999999999h"] {
            assert_eq!(parse_go_duration(input), None, "{:?}", input);
        }
    }
}
