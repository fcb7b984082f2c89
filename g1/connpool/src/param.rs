//! Loading a `PoolBuilder` from configuration data.
//!
//! Durations are written in a human-readable form, such as `"1m 30s"` or `"500ms"`, and `wait` is
//! one of `"forever"`, `"never"`, or a duration.

use std::str::FromStr;
use std::time::Duration;

use lazy_regex::regex;
use serde::de::{Deserialize, Deserializer, Error as _};
use snafu::prelude::*;

use crate::Wait;

#[derive(Debug, Snafu)]
#[snafu(display("invalid {what}: {value:?}"))]
pub struct ParseError {
    what: &'static str,
    value: String,
}

pub fn parse_duration(duration: &str) -> Result<Duration, ParseError> {
    try_parse_duration(duration).ok_or_else(|| ParseError {
        what: "duration",
        value: duration.to_string(),
    })
}

fn try_parse_duration(duration: &str) -> Option<Duration> {
    // Longer units go first; otherwise `ms` would be matched as `m` followed by a stray `s`.
    if !regex!(r"(?i)^\s*(?:\d+\s*(?:ms|us|ns|h|m|s)\s*)+$").is_match(duration) {
        return None;
    }
    let mut acc = Duration::ZERO;
    for (_, [amount, unit]) in regex!(r"(?i)(\d+)\s*(ms|us|ns|h|m|s)")
        .captures_iter(duration)
        .map(|c| c.extract())
    {
        let amount = amount.parse::<u64>().ok()?;
        let part = match unit.to_ascii_lowercase().as_str() {
            "h" => Duration::from_secs(amount.checked_mul(3600)?),
            "m" => Duration::from_secs(amount.checked_mul(60)?),
            "s" => Duration::from_secs(amount),
            "ms" => Duration::from_millis(amount),
            "us" => Duration::from_micros(amount),
            "ns" => Duration::from_nanos(amount),
            _ => std::unreachable!(),
        };
        acc = acc.checked_add(part)?;
    }
    Some(acc)
}

impl FromStr for Wait {
    type Err = ParseError;

    fn from_str(wait: &str) -> Result<Self, Self::Err> {
        match wait.trim() {
            wait if wait.eq_ignore_ascii_case("forever") => Ok(Self::Forever),
            wait if wait.eq_ignore_ascii_case("never") => Ok(Self::Never),
            _ => try_parse_duration(wait)
                .map(Self::Timeout)
                .ok_or_else(|| ParseError {
                    what: "wait",
                    value: wait.to_string(),
                }),
        }
    }
}

impl<'de> Deserialize<'de> for Wait {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        <String>::deserialize(deserializer)?
            .parse()
            .map_err(D::Error::custom)
    }
}

pub(crate) fn duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    parse_duration(&<String>::deserialize(deserializer)?).map_err(D::Error::custom)
}

#[cfg(test)]
mod tests {
    use crate::PoolBuilder;

    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(try_parse_duration("1s"), Some(Duration::from_secs(1)));
        assert_eq!(try_parse_duration("2ms"), Some(Duration::from_millis(2)));
        assert_eq!(try_parse_duration("3us"), Some(Duration::from_micros(3)));
        assert_eq!(try_parse_duration("4ns"), Some(Duration::from_nanos(4)));
        assert_eq!(try_parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(try_parse_duration("6h"), Some(Duration::from_secs(21600)));
        assert_eq!(try_parse_duration("0s"), Some(Duration::ZERO));

        assert_eq!(
            try_parse_duration(" 1h 2m\t3s 4MS 5us 6Ns "),
            Some(
                Duration::from_secs(3723)
                    + Duration::from_millis(4)
                    + Duration::from_micros(5)
                    + Duration::from_nanos(6)
            ),
        );
        assert_eq!(try_parse_duration("1m30s"), Some(Duration::from_secs(90)));

        assert_eq!(try_parse_duration(""), None);
        assert_eq!(try_parse_duration("  "), None);
        assert_eq!(try_parse_duration("1"), None);
        assert_eq!(try_parse_duration("s"), None);
        assert_eq!(try_parse_duration("1s abc"), None);
        assert_eq!(try_parse_duration("0.5s"), None);
        assert_eq!(try_parse_duration("-1s"), None);
        assert_eq!(try_parse_duration("1d"), None);
        assert_eq!(try_parse_duration("99999999999999999999h"), None);

        assert_eq!(
            parse_duration("x").unwrap_err().to_string(),
            "invalid duration: \"x\"",
        );
    }

    #[test]
    fn parse_wait() {
        assert_eq!("forever".parse::<Wait>().unwrap(), Wait::Forever);
        assert_eq!("Never".parse::<Wait>().unwrap(), Wait::Never);
        assert_eq!(
            "3s".parse::<Wait>().unwrap(),
            Wait::Timeout(Duration::from_secs(3)),
        );
        assert_eq!(
            "sometimes".parse::<Wait>().unwrap_err().to_string(),
            "invalid wait: \"sometimes\"",
        );
    }

    #[test]
    fn deserialize() {
        let builder: PoolBuilder = serde_json::from_str(
            r#"{"max_active": 1, "reserved_idle": 2, "idle_timeout": "1s", "wait": "3s"}"#,
        )
        .unwrap();
        assert_eq!(builder.max_active, 1);
        assert_eq!(builder.reserved_idle, 2);
        assert_eq!(builder.idle_timeout, Duration::from_secs(1));
        assert_eq!(builder.wait, Wait::Timeout(Duration::from_secs(3)));

        let builder: PoolBuilder = serde_json::from_str(r#"{"wait": "never"}"#).unwrap();
        assert_eq!(builder.max_active, 0);
        assert_eq!(builder.idle_timeout, Duration::ZERO);
        assert_eq!(builder.wait, Wait::Never);

        assert!(serde_json::from_str::<PoolBuilder>(r#"{"max_idle": 1}"#).is_err());
        assert!(serde_json::from_str::<PoolBuilder>(r#"{"idle_timeout": "soon"}"#).is_err());
        assert!(serde_json::from_str::<PoolBuilder>(r#"{"clock": "system"}"#).is_err());
    }
}
