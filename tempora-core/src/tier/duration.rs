//! Human-readable duration parsing
//!
//! Accepts ISO-8601 durations (`PT2S`, `PT5M`, `P1DT12H`, `P2W`) and the
//! shorthand form (`2s`, `500ms`, `1h30m`, `7d`).

use crate::{Result, TemporaError};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

fn iso8601() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^P(?:(\d+)W)?(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?)?$",
        )
        .expect("static ISO-8601 pattern")
    })
}

fn shorthand() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)(ms|s|m|h|d|w)").expect("static shorthand pattern"))
}

/// Parse a duration string into a strictly positive `Duration`
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(TemporaError::Config("empty duration".into()));
    }

    let duration = if s.starts_with('P') {
        parse_iso8601(s)?
    } else {
        parse_shorthand(s)?
    };

    if duration.is_zero() {
        return Err(TemporaError::Config(format!(
            "duration '{}' must be positive",
            raw
        )));
    }

    Ok(duration)
}

fn parse_iso8601(s: &str) -> Result<Duration> {
    // "P" and "PT" alone match the pattern but carry no components
    if s == "P" || s.ends_with('T') {
        return Err(invalid(s));
    }

    let caps = iso8601().captures(s).ok_or_else(|| invalid(s))?;
    let int = |idx: usize, unit: u64| -> Result<u64> {
        match caps.get(idx) {
            Some(m) => m
                .as_str()
                .parse::<u64>()
                .ok()
                .and_then(|v| v.checked_mul(unit))
                .ok_or_else(|| invalid(s)),
            None => Ok(0),
        }
    };

    let whole = [int(1, 7 * 86_400)?, int(2, 86_400)?, int(3, 3600)?, int(4, 60)?]
        .into_iter()
        .try_fold(0u64, u64::checked_add)
        .ok_or_else(|| invalid(s))?;
    let seconds = match caps.get(5) {
        Some(m) => {
            let secs = m.as_str().parse::<f64>().map_err(|_| invalid(s))?;
            Duration::try_from_secs_f64(secs).map_err(|_| invalid(s))?
        }
        None => Duration::ZERO,
    };

    Duration::from_secs(whole)
        .checked_add(seconds)
        .ok_or_else(|| invalid(s))
}

fn parse_shorthand(s: &str) -> Result<Duration> {
    let mut total = Duration::ZERO;
    let mut consumed = 0;

    for caps in shorthand().captures_iter(s) {
        let whole = caps.get(0).ok_or_else(|| invalid(s))?;
        if whole.start() != consumed {
            return Err(invalid(s));
        }
        consumed = whole.end();

        let amount: u64 = caps[1].parse().map_err(|_| invalid(s))?;
        let part = match &caps[2] {
            "ms" => Some(Duration::from_millis(amount)),
            "s" => Some(Duration::from_secs(amount)),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            "h" => amount.checked_mul(3600).map(Duration::from_secs),
            "d" => amount.checked_mul(86_400).map(Duration::from_secs),
            "w" => amount.checked_mul(7 * 86_400).map(Duration::from_secs),
            _ => None,
        };
        total = part
            .and_then(|p| total.checked_add(p))
            .ok_or_else(|| invalid(s))?;
    }

    if consumed != s.len() || consumed == 0 {
        return Err(invalid(s));
    }

    Ok(total)
}

fn invalid(s: &str) -> TemporaError {
    TemporaError::Config(format!("unparsable duration '{}'", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso8601() {
        assert_eq!(parse_duration("PT2S").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("PT5M").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("P1DT12H").unwrap(), Duration::from_secs(129_600));
        assert_eq!(parse_duration("P2W").unwrap(), Duration::from_secs(1_209_600));
        assert_eq!(parse_duration("PT0.5S").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_shorthand() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "P", "PT", "abc", "5", "5x", "s5", "1h 30m", "-5s"] {
            assert!(
                matches!(parse_duration(bad), Err(TemporaError::Config(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_overflow() {
        for bad in [
            "18446744073709551615s1s",
            "18446744073709551616s",
            "307445734561825861m",
            "30500568904944w",
            "PT99999999999999999999999S",
            "P18446744073709551615D",
            "P30500568904943W1D",
        ] {
            assert!(
                matches!(parse_duration(bad), Err(TemporaError::Config(_))),
                "{bad} should be rejected"
            );
        }
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_rejects_zero() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("PT0S").is_err());
    }
}
