use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{OmniError, Result};

/// Accepts RFC3339 or a humantime duration meaning "that long ago".
pub fn parse_time_or_relative(input: &str) -> Result<DateTime<Utc>> {
    parse_time_at(input, Utc::now())
}

pub fn parse_time_at(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }

    if let Ok(duration) = humantime::parse_duration(input) {
        let delta = chrono::Duration::from_std(duration)
            .map_err(|e| OmniError::Parse(format!("duration out of range {input}: {e}")))?;
        return now
            .checked_sub_signed(delta)
            .ok_or_else(|| OmniError::Parse(format!("relative time out of range: {input}")));
    }

    Err(OmniError::Parse(format!(
        "expected RFC3339 time or duration, got {input}"
    )))
}

pub fn parse_duration_str(input: &str) -> Result<Duration> {
    humantime::parse_duration(input.trim())
        .map_err(|e| OmniError::Parse(format!("invalid duration {input}: {e}")))
}

/// `now - ttl`, saturating instead of overflowing on absurd TTLs.
pub fn cutoff_for_ttl(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_sub_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
