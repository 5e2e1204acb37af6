use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EvaluationError;

/// Internal-data slot holding a waiting timer's deadline (RFC 3339).
pub const TIMER_SLOT: &str = "timer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    /// Fires at an absolute RFC 3339 timestamp.
    Date,
    /// Fires an ISO-8601 duration after the task starts waiting.
    Duration,
}

/// Computes the deadline from an evaluated timer expression.
pub fn deadline(kind: TimerKind, value: &Value, now: DateTime<Utc>) -> Result<DateTime<Utc>, EvaluationError> {
    let text = value
        .as_str()
        .ok_or_else(|| EvaluationError::new(format!("timer value {} is not a string", value)))?;
    match kind {
        TimerKind::Date => parse_date(text),
        TimerKind::Duration => now
            .checked_add_signed(parse_duration(text)?)
            .ok_or_else(|| EvaluationError::new(format!("timer duration '{}' overflows the calendar", text))),
    }
}

pub fn parse_date(text: &str) -> Result<DateTime<Utc>, EvaluationError> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| EvaluationError::new(format!("invalid timer date '{}': {}", text, e)))
}

/// Parses `PnYnMnWnDTnHnMnS`. Years count as 365 days and months as 30.
pub fn parse_duration(text: &str) -> Result<Duration, EvaluationError> {
    let invalid = || EvaluationError::new(format!("invalid ISO-8601 duration '{}'", text));
    let out_of_range = || EvaluationError::new(format!("duration '{}' is out of range", text));
    let body = text.strip_prefix('P').ok_or_else(invalid)?;
    if body.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::zero();
    let mut in_time = false;
    let mut number = String::new();
    let mut seen_component = false;

    for c in body.chars() {
        match c {
            'T' if !in_time && number.is_empty() => in_time = true,
            '0'..='9' | '.' => number.push(c),
            unit => {
                let n: f64 = number.parse().map_err(|_| invalid())?;
                number.clear();
                let seconds = match (in_time, unit) {
                    (false, 'Y') => n * 365.0 * 86_400.0,
                    (false, 'M') => n * 30.0 * 86_400.0,
                    (false, 'W') => n * 7.0 * 86_400.0,
                    (false, 'D') => n * 86_400.0,
                    (true, 'H') => n * 3_600.0,
                    (true, 'M') => n * 60.0,
                    (true, 'S') => n,
                    _ => return Err(invalid()),
                };
                let millis = (seconds * 1000.0).round();
                if millis >= i64::MAX as f64 {
                    return Err(out_of_range());
                }
                total = Duration::try_milliseconds(millis as i64)
                    .and_then(|part| total.checked_add(&part))
                    .ok_or_else(out_of_range)?;
                seen_component = true;
            }
        }
    }

    if !number.is_empty() || !seen_component {
        return Err(invalid());
    }
    Ok(total)
}
