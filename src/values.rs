//! Value coercion shared by the payload normalizer and the correction extractor.

use std::ops::Range;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::config::ValueType;
use crate::schema::MetricValue;

/// `7h 30m`, `7 hours and 30 minutes`, `7.5h`, `45 min`.
///
/// A unit is required: `7:30` in chat is a time of day as often as a duration.
pub const DURATION_PATTERN: &str = r"(?P<h>\d+(?:\.\d+)?)\s*(?:hours?|hrs?|h)(?:\s*(?:and\s*)?(?P<hm>\d+)\s*(?:minutes?|mins?|m)\b)?|(?P<m>\d+)\s*(?:minutes?|mins?|m)\b";

/// Whole-field `H:MM`, as dashboards print durations.
const CLOCK_DURATION_PATTERN: &str = r"^\s*(?P<h>\d{1,2}):(?P<m>[0-5]\d)\s*$";

/// Number with optional thousands separators (`12,000`, `36.6`, `-3`).
///
/// A macro so the assertion rules can splice it into their own patterns.
macro_rules! number_pattern {
    () => {
        r"-?\d{1,3}(?:,\d{3})+(?:\.\d+)?|-?\d+(?:\.\d+)?"
    };
}
pub(crate) use number_pattern;

const NUMBER_PATTERN: &str = number_pattern!();

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DURATION_PATTERN).expect("duration pattern compiles"))
}

fn clock_duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CLOCK_DURATION_PATTERN).expect("clock pattern compiles"))
}

fn number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(NUMBER_PATTERN).expect("number pattern compiles"))
}

/// First number in `text`. Accepts thousands separators (`9,432`) and trailing units (`58 bpm`).
pub fn parse_number(text: &str) -> Option<f64> {
    let m = number_regex().find(text)?;
    parse_number_token(m.as_str())
}

/// Parse a matched [`NUMBER_PATTERN`] token, dropping thousands separators.
pub fn parse_number_token(token: &str) -> Option<f64> {
    token.replace(',', "").parse().ok()
}

/// True when the text right after a number makes it a time of day
/// (`6am`, `6 pm`, `6:45`, `6h`, `6 o'clock`).
pub fn is_clock_suffix(rest: &str) -> bool {
    let rest = rest.trim_start();
    if rest.starts_with(':') {
        return true;
    }
    ["am", "pm", "a.m", "p.m", "o'clock", "h"].iter().any(|suffix| {
        rest.strip_prefix(suffix)
            .map_or(false, |tail| !tail.starts_with(|c: char| c.is_ascii_alphabetic()))
    })
}

/// First duration expression in `text`, as whole minutes plus the matched byte range.
pub fn find_duration(text: &str) -> Option<(i64, Range<usize>)> {
    let caps = duration_regex().captures(text)?;
    let whole = caps.get(0)?;
    Some((duration_from_captures(&caps)?, whole.range()))
}

/// Minutes from a match of [`DURATION_PATTERN`].
pub fn duration_from_captures(caps: &Captures<'_>) -> Option<i64> {
    if let Some(h) = caps.name("h") {
        let hours: f64 = h.as_str().parse().ok()?;
        let extra: f64 = caps
            .name("hm")
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0.0);
        Some((hours * 60.0 + extra).round() as i64)
    } else {
        caps.name("m")?.as_str().parse().ok()
    }
}

/// Duration in minutes from a payload field. `H:MM` and bare numbers (minutes)
/// are accepted here because the whole field is the value.
pub fn parse_duration_minutes(text: &str) -> Option<i64> {
    if let Some((minutes, _)) = find_duration(text) {
        return Some(minutes);
    }
    if let Some(caps) = clock_duration_regex().captures(text) {
        let hours: i64 = caps.name("h")?.as_str().parse().ok()?;
        let mins: i64 = caps.name("m")?.as_str().parse().ok()?;
        return Some(hours * 60 + mins);
    }
    text.trim().parse::<f64>().ok().map(|m| m.round() as i64)
}

pub fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "done" | "completed" => Some(true),
        "false" | "no" | "n" | "0" | "skipped" => Some(false),
        _ => None,
    }
}

/// Coerce a raw JSON value to the metric's declared type.
/// Nulls, empty strings and values of the wrong shape yield `None`.
pub fn coerce(value_type: ValueType, raw: &Value) -> Option<MetricValue> {
    match (value_type, raw) {
        (_, Value::Null) => None,

        (ValueType::Numeric, Value::Number(n)) => n.as_f64().map(MetricValue::Number),
        (ValueType::Numeric, Value::String(s)) => parse_number(s).map(MetricValue::Number),

        (ValueType::DurationMinutes, Value::Number(n)) => {
            n.as_f64().map(|m| MetricValue::Duration(m.round() as i64))
        }
        (ValueType::DurationMinutes, Value::String(s)) => {
            parse_duration_minutes(s).map(MetricValue::Duration)
        }

        (ValueType::Text, Value::String(s)) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| MetricValue::Text(trimmed.to_string()))
        }
        (ValueType::Text, Value::Number(n)) => Some(MetricValue::Text(n.to_string())),
        (ValueType::Text, Value::Bool(b)) => Some(MetricValue::Text(b.to_string())),

        (ValueType::Boolean, Value::Bool(b)) => Some(MetricValue::Bool(*b)),
        (ValueType::Boolean, Value::String(s)) => parse_bool(s).map(MetricValue::Bool),
        (ValueType::Boolean, Value::Number(n)) => match n.as_i64() {
            Some(0) => Some(MetricValue::Bool(false)),
            Some(1) => Some(MetricValue::Bool(true)),
            _ => None,
        },

        _ => None,
    }
}
