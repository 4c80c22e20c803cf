//! Canonical metric data model.
//!
//! Maps are keyed by canonical metric keys from the vocabulary; a `None` value is an
//! explicit null meaning "remove this field".

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A typed metric value. Serialized as a plain JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    /// Whole minutes.
    Duration(i64),
    Text(String),
    Bool(bool),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) if n.fract() == 0.0 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{}", n),
            Self::Duration(m) => write!(f, "{}h {:02}m", m / 60, m % 60),
            Self::Text(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Ordered map of canonical metric key → value or explicit null.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CanonicalMetricMap {
    entries: BTreeMap<String, Option<MetricValue>>,
}

impl CanonicalMetricMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Option<MetricValue>) {
        self.entries.insert(key.into(), value);
    }

    /// Raw entry: `None` if absent, `Some(None)` if explicitly null.
    pub fn entry(&self, key: &str) -> Option<&Option<MetricValue>> {
        self.entries.get(key)
    }

    /// Current value, treating absent and null alike.
    pub fn value(&self, key: &str) -> Option<&MetricValue> {
        self.entries.get(key).and_then(Option::as_ref)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<MetricValue>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys whose effective value differs between `self` and `other`.
    pub fn diff_keys(&self, other: &CanonicalMetricMap) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .keys()
            .chain(other.entries.keys())
            .filter(|k| self.value(k) != other.value(k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Sub-map restricted to `keys`, preserving explicit nulls.
    pub fn subset<'a>(&self, keys: impl IntoIterator<Item = &'a String>) -> CanonicalMetricMap {
        let mut out = CanonicalMetricMap::new();
        for key in keys {
            if let Some(value) = self.entries.get(key) {
                out.set(key.clone(), value.clone());
            }
        }
        out
    }
}

/// `hrv=52, resting_heart_rate=null`
impl fmt::Display for CanonicalMetricMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match value {
                Some(value) => write!(f, "{}={}", key, value)?,
                None => write!(f, "{}=null", key)?,
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, Option<MetricValue>)> for CanonicalMetricMap {
    fn from_iter<T: IntoIterator<Item = (String, Option<MetricValue>)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// How a stored field got its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    Ocr,
    Conversation,
    Correction,
}

impl MetricSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ocr => "ocr",
            Self::Conversation => "conversation",
            Self::Correction => "correction",
        }
    }

    /// Confidence attached to fields written from this source.
    pub fn default_confidence(&self) -> f64 {
        match self {
            Self::Ocr => 0.8,
            Self::Conversation => 0.7,
            // The user stated the value directly.
            Self::Correction => 1.0,
        }
    }
}

impl FromStr for MetricSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ocr" => Ok(Self::Ocr),
            "conversation" => Ok(Self::Conversation),
            "correction" => Ok(Self::Correction),
            other => Err(format!("Unknown metric source: {}", other)),
        }
    }
}

/// Per-field provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldProvenance {
    pub source: MetricSource,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

impl FieldProvenance {
    pub fn now(source: MetricSource) -> Self {
        Self {
            source,
            confidence: source.default_confidence(),
            updated_at: Utc::now(),
        }
    }
}

/// Identity of a per-day record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub user_id: String,
    pub metric_date: NaiveDate,
}

impl RecordKey {
    pub fn new(user_id: impl Into<String>, metric_date: NaiveDate) -> Self {
        Self {
            user_id: user_id.into(),
            metric_date,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.metric_date)
    }
}

/// Authoritative metrics for one user on one day.
#[derive(Debug, Clone, Serialize)]
pub struct DailyMetricRecord {
    pub user_id: String,
    pub metric_date: NaiveDate,
    pub metrics: CanonicalMetricMap,
    pub provenance: BTreeMap<String, FieldProvenance>,
}

impl DailyMetricRecord {
    pub fn new(key: &RecordKey) -> Self {
        Self {
            user_id: key.user_id.clone(),
            metric_date: key.metric_date,
            metrics: CanonicalMetricMap::new(),
            provenance: BTreeMap::new(),
        }
    }
}

/// A detected correction: what we believed, what the user said, and the result.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionEvent {
    pub id: String,
    pub original_map: CanonicalMetricMap,
    pub raw_text: String,
    pub corrected_map: CanonicalMetricMap,
    pub changed_keys: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl CorrectionEvent {
    pub fn new(
        original_map: CanonicalMetricMap,
        raw_text: impl Into<String>,
        corrected_map: CanonicalMetricMap,
    ) -> Self {
        let changed_keys = original_map.diff_keys(&corrected_map);
        Self {
            id: format!("corr_{}", Uuid::new_v4().simple()),
            original_map,
            raw_text: raw_text.into(),
            corrected_map,
            changed_keys,
            created_at: Utc::now(),
        }
    }

    /// Only the fields this correction changed.
    pub fn delta(&self) -> CanonicalMetricMap {
        self.corrected_map.subset(&self.changed_keys)
    }
}

/// Append-only (original, corrected, raw text) triple.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSample {
    pub event_id: String,
    pub original_map: CanonicalMetricMap,
    pub corrected_map: CanonicalMetricMap,
    pub raw_text: String,
    pub created_at: DateTime<Utc>,
}

impl From<&CorrectionEvent> for TrainingSample {
    fn from(event: &CorrectionEvent) -> Self {
        Self {
            event_id: event.id.clone(),
            original_map: event.original_map.clone(),
            corrected_map: event.corrected_map.clone(),
            raw_text: event.raw_text.clone(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, Option<MetricValue>)]) -> CanonicalMetricMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_diff_keys_treats_absent_as_null() {
        let a = map(&[("hrv", Some(MetricValue::Number(40.0))), ("steps", None)]);
        let b = map(&[("hrv", Some(MetricValue::Number(30.0)))]);
        assert_eq!(a.diff_keys(&b), vec!["hrv".to_string()]);
    }

    #[test]
    fn test_correction_event_delta() {
        let original = map(&[
            ("hrv", Some(MetricValue::Number(40.0))),
            ("sleep_score", Some(MetricValue::Number(70.0))),
        ]);
        let mut corrected = original.clone();
        corrected.set("sleep_score", None);

        let event = CorrectionEvent::new(original, "there is no sleep score", corrected);
        assert!(event.id.starts_with("corr_"));
        assert_eq!(event.changed_keys, vec!["sleep_score".to_string()]);
        assert_eq!(event.delta(), map(&[("sleep_score", None)]));
    }

    #[test]
    fn test_source_parses_from_stored_text() {
        assert_eq!("correction".parse::<MetricSource>(), Ok(MetricSource::Correction));
        assert_eq!(
            MetricSource::Conversation.as_str().parse::<MetricSource>(),
            Ok(MetricSource::Conversation)
        );
        assert!("manual".parse::<MetricSource>().is_err());
    }

    #[test]
    fn test_value_display() {
        assert_eq!(MetricValue::Duration(450).to_string(), "7h 30m");
        assert_eq!(MetricValue::Number(58.0).to_string(), "58");
        assert_eq!(MetricValue::Number(36.6).to_string(), "36.6");

        let m = map(&[("hrv", Some(MetricValue::Number(52.0))), ("rhr", None)]);
        assert_eq!(m.to_string(), "hrv=52, rhr=null");
    }

    #[test]
    fn test_map_serializes_as_plain_object() {
        let m = map(&[
            ("total_sleep", Some(MetricValue::Duration(450))),
            ("hrv", None),
        ]);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json, serde_json::json!({"hrv": null, "total_sleep": 450}));
    }
}
