//! OCR payload normalization.
//!
//! The OCR collaborator emits one of three JSON shapes. The shape is resolved once
//! into [`OcrPayload`] and every shape is reduced to a [`CanonicalMetricMap`].
//! Unknown fields are dropped; malformed payloads yield an empty map.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{field_token, MetricVocabulary};
use crate::schema::CanonicalMetricMap;
use crate::values::coerce;

/// One entry of the `context_data` list shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextEntry {
    pub key: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub should_store: bool,
}

/// The OCR payload shapes, resolved at the boundary.
#[derive(Debug, Clone)]
pub enum OcrPayload {
    /// `{ "restingHeartRate": 58, ... }`
    Flat(Map<String, Value>),
    /// `{ "context_data": [{ "key", "value", "should_store" }] }`
    ContextData(Vec<ContextEntry>),
    /// `{ "daily_summary": { ... } }`
    DailySummary(Map<String, Value>),
    Unrecognized,
}

impl OcrPayload {
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::Unrecognized;
        };

        if let Some(list) = obj.get("context_data") {
            let Some(items) = list.as_array() else {
                return Self::Unrecognized;
            };
            let entries = items
                .iter()
                .filter_map(|item| match ContextEntry::deserialize(item) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        debug!("Skipping malformed context_data entry: {}", e);
                        None
                    }
                })
                .collect();
            return Self::ContextData(entries);
        }

        if let Some(summary) = obj.get("daily_summary") {
            return match summary.as_object() {
                Some(summary) => Self::DailySummary(summary.clone()),
                None => Self::Unrecognized,
            };
        }

        Self::Flat(obj.clone())
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::Flat(_) => "flat",
            Self::ContextData(_) => "context_data",
            Self::DailySummary(_) => "daily_summary",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// Reduces OCR payloads to canonical maps using the metric vocabulary.
#[derive(Clone)]
pub struct PayloadNormalizer {
    vocabulary: Arc<MetricVocabulary>,
}

impl PayloadNormalizer {
    pub fn new(vocabulary: Arc<MetricVocabulary>) -> Self {
        Self { vocabulary }
    }

    /// Normalize any payload shape. Never fails.
    pub fn normalize(&self, raw: &Value) -> CanonicalMetricMap {
        let payload = OcrPayload::from_value(raw);
        let map = match &payload {
            OcrPayload::Flat(fields) | OcrPayload::DailySummary(fields) => {
                self.normalize_object(fields)
            }
            OcrPayload::ContextData(entries) => self.normalize_entries(entries),
            OcrPayload::Unrecognized => CanonicalMetricMap::new(),
        };
        debug!(
            "Normalized {} payload into {} metrics",
            payload.shape(),
            map.len()
        );
        map
    }

    /// Walk the vocabulary in order; for each metric the first alias present with a
    /// usable value wins. A raw field feeds at most one metric.
    fn normalize_object(&self, fields: &Map<String, Value>) -> CanonicalMetricMap {
        let raw_fields: Vec<(String, &String, &Value)> = fields
            .iter()
            .map(|(name, value)| (field_token(name), name, value))
            .collect();

        let mut claimed: HashSet<&String> = HashSet::new();
        let mut map = CanonicalMetricMap::new();

        for def in self.vocabulary.iter() {
            'aliases: for alias in def.field_names() {
                let token = field_token(alias);
                for (raw_token, raw_name, raw_value) in &raw_fields {
                    if *raw_token != token || claimed.contains(raw_name) {
                        continue;
                    }
                    if let Some(value) = coerce(def.value_type, raw_value) {
                        claimed.insert(*raw_name);
                        map.set(def.key.clone(), Some(value));
                        break 'aliases;
                    }
                }
            }
        }

        for (_, raw_name, _) in &raw_fields {
            if !claimed.contains(raw_name) {
                debug!("Dropping unrecognized OCR field: {}", raw_name);
            }
        }

        map
    }

    fn normalize_entries(&self, entries: &[ContextEntry]) -> CanonicalMetricMap {
        let mut map = CanonicalMetricMap::new();
        for entry in entries.iter().filter(|e| e.should_store) {
            let Some(def) = self.vocabulary.resolve_field(&entry.key) else {
                debug!("Dropping unrecognized context_data key: {}", entry.key);
                continue;
            };
            match coerce(def.value_type, &entry.value) {
                Some(value) => map.set(def.key.clone(), Some(value)),
                None => debug!("Dropping uncoercible value for {}: {}", def.key, entry.value),
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_vocabulary;
    use crate::schema::MetricValue;
    use serde_json::json;

    fn normalizer() -> PayloadNormalizer {
        PayloadNormalizer::new(Arc::new(default_vocabulary()))
    }

    #[test]
    fn test_alias_priority_resting_before_generic() {
        let map = normalizer().normalize(&json!({
            "restingHeartRate": 58,
            "heartRate": 58
        }));
        assert_eq!(map.value("resting_heart_rate"), Some(&MetricValue::Number(58.0)));
        assert_eq!(map.value("heart_rate"), Some(&MetricValue::Number(58.0)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_raw_field_claimed_once() {
        let vocab = MetricVocabulary::from_json_str(
            r#"{"metrics": [
                {"key": "resting_heart_rate", "value_type": "numeric", "aliases": ["restingHeartRate", "heartRate"]},
                {"key": "heart_rate", "value_type": "numeric", "aliases": ["heartRate", "bpm"]}
            ]}"#,
        )
        .unwrap();
        let normalizer = PayloadNormalizer::new(Arc::new(vocab));

        let map = normalizer.normalize(&json!({"restingHeartRate": 52, "heartRate": 71}));
        assert_eq!(map.value("resting_heart_rate"), Some(&MetricValue::Number(52.0)));
        assert_eq!(map.value("heart_rate"), Some(&MetricValue::Number(71.0)));

        // Only the generic field present: the earlier entry claims it, no duplicate.
        let map = normalizer.normalize(&json!({"heartRate": 71}));
        assert_eq!(map.value("resting_heart_rate"), Some(&MetricValue::Number(71.0)));
        assert!(!map.contains_key("heart_rate"));
    }

    #[test]
    fn test_flat_payload_coerces_types_and_drops_unknown() {
        let map = normalizer().normalize(&json!({
            "Sleep Score": "82",
            "totalSleep": "7h 12m",
            "hrv": "45 ms",
            "workout_done": "yes",
            "app_version": "4.2.1",
            "battery": 77
        }));
        assert_eq!(map.value("sleep_score"), Some(&MetricValue::Number(82.0)));
        assert_eq!(map.value("total_sleep"), Some(&MetricValue::Duration(432)));
        assert_eq!(map.value("hrv"), Some(&MetricValue::Number(45.0)));
        assert_eq!(map.value("workout_completed"), Some(&MetricValue::Bool(true)));
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn test_uncoercible_alias_falls_through_to_next() {
        let map = normalizer().normalize(&json!({
            "hrv": "n/a",
            "heart_rate_variability": 38
        }));
        assert_eq!(map.value("hrv"), Some(&MetricValue::Number(38.0)));
    }

    #[test]
    fn test_context_data_respects_should_store() {
        let map = normalizer().normalize(&json!({
            "context_data": [
                {"key": "sleep_score", "value": 71, "should_store": true},
                {"key": "readinessScore", "value": "64", "should_store": true},
                {"key": "hrv", "value": 40, "should_store": false},
                {"key": "mood", "value": "ok", "should_store": true},
                {"oops": true}
            ]
        }));
        assert_eq!(map.value("sleep_score"), Some(&MetricValue::Number(71.0)));
        assert_eq!(map.value("readiness_score"), Some(&MetricValue::Number(64.0)));
        assert!(!map.contains_key("hrv"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_daily_summary_shape() {
        let map = normalizer().normalize(&json!({
            "daily_summary": {"deep_sleep": 95, "rem_sleep": "1h 40m", "steps": "9,432"}
        }));
        assert_eq!(map.value("deep_sleep"), Some(&MetricValue::Duration(95)));
        assert_eq!(map.value("rem_sleep"), Some(&MetricValue::Duration(100)));
        assert_eq!(map.value("steps"), Some(&MetricValue::Number(9432.0)));
    }

    #[test]
    fn test_malformed_payloads_yield_empty_map() {
        let n = normalizer();
        assert!(n.normalize(&json!(null)).is_empty());
        assert!(n.normalize(&json!([1, 2, 3])).is_empty());
        assert!(n.normalize(&json!({"context_data": "nope"})).is_empty());
        assert!(n.normalize(&json!({"daily_summary": 5})).is_empty());
        assert!(n.normalize(&json!({})).is_empty());
    }

    #[test]
    fn test_null_values_are_skipped() {
        let map = normalizer().normalize(&json!({"sleep_score": null, "hrv": 41}));
        assert!(!map.contains_key("sleep_score"));
        assert_eq!(map.len(), 1);
    }
}
