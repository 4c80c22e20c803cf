//! Field-level merge of canonical maps into day records.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::schema::{CanonicalMetricMap, FieldProvenance, MetricSource, RecordKey};
use crate::store::{FieldWrite, MetricCatalog, RecordStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub merged: CanonicalMetricMap,
    pub changed_keys: Vec<String>,
}

/// Overlay `incoming` on `existing`.
///
/// A key is written only when its effective value differs; an explicit null over a
/// stored value removes it. Keys absent from `incoming` are left alone.
pub fn merge_maps(existing: &CanonicalMetricMap, incoming: &CanonicalMetricMap) -> MergeOutcome {
    let mut merged = existing.clone();
    let mut changed_keys = Vec::new();

    for (key, value) in incoming.iter() {
        if existing.value(key) == value.as_ref() {
            continue;
        }
        merged.set(key.clone(), value.clone());
        changed_keys.push(key.clone());
    }

    MergeOutcome {
        merged,
        changed_keys,
    }
}

/// Resolves catalog ids and hands the field writes to the record store.
#[derive(Clone)]
pub struct MergeEngine {
    catalog: Arc<dyn MetricCatalog>,
    store: Arc<dyn RecordStore>,
}

impl MergeEngine {
    pub fn new(catalog: Arc<dyn MetricCatalog>, store: Arc<dyn RecordStore>) -> Self {
        Self { catalog, store }
    }

    /// Merge `incoming` into the record at `key`.
    ///
    /// Keys the catalog does not know are dropped with a warning; the rest is written.
    pub async fn apply(
        &self,
        key: &RecordKey,
        incoming: &CanonicalMetricMap,
        source: MetricSource,
    ) -> Result<MergeOutcome, StoreError> {
        if incoming.is_empty() {
            debug!("Nothing to merge for {}", key);
            return Ok(MergeOutcome::default());
        }

        let mut writes = Vec::with_capacity(incoming.len());
        for (metric_key, value) in incoming.iter() {
            match self.catalog.metric_id(metric_key).await? {
                Some(metric_id) => writes.push(FieldWrite {
                    metric_key: metric_key.clone(),
                    metric_id,
                    value: value.clone(),
                }),
                None => warn!("Metric '{}' is not in the catalog; dropping it", metric_key),
            }
        }

        let outcome = self
            .store
            .merge(key, &writes, &FieldProvenance::now(source))
            .await?;

        if outcome.changed_keys.is_empty() {
            debug!("No changes for {} from {}", key, source.as_str());
        } else {
            info!(
                "Merged {} changed fields into {} from {}: {:?}",
                outcome.changed_keys.len(),
                key,
                source.as_str(),
                outcome.changed_keys
            );
        }
        Ok(outcome)
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_vocabulary;
    use crate::schema::MetricValue;
    use crate::store::{MemoryRecordStore, VocabularyCatalog};
    use chrono::NaiveDate;

    fn map(entries: &[(&str, Option<MetricValue>)]) -> CanonicalMetricMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn num(n: f64) -> Option<MetricValue> {
        Some(MetricValue::Number(n))
    }

    #[test]
    fn test_merge_is_idempotent() {
        let existing = map(&[("hrv", num(40.0))]);
        let incoming = map(&[("hrv", num(45.0)), ("steps", num(9000.0))]);

        let first = merge_maps(&existing, &incoming);
        assert_eq!(first.changed_keys, vec!["hrv", "steps"]);

        let second = merge_maps(&first.merged, &incoming);
        assert!(second.changed_keys.is_empty());
        assert_eq!(second.merged, first.merged);
    }

    #[test]
    fn test_untouched_fields_survive() {
        let existing = map(&[("hrv", num(40.0)), ("sleep_score", num(70.0))]);
        let outcome = merge_maps(&existing, &map(&[("hrv", num(45.0))]));
        assert_eq!(outcome.merged.value("sleep_score"), Some(&MetricValue::Number(70.0)));
        assert_eq!(outcome.changed_keys, vec!["hrv"]);
    }

    #[test]
    fn test_null_removes_value() {
        let existing = map(&[("resting_heart_rate", num(72.0))]);
        let outcome = merge_maps(&existing, &map(&[("resting_heart_rate", None)]));
        assert_eq!(outcome.changed_keys, vec!["resting_heart_rate"]);
        assert_eq!(outcome.merged.entry("resting_heart_rate"), Some(&None));
    }

    #[test]
    fn test_null_over_absent_is_not_a_change() {
        let outcome = merge_maps(&CanonicalMetricMap::new(), &map(&[("hrv", None)]));
        assert!(outcome.changed_keys.is_empty());
        assert!(!outcome.merged.contains_key("hrv"));
    }

    fn engine(catalog_vocab: crate::config::MetricVocabulary) -> (MergeEngine, MemoryRecordStore) {
        let store = MemoryRecordStore::new();
        let catalog = VocabularyCatalog::new(Arc::new(catalog_vocab));
        (
            MergeEngine::new(Arc::new(catalog), Arc::new(store.clone())),
            store,
        )
    }

    fn key() -> RecordKey {
        RecordKey::new("user-1", NaiveDate::from_ymd_opt(2024, 3, 2).unwrap())
    }

    #[tokio::test]
    async fn test_unknown_catalog_key_dropped_rest_written() {
        let vocab = crate::config::MetricVocabulary::from_json_str(
            r#"{"metrics": [{"key": "hrv", "value_type": "numeric"}]}"#,
        )
        .unwrap();
        let (engine, store) = engine(vocab);

        let outcome = engine
            .apply(
                &key(),
                &map(&[("hrv", num(45.0)), ("steps", num(9000.0))]),
                MetricSource::Ocr,
            )
            .await
            .unwrap();
        assert_eq!(outcome.changed_keys, vec!["hrv"]);

        let record = store.fetch(&key()).await.unwrap().unwrap();
        assert!(!record.metrics.contains_key("steps"));
    }

    #[tokio::test]
    async fn test_apply_twice_reports_no_changes() {
        let (engine, _store) = engine(default_vocabulary());
        let incoming = map(&[("sleep_score", num(81.0))]);

        let first = engine.apply(&key(), &incoming, MetricSource::Ocr).await.unwrap();
        assert_eq!(first.changed_keys.len(), 1);
        let second = engine.apply(&key(), &incoming, MetricSource::Ocr).await.unwrap();
        assert!(second.changed_keys.is_empty());
    }
}
