//! Storage seams and the in-memory backend.
//!
//! The pipeline only talks to [`RecordStore`], [`MetricCatalog`] and [`TrainingSink`];
//! `supabase` provides the hosted implementations, this module the in-memory ones
//! used for tests and local runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::MetricVocabulary;
use crate::error::StoreError;
use crate::merge::{merge_maps, MergeOutcome};
use crate::schema::{
    CanonicalMetricMap, DailyMetricRecord, FieldProvenance, MetricValue, RecordKey,
    TrainingSample,
};

/// One field to upsert, with its catalog id already resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldWrite {
    pub metric_key: String,
    pub metric_id: String,
    pub value: Option<MetricValue>,
}

/// Canonical map of the values carried by `writes`.
pub fn writes_to_map(writes: &[FieldWrite]) -> CanonicalMetricMap {
    writes
        .iter()
        .map(|w| (w.metric_key.clone(), w.value.clone()))
        .collect()
}

/// Per-day metric records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch(&self, key: &RecordKey) -> Result<Option<DailyMetricRecord>, StoreError>;

    /// Read the record, diff it against `writes` and persist only the changed fields.
    async fn merge(
        &self,
        key: &RecordKey,
        writes: &[FieldWrite],
        provenance: &FieldProvenance,
    ) -> Result<MergeOutcome, StoreError>;
}

/// Maps canonical keys to catalog ids.
#[async_trait]
pub trait MetricCatalog: Send + Sync {
    async fn metric_id(&self, key: &str) -> Result<Option<String>, StoreError>;
}

/// Append-only destination for training samples.
#[async_trait]
pub trait TrainingSink: Send + Sync {
    async fn append(&self, sample: &TrainingSample) -> Result<(), StoreError>;
}

// ============================================================================
// In-memory record store
// ============================================================================

#[derive(Debug, Default)]
struct RecordTable {
    records: Vec<DailyMetricRecord>,
    index: HashMap<RecordKey, usize>,
}

impl RecordTable {
    fn slot(&mut self, key: &RecordKey) -> &mut DailyMetricRecord {
        let idx = match self.index.get(key) {
            Some(idx) => *idx,
            None => {
                self.records.push(DailyMetricRecord::new(key));
                let idx = self.records.len() - 1;
                self.index.insert(key.clone(), idx);
                idx
            }
        };
        &mut self.records[idx]
    }
}

/// Arena of day records behind one lock; the whole read-diff-write runs under it.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    inner: Arc<RwLock<RecordTable>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn fetch(&self, key: &RecordKey) -> Result<Option<DailyMetricRecord>, StoreError> {
        let table = self.inner.read().await;
        Ok(table.index.get(key).map(|idx| table.records[*idx].clone()))
    }

    async fn merge(
        &self,
        key: &RecordKey,
        writes: &[FieldWrite],
        provenance: &FieldProvenance,
    ) -> Result<MergeOutcome, StoreError> {
        let mut table = self.inner.write().await;
        let existing = match table.index.get(key) {
            Some(idx) => table.records[*idx].metrics.clone(),
            None => CanonicalMetricMap::new(),
        };

        let outcome = merge_maps(&existing, &writes_to_map(writes));
        if outcome.changed_keys.is_empty() {
            return Ok(outcome);
        }

        let record = table.slot(key);
        for changed in &outcome.changed_keys {
            let value = outcome.merged.entry(changed).cloned().flatten();
            record.metrics.set(changed.clone(), value);
            record.provenance.insert(changed.clone(), provenance.clone());
        }
        debug!(
            "MemoryRecordStore: {} fields written for {}",
            outcome.changed_keys.len(),
            key
        );
        Ok(outcome)
    }
}

// ============================================================================
// Catalog and training sink
// ============================================================================

/// Catalog backed by the vocabulary: every vocabulary key is its own id.
#[derive(Clone)]
pub struct VocabularyCatalog {
    vocabulary: Arc<MetricVocabulary>,
}

impl VocabularyCatalog {
    pub fn new(vocabulary: Arc<MetricVocabulary>) -> Self {
        Self { vocabulary }
    }
}

#[async_trait]
impl MetricCatalog for VocabularyCatalog {
    async fn metric_id(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.vocabulary.get(key).map(|def| def.key.clone()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTrainingSink {
    samples: Arc<RwLock<Vec<TrainingSample>>>,
}

impl MemoryTrainingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn samples(&self) -> Vec<TrainingSample> {
        self.samples.read().await.clone()
    }
}

#[async_trait]
impl TrainingSink for MemoryTrainingSink {
    async fn append(&self, sample: &TrainingSample) -> Result<(), StoreError> {
        self.samples.write().await.push(sample.clone());
        Ok(())
    }
}
