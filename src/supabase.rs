//! Supabase client for the metric catalog, day records and training samples.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{MetricVocabulary, SupabaseSettings, ValueType};
use crate::error::StoreError;
use crate::merge::{merge_maps, MergeOutcome};
use crate::schema::{
    DailyMetricRecord, FieldProvenance, MetricSource, MetricValue, RecordKey, TrainingSample,
};
use crate::store::{writes_to_map, FieldWrite, MetricCatalog, RecordStore, TrainingSink};

const DAILY_METRICS_CONFLICT: &str = "user_id,metric_id,metric_date";

/// Supabase client configuration.
#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    service_role_key: String,
    schema: String,
    vocabulary: Arc<MetricVocabulary>,
    catalog: Arc<RwLock<Option<Arc<CatalogCache>>>>,
}

/// `metrics` table, loaded once.
#[derive(Debug, Default)]
struct CatalogCache {
    id_by_key: HashMap<String, String>,
    key_by_id: HashMap<String, String>,
}

impl SupabaseClient {
    pub fn new(settings: &SupabaseSettings, vocabulary: Arc<MetricVocabulary>) -> Self {
        Self {
            client: Client::new(),
            base_url: settings.url.clone(),
            service_role_key: settings.service_role_key.clone(),
            schema: settings.schema.clone(),
            vocabulary,
            catalog: Arc::new(RwLock::new(None)),
        }
    }

    /// Helper: GET from Supabase REST API.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<T, StoreError> {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Accept-Profile", &self.schema)
            .send()
            .await?;

        let resp = check_status(resp, &format!("Supabase GET {}", table)).await?;
        Ok(resp.json().await?)
    }

    /// Helper: POST rows with the given `Prefer` header.
    async fn post_rows<T: Serialize + ?Sized>(
        &self,
        table: &str,
        query: &[(&str, &str)],
        prefer: &str,
        body: &T,
    ) -> Result<(), StoreError> {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        let resp = self
            .client
            .post(&url)
            .query(query)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .header("Content-Profile", &self.schema)
            .header("Prefer", prefer)
            .json(body)
            .send()
            .await?;

        check_status(resp, &format!("Supabase POST {}", table)).await?;
        Ok(())
    }

    async fn catalog(&self) -> Result<Arc<CatalogCache>, StoreError> {
        if let Some(cache) = self.catalog.read().await.as_ref() {
            return Ok(cache.clone());
        }

        let mut slot = self.catalog.write().await;
        if let Some(cache) = slot.as_ref() {
            return Ok(cache.clone());
        }

        let rows: Vec<CatalogRow> = self
            .get_json("metrics", &[("select", "id,key".to_string())])
            .await?;
        let mut cache = CatalogCache::default();
        for row in rows {
            let id = id_string(&row.id)?;
            cache.key_by_id.insert(id.clone(), row.key.clone());
            cache.id_by_key.insert(row.key, id);
        }
        info!("Loaded {} metrics from Supabase catalog", cache.id_by_key.len());

        let cache = Arc::new(cache);
        *slot = Some(cache.clone());
        Ok(cache)
    }

    async fn fetch_rows(&self, key: &RecordKey) -> Result<Vec<DailyMetricRow>, StoreError> {
        self.get_json(
            "daily_metrics",
            &[
                (
                    "select",
                    "metric_id,metric_value,text_value,boolean_value,source,confidence,updated_at"
                        .to_string(),
                ),
                ("user_id", format!("eq.{}", key.user_id)),
                ("metric_date", format!("eq.{}", key.metric_date)),
            ],
        )
        .await
    }

    /// Rebuild a record from its rows. Rows for metrics missing from the catalog or
    /// the vocabulary are skipped.
    fn decode_record(
        &self,
        key: &RecordKey,
        rows: Vec<DailyMetricRow>,
        catalog: &CatalogCache,
    ) -> Result<DailyMetricRecord, StoreError> {
        let mut record = DailyMetricRecord::new(key);
        for row in rows {
            let metric_id = id_string(&row.metric_id)?;
            let Some(metric_key) = catalog.key_by_id.get(&metric_id) else {
                debug!("Skipping row for unknown metric id {}", metric_id);
                continue;
            };
            let Some(value_type) = self.vocabulary.value_type(metric_key) else {
                debug!("Skipping row for {} (not in vocabulary)", metric_key);
                continue;
            };

            record.metrics.set(metric_key.clone(), row.value(value_type));
            if let (Some(source), Some(updated_at)) = (
                row.source.as_deref().and_then(|s| s.parse::<MetricSource>().ok()),
                row.updated_at,
            ) {
                record.provenance.insert(
                    metric_key.clone(),
                    FieldProvenance {
                        source,
                        confidence: row.confidence.unwrap_or_else(|| source.default_confidence()),
                        updated_at,
                    },
                );
            }
        }
        Ok(record)
    }
}

#[async_trait]
impl MetricCatalog for SupabaseClient {
    async fn metric_id(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.catalog().await?.id_by_key.get(key).cloned())
    }
}

#[async_trait]
impl RecordStore for SupabaseClient {
    async fn fetch(&self, key: &RecordKey) -> Result<Option<DailyMetricRecord>, StoreError> {
        let rows = self.fetch_rows(key).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let catalog = self.catalog().await?;
        Ok(Some(self.decode_record(key, rows, &catalog)?))
    }

    async fn merge(
        &self,
        key: &RecordKey,
        writes: &[FieldWrite],
        provenance: &FieldProvenance,
    ) -> Result<MergeOutcome, StoreError> {
        let catalog = self.catalog().await?;
        let rows = self.fetch_rows(key).await?;
        let existing = self.decode_record(key, rows, &catalog)?.metrics;

        let outcome = merge_maps(&existing, &writes_to_map(writes));
        if outcome.changed_keys.is_empty() {
            return Ok(outcome);
        }

        let body: Vec<UpsertRow> = writes
            .iter()
            .filter(|w| outcome.changed_keys.contains(&w.metric_key))
            .map(|w| UpsertRow::new(key, w, provenance))
            .collect();

        self.post_rows(
            "daily_metrics",
            &[("on_conflict", DAILY_METRICS_CONFLICT)],
            "resolution=merge-duplicates,return=minimal",
            &body,
        )
        .await?;

        debug!("Upserted {} daily_metrics rows for {}", body.len(), key);
        Ok(outcome)
    }
}

#[async_trait]
impl TrainingSink for SupabaseClient {
    async fn append(&self, sample: &TrainingSample) -> Result<(), StoreError> {
        self.post_rows("correction_training_samples", &[], "return=minimal", sample)
            .await?;
        debug!("Inserted training sample for {}", sample.event_id);
        Ok(())
    }
}

async fn check_status(resp: Response, context: &str) -> Result<Response, StoreError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Status {
        context: context.to_string(),
        status,
        body,
    })
}

/// Catalog ids may be integers or uuids depending on the schema.
fn id_string(id: &Value) -> Result<String, StoreError> {
    match id {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(StoreError::Decode(format!("metric id {}", other))),
    }
}

// ============================================================================
// Supabase row types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CatalogRow {
    id: Value,
    key: String,
}

#[derive(Debug, Deserialize)]
struct DailyMetricRow {
    metric_id: Value,
    metric_value: Option<f64>,
    text_value: Option<String>,
    boolean_value: Option<bool>,
    source: Option<String>,
    confidence: Option<f64>,
    updated_at: Option<DateTime<Utc>>,
}

impl DailyMetricRow {
    /// Durations live in `metric_value` as minutes.
    fn value(&self, value_type: ValueType) -> Option<MetricValue> {
        match value_type {
            ValueType::Numeric => self.metric_value.map(MetricValue::Number),
            ValueType::DurationMinutes => self
                .metric_value
                .map(|m| MetricValue::Duration(m.round() as i64)),
            ValueType::Text => self.text_value.clone().map(MetricValue::Text),
            ValueType::Boolean => self.boolean_value.map(MetricValue::Bool),
        }
    }
}

#[derive(Debug, Serialize)]
struct UpsertRow<'a> {
    user_id: &'a str,
    metric_id: &'a str,
    metric_date: String,
    metric_value: Option<f64>,
    text_value: Option<&'a str>,
    boolean_value: Option<bool>,
    source: &'static str,
    confidence: f64,
    updated_at: DateTime<Utc>,
}

impl<'a> UpsertRow<'a> {
    fn new(key: &'a RecordKey, write: &'a FieldWrite, provenance: &FieldProvenance) -> Self {
        let (metric_value, text_value, boolean_value) = match &write.value {
            Some(MetricValue::Number(n)) => (Some(*n), None, None),
            Some(MetricValue::Duration(m)) => (Some(*m as f64), None, None),
            Some(MetricValue::Text(t)) => (None, Some(t.as_str()), None),
            Some(MetricValue::Bool(b)) => (None, None, Some(*b)),
            None => (None, None, None),
        };
        Self {
            user_id: &key.user_id,
            metric_id: &write.metric_id,
            metric_date: key.metric_date.to_string(),
            metric_value,
            text_value,
            boolean_value,
            source: provenance.source.as_str(),
            confidence: provenance.confidence,
            updated_at: provenance.updated_at,
        }
    }
}
