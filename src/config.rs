//! Process settings and the metric vocabulary.
//!
//! The vocabulary is loaded once at startup (from `METRIC_VOCABULARY_PATH` or the
//! built-in table) and shared read-only behind an `Arc`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_SUPABASE_SCHEMA: &str = "public";

/// Runtime settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub vocabulary_path: Option<PathBuf>,
    /// Present only when both Supabase variables are set.
    pub supabase: Option<SupabaseSettings>,
}

#[derive(Debug, Clone)]
pub struct SupabaseSettings {
    pub url: String,
    pub service_role_key: String,
    pub schema: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let bind_addr =
            std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        let vocabulary_path = std::env::var("METRIC_VOCABULARY_PATH").ok().map(PathBuf::from);

        let supabase = match (
            std::env::var("SUPABASE_URL").ok(),
            std::env::var("SUPABASE_SERVICE_ROLE_KEY").ok(),
        ) {
            (Some(url), Some(service_role_key)) => Some(SupabaseSettings {
                url: url.trim_end_matches('/').to_string(),
                service_role_key,
                schema: std::env::var("SUPABASE_SCHEMA")
                    .unwrap_or_else(|_| DEFAULT_SUPABASE_SCHEMA.to_string()),
            }),
            (Some(_), None) | (None, Some(_)) => {
                warn!("Only one of SUPABASE_URL / SUPABASE_SERVICE_ROLE_KEY is set; using in-memory storage");
                None
            }
            (None, None) => None,
        };

        Ok(Self {
            bind_addr,
            vocabulary_path,
            supabase,
        })
    }

    /// Load the vocabulary from the configured file, or fall back to the built-in table.
    pub fn load_vocabulary(&self) -> Result<MetricVocabulary> {
        match &self.vocabulary_path {
            Some(path) => MetricVocabulary::load_from_file(path),
            None => {
                info!("METRIC_VOCABULARY_PATH not set, using built-in vocabulary");
                Ok(default_vocabulary())
            }
        }
    }
}

/// Storage type of a canonical metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Numeric,
    DurationMinutes,
    Text,
    Boolean,
}

/// Defaults used when a message only states a qualitative judgment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitativeBounds {
    pub low: f64,
    pub high: f64,
}

/// A single entry in the metric vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    /// Canonical key, e.g. `resting_heart_rate`.
    pub key: String,
    pub value_type: ValueType,
    /// Raw payload field names, in priority order. The canonical key is always tried first.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Phrases users type in chat to refer to this metric (lower case).
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub qualitative_bounds: Option<QualitativeBounds>,
}

impl MetricDefinition {
    /// Canonical key followed by the declared aliases.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.key.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

#[derive(Debug, Deserialize)]
struct VocabularyFile {
    metrics: Vec<MetricDefinition>,
}

/// Ordered, immutable metric table with alias lookup.
#[derive(Debug, Clone)]
pub struct MetricVocabulary {
    metrics: Vec<MetricDefinition>,
    by_key: HashMap<String, usize>,
    by_field: HashMap<String, usize>,
}

impl MetricVocabulary {
    /// Build and validate a vocabulary. Entry order is alias priority order.
    pub fn from_definitions(metrics: Vec<MetricDefinition>) -> Result<Self> {
        if metrics.is_empty() {
            anyhow::bail!("Metric vocabulary is empty");
        }

        let mut by_key: HashMap<String, usize> = HashMap::new();
        let mut by_field: HashMap<String, usize> = HashMap::new();

        for (idx, def) in metrics.iter().enumerate() {
            if by_key.insert(def.key.clone(), idx).is_some() {
                anyhow::bail!("Duplicate metric key in vocabulary: {}", def.key);
            }
            if let Some(bounds) = def.qualitative_bounds {
                if bounds.low > bounds.high {
                    anyhow::bail!(
                        "Qualitative bounds for {} are inverted (low {} > high {})",
                        def.key,
                        bounds.low,
                        bounds.high
                    );
                }
            }

            let mut seen = HashSet::new();
            for name in def.field_names() {
                let token = field_token(name);
                if !seen.insert(token.clone()) {
                    continue;
                }
                if let Some(&owner) = by_field.get(&token) {
                    warn!(
                        "Alias '{}' of {} already belongs to {}; keeping the earlier entry",
                        name, def.key, metrics[owner].key
                    );
                    continue;
                }
                by_field.insert(token, idx);
            }
        }

        Ok(Self {
            metrics,
            by_key,
            by_field,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: VocabularyFile =
            serde_json::from_str(json).context("Failed to parse metric vocabulary JSON")?;
        Self::from_definitions(file.metrics)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocabulary: {:?}", path))?;
        let vocabulary = Self::from_json_str(&content)
            .with_context(|| format!("Invalid vocabulary: {:?}", path))?;
        info!("Loaded {} metrics from {:?}", vocabulary.len(), path);
        Ok(vocabulary)
    }

    pub fn get(&self, key: &str) -> Option<&MetricDefinition> {
        self.by_key.get(key).map(|&idx| &self.metrics[idx])
    }

    pub fn value_type(&self, key: &str) -> Option<ValueType> {
        self.get(key).map(|def| def.value_type)
    }

    /// Resolve a raw payload field name (canonical key or alias, any casing/separator).
    pub fn resolve_field(&self, raw: &str) -> Option<&MetricDefinition> {
        self.by_field
            .get(&field_token(raw))
            .map(|&idx| &self.metrics[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.metrics.iter()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }
}

/// Lower-cased alphanumerics only: `restingHeartRate`, `resting_heart_rate` and
/// `Resting Heart Rate` all compare equal.
pub fn field_token(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn metric(
    key: &str,
    value_type: ValueType,
    aliases: &[&str],
    mentions: &[&str],
    bounds: Option<(f64, f64)>,
) -> MetricDefinition {
    MetricDefinition {
        key: key.to_string(),
        value_type,
        aliases: aliases.iter().map(|s| s.to_string()).collect(),
        mentions: mentions.iter().map(|s| s.to_string()).collect(),
        qualitative_bounds: bounds.map(|(low, high)| QualitativeBounds { low, high }),
    }
}

/// Built-in vocabulary covering the common wearable dashboards.
///
/// `resting_heart_rate` precedes `heart_rate` so that resting-specific fields are
/// claimed before the generic ones.
pub fn default_vocabulary() -> MetricVocabulary {
    use ValueType::*;

    let metrics = vec![
        metric(
            "sleep_score",
            Numeric,
            &["sleepScore", "sleep_quality_score"],
            &["sleep score"],
            Some((30.0, 85.0)),
        ),
        metric(
            "readiness_score",
            Numeric,
            &["readinessScore", "readiness"],
            &["readiness score", "readiness"],
            Some((30.0, 85.0)),
        ),
        metric(
            "recovery_score",
            Numeric,
            &["recoveryScore", "recovery"],
            &["recovery score", "recovery"],
            Some((30.0, 85.0)),
        ),
        metric(
            "hrv",
            Numeric,
            &["heart_rate_variability", "hrv_ms", "average_hrv", "avgHrv"],
            &["hrv", "heart rate variability"],
            None,
        ),
        metric(
            "resting_heart_rate",
            Numeric,
            &["resting_hr", "rhr", "lowest_heart_rate"],
            &["resting heart rate", "resting hr", "resting pulse", "rhr"],
            None,
        ),
        metric(
            "heart_rate",
            Numeric,
            &["latest_heart_rate", "current_heart_rate", "hr", "bpm"],
            &["latest heart rate", "current heart rate", "heart rate", "pulse"],
            None,
        ),
        metric(
            "total_sleep",
            DurationMinutes,
            &["total_sleep_minutes", "sleep_duration", "asleep", "time_asleep"],
            &["total sleep", "sleep duration", "time asleep", "slept"],
            None,
        ),
        metric(
            "deep_sleep",
            DurationMinutes,
            &["deep_sleep_minutes", "deep"],
            &["deep sleep"],
            None,
        ),
        metric(
            "rem_sleep",
            DurationMinutes,
            &["rem_sleep_minutes", "rem"],
            &["rem sleep", "rem"],
            None,
        ),
        metric(
            "light_sleep",
            DurationMinutes,
            &["light_sleep_minutes", "light"],
            &["light sleep"],
            None,
        ),
        metric(
            "time_in_bed",
            DurationMinutes,
            &["in_bed", "bed_time_minutes"],
            &["time in bed", "in bed"],
            None,
        ),
        metric(
            "sleep_efficiency",
            Numeric,
            &["efficiency"],
            &["sleep efficiency", "efficiency"],
            None,
        ),
        metric(
            "respiratory_rate",
            Numeric,
            &["breathing_rate", "resp_rate"],
            &["respiratory rate", "breathing rate"],
            None,
        ),
        metric(
            "blood_oxygen",
            Numeric,
            &["spo2", "oxygen_saturation"],
            &["blood oxygen", "oxygen saturation", "spo2"],
            None,
        ),
        metric("steps", Numeric, &["step_count", "total_steps"], &["step count", "steps"], None),
        metric(
            "active_calories",
            Numeric,
            &["active_energy", "calories"],
            &["active calories", "calories"],
            None,
        ),
        metric("strain", Numeric, &["day_strain"], &["strain"], None),
        metric("weight", Numeric, &["body_weight", "weight_kg"], &["weight"], None),
        metric("stress_level", Text, &["stress"], &["stress level", "stress"], None),
        metric(
            "workout_completed",
            Boolean,
            &["trained_today", "workout_done"],
            &["workout"],
            None,
        ),
        metric("notes", Text, &["note", "journal"], &[], None),
    ];

    MetricVocabulary::from_definitions(metrics).expect("built-in vocabulary must be valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_vocabulary_is_valid() {
        let vocab = default_vocabulary();
        assert!(vocab.len() > 10);
        assert_eq!(vocab.value_type("total_sleep"), Some(ValueType::DurationMinutes));
        assert_eq!(
            vocab.get("sleep_score").unwrap().qualitative_bounds,
            Some(QualitativeBounds { low: 30.0, high: 85.0 })
        );
    }

    #[test]
    fn test_resolve_field_ignores_case_and_separators() {
        let vocab = default_vocabulary();
        assert_eq!(vocab.resolve_field("restingHeartRate").unwrap().key, "resting_heart_rate");
        assert_eq!(vocab.resolve_field("Resting Heart Rate").unwrap().key, "resting_heart_rate");
        assert_eq!(vocab.resolve_field("heartRate").unwrap().key, "heart_rate");
        assert!(vocab.resolve_field("favourite_colour").is_none());
    }

    #[test]
    fn test_from_json_str() {
        let json = r#"{
            "metrics": [
                {"key": "mood", "value_type": "text", "aliases": ["moodLabel"]},
                {"key": "naps", "value_type": "duration_minutes", "mentions": ["nap"]}
            ]
        }"#;
        let vocab = MetricVocabulary::from_json_str(json).unwrap();
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.resolve_field("mood_label").unwrap().key, "mood");
        assert_eq!(vocab.get("naps").unwrap().mentions, vec!["nap".to_string()]);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let json = r#"{"metrics": [
            {"key": "hrv", "value_type": "numeric"},
            {"key": "hrv", "value_type": "numeric"}
        ]}"#;
        assert!(MetricVocabulary::from_json_str(json).is_err());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let json = r#"{"metrics": [
            {"key": "sleep_score", "value_type": "numeric", "qualitative_bounds": {"low": 90, "high": 10}}
        ]}"#;
        assert!(MetricVocabulary::from_json_str(json).is_err());
    }

    #[test]
    fn test_shared_alias_goes_to_earlier_entry() {
        let json = r#"{"metrics": [
            {"key": "resting_heart_rate", "value_type": "numeric", "aliases": ["pulse"]},
            {"key": "heart_rate", "value_type": "numeric", "aliases": ["pulse"]}
        ]}"#;
        let vocab = MetricVocabulary::from_json_str(json).unwrap();
        assert_eq!(vocab.resolve_field("pulse").unwrap().key, "resting_heart_rate");
    }
}
