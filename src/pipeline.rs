//! Orchestration of the OCR ingest flow and the chat message flow.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::config::MetricVocabulary;
use crate::corrections::{CorrectionExtractor, Extraction};
use crate::error::StoreError;
use crate::intent::IntentDetector;
use crate::merge::MergeEngine;
use crate::normalizer::PayloadNormalizer;
use crate::rules::RuleSet;
use crate::schema::{
    CanonicalMetricMap, CorrectionEvent, DailyMetricRecord, MetricSource, RecordKey,
};
use crate::session::{ConversationTurn, SessionStore, TurnRole};
use crate::store::{MetricCatalog, RecordStore, TrainingSink};
use crate::training::TrainingRecorder;

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub canonical: CanonicalMetricMap,
    pub changed_keys: Vec<String>,
    pub payload_hash: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageOutcome {
    pub is_correction: bool,
    /// True when the message changed the stored record.
    pub captured: bool,
    pub changed_keys: Vec<String>,
    pub ambiguities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub signals: Vec<&'static str>,
}

pub struct MetricPipeline {
    normalizer: PayloadNormalizer,
    detector: IntentDetector,
    extractor: CorrectionExtractor,
    merge: MergeEngine,
    training: TrainingRecorder,
    sessions: SessionStore,
}

impl MetricPipeline {
    pub fn new(
        vocabulary: Arc<MetricVocabulary>,
        catalog: Arc<dyn MetricCatalog>,
        store: Arc<dyn RecordStore>,
        sink: Arc<dyn TrainingSink>,
    ) -> Self {
        let rules = Arc::new(RuleSet::standard(&vocabulary));
        Self {
            normalizer: PayloadNormalizer::new(vocabulary.clone()),
            detector: IntentDetector::new(rules.clone()),
            extractor: CorrectionExtractor::new(vocabulary, rules),
            merge: MergeEngine::new(catalog, store),
            training: TrainingRecorder::new(sink),
            sessions: SessionStore::new(),
        }
    }

    /// Normalize an OCR payload and merge it into the day record.
    ///
    /// With a `session_id` the canonical map also becomes the session's latest
    /// extraction, which later messages may correct. The session only moves once the
    /// record is stored, so a failed call can be retried as is.
    pub async fn ingest_ocr(
        &self,
        key: &RecordKey,
        session_id: Option<&str>,
        payload: &Value,
    ) -> Result<IngestOutcome, StoreError> {
        let payload_hash = {
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_vec(payload)?);
            format!("{:x}", hasher.finalize())
        };

        let canonical = self.normalizer.normalize(payload);
        info!(
            "OCR payload {} for {}: {} canonical metrics",
            &payload_hash[..12],
            key,
            canonical.len()
        );

        let outcome = self
            .merge
            .apply(key, &canonical, MetricSource::Ocr)
            .await
            .map_err(|e| {
                error!("Failed to merge OCR metrics for {}: {}", key, e);
                e
            })?;

        if let Some(session_id) = session_id {
            self.sessions
                .push(
                    session_id,
                    ConversationTurn::new(TurnRole::Ocr, "", Some(canonical.clone())),
                )
                .await;
        }

        Ok(IngestOutcome {
            canonical,
            changed_keys: outcome.changed_keys,
            payload_hash,
        })
    }

    /// Handle one user message: detect a correction, extract and merge it, and
    /// capture a training sample. Without a prior extraction, values the user
    /// states outright are captured as conversation data.
    pub async fn handle_message(
        &self,
        key: &RecordKey,
        session_id: &str,
        text: &str,
    ) -> Result<MessageOutcome, StoreError> {
        let session = self.sessions.context(session_id).await;
        let baseline = session.baseline;
        let context = session.previous_user_text;

        let decision = self.detector.detect(text, baseline.as_ref());
        let mut outcome = MessageOutcome {
            is_correction: decision.is_correction,
            signals: decision.matched_signals.clone(),
            ..Default::default()
        };

        match decision.original_map {
            Some(original) if decision.is_correction => {
                let extraction = self.extractor.extract(text, &original, context.as_deref());
                outcome.ambiguities = extraction.ambiguities.clone();
                self.apply_correction(key, session_id, text, original, extraction, &mut outcome)
                    .await?;
            }
            _ if baseline.is_none() => {
                self.capture_statement(key, session_id, text, &mut outcome)
                    .await?;
            }
            _ => {
                debug!("Ordinary message in session {}", session_id);
                self.sessions
                    .push(session_id, ConversationTurn::new(TurnRole::User, text, None))
                    .await;
            }
        }

        Ok(outcome)
    }

    async fn apply_correction(
        &self,
        key: &RecordKey,
        session_id: &str,
        text: &str,
        original: CanonicalMetricMap,
        extraction: Extraction,
        outcome: &mut MessageOutcome,
    ) -> Result<(), StoreError> {
        let event = CorrectionEvent::new(original, text, extraction.corrected_map);
        if event.changed_keys.is_empty() {
            info!(
                "Correction intent in session {} but nothing to change ({} ambiguities)",
                session_id,
                outcome.ambiguities.len()
            );
            self.sessions
                .push(session_id, ConversationTurn::new(TurnRole::User, text, None))
                .await;
            return Ok(());
        }

        let merged = self
            .merge
            .apply(key, &event.delta(), MetricSource::Correction)
            .await
            .map_err(|e| {
                error!("Failed to merge correction {} for {}: {}", event.id, key, e);
                e
            })?;

        // The corrected map is the belief later messages correct.
        self.sessions
            .push(
                session_id,
                ConversationTurn::new(TurnRole::User, text, Some(event.corrected_map.clone())),
            )
            .await;

        self.training.record(&event).await;

        info!("Correction {} applied to {}: {}", event.id, key, event.delta());
        outcome.captured = !merged.changed_keys.is_empty();
        outcome.changed_keys = merged.changed_keys;
        outcome.event_id = Some(event.id);
        Ok(())
    }

    async fn capture_statement(
        &self,
        key: &RecordKey,
        session_id: &str,
        text: &str,
        outcome: &mut MessageOutcome,
    ) -> Result<(), StoreError> {
        let extraction = self.extractor.extract(text, &CanonicalMetricMap::new(), None);
        let stated: CanonicalMetricMap = extraction
            .assignments
            .iter()
            .filter(|a| a.is_stated_value())
            .map(|a| (a.key.clone(), a.value.clone()))
            .collect();

        if stated.is_empty() {
            self.sessions
                .push(session_id, ConversationTurn::new(TurnRole::User, text, None))
                .await;
            return Ok(());
        }

        let merged = self
            .merge
            .apply(key, &stated, MetricSource::Conversation)
            .await
            .map_err(|e| {
                error!("Failed to merge stated metrics for {}: {}", key, e);
                e
            })?;

        self.sessions
            .push(
                session_id,
                ConversationTurn::new(TurnRole::User, text, Some(stated)),
            )
            .await;

        debug!("Captured {:?} from conversation", merged.changed_keys);
        outcome.captured = !merged.changed_keys.is_empty();
        outcome.changed_keys = merged.changed_keys;
        Ok(())
    }

    pub async fn record(&self, key: &RecordKey) -> Result<Option<DailyMetricRecord>, StoreError> {
        self.merge.store().fetch(key).await
    }
}
