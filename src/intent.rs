//! Correction intent detection.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::rules::{RuleSet, SignalTier};
use crate::schema::CanonicalMetricMap;

#[derive(Debug, Clone, Serialize)]
pub struct IntentDecision {
    pub is_correction: bool,
    /// The belief being corrected; set only when `is_correction` is true.
    pub original_map: Option<CanonicalMetricMap>,
    pub matched_signals: Vec<&'static str>,
    /// Strongest tier among the matched signals.
    pub strongest_tier: Option<SignalTier>,
}

impl IntentDecision {
    fn not_a_correction(matched_signals: Vec<&'static str>) -> Self {
        Self {
            is_correction: false,
            original_map: None,
            matched_signals,
            strongest_tier: None,
        }
    }
}

pub struct IntentDetector {
    rules: Arc<RuleSet>,
}

impl IntentDetector {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self { rules }
    }

    /// Decide whether `message` corrects `baseline`.
    ///
    /// Without a prior extraction there is nothing to correct, whatever the wording.
    pub fn detect(&self, message: &str, baseline: Option<&CanonicalMetricMap>) -> IntentDecision {
        let text = message.to_lowercase();
        let signals = self.rules.matched_signals(&text);
        let ids: Vec<&'static str> = signals.iter().map(|(id, _)| *id).collect();

        let Some(baseline) = baseline.filter(|b| !b.is_empty()) else {
            debug!("No prior extraction; treating message as ordinary ({} signals)", ids.len());
            return IntentDecision::not_a_correction(ids);
        };

        if signals.is_empty() {
            return IntentDecision::not_a_correction(ids);
        }

        let strongest_tier = signals.iter().map(|(_, tier)| *tier).min();
        debug!("Correction detected ({:?}): {:?}", strongest_tier, ids);

        IntentDecision {
            is_correction: true,
            original_map: Some(baseline.clone()),
            matched_signals: ids,
            strongest_tier,
        }
    }
}
