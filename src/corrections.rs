//! Correction value extraction.
//!
//! Every rule in the [`RuleSet`] proposes assignments independently; the resolver
//! then keeps, per metric, the assignment with the highest priority (ties go to the
//! later position in the message). Bare magnitudes ("clearly 30") are evaluated after
//! the other rules because they only claim numbers no other rule attached.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::{MetricVocabulary, ValueType};
use crate::mentions::{distinct_keys, Mention};
use crate::rules::{
    asserted_number, mention_window, removal_targets, stated_duration, CompiledRule,
    QualitativeLevel, RuleAction, RuleSet,
};
use crate::schema::{CanonicalMetricMap, MetricValue};
use crate::values::{find_duration, parse_number_token};

/// A single proposed change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub key: String,
    pub value: Option<MetricValue>,
    pub rule_id: &'static str,
    pub priority: u8,
    /// Byte range in the lower-cased message that produced the value.
    #[serde(skip)]
    pub span: Range<usize>,
    #[serde(skip)]
    pub action: RuleAction,
}

impl Assignment {
    /// True for values the user typed out (numbers and durations), as opposed to
    /// removals and qualitative defaults.
    pub fn is_stated_value(&self) -> bool {
        matches!(
            self.action,
            RuleAction::DirectNumeric | RuleAction::Duration | RuleAction::BareMagnitude
        )
    }
}

/// Result of running the extractor over one message.
#[derive(Debug, Clone, Serialize)]
pub struct Extraction {
    pub corrected_map: CanonicalMetricMap,
    /// Winning assignments that were applied, in message order.
    pub assignments: Vec<Assignment>,
    /// Human-readable notes about values that could not be attributed.
    pub ambiguities: Vec<String>,
}

pub struct CorrectionExtractor {
    vocabulary: Arc<MetricVocabulary>,
    rules: Arc<RuleSet>,
}

impl CorrectionExtractor {
    pub fn new(vocabulary: Arc<MetricVocabulary>, rules: Arc<RuleSet>) -> Self {
        Self { vocabulary, rules }
    }

    /// Extract corrected values from `raw_text` against `original`.
    ///
    /// `context_text` is the preceding user message; it is only consulted to find the
    /// target of a bare magnitude when the message itself names no metric.
    pub fn extract(
        &self,
        raw_text: &str,
        original: &CanonicalMetricMap,
        context_text: Option<&str>,
    ) -> Extraction {
        let text = raw_text.to_lowercase();
        let mentions = self.rules.mentions.find(&text);

        let mut candidates: Vec<Assignment> = Vec::new();
        let mut ambiguities: Vec<String> = Vec::new();

        let (bare_rules, other_rules): (Vec<&CompiledRule>, Vec<&CompiledRule>) = self
            .rules
            .rules()
            .iter()
            .partition(|rule| rule.action == RuleAction::BareMagnitude);

        for rule in other_rules {
            self.apply_rule(rule, &text, &mentions, &mut candidates, &mut ambiguities);
        }
        for rule in bare_rules {
            self.apply_bare_magnitude(
                rule,
                &text,
                &mentions,
                context_text,
                &mut candidates,
                &mut ambiguities,
            );
        }

        let mut corrected_map = original.clone();
        let mut assignments = Vec::new();
        for assignment in resolve(candidates) {
            if assignment.value.is_none() && original.value(&assignment.key).is_none() {
                debug!("Nothing to remove for {}", assignment.key);
                continue;
            }
            corrected_map.set(assignment.key.clone(), assignment.value.clone());
            assignments.push(assignment);
        }

        debug!(
            "Extracted {} assignments ({} ambiguities) from message",
            assignments.len(),
            ambiguities.len()
        );

        Extraction {
            corrected_map,
            assignments,
            ambiguities,
        }
    }

    fn apply_rule(
        &self,
        rule: &CompiledRule,
        text: &str,
        mentions: &[Mention],
        candidates: &mut Vec<Assignment>,
        ambiguities: &mut Vec<String>,
    ) {
        let propose = |key: &str, value: Option<MetricValue>, span: Range<usize>| Assignment {
            key: key.to_string(),
            value,
            rule_id: rule.id,
            priority: rule.priority,
            span,
            action: rule.action,
        };

        match rule.action {
            RuleAction::Disambiguation { disclaimed, .. } => {
                let Some(m) = rule.regex.find(text) else {
                    return;
                };
                let names_alternative = rule
                    .alternative
                    .as_ref()
                    .map(|alt| alt.is_match(text))
                    .unwrap_or(false);
                if names_alternative {
                    candidates.push(propose(disclaimed, None, m.range()));
                }
            }

            RuleAction::Duration => {
                for (idx, mention) in mentions.iter().enumerate() {
                    if mention.value_type != ValueType::DurationMinutes {
                        continue;
                    }
                    let base = mention.span.end;
                    let window = mention_window(text, mentions, idx);
                    let Some((minutes, found)) = stated_duration(&rule.regex, window) else {
                        continue;
                    };
                    let span = base + found.start..base + found.end;
                    candidates.push(propose(
                        &mention.key,
                        Some(MetricValue::Duration(minutes)),
                        span,
                    ));
                }
            }

            RuleAction::DirectNumeric => {
                for (idx, mention) in mentions.iter().enumerate() {
                    let base = mention.span.end;
                    let window = mention_window(text, mentions, idx);
                    let Some(n) = asserted_number(&rule.regex, window) else {
                        continue;
                    };
                    match mention.value_type {
                        ValueType::Numeric => {
                            if let Some(value) = parse_number_token(n.as_str()) {
                                let span = base + n.start()..base + n.end();
                                candidates.push(propose(
                                    &mention.key,
                                    Some(MetricValue::Number(value)),
                                    span,
                                ));
                            }
                        }
                        ValueType::DurationMinutes if find_duration(window).is_none() => {
                            ambiguities.push(format!(
                                "{}: '{}' has no unit (use e.g. 7h 30m)",
                                mention.key,
                                n.as_str()
                            ));
                        }
                        _ => {}
                    }
                }
            }

            RuleAction::Removal => {
                for m in rule.regex.find_iter(text) {
                    for mention in removal_targets(text, mentions, m.end()) {
                        candidates.push(propose(&mention.key, None, mention.span.clone()));
                    }
                }
            }

            RuleAction::Qualitative { key, level } => {
                let Some(bounds) = self.vocabulary.get(key).and_then(|d| d.qualitative_bounds)
                else {
                    return;
                };
                let value = match level {
                    QualitativeLevel::Low => bounds.low,
                    QualitativeLevel::High => bounds.high,
                };
                for m in rule.regex.find_iter(text) {
                    candidates.push(propose(key, Some(MetricValue::Number(value)), m.range()));
                }
            }

            RuleAction::BareMagnitude => {}
        }
    }

    fn apply_bare_magnitude(
        &self,
        rule: &CompiledRule,
        text: &str,
        mentions: &[Mention],
        context_text: Option<&str>,
        candidates: &mut Vec<Assignment>,
        ambiguities: &mut Vec<String>,
    ) {
        let disclaimed: HashSet<String> = candidates
            .iter()
            .filter(|c| matches!(c.action, RuleAction::Disambiguation { .. }))
            .map(|c| c.key.clone())
            .collect();

        let mut targets: Vec<String> = distinct_keys(mentions, ValueType::Numeric)
            .into_iter()
            .filter(|k| !disclaimed.contains(k))
            .collect();
        if targets.is_empty() {
            if let Some(context) = context_text {
                let context_mentions = self.rules.mentions.find(&context.to_lowercase());
                targets = distinct_keys(&context_mentions, ValueType::Numeric)
                    .into_iter()
                    .filter(|k| !disclaimed.contains(k))
                    .collect();
            }
        }

        let mut proposed = Vec::new();
        for caps in rule.regex.captures_iter(text) {
            let Some(n) = caps.name("n") else {
                continue;
            };
            let consumed = candidates
                .iter()
                .any(|c| c.span.contains(&n.start()) && c.value.is_some());
            if consumed {
                continue;
            }
            let Some(value) = parse_number_token(n.as_str()) else {
                continue;
            };

            match targets.as_slice() {
                [key] => proposed.push(Assignment {
                    key: key.clone(),
                    value: Some(MetricValue::Number(value)),
                    rule_id: rule.id,
                    priority: rule.priority,
                    span: n.range(),
                    action: rule.action,
                }),
                [] => ambiguities.push(format!("value {} does not name a metric", n.as_str())),
                many => ambiguities.push(format!(
                    "value {} could refer to {}",
                    n.as_str(),
                    many.join(" or ")
                )),
            }
        }
        candidates.extend(proposed);
    }
}

/// Per key: highest priority wins, then the later position in the message.
fn resolve(candidates: Vec<Assignment>) -> Vec<Assignment> {
    let mut winners: HashMap<String, Assignment> = HashMap::new();
    for candidate in candidates {
        let wins = winners.get(&candidate.key).map_or(true, |current| {
            (candidate.priority, candidate.span.start) > (current.priority, current.span.start)
        });
        if wins {
            winners.insert(candidate.key.clone(), candidate);
        }
    }
    let mut ordered: Vec<Assignment> = winners.into_values().collect();
    ordered.sort_by(|a, b| a.span.start.cmp(&b.span.start).then_with(|| a.key.cmp(&b.key)));
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_vocabulary;
    use crate::rules::{RuleSpec, EXTRACTION_RULES, SIGNAL_RULES};

    fn extractor() -> CorrectionExtractor {
        let vocab = Arc::new(default_vocabulary());
        let rules = Arc::new(RuleSet::standard(&vocab));
        CorrectionExtractor::new(vocab, rules)
    }

    fn num(n: f64) -> Option<MetricValue> {
        Some(MetricValue::Number(n))
    }

    fn baseline() -> CanonicalMetricMap {
        [
            ("sleep_score".to_string(), num(70.0)),
            ("hrv".to_string(), num(48.0)),
            ("resting_heart_rate".to_string(), num(72.0)),
            ("heart_rate".to_string(), num(72.0)),
            ("total_sleep".to_string(), Some(MetricValue::Duration(400))),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_duration_assertion() {
        let out = extractor().extract("Total sleep was 7h 30m", &baseline(), None);
        assert_eq!(out.corrected_map.value("total_sleep"), Some(&MetricValue::Duration(450)));
    }

    #[test]
    fn test_slept_for_duration() {
        let out = extractor().extract("I slept for 6 hours and 45 minutes", &baseline(), None);
        assert_eq!(out.corrected_map.value("total_sleep"), Some(&MetricValue::Duration(405)));
    }

    #[test]
    fn test_explicit_number_beats_qualitative() {
        let out = extractor().extract("I slept great, sleep score was 60", &baseline(), None);
        assert_eq!(out.corrected_map.value("sleep_score"), Some(&MetricValue::Number(60.0)));
    }

    #[test]
    fn test_qualitative_applies_when_nothing_explicit() {
        let out = extractor().extract("honestly I slept great", &baseline(), None);
        assert_eq!(out.corrected_map.value("sleep_score"), Some(&MetricValue::Number(85.0)));

        let out = extractor().extract("I slept poorly", &baseline(), None);
        assert_eq!(out.corrected_map.value("sleep_score"), Some(&MetricValue::Number(30.0)));
    }

    #[test]
    fn test_disambiguation_nulls_resting_only() {
        let out = extractor().extract(
            "that's not my resting heart rate, that's my latest heart rate",
            &baseline(),
            None,
        );
        assert_eq!(out.corrected_map.entry("resting_heart_rate"), Some(&None));
        assert_eq!(out.corrected_map.value("heart_rate"), Some(&MetricValue::Number(72.0)));
    }

    #[test]
    fn test_not_my_resting_without_alternative_is_not_disambiguation() {
        let out = extractor().extract("that's not my resting heart rate", &baseline(), None);
        assert_eq!(
            out.corrected_map.value("resting_heart_rate"),
            Some(&MetricValue::Number(72.0))
        );
    }

    #[test]
    fn test_removal() {
        let out = extractor().extract("There is no sleep score on that screen", &baseline(), None);
        assert_eq!(out.corrected_map.entry("sleep_score"), Some(&None));

        let out = extractor().extract(
            "I don't know where you got the hrv and rhr from",
            &baseline(),
            None,
        );
        assert_eq!(out.corrected_map.entry("hrv"), Some(&None));
        assert_eq!(out.corrected_map.entry("resting_heart_rate"), Some(&None));
        assert_eq!(out.corrected_map.value("sleep_score"), Some(&MetricValue::Number(70.0)));
    }

    #[test]
    fn test_removal_needs_the_metric_right_after_the_trigger() {
        let out = extractor().extract("there's no way my hrv was that low", &baseline(), None);
        assert_eq!(out.corrected_map.value("hrv"), Some(&MetricValue::Number(48.0)));
        assert!(out.assignments.is_empty());

        let out = extractor().extract("I don't have a clue why my rhr is 72", &baseline(), None);
        assert_eq!(
            out.corrected_map.value("resting_heart_rate"),
            Some(&MetricValue::Number(72.0))
        );
    }

    #[test]
    fn test_removal_of_absent_metric_is_noop() {
        let out = extractor().extract("there is no spo2", &baseline(), None);
        assert!(!out.corrected_map.contains_key("blood_oxygen"));
        assert!(out.assignments.is_empty());
    }

    #[test]
    fn test_direct_numeric_forms() {
        let out = extractor().extract(
            "my hrv is actually 52 and resting heart rate should be 55",
            &baseline(),
            None,
        );
        assert_eq!(out.corrected_map.value("hrv"), Some(&MetricValue::Number(52.0)));
        assert_eq!(
            out.corrected_map.value("resting_heart_rate"),
            Some(&MetricValue::Number(55.0))
        );
        assert!(out.ambiguities.is_empty());
    }

    #[test]
    fn test_units_after_number() {
        let out = extractor().extract("hrv was 45ms", &baseline(), None);
        assert_eq!(out.corrected_map.value("hrv"), Some(&MetricValue::Number(45.0)));
    }

    #[test]
    fn test_thousands_separator_in_assertion() {
        let out = extractor().extract("my steps were 12,000", &baseline(), None);
        assert_eq!(out.corrected_map.value("steps"), Some(&MetricValue::Number(12000.0)));
    }

    #[test]
    fn test_time_of_day_is_not_a_value() {
        let out = extractor().extract("my heart rate at 6am was 80", &baseline(), None);
        assert_eq!(out.corrected_map.value("heart_rate"), Some(&MetricValue::Number(72.0)));

        let out = extractor().extract("heart rate was 6:45 when I checked", &baseline(), None);
        assert_eq!(out.corrected_map.value("heart_rate"), Some(&MetricValue::Number(72.0)));
    }

    #[test]
    fn test_clock_times_are_not_sleep_durations() {
        let out = extractor().extract("I slept at 11:30 last night", &baseline(), None);
        assert_eq!(out.corrected_map.value("total_sleep"), Some(&MetricValue::Duration(400)));
        assert!(out.assignments.is_empty());

        let out = extractor().extract(
            "total sleep looked off, I woke at 4:45",
            &baseline(),
            None,
        );
        assert_eq!(out.corrected_map.value("total_sleep"), Some(&MetricValue::Duration(400)));

        let out = extractor().extract("I slept until 7h, about 8 hours", &baseline(), None);
        assert_eq!(out.corrected_map.value("total_sleep"), Some(&MetricValue::Duration(480)));
    }

    #[test]
    fn test_bare_magnitude_with_metric_in_message() {
        let out = extractor().extract("that's not my HRV, clearly 30", &baseline(), None);
        assert_eq!(out.corrected_map.value("hrv"), Some(&MetricValue::Number(30.0)));
    }

    #[test]
    fn test_bare_magnitude_uses_preceding_turn() {
        let out = extractor().extract("clearly 30", &baseline(), Some("my HRV looks off"));
        assert_eq!(out.corrected_map.value("hrv"), Some(&MetricValue::Number(30.0)));
    }

    #[test]
    fn test_bare_magnitude_ambiguity_is_surfaced() {
        let out = extractor().extract("the hrv and rhr are off, clearly 30", &baseline(), None);
        assert_eq!(out.corrected_map, baseline());
        assert_eq!(out.ambiguities.len(), 1);
        assert!(out.ambiguities[0].contains("hrv or resting_heart_rate"));

        let out = extractor().extract("clearly 30", &baseline(), None);
        assert_eq!(out.corrected_map, baseline());
        assert_eq!(out.ambiguities.len(), 1);
    }

    #[test]
    fn test_duration_without_unit_is_ambiguous() {
        let out = extractor().extract("deep sleep was 90", &baseline(), None);
        assert!(!out.corrected_map.contains_key("deep_sleep"));
        assert_eq!(out.ambiguities.len(), 1);
    }

    #[test]
    fn test_several_metrics_in_one_message() {
        let out = extractor().extract(
            "sleep score was 77. deep sleep 1h 20m, rem 95 min",
            &baseline(),
            None,
        );
        assert_eq!(out.corrected_map.value("sleep_score"), Some(&MetricValue::Number(77.0)));
        assert_eq!(out.corrected_map.value("deep_sleep"), Some(&MetricValue::Duration(80)));
        assert_eq!(out.corrected_map.value("rem_sleep"), Some(&MetricValue::Duration(95)));
    }

    #[test]
    fn test_later_statement_wins_within_one_rule() {
        let out = extractor().extract("hrv was 40, no wait, hrv was 42", &baseline(), None);
        assert_eq!(out.corrected_map.value("hrv"), Some(&MetricValue::Number(42.0)));
    }

    #[test]
    fn test_explicit_value_beats_removal() {
        let out = extractor().extract(
            "there is no sleep score... sleep score is 64",
            &baseline(),
            None,
        );
        assert_eq!(out.corrected_map.value("sleep_score"), Some(&MetricValue::Number(64.0)));
    }

    #[test]
    fn test_resolution_ignores_table_order() {
        let vocab = Arc::new(default_vocabulary());
        let reversed: Vec<RuleSpec> = EXTRACTION_RULES
            .iter()
            .rev()
            .map(|r| RuleSpec {
                id: r.id,
                priority: r.priority,
                pattern: r.pattern,
                action: r.action,
            })
            .collect();
        let rules = Arc::new(RuleSet::compile(&vocab, SIGNAL_RULES, &reversed));
        let reversed_extractor = CorrectionExtractor::new(vocab, rules);

        for message in [
            "I slept great, sleep score was 60",
            "there is no sleep score... sleep score is 64",
            "that's not my resting heart rate, that's my latest heart rate",
        ] {
            let a = extractor().extract(message, &baseline(), None);
            let b = reversed_extractor.extract(message, &baseline(), None);
            assert_eq!(a.corrected_map, b.corrected_map, "{message}");
        }
    }
}
