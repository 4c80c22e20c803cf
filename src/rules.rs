//! Declarative correction rule table.
//!
//! Two tables live here: intent signals (does this message correct something?) and
//! extraction rules (which value does it assert?). Extraction precedence is the
//! `priority` column, not the position of a rule in the table: for each metric the
//! highest-priority assignment wins, and within one priority the match that appears
//! last in the message wins.

use std::ops::Range;
use std::sync::OnceLock;

use regex::{Match, Regex};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{MetricVocabulary, ValueType};
use crate::mentions::{Mention, MentionIndex};
use crate::values::{duration_from_captures, is_clock_suffix, number_pattern, DURATION_PATTERN};

/// Grouping of correction signals, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTier {
    DirectCorrection,
    ValueAssertion,
    QualitativeState,
}

pub struct SignalSpec {
    pub id: &'static str,
    pub tier: SignalTier,
    pub pattern: &'static str,
}

pub const SIGNAL_RULES: &[SignalSpec] = &[
    SignalSpec {
        id: "thats_wrong",
        tier: SignalTier::DirectCorrection,
        pattern: r"\b(?:that'?s|that\s+is|this\s+is|it'?s|thats)\s+(?:wrong|incorrect|off|not\s+right|not\s+correct)\b",
    },
    SignalSpec {
        id: "incorrect",
        tier: SignalTier::DirectCorrection,
        pattern: r"\b(?:incorrect|wrong|inaccurate)\b",
    },
    SignalSpec {
        id: "mistake",
        tier: SignalTier::DirectCorrection,
        pattern: r"\b(?:mistakes?|misread|mixed\s+up)\b",
    },
    SignalSpec {
        id: "not_my",
        tier: SignalTier::DirectCorrection,
        pattern: r"\bnot\s+my\b",
    },
    SignalSpec {
        id: "emphatic_value",
        tier: SignalTier::ValueAssertion,
        pattern: r"\b(?:clearly|obviously|actually|definitely)\s+(?:it'?s\s+|was\s+|is\s+)?\d",
    },
    SignalSpec {
        id: "is_actually",
        tier: SignalTier::ValueAssertion,
        pattern: r"\b(?:is|was|were)\s+actually\b",
    },
    SignalSpec {
        id: "should_be",
        tier: SignalTier::ValueAssertion,
        pattern: r"\bshould\s+(?:be|have\s+been)\s+\d",
    },
    SignalSpec {
        id: "there_is_no",
        tier: SignalTier::ValueAssertion,
        pattern: r"\bthere(?:'?s|\s+is|\s+was|\s+are|\s+were)\s+no\b",
    },
    SignalSpec {
        id: "where_you_got",
        tier: SignalTier::ValueAssertion,
        pattern: r"\bdon'?t\s+know\s+where\s+you\s+got\b",
    },
];

/// Qualitative judgment carried by a phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualitativeLevel {
    Low,
    High,
}

/// What a rule does once its pattern matches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleAction {
    /// `pattern` disclaims `disclaimed`, `alternative` names the metric the value belongs to.
    Disambiguation {
        disclaimed: &'static str,
        alternative: &'static str,
    },
    /// `pattern` is a duration expression searched after each duration-typed mention.
    Duration,
    /// `pattern` captures a bare number; the target is the single numeric metric in scope.
    BareMagnitude,
    /// `pattern` is an assertion tail anchored right after a numeric mention.
    DirectNumeric,
    /// `pattern` is a trigger; the metrics named right after it are nulled.
    Removal,
    /// `pattern` sets `key` to its vocabulary bound.
    Qualitative {
        key: &'static str,
        level: QualitativeLevel,
    },
}

pub struct RuleSpec {
    pub id: &'static str,
    pub priority: u8,
    pub pattern: &'static str,
    pub action: RuleAction,
}

pub const PRIORITY_DISAMBIGUATION: u8 = 50;
pub const PRIORITY_DURATION: u8 = 40;
pub const PRIORITY_BARE_MAGNITUDE: u8 = 30;
pub const PRIORITY_DIRECT_NUMERIC: u8 = 20;
pub const PRIORITY_REMOVAL: u8 = 10;
pub const PRIORITY_QUALITATIVE: u8 = 0;

/// Verb or separator right after a numeric mention, then the asserted number.
/// Time-of-day phrasing ("at 6am") is not an assertion.
const DIRECT_ASSERTION_TAIL: &str = concat!(
    r"^\s*(?:'s|is|was|were|are|should\s+be|should\s+have\s+been|of|=|:)",
    r"(?:\s+(?:actually|really|more\s+like|closer\s+to|around|about|only|just))*\s*",
    "(?P<n>",
    number_pattern!(),
    ")"
);

pub const EXTRACTION_RULES: &[RuleSpec] = &[
    RuleSpec {
        id: "latest_not_resting_hr",
        priority: PRIORITY_DISAMBIGUATION,
        pattern: r"\bnot\s+(?:my|the|a|your)\s+resting\s+(?:heart\s+rate|hr|pulse)\b",
        action: RuleAction::Disambiguation {
            disclaimed: "resting_heart_rate",
            alternative: r"\b(?:latest|current|last|most\s+recent|live|active|workout)\s+(?:heart\s+rate|hr|pulse)\b",
        },
    },
    RuleSpec {
        id: "duration_value",
        priority: PRIORITY_DURATION,
        pattern: DURATION_PATTERN,
        action: RuleAction::Duration,
    },
    RuleSpec {
        id: "emphatic_number",
        priority: PRIORITY_BARE_MAGNITUDE,
        pattern: concat!(
            r"\b(?:clearly|obviously|actually|definitely)\s+(?:it'?s\s+|was\s+|is\s+)?",
            "(?P<n>",
            number_pattern!(),
            ")"
        ),
        action: RuleAction::BareMagnitude,
    },
    RuleSpec {
        id: "metric_is_number",
        priority: PRIORITY_DIRECT_NUMERIC,
        pattern: DIRECT_ASSERTION_TAIL,
        action: RuleAction::DirectNumeric,
    },
    RuleSpec {
        id: "metric_does_not_exist",
        priority: PRIORITY_REMOVAL,
        pattern: concat!(
            r"\bthere(?:'?s|\s+is|\s+was|\s+are|\s+were)\s+no\b",
            r"|\bdon'?t\s+know\s+where\s+you\s+got\b",
            r"|\bi\s+(?:don'?t|do\s+not|didn'?t)\s+(?:have|track|record|measure|wear)\b"
        ),
        action: RuleAction::Removal,
    },
    RuleSpec {
        id: "slept_well",
        priority: PRIORITY_QUALITATIVE,
        pattern: concat!(
            r"\bslept\s+(?:(?:really|so|very|pretty|super|quite)\s+)?(?:great|well|amazing|fantastic|awesome|good)\b",
            r"|\b(?:great|amazing|fantastic|excellent|good)\s+(?:night'?s\s+)?sleep\b"
        ),
        action: RuleAction::Qualitative {
            key: "sleep_score",
            level: QualitativeLevel::High,
        },
    },
    RuleSpec {
        id: "slept_poorly",
        priority: PRIORITY_QUALITATIVE,
        pattern: concat!(
            r"\bslept\s+(?:(?:really|so|very|pretty|super|quite)\s+)?(?:poorly|badly|terribly|horribly|awful|bad|terrible)\b",
            r"|\b(?:poor|bad|terrible|awful|rough|horrible)\s+(?:night'?s\s+)?sleep\b|\bbarely\s+slept\b"
        ),
        action: RuleAction::Qualitative {
            key: "sleep_score",
            level: QualitativeLevel::Low,
        },
    },
    RuleSpec {
        id: "readiness_low",
        priority: PRIORITY_QUALITATIVE,
        pattern: r"\breadiness\s+(?:score\s+)?(?:was|is|felt|seemed)\s+(?:(?:really|so|very|pretty|super|quite)\s+)?(?:low|poor|bad|terrible)\b",
        action: RuleAction::Qualitative {
            key: "readiness_score",
            level: QualitativeLevel::Low,
        },
    },
    RuleSpec {
        id: "readiness_high",
        priority: PRIORITY_QUALITATIVE,
        pattern: r"\breadiness\s+(?:score\s+)?(?:was|is|felt|seemed)\s+(?:(?:really|so|very|pretty|super|quite)\s+)?(?:high|great|good|excellent)\b",
        action: RuleAction::Qualitative {
            key: "readiness_score",
            level: QualitativeLevel::High,
        },
    },
    RuleSpec {
        id: "recovery_low",
        priority: PRIORITY_QUALITATIVE,
        pattern: r"\brecovery\s+(?:score\s+)?(?:was|is|felt|seemed)\s+(?:(?:really|so|very|pretty|super|quite)\s+)?(?:low|poor|bad|terrible)\b",
        action: RuleAction::Qualitative {
            key: "recovery_score",
            level: QualitativeLevel::Low,
        },
    },
    RuleSpec {
        id: "recovery_high",
        priority: PRIORITY_QUALITATIVE,
        pattern: r"\brecovery\s+(?:score\s+)?(?:was|is|felt|seemed)\s+(?:(?:really|so|very|pretty|super|quite)\s+)?(?:high|great|good|excellent)\b",
        action: RuleAction::Qualitative {
            key: "recovery_score",
            level: QualitativeLevel::High,
        },
    },
];

/// A signal rule after compilation.
pub struct CompiledSignal {
    pub id: &'static str,
    pub tier: SignalTier,
    regex: Regex,
}

/// An extraction rule after compilation.
pub struct CompiledRule {
    pub id: &'static str,
    pub priority: u8,
    pub regex: Regex,
    /// Compiled `alternative` pattern for disambiguation rules.
    pub alternative: Option<Regex>,
    pub action: RuleAction,
}

/// Compiled, read-only rule configuration shared by the detector and the extractor.
pub struct RuleSet {
    pub mentions: MentionIndex,
    signals: Vec<CompiledSignal>,
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile the built-in tables against a vocabulary.
    pub fn standard(vocabulary: &MetricVocabulary) -> Self {
        Self::compile(vocabulary, SIGNAL_RULES, EXTRACTION_RULES)
    }

    /// Compile rule tables. Invalid patterns are skipped with a warning.
    pub fn compile(
        vocabulary: &MetricVocabulary,
        signal_specs: &[SignalSpec],
        rule_specs: &[RuleSpec],
    ) -> Self {
        let mut signals = Vec::new();
        for spec in signal_specs {
            match Regex::new(spec.pattern) {
                Ok(regex) => signals.push(CompiledSignal {
                    id: spec.id,
                    tier: spec.tier,
                    regex,
                }),
                Err(e) => warn!("Skipping invalid signal '{}': {}", spec.id, e),
            }
        }

        let mut rules = Vec::new();
        for spec in rule_specs {
            if let RuleAction::Qualitative { key, .. } = spec.action {
                let has_bounds = vocabulary
                    .get(key)
                    .map(|def| def.qualitative_bounds.is_some())
                    .unwrap_or(false);
                if !has_bounds {
                    warn!(
                        "Skipping qualitative rule '{}': {} has no qualitative bounds",
                        spec.id, key
                    );
                    continue;
                }
            }

            let regex = match Regex::new(spec.pattern) {
                Ok(regex) => regex,
                Err(e) => {
                    warn!("Skipping invalid rule '{}': {}", spec.id, e);
                    continue;
                }
            };
            let alternative = match spec.action {
                RuleAction::Disambiguation { alternative, .. } => match Regex::new(alternative) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        warn!("Skipping rule '{}' (alternative pattern): {}", spec.id, e);
                        continue;
                    }
                },
                _ => None,
            };

            rules.push(CompiledRule {
                id: spec.id,
                priority: spec.priority,
                regex,
                alternative,
                action: spec.action,
            });
        }

        debug!(
            "Compiled {} signal rules and {} extraction rules",
            signals.len(),
            rules.len()
        );

        Self {
            mentions: MentionIndex::new(vocabulary),
            signals,
            rules,
        }
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Ids of every signal present in `text` (expected lower-cased).
    ///
    /// Besides the static phrase table, a metric mention followed by an asserted value
    /// ("hrv was 45", "deep sleep 1h 20m") and any qualitative rule count as signals.
    pub fn matched_signals(&self, text: &str) -> Vec<(&'static str, SignalTier)> {
        let mut matched: Vec<(&'static str, SignalTier)> = self
            .signals
            .iter()
            .filter(|s| s.regex.is_match(text))
            .map(|s| (s.id, s.tier))
            .collect();

        let mentions = self.mentions.find(text);
        let asserts_value = mentions.iter().enumerate().any(|(i, mention)| {
            let window = mention_window(text, &mentions, i);
            self.rules.iter().any(|rule| match rule.action {
                RuleAction::DirectNumeric => {
                    mention.value_type == ValueType::Numeric
                        && asserted_number(&rule.regex, window).is_some()
                }
                RuleAction::Duration => {
                    mention.value_type == ValueType::DurationMinutes
                        && stated_duration(&rule.regex, window).is_some()
                }
                _ => false,
            })
        });
        if asserts_value {
            matched.push(("metric_value_assertion", SignalTier::ValueAssertion));
        }

        for rule in &self.rules {
            if matches!(
                rule.action,
                RuleAction::Qualitative { .. } | RuleAction::Disambiguation { .. }
            ) && rule.regex.is_match(text)
            {
                let tier = match rule.action {
                    RuleAction::Qualitative { .. } => SignalTier::QualitativeState,
                    _ => SignalTier::DirectCorrection,
                };
                matched.push((rule.id, tier));
            }
        }

        matched
    }
}

/// The number an assertion tail captures in `window`, unless it reads as a time of day.
pub fn asserted_number<'a>(tail: &Regex, window: &'a str) -> Option<Match<'a>> {
    let n = tail.captures(window)?.name("n")?;
    (!is_clock_suffix(&window[n.end()..])).then_some(n)
}

/// First duration in `window` not introduced by a time preposition ("at", "until", "by").
pub fn stated_duration(duration: &Regex, window: &str) -> Option<(i64, Range<usize>)> {
    duration.captures_iter(window).find_map(|caps| {
        let whole = caps.get(0)?;
        let preceding = window[..whole.start()].split_whitespace().last();
        if matches!(preceding, Some("at" | "until" | "till" | "by")) {
            return None;
        }
        Some((duration_from_captures(&caps)?, whole.range()))
    })
}

fn removal_gap_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:(?:,|and|or|&)\s*)?(?:(?:a|an|any|the|my|your)\s+)?$")
            .expect("removal gap pattern compiles")
    })
}

/// Mentions a removal trigger ending at `trigger_end` names: the one right after it
/// (an article or possessive may sit between) and any that continue the list
/// ("the hrv and rhr").
pub fn removal_targets<'m>(
    text: &str,
    mentions: &'m [Mention],
    trigger_end: usize,
) -> Vec<&'m Mention> {
    let mut targets = Vec::new();
    let mut cursor = trigger_end;
    for mention in mentions.iter().filter(|m| m.span.start >= trigger_end) {
        if !removal_gap_regex().is_match(&text[cursor..mention.span.start]) {
            break;
        }
        cursor = mention.span.end;
        targets.push(mention);
    }
    targets
}

/// Text following mention `idx`, up to the next mention or the end of the sentence.
pub fn mention_window<'a>(text: &'a str, mentions: &[Mention], idx: usize) -> &'a str {
    let start = mentions[idx].span.end;
    let next_mention = mentions
        .get(idx + 1)
        .map(|m| m.span.start)
        .unwrap_or(text.len());
    let end = sentence_end(text, start).min(next_mention);
    &text[start..end]
}

/// Byte offset of the next sentence terminator at or after `from`.
fn sentence_end(text: &str, from: usize) -> usize {
    text[from..]
        .find(|c: char| matches!(c, '.' | '!' | '?' | ';' | '\n'))
        .map(|offset| {
            // Keep decimal points: "7.5 hours" is not a sentence break.
            let at = from + offset;
            let bytes = text.as_bytes();
            let is_decimal = bytes[at] == b'.'
                && at > 0
                && bytes[at - 1].is_ascii_digit()
                && bytes.get(at + 1).map(u8::is_ascii_digit).unwrap_or(false);
            if is_decimal {
                sentence_end(text, at + 1)
            } else {
                at
            }
        })
        .unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_vocabulary;

    fn ids(text: &str) -> Vec<&'static str> {
        let rules = RuleSet::standard(&default_vocabulary());
        rules
            .matched_signals(text)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    #[test]
    fn test_all_builtin_rules_compile() {
        let rules = RuleSet::standard(&default_vocabulary());
        assert_eq!(rules.rules().len(), EXTRACTION_RULES.len());
        assert_eq!(rules.signals.len(), SIGNAL_RULES.len());
    }

    #[test]
    fn test_signal_tiers() {
        assert!(ids("that's wrong").contains(&"thats_wrong"));
        assert!(ids("that's not my resting heart rate").contains(&"not_my"));
        assert!(ids("clearly 30").contains(&"emphatic_value"));
        assert!(ids("there is no sleep score").contains(&"there_is_no"));
        assert!(ids("my hrv was 45").contains(&"metric_value_assertion"));
        assert!(ids("i slept great").contains(&"slept_well"));
        assert!(ids("my readiness was low").contains(&"readiness_low"));
    }

    #[test]
    fn test_ordinary_chat_has_no_signals() {
        assert!(ids("what should i eat before a long run?").is_empty());
        assert!(ids("thanks, that helps").is_empty());
    }

    #[test]
    fn test_qualitative_rule_without_bounds_is_skipped() {
        let json = r#"{"metrics": [{"key": "sleep_score", "value_type": "numeric"}]}"#;
        let vocab = MetricVocabulary::from_json_str(json).unwrap();
        let rules = RuleSet::standard(&vocab);
        assert!(rules
            .rules()
            .iter()
            .all(|r| !matches!(r.action, RuleAction::Qualitative { .. })));
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let specs = [RuleSpec {
            id: "broken",
            priority: 1,
            pattern: r"[unclosed",
            action: RuleAction::Removal,
        }];
        let rules = RuleSet::compile(&default_vocabulary(), &[], &specs);
        assert!(rules.rules().is_empty());
    }

    #[test]
    fn test_priority_is_distinct_per_rule_kind() {
        use std::collections::HashMap;
        use std::mem::discriminant;

        let mut by_priority: HashMap<u8, std::mem::Discriminant<RuleAction>> = HashMap::new();
        for spec in EXTRACTION_RULES {
            let kind = discriminant(&spec.action);
            let owner = by_priority.entry(spec.priority).or_insert(kind);
            assert_eq!(*owner, kind, "priority {} shared by rule kinds", spec.priority);
        }
        assert!(PRIORITY_DISAMBIGUATION > PRIORITY_DURATION);
        assert!(PRIORITY_DURATION > PRIORITY_BARE_MAGNITUDE);
        assert!(PRIORITY_BARE_MAGNITUDE > PRIORITY_DIRECT_NUMERIC);
        assert!(PRIORITY_DIRECT_NUMERIC > PRIORITY_REMOVAL);
        assert!(PRIORITY_REMOVAL > PRIORITY_QUALITATIVE);
    }

    #[test]
    fn test_time_of_day_is_not_a_value_assertion() {
        assert!(!ids("i slept at 11:30 last night").contains(&"metric_value_assertion"));
        assert!(!ids("my heart rate at 6am was 80").contains(&"metric_value_assertion"));
        assert!(!ids("my heart rate was 6:45 when i checked").contains(&"metric_value_assertion"));
        assert!(ids("my steps were 12,000").contains(&"metric_value_assertion"));
        assert!(ids("i slept 7h 30m").contains(&"metric_value_assertion"));
    }

    #[test]
    fn test_stated_duration_skips_time_prepositions() {
        let re = Regex::new(DURATION_PATTERN).unwrap();
        assert_eq!(stated_duration(&re, " at 11h then"), None);
        assert_eq!(stated_duration(&re, " until 7h, so about 8 hours"), Some((480, 20..27)));
        assert_eq!(stated_duration(&re, " was 7h 30m"), Some((450, 5..11)));
    }

    #[test]
    fn test_removal_targets_follow_the_trigger() {
        let rules = RuleSet::standard(&default_vocabulary());
        let keys = |text: &str, trigger: &str| -> Vec<String> {
            let mentions = rules.mentions.find(text);
            let end = text.find(trigger).unwrap() + trigger.len();
            removal_targets(text, &mentions, end)
                .into_iter()
                .map(|m| m.key.clone())
                .collect()
        };
        assert_eq!(keys("there is no sleep score", "there is no"), vec!["sleep_score"]);
        assert_eq!(
            keys("i don't know where you got the hrv and rhr from", "you got"),
            vec!["hrv", "resting_heart_rate"]
        );
        assert!(keys("there's no way my hrv was that low", "there's no").is_empty());
        assert!(keys("i don't have a clue what my hrv is", "i don't have").is_empty());
    }

    #[test]
    fn test_sentence_end_skips_decimals() {
        let text = "deep sleep was 1.5 hours. rem was fine";
        assert_eq!(sentence_end(text, 0), 24);
    }
}
