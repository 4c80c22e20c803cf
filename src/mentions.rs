//! Locates conversational metric mentions ("resting heart rate", "hrv", "slept")
//! in lower-cased message text.

use std::collections::HashMap;
use std::ops::Range;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::{MetricVocabulary, ValueType};

/// One mention of a metric in a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Mention {
    pub key: String,
    pub value_type: ValueType,
    pub span: Range<usize>,
}

/// Phrase index built once from the vocabulary.
#[derive(Debug)]
pub struct MentionIndex {
    regex: Option<Regex>,
    phrases: HashMap<String, (String, ValueType)>,
}

impl MentionIndex {
    pub fn new(vocabulary: &MetricVocabulary) -> Self {
        let mut phrases: HashMap<String, (String, ValueType)> = HashMap::new();
        for def in vocabulary.iter() {
            for mention in &def.mentions {
                let phrase = normalize_phrase(mention);
                if phrase.is_empty() {
                    continue;
                }
                if let Some((owner, _)) = phrases.get(&phrase) {
                    warn!(
                        "Mention '{}' of {} already belongs to {}; keeping the earlier entry",
                        phrase, def.key, owner
                    );
                    continue;
                }
                phrases.insert(phrase, (def.key.clone(), def.value_type));
            }
        }

        // Longest phrase first: alternation is leftmost-first, so "resting heart rate"
        // must be tried before "heart rate".
        let mut ordered: Vec<&String> = phrases.keys().collect();
        ordered.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let alternatives: Vec<String> = ordered
            .iter()
            .map(|phrase| {
                phrase
                    .split(' ')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(r"\s+")
            })
            .collect();

        let regex = if alternatives.is_empty() {
            None
        } else {
            match Regex::new(&format!(r"\b(?:{})\b", alternatives.join("|"))) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Failed to compile mention index: {}", e);
                    None
                }
            }
        };

        debug!("Mention index: {} phrases", phrases.len());
        Self { regex, phrases }
    }

    /// All non-overlapping mentions in `text` (expected lower-cased), in order.
    pub fn find(&self, text: &str) -> Vec<Mention> {
        let Some(regex) = &self.regex else {
            return Vec::new();
        };

        regex
            .find_iter(text)
            .filter_map(|m| {
                let phrase = normalize_phrase(m.as_str());
                self.phrases.get(&phrase).map(|(key, value_type)| Mention {
                    key: key.clone(),
                    value_type: *value_type,
                    span: m.range(),
                })
            })
            .collect()
    }
}

fn normalize_phrase(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Distinct keys of the given type, in first-mention order.
pub fn distinct_keys(mentions: &[Mention], value_type: ValueType) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for mention in mentions.iter().filter(|m| m.value_type == value_type) {
        if !keys.contains(&mention.key) {
            keys.push(mention.key.clone());
        }
    }
    keys
}
