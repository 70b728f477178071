use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::presets::{GLOBAL_TAG_BLACKLIST, TAG_CONFLICT_TABLE};

/// Filters model-inferred tags against the user's own wording.
///
/// Matching is substring based and case-insensitive on purpose: a single entry
/// such as `hair` removes every compound form (`long hair`, `hair ornament`).
/// Coincidental substrings are over-suppressed as well.
#[derive(Debug, Clone)]
pub struct TagConflictResolver {
    blacklist: Vec<String>,
    conflicts: IndexMap<String, Vec<String>>,
}

impl Default for TagConflictResolver {
    fn default() -> Self {
        let conflicts = TAG_CONFLICT_TABLE
            .iter()
            .map(|(category, synonyms)| {
                (
                    (*category).to_string(),
                    synonyms.iter().map(|item| (*item).to_string()).collect(),
                )
            })
            .collect();
        Self::new(
            GLOBAL_TAG_BLACKLIST.iter().map(|item| (*item).to_string()),
            conflicts,
        )
    }
}

impl TagConflictResolver {
    pub fn new(
        blacklist: impl IntoIterator<Item = String>,
        conflicts: IndexMap<String, Vec<String>>,
    ) -> Self {
        Self {
            blacklist: blacklist.into_iter().collect(),
            conflicts,
        }
    }

    /// Suppression entries active for `user_text`, lowercased.
    pub fn suppression_set(&self, user_text: &str, extra: &[String]) -> BTreeSet<String> {
        let user_lower = user_text.to_lowercase();
        let mut active: BTreeSet<String> = self
            .blacklist
            .iter()
            .chain(extra.iter())
            .map(|entry| entry.trim().to_lowercase())
            .collect();
        for (category, synonyms) in &self.conflicts {
            if user_lower.contains(&category.to_lowercase()) {
                active.extend(synonyms.iter().map(|entry| entry.trim().to_lowercase()));
            }
        }
        // an empty entry would be a substring of every tag
        active.remove("");
        active
    }

    /// Tags from `raw_tags` that survive suppression, in their original order.
    pub fn filter(&self, raw_tags: &str, user_text: &str, extra: &[String]) -> Vec<String> {
        let suppressed = self.suppression_set(user_text, extra);
        split_tags(raw_tags)
            .into_iter()
            .filter(|tag| {
                let lowered = tag.to_lowercase();
                !suppressed
                    .iter()
                    .any(|entry| lowered.contains(entry.as_str()))
            })
            .collect()
    }

    /// Weighted clause `(tag, tag:weight)`, or an empty string when nothing is kept.
    pub fn resolve(&self, raw_tags: &str, user_text: &str, weight: f64, extra: &[String]) -> String {
        let kept = self.filter(raw_tags, user_text, extra);
        if kept.is_empty() {
            return String::new();
        }
        emphasize(&kept.join(", "), weight)
    }
}

pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

/// Wraps text in the `(text:weight)` emphasis syntax understood by the backend.
pub fn emphasize(text: &str, weight: f64) -> String {
    format!("({text}:{})", trim_float(weight))
}

pub fn trim_float(value: f64) -> String {
    let text = format!("{value:.6}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}
