//! Machine-to-cohort matching.

use regex::Regex;
use std::collections::HashMap;

/// A compiled metadata filter. Compile once per cohort snapshot and reuse
/// across machines; regex compilation is far too slow for per-request work.
pub struct MetadataMatcher {
    patterns: Vec<(String, Regex)>,
}

impl MetadataMatcher {
    pub fn compile(metadata_match: &HashMap<String, String>) -> Result<Self, regex::Error> {
        let mut patterns = Vec::with_capacity(metadata_match.len());
        for (key, source) in metadata_match {
            patterns.push((key.clone(), Regex::new(source)?));
        }
        Ok(Self { patterns })
    }

    /// A machine matches when every filtered key exists and its value
    /// matches that key's regex. The empty filter matches every machine.
    pub fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        self.patterns.iter().all(|(key, regex)| {
            metadata
                .get(key)
                .map(|value| regex.is_match(value))
                .unwrap_or(false)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
