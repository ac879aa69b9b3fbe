//! Durable records of matchers deliberately detached from a classification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::matcher::Matcher;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemovedMapping {
    pub matcher: Matcher,
    pub classification: String,
    /// `false` when the removal came from an automatic conflict decision an
    /// operator has not confirmed yet.
    #[serde(default = "approved_default")]
    pub approved: bool,
}

fn approved_default() -> bool {
    true
}

impl RemovedMapping {
    pub fn new(matcher: Matcher, classification: impl Into<String>, approved: bool) -> Self {
        Self {
            matcher,
            classification: classification.into(),
            approved,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemovedMappingTracker {
    by_matcher: BTreeMap<Matcher, Vec<RemovedMapping>>,
}

impl RemovedMappingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a removal. Re-recording the same pair updates its approval.
    pub fn add(&mut self, matcher: Matcher, classification: &str, approved: bool) {
        let list = self.by_matcher.entry(matcher.clone()).or_default();
        if let Some(existing) = list.iter_mut().find(|m| m.classification == classification) {
            existing.approved = approved;
            return;
        }
        list.push(RemovedMapping::new(matcher, classification, approved));
    }

    pub fn is_removed(&self, matcher: &Matcher, classification: &str) -> bool {
        self.find(matcher, classification).is_some()
    }

    pub fn find(&self, matcher: &Matcher, classification: &str) -> Option<&RemovedMapping> {
        self.by_matcher
            .get(matcher)?
            .iter()
            .find(|m| m.classification == classification)
    }

    pub fn for_matcher(&self, matcher: &Matcher) -> &[RemovedMapping] {
        self.by_matcher.get(matcher).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Clears the record for this pair, returning it if one existed.
    pub fn remove(&mut self, matcher: &Matcher, classification: &str) -> Option<RemovedMapping> {
        let list = self.by_matcher.get_mut(matcher)?;
        let idx = list.iter().position(|m| m.classification == classification)?;
        let removed = list.remove(idx);
        if list.is_empty() {
            self.by_matcher.remove(matcher);
        }
        Some(removed)
    }

    pub fn approve_all(&mut self) {
        for mapping in self.by_matcher.values_mut().flatten() {
            mapping.approved = true;
        }
    }

    pub fn unapproved(&self) -> Vec<RemovedMapping> {
        self.mappings().into_iter().filter(|m| !m.approved).collect()
    }

    /// All records in a stable order.
    pub fn mappings(&self) -> Vec<RemovedMapping> {
        self.by_matcher.values().flatten().cloned().collect()
    }

    pub fn load(&mut self, mappings: impl IntoIterator<Item = RemovedMapping>) {
        self.by_matcher.clear();
        for m in mappings {
            self.add(m.matcher, &m.classification, m.approved);
        }
    }

    pub fn len(&self) -> usize {
        self.by_matcher.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_matcher.is_empty()
    }
}
