//! Indexed matcher table.
//!
//! Every matcher kind has its own index so a name lookup costs a handful of
//! hash lookups plus one pass of the compiled wildcard set, regardless of how
//! many associations are registered. A matcher is held by at most one value:
//! adding a matcher that is already held replaces the holder.

use globset::{GlobMatcher, GlobSet, GlobSetBuilder};
use indexmap::IndexMap;
use std::collections::HashMap;

use crate::matcher::{Matcher, build_glob, extension_candidates, hash_bang_command, strip_version_suffix};

#[derive(Debug, Clone)]
struct WildcardEntry<T> {
    pattern: String,
    glob: GlobMatcher,
    value: T,
}

#[derive(Debug, Clone)]
pub struct MatcherTable<T> {
    exact: HashMap<String, T>,
    exact_any_case: HashMap<String, (String, T)>,
    extensions: HashMap<String, T>,
    wildcards: Vec<WildcardEntry<T>>,
    wildcard_set: GlobSet,
    hash_bangs: IndexMap<String, T>,
}

impl<T> Default for MatcherTable<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            exact_any_case: HashMap::new(),
            extensions: HashMap::new(),
            wildcards: Vec::new(),
            wildcard_set: GlobSet::empty(),
            hash_bangs: IndexMap::new(),
        }
    }
}

impl<T: Clone + PartialEq> MatcherTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates `matcher` with `value`, returning the previous holder.
    ///
    /// A wildcard that fails to compile is dropped with a warning; matchers
    /// built through [`Matcher::wildcard`] are already validated.
    pub fn add(&mut self, matcher: Matcher, value: T) -> Option<T> {
        match matcher {
            Matcher::Extension(ext) => self.extensions.insert(ext.to_lowercase(), value),
            Matcher::ExactName {
                name,
                case_sensitive: true,
            } => self.exact.insert(name, value),
            Matcher::ExactName {
                name,
                case_sensitive: false,
            } => self
                .exact_any_case
                .insert(name.to_lowercase(), (name, value))
                .map(|(_, v)| v),
            Matcher::Wildcard(pattern) => {
                if let Some(entry) = self.wildcards.iter_mut().find(|e| e.pattern == pattern) {
                    return Some(std::mem::replace(&mut entry.value, value));
                }
                let glob = match build_glob(&pattern) {
                    Ok(glob) => glob,
                    Err(err) => {
                        tracing::warn!(%pattern, error = %err, "Dropping uncompilable wildcard");
                        return None;
                    }
                };
                self.wildcards.push(WildcardEntry {
                    pattern,
                    glob: glob.compile_matcher(),
                    value,
                });
                self.rebuild_wildcard_set();
                None
            }
            Matcher::HashBang(marker) => self.hash_bangs.insert(marker, value),
        }
    }

    /// Removes `matcher` only if it is currently held by `value`.
    /// Absent matchers are a no-op.
    pub fn remove(&mut self, matcher: &Matcher, value: &T) -> bool {
        if self.holder(matcher) != Some(value) {
            return false;
        }
        self.remove_matcher(matcher).is_some()
    }

    /// Removes `matcher` regardless of its holder.
    pub fn remove_matcher(&mut self, matcher: &Matcher) -> Option<T> {
        match matcher {
            Matcher::Extension(ext) => self.extensions.remove(&ext.to_lowercase()),
            Matcher::ExactName {
                name,
                case_sensitive: true,
            } => self.exact.remove(name),
            Matcher::ExactName {
                name,
                case_sensitive: false,
            } => self.exact_any_case.remove(&name.to_lowercase()).map(|(_, v)| v),
            Matcher::Wildcard(pattern) => {
                let idx = self.wildcards.iter().position(|e| &e.pattern == pattern)?;
                let removed = self.wildcards.remove(idx);
                self.rebuild_wildcard_set();
                Some(removed.value)
            }
            Matcher::HashBang(marker) => self.hash_bangs.shift_remove(marker),
        }
    }

    /// The value currently holding exactly this matcher.
    pub fn holder(&self, matcher: &Matcher) -> Option<&T> {
        match matcher {
            Matcher::Extension(ext) => self.extensions.get(&ext.to_lowercase()),
            Matcher::ExactName {
                name,
                case_sensitive: true,
            } => self.exact.get(name),
            Matcher::ExactName {
                name,
                case_sensitive: false,
            } => self.exact_any_case.get(&name.to_lowercase()).map(|(_, v)| v),
            Matcher::Wildcard(pattern) => self
                .wildcards
                .iter()
                .find(|e| &e.pattern == pattern)
                .map(|e| &e.value),
            Matcher::HashBang(marker) => self.hash_bangs.get(marker),
        }
    }

    /// Looks up a file name: exact name, then case-insensitive name, then
    /// extension (longest compound extension first), then wildcards in
    /// insertion order.
    pub fn find(&self, file_name: &str) -> Option<&T> {
        if let Some(v) = self.exact.get(file_name) {
            return Some(v);
        }
        if !self.exact_any_case.is_empty()
            && let Some((_, v)) = self.exact_any_case.get(&file_name.to_lowercase())
        {
            return Some(v);
        }
        if !self.extensions.is_empty() {
            for candidate in extension_candidates(file_name) {
                if let Some(v) = self.find_by_extension(candidate) {
                    return Some(v);
                }
            }
        }
        if self.wildcards.is_empty() {
            return None;
        }
        self.wildcard_set
            .matches(file_name)
            .into_iter()
            .min()
            .map(|idx| &self.wildcards[idx].value)
    }

    pub fn find_by_extension(&self, ext: &str) -> Option<&T> {
        if let Some(v) = self.extensions.get(ext) {
            return Some(v);
        }
        let lower = ext.to_lowercase();
        if lower != ext {
            return self.extensions.get(&lower);
        }
        None
    }

    pub fn add_hash_bang(&mut self, marker: impl Into<String>, value: T) -> Option<T> {
        self.hash_bangs.insert(marker.into(), value)
    }

    /// Matches the `#!` line at the start of `content_prefix`.
    pub fn find_by_hash_bang(&self, content_prefix: &str) -> Option<&T> {
        if self.hash_bangs.is_empty() {
            return None;
        }
        let command = hash_bang_command(content_prefix)?;
        self.hash_bangs.get(command).or_else(|| {
            strip_version_suffix(command).and_then(|base| self.hash_bangs.get(base))
        })
    }

    pub fn hash_bangs_of(&self, value: &T) -> Vec<String> {
        self.hash_bangs
            .iter()
            .filter(|(_, v)| *v == value)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// All matchers (hash-bangs included) held by `value`.
    pub fn associations_of(&self, value: &T) -> Vec<Matcher> {
        self.entries()
            .filter(|(_, v)| *v == value)
            .map(|(m, _)| m)
            .collect()
    }

    /// Removes every matcher held by `value` and returns them.
    pub fn remove_all(&mut self, value: &T) -> Vec<Matcher> {
        let matchers = self.associations_of(value);
        for matcher in &matchers {
            self.remove_matcher(matcher);
        }
        matchers
    }

    pub fn entries(&self) -> impl Iterator<Item = (Matcher, &T)> + '_ {
        let exact = self.exact.iter().map(|(k, v)| (Matcher::exact(k.clone()), v));
        let any_case = self
            .exact_any_case
            .values()
            .map(|(name, v)| (Matcher::exact_any_case(name.clone()), v));
        let extensions = self
            .extensions
            .iter()
            .map(|(k, v)| (Matcher::Extension(k.clone()), v));
        let wildcards = self
            .wildcards
            .iter()
            .map(|e| (Matcher::Wildcard(e.pattern.clone()), &e.value));
        let hash_bangs = self
            .hash_bangs
            .iter()
            .map(|(k, v)| (Matcher::HashBang(k.clone()), v));
        exact
            .chain(any_case)
            .chain(extensions)
            .chain(wildcards)
            .chain(hash_bangs)
    }

    pub fn len(&self) -> usize {
        self.exact.len()
            + self.exact_any_case.len()
            + self.extensions.len()
            + self.wildcards.len()
            + self.hash_bangs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A consistent snapshot that can be swapped in wholesale.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    fn rebuild_wildcard_set(&mut self) {
        let mut builder = GlobSetBuilder::new();
        for entry in &self.wildcards {
            builder.add(entry.glob.glob().clone());
        }
        self.wildcard_set = builder.build().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Failed to compile wildcard set");
            GlobSet::empty()
        });
    }
}
