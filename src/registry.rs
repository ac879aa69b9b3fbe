//! The classification registry.
//!
//! Owns the matcher table, provider provenance, pending (lazily instantiated)
//! providers, removed-mapping records and the ignored-file masks. Lookups
//! take the read side of one lock; registrations, explicit user edits and
//! pending instantiation take the write side. Listener callbacks always run
//! after the lock has been released.

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::classification::Classification;
use crate::ignored::{DEFAULT_IGNORE_MASKS, IgnoredFiles};
use crate::matcher::{Matcher, MatcherSpec, MatcherSpecError};
use crate::removed::{RemovedMapping, RemovedMappingTracker};
use crate::resolver::{AssociationEntry, Provenance, resolve};
use crate::table::MatcherTable;

pub const PERSISTED_STATE_VERSION: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("classification `{name}` is already registered by {existing}; {incoming} cannot register it")]
    DuplicateClassification {
        name: String,
        existing: String,
        incoming: String,
    },

    #[error("description `{description}` of `{name}` is already used by `{existing}`")]
    DuplicateDescription {
        description: String,
        name: String,
        existing: String,
    },

    #[error("unknown classification `{0}`")]
    UnknownClassification(String),

    #[error("provider declared `{declared}` but produced `{produced}`")]
    NameMismatch { declared: String, produced: String },

    #[error(transparent)]
    Spec(#[from] MatcherSpecError),
}

/// Advisory record of a matcher claimed by two classifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub matcher: Matcher,
    pub winner: String,
    pub loser: String,
    pub approved: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterReport {
    pub conflicts: Vec<ConflictReport>,
    /// Matchers not applied because the user removed them from this
    /// classification earlier.
    pub skipped: Vec<Matcher>,
    /// A plugin tried to reuse a name another plugin already owns.
    pub duplicate_ignored: bool,
}

/// Observer of registry mutations. All hooks default to no-ops.
pub trait RegistryListener: Send + Sync {
    fn before_change(&self) {}

    /// `added`/`removed` are `None` for changes that only move matchers.
    fn changed(&self, _added: Option<&Classification>, _removed: Option<&Classification>) {}

    fn conflict(&self, _report: &ConflictReport) {}
}

type Factory = Box<dyn FnOnce() -> Classification + Send + Sync>;

/// A provider registered by name and matchers; its classification is only
/// built when first needed.
pub struct ProviderDeclaration {
    pub name: String,
    pub provenance: Provenance,
    pub matchers: Vec<Matcher>,
    factory: Factory,
}

impl ProviderDeclaration {
    pub fn new<F>(name: impl Into<String>, provenance: Provenance, matchers: Vec<Matcher>, factory: F) -> Self
    where
        F: FnOnce() -> Classification + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            provenance,
            matchers,
            factory: Box::new(factory),
        }
    }
}

impl fmt::Debug for ProviderDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDeclaration")
            .field("name", &self.name)
            .field("provenance", &self.provenance)
            .field("matchers", &self.matchers)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedAssociation {
    pub matcher: Matcher,
    pub classification: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedHashBang {
    pub marker: String,
    pub classification: String,
}

/// User-facing registry state that survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "legacy_version")]
    pub version: u32,
    #[serde(default = "default_masks")]
    pub ignore_masks: String,
    #[serde(default)]
    pub removed_mappings: Vec<RemovedMapping>,
    #[serde(default)]
    pub associations: Vec<PersistedAssociation>,
    #[serde(default)]
    pub hash_bangs: Vec<PersistedHashBang>,
}

fn legacy_version() -> u32 {
    1
}

fn default_masks() -> String {
    DEFAULT_IGNORE_MASKS.to_string()
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: PERSISTED_STATE_VERSION,
            ignore_masks: default_masks(),
            removed_mappings: Vec::new(),
            associations: Vec::new(),
            hash_bangs: Vec::new(),
        }
    }
}

impl PersistedState {
    /// Brings an older document up to the current layout.
    ///
    /// Version 1 stored hash-bang markers as ordinary associations and had
    /// no approval flag on removed mappings (those default to approved).
    pub fn migrate(mut self) -> Self {
        if self.version < 2 {
            let (hash_bangs, associations): (Vec<_>, Vec<_>) = self
                .associations
                .into_iter()
                .partition(|a| a.matcher.is_hash_bang());
            self.associations = associations;
            for a in hash_bangs {
                if let Matcher::HashBang(marker) = a.matcher {
                    self.hash_bangs.push(PersistedHashBang {
                        marker,
                        classification: a.classification,
                    });
                }
            }
        }
        if self.version > PERSISTED_STATE_VERSION {
            tracing::warn!(
                version = self.version,
                "Registry state written by a newer version, loading known fields only"
            );
        }
        self.version = PERSISTED_STATE_VERSION;
        self
    }
}

#[derive(Default)]
struct RegistryState {
    table: MatcherTable<Classification>,
    classifications: IndexMap<String, Classification>,
    provenance: HashMap<String, Provenance>,
    pending: IndexMap<String, ProviderDeclaration>,
    pending_index: MatcherTable<Vec<String>>,
    removed: RemovedMappingTracker,
    user_associations: IndexMap<Matcher, String>,
    deferred: Vec<(Matcher, String)>,
}

enum Admission {
    Fresh,
    SameProvider,
    KeepExisting,
}

enum Event {
    Changed {
        added: Option<Classification>,
        removed: Option<Classification>,
    },
    Conflict(ConflictReport),
}

pub struct Registry {
    state: RwLock<RegistryState>,
    listeners: RwLock<Vec<Arc<dyn RegistryListener>>>,
    ignored: IgnoredFiles,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Registry")
            .field("classifications", &state.classifications.len())
            .field("pending", &state.pending.len())
            .field("matchers", &state.table.len())
            .field("removed_mappings", &state.removed.len())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry holding only `PLAIN_TEXT` and `UNKNOWN`.
    pub fn new() -> Self {
        let mut state = RegistryState::default();
        for c in [Classification::plain_text(), Classification::unknown()] {
            state.provenance.insert(c.name().to_string(), Provenance::core());
            state.classifications.insert(c.name().to_string(), c);
        }
        state
            .table
            .add(Matcher::extension("txt"), Classification::plain_text());
        Self {
            state: RwLock::new(state),
            listeners: RwLock::new(Vec::new()),
            ignored: IgnoredFiles::default(),
        }
    }

    /// A registry with the bundled classifications declared.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::builtin::declare_builtins(&registry);
        registry
    }

    pub fn subscribe(&self, listener: Arc<dyn RegistryListener>) {
        self.listeners.write().push(listener);
    }

    pub fn ignored(&self) -> &IgnoredFiles {
        &self.ignored
    }

    pub fn set_ignore_masks(&self, raw: &str) {
        self.notify_before_change();
        self.ignored.set_mask_list(raw);
        self.emit(vec![Event::Changed {
            added: None,
            removed: None,
        }]);
    }

    /// Name-based classification. Returns `UNKNOWN` when nothing matches.
    pub fn classify_by_name(&self, file_name: &str) -> Classification {
        self.instantiate_matching(|index| index.find(file_name).cloned());
        self.state
            .read()
            .table
            .find(file_name)
            .cloned()
            .unwrap_or_else(Classification::unknown)
    }

    /// Classification named by the `#!` line of `content_prefix`, if any.
    pub fn classify_by_hash_bang(&self, content_prefix: &str) -> Option<Classification> {
        self.instantiate_matching(|index| index.find_by_hash_bang(content_prefix).cloned());
        self.state
            .read()
            .table
            .find_by_hash_bang(content_prefix)
            .cloned()
    }

    pub fn find_classification(&self, name: &str) -> Option<Classification> {
        {
            let state = self.state.read();
            if let Some(c) = state.classifications.get(name) {
                return Some(c.clone());
            }
            if !state.pending.contains_key(name) {
                return None;
            }
        }
        let mut state = self.state.write();
        state.instantiate(name);
        state.classifications.get(name).cloned()
    }

    pub fn register(
        &self,
        classification: Classification,
        provenance: Provenance,
        matchers: Vec<Matcher>,
    ) -> Result<RegisterReport, RegistryError> {
        self.notify_before_change();
        let mut report = RegisterReport::default();
        let added = {
            let mut state = self.state.write();
            match state.admit(&classification, &provenance)? {
                Admission::KeepExisting => {
                    tracing::warn!(
                        name = classification.name(),
                        incoming = %provenance,
                        "Ignoring duplicate classification from another plugin"
                    );
                    report.duplicate_ignored = true;
                    return Ok(report);
                }
                Admission::SameProvider | Admission::Fresh => {}
            }
            if let Some(decl) = state.pending.shift_remove(classification.name()) {
                state.unindex_pending(&decl);
            }
            state.apply_registration(classification.clone(), provenance, matchers, &mut report)
        };

        let mut events: Vec<Event> = report.conflicts.iter().cloned().map(Event::Conflict).collect();
        events.push(Event::Changed {
            added: added.then_some(classification),
            removed: None,
        });
        self.emit(events);
        Ok(report)
    }

    pub fn register_spec(
        &self,
        classification: Classification,
        provenance: Provenance,
        spec: &MatcherSpec,
    ) -> Result<RegisterReport, RegistryError> {
        let matchers = spec.parse()?;
        self.register(classification, provenance, matchers)
    }

    /// Registers a provider to be built on first use.
    pub fn declare(&self, declaration: ProviderDeclaration) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        let name = declaration.name.clone();
        if let Some(existing) = state.provenance.get(&name) {
            return match admission(&name, existing, &declaration.provenance)? {
                Admission::KeepExisting => {
                    tracing::warn!(%name, "Ignoring duplicate declaration from another plugin");
                    Ok(())
                }
                _ => Ok(()),
            };
        }
        if let Some(pending) = state.pending.get(&name) {
            match admission(&name, &pending.provenance, &declaration.provenance)? {
                Admission::KeepExisting => {
                    tracing::warn!(%name, "Ignoring duplicate declaration from another plugin");
                    return Ok(());
                }
                _ => {
                    if let Some(old) = state.pending.shift_remove(&name) {
                        state.unindex_pending(&old);
                    }
                }
            }
        }
        for matcher in &declaration.matchers {
            let mut names = state.pending_index.holder(matcher).cloned().unwrap_or_default();
            if !names.contains(&name) {
                names.push(name.clone());
            }
            state.pending_index.add(matcher.clone(), names);
        }
        tracing::trace!(%name, matchers = declaration.matchers.len(), "Declared provider");
        state.pending.insert(name, declaration);
        Ok(())
    }

    /// Removes a classification and everything it holds. Matchers it won in
    /// an unapproved conflict go back to the registered loser.
    pub fn unregister(&self, name: &str) -> bool {
        self.notify_before_change();
        let removed = {
            let mut state = self.state.write();
            let was_pending = match state.pending.shift_remove(name) {
                Some(decl) => {
                    state.unindex_pending(&decl);
                    true
                }
                None => false,
            };
            let Some(classification) = state.classifications.shift_remove(name) else {
                return was_pending;
            };
            state.provenance.remove(name);
            let freed = state.table.remove_all(&classification);
            for matcher in freed {
                state.give_back(matcher, name);
            }
            state.user_associations.retain(|_, n| n != name);
            classification
        };
        tracing::debug!(name, "Unregistered classification");
        self.emit(vec![Event::Changed {
            added: None,
            removed: Some(removed),
        }]);
        true
    }

    /// Explicitly maps `matcher` to `name`, overriding any current holder.
    pub fn associate(&self, matcher: Matcher, name: &str) -> Result<(), RegistryError> {
        let classification = self
            .find_classification(name)
            .ok_or_else(|| RegistryError::UnknownClassification(name.to_string()))?;
        self.notify_before_change();
        self.state.write().associate(matcher, classification);
        self.emit(vec![Event::Changed {
            added: None,
            removed: None,
        }]);
        Ok(())
    }

    /// Explicitly detaches `matcher` from `name`. Returns whether the
    /// matcher was held by it.
    pub fn disassociate(&self, matcher: &Matcher, name: &str) -> bool {
        let Some(classification) = self.find_classification(name) else {
            return false;
        };
        self.notify_before_change();
        let removed = {
            let mut state = self.state.write();
            state.removed.add(matcher.clone(), name, true);
            if state.user_associations.get(matcher).map(String::as_str) == Some(name) {
                state.user_associations.shift_remove(matcher);
            }
            state.table.remove(matcher, &classification)
        };
        if removed {
            self.emit(vec![Event::Changed {
                added: None,
                removed: None,
            }]);
        }
        removed
    }

    pub fn add_hash_bang(&self, marker: &str, name: &str) -> Result<(), RegistryError> {
        self.associate(Matcher::hash_bang(marker), name)
    }

    pub fn associations_of(&self, name: &str) -> Vec<Matcher> {
        let Some(classification) = self.find_classification(name) else {
            return Vec::new();
        };
        let mut matchers = self.state.read().table.associations_of(&classification);
        matchers.sort();
        matchers
    }

    /// Every classification, instantiating pending providers first.
    pub fn classifications(&self) -> Vec<Classification> {
        {
            let mut state = self.state.write();
            let names: Vec<String> = state.pending.keys().cloned().collect();
            for name in names {
                state.instantiate(&name);
            }
        }
        self.state.read().classifications.values().cloned().collect()
    }

    pub fn removed_mappings(&self) -> Vec<RemovedMapping> {
        self.state.read().removed.mappings()
    }

    /// Confirms every automatic conflict decision.
    pub fn approve_removed_mappings(&self) {
        self.state.write().removed.approve_all();
    }

    pub fn provenance_of(&self, name: &str) -> Option<Provenance> {
        let state = self.state.read();
        state
            .provenance
            .get(name)
            .or_else(|| state.pending.get(name).map(|d| &d.provenance))
            .cloned()
    }

    pub fn table_snapshot(&self) -> MatcherTable<Classification> {
        self.state.read().table.copy()
    }

    pub fn pending_len(&self) -> usize {
        self.state.read().pending.len()
    }

    pub fn snapshot(&self) -> PersistedState {
        let state = self.state.read();
        let mut associations = Vec::new();
        let mut hash_bangs = Vec::new();
        for (matcher, name) in &state.user_associations {
            match matcher {
                Matcher::HashBang(marker) => hash_bangs.push(PersistedHashBang {
                    marker: marker.clone(),
                    classification: name.clone(),
                }),
                _ => associations.push(PersistedAssociation {
                    matcher: matcher.clone(),
                    classification: name.clone(),
                }),
            }
        }
        for (matcher, name) in &state.deferred {
            associations.push(PersistedAssociation {
                matcher: matcher.clone(),
                classification: name.clone(),
            });
        }
        PersistedState {
            version: PERSISTED_STATE_VERSION,
            ignore_masks: self.ignored.masks().as_list(),
            removed_mappings: state.removed.mappings(),
            associations,
            hash_bangs,
        }
    }

    /// Applies a persisted state on top of the current registrations.
    /// Associations naming a classification that is not registered yet are
    /// kept and applied when it registers.
    pub fn restore(&self, persisted: PersistedState) {
        let persisted = persisted.migrate();
        self.notify_before_change();
        self.ignored.set_mask_list(&persisted.ignore_masks);
        {
            let mut state = self.state.write();
            state.removed.load(persisted.removed_mappings);
            let removals: Vec<RemovedMapping> = state.removed.mappings();
            for mapping in removals {
                if let Some(c) = state.classifications.get(&mapping.classification).cloned() {
                    state.table.remove(&mapping.matcher, &c);
                }
            }

            let explicit = persisted
                .associations
                .into_iter()
                .map(|a| (a.matcher, a.classification))
                .chain(
                    persisted
                        .hash_bangs
                        .into_iter()
                        .map(|h| (Matcher::HashBang(h.marker), h.classification)),
                );
            for (matcher, name) in explicit {
                state.instantiate(&name);
                match state.classifications.get(&name).cloned() {
                    Some(c) => state.associate(matcher, c),
                    None => state.deferred.push((matcher, name)),
                }
            }
        }
        self.emit(vec![Event::Changed {
            added: None,
            removed: None,
        }]);
    }

    /// Instantiates pending providers selected by `lookup` until none is
    /// left for this query.
    fn instantiate_matching(&self, lookup: impl Fn(&MatcherTable<Vec<String>>) -> Option<Vec<String>>) {
        if lookup(&self.state.read().pending_index).is_none() {
            return;
        }
        let mut state = self.state.write();
        while let Some(names) = lookup(&state.pending_index) {
            for name in names {
                if !state.instantiate(&name) {
                    // Drop a stale index entry so the loop terminates.
                    state.unindex_name(&name);
                }
            }
        }
    }

    fn notify_before_change(&self) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.before_change();
        }
    }

    fn emit(&self, events: Vec<Event>) {
        let listeners = self.listeners.read().clone();
        if listeners.is_empty() {
            return;
        }
        for event in &events {
            for listener in &listeners {
                match event {
                    Event::Changed { added, removed } => listener.changed(added.as_ref(), removed.as_ref()),
                    Event::Conflict(report) => listener.conflict(report),
                }
            }
        }
    }
}

fn admission(name: &str, existing: &Provenance, incoming: &Provenance) -> Result<Admission, RegistryError> {
    if existing.provider_id == incoming.provider_id {
        return Ok(Admission::SameProvider);
    }
    if !existing.is_bundled() && !incoming.is_bundled() {
        return Ok(Admission::KeepExisting);
    }
    Err(RegistryError::DuplicateClassification {
        name: name.to_string(),
        existing: existing.to_string(),
        incoming: incoming.to_string(),
    })
}

impl RegistryState {
    fn admit(&self, c: &Classification, incoming: &Provenance) -> Result<Admission, RegistryError> {
        let existing = self
            .provenance
            .get(c.name())
            .or_else(|| self.pending.get(c.name()).map(|d| &d.provenance));
        if let Some(existing) = existing {
            return admission(c.name(), existing, incoming);
        }
        if c.description().is_empty() {
            return Ok(Admission::Fresh);
        }
        let clash = self
            .classifications
            .values()
            .find(|other| other.name() != c.name() && other.description() == c.description());
        let Some(other) = clash else {
            return Ok(Admission::Fresh);
        };
        let Some(existing) = self.provenance.get(other.name()) else {
            return Ok(Admission::Fresh);
        };
        match admission(other.name(), existing, incoming) {
            Ok(Admission::SameProvider) => Ok(Admission::Fresh),
            Ok(other_outcome) => Ok(other_outcome),
            Err(_) => Err(RegistryError::DuplicateDescription {
                description: c.description().to_string(),
                name: c.name().to_string(),
                existing: other.name().to_string(),
            }),
        }
    }

    /// Returns whether the classification was newly added.
    fn apply_registration(
        &mut self,
        classification: Classification,
        provenance: Provenance,
        matchers: Vec<Matcher>,
        report: &mut RegisterReport,
    ) -> bool {
        let name = classification.name().to_string();
        let added = self
            .classifications
            .insert(name.clone(), classification.clone())
            .is_none();
        self.provenance.insert(name.clone(), provenance.clone());

        for matcher in matchers {
            if self.removed.is_removed(&matcher, &name) {
                report.skipped.push(matcher);
                continue;
            }
            let existing = self.table.holder(&matcher).map(|holder| {
                let holder_provenance = self
                    .provenance
                    .get(holder.name())
                    .cloned()
                    .unwrap_or_else(Provenance::core);
                AssociationEntry::new(matcher.clone(), holder.clone(), holder_provenance)
            });
            let incoming = AssociationEntry::new(matcher.clone(), classification.clone(), provenance.clone());
            let resolution = resolve(existing.as_ref(), &incoming);
            let winner = resolution.winner.classification.clone();
            if let Some(loser) = resolution.loser {
                let conflict = ConflictReport {
                    matcher: matcher.clone(),
                    winner: winner.name().to_string(),
                    loser: loser.classification.name().to_string(),
                    approved: resolution.approved,
                };
                if conflict.approved {
                    tracing::info!(matcher = %conflict.matcher, winner = %conflict.winner, loser = %conflict.loser, "Resolved matcher conflict");
                } else {
                    tracing::warn!(matcher = %conflict.matcher, winner = %conflict.winner, loser = %conflict.loser, "Matcher conflict needs review");
                }
                self.removed
                    .add(matcher.clone(), &conflict.loser, conflict.approved);
                report.conflicts.push(conflict);
            }
            if self.table.holder(&matcher) != Some(&winner) {
                self.table.add(matcher, winner);
            }
        }

        let (ready, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.deferred).into_iter().partition(|(_, n)| *n == name);
        self.deferred = waiting;
        for (matcher, _) in ready {
            self.associate(matcher, classification.clone());
        }
        added
    }

    fn associate(&mut self, matcher: Matcher, classification: Classification) {
        let name = classification.name().to_string();
        self.removed.remove(&matcher, &name);
        if let Some(previous) = self.table.add(matcher.clone(), classification)
            && previous.name() != name
        {
            self.removed.add(matcher.clone(), previous.name(), true);
        }
        self.user_associations.insert(matcher, name);
    }

    fn give_back(&mut self, matcher: Matcher, departed: &str) {
        let heir = self
            .removed
            .for_matcher(&matcher)
            .iter()
            .filter(|m| !m.approved && m.classification != departed)
            .find_map(|m| self.classifications.get(&m.classification).cloned());
        if let Some(heir) = heir {
            tracing::debug!(%matcher, to = heir.name(), "Restoring matcher to previous holder");
            self.removed.remove(&matcher, heir.name());
            self.table.add(matcher, heir);
        }
    }

    /// Builds a pending provider under the write lock. Emits no events.
    fn instantiate(&mut self, name: &str) -> bool {
        let Some(decl) = self.pending.shift_remove(name) else {
            return false;
        };
        self.unindex_pending(&decl);
        let ProviderDeclaration {
            name: declared,
            provenance,
            matchers,
            factory,
        } = decl;

        let produced = match std::panic::catch_unwind(AssertUnwindSafe(factory)) {
            Ok(c) => c,
            Err(_) => {
                tracing::warn!(name = %declared, "Provider factory panicked");
                return true;
            }
        };
        if produced.name() != declared {
            let err = RegistryError::NameMismatch {
                declared,
                produced: produced.name().to_string(),
            };
            tracing::warn!(error = %err, "Discarding provider");
            return true;
        }
        let mut report = RegisterReport::default();
        self.apply_registration(produced, provenance, matchers, &mut report);
        tracing::trace!(name = %declared, conflicts = report.conflicts.len(), "Instantiated pending provider");
        true
    }

    fn unindex_pending(&mut self, decl: &ProviderDeclaration) {
        for matcher in &decl.matchers {
            self.unindex(matcher, &decl.name);
        }
    }

    fn unindex_name(&mut self, name: &str) {
        let matchers: Vec<Matcher> = self
            .pending_index
            .entries()
            .filter(|(_, names)| names.iter().any(|n| n == name))
            .map(|(m, _)| m)
            .collect();
        for matcher in matchers {
            self.unindex(&matcher, name);
        }
    }

    fn unindex(&mut self, matcher: &Matcher, name: &str) {
        let Some(mut names) = self.pending_index.holder(matcher).cloned() else {
            return;
        };
        names.retain(|n| n != name);
        if names.is_empty() {
            self.pending_index.remove_matcher(matcher);
        } else {
            self.pending_index.add(matcher.clone(), names);
        }
    }
}
