//! Provider provenance and the matcher conflict decision table.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::classification::Classification;
use crate::matcher::Matcher;

/// How close a provider is to the core distribution. Ordered from least to
/// most official.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderOrigin {
    Plugin,
    Bundled,
    Core,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub provider_id: String,
    pub origin: ProviderOrigin,
}

impl Provenance {
    pub fn new(provider_id: impl Into<String>, origin: ProviderOrigin) -> Self {
        Self {
            provider_id: provider_id.into(),
            origin,
        }
    }

    pub fn core() -> Self {
        Self::new("core", ProviderOrigin::Core)
    }

    pub fn bundled(provider_id: impl Into<String>) -> Self {
        Self::new(provider_id, ProviderOrigin::Bundled)
    }

    pub fn plugin(provider_id: impl Into<String>) -> Self {
        Self::new(provider_id, ProviderOrigin::Plugin)
    }

    pub fn is_bundled(&self) -> bool {
        self.origin >= ProviderOrigin::Bundled
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.provider_id, self.origin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationEntry {
    pub matcher: Matcher,
    pub classification: Classification,
    pub provenance: Provenance,
}

impl AssociationEntry {
    pub fn new(matcher: Matcher, classification: Classification, provenance: Provenance) -> Self {
        Self {
            matcher,
            classification,
            provenance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution<'a> {
    pub winner: &'a AssociationEntry,
    /// `None` when there was no real conflict.
    pub loser: Option<&'a AssociationEntry>,
    pub approved: bool,
}

/// Decides which of two claims on the same matcher survives.
///
/// Pure: the outcome depends only on the classifications and provenances of
/// the two entries.
pub fn resolve<'a>(
    existing: Option<&'a AssociationEntry>,
    incoming: &'a AssociationEntry,
) -> Resolution<'a> {
    let Some(existing) = existing else {
        return Resolution {
            winner: incoming,
            loser: None,
            approved: true,
        };
    };
    if existing.classification == incoming.classification {
        return Resolution {
            winner: incoming,
            loser: None,
            approved: true,
        };
    }

    let (defender, challenger) = if incoming.provenance.is_bundled() && !existing.provenance.is_bundled() {
        (incoming, existing)
    } else {
        (existing, incoming)
    };

    let decided = |winner: &'a AssociationEntry, approved: bool| {
        let loser = if std::ptr::eq(winner, defender) {
            challenger
        } else {
            defender
        };
        Resolution {
            winner,
            loser: Some(loser),
            approved,
        }
    };

    if defender.classification.is_placeholder() {
        return decided(challenger, true);
    }
    if challenger.classification.is_placeholder() {
        return decided(defender, true);
    }

    match (defender.provenance.is_bundled(), challenger.provenance.is_bundled()) {
        (true, false) => decided(challenger, false),
        (true, true) => match defender.provenance.origin.cmp(&challenger.provenance.origin) {
            std::cmp::Ordering::Greater => decided(defender, true),
            std::cmp::Ordering::Less => decided(challenger, true),
            std::cmp::Ordering::Equal => decided(existing, false),
        },
        _ => decided(existing, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, provenance: Provenance) -> AssociationEntry {
        AssociationEntry::new(
            Matcher::extension("xml"),
            Classification::builder(name).build(),
            provenance,
        )
    }

    #[test]
    fn no_existing_entry_is_approved() {
        let incoming = entry("XML", Provenance::core());
        let r = resolve(None, &incoming);
        assert_eq!(r.winner.classification.name(), "XML");
        assert!(r.loser.is_none());
        assert!(r.approved);
    }

    #[test]
    fn same_classification_is_not_a_conflict() {
        let existing = entry("XML", Provenance::core());
        let incoming = entry("XML", Provenance::plugin("other"));
        let r = resolve(Some(&existing), &incoming);
        assert!(r.loser.is_none());
        assert!(r.approved);
    }

    #[test]
    fn plugin_beats_bundled_but_unapproved_in_either_order() {
        let bundled = entry("XML", Provenance::core());
        let plugin = entry("FancyXML", Provenance::plugin("fancy"));

        let r = resolve(Some(&bundled), &plugin);
        assert_eq!(r.winner.classification.name(), "FancyXML");
        assert_eq!(r.loser.unwrap().classification.name(), "XML");
        assert!(!r.approved);

        let r = resolve(Some(&plugin), &bundled);
        assert_eq!(r.winner.classification.name(), "FancyXML");
        assert!(!r.approved);
    }

    #[test]
    fn placeholder_defender_always_loses() {
        let placeholder = AssociationEntry::new(
            Matcher::extension("dat"),
            Classification::unknown(),
            Provenance::core(),
        );
        let real = entry("Data", Provenance::core());
        let r = resolve(Some(&placeholder), &real);
        assert_eq!(r.winner.classification.name(), "Data");
        assert!(r.approved);
    }

    #[test]
    fn more_official_bundled_provider_wins() {
        let core = entry("XML", Provenance::core());
        let bundled = entry("VendorXML", Provenance::bundled("vendor"));
        let r = resolve(Some(&bundled), &core);
        assert_eq!(r.winner.classification.name(), "XML");
        assert!(r.approved);
        let r = resolve(Some(&core), &bundled);
        assert_eq!(r.winner.classification.name(), "XML");
    }

    #[test]
    fn equal_rank_keeps_existing() {
        let a = entry("A", Provenance::plugin("a"));
        let b = entry("B", Provenance::plugin("b"));
        let r = resolve(Some(&a), &b);
        assert_eq!(r.winner.classification.name(), "A");
        assert_eq!(r.loser.unwrap().classification.name(), "B");
        assert!(!r.approved);

        let x = entry("X", Provenance::bundled("x"));
        let y = entry("Y", Provenance::bundled("y"));
        assert_eq!(resolve(Some(&x), &y).winner.classification.name(), "X");
    }

    #[test]
    fn resolve_is_deterministic() {
        let a = entry("A", Provenance::bundled("a"));
        let b = entry("B", Provenance::plugin("b"));
        let first = resolve(Some(&a), &b);
        for _ in 0..10 {
            let again = resolve(Some(&a), &b);
            assert_eq!(again.winner, first.winner);
            assert_eq!(again.approved, first.approved);
        }
    }
}
