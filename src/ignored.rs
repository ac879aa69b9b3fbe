//! Ignored-file masks with a per-file short-circuit cache.
//!
//! Masks use gitignore syntax (`*.pyc`, `.git`, `!keep.pyc`). Plain names
//! are answered from a hash set; only wildcard masks reach the compiled
//! matcher. Answers are cached per file id until the masks change; the cache
//! is dropped wholesale once it holds [`MAX_CACHED_ANSWERS`] entries.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::fs::{FileId, FileRef};

pub const DEFAULT_IGNORE_MASKS: &str =
    "*.pyc;*.pyo;*.rbc;*.yarb;*~;.DS_Store;.git;.hg;.svn;CVS;__pycache__;_svn;vssver.scc;vssver2.scc;";

pub const MAX_CACHED_ANSWERS: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct IgnoreMasks {
    masks: Vec<String>,
    exact: HashSet<String>,
    globs: Option<Gitignore>,
}

impl IgnoreMasks {
    /// Parses a `;`-separated mask list. Empty entries are skipped.
    pub fn parse(raw: &str) -> Self {
        Self::from_masks(raw.split(';').map(str::trim).filter(|m| !m.is_empty()))
    }

    pub fn from_masks<'a>(masks: impl IntoIterator<Item = &'a str>) -> Self {
        let mut out = Self::default();
        let mut builder = GitignoreBuilder::new(".");
        let mut has_globs = false;
        for mask in masks {
            if out.masks.iter().any(|m| m == mask) {
                continue;
            }
            out.masks.push(mask.to_string());
            if mask.contains(['*', '?', '[', '!', '/']) {
                match builder.add_line(None, mask) {
                    Ok(_) => has_globs = true,
                    Err(err) => tracing::warn!(%mask, error = %err, "Skipping invalid ignore mask"),
                }
            } else {
                out.exact.insert(mask.to_string());
            }
        }
        if has_globs {
            out.globs = match builder.build() {
                Ok(gi) => Some(gi),
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to compile ignore masks");
                    None
                }
            };
        }
        out
    }

    pub fn matches(&self, file_name: &str, is_dir: bool) -> bool {
        if self.exact.contains(file_name) {
            return true;
        }
        match &self.globs {
            Some(gi) => gi.matched(Path::new(file_name), is_dir).is_ignore(),
            None => false,
        }
    }

    pub fn masks(&self) -> &[String] {
        &self.masks
    }

    /// The masks joined back into their `;`-separated form.
    pub fn as_list(&self) -> String {
        let mut out = String::new();
        for mask in &self.masks {
            out.push_str(mask);
            out.push(';');
        }
        out
    }
}

#[derive(Debug)]
pub struct IgnoredFiles {
    masks: RwLock<IgnoreMasks>,
    cache: RwLock<HashMap<FileId, bool>>,
}

impl Default for IgnoredFiles {
    fn default() -> Self {
        Self::new(IgnoreMasks::parse(DEFAULT_IGNORE_MASKS))
    }
}

impl IgnoredFiles {
    pub fn new(masks: IgnoreMasks) -> Self {
        Self {
            masks: RwLock::new(masks),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_ignored_name(&self, file_name: &str) -> bool {
        self.masks.read().matches(file_name, false)
    }

    /// Answers from the per-file cache when possible.
    pub fn is_ignored(&self, file: &FileRef) -> bool {
        if let Some(hit) = self.cache.read().get(&file.id()) {
            return *hit;
        }
        let masks = self.masks.read();
        let ignored = masks.matches(&file.name(), false);
        // Held across the insert so a concurrent mask change cannot slip a
        // stale answer in behind its cache clear.
        let mut cache = self.cache.write();
        if cache.len() >= MAX_CACHED_ANSWERS {
            cache.clear();
        }
        cache.insert(file.id(), ignored);
        drop(cache);
        drop(masks);
        ignored
    }

    pub fn set_masks(&self, masks: IgnoreMasks) {
        let mut current = self.masks.write();
        *current = masks;
        self.cache.write().clear();
    }

    pub fn set_mask_list(&self, raw: &str) {
        self.set_masks(IgnoreMasks::parse(raw));
    }

    pub fn masks(&self) -> IgnoreMasks {
        self.masks.read().clone()
    }

    /// Drops the cached answer for one file (renamed or deleted).
    pub fn forget(&self, id: FileId) {
        self.cache.write().remove(&id);
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file(id: u32, path: &str) -> FileRef {
        FileRef::new(FileId(id), PathBuf::from(path))
    }

    #[test]
    fn default_masks_cover_vcs_and_bytecode() {
        let ignored = IgnoredFiles::default();
        assert!(ignored.is_ignored_name(".git"));
        assert!(ignored.is_ignored_name("mod.pyc"));
        assert!(ignored.is_ignored_name("notes.txt~"));
        assert!(!ignored.is_ignored_name("main.rs"));
    }

    #[test]
    fn negation_masks_apply() {
        let masks = IgnoreMasks::parse("*.log;!keep.log");
        assert!(masks.matches("a.log", false));
        assert!(!masks.matches("keep.log", false));
    }

    #[test]
    fn per_file_cache_is_cleared_on_mask_change() {
        let ignored = IgnoredFiles::new(IgnoreMasks::parse("*.tmp"));
        let f = file(7, "/work/a.tmp");
        assert!(ignored.is_ignored(&f));
        assert_eq!(ignored.cached_len(), 1);

        ignored.set_mask_list("*.bak");
        assert_eq!(ignored.cached_len(), 0);
        assert!(!ignored.is_ignored(&f));
    }

    #[test]
    fn per_file_cache_stays_bounded() {
        let ignored = IgnoredFiles::new(IgnoreMasks::parse("*.tmp"));
        for id in 0..MAX_CACHED_ANSWERS as u32 + 10 {
            ignored.is_ignored(&file(id, "/work/a.tmp"));
        }
        assert!(ignored.cached_len() <= MAX_CACHED_ANSWERS);
        assert_eq!(ignored.cached_len(), 10);
        assert!(ignored.is_ignored(&file(0, "/work/a.tmp")));
    }

    #[test]
    fn as_list_round_trips() {
        let masks = IgnoreMasks::parse("a;b;;*.c;a");
        assert_eq!(masks.masks(), &["a", "b", "*.c"]);
        assert_eq!(IgnoreMasks::parse(&masks.as_list()).masks(), masks.masks());
    }
}
