//! Per-file detection results, packed into atomic words and mirrored to the
//! attribute store.
//!
//! Each file id owns one `AtomicU32` slot: the low four bits are
//! [`DetectionFlags`], the rest is a tag of the generation the flags were
//! computed for. Bumping the generation makes every slot stale at once, so
//! invalidation never touches per-file state. Named results (anything other
//! than plain text or unknown) live in a side map keyed by file id.
//!
//! Slots live in fixed-size pages allocated on first touch; only page
//! allocation takes the write lock.
//!
//! With a file system attached, persisted results carry the file's length and
//! modification time. A result whose stamp no longer matches the file on disk
//! loads as `Unclassified`, which catches edits made while nothing was
//! watching.

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::classification::Classification;
use crate::fs::{FileId, FileRef, FileStamp, FileSystem};
use crate::registry::Registry;
use crate::store::{AttributeStore, StoredAttribute};

pub const GENERATION_COUNTER: &str = "detection.generation";
pub const DETECTION_ATTRIBUTE: &str = "file-kind.detection";

const PAGE_SIZE: usize = 1024;
const FLAG_BITS: u32 = 4;
const FLAG_MASK: u32 = (1 << FLAG_BITS) - 1;
const TAG_SPACE: u64 = (1 << (32 - FLAG_BITS)) - 1;
const PAYLOAD_STAMPED: u8 = 1 << 7;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DetectionFlags: u32 {
        const ATTRS_LOADED = 1 << 0;
        const DETECT_RAN = 1 << 1;
        const AS_TEXT = 1 << 2;
        const AS_BINARY = 1 << 3;
    }
}

/// What the cache knows about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedDetection {
    /// Persisted state not loaded yet. Only [`DetectionCache::peek`] returns
    /// this.
    Unknown,
    /// Loaded, but content detection has not produced a result.
    Unclassified,
    PlainText,
    Binary,
    Named(Classification),
}

impl CachedDetection {
    pub fn classification(&self) -> Option<Classification> {
        match self {
            CachedDetection::Unknown | CachedDetection::Unclassified => None,
            CachedDetection::PlainText => Some(Classification::plain_text()),
            CachedDetection::Binary => Some(Classification::unknown()),
            CachedDetection::Named(c) => Some(c.clone()),
        }
    }

    pub fn was_detected(&self) -> bool {
        matches!(
            self,
            CachedDetection::PlainText | CachedDetection::Binary | CachedDetection::Named(_)
        )
    }
}

type Page = Arc<[AtomicU32]>;

#[derive(Debug)]
pub struct DetectionCache {
    store: Arc<dyn AttributeStore>,
    registry: Arc<Registry>,
    fs: Option<Arc<dyn FileSystem>>,
    generation: AtomicU64,
    pages: RwLock<Vec<Option<Page>>>,
    named: RwLock<HashMap<FileId, (u32, Classification)>>,
}

impl DetectionCache {
    pub fn new(store: Arc<dyn AttributeStore>, registry: Arc<Registry>) -> Self {
        let generation = match store.counter(GENERATION_COUNTER) {
            Ok(Some(g)) => g.max(1),
            Ok(None) => 1,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to load detection generation, starting at 1");
                1
            }
        };
        tracing::debug!(generation, "Detection cache ready");
        Self {
            store,
            registry,
            fs: None,
            generation: AtomicU64::new(generation),
            pages: RwLock::new(Vec::new()),
            named: RwLock::new(HashMap::new()),
        }
    }

    /// Stamps persisted results with the file's length and mtime, and rejects
    /// persisted results whose stamp is out of date.
    pub fn with_file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn read_cached(&self, file: &FileRef) -> CachedDetection {
        self.read_cached_at(file, self.generation())
    }

    /// Reads the state for `generation`, loading persisted flags on first
    /// touch. A store failure yields `Unclassified` and leaves the slot
    /// unloaded so the next call retries.
    pub fn read_cached_at(&self, file: &FileRef, generation: u64) -> CachedDetection {
        let tag = tag_of(generation);
        let page = self.page(file.id());
        let slot = &page[slot_index(file.id())];

        let word = slot.load(Ordering::Acquire);
        if let Some(flags) = loaded_flags(word, tag) {
            return self.decode(file.id(), flags, tag);
        }

        let stored = match self.store.read(DETECTION_ATTRIBUTE, &file.storage_key()) {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(file = %file.path().display(), error = %err, "Failed to read detection attribute");
                return CachedDetection::Unclassified;
            }
        };

        let mut flags = DetectionFlags::ATTRS_LOADED;
        if let Some(attr) = stored.filter(|a| a.version == generation)
            && let Some((persisted, stamp, name)) = decode_payload(&attr.payload)
            && self.stamp_matches(file, stamp)
        {
            match name {
                Some(name) => {
                    if let Some(c) = self.registry.find_classification(name) {
                        self.named.write().insert(file.id(), (tag, c));
                        flags |= DetectionFlags::DETECT_RAN;
                    }
                }
                None => flags |= persisted,
            }
        }

        let new_word = pack(tag, flags);
        if let Err(current) = slot.compare_exchange(word, new_word, Ordering::AcqRel, Ordering::Acquire)
            && let Some(current_flags) = loaded_flags(current, tag)
        {
            // A concurrent writer got there first; its answer is newer.
            return self.decode(file.id(), current_flags, tag);
        }
        self.decode(file.id(), flags, tag)
    }

    /// The in-memory state only. Never touches the store.
    pub fn peek(&self, file: &FileRef) -> CachedDetection {
        let tag = tag_of(self.generation());
        let Some(page) = self.existing_page(file.id()) else {
            return CachedDetection::Unknown;
        };
        let word = page[slot_index(file.id())].load(Ordering::Acquire);
        match loaded_flags(word, tag) {
            Some(flags) => self.decode(file.id(), flags, tag),
            None => CachedDetection::Unknown,
        }
    }

    pub fn write(&self, file: &FileRef, classification: Option<&Classification>) {
        self.write_at(file, self.generation(), classification);
    }

    /// Records a detection result. `None` clears the entry.
    pub fn write_at(&self, file: &FileRef, generation: u64, classification: Option<&Classification>) {
        let tag = tag_of(generation);
        let mut flags = DetectionFlags::ATTRS_LOADED;
        let mut name = None;
        match classification {
            None => {
                self.named.write().remove(&file.id());
            }
            Some(c) if c.is_plain_text() => {
                flags |= DetectionFlags::DETECT_RAN | DetectionFlags::AS_TEXT;
                self.named.write().remove(&file.id());
            }
            Some(c) if c.is_unknown() => {
                flags |= DetectionFlags::DETECT_RAN | DetectionFlags::AS_BINARY;
                self.named.write().remove(&file.id());
            }
            Some(c) => {
                flags |= DetectionFlags::DETECT_RAN;
                self.named.write().insert(file.id(), (tag, c.clone()));
                name = Some(c.name());
            }
        }
        self.page(file.id())[slot_index(file.id())].store(pack(tag, flags), Ordering::Release);

        let value = classification
            .map(|_| StoredAttribute::new(generation, encode_payload(flags, self.current_stamp(file), name)));
        if let Err(err) = self.store.write(DETECTION_ATTRIBUTE, &file.storage_key(), value) {
            tracing::warn!(file = %file.path().display(), error = %err, "Failed to persist detection result");
        }
    }

    /// Makes every cached result stale in O(1) and persists the new
    /// generation.
    pub fn invalidate_all(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Err(err) = self.store.set_counter(GENERATION_COUNTER, generation) {
            tracing::warn!(generation, error = %err, "Failed to persist detection generation");
        }
        tracing::debug!(generation, "Invalidated all cached detections");
        generation
    }

    /// Drops everything known about `file` (deleted or renamed away).
    pub fn forget(&self, file: &FileRef) {
        self.write_at(file, self.generation(), None);
    }

    /// Number of slots currently holding loaded state for this generation.
    pub fn loaded_len(&self) -> usize {
        let tag = tag_of(self.generation());
        self.pages
            .read()
            .iter()
            .flatten()
            .flat_map(|page| page.iter())
            .filter(|slot| loaded_flags(slot.load(Ordering::Relaxed), tag).is_some())
            .count()
    }

    pub fn store(&self) -> &Arc<dyn AttributeStore> {
        &self.store
    }

    pub fn flush_counters(&self) -> Result<()> {
        self.store.set_counter(GENERATION_COUNTER, self.generation())
    }

    fn current_stamp(&self, file: &FileRef) -> Option<FileStamp> {
        let fs = self.fs.as_ref()?;
        match fs.stat(file.path()) {
            Ok(stat) => stat.stamp(),
            Err(err) => {
                tracing::debug!(file = %file.path().display(), error = %err, "Failed to stat file for stamp");
                None
            }
        }
    }

    fn stamp_matches(&self, file: &FileRef, persisted: Option<FileStamp>) -> bool {
        if self.fs.is_none() {
            return true;
        }
        let matches = persisted.is_some() && persisted == self.current_stamp(file);
        if !matches {
            tracing::debug!(file = %file.path().display(), "Persisted detection is out of date");
        }
        matches
    }

    fn decode(&self, id: FileId, flags: DetectionFlags, tag: u32) -> CachedDetection {
        if !flags.contains(DetectionFlags::DETECT_RAN) {
            return CachedDetection::Unclassified;
        }
        if flags.contains(DetectionFlags::AS_TEXT) {
            return CachedDetection::PlainText;
        }
        if flags.contains(DetectionFlags::AS_BINARY) {
            return CachedDetection::Binary;
        }
        match self.named.read().get(&id) {
            Some((named_tag, c)) if *named_tag == tag => CachedDetection::Named(c.clone()),
            _ => CachedDetection::Unclassified,
        }
    }

    fn existing_page(&self, id: FileId) -> Option<Page> {
        let pages = self.pages.read();
        pages.get(page_index(id)).and_then(|p| p.clone())
    }

    fn page(&self, id: FileId) -> Page {
        if let Some(page) = self.existing_page(id) {
            return page;
        }
        let idx = page_index(id);
        let mut pages = self.pages.write();
        if pages.len() <= idx {
            pages.resize(idx + 1, None);
        }
        pages[idx]
            .get_or_insert_with(|| (0..PAGE_SIZE).map(|_| AtomicU32::new(0)).collect())
            .clone()
    }
}

fn page_index(id: FileId) -> usize {
    id.0 as usize / PAGE_SIZE
}

fn slot_index(id: FileId) -> usize {
    id.0 as usize % PAGE_SIZE
}

/// Maps a generation to a non-zero tag, so a zeroed slot never looks loaded.
fn tag_of(generation: u64) -> u32 {
    (generation.saturating_sub(1) % TAG_SPACE + 1) as u32
}

fn pack(tag: u32, flags: DetectionFlags) -> u32 {
    (tag << FLAG_BITS) | (flags.bits() & FLAG_MASK)
}

fn loaded_flags(word: u32, tag: u32) -> Option<DetectionFlags> {
    if word >> FLAG_BITS != tag {
        return None;
    }
    let flags = DetectionFlags::from_bits_truncate(word & FLAG_MASK);
    flags.contains(DetectionFlags::ATTRS_LOADED).then_some(flags)
}

/// Payload layout: one flags byte, then a 16-byte stamp when the high bit of
/// the flags byte is set, then the classification name (may be empty).
fn encode_payload(flags: DetectionFlags, stamp: Option<FileStamp>, name: Option<&str>) -> Vec<u8> {
    let persisted = flags & (DetectionFlags::DETECT_RAN | DetectionFlags::AS_TEXT | DetectionFlags::AS_BINARY);
    let mut head = persisted.bits() as u8;
    if stamp.is_some() {
        head |= PAYLOAD_STAMPED;
    }
    let mut out = vec![head];
    if let Some(stamp) = stamp {
        out.extend_from_slice(&stamp.encode());
    }
    if let Some(name) = name {
        out.extend_from_slice(name.as_bytes());
    }
    out
}

fn decode_payload(payload: &[u8]) -> Option<(DetectionFlags, Option<FileStamp>, Option<&str>)> {
    let (&first, mut rest) = payload.split_first()?;
    let flags = DetectionFlags::from_bits_truncate((first & !PAYLOAD_STAMPED) as u32);
    if !flags.contains(DetectionFlags::DETECT_RAN) {
        return None;
    }
    let mut stamp = None;
    if first & PAYLOAD_STAMPED != 0 {
        stamp = Some(FileStamp::decode(rest)?);
        rest = &rest[FileStamp::ENCODED_LEN..];
    }
    if rest.is_empty() {
        return Some((flags, stamp, None));
    }
    std::str::from_utf8(rest).ok().map(|name| (flags, stamp, Some(name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::CapabilityFlags;
    use crate::fs::MemoryFileSystem;
    use crate::matcher::Matcher;
    use crate::resolver::Provenance;
    use crate::store::MemoryAttributeStore;

    fn file(id: u32) -> FileRef {
        FileRef::new(FileId(id), format!("/work/f{id}"))
    }

    fn setup() -> (Arc<MemoryAttributeStore>, Arc<Registry>, DetectionCache) {
        let store = Arc::new(MemoryAttributeStore::new());
        let registry = Arc::new(Registry::new());
        registry
            .register(
                Classification::builder("XML").flags(CapabilityFlags::TEXT).build(),
                Provenance::core(),
                vec![Matcher::extension("xml")],
            )
            .unwrap();
        let cache = DetectionCache::new(store.clone(), registry.clone());
        (store, registry, cache)
    }

    #[test]
    fn write_sets_flag_combinations() {
        let (_, registry, cache) = setup();
        let xml = registry.find_classification("XML").unwrap();

        cache.write(&file(1), Some(&Classification::plain_text()));
        cache.write(&file(2), Some(&Classification::unknown()));
        cache.write(&file(3), Some(&xml));
        cache.write(&file(4), None);

        assert_eq!(cache.read_cached(&file(1)), CachedDetection::PlainText);
        assert_eq!(cache.read_cached(&file(2)), CachedDetection::Binary);
        assert_eq!(cache.read_cached(&file(3)), CachedDetection::Named(xml));
        assert_eq!(cache.read_cached(&file(4)), CachedDetection::Unclassified);
    }

    #[test]
    fn peek_never_loads() {
        let (store, _, cache) = setup();
        store
            .write(
                DETECTION_ATTRIBUTE,
                &file(9).storage_key(),
                Some(StoredAttribute::new(1, encode_payload(DetectionFlags::DETECT_RAN | DetectionFlags::AS_TEXT, None, None))),
            )
            .unwrap();
        assert_eq!(cache.peek(&file(9)), CachedDetection::Unknown);
        assert_eq!(cache.read_cached(&file(9)), CachedDetection::PlainText);
        assert_eq!(cache.peek(&file(9)), CachedDetection::PlainText);
    }

    #[test]
    fn invalidate_all_makes_everything_stale_and_persists_generation() {
        let (store, _, cache) = setup();
        for id in 0..3000 {
            cache.write(&file(id), Some(&Classification::plain_text()));
        }
        assert_eq!(cache.loaded_len(), 3000);

        let generation = cache.invalidate_all();
        assert_eq!(generation, 2);
        assert_eq!(store.counter(GENERATION_COUNTER).unwrap(), Some(2));
        assert_eq!(cache.loaded_len(), 0);
        assert_eq!(cache.peek(&file(5)), CachedDetection::Unknown);
        assert_eq!(cache.read_cached(&file(5)), CachedDetection::Unclassified);
    }

    #[test]
    fn results_survive_restart_with_same_generation() {
        let (store, registry, cache) = setup();
        let xml = registry.find_classification("XML").unwrap();
        cache.invalidate_all();
        cache.write(&file(1), Some(&xml));
        cache.write(&file(2), Some(&Classification::unknown()));
        drop(cache);

        let reopened = DetectionCache::new(store.clone(), registry);
        assert_eq!(reopened.generation(), 2);
        assert_eq!(reopened.read_cached(&file(1)), CachedDetection::Named(xml));
        assert_eq!(reopened.read_cached(&file(2)), CachedDetection::Binary);
    }

    #[test]
    fn store_failure_degrades_without_marking_loaded() {
        let (store, _, cache) = setup();
        store
            .write(
                DETECTION_ATTRIBUTE,
                &file(1).storage_key(),
                Some(StoredAttribute::new(1, encode_payload(DetectionFlags::DETECT_RAN | DetectionFlags::AS_BINARY, None, None))),
            )
            .unwrap();
        store.set_fail_reads(true);
        assert_eq!(cache.read_cached(&file(1)), CachedDetection::Unclassified);
        assert_eq!(cache.peek(&file(1)), CachedDetection::Unknown);

        store.set_fail_reads(false);
        assert_eq!(cache.read_cached(&file(1)), CachedDetection::Binary);
    }

    #[test]
    fn forget_clears_state() {
        let (store, _, cache) = setup();
        cache.write(&file(1), Some(&Classification::plain_text()));
        assert_eq!(store.attribute_count(), 1);
        cache.forget(&file(1));
        assert_eq!(cache.read_cached(&file(1)), CachedDetection::Unclassified);
        assert_eq!(store.attribute_count(), 0);
    }

    #[test]
    fn unknown_persisted_name_reads_as_unclassified() {
        let (store, _, cache) = setup();
        store
            .write(
                DETECTION_ATTRIBUTE,
                &file(1).storage_key(),
                Some(StoredAttribute::new(1, encode_payload(DetectionFlags::DETECT_RAN, None, Some("Gone")))),
            )
            .unwrap();
        assert_eq!(cache.read_cached(&file(1)), CachedDetection::Unclassified);
    }

    #[test]
    fn edited_file_invalidates_persisted_result() {
        let (store, registry, _) = setup();
        let fs = Arc::new(MemoryFileSystem::new());
        let xml = registry.find_classification("XML").unwrap();
        fs.add_file("/work/f1", b"<?xml?>".to_vec());
        fs.add_file("/work/f2", b"text".to_vec());

        let cache = DetectionCache::new(store.clone(), registry.clone()).with_file_system(fs.clone());
        cache.write(&file(1), Some(&xml));
        cache.write(&file(2), Some(&Classification::plain_text()));
        drop(cache);

        std::thread::sleep(std::time::Duration::from_millis(2));
        fs.add_file("/work/f2", b"\x00\x01\x02\x03".to_vec());

        let reopened = DetectionCache::new(store, registry).with_file_system(fs);
        assert_eq!(reopened.read_cached(&file(1)), CachedDetection::Named(xml));
        assert_eq!(reopened.read_cached(&file(2)), CachedDetection::Unclassified);
    }

    #[test]
    fn unstamped_result_is_rejected_when_stamps_are_checked() {
        let (store, registry, _) = setup();
        let fs = Arc::new(MemoryFileSystem::new());
        fs.add_file("/work/f1", b"text".to_vec());
        store
            .write(
                DETECTION_ATTRIBUTE,
                &file(1).storage_key(),
                Some(StoredAttribute::new(1, encode_payload(DetectionFlags::DETECT_RAN | DetectionFlags::AS_TEXT, None, None))),
            )
            .unwrap();
        let cache = DetectionCache::new(store, registry).with_file_system(fs);
        assert_eq!(cache.read_cached(&file(1)), CachedDetection::Unclassified);
    }

    #[test]
    fn stamped_payload_keeps_name() {
        let stamp = FileStamp { len: 7, modified_nanos: 42 };
        let payload = encode_payload(DetectionFlags::DETECT_RAN, Some(stamp), Some("XML"));
        assert_eq!(
            decode_payload(&payload),
            Some((DetectionFlags::DETECT_RAN, Some(stamp), Some("XML")))
        );
        assert_eq!(decode_payload(&payload[..5]), None);
    }

    #[test]
    fn tags_skip_zero() {
        assert_eq!(tag_of(1), 1);
        assert_ne!(tag_of(TAG_SPACE + 1), 0);
        assert_eq!(tag_of(TAG_SPACE + 1), 1);
    }
}
