//! File identity and the file system seam used by content detection.
//!
//! Production code uses [`LocalFileSystem`]; tests and embedders without a
//! real disk use [`MemoryFileSystem`], which can also inject read failures
//! and delays.

use anyhow::{Context, Result, bail};
use parking_lot::{Mutex, RwLock};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A file as seen by the engine: a stable id plus its current path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileRef {
    id: FileId,
    path: Arc<Path>,
}

impl FileRef {
    pub fn new(id: FileId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: Arc::from(path.into()),
        }
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> Cow<'_, str> {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or(Cow::Borrowed(""))
    }

    /// Key used for persistent per-file attributes.
    pub fn storage_key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Sockets, pipes, devices.
    Special,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub kind: EntryKind,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl FileStat {
    pub fn missing() -> Self {
        Self::of_kind(EntryKind::Missing)
    }

    fn of_kind(kind: EntryKind) -> Self {
        Self {
            kind,
            len: 0,
            modified: None,
        }
    }

    /// Length and modification time of a regular file, used to tell whether
    /// a persisted result still describes the content on disk.
    pub fn stamp(&self) -> Option<FileStamp> {
        if self.kind != EntryKind::File {
            return None;
        }
        let nanos = self
            .modified?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Some(FileStamp {
            len: self.len,
            modified_nanos: u64::try_from(nanos).unwrap_or(u64::MAX),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileStamp {
    pub len: u64,
    pub modified_nanos: u64,
}

impl FileStamp {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.len.to_le_bytes());
        out[8..].copy_from_slice(&self.modified_nanos.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        let len = u64::from_le_bytes(raw.get(..8)?.try_into().ok()?);
        let modified_nanos = u64::from_le_bytes(raw.get(8..Self::ENCODED_LEN)?.try_into().ok()?);
        Some(Self { len, modified_nanos })
    }
}

pub trait FileSystem: Send + Sync + fmt::Debug {
    /// A missing entry is reported as [`EntryKind::Missing`], not an error.
    fn stat(&self, path: &Path) -> Result<FileStat>;

    /// Reads at most `max_len` bytes from the start of the file.
    fn read_prefix(&self, path: &Path, max_len: usize) -> Result<Vec<u8>>;
}

/// Hands out stable ids for paths within one process.
#[derive(Debug)]
pub struct FileIds {
    next: AtomicU32,
    by_path: RwLock<HashMap<PathBuf, FileId>>,
}

impl Default for FileIds {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(1),
            by_path: RwLock::new(HashMap::new()),
        }
    }
}

impl FileIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_ref(&self, path: impl AsRef<Path>) -> FileRef {
        let path = path.as_ref();
        if let Some(id) = self.by_path.read().get(path) {
            return FileRef::new(*id, path);
        }
        let mut by_path = self.by_path.write();
        let id = *by_path
            .entry(path.to_path_buf())
            .or_insert_with(|| FileId(self.next.fetch_add(1, Ordering::Relaxed)));
        FileRef::new(id, path)
    }

    /// Moves `file`'s id to `to`, keeping its identity across a rename.
    pub fn rename(&self, file: &FileRef, to: impl AsRef<Path>) -> FileRef {
        let to = to.as_ref();
        let mut by_path = self.by_path.write();
        by_path.remove(file.path());
        by_path.insert(to.to_path_buf(), file.id());
        FileRef::new(file.id(), to)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn stat(&self, path: &Path) -> Result<FileStat> {
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(FileStat::missing()),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to stat: {}", path.display()));
            }
        };
        let kind = if meta.is_file() {
            EntryKind::File
        } else if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::Special
        };
        Ok(FileStat {
            kind,
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    fn read_prefix(&self, path: &Path, max_len: usize) -> Result<Vec<u8>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open: {}", path.display()))?;
        let mut buf = Vec::with_capacity(max_len.min(64 * 1024));
        file.take(max_len as u64)
            .read_to_end(&mut buf)
            .with_context(|| format!("Failed to read: {}", path.display()))?;
        Ok(buf)
    }
}

#[derive(Debug, Clone)]
enum MemoryEntry {
    File { content: Vec<u8>, modified: SystemTime },
    Directory,
    Special,
}

/// In-memory file system with failure injection and read accounting.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    entries: RwLock<HashMap<PathBuf, MemoryEntry>>,
    failing: RwLock<HashMap<PathBuf, String>>,
    reads: Mutex<HashMap<PathBuf, usize>>,
    stats: Mutex<HashMap<PathBuf, usize>>,
    read_delay: RwLock<Option<Duration>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or overwrites a file, stamping it with the current time.
    pub fn add_file(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        self.entries.write().insert(
            path.into(),
            MemoryEntry::File {
                content: content.into(),
                modified: SystemTime::now(),
            },
        );
    }

    pub fn add_dir(&self, path: impl Into<PathBuf>) {
        self.entries.write().insert(path.into(), MemoryEntry::Directory);
    }

    pub fn add_special(&self, path: impl Into<PathBuf>) {
        self.entries.write().insert(path.into(), MemoryEntry::Special);
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        self.entries.write().remove(path.as_ref());
    }

    /// Makes every read of `path` fail with `reason` until cleared.
    pub fn fail_reads(&self, path: impl Into<PathBuf>, reason: impl Into<String>) {
        self.failing.write().insert(path.into(), reason.into());
    }

    pub fn clear_failure(&self, path: impl AsRef<Path>) {
        self.failing.write().remove(path.as_ref());
    }

    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.write() = delay;
    }

    pub fn read_count(&self, path: impl AsRef<Path>) -> usize {
        self.reads.lock().get(path.as_ref()).copied().unwrap_or(0)
    }

    pub fn stat_count(&self, path: impl AsRef<Path>) -> usize {
        self.stats.lock().get(path.as_ref()).copied().unwrap_or(0)
    }
}

impl FileSystem for MemoryFileSystem {
    fn stat(&self, path: &Path) -> Result<FileStat> {
        *self.stats.lock().entry(path.to_path_buf()).or_default() += 1;
        Ok(match self.entries.read().get(path) {
            Some(MemoryEntry::File { content, modified }) => FileStat {
                kind: EntryKind::File,
                len: content.len() as u64,
                modified: Some(*modified),
            },
            Some(MemoryEntry::Directory) => FileStat::of_kind(EntryKind::Directory),
            Some(MemoryEntry::Special) => FileStat::of_kind(EntryKind::Special),
            None => FileStat::missing(),
        })
    }

    fn read_prefix(&self, path: &Path, max_len: usize) -> Result<Vec<u8>> {
        *self.reads.lock().entry(path.to_path_buf()).or_default() += 1;
        let delay = *self.read_delay.read();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(reason) = self.failing.read().get(path) {
            bail!("Failed to read {}: {reason}", path.display());
        }
        match self.entries.read().get(path) {
            Some(MemoryEntry::File { content, .. }) => Ok(content[..content.len().min(max_len)].to_vec()),
            Some(_) => bail!("Not a regular file: {}", path.display()),
            None => bail!("No such file: {}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ids_are_stable_and_survive_rename() {
        let ids = FileIds::new();
        let a = ids.file_ref("/p/a.txt");
        let again = ids.file_ref("/p/a.txt");
        let b = ids.file_ref("/p/b.txt");
        assert_eq!(a.id(), again.id());
        assert_ne!(a.id(), b.id());

        let renamed = ids.rename(&a, "/p/c.txt");
        assert_eq!(renamed.id(), a.id());
        assert_eq!(ids.file_ref("/p/c.txt").id(), a.id());
        assert_eq!(renamed.name(), "c.txt");
    }

    #[test]
    fn memory_fs_stat_and_prefix() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/a", b"hello world".to_vec());
        fs.add_dir("/d");
        assert_eq!(fs.stat(Path::new("/a")).unwrap().len, 11);
        assert_eq!(fs.stat(Path::new("/d")).unwrap().kind, EntryKind::Directory);
        assert_eq!(fs.stat(Path::new("/x")).unwrap().kind, EntryKind::Missing);
        assert_eq!(fs.read_prefix(Path::new("/a"), 5).unwrap(), b"hello");
        assert_eq!(fs.read_count("/a"), 1);

        fs.fail_reads("/a", "locked");
        assert!(fs.read_prefix(Path::new("/a"), 5).is_err());
        fs.clear_failure("/a");
        assert!(fs.read_prefix(Path::new("/a"), 5).is_ok());
    }

    #[test]
    fn local_fs_reads_bounded_prefix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("big.txt");
        std::fs::write(&path, vec![b'a'; 10_000])?;
        let fs = LocalFileSystem;
        assert_eq!(fs.stat(&path)?.kind, EntryKind::File);
        assert_eq!(fs.read_prefix(&path, 100)?.len(), 100);
        assert_eq!(fs.stat(&dir.path().join("missing"))?.kind, EntryKind::Missing);
        assert_eq!(fs.stat(dir.path())?.kind, EntryKind::Directory);
        assert!(fs.stat(dir.path())?.stamp().is_none());
        assert_eq!(fs.stat(&path)?.stamp().map(|s| s.len), Some(10_000));
        Ok(())
    }

    #[test]
    fn stamp_tracks_overwrites() {
        let fs = MemoryFileSystem::new();
        fs.add_file("/a", b"one".to_vec());
        let first = fs.stat(Path::new("/a")).unwrap().stamp().unwrap();
        assert_eq!(FileStamp::decode(&first.encode()), Some(first));
        std::thread::sleep(Duration::from_millis(2));
        fs.add_file("/a", b"two".to_vec());
        let second = fs.stat(Path::new("/a")).unwrap().stamp().unwrap();
        assert_eq!(first.len, second.len);
        assert_ne!(first, second);
        assert!(FileStamp::decode(&[0u8; 4]).is_none());
    }
}
