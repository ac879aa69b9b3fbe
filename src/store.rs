//! Persistent per-file attributes, counters and documents.
//!
//! The LMDB store (via heed) keeps three tables: versioned per-file
//! attributes, named `u64` counters (the detection generation lives here)
//! and named JSON documents (the registry state lives here).

use anyhow::{Context, Result, bail};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const ATTRIBUTES_DB: &str = "attributes";
pub const COUNTERS_DB: &str = "counters";
pub const DOCUMENTS_DB: &str = "documents";

const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 8;

type StrDb = Database<Str, Str>;
type AttrDb = Database<Str, Bytes>;

/// A persisted attribute value tagged with the version it was written for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttribute {
    pub version: u64,
    pub payload: Vec<u8>,
}

impl StoredAttribute {
    pub fn new(version: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            payload: payload.into(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.payload.len());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < 8 {
            bail!("Truncated attribute value ({} bytes)", raw.len());
        }
        let (version, payload) = raw.split_at(8);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(version);
        Ok(Self {
            version: u64::from_le_bytes(buf),
            payload: payload.to_vec(),
        })
    }
}

/// One attribute mutation. `value: None` deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeWrite {
    pub attribute: String,
    pub file_key: String,
    pub value: Option<StoredAttribute>,
}

pub trait AttributeStore: Send + Sync + fmt::Debug {
    fn read(&self, attribute: &str, file_key: &str) -> Result<Option<StoredAttribute>>;

    /// Applies all writes atomically.
    fn write_batch(&self, writes: &[AttributeWrite]) -> Result<()>;

    fn write(&self, attribute: &str, file_key: &str, value: Option<StoredAttribute>) -> Result<()> {
        self.write_batch(&[AttributeWrite {
            attribute: attribute.to_string(),
            file_key: file_key.to_string(),
            value,
        }])
    }

    fn counter(&self, name: &str) -> Result<Option<u64>>;

    fn set_counter(&self, name: &str, value: u64) -> Result<()>;

    fn document(&self, name: &str) -> Result<Option<String>>;

    fn set_document(&self, name: &str, body: &str) -> Result<()>;

    /// Writes buffered in memory and not yet durable.
    fn pending_writes(&self) -> usize {
        0
    }
}

fn attribute_key(attribute: &str, file_key: &str) -> String {
    format!("{attribute}\0{file_key}")
}

#[derive(Debug)]
pub struct LmdbAttributeStore {
    env: Arc<Env>,
    db_path: PathBuf,
    attributes: AttrDb,
    counters: StrDb,
    documents: StrDb,
}

impl LmdbAttributeStore {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store directory: {}", parent.display())
            })?;
        }

        let env = Arc::new(open_env(&db_path)?);

        let mut wtxn = env.write_txn()?;
        let attributes = env.create_database::<Str, Bytes>(&mut wtxn, Some(ATTRIBUTES_DB))?;
        let counters = env.create_database::<Str, Str>(&mut wtxn, Some(COUNTERS_DB))?;
        let documents = env.create_database::<Str, Str>(&mut wtxn, Some(DOCUMENTS_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            db_path,
            attributes,
            counters,
            documents,
        })
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let rtxn = self.env.read_txn()?;
        let mut generation = None;
        if let Some(raw) = self.counters.get(&rtxn, crate::cache::GENERATION_COUNTER)? {
            generation = raw.parse::<u64>().ok();
        }
        Ok(StoreStats {
            db_path: self.db_path.to_string_lossy().to_string(),
            attribute_entries: self.attributes.len(&rtxn)?,
            counters: self.counters.len(&rtxn)?,
            documents: self.documents.len(&rtxn)?,
            detection_generation: generation,
            write_buffer_pending: 0,
        })
    }
}

impl AttributeStore for LmdbAttributeStore {
    fn read(&self, attribute: &str, file_key: &str) -> Result<Option<StoredAttribute>> {
        let rtxn = self.env.read_txn()?;
        let key = attribute_key(attribute, file_key);
        match self.attributes.get(&rtxn, key.as_str())? {
            Some(raw) => Ok(Some(StoredAttribute::decode(raw)?)),
            None => Ok(None),
        }
    }

    fn write_batch(&self, writes: &[AttributeWrite]) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut wtxn = self.env.write_txn()?;
        for w in writes {
            let key = attribute_key(&w.attribute, &w.file_key);
            match &w.value {
                Some(value) => self.attributes.put(&mut wtxn, key.as_str(), &value.encode())?,
                None => {
                    self.attributes.delete(&mut wtxn, key.as_str())?;
                }
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    fn counter(&self, name: &str) -> Result<Option<u64>> {
        let rtxn = self.env.read_txn()?;
        match self.counters.get(&rtxn, name)? {
            Some(raw) => Ok(Some(
                raw.parse::<u64>()
                    .with_context(|| format!("Corrupt counter {name}: {raw:?}"))?,
            )),
            None => Ok(None),
        }
    }

    fn set_counter(&self, name: &str, value: u64) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.counters.put(&mut wtxn, name, &value.to_string())?;
        wtxn.commit()?;
        Ok(())
    }

    fn document(&self, name: &str) -> Result<Option<String>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.documents.get(&rtxn, name)?.map(|v| v.to_string()))
    }

    fn set_document(&self, name: &str, body: &str) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.documents.put(&mut wtxn, name, body)?;
        wtxn.commit()?;
        Ok(())
    }
}

fn open_env(db_path: &PathBuf) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: default LMDB locking stays on. NO_SUB_DIR keeps the store a
    // single file at the --db path.
    unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options
            .open(db_path)
            .with_context(|| format!("Failed to create/open db env: {}", db_path.display()))
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub db_path: String,
    pub attribute_entries: u64,
    pub counters: u64,
    pub documents: u64,
    pub detection_generation: Option<u64>,
    pub write_buffer_pending: u64,
}

/// Store kept entirely in memory. Reads can be made to fail for tests.
#[derive(Debug, Default)]
pub struct MemoryAttributeStore {
    attributes: Mutex<HashMap<String, StoredAttribute>>,
    counters: Mutex<HashMap<String, u64>>,
    documents: Mutex<HashMap<String, String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryAttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.lock().len()
    }
}

impl AttributeStore for MemoryAttributeStore {
    fn read(&self, attribute: &str, file_key: &str) -> Result<Option<StoredAttribute>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("Attribute store unavailable");
        }
        Ok(self
            .attributes
            .lock()
            .get(&attribute_key(attribute, file_key))
            .cloned())
    }

    fn write_batch(&self, writes: &[AttributeWrite]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("Attribute store is read-only");
        }
        let mut attributes = self.attributes.lock();
        for w in writes {
            let key = attribute_key(&w.attribute, &w.file_key);
            match &w.value {
                Some(value) => {
                    attributes.insert(key, value.clone());
                }
                None => {
                    attributes.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn counter(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.counters.lock().get(name).copied())
    }

    fn set_counter(&self, name: &str, value: u64) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("Attribute store is read-only");
        }
        self.counters.lock().insert(name.to_string(), value);
        Ok(())
    }

    fn document(&self, name: &str) -> Result<Option<String>> {
        Ok(self.documents.lock().get(name).cloned())
    }

    fn set_document(&self, name: &str, body: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("Attribute store is read-only");
        }
        self.documents
            .lock()
            .insert(name.to_string(), body.to_string());
        Ok(())
    }
}
