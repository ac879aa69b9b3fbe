//! The facade wiring registry, cache, pipeline and re-detection queue.
//!
//! A query asks the registry first. When the name is inconclusive the
//! detection cache answers, and on a miss the content pipeline runs inline
//! and caches its result. File events feed the re-detection queue.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crate::buffer::BufferedAttributeStore;
use crate::builtin::XmlPrologDetector;
use crate::cache::DetectionCache;
use crate::cancel::{Cancellation, Cancelled};
use crate::classification::Classification;
use crate::config::EngineConfig;
use crate::detector::DetectorChain;
use crate::fs::{FileIds, FileRef, FileSystem, LocalFileSystem};
use crate::redetect::{ReDetectionQueue, ReparseSink};
use crate::registry::{PersistedState, Registry, RegistryListener};
use crate::store::{AttributeStore, MemoryAttributeStore};

pub const REGISTRY_STATE_DOCUMENT: &str = "registry.state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifySource {
    Name,
    Cache,
    Content,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyOutcome {
    pub classification: Classification,
    pub source: ClassifySource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    ContentChanged(FileRef),
    Created(FileRef),
    Renamed { from: FileRef, to: PathBuf },
    Deleted(FileRef),
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub generation: u64,
    pub loaded_slots: usize,
    pub classifications: usize,
    pub pending_providers: usize,
    pub redetect_pending: usize,
    pub pending_writes: usize,
}

/// Bumps the detection generation whenever registrations change, so results
/// computed under the old associations are re-evaluated.
struct InvalidateOnChange {
    cache: Weak<DetectionCache>,
}

impl RegistryListener for InvalidateOnChange {
    fn changed(&self, _added: Option<&Classification>, _removed: Option<&Classification>) {
        if let Some(cache) = self.cache.upgrade() {
            cache.invalidate_all();
        }
    }
}

struct LogSink;

impl ReparseSink for LogSink {
    fn reparse_required(&self, files: &[FileRef]) {
        for file in files {
            tracing::debug!(file = %file.path().display(), "Reparse required");
        }
    }
}

pub struct FileTypeServiceBuilder {
    registry: Option<Arc<Registry>>,
    fs: Option<Arc<dyn FileSystem>>,
    store: Option<Arc<dyn AttributeStore>>,
    detectors: Option<DetectorChain>,
    sink: Option<Arc<dyn ReparseSink>>,
    config: EngineConfig,
    buffered: bool,
    background: bool,
}

impl Default for FileTypeServiceBuilder {
    fn default() -> Self {
        Self {
            registry: None,
            fs: None,
            store: None,
            detectors: None,
            sink: None,
            config: EngineConfig::default(),
            buffered: false,
            background: true,
        }
    }
}

impl FileTypeServiceBuilder {
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn store(mut self, store: Arc<dyn AttributeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replaces the default chain (the XML prolog detector).
    pub fn detectors(mut self, detectors: DetectorChain) -> Self {
        self.detectors = Some(detectors);
        self
    }

    pub fn reparse_sink(mut self, sink: Arc<dyn ReparseSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Routes attribute writes through a [`BufferedAttributeStore`].
    pub fn buffered(mut self, buffered: bool) -> Self {
        self.buffered = buffered;
        self
    }

    /// Without a background worker the re-detection queue only drains when
    /// asked to.
    pub fn background_redetect(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn build(self) -> Result<FileTypeService> {
        let registry = self.registry.unwrap_or_else(|| Arc::new(Registry::with_builtins()));
        let fs = self.fs.unwrap_or_else(|| Arc::new(LocalFileSystem));
        let inner = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryAttributeStore::new()));
        let buffer = self
            .buffered
            .then(|| Arc::new(BufferedAttributeStore::new(Arc::clone(&inner), self.config.buffer)));
        let store: Arc<dyn AttributeStore> = match &buffer {
            Some(buffer) => Arc::clone(buffer) as Arc<dyn AttributeStore>,
            None => inner,
        };

        let service_state = load_persisted(store.as_ref())?;
        if let Some(state) = service_state {
            registry.restore(state);
        }
        if let Some(masks) = self.config.ignore_masks.as_deref() {
            registry.set_ignore_masks(masks);
        }

        let cache = Arc::new(
            DetectionCache::new(Arc::clone(&store), Arc::clone(&registry)).with_file_system(Arc::clone(&fs)),
        );
        registry.subscribe(Arc::new(InvalidateOnChange {
            cache: Arc::downgrade(&cache),
        }));

        let detectors = self
            .detectors
            .unwrap_or_else(|| DetectorChain::new().push(XmlPrologDetector));
        let pipeline = Arc::new(crate::pipeline::ContentDetectionPipeline::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            fs,
            detectors,
            self.config.detection,
        ));

        let sink = self.sink.unwrap_or_else(|| Arc::new(LogSink));
        let queue = if self.background {
            ReDetectionQueue::spawn(Arc::clone(&pipeline), Arc::clone(&cache), sink, self.config.redetect)
        } else {
            ReDetectionQueue::manual(Arc::clone(&pipeline), Arc::clone(&cache), sink, self.config.redetect)
        };

        tracing::debug!(
            generation = cache.generation(),
            buffered = buffer.is_some(),
            "File type service ready"
        );

        Ok(FileTypeService {
            registry,
            cache,
            pipeline,
            queue,
            ids: FileIds::new(),
            store,
            buffer,
        })
    }
}

fn load_persisted(store: &dyn AttributeStore) -> Result<Option<PersistedState>> {
    let Some(body) = store.document(REGISTRY_STATE_DOCUMENT)? else {
        return Ok(None);
    };
    let state = serde_json::from_str(&body).context("Invalid persisted registry state")?;
    Ok(Some(state))
}

pub struct FileTypeService {
    registry: Arc<Registry>,
    cache: Arc<DetectionCache>,
    pipeline: Arc<crate::pipeline::ContentDetectionPipeline>,
    queue: ReDetectionQueue,
    ids: FileIds,
    store: Arc<dyn AttributeStore>,
    buffer: Option<Arc<BufferedAttributeStore>>,
}

impl std::fmt::Debug for FileTypeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTypeService")
            .field("registry", &self.registry)
            .field("generation", &self.cache.generation())
            .field("queue", &self.queue)
            .finish()
    }
}

impl FileTypeService {
    pub fn builder() -> FileTypeServiceBuilder {
        FileTypeServiceBuilder::default()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<DetectionCache> {
        &self.cache
    }

    pub fn pipeline(&self) -> &Arc<crate::pipeline::ContentDetectionPipeline> {
        &self.pipeline
    }

    pub fn queue(&self) -> &ReDetectionQueue {
        &self.queue
    }

    pub fn file_ref(&self, path: impl AsRef<Path>) -> FileRef {
        self.ids.file_ref(path)
    }

    pub fn is_ignored(&self, file: &FileRef) -> bool {
        self.registry.ignored().is_ignored(file)
    }

    /// Never fails; unreadable files classify as `UNKNOWN`.
    pub fn classify_file(&self, file: &FileRef) -> Classification {
        match self.classify_file_detailed(file, &Cancellation::none()) {
            Ok(outcome) => outcome.classification,
            Err(Cancelled) => Classification::unknown(),
        }
    }

    pub fn classify_file_detailed(&self, file: &FileRef, cancel: &Cancellation) -> Result<ClassifyOutcome, Cancelled> {
        let by_name = self.registry.classify_by_name(&file.name());
        if !by_name.is_placeholder() {
            return Ok(ClassifyOutcome {
                classification: by_name,
                source: ClassifySource::Name,
            });
        }
        cancel.check()?;

        let generation = self.cache.generation();
        if let Some(classification) = self.cache.read_cached_at(file, generation).classification() {
            return Ok(ClassifyOutcome {
                classification,
                source: ClassifySource::Cache,
            });
        }

        let classification = self.pipeline.classify_at(file, None, cancel, generation)?;
        Ok(ClassifyOutcome {
            classification,
            source: ClassifySource::Content,
        })
    }

    /// Answers from the name or in-memory cache only. On a miss the file is
    /// handed to the re-detection worker and `None` is returned.
    pub fn classify_nonblocking(&self, file: &FileRef) -> Option<Classification> {
        let by_name = self.registry.classify_by_name(&file.name());
        if !by_name.is_placeholder() {
            return Some(by_name);
        }
        let cached = self.cache.peek(file).classification();
        if cached.is_none() {
            self.queue.enqueue(file.clone());
        }
        cached
    }

    pub fn classify_many(&self, files: &[FileRef]) -> Vec<ClassifyOutcome> {
        files
            .par_iter()
            .map(|file| {
                self.classify_file_detailed(file, &Cancellation::none())
                    .unwrap_or_else(|_| ClassifyOutcome {
                        classification: Classification::unknown(),
                        source: ClassifySource::Content,
                    })
            })
            .collect()
    }

    /// Returns the file's current reference, which differs from the input
    /// only for renames.
    pub fn on_file_event(&self, event: FileEvent) -> FileRef {
        match event {
            FileEvent::ContentChanged(file) => {
                self.queue.on_content_changed(&file);
                file
            }
            FileEvent::Created(file) => {
                self.registry.ignored().forget(file.id());
                file
            }
            FileEvent::Renamed { from, to } => {
                self.cache.forget(&from);
                self.registry.ignored().forget(from.id());
                self.ids.rename(&from, to)
            }
            FileEvent::Deleted(file) => {
                self.cache.forget(&file);
                self.registry.ignored().forget(file.id());
                file
            }
        }
    }

    pub fn set_ignore_masks(&self, masks: &str) {
        self.registry.set_ignore_masks(masks);
    }

    pub fn invalidate_all(&self) -> u64 {
        self.cache.invalidate_all()
    }

    pub fn save_state(&self) -> Result<()> {
        let body = serde_json::to_string(&self.registry.snapshot())?;
        self.store.set_document(REGISTRY_STATE_DOCUMENT, &body)
    }

    /// Re-applies the persisted registry state, if any.
    pub fn load_state(&self) -> Result<bool> {
        match load_persisted(self.store.as_ref())? {
            Some(state) => {
                self.registry.restore(state);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.cache.flush_counters()?;
        if let Some(buffer) = &self.buffer {
            buffer.flush();
        }
        Ok(())
    }

    /// Counts every classification, which instantiates pending providers;
    /// `pending_providers` is sampled before that.
    pub fn stats(&self) -> ServiceStats {
        let pending_providers = self.registry.pending_len();
        ServiceStats {
            generation: self.cache.generation(),
            loaded_slots: self.cache.loaded_len(),
            classifications: self.registry.classifications().len(),
            pending_providers,
            redetect_pending: self.queue.pending_len(),
            pending_writes: self.store.pending_writes(),
        }
    }

    /// Finishes queued re-detection, persists registry state and drains
    /// the write buffer.
    pub fn shutdown(&self) -> Result<()> {
        self.queue.shutdown_and_drain();
        self.save_state()?;
        self.cache.flush_counters()?;
        if let Some(buffer) = &self.buffer {
            buffer.shutdown_and_flush()?;
        }
        Ok(())
    }
}
