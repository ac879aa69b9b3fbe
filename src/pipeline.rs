//! Content-based classification for files whose name is inconclusive.
//!
//! The pipeline reads a bounded prefix of the file, runs the detector chain,
//! tries the `#!` line, and finally falls back to text/binary sniffing. The
//! result is written to the [`DetectionCache`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::ThreadId;

use crate::cache::DetectionCache;
use crate::cancel::{Cancellation, Cancelled};
use crate::classification::Classification;
use crate::detector::{DetectionInput, DetectorChain};
use crate::fs::{EntryKind, FileRef, FileSystem};
use crate::registry::Registry;
use crate::relay::{ReadRelay, RelayError};
use crate::sniff::decode_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub default_prefix_len: usize,
    pub max_prefix_len: usize,
    /// Classify zero-length files as plain text when no detector claims
    /// them.
    pub empty_files_as_text: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            default_prefix_len: 1024,
            max_prefix_len: 64 * 1024,
            empty_files_as_text: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

#[derive(Debug)]
pub struct ContentDetectionPipeline {
    registry: Arc<Registry>,
    cache: Arc<DetectionCache>,
    fs: Arc<dyn FileSystem>,
    detectors: DetectorChain,
    relay: ReadRelay,
    config: DetectionConfig,
    owner: Option<ThreadId>,
}

impl ContentDetectionPipeline {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<DetectionCache>,
        fs: Arc<dyn FileSystem>,
        detectors: DetectorChain,
        config: DetectionConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            fs,
            detectors,
            relay: ReadRelay::new(),
            config,
            owner: None,
        }
    }

    /// Reads issued from `owner` go straight to disk; every other thread
    /// shares reads through the relay.
    pub fn with_owner_thread(mut self, owner: ThreadId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn relay(&self) -> &ReadRelay {
        &self.relay
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Classifies `file` by content. I/O failures yield `UNKNOWN` and leave
    /// the cache untouched so a later call can retry.
    pub fn classify_by_content(
        &self,
        file: &FileRef,
        cached_bytes: Option<&[u8]>,
        cancel: &Cancellation,
    ) -> Result<Classification, Cancelled> {
        self.classify_at(file, cached_bytes, cancel, self.cache.generation())
    }

    pub(crate) fn classify_at(
        &self,
        file: &FileRef,
        cached_bytes: Option<&[u8]>,
        cancel: &Cancellation,
        generation: u64,
    ) -> Result<Classification, Cancelled> {
        match self.detect(file, cached_bytes, cancel, generation) {
            Ok(c) => Ok(c),
            Err(DetectError::Cancelled(c)) => Err(c),
            Err(err @ DetectError::Io { .. }) => {
                tracing::debug!(error = %err, "Content detection degraded to UNKNOWN");
                Ok(Classification::unknown())
            }
        }
    }

    pub(crate) fn detect(
        &self,
        file: &FileRef,
        cached_bytes: Option<&[u8]>,
        cancel: &Cancellation,
        generation: u64,
    ) -> Result<Classification, DetectError> {
        let by_name = self.registry.classify_by_name(&file.name());
        if !by_name.is_placeholder() {
            self.cache.write_at(file, generation, None);
            return Ok(by_name);
        }

        let len = match cached_bytes {
            Some(bytes) => bytes.len() as u64,
            None => {
                cancel.check()?;
                let stat = self.fs.stat(file.path()).map_err(|err| io_error(file, err))?;
                if stat.kind != EntryKind::File {
                    return Ok(Classification::unknown());
                }
                stat.len
            }
        };

        if len == 0 {
            return Ok(self.classify_empty(file, cancel, generation)?);
        }

        let wanted = self.prefix_len();
        let bytes: Arc<[u8]> = match cached_bytes {
            Some(bytes) => Arc::from(&bytes[..bytes.len().min(wanted)]),
            None => self.read_prefix(file, wanted, cancel)?,
        };

        let text = decode_text(&bytes);
        let input = DetectionInput {
            file,
            bytes: &bytes,
            text: text.as_deref(),
        };
        let classification = self
            .detectors
            .run(&input)
            .or_else(|| text.as_deref().and_then(|t| self.registry.classify_by_hash_bang(t)))
            .unwrap_or_else(|| match text.as_deref() {
                Some(t) if !t.is_empty() => Classification::plain_text(),
                _ => Classification::unknown(),
            });

        cancel.check()?;
        self.cache.write_at(file, generation, Some(&classification));
        tracing::trace!(file = %file.path().display(), classification = %classification, "Detected by content");
        Ok(classification)
    }

    fn classify_empty(&self, file: &FileRef, cancel: &Cancellation, generation: u64) -> Result<Classification, Cancelled> {
        let input = DetectionInput {
            file,
            bytes: &[],
            text: Some(""),
        };
        let claimed = if self.detectors.any_accepts_empty() {
            self.detectors.run_empty(&input)
        } else {
            None
        };
        let classification = match claimed {
            Some(c) => c,
            None if self.config.empty_files_as_text => Classification::plain_text(),
            None => return Ok(Classification::unknown()),
        };
        cancel.check()?;
        self.cache.write_at(file, generation, Some(&classification));
        Ok(classification)
    }

    fn prefix_len(&self) -> usize {
        let wish = self.detectors.max_prefix_len().unwrap_or(0);
        self.config
            .default_prefix_len
            .max(wish)
            .min(self.config.max_prefix_len)
            .max(1)
    }

    fn read_prefix(&self, file: &FileRef, len: usize, cancel: &Cancellation) -> Result<Arc<[u8]>, DetectError> {
        cancel.check()?;
        let on_owner = self.owner == Some(std::thread::current().id());
        if on_owner {
            return self
                .fs
                .read_prefix(file.path(), len)
                .map(Arc::from)
                .map_err(|err| io_error(file, err));
        }
        self.relay
            .read(file.id(), len, cancel, || self.fs.read_prefix(file.path(), len))
            .map_err(|err| match err {
                RelayError::Cancelled(c) => DetectError::Cancelled(c),
                RelayError::Io(reason) => DetectError::Io {
                    path: file.path().display().to_string(),
                    reason,
                },
            })
    }
}

fn io_error(file: &FileRef, err: anyhow::Error) -> DetectError {
    DetectError::Io {
        path: file.path().display().to_string(),
        reason: format!("{err:#}"),
    }
}
