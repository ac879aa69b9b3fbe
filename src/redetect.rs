//! Background re-detection of files whose content changed.
//!
//! Files are queued once (insertion ordered, deduplicated) and drained in
//! batches by a single worker thread. Each drained file is re-classified by
//! content; when the answer differs from what was cached the file is
//! reported on the [`ReparseSink`]. Read failures are retried after a fixed
//! backoff, up to a retry limit.

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cache::DetectionCache;
use crate::cancel::Cancellation;
use crate::fs::{FileId, FileRef};
use crate::pipeline::{ContentDetectionPipeline, DetectError};

/// Receives files whose classification changed and need reparsing.
pub trait ReparseSink: Send + Sync {
    fn reparse_required(&self, files: &[FileRef]);
}

impl ReparseSink for Sender<FileRef> {
    fn reparse_required(&self, files: &[FileRef]) {
        for file in files {
            let _ = self.send(file.clone());
        }
    }
}

/// Collects reparse requests in memory.
impl ReparseSink for Mutex<Vec<FileRef>> {
    fn reparse_required(&self, files: &[FileRef]) {
        self.lock().extend_from_slice(files);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedetectConfig {
    pub batch_size: usize,
    pub retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub max_retries: u32,
}

impl Default for RedetectConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            retry_backoff_ms: 500,
            poll_interval_ms: 50,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RedetectStats {
    pub pending: Arc<AtomicUsize>,
    pub enqueued: Arc<AtomicU64>,
    pub processed: Arc<AtomicU64>,
    pub changed: Arc<AtomicU64>,
    pub retried: Arc<AtomicU64>,
    pub dropped: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub changed: Vec<FileRef>,
    pub retried: usize,
    pub dropped: usize,
}

#[derive(Debug)]
struct Retry {
    due: Instant,
    file: FileRef,
    attempts: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: IndexMap<FileId, (FileRef, u32)>,
    retry: Vec<Retry>,
    in_flight: usize,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.retry.is_empty() && self.in_flight == 0
    }

    fn promote_due(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retry)
            .into_iter()
            .partition(|r| r.due <= now);
        self.retry = waiting;
        for r in due {
            self.pending.entry(r.file.id()).or_insert((r.file, r.attempts));
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    idle: Condvar,
    pipeline: Arc<ContentDetectionPipeline>,
    cache: Arc<DetectionCache>,
    sink: Arc<dyn ReparseSink>,
    config: RedetectConfig,
    stats: RedetectStats,
    cancel: Cancellation,
}

pub struct ReDetectionQueue {
    shared: Arc<Shared>,
    tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ReDetectionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReDetectionQueue")
            .field("pending", &self.pending_len())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl ReDetectionQueue {
    /// Starts the queue with its background worker.
    pub fn spawn(
        pipeline: Arc<ContentDetectionPipeline>,
        cache: Arc<DetectionCache>,
        sink: Arc<dyn ReparseSink>,
        config: RedetectConfig,
    ) -> Self {
        let queue = Self::manual(pipeline, cache, sink, config);
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let handle = spawn_worker(rx, Arc::clone(&queue.shared));
        *queue.tx.lock() = Some(tx);
        *queue.handle.lock() = Some(handle);
        queue
    }

    /// A queue without a worker; callers drive it with [`Self::drain_once`].
    pub fn manual(
        pipeline: Arc<ContentDetectionPipeline>,
        cache: Arc<DetectionCache>,
        sink: Arc<dyn ReparseSink>,
        config: RedetectConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                idle: Condvar::new(),
                pipeline,
                cache,
                sink,
                config,
                stats: RedetectStats::default(),
                cancel: Cancellation::new(),
            }),
            tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Queues `file` unless it is already waiting. Returns whether it was
    /// added.
    pub fn enqueue(&self, file: FileRef) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.pending.contains_key(&file.id()) {
                return false;
            }
            state.retry.retain(|r| r.file.id() != file.id());
            state.pending.insert(file.id(), (file, 0));
            self.shared.stats.pending.store(state.pending.len(), Ordering::Relaxed);
        }
        self.shared.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        self.wake();
        true
    }

    /// Queues `file` only if its cached state says content detection ran;
    /// files never classified by content have nothing to go stale.
    pub fn on_content_changed(&self, file: &FileRef) -> bool {
        if !self.shared.cache.read_cached(file).was_detected() {
            return false;
        }
        self.enqueue(file.clone())
    }

    pub fn drain_once(&self) -> DrainReport {
        self.shared.drain_once()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn stats(&self) -> RedetectStats {
        self.shared.stats.clone()
    }

    /// Blocks until nothing is queued, waiting for retry or in flight.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                return state.is_idle();
            }
        }
        true
    }

    /// Stops the worker after it has processed everything already queued.
    /// Pending retries are dropped.
    pub fn shutdown_and_drain(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Stops the worker without finishing the queue.
    pub fn abort(&self) {
        self.shared.cancel.cancel();
        self.shutdown_and_drain();
    }

    fn wake(&self) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ReDetectionQueue {
    fn drop(&mut self) {
        self.shutdown_and_drain();
    }
}

impl Shared {
    fn has_ready_work(&self) -> bool {
        let state = self.state.lock();
        let now = Instant::now();
        !state.pending.is_empty() || state.retry.iter().any(|r| r.due <= now)
    }

    fn drain_once(&self) -> DrainReport {
        let batch: Vec<(FileRef, u32)> = {
            let mut state = self.state.lock();
            state.promote_due(Instant::now());
            let take = self.config.batch_size.max(1).min(state.pending.len());
            let batch: Vec<_> = state.pending.drain(..take).map(|(_, v)| v).collect();
            state.in_flight += batch.len();
            self.stats.pending.store(state.pending.len(), Ordering::Relaxed);
            batch
        };

        let mut report = DrainReport::default();
        let mut retries = Vec::new();
        let mut requeue = Vec::new();
        let total = batch.len();

        for (file, attempts) in batch {
            if self.cancel.is_cancelled() {
                requeue.push((file, attempts));
                continue;
            }
            let generation = self.cache.generation();
            let old = self.cache.read_cached_at(&file, generation).classification();
            match self.pipeline.detect(&file, None, &self.cancel, generation) {
                Ok(new) => {
                    report.processed += 1;
                    if old.as_ref() != Some(&new) {
                        tracing::debug!(
                            file = %file.path().display(),
                            old = ?old.as_ref().map(|c| c.name().to_string()),
                            new = %new,
                            "Classification changed"
                        );
                        report.changed.push(file);
                    }
                }
                Err(DetectError::Cancelled(_)) => requeue.push((file, attempts)),
                Err(err @ DetectError::Io { .. }) => {
                    if attempts + 1 < self.config.max_retries {
                        tracing::debug!(error = %err, attempt = attempts + 1, "Re-detection failed, retrying later");
                        retries.push(Retry {
                            due: Instant::now() + Duration::from_millis(self.config.retry_backoff_ms),
                            file,
                            attempts: attempts + 1,
                        });
                        report.retried += 1;
                    } else {
                        tracing::warn!(error = %err, attempts = attempts + 1, "Giving up on re-detection");
                        report.dropped += 1;
                    }
                }
            }
        }

        if !report.changed.is_empty() {
            self.sink.reparse_required(&report.changed);
        }

        self.stats.processed.fetch_add(report.processed as u64, Ordering::Relaxed);
        self.stats.changed.fetch_add(report.changed.len() as u64, Ordering::Relaxed);
        self.stats.retried.fetch_add(report.retried as u64, Ordering::Relaxed);
        self.stats.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);

        let mut state = self.state.lock();
        state.in_flight -= total;
        state.retry.extend(retries);
        for (file, attempts) in requeue {
            state.pending.entry(file.id()).or_insert((file, attempts));
        }
        self.stats.pending.store(state.pending.len(), Ordering::Relaxed);
        if state.is_idle() {
            self.idle.notify_all();
        }
        report
    }

    fn drop_retries(&self) {
        let mut state = self.state.lock();
        let dropped = state.retry.len();
        state.retry.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Dropping pending re-detection retries on shutdown");
        }
        if state.is_idle() {
            self.idle.notify_all();
        }
    }
}

fn spawn_worker(rx: Receiver<()>, shared: Arc<Shared>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let poll = Duration::from_millis(shared.config.poll_interval_ms.max(1));
        loop {
            match rx.recv_timeout(poll) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    shared.drop_retries();
                    while !shared.cancel.is_cancelled() && shared.has_ready_work() {
                        shared.drain_once();
                        shared.drop_retries();
                    }
                    break;
                }
            }
            while !shared.cancel.is_cancelled() && shared.has_ready_work() {
                shared.drain_once();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedDetection;
    use crate::detector::DetectorChain;
    use crate::fs::{FileIds, MemoryFileSystem};
    use crate::pipeline::DetectionConfig;
    use crate::registry::Registry;
    use crate::store::MemoryAttributeStore;

    struct Fixture {
        fs: Arc<MemoryFileSystem>,
        ids: FileIds,
        cache: Arc<DetectionCache>,
        pipeline: Arc<ContentDetectionPipeline>,
        sink: Arc<Mutex<Vec<FileRef>>>,
    }

    fn fixture() -> Fixture {
        let fs = Arc::new(MemoryFileSystem::new());
        let registry = Arc::new(Registry::with_builtins());
        let cache = Arc::new(DetectionCache::new(Arc::new(MemoryAttributeStore::new()), registry.clone()));
        let pipeline = Arc::new(ContentDetectionPipeline::new(
            registry,
            cache.clone(),
            fs.clone(),
            DetectorChain::new(),
            DetectionConfig::default(),
        ));
        Fixture {
            fs,
            ids: FileIds::new(),
            cache,
            pipeline,
            sink: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn config() -> RedetectConfig {
        RedetectConfig {
            batch_size: 2,
            retry_backoff_ms: 20,
            poll_interval_ms: 5,
            max_retries: 3,
        }
    }

    fn manual(fx: &Fixture) -> ReDetectionQueue {
        ReDetectionQueue::manual(fx.pipeline.clone(), fx.cache.clone(), fx.sink.clone(), config())
    }

    #[test]
    fn enqueue_deduplicates_and_keeps_order() {
        let fx = fixture();
        let queue = manual(&fx);
        let a = fx.ids.file_ref("/w/a");
        let b = fx.ids.file_ref("/w/b");
        assert!(queue.enqueue(a.clone()));
        assert!(queue.enqueue(b));
        assert!(!queue.enqueue(a));
        assert_eq!(queue.pending_len(), 2);
    }

    #[test]
    fn only_detected_files_are_requeued_on_change() {
        let fx = fixture();
        let queue = manual(&fx);
        let file = fx.ids.file_ref("/w/data");
        assert!(!queue.on_content_changed(&file));
        fx.cache.write(&file, Some(&crate::classification::Classification::plain_text()));
        assert!(queue.on_content_changed(&file));
    }

    #[test]
    fn changed_content_reports_once() {
        let fx = fixture();
        let queue = manual(&fx);
        fx.fs.add_file("/w/data", b"text".to_vec());
        let file = fx.ids.file_ref("/w/data");
        fx.pipeline
            .classify_by_content(&file, None, &Cancellation::none())
            .unwrap();

        fx.fs.add_file("/w/data", b"\x00\x01".to_vec());
        assert!(queue.on_content_changed(&file));
        assert!(!queue.on_content_changed(&file));
        let report = queue.drain_once();
        assert_eq!(report.changed, vec![file.clone()]);
        assert_eq!(fx.sink.lock().as_slice(), &[file.clone()]);
        assert_eq!(fx.cache.peek(&file), CachedDetection::Binary);

        assert!(queue.on_content_changed(&file));
        assert!(queue.drain_once().changed.is_empty());
        assert_eq!(fx.sink.lock().len(), 1);
    }

    #[test]
    fn batches_are_bounded() {
        let fx = fixture();
        let queue = manual(&fx);
        for name in ["a", "b", "c"] {
            let path = format!("/w/{name}");
            fx.fs.add_file(path.as_str(), b"x".to_vec());
            queue.enqueue(fx.ids.file_ref(&path));
        }
        assert_eq!(queue.drain_once().processed, 2);
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.drain_once().processed, 1);
    }

    #[test]
    fn io_failures_retry_then_give_up() {
        let fx = fixture();
        let queue = manual(&fx);
        fx.fs.add_file("/w/locked", b"x".to_vec());
        fx.fs.fail_reads("/w/locked", "locked");
        let file = fx.ids.file_ref("/w/locked");
        queue.enqueue(file);

        assert_eq!(queue.drain_once().retried, 1);
        assert_eq!(queue.drain_once().processed, 0);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.drain_once().retried, 1);
        std::thread::sleep(Duration::from_millis(30));
        let last = queue.drain_once();
        assert_eq!(last.dropped, 1);
        assert!(queue.wait_idle(Duration::from_millis(10)));
    }

    #[test]
    fn worker_recovers_after_transient_failure() {
        let fx = fixture();
        fx.fs.add_file("/w/flaky", b"plain".to_vec());
        let file = fx.ids.file_ref("/w/flaky");
        fx.cache.write(&file, Some(&crate::classification::Classification::unknown()));
        fx.fs.fail_reads("/w/flaky", "busy");

        let queue = ReDetectionQueue::spawn(fx.pipeline.clone(), fx.cache.clone(), fx.sink.clone(), config());
        assert!(queue.on_content_changed(&file));
        std::thread::sleep(Duration::from_millis(10));
        fx.fs.clear_failure("/w/flaky");

        assert!(queue.wait_idle(Duration::from_secs(5)));
        assert_eq!(fx.cache.peek(&file), CachedDetection::PlainText);
        assert_eq!(fx.sink.lock().as_slice(), &[file]);
        queue.shutdown_and_drain();
        assert!(queue.stats().processed.load(Ordering::Relaxed) >= 1);
    }
}
