//! Write buffering for per-file attribute persistence.
//!
//! `BufferedAttributeStore` queues attribute writes and a background thread
//! flushes them to the inner store in batches, either when the batch size is
//! reached or after the flush interval. Reads see queued writes through an
//! in-memory overlay, so callers never observe their own write going missing.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::store::{AttributeStore, AttributeWrite, StoredAttribute};

type OverlayKey = (String, String);
type Overlay = Arc<Mutex<HashMap<OverlayKey, Option<StoredAttribute>>>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 50,
        }
    }
}

enum Message {
    Write(AttributeWrite),
    Flush(SyncSender<()>),
}

pub struct BufferedAttributeStore {
    inner: Arc<dyn AttributeStore>,
    overlay: Overlay,
    tx: Mutex<Option<Sender<Message>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl fmt::Debug for BufferedAttributeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedAttributeStore")
            .field("inner", &self.inner)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

impl BufferedAttributeStore {
    pub fn new(inner: Arc<dyn AttributeStore>, config: BufferConfig) -> Self {
        let (tx, rx) = std::sync::mpsc::channel::<Message>();
        let overlay: Overlay = Arc::new(Mutex::new(HashMap::new()));
        let pending = Arc::new(AtomicUsize::new(0));
        let handle = spawn_flusher(
            rx,
            Arc::clone(&inner),
            config,
            Arc::clone(&overlay),
            Arc::clone(&pending),
        );

        Self {
            inner,
            overlay,
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            pending,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Blocks until every write queued before this call reached the inner
    /// store (or failed there).
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = std::sync::mpsc::sync_channel(1);
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(Message::Flush(ack_tx)).is_ok(),
            None => false,
        };
        if sent {
            let _ = ack_rx.recv();
        }
    }

    pub fn shutdown_and_flush(&self) -> Result<()> {
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for BufferedAttributeStore {
    fn drop(&mut self) {
        let _ = self.shutdown_and_flush();
    }
}

impl AttributeStore for BufferedAttributeStore {
    fn read(&self, attribute: &str, file_key: &str) -> Result<Option<StoredAttribute>> {
        let key = (attribute.to_string(), file_key.to_string());
        if let Some(value) = self.overlay.lock().get(&key) {
            return Ok(value.clone());
        }
        self.inner.read(attribute, file_key)
    }

    fn write_batch(&self, writes: &[AttributeWrite]) -> Result<()> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return self.inner.write_batch(writes);
        };
        {
            let mut overlay = self.overlay.lock();
            for w in writes {
                overlay.insert((w.attribute.clone(), w.file_key.clone()), w.value.clone());
            }
        }
        for w in writes {
            self.pending.fetch_add(1, Ordering::Relaxed);
            if tx.send(Message::Write(w.clone())).is_err() {
                self.pending.fetch_sub(1, Ordering::Relaxed);
                return self.inner.write_batch(std::slice::from_ref(w));
            }
        }
        Ok(())
    }

    fn counter(&self, name: &str) -> Result<Option<u64>> {
        self.inner.counter(name)
    }

    fn set_counter(&self, name: &str, value: u64) -> Result<()> {
        self.inner.set_counter(name, value)
    }

    fn document(&self, name: &str) -> Result<Option<String>> {
        self.inner.document(name)
    }

    fn set_document(&self, name: &str, body: &str) -> Result<()> {
        self.inner.set_document(name, body)
    }

    fn pending_writes(&self) -> usize {
        self.pending_count()
    }
}

fn spawn_flusher(
    rx: Receiver<Message>,
    inner: Arc<dyn AttributeStore>,
    config: BufferConfig,
    overlay: Overlay,
    pending: Arc<AtomicUsize>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let batch_size = config.batch_size.max(1);
        let mut batch: Vec<AttributeWrite> = Vec::with_capacity(batch_size);
        let flush = |batch: &mut Vec<AttributeWrite>| {
            flush_batch(inner.as_ref(), &overlay, &pending, batch);
        };

        loop {
            while let Ok(msg) = rx.try_recv() {
                match msg {
                    Message::Write(w) => {
                        batch.push(w);
                        if batch.len() >= batch_size {
                            flush(&mut batch);
                        }
                    }
                    // The channel is FIFO, so every earlier write is in `batch`.
                    Message::Flush(ack) => {
                        flush(&mut batch);
                        let _ = ack.send(());
                    }
                }
            }

            flush(&mut batch);

            match rx.recv_timeout(Duration::from_millis(config.flush_interval_ms)) {
                Ok(Message::Write(w)) => batch.push(w),
                Ok(Message::Flush(ack)) => {
                    let _ = ack.send(());
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    })
}

fn flush_batch(
    inner: &dyn AttributeStore,
    overlay: &Mutex<HashMap<OverlayKey, Option<StoredAttribute>>>,
    pending: &AtomicUsize,
    batch: &mut Vec<AttributeWrite>,
) {
    if batch.is_empty() {
        return;
    }
    let drained = batch.len();
    match inner.write_batch(batch) {
        Ok(()) => {
            let mut overlay = overlay.lock();
            for w in batch.iter() {
                let key = (w.attribute.clone(), w.file_key.clone());
                // A newer write for the same key may have landed meanwhile.
                if overlay.get(&key) == Some(&w.value) {
                    overlay.remove(&key);
                }
            }
        }
        Err(err) => {
            tracing::warn!(writes = drained, error = %err, "Failed to flush attribute writes");
        }
    }
    pending.fetch_sub(drained, Ordering::Relaxed);
    batch.clear();
}
