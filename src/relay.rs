//! Single-flight relay for content prefix reads.
//!
//! Concurrent requests for the same `(file, length)` share one disk read:
//! the first caller performs it and everyone else waits for its result.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cancel::{Cancellation, Cancelled};
use crate::fs::FileId;

const WAIT_SLICE: Duration = Duration::from_millis(10);

type Shared = Result<Arc<[u8]>, String>;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    Io(String),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

#[derive(Debug, Default)]
struct Flight {
    result: Mutex<Option<Shared>>,
    done: Condvar,
}

impl Flight {
    fn complete(&self, result: Shared) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
        }
        self.done.notify_all();
    }
}

#[derive(Debug, Default)]
pub struct ReadRelay {
    flights: Mutex<HashMap<(FileId, usize), Arc<Flight>>>,
    joined: AtomicU64,
}

/// Completes the flight even if the leader unwinds, so followers never hang.
struct LeaderGuard<'a> {
    relay: &'a ReadRelay,
    key: (FileId, usize),
    flight: Arc<Flight>,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.flight.complete(Err("read abandoned".to_string()));
        self.relay.flights.lock().remove(&self.key);
    }
}

impl ReadRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read<F>(&self, id: FileId, len: usize, cancel: &Cancellation, load: F) -> Result<Arc<[u8]>, RelayError>
    where
        F: FnOnce() -> anyhow::Result<Vec<u8>>,
    {
        let key = (id, len);
        let (flight, leader) = {
            let mut flights = self.flights.lock();
            match flights.get(&key) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight::default());
                    flights.insert(key, Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if leader {
            let guard = LeaderGuard {
                relay: self,
                key,
                flight: Arc::clone(&flight),
            };
            let result: Shared = load().map(Arc::from).map_err(|err| format!("{err:#}"));
            flight.complete(result.clone());
            drop(guard);
            return result.map_err(RelayError::Io);
        }

        self.joined.fetch_add(1, Ordering::Relaxed);
        let mut slot = flight.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone().map_err(RelayError::Io);
            }
            cancel.check()?;
            flight.done.wait_for(&mut slot, WAIT_SLICE);
        }
    }

    /// How many callers were served by someone else's read.
    pub fn joined_count(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}
