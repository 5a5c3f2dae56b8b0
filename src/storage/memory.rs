//! In-memory tracker backend for tests and ephemeral runs
//!
//! Thread-safe via `Mutex`. Not durable: data is lost on restart. The
//! availability switch lets tests exercise the `Unavailable` path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{TrackerBackend, TrackerError};

type Keyspace = HashMap<String, Vec<u8>>;

pub struct InMemoryTracker {
    active: Mutex<Keyspace>,
    archive: Mutex<Keyspace>,
    available: AtomicBool,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            archive: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock<'a>(&self, space: &'a Mutex<Keyspace>) -> Result<MutexGuard<'a, Keyspace>, TrackerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TrackerError::Unavailable(
                "in-memory tracker switched off".to_string(),
            ));
        }
        space
            .lock()
            .map_err(|e| TrackerError::Unavailable(e.to_string()))
    }
}

impl Default for InMemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackerBackend for InMemoryTracker {
    fn backend_name(&self) -> &'static str {
        "InMemory"
    }

    fn load(&self, id: &str) -> Result<Option<Vec<u8>>, TrackerError> {
        Ok(self.lock(&self.active)?.get(id).cloned())
    }

    fn compare_and_swap(
        &self,
        id: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, TrackerError> {
        let mut active = self.lock(&self.active)?;
        if active.get(id).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        match new {
            Some(bytes) => {
                active.insert(id.to_string(), bytes);
            }
            None => {
                active.remove(id);
            }
        }
        Ok(true)
    }

    fn scan_active(&self) -> Result<Vec<Vec<u8>>, TrackerError> {
        Ok(self.lock(&self.active)?.values().cloned().collect())
    }

    fn store_archived(&self, id: &str, record: Vec<u8>) -> Result<(), TrackerError> {
        self.lock(&self.archive)?.insert(id.to_string(), record);
        Ok(())
    }

    fn load_archived(&self, id: &str) -> Result<Option<Vec<u8>>, TrackerError> {
        Ok(self.lock(&self.archive)?.get(id).cloned())
    }

    fn scan_archived(&self) -> Result<Vec<(String, Vec<u8>)>, TrackerError> {
        Ok(self
            .lock(&self.archive)?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn remove_archived(&self, id: &str) -> Result<(), TrackerError> {
        self.lock(&self.archive)?.remove(id);
        Ok(())
    }

    fn counts(&self) -> Result<(usize, usize), TrackerError> {
        let active = self.lock(&self.active)?.len();
        let archived = self.lock(&self.archive)?.len();
        Ok((active, archived))
    }
}
