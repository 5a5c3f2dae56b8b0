//! Submission Tracker
//!
//! Durable map `submission_id -> SubmissionState`. Backends only store bytes
//! and offer an atomic compare-and-swap; `SubmissionTracker` layers the typed
//! API on top, including the read-modify-write loop every coordinator
//! mutation goes through:
//!
//! 1. load the current entry bytes
//! 2. decode, apply the mutation to a copy
//! 3. CAS the new bytes against the bytes read in step 1
//! 4. on conflict, start again from the refreshed entry
//!
//! Two events for the same submission may race; exactly one wins each round.
//! Events for different submissions never touch the same key.
//!
//! Terminal states whose completion has been published are moved into a
//! separate archive keyspace so the timeout sweep only scans live work.

mod memory;
mod sled_tracker;

pub use memory::InMemoryTracker;
pub use sled_tracker::SledTracker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::defaults::MAX_CAS_RETRIES;
use crate::types::SubmissionState;

/// Tracker errors
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Backing store unreachable; the triggering message must be redelivered
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// CAS kept losing to concurrent writers
    #[error("update of '{id}' abandoned after {attempts} conflicting attempts")]
    Contention { id: String, attempts: u32 },
}

impl TrackerError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Contention { .. })
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Raw byte storage behind the tracker.
///
/// Implementations must be thread-safe (Send + Sync) for shared access
/// across handler tasks.
pub trait TrackerBackend: Send + Sync {
    /// Backend name for logging
    fn backend_name(&self) -> &'static str;

    /// Current bytes of an active entry.
    fn load(&self, id: &str) -> Result<Option<Vec<u8>>, TrackerError>;

    /// Replace `expected` with `new` atomically. `None` on either side means
    /// "absent". Returns `false` if the stored value was not `expected`.
    fn compare_and_swap(
        &self,
        id: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, TrackerError>;

    /// All active entries.
    fn scan_active(&self) -> Result<Vec<Vec<u8>>, TrackerError>;

    fn store_archived(&self, id: &str, record: Vec<u8>) -> Result<(), TrackerError>;

    fn load_archived(&self, id: &str) -> Result<Option<Vec<u8>>, TrackerError>;

    /// All archived entries as `(id, bytes)`.
    fn scan_archived(&self) -> Result<Vec<(String, Vec<u8>)>, TrackerError>;

    fn remove_archived(&self, id: &str) -> Result<(), TrackerError>;

    /// `(active, archived)` entry counts.
    fn counts(&self) -> Result<(usize, usize), TrackerError>;

    /// Persist pending writes. No-op for volatile backends.
    fn flush(&self) -> Result<(), TrackerError> {
        Ok(())
    }
}

/// Stored form of an active submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerEntry {
    pub state: SubmissionState,
    /// Time of the last committed mutation
    pub updated_at: DateTime<Utc>,
}

/// Stored form of a finished submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedSubmission {
    pub state: SubmissionState,
    pub archived_at: DateTime<Utc>,
}

/// Statistics about the tracker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerStats {
    pub backend: String,
    pub active: usize,
    pub archived: usize,
}

/// Typed, CAS-serialized access to submission state.
#[derive(Clone)]
pub struct SubmissionTracker {
    backend: Arc<dyn TrackerBackend>,
    max_cas_retries: u32,
}

impl SubmissionTracker {
    pub fn new(backend: Arc<dyn TrackerBackend>) -> Self {
        Self {
            backend,
            max_cas_retries: MAX_CAS_RETRIES,
        }
    }

    /// Volatile tracker, for tests and `--in-memory` runs.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryTracker::new()))
    }

    #[must_use]
    pub fn with_max_cas_retries(mut self, retries: u32) -> Self {
        self.max_cas_retries = retries.max(1);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    fn encode(state: &SubmissionState) -> Result<Vec<u8>, TrackerError> {
        let entry = TrackerEntry {
            state: state.clone(),
            updated_at: Utc::now(),
        };
        Ok(serde_json::to_vec(&entry)?)
    }

    fn decode(bytes: &[u8]) -> Result<TrackerEntry, TrackerError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Active entry for `id`, if any.
    pub fn get(&self, id: &str) -> Result<Option<TrackerEntry>, TrackerError> {
        self.backend
            .load(id)?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    /// Insert `state` unless the id is already known (active or archived).
    ///
    /// Returns `false` when an entry existed; nothing is written then.
    pub fn create_if_absent(&self, state: &SubmissionState) -> Result<bool, TrackerError> {
        let id = state.id();
        if self.backend.load_archived(id)?.is_some() {
            debug!(submission_id = %id, "Submission already archived");
            return Ok(false);
        }
        let bytes = Self::encode(state)?;
        self.backend.compare_and_swap(id, None, Some(bytes))
    }

    /// Atomically apply `mutate` to the state of `id`.
    ///
    /// `mutate` may run several times (once per CAS round) and must derive
    /// everything from the state it is given. Only the value returned by the
    /// round that committed is handed back. When `mutate` leaves the state
    /// unchanged nothing is written. Returns `None` if `id` has no active entry.
    pub fn update<T, F>(&self, id: &str, mut mutate: F) -> Result<Option<T>, TrackerError>
    where
        F: FnMut(&mut SubmissionState) -> T,
    {
        for round in 1..=self.max_cas_retries {
            let Some(current) = self.backend.load(id)? else {
                return Ok(None);
            };
            let entry = Self::decode(&current)?;
            let mut state = entry.state.clone();
            let output = mutate(&mut state);

            if state == entry.state {
                return Ok(Some(output));
            }

            let next = Self::encode(&state)?;
            if self.backend.compare_and_swap(id, Some(&current), Some(next))? {
                return Ok(Some(output));
            }
            debug!(submission_id = %id, round, "Tracker CAS conflict, retrying with fresh state");
        }

        warn!(
            submission_id = %id,
            attempts = self.max_cas_retries,
            "Tracker update abandoned under contention"
        );
        Err(TrackerError::Contention {
            id: id.to_string(),
            attempts: self.max_cas_retries,
        })
    }

    /// Every active entry. Undecodable entries are skipped with a warning.
    pub fn active(&self) -> Result<Vec<TrackerEntry>, TrackerError> {
        let raw = self.backend.scan_active()?;
        let mut entries = Vec::with_capacity(raw.len());
        for bytes in raw {
            match Self::decode(&bytes) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "Skipping undecodable tracker entry"),
            }
        }
        Ok(entries)
    }

    /// Move a terminal entry into the archive.
    ///
    /// Returns `false` if the entry is gone or not terminal. The active entry
    /// is only removed if it still matches what was archived.
    pub fn archive(&self, id: &str) -> Result<bool, TrackerError> {
        let Some(current) = self.backend.load(id)? else {
            return Ok(false);
        };
        let entry = Self::decode(&current)?;
        if !entry.state.is_terminal() {
            warn!(submission_id = %id, "Refusing to archive a running submission");
            return Ok(false);
        }

        let archived = ArchivedSubmission {
            state: entry.state,
            archived_at: Utc::now(),
        };
        self.backend
            .store_archived(id, serde_json::to_vec(&archived)?)?;
        let removed = self.backend.compare_and_swap(id, Some(&current), None)?;
        if removed {
            debug!(submission_id = %id, "Submission archived");
        }
        Ok(removed)
    }

    pub fn get_archived(&self, id: &str) -> Result<Option<ArchivedSubmission>, TrackerError> {
        self.backend
            .load_archived(id)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(TrackerError::from))
            .transpose()
    }

    /// Delete archived submissions older than `cutoff`. Returns the count.
    pub fn prune_archive(&self, cutoff: DateTime<Utc>) -> Result<usize, TrackerError> {
        let mut deleted = 0;
        for (id, bytes) in self.backend.scan_archived()? {
            let expired = match serde_json::from_slice::<ArchivedSubmission>(&bytes) {
                Ok(archived) => archived.archived_at < cutoff,
                Err(e) => {
                    warn!(submission_id = %id, error = %e, "Removing corrupted archive entry");
                    true
                }
            };
            if expired {
                self.backend.remove_archived(&id)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<TrackerStats, TrackerError> {
        let (active, archived) = self.backend.counts()?;
        Ok(TrackerStats {
            backend: self.backend.backend_name().to_string(),
            active,
            archived,
        })
    }

    pub fn flush(&self) -> Result<(), TrackerError> {
        self.backend.flush()
    }
}
