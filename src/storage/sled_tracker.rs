//! Sled-backed tracker
//!
//! Two named trees in one database:
//! - `active`: running (and just-finished, not yet archived) submissions,
//!   mutated only through sled's native `compare_and_swap`
//! - `archive`: finished submissions, keyed by submission id
//!
//! Writes are not flushed individually. Sled flushes in the background and
//! the service flushes on shutdown; an entry lost in a crash is recovered by
//! bus redelivery of the event that produced it.

use std::path::Path;

use super::{TrackerBackend, TrackerError};

const ACTIVE_TREE: &str = "active";
const ARCHIVE_TREE: &str = "archive";

impl From<sled::Error> for TrackerError {
    fn from(err: sled::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

#[derive(Clone)]
pub struct SledTracker {
    db: sled::Db,
    active: sled::Tree,
    archive: sled::Tree,
}

impl SledTracker {
    /// Open or create the tracker database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TrackerError> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        let active = db.open_tree(ACTIVE_TREE)?;
        let archive = db.open_tree(ARCHIVE_TREE)?;

        tracing::info!(
            path = %path.display(),
            active = active.len(),
            archived = archive.len(),
            "Submission tracker opened"
        );

        Ok(Self {
            db,
            active,
            archive,
        })
    }

    /// Database size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

impl TrackerBackend for SledTracker {
    fn backend_name(&self) -> &'static str {
        "Sled"
    }

    fn load(&self, id: &str) -> Result<Option<Vec<u8>>, TrackerError> {
        Ok(self.active.get(id.as_bytes())?.map(|v| v.to_vec()))
    }

    fn compare_and_swap(
        &self,
        id: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<bool, TrackerError> {
        let swapped = self.active.compare_and_swap(id.as_bytes(), expected, new)?;
        Ok(swapped.is_ok())
    }

    fn scan_active(&self) -> Result<Vec<Vec<u8>>, TrackerError> {
        self.active
            .iter()
            .values()
            .map(|v| v.map(|bytes| bytes.to_vec()).map_err(TrackerError::from))
            .collect()
    }

    fn store_archived(&self, id: &str, record: Vec<u8>) -> Result<(), TrackerError> {
        self.archive.insert(id.as_bytes(), record)?;
        Ok(())
    }

    fn load_archived(&self, id: &str) -> Result<Option<Vec<u8>>, TrackerError> {
        Ok(self.archive.get(id.as_bytes())?.map(|v| v.to_vec()))
    }

    fn scan_archived(&self) -> Result<Vec<(String, Vec<u8>)>, TrackerError> {
        self.archive
            .iter()
            .map(|item| {
                let (key, value) = item?;
                Ok((String::from_utf8_lossy(&key).into_owned(), value.to_vec()))
            })
            .collect()
    }

    fn remove_archived(&self, id: &str) -> Result<(), TrackerError> {
        self.archive.remove(id.as_bytes())?;
        Ok(())
    }

    fn counts(&self) -> Result<(usize, usize), TrackerError> {
        Ok((self.active.len(), self.archive.len()))
    }

    fn flush(&self) -> Result<(), TrackerError> {
        self.db.flush()?;
        Ok(())
    }
}
