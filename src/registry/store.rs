//! registry/store.rs
//!
//! Full-state JSON snapshots of the registry. Every write lands in a temp file
//! next to the target and is renamed over it, so a crash mid-write leaves the
//! previous snapshot intact.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use thiserror::Error;

use super::allocation::Allocation;
use crate::shared_types::ClientId;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub(crate) const STATE_FILE_VERSION: u32 = 1;

// -----------------------------------------------------------------------------
// ----- StateStore ------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct StateStore {
    path: PathBuf,
    // Generation of the snapshot currently on disk.
    written: Mutex<u64>,
}

impl StateStore {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Mutex::new(0),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no snapshot exists yet.
    pub(crate) fn load(&self) -> Result<Option<StateFile>, RegistryError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RegistryError::Io {
                    path: self.path.clone(),
                    source: e,
                });
            }
        };

        let file = serde_json::from_slice(&raw).map_err(|e| RegistryError::Json { source: e })?;
        Ok(Some(file))
    }

    /// Writes `bytes` unless a newer generation already reached disk.
    /// Returns whether this call wrote the file.
    pub(crate) fn write(&self, generation: u64, bytes: &[u8]) -> Result<bool, RegistryError> {
        let mut written = self.written.lock();
        if generation <= *written {
            return Ok(false);
        }

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let io_err = |source: io::Error| RegistryError::Io {
            path: self.path.clone(),
            source,
        };

        fs::create_dir_all(&dir).map_err(io_err)?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        *written = generation;
        Ok(true)
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format (read) ---------------------------------------

/// Tolerant reader: every field may be missing, unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct StateFile {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub allocations: HashMap<String, StoredAllocation>,
    #[serde(default)]
    pub stats: RegistryCounters,
    #[serde(default)]
    pub saved_at: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StoredAllocation {
    #[serde(default)]
    pub id: Option<ClientId>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub allocated_at: Option<f64>,
    #[serde(default)]
    pub allocated_by: Option<String>,
    #[serde(default)]
    pub last_seen: Option<f64>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub use_count: u64,
}

fn default_active() -> bool {
    true
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format (write) --------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct StateSnapshot<'a> {
    pub version: u32,
    pub allocations: BTreeMap<String, &'a Allocation>,
    pub stats: &'a RegistryCounters,
    pub saved_at: f64,
}

/// Lifetime counters persisted alongside the allocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryCounters {
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub stale_reclaimed: u64,
    pub exhausted: u64,
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("state file io error for {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },

    #[error("state file json error: {source}")]
    Json { source: serde_json::Error },

    #[error("registry has no state file configured")]
    NoStateFile,
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
