//! Durable checkpoint persistence
//!
//! One JSON record at a fixed path. Writes go to a temp file in the same
//! directory and are renamed over the record, so readers only ever see a
//! complete old or complete new checkpoint.
//!
//! Two write modes exist:
//!
//! - [`CheckpointStore::save`] is an unconditional overwrite (last writer wins).
//! - [`CheckpointStore::save_if`] is a compare-and-swap on the `revision`
//!   counter, serialized by an advisory lock on `<record>.lock`. Both the engine
//!   and the intervention commands use it, so neither silently discards the
//!   other's edits.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::checkpoint::{Checkpoint, SCHEMA_VERSION};

/// How many times [`CheckpointStore::update`] retries after losing a race
pub const MAX_CAS_ATTEMPTS: usize = 5;

/// Errors raised while writing the checkpoint.
///
/// Reads never fail: an unreadable record is reported as absent.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to write checkpoint {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("checkpoint revision conflict: expected {expected}, found {found} on disk")]
    Conflict { expected: u64, found: u64 },

    #[error("checkpoint is still contended after {attempts} attempts")]
    Contended { attempts: usize },

    #[error("no checkpoint at {}", .0.display())]
    Missing(PathBuf),
}

/// Handle to the persisted checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn write_error(&self, source: io::Error) -> StoreError {
        StoreError::Write {
            path: self.path.clone(),
            source,
        }
    }

    /// Load the checkpoint.
    ///
    /// Returns `None` when no record exists, when it cannot be read or parsed,
    /// or when it was written by a newer schema. Corruption means "no prior
    /// progress", never an error.
    pub fn load(&self) -> Option<Checkpoint> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), "Failed to read checkpoint, starting fresh: {e}");
                return None;
            }
        };

        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(cp) if cp.schema_version > SCHEMA_VERSION => {
                warn!(
                    path = %self.path.display(),
                    found = cp.schema_version,
                    supported = SCHEMA_VERSION,
                    "Checkpoint written by a newer schema, starting fresh"
                );
                None
            }
            Ok(cp) => Some(cp),
            Err(e) => {
                warn!(path = %self.path.display(), "Checkpoint is unparsable, starting fresh: {e}");
                None
            }
        }
    }

    /// Overwrite the record unconditionally.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.write_atomic(checkpoint)
    }

    /// Compare-and-swap save.
    ///
    /// Succeeds only if the on-disk revision still equals `checkpoint.revision`
    /// (an absent or unreadable record always matches). On success the revision
    /// is bumped in both the record and `checkpoint`.
    pub fn save_if(&self, checkpoint: &mut Checkpoint) -> Result<(), StoreError> {
        let _lock = self.lock()?;

        if let Some(found) = self.load().map(|cp| cp.revision)
            && found != checkpoint.revision
        {
            return Err(StoreError::Conflict {
                expected: checkpoint.revision,
                found,
            });
        }

        checkpoint.revision += 1;
        if let Err(e) = self.write_atomic(checkpoint) {
            checkpoint.revision -= 1;
            return Err(e);
        }
        debug!(revision = checkpoint.revision, "Checkpoint saved");
        Ok(())
    }

    /// Read-modify-write with compare-and-swap, retrying when another writer
    /// got in between. Returns the checkpoint as persisted.
    pub fn update<F>(&self, mut mutate: F) -> Result<Checkpoint, StoreError>
    where
        F: FnMut(&mut Checkpoint),
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let mut checkpoint = self
                .load()
                .ok_or_else(|| StoreError::Missing(self.path.clone()))?;
            mutate(&mut checkpoint);
            checkpoint.touch();

            match self.save_if(&mut checkpoint) {
                Ok(()) => return Ok(checkpoint),
                Err(StoreError::Conflict { expected, found }) => {
                    debug!(attempt, expected, found, "Lost checkpoint race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Contended {
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Remove the record. Succeeds if it is already gone.
    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.write_error(e)),
        }
    }

    fn lock(&self) -> Result<File, StoreError> {
        fs::create_dir_all(self.parent_dir()).map_err(|e| self.write_error(e))?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
            .map_err(|e| self.write_error(e))?;
        FileExt::lock_exclusive(&file).map_err(|e| self.write_error(e))?;
        // Released when the handle is dropped
        Ok(file)
    }

    fn write_atomic(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let parent = self.parent_dir();
        fs::create_dir_all(parent).map_err(|e| self.write_error(e))?;

        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| self.write_error(e))?;
        tmp.write_all(&bytes).map_err(|e| self.write_error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.write_error(e))?;
        tmp.persist(&self.path)
            .map_err(|e| self.write_error(e.error))?;
        Ok(())
    }
}
