//! Single-flight guard for merge passes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::storage::{FileLock, JobGuard, RecordStore};

use super::MergeError;

const MERGE_LOCK_FILE: &str = "merge.lock";

/// Allows at most one merge pass per store at a time.
///
/// The in-process half lives on the store, so every engine sharing a store
/// instance contends for the same slot. The cross-process half is an advisory
/// file lock in the configured directory, or next to the store's own files
/// when the store has any.
#[derive(Debug, Default)]
pub struct MergeLock {
    dir: Option<PathBuf>,
}

/// Held for the duration of one pass.
#[derive(Debug)]
pub struct MergeGuard<'s> {
    _slot: JobGuard<'s>,
    _file: Option<FileLock>,
}

impl MergeLock {
    /// Lock that takes its file lock in `dir` when one is given.
    #[must_use]
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Directory holding the cross-process lock file, if configured.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn lock_path(&self, store: &dyn RecordStore) -> Option<PathBuf> {
        match &self.dir {
            Some(dir) => Some(dir.join(MERGE_LOCK_FILE)),
            None => store.merge_lock_file(),
        }
    }

    /// Acquires the pass lock for `store` without blocking.
    ///
    /// # Errors
    /// - [`MergeError::AlreadyRunning`] if another pass holds it
    /// - [`MergeError::Lock`] if the lock file cannot be created
    pub fn try_acquire<'s>(&self, store: &'s dyn RecordStore) -> Result<MergeGuard<'s>, MergeError> {
        let slot = store.merge_slot().try_enter().ok_or(MergeError::AlreadyRunning)?;

        let file = match self.lock_path(store) {
            Some(path) => Some(FileLock::acquire_path(&path).map_err(|e| {
                if e.kind() == ErrorKind::WouldBlock {
                    MergeError::AlreadyRunning
                } else {
                    MergeError::Lock(format!("{}: {e}", path.display()))
                }
            })?),
            None => None,
        };

        Ok(MergeGuard {
            _slot: slot,
            _file: file,
        })
    }
}
