//! Modification-time polling for local database files.

use crate::config::REMOTE_CATALOG_PREFIX;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::debug;

/// Detects when a local database file has been modified since it was last seen.
///
/// In-memory and MotherDuck targets are never watched. Stat failures count as
/// "no update" so a flaky filesystem does not cause reconnect storms.
#[derive(Debug, Clone)]
pub struct FileWatcher {
    path: PathBuf,
    is_local_file: bool,
    last_modified: SystemTime,
}

impl FileWatcher {
    /// Watch `path`, treating anything modified before now as already seen.
    pub fn new(path: &str) -> Self {
        Self::with_baseline(path, SystemTime::now())
    }

    pub fn with_baseline(path: &str, last_modified: SystemTime) -> Self {
        let is_local_file = !(path.starts_with(REMOTE_CATALOG_PREFIX) || path.is_empty());
        Self {
            path: PathBuf::from(path),
            is_local_file,
            last_modified,
        }
    }

    pub fn is_local_file(&self) -> bool {
        self.is_local_file
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    /// Put back a previously observed modification time, e.g. after a failed reload,
    /// so the same change is reported again.
    pub fn restore(&mut self, last_modified: SystemTime) {
        self.last_modified = last_modified;
    }

    /// Return true when the file's modification time is strictly newer than the last
    /// one observed, recording the new time.
    pub fn has_update(&mut self) -> bool {
        if !self.is_local_file {
            return false;
        }

        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Could not stat database file");
                return false;
            }
        };

        if modified > self.last_modified {
            debug!(path = %self.path.display(), "Database file modified");
            self.last_modified = modified;
            return true;
        }

        false
    }
}
