use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::PersistedState;
use crate::utils::error::{MonitorError, Result};

/// JSON-file persistence for the run baseline.
///
/// Writes go through a sibling temp file and an atomic rename: a crash
/// mid-save leaves the previously committed state fully intact.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The last persisted state; empty on first run. A corrupt file is
    /// logged and treated as empty rather than aborting the run.
    pub fn load(&self) -> Result<PersistedState> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no prior state, starting empty");
                return Ok(PersistedState::default());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&raw) {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "state file unreadable, starting empty"
                );
                Ok(PersistedState::default())
            }
        }
    }

    /// Durably replace the previous state. Only the orchestrator calls this,
    /// and only after the whole run completed without a fatal error.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.temp_path();
        let serialized = serde_json::to_string_pretty(state)?;
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            MonitorError::State(format!(
                "failed to commit state to {}: {e}",
                self.path.display()
            ))
        })?;

        tracing::info!(
            path = %self.path.display(),
            products = state.snapshot.len(),
            "state saved"
        );
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

/// Exclusive-run guard: only one pipeline may touch the state at a time.
///
/// A concurrent trigger finds the lock file and skips its run; a lock older
/// than the run timeout is presumed left by a crashed run and replaced.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// `Ok(None)` means another run is in progress and this one must skip.
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Option<RunLock>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(Some(RunLock {
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let stale = fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .is_some_and(|age| age > stale_after);

                if stale {
                    tracing::warn!(path = %path.display(), "replacing stale run lock");
                    fs::remove_file(path)?;
                    match fs::OpenOptions::new().write(true).create_new(true).open(path) {
                        Ok(_) => Ok(Some(RunLock {
                            path: path.to_path_buf(),
                        })),
                        Err(_) => Ok(None),
                    }
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove run lock");
        }
    }
}
