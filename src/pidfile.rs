//! Per-component PID records (`userdata/pids/<module>.json`).
//!
//! A record outlives the supervisor process so a later invocation can adopt
//! the running server, after checking the PID still belongs to the same executable.

use std::path::PathBuf;

use crate::error::Result;
use crate::fsutil::{remove_if_exists, write_atomic};
use crate::module::ModuleKind;
use crate::runner::ProcessHandle;

#[derive(Debug, Clone)]
pub struct PidRecordStore {
    dir: PathBuf,
}

impl PidRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, kind: ModuleKind) -> PathBuf {
        self.dir.join(format!("{}.json", kind.as_str()))
    }

    pub fn save(&self, handle: &ProcessHandle) -> Result<()> {
        let content = serde_json::to_vec_pretty(handle)?;
        write_atomic(&self.path(handle.owner), &content)?;
        tracing::trace!(component = %handle.owner, pid = handle.pid, "Saved PID record");
        Ok(())
    }

    /// Read a record. Malformed records are discarded.
    pub fn load(&self, kind: ModuleKind) -> Option<ProcessHandle> {
        let path = self.path(kind);
        let content = std::fs::read(&path).ok()?;
        match serde_json::from_slice::<ProcessHandle>(&content) {
            Ok(handle) if handle.owner == kind => Some(handle),
            Ok(_) | Err(_) => {
                tracing::warn!(path = %path.display(), "Discarding malformed PID record");
                if let Err(e) = remove_if_exists(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove PID record");
                }
                None
            }
        }
    }

    pub fn remove(&self, kind: ModuleKind) -> Result<()> {
        remove_if_exists(&self.path(kind))?;
        Ok(())
    }
}
