use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::Result;
use crate::fsutil::{remove_if_exists, write_atomic};
use crate::topology::StackPlan;

/// The plan of the stack that is currently running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub plan: StackPlan,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn save(&self, plan: &StackPlan) -> Result<Session> {
        let session = Session {
            plan: plan.clone(),
            started_at: Utc::now(),
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&session)?)?;
        Ok(session)
    }

    pub fn load(&self) -> Option<Session> {
        let content = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice(&content) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring unreadable session record");
                None
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.path)?;
        Ok(())
    }
}
