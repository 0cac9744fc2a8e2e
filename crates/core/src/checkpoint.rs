//! Filesystem-backed key/value checkpoint store.
//!
//! One JSON file per key under the checkpoint directory. Keys follow
//! `session:{id}:step:{n}`; a special `restart_pending` key survives process
//! restarts and triggers resumption.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::StepResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPending {
    pub reason: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn default_dir() -> PathBuf {
        triad_config::Config::data_dir().join("checkpoints")
    }

    fn key_path(&self, key: &str) -> PathBuf {
        // Keys contain ':' separators; keep filenames portable.
        self.dir.join(format!("{}.json", key.replace(':', "_")))
    }

    fn put(&self, key: &str, value: &impl Serialize) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.key_path(key);
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;
        Ok(())
    }

    fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        let path = self.key_path(key);
        let json = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&json).ok()
    }

    /// Persist a step result. Called after every executed step.
    pub fn checkpoint_step(&self, session_id: &str, step_n: u32, result: &StepResult) -> Result<()> {
        self.put(&format!("session:{session_id}:step:{step_n}"), result)
    }

    /// All persisted step results for a session, ordered by step id
    /// (plan step ids are 1-based and consecutive).
    pub fn load_steps(&self, session_id: &str) -> Vec<StepResult> {
        let mut steps = Vec::new();
        let mut n = 1u32;
        loop {
            match self.get::<StepResult>(&format!("session:{session_id}:step:{n}")) {
                Some(result) => {
                    steps.push(result);
                    n += 1;
                }
                None => break,
            }
        }
        steps
    }

    pub fn set_restart_pending(&self, session_id: &str, reason: &str) -> Result<()> {
        self.put(
            "restart_pending",
            &RestartPending {
                reason: reason.to_string(),
                session_id: session_id.to_string(),
                timestamp: Utc::now(),
            },
        )
    }

    /// Read and clear the restart flag.
    pub fn take_restart_pending(&self) -> Option<RestartPending> {
        let pending: RestartPending = self.get("restart_pending")?;
        let _ = std::fs::remove_file(self.key_path("restart_pending"));
        Some(pending)
    }

    pub fn clear_session(&self, session_id: &str) {
        let mut n = 1u32;
        loop {
            let path = self.key_path(&format!("session:{session_id}:step:{n}"));
            if !path.exists() {
                break;
            }
            let _ = std::fs::remove_file(path);
            n += 1;
        }
    }
}
