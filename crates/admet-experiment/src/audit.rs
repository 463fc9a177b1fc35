//! Append-only JSON-lines audit log of completed rollouts.
//!
//! The log is for offline inspection only. Write failures are logged and
//! swallowed; nothing downstream reads it back.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dataset::Sample;
use crate::rollout::Rollout;

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sample: Sample,
    pub response_text: String,
    pub reward: f64,
    pub correct: bool,
    pub error: Option<f64>,
    pub y_pred: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl From<&Rollout> for AuditRecord {
    fn from(rollout: &Rollout) -> Self {
        Self {
            sample: rollout.sample.clone(),
            response_text: rollout.response_text.clone(),
            reward: rollout.reward,
            correct: rollout.correct,
            error: rollout.error,
            y_pred: rollout.y_pred,
            recorded_at: Utc::now(),
        }
    }
}

/// Line-delimited JSON sink shared by concurrent rollout tasks.
#[derive(Debug)]
pub struct RolloutAuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl RolloutAuditLog {
    /// Open (or create) the log for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create audit directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one rollout. Never fails the caller.
    pub fn record(&self, rollout: &Rollout) {
        if let Err(e) = self.try_record(&AuditRecord::from(rollout)) {
            warn!(path = %self.path.display(), error = %e, "Failed to write rollout audit record");
        }
    }

    fn try_record(&self, record: &AuditRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log lock poisoned"))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}
