//! Step-indexed experience snapshots on disk.
//!
//! Layout: `<root>/<experiment>/step_<k>/experiences.json`, where snapshot `k`
//! is the bank after `k` completed steps. Snapshots are write-once; resuming
//! means loading the highest `k` and continuing from there.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{KernelError, Result};
use crate::experience::ExperienceBank;

const STEP_PREFIX: &str = "step_";
const EXPERIENCES_FILE: &str = "experiences.json";

/// An immutable, step-indexed experience bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub step: usize,
    pub bank: Arc<ExperienceBank>,
}

impl Snapshot {
    pub fn new(step: usize, bank: ExperienceBank) -> Self {
        Self {
            step,
            bank: Arc::new(bank),
        }
    }

    /// The empty bank every fresh run starts from.
    pub fn initial() -> Self {
        Self::new(0, ExperienceBank::new())
    }
}

/// Reads and writes snapshots for one experiment.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Store rooted at `<root>/<experiment>`.
    pub fn new(root: impl AsRef<Path>, experiment: &str) -> Self {
        Self {
            dir: root.as_ref().join(experiment),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn step_dir(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{STEP_PREFIX}{step}"))
    }

    /// Persist a snapshot. Fails if that step was already written.
    pub fn save(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let step_dir = self.step_dir(snapshot.step);
        let path = step_dir.join(EXPERIENCES_FILE);
        if path.exists() {
            return Err(KernelError::SnapshotExists { path });
        }

        write_json(&step_dir, EXPERIENCES_FILE, snapshot.bank.as_ref())?;
        info!(
            step = snapshot.step,
            experiences = snapshot.bank.len(),
            path = %path.display(),
            "Saved experience snapshot"
        );
        Ok(path)
    }

    /// Write an auxiliary JSON artifact (step report, etc.) next to a snapshot.
    pub fn write_artifact<T: Serialize>(
        &self,
        step: usize,
        name: &str,
        value: &T,
    ) -> Result<PathBuf> {
        write_json(&self.step_dir(step), name, value)
    }

    /// Load the snapshot for a specific step.
    pub fn load(&self, step: usize) -> Result<Snapshot> {
        let path = self.step_dir(step).join(EXPERIENCES_FILE);
        if !path.exists() {
            return Err(KernelError::SnapshotNotFound { path });
        }

        let json = fs::read_to_string(&path).map_err(|source| KernelError::Io {
            path: path.clone(),
            source,
        })?;
        let bank: ExperienceBank =
            serde_json::from_str(&json).map_err(|source| KernelError::Format {
                path: path.clone(),
                source,
            })?;

        debug!(step, experiences = bank.len(), "Loaded experience snapshot");
        Ok(Snapshot::new(step, bank))
    }

    /// Highest step that has a persisted `experiences.json`, if any.
    pub fn latest_step(&self) -> Result<Option<usize>> {
        if !self.dir.exists() {
            return Ok(None);
        }

        let entries = fs::read_dir(&self.dir).map_err(|source| KernelError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let latest = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(EXPERIENCES_FILE).is_file())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix(STEP_PREFIX))
                    .and_then(|idx| idx.parse::<usize>().ok())
            })
            .max();

        Ok(latest)
    }

    /// Load the highest-indexed snapshot, if any exists.
    pub fn load_latest(&self) -> Result<Option<Snapshot>> {
        match self.latest_step()? {
            Some(step) => self.load(step).map(Some),
            None => Ok(None),
        }
    }

    /// Load the highest-indexed snapshot, failing if there is none.
    pub fn require_latest(&self) -> Result<Snapshot> {
        self.load_latest()?.ok_or_else(|| KernelError::SnapshotNotFound {
            path: self.dir.clone(),
        })
    }
}

fn write_json<T: Serialize + ?Sized>(dir: &Path, name: &str, value: &T) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|source| KernelError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(name);
    let tmp = dir.join(format!("{name}.tmp"));
    let json = serde_json::to_string_pretty(value).map_err(|source| KernelError::Format {
        path: path.clone(),
        source,
    })?;

    fs::write(&tmp, json)
        .and_then(|_| fs::rename(&tmp, &path))
        .map_err(|source| KernelError::Io {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}
