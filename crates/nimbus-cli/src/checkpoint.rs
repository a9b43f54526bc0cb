use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

const RECORD_FILE: &str = "checkpoint.json";
const SCRATCH_DIR: &str = "scratch";
const LOCK_FILE: &str = ".lock";
const LOCK_WAIT: Duration = Duration::from_secs(15);

/// Target storage bucket, as reported by the dataset-create response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetCenter {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Persisted resume state for one in-progress upload, keyed by fingerprint.
///
/// Created on the first attempt, rewritten with `consumed_bytes` on every
/// progress tick, and deleted only after the control plane has acknowledged
/// the dataset as uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub dataset_center: DatasetCenter,
    pub uploader_id: String,
    pub consumed_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn open_default() -> Result<Self> {
        Ok(Self {
            root: crate::config::config_root()?,
        })
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self, fingerprint: &str) -> PathBuf {
        self.root.join(format!("upload_checkpoint_{fingerprint}"))
    }

    pub fn record_path(&self, fingerprint: &str) -> PathBuf {
        self.dir(fingerprint).join(RECORD_FILE)
    }

    /// Directory reserved for the storage backend's own resume bookkeeping.
    pub fn scratch_dir(&self, fingerprint: &str) -> PathBuf {
        self.dir(fingerprint).join(SCRATCH_DIR)
    }

    /// Missing and unparsable records both mean "start fresh". A corrupt
    /// checkpoint must never block a new upload.
    pub fn load(&self, fingerprint: &str) -> Result<Option<Checkpoint>> {
        let path = self.record_path(fingerprint);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "checkpoint unreadable, starting fresh");
                return Ok(None);
            }
        };
        match serde_json::from_str::<Checkpoint>(&raw) {
            Ok(cp) => Ok(Some(cp)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "checkpoint corrupt, starting fresh");
                Ok(None)
            }
        }
    }

    pub fn save(&self, fingerprint: &str, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.record_path(fingerprint);
        let body = serde_json::to_string(checkpoint)?;
        atomic_write_text(&path, &body)
    }

    /// Removes the record plus any backend scratch state. Only finalization
    /// calls this; an absent directory already counts as deleted.
    pub fn delete(&self, fingerprint: &str) -> Result<()> {
        let dir = self.dir(fingerprint);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::msg(format!(
                "failed to remove checkpoint dir {}: {e}",
                dir.display()
            ))),
        }
    }

    /// Serialises invocations working on the same fingerprint. The guard
    /// removes the lock file when dropped.
    pub fn lock(&self, fingerprint: &str) -> Result<CheckpointGuard> {
        let path = self.dir(fingerprint).join(LOCK_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        let deadline = Instant::now() + LOCK_WAIT;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(CheckpointGuard { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::msg(format!(
                            "another upload for this file is in progress (lock: {})",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(Error::msg(format!(
                        "failed to acquire checkpoint lock {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }
}

pub struct CheckpointGuard {
    path: PathBuf,
}

impl Drop for CheckpointGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// A crash mid-write must leave either the old record or the new one on
// disk, never a truncated file.
pub(crate) fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::msg(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        Checkpoint {
            id: "abc-123".into(),
            dataset_center: DatasetCenter {
                bucket: "nimbus-datasets".into(),
                endpoint: None,
            },
            uploader_id: "42".into(),
            consumed_bytes: 524_288,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::with_root(tmp.path());
        let cp = sample();
        store.save("fp1", &cp).unwrap();
        assert_eq!(store.load("fp1").unwrap(), Some(cp));
    }

    #[test]
    fn missing_record_loads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::with_root(tmp.path());
        assert_eq!(store.load("nope").unwrap(), None);
    }

    #[test]
    fn corrupt_record_loads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::with_root(tmp.path());
        let path = store.record_path("fp1");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();
        assert_eq!(store.load("fp1").unwrap(), None);
    }

    #[test]
    fn save_overwrites_previous_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::with_root(tmp.path());
        let mut cp = sample();
        store.save("fp1", &cp).unwrap();
        cp.consumed_bytes = 1_048_576;
        store.save("fp1", &cp).unwrap();
        assert_eq!(
            store.load("fp1").unwrap().unwrap().consumed_bytes,
            1_048_576
        );
    }

    #[test]
    fn delete_removes_directory_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::with_root(tmp.path());
        store.save("fp1", &sample()).unwrap();
        fs::create_dir_all(store.scratch_dir("fp1")).unwrap();
        store.delete("fp1").unwrap();
        assert!(!store.dir("fp1").exists());
        store.delete("fp1").unwrap();
    }

    #[test]
    fn fingerprints_are_namespaced() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::with_root(tmp.path());
        store.save("fp1", &sample()).unwrap();
        store.delete("fp2").unwrap();
        assert!(store.load("fp1").unwrap().is_some());
    }

    #[test]
    fn lock_can_be_retaken_after_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::with_root(tmp.path());
        let guard = store.lock("fp1").unwrap();
        drop(guard);
        let _again = store.lock("fp1").unwrap();
    }
}
