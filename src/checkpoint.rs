//! Checkpoint images on disk and the tool that produces them
//!
//! Layout under the images root:
//!
//! ```text
//! checkpoint.json          pointer record {id, pid, status}
//! <id>/                    image directory written by `criu dump`
//! ```
//!
//! At most one image is referenced by the pointer at any time. The pointer is
//! replaced atomically (write then rename) and always rewritten before the
//! directory it used to reference is removed, so it never names a missing
//! directory.

use crate::config::CheckpointConfig;
use crate::error::CheckpointError;
use crate::lifecycle::Status;
use crate::logtail;
use crate::process::{ProcessLauncher, SpawnRequest, SpawnedProcess, UNKNOWN_EXIT_CODE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File name of the pointer record
pub const POINTER_FILE: &str = "checkpoint.json";

/// Contents of the pointer record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Image directory name
    pub id: String,
    /// Pid of the dumped process; restore brings it back under the same pid
    pub pid: u32,
    /// Backend status at the moment the stop began
    pub status: Status,
}

/// A committed image, resolved to its directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointImage {
    pub id: String,
    pub path: PathBuf,
    pub pid: u32,
    pub saved_status: Status,
}

/// Pointer record and image directories under one root
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pointer_path(&self) -> PathBuf {
        self.root.join(POINTER_FILE)
    }

    pub fn image_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Read the pointer record.
    ///
    /// A missing record means there is no image. A record whose directory is
    /// gone is treated the same way, with a warning.
    pub async fn load(&self) -> Result<Option<CheckpointImage>, CheckpointError> {
        let path = self.pointer_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::io(path, e)),
        };
        let record: CheckpointRecord = serde_json::from_slice(&bytes)
            .map_err(|source| CheckpointError::Record { path, source })?;

        let image = self.resolve(record);
        match tokio::fs::metadata(&image.path).await {
            Ok(_) => Ok(Some(image)),
            Err(e) => {
                let err = CheckpointError::io(&image.path, e);
                if !err.is_not_found() {
                    return Err(err);
                }
                warn!(id = %image.id, "Checkpoint record names a missing image directory, ignoring it");
                Ok(None)
            }
        }
    }

    /// Create a fresh, empty image directory named after the current time
    pub async fn prepare(&self) -> Result<(String, PathBuf), CheckpointError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CheckpointError::io(&self.root, e))?;

        let base = chrono::Utc::now().timestamp_millis();
        for attempt in 0..16 {
            let id = if attempt == 0 {
                base.to_string()
            } else {
                format!("{}-{}", base, attempt)
            };
            let dir = self.image_dir(&id);
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => {
                    debug!(id = %id, "Prepared checkpoint directory");
                    return Ok((id, dir));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(CheckpointError::io(dir, e)),
            }
        }
        Err(CheckpointError::io(
            self.image_dir(&base.to_string()),
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "no free image directory name"),
        ))
    }

    /// Point the record at a dumped image
    pub async fn commit(&self, record: CheckpointRecord) -> Result<CheckpointImage, CheckpointError> {
        let path = self.pointer_path();
        let tmp = self.root.join(format!("{}.tmp", POINTER_FILE));
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|source| CheckpointError::Record { path: path.clone(), source })?;

        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| CheckpointError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CheckpointError::io(&path, e))?;

        info!(id = %record.id, pid = record.pid, status = %record.status, "Checkpoint committed");
        Ok(self.resolve(record))
    }

    /// Delete an image, dropping the pointer first if it still names it
    pub async fn remove(&self, image: &CheckpointImage) -> Result<(), CheckpointError> {
        if let Some(current) = self.read_record().await? {
            if current.id == image.id {
                let path = self.pointer_path();
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(CheckpointError::io(path, e)),
                }
            }
        }
        self.discard_dir(&image.path).await?;
        info!(id = %image.id, "Checkpoint image removed");
        Ok(())
    }

    /// Delete an image directory that no record references
    pub async fn discard_dir(&self, dir: &Path) -> Result<(), CheckpointError> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::io(dir, e)),
        }
    }

    async fn read_record(&self) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = self.pointer_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| CheckpointError::Record { path, source }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CheckpointError::io(path, e)),
        }
    }

    fn resolve(&self, record: CheckpointRecord) -> CheckpointImage {
        CheckpointImage {
            path: self.image_dir(&record.id),
            id: record.id,
            pid: record.pid,
            saved_status: record.status,
        }
    }
}

/// The external checkpoint/restore utility
#[async_trait]
pub trait CheckpointTool: Send + Sync {
    /// Dump the process tree rooted at `pid` into `images_dir`; returns the exit code
    async fn dump(&self, pid: u32, images_dir: &Path) -> anyhow::Result<i32>;

    /// Start restoring from `images_dir`. The returned process lives as long
    /// as the restored tree and reports its exit code.
    async fn restore(&self, images_dir: &Path) -> anyhow::Result<SpawnedProcess>;
}

/// Runs the `criu` binary
pub struct Criu {
    binary: String,
    launcher: Arc<dyn ProcessLauncher>,
}

impl Criu {
    pub fn new(binary: impl Into<String>, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            binary: binary.into(),
            launcher,
        }
    }
}

pub fn dump_args(pid: u32, images_dir: &Path) -> Vec<String> {
    vec![
        "dump".to_string(),
        "--tree".to_string(),
        pid.to_string(),
        "--images-dir".to_string(),
        images_dir.display().to_string(),
        "--shell-job".to_string(),
        "--ext-unix-sk".to_string(),
        "-o".to_string(),
        "dump.log".to_string(),
    ]
}

pub fn restore_args(images_dir: &Path) -> Vec<String> {
    vec![
        "restore".to_string(),
        "--images-dir".to_string(),
        images_dir.display().to_string(),
        "--shell-job".to_string(),
        "-o".to_string(),
        "restore.log".to_string(),
    ]
}

#[async_trait]
impl CheckpointTool for Criu {
    async fn dump(&self, pid: u32, images_dir: &Path) -> anyhow::Result<i32> {
        let request = SpawnRequest::new(&self.binary, dump_args(pid, images_dir));
        let process = self.launcher.spawn(&request).await?;
        if let Some(output) = process.output {
            drop(logtail::lines_from_reader(output));
        }
        let code = process.exit.await.unwrap_or(UNKNOWN_EXIT_CODE);
        debug!(pid, code, "criu dump finished");
        Ok(code)
    }

    async fn restore(&self, images_dir: &Path) -> anyhow::Result<SpawnedProcess> {
        let mut request = SpawnRequest::new(&self.binary, restore_args(images_dir));
        // --shell-job restores onto the caller's terminal
        request.pty = true;
        self.launcher.spawn(&request).await
    }
}

/// Everything the lifecycle needs to hibernate
#[derive(Clone)]
pub struct Checkpointing {
    pub tool: Arc<dyn CheckpointTool>,
    pub store: CheckpointStore,
}

impl Checkpointing {
    /// Build from config, or `None` when hibernation is disabled
    pub fn from_config(
        config: &CheckpointConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self {
            tool: Arc::new(Criu::new(&config.criu_path, launcher)),
            store: CheckpointStore::new(&config.images_dir),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> CheckpointRecord {
        CheckpointRecord {
            id: id.to_string(),
            pid: 4242,
            status: Status::Online,
        }
    }

    #[tokio::test]
    async fn test_load_without_record_is_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("missing"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prepare_commit_load() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());

        let (id, path) = store.prepare().await.unwrap();
        assert!(path.is_dir());

        let committed = store.commit(record(&id)).await.unwrap();
        assert_eq!(committed.path, path);

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, committed);
        assert_eq!(loaded.pid, 4242);
        assert_eq!(loaded.saved_status, Status::Online);

        let raw = std::fs::read_to_string(store.pointer_path()).unwrap();
        assert!(raw.contains("\"ONLINE\""));
        assert!(!dir.path().join("checkpoint.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_prepare_never_reuses_a_directory() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (first, _) = store.prepare().await.unwrap();
        let (second, _) = store.prepare().await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_record_for_missing_directory_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let (id, path) = store.prepare().await.unwrap();
        store.commit(record(&id)).await.unwrap();
        std::fs::remove_dir_all(path).unwrap();

        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreadable_image_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        // A file where a directory component should be gives ENOTDIR, not NotFound
        std::fs::write(dir.path().join("blocker"), "").unwrap();
        store.commit(record("blocker/image")).await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Io { .. }));
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        std::fs::write(store.pointer_path(), "{not json").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, CheckpointError::Record { .. }));
    }

    #[tokio::test]
    async fn test_remove_drops_pointer_only_when_it_matches() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());

        let (old_id, _) = store.prepare().await.unwrap();
        let old = store.commit(record(&old_id)).await.unwrap();
        let (new_id, _) = store.prepare().await.unwrap();
        let new = store.commit(record(&new_id)).await.unwrap();

        store.remove(&old).await.unwrap();
        assert!(!old.path.exists());
        assert_eq!(store.load().await.unwrap(), Some(new.clone()));

        store.remove(&new).await.unwrap();
        assert!(!new.path.exists());
        assert!(!store.pointer_path().exists());
        assert!(store.load().await.unwrap().is_none());

        // Removing twice is harmless
        store.remove(&new).await.unwrap();
    }

    #[test]
    fn test_criu_arguments() {
        let dir = Path::new("/srv/checkpoints/1700000000000");
        assert_eq!(
            dump_args(77, dir).join(" "),
            "dump --tree 77 --images-dir /srv/checkpoints/1700000000000 --shell-job --ext-unix-sk -o dump.log"
        );
        assert_eq!(
            restore_args(dir).join(" "),
            "restore --images-dir /srv/checkpoints/1700000000000 --shell-job -o restore.log"
        );
    }

    #[test]
    fn test_checkpointing_disabled_by_default() {
        let launcher: Arc<dyn ProcessLauncher> = Arc::new(crate::process::SystemLauncher);
        assert!(Checkpointing::from_config(&CheckpointConfig::default(), launcher.clone()).is_none());

        let config = CheckpointConfig {
            enabled: true,
            ..Default::default()
        };
        let checkpointing = Checkpointing::from_config(&config, launcher).unwrap();
        assert_eq!(checkpointing.store.root(), Path::new("./checkpoints"));
    }
}
