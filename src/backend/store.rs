use crate::backend::validator::ValidDocument;
use crate::constants::SUBSCRIPTION_FILE_NAME;
use crate::errors;
use anyhow::Context;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no subscription config stored at {}", path.display())]
    NotFound { path: PathBuf },
    #[error("{message}: {kind}")]
    Io {
        path: PathBuf,
        kind: io::ErrorKind,
        message: String,
    },
}

impl StoreError {
    fn io(path: &Path, error: io::Error, message: String) -> Self {
        let message = if is_disk_full(&error) {
            errors::disk::FULL.to_string()
        } else {
            message
        };
        StoreError::Io {
            path: path.to_path_buf(),
            kind: error.kind(),
            message,
        }
    }
}

fn is_disk_full(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::StorageFull
        || error.to_string().contains("No space left on device")
        || error.to_string().contains("disk full")
}

/// Owns the subscription-derived document on disk.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(data_directory: &Path) -> Self {
        Self {
            path: data_directory.join(SUBSCRIPTION_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    pub async fn read(&self) -> Result<Vec<u8>, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                path: self.path.clone(),
            }),
            Err(e) => Err(StoreError::io(
                &self.path,
                e,
                errors::store::failed_to_read(&self.path.display().to_string()),
            )),
        }
    }

    /// Replaces the stored document. The previous file stays intact unless
    /// the new bytes were fully written and synced.
    pub async fn write(&self, document: &ValidDocument) -> Result<(), StoreError> {
        write_atomic(&self.path, document.raw()).await
    }

    pub fn watch(&self) -> anyhow::Result<StoreWatcher> {
        StoreWatcher::new(&self.path)
    }
}

// Atomic write with temp file
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(|e| {
        StoreError::io(
            parent,
            e,
            errors::store::failed_to_create_dir(&parent.display().to_string()),
        )
    })?;

    let tmp_path = path.with_extension("json.tmp");

    let result = write_and_sync(&tmp_path, bytes).await;
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    fs::rename(&tmp_path, path).await.map_err(|e| {
        StoreError::io(
            path,
            e,
            errors::store::failed_to_rename(
                &tmp_path.display().to_string(),
                &path.display().to_string(),
            ),
        )
    })?;

    tracing::debug!("Wrote {} bytes to {}", bytes.len(), path.display());

    Ok(())
}

async fn write_and_sync(tmp_path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let write_error = |e: io::Error| {
        StoreError::io(
            tmp_path,
            e,
            errors::store::failed_to_write_temp(&tmp_path.display().to_string()),
        )
    };

    let mut file = fs::File::create(tmp_path).await.map_err(write_error)?;
    file.write_all(bytes).await.map_err(write_error)?;
    file.flush().await.map_err(write_error)?;

    #[cfg(unix)]
    file.sync_all().await.map_err(|e| {
        StoreError::io(tmp_path, e, errors::store::FAILED_TO_FSYNC.to_string())
    })?;

    Ok(())
}

/// Reports changes to the stored document made by anyone, including this
/// process. Watches the parent directory so the file may not exist yet.
pub struct StoreWatcher {
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<notify::Result<Event>>,
    file_name: OsString,
}

impl StoreWatcher {
    fn new(path: &Path) -> anyhow::Result<Self> {
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&directory).with_context(|| {
            errors::store::failed_to_create_dir(&directory.display().to_string())
        })?;

        let file_name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| OsString::from(SUBSCRIPTION_FILE_NAME));

        let (tx, rx) = mpsc::channel(10);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.blocking_send(res);
            },
            notify::Config::default(),
        )
        .context(errors::store::FAILED_TO_CREATE_WATCHER)?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .with_context(|| errors::store::failed_to_watch(&directory.display().to_string()))?;

        Ok(Self {
            _watcher: watcher,
            events: rx,
            file_name,
        })
    }

    fn concerns_store(&self, event: &Event) -> bool {
        matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(self.file_name.as_os_str()))
    }

    /// Resolves on the next event touching the stored document. Returns
    /// `None` once the watcher is gone.
    pub async fn next_change(&mut self) -> Option<()> {
        while let Some(result) = self.events.recv().await {
            match result {
                Ok(event) if self.concerns_store(&event) => return Some(()),
                Ok(_) => {}
                Err(e) => tracing::warn!("Config watcher error: {}", e),
            }
        }
        None
    }
}
