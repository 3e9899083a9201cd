use crate::backend::SettingsStore;
use crate::errors;
use anyhow::Context;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Key/value settings persisted as a flat YAML mapping.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    values: BTreeMap<String, String>,
    dirty: bool,
}

impl FileSettings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let values = match std::fs::read_to_string(path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => match serde_yaml::from_str::<BTreeMap<String, String>>(&contents) {
                Ok(values) => values,
                Err(parse_error) => {
                    let backup_path = path.with_extension("yaml.bak");
                    if let Err(e) = std::fs::copy(path, &backup_path) {
                        tracing::warn!("Failed to create backup of corrupted settings: {}", e);
                    }
                    tracing::error!(
                        "{}",
                        errors::settings::corrupted(
                            &path.display().to_string(),
                            &backup_path.display().to_string(),
                            &parse_error.to_string(),
                        )
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| {
                    errors::settings::failed_to_read(&path.display().to_string())
                });
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            values,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for FileSettings {
    fn get(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn set(&mut self, key: &str, value: &str) {
        if self.values.get(key).map(String::as_str) != Some(value) {
            self.values.insert(key.to_string(), value.to_string());
            self.dirty = true;
        }
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if !self.dirty && self.path.exists() {
            return Ok(());
        }

        let yaml = serde_yaml::to_string(&self.values).context(errors::settings::FAILED_TO_SERIALIZE)?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| errors::settings::failed_to_write(&parent.display().to_string()))?;

        let tmp_path = self.path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, yaml.as_bytes())
            .with_context(|| errors::settings::failed_to_write(&tmp_path.display().to_string()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| errors::settings::failed_to_write(&self.path.display().to_string()))?;

        self.dirty = false;
        Ok(())
    }
}

/// Settings that live only as long as the process. Clones share the same
/// values, so a test can keep one handle while the controller owns another.
#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    inner: Arc<Mutex<MemoryValues>>,
}

#[derive(Debug, Default)]
struct MemoryValues {
    values: BTreeMap<String, String>,
    flushed: BTreeMap<String, String>,
    flushes: usize,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(self, key: &str, value: &str) -> Self {
        {
            let mut inner = self.lock();
            inner.values.insert(key.to_string(), value.to_string());
            inner.flushed = inner.values.clone();
        }
        self
    }

    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    /// Value as of the last flush, i.e. what a restart would see.
    pub fn persisted(&self, key: &str) -> Option<String> {
        self.lock().flushed.get(key).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryValues> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str, default: &str) -> String {
        self.lock()
            .values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn set(&mut self, key: &str, value: &str) {
        self.lock()
            .values
            .insert(key.to_string(), value.to_string());
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        let mut inner = self.lock();
        inner.flushed = inner.values.clone();
        inner.flushes += 1;
        Ok(())
    }
}
