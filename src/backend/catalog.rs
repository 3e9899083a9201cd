use crate::backend::ConfigCatalog;
use crate::backend::validator::{ValidDocument, validate};
use crate::errors;
use anyhow::{Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SELECTION_FILE_NAME: &str = "catalog.yaml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedSelection {
    #[serde(default)]
    selected: Option<String>,
}

/// Imported sing-box configs kept as `<name>.json` files in one directory.
/// The selected entry is remembered by name across restarts.
#[derive(Debug)]
pub struct DirectoryCatalog {
    directory: PathBuf,
    entries: Vec<CatalogEntry>,
    current: Option<usize>,
}

impl DirectoryCatalog {
    pub fn open(directory: &Path) -> Result<Self> {
        std::fs::create_dir_all(directory).with_context(|| {
            errors::catalog::failed_to_scan(&directory.display().to_string())
        })?;

        let mut catalog = Self {
            directory: directory.to_path_buf(),
            entries: Vec::new(),
            current: None,
        };
        catalog.refresh()?;

        let selected = catalog.load_selection().selected;
        catalog.current = catalog.resolve(selected.as_deref());

        tracing::info!(
            "Local config catalog at {} has {} entries",
            directory.display(),
            catalog.entries.len()
        );

        Ok(catalog)
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.name == name)
    }

    /// Index of the named entry, or the first entry when the name is unknown.
    /// Only an empty catalog has no current entry.
    fn resolve(&self, name: Option<&str>) -> Option<usize> {
        name.and_then(|name| self.position(name))
            .or_else(|| (!self.entries.is_empty()).then_some(0))
    }

    fn selection_path(&self) -> PathBuf {
        self.directory.join(SELECTION_FILE_NAME)
    }

    fn load_selection(&self) -> PersistedSelection {
        let path = self.selection_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_yaml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable catalog selection {}: {}", path.display(), e);
                PersistedSelection::default()
            }),
            Err(_) => PersistedSelection::default(),
        }
    }

    fn save_selection(&self) -> Result<()> {
        let selection = PersistedSelection {
            selected: self.current_name(),
        };
        let yaml = serde_yaml::to_string(&selection).context(errors::settings::FAILED_TO_SERIALIZE)?;
        let path = self.selection_path();
        write_replacing(&path, yaml.as_bytes())
            .with_context(|| errors::settings::failed_to_write(&path.display().to_string()))
    }

    fn scan(&self) -> Result<Vec<CatalogEntry>> {
        let read_dir = std::fs::read_dir(&self.directory).with_context(|| {
            errors::catalog::failed_to_scan(&self.directory.display().to_string())
        })?;

        Ok(read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let name = path.file_stem()?.to_str()?.to_string();
                Some(CatalogEntry { name, path })
            })
            .sorted_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .collect())
    }
}

/// Reads a file offered for import. The entry name is the file stem.
fn read_importable(source: &Path) -> Result<(String, ValidDocument)> {
    let source_display = source.display().to_string();
    let name = source
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!(errors::catalog::import_name_missing(&source_display)))?;

    let bytes =
        std::fs::read(source).with_context(|| errors::store::failed_to_read(&source_display))?;
    let document = validate(&bytes).map_err(|e| {
        anyhow::anyhow!(errors::catalog::import_rejected(&source_display, &e.to_string()))
    })?;

    Ok((name, document))
}

fn write_replacing(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)
}

impl ConfigCatalog for DirectoryCatalog {
    fn count(&self) -> usize {
        self.entries.len()
    }

    fn current_name(&self) -> Option<String> {
        self.current
            .and_then(|index| self.entries.get(index))
            .map(|entry| entry.name.clone())
    }

    fn current_index(&self) -> Option<usize> {
        self.current
    }

    fn current_file_path(&self) -> Option<PathBuf> {
        self.current
            .and_then(|index| self.entries.get(index))
            .map(|entry| entry.path.clone())
    }

    fn select(&mut self, index: usize) -> Result<()> {
        anyhow::ensure!(
            index < self.entries.len(),
            errors::catalog::index_out_of_range(index, self.entries.len())
        );
        self.current = Some(index);
        self.save_selection()?;
        tracing::info!("Selected local config '{}'", self.entries[index].name);
        Ok(())
    }

    fn import(&mut self, source: &Path) -> Result<String> {
        let (name, document) = read_importable(source)?;
        let source_display = source.display().to_string();

        let destination = self.directory.join(format!("{}.json", name));
        write_replacing(&destination, document.raw()).with_context(|| {
            errors::store::failed_to_write_temp(&destination.display().to_string())
        })?;

        self.refresh()?;
        let index = self
            .position(&name)
            .ok_or_else(|| anyhow::anyhow!(errors::catalog::import_name_missing(&source_display)))?;
        self.select(index)?;

        tracing::info!("Imported local config '{}' from {}", name, source_display);
        Ok(name)
    }

    fn refresh(&mut self) -> Result<()> {
        let selected = self.current_name();
        self.entries = self.scan()?;
        self.current = self.resolve(selected.as_deref());
        Ok(())
    }
}

/// Catalog that only lives in memory. Imports are validated and then
/// referenced in place.
#[derive(Debug, Default, Clone)]
pub struct MemoryCatalog {
    entries: Vec<CatalogEntry>,
    current: Option<usize>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry and selects it.
    pub fn with_entry(mut self, name: &str, path: &Path) -> Self {
        self.entries.push(CatalogEntry {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
        self.current = Some(self.entries.len() - 1);
        self
    }
}

impl ConfigCatalog for MemoryCatalog {
    fn count(&self) -> usize {
        self.entries.len()
    }

    fn current_name(&self) -> Option<String> {
        self.current
            .and_then(|index| self.entries.get(index))
            .map(|entry| entry.name.clone())
    }

    fn current_index(&self) -> Option<usize> {
        self.current
    }

    fn current_file_path(&self) -> Option<PathBuf> {
        self.current
            .and_then(|index| self.entries.get(index))
            .map(|entry| entry.path.clone())
    }

    fn select(&mut self, index: usize) -> Result<()> {
        anyhow::ensure!(
            index < self.entries.len(),
            errors::catalog::index_out_of_range(index, self.entries.len())
        );
        self.current = Some(index);
        Ok(())
    }

    fn import(&mut self, source: &Path) -> Result<String> {
        let (name, _) = read_importable(source)?;
        self.entries.push(CatalogEntry {
            name: name.clone(),
            path: source.to_path_buf(),
        });
        self.current = Some(self.entries.len() - 1);
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "singbox_catalog_test_{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_scan_sorts_json_files_by_name() {
        let dir = temp_dir();
        std::fs::write(dir.join("work.json"), r#"{"outbounds":[]}"#).unwrap();
        std::fs::write(dir.join("Home.json"), r#"{"inbounds":[]}"#).unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let catalog = DirectoryCatalog::open(&dir).unwrap();
        let names: Vec<_> = catalog.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Home", "work"]);
        assert_eq!(catalog.current_index(), Some(0));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_selection_persists_across_reopen() {
        let dir = temp_dir();
        std::fs::write(dir.join("a.json"), r#"{"inbounds":[]}"#).unwrap();
        std::fs::write(dir.join("b.json"), r#"{"inbounds":[]}"#).unwrap();

        {
            let mut catalog = DirectoryCatalog::open(&dir).unwrap();
            catalog.select(1).unwrap();
        }

        let catalog = DirectoryCatalog::open(&dir).unwrap();
        assert_eq!(catalog.current_index(), Some(1));
        assert_eq!(catalog.current_name().as_deref(), Some("b"));
        assert_eq!(catalog.current_file_path(), Some(dir.join("b.json")));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_select_out_of_range() {
        let dir = temp_dir();
        let mut catalog = DirectoryCatalog::open(&dir).unwrap();
        let error = catalog.select(0).unwrap_err();
        assert!(error.to_string().contains("out of range"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_import_validates_and_selects() {
        let dir = temp_dir();
        let source_dir = temp_dir();
        let good = source_dir.join("travel.json");
        let bad = source_dir.join("broken.json");
        std::fs::write(&good, r#"{"outbounds":[{"type":"direct"}]}"#).unwrap();
        std::fs::write(&bad, r#"{"foo":"bar"}"#).unwrap();

        let mut catalog = DirectoryCatalog::open(&dir.join("configs")).unwrap();

        let error = catalog.import(&bad).unwrap_err();
        assert!(error.to_string().contains("Refusing to import"));
        assert_eq!(catalog.count(), 0);

        let name = catalog.import(&good).unwrap();
        assert_eq!(name, "travel");
        assert_eq!(catalog.count(), 1);
        assert_eq!(catalog.current_name().as_deref(), Some("travel"));
        assert_eq!(
            std::fs::read_to_string(catalog.current_file_path().unwrap()).unwrap(),
            r#"{"outbounds":[{"type":"direct"}]}"#
        );

        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&source_dir).ok();
    }

    #[test]
    fn test_unselected_catalog_defaults_to_first_entry() {
        let dir = temp_dir();
        std::fs::write(dir.join("home.json"), r#"{"inbounds":[]}"#).unwrap();

        let catalog = DirectoryCatalog::open(&dir).unwrap();
        assert_eq!(catalog.count(), 1);
        assert_eq!(catalog.current_index(), Some(0));
        assert_eq!(catalog.current_file_path(), Some(dir.join("home.json")));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_stale_persisted_selection_falls_back_to_first_entry() {
        let dir = temp_dir();
        std::fs::write(dir.join("a.json"), r#"{"inbounds":[]}"#).unwrap();
        std::fs::write(dir.join("b.json"), r#"{"inbounds":[]}"#).unwrap();
        {
            let mut catalog = DirectoryCatalog::open(&dir).unwrap();
            catalog.select(1).unwrap();
        }
        std::fs::remove_file(dir.join("b.json")).unwrap();

        let catalog = DirectoryCatalog::open(&dir).unwrap();
        assert_eq!(catalog.current_name().as_deref(), Some("a"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_refresh_reselects_after_removal() {
        let dir = temp_dir();
        std::fs::write(dir.join("a.json"), r#"{"inbounds":[]}"#).unwrap();
        std::fs::write(dir.join("b.json"), r#"{"inbounds":[]}"#).unwrap();
        let mut catalog = DirectoryCatalog::open(&dir).unwrap();
        catalog.select(1).unwrap();

        std::fs::remove_file(dir.join("b.json")).unwrap();
        catalog.refresh().unwrap();
        assert_eq!(catalog.current_name().as_deref(), Some("a"));

        std::fs::remove_file(dir.join("a.json")).unwrap();
        catalog.refresh().unwrap();
        assert_eq!(catalog.current_index(), None);
        assert_eq!(catalog.count(), 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_memory_catalog_selection() {
        let mut catalog = MemoryCatalog::new()
            .with_entry("a", Path::new("/configs/a.json"))
            .with_entry("b", Path::new("/configs/b.json"));
        assert_eq!(catalog.current_name().as_deref(), Some("b"));

        catalog.select(0).unwrap();
        assert_eq!(catalog.current_file_path(), Some(PathBuf::from("/configs/a.json")));
        assert!(catalog.select(2).is_err());
    }
}
