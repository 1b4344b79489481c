// src/manifest.rs

//! Manifest store
//!
//! A manifest is the set of logical paths one installed package owns, one
//! per line. A path ending in `/` is a directory the package created empty.
//! Manifests and control records share one store layout under the state
//! directory and are replaced with the filesystem stage/promote idiom, so a
//! new manifest can sit staged beside the active one until the transaction
//! that produced it succeeds.

use crate::error::Result;
use crate::filesystem;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    paths: BTreeSet<String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(raw: &str) -> Self {
        Self {
            paths: raw
                .lines()
                .map(str::trim_end)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for path in &self.paths {
            out.push_str(path);
            out.push('\n');
        }
        out
    }

    pub fn insert_file(&mut self, logical: &str) {
        self.paths.insert(logical.trim_end_matches('/').to_string());
    }

    /// Record `logical` as an intentionally empty directory
    pub fn insert_empty_dir(&mut self, logical: &str) {
        self.paths
            .insert(format!("{}/", logical.trim_end_matches('/')));
    }

    /// Drop an entry; directories must carry their trailing `/`
    pub fn remove(&mut self, entry: &str) -> bool {
        self.paths.remove(entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.paths.contains(entry)
    }

    /// Every entry, directories still carrying their trailing `/`
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.paths
            .iter()
            .filter(|p| !p.ends_with('/'))
            .map(String::as_str)
    }

    /// Empty directories, without the trailing `/`
    pub fn empty_dirs(&self) -> impl Iterator<Item = &str> {
        self.paths
            .iter()
            .filter_map(|p| p.strip_suffix('/'))
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Per-package manifest and control record files
#[derive(Debug, Clone)]
pub struct MetadataStore {
    manifests: PathBuf,
    controls: PathBuf,
}

impl MetadataStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            manifests: state_dir.join("manifests"),
            controls: state_dir.join("control"),
        }
    }

    pub fn manifest_path(&self, package: &str) -> PathBuf {
        self.manifests.join(package.to_lowercase())
    }

    pub fn control_path(&self, package: &str) -> PathBuf {
        self.controls.join(package.to_lowercase())
    }

    /// Active manifest, or `None` if the package has none
    pub fn read_manifest(&self, package: &str) -> Result<Option<Manifest>> {
        Ok(filesystem::read_recovered(&self.manifest_path(package))?
            .map(|raw| Manifest::parse(&raw)))
    }

    /// Write a replacement manifest without activating it
    pub fn stage_manifest(&self, package: &str, manifest: &Manifest) -> Result<()> {
        debug!("Staging manifest for {} ({} entries)", package, manifest.len());
        filesystem::stage(&self.manifest_path(package), manifest.to_text().as_bytes())
    }

    pub fn has_staged_manifest(&self, package: &str) -> bool {
        filesystem::is_staged(&self.manifest_path(package))
    }

    /// Make the staged manifest the active one
    pub fn activate_manifest(&self, package: &str) -> Result<()> {
        filesystem::promote(&self.manifest_path(package))
    }

    pub fn discard_manifest(&self, package: &str) -> Result<()> {
        filesystem::discard(&self.manifest_path(package))
    }

    pub fn remove_manifest(&self, package: &str) -> Result<()> {
        filesystem::remove_all_versions(&self.manifest_path(package))
    }

    pub fn read_control(&self, package: &str) -> Result<Option<String>> {
        filesystem::read_recovered(&self.control_path(package))
    }

    pub fn stage_control(&self, package: &str, raw: &str) -> Result<()> {
        filesystem::stage(&self.control_path(package), raw.as_bytes())
    }

    pub fn activate_control(&self, package: &str) -> Result<()> {
        filesystem::promote(&self.control_path(package))
    }

    pub fn discard_control(&self, package: &str) -> Result<()> {
        filesystem::discard(&self.control_path(package))
    }

    pub fn remove_control(&self, package: &str) -> Result<()> {
        filesystem::remove_all_versions(&self.control_path(package))
    }

    /// Names of packages with an active manifest
    pub fn packages(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.manifests) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".new") && !name.ends_with(".old") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Manifest {
        let mut manifest = Manifest::new();
        manifest.insert_file("Apps/Hello/!Run");
        manifest.insert_empty_dir("Apps/Hello/Empty");
        manifest
    }

    #[test]
    fn test_text_format() {
        let manifest = sample();
        assert_eq!(manifest.to_text(), "Apps/Hello/!Run\nApps/Hello/Empty/\n");
        assert_eq!(Manifest::parse(&manifest.to_text()), manifest);
        assert_eq!(manifest.files().collect::<Vec<_>>(), vec!["Apps/Hello/!Run"]);
        assert_eq!(manifest.empty_dirs().collect::<Vec<_>>(), vec!["Apps/Hello/Empty"]);
    }

    #[test]
    fn test_staged_manifest_is_invisible_until_activated() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());

        store.stage_manifest("Hello", &sample()).unwrap();
        assert!(store.has_staged_manifest("Hello"));
        assert_eq!(store.read_manifest("Hello").unwrap(), None);

        store.activate_manifest("Hello").unwrap();
        assert_eq!(store.read_manifest("hello").unwrap(), Some(sample()));
        assert_eq!(store.packages().unwrap(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_discard_keeps_active_manifest() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.stage_manifest("Hello", &sample()).unwrap();
        store.activate_manifest("Hello").unwrap();

        store.stage_manifest("Hello", &Manifest::new()).unwrap();
        store.discard_manifest("Hello").unwrap();

        assert_eq!(store.read_manifest("Hello").unwrap(), Some(sample()));
        assert!(!store.has_staged_manifest("Hello"));
    }

    #[test]
    fn test_remove() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.stage_control("Hello", "Package: Hello\n").unwrap();
        store.activate_control("Hello").unwrap();
        assert!(store.read_control("Hello").unwrap().is_some());

        store.remove_control("Hello").unwrap();
        assert_eq!(store.read_control("Hello").unwrap(), None);
    }
}
