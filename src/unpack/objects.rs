// src/unpack/objects.rs

//! Destination objects and the case-insensitive sets that track them

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One file or directory a package owns at a resolved destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestObject {
    pub package: String,
    /// Logical path inside the package
    pub logical: String,
    pub dest: PathBuf,
    pub is_dir: bool,
    pub size: u64,
}

impl DestObject {
    pub fn file(package: &str, logical: &str, dest: PathBuf, size: u64) -> Self {
        Self {
            package: package.to_string(),
            logical: logical.to_string(),
            dest,
            is_dir: false,
            size,
        }
    }

    pub fn dir(package: &str, logical: &str, dest: PathBuf) -> Self {
        Self {
            package: package.to_string(),
            logical: logical.to_string(),
            dest,
            is_dir: true,
            size: 0,
        }
    }
}

fn key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

/// Destination objects keyed by destination path, ignoring case
#[derive(Debug, Clone, Default)]
pub struct DestSet {
    objects: BTreeMap<String, DestObject>,
}

impl DestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `object`, returning any object already at its destination
    pub fn insert(&mut self, object: DestObject) -> Option<DestObject> {
        self.objects.insert(key(&object.dest), object)
    }

    pub fn remove(&mut self, dest: &Path) -> Option<DestObject> {
        self.objects.remove(&key(dest))
    }

    pub fn contains(&self, dest: &Path) -> bool {
        self.objects.contains_key(&key(dest))
    }

    pub fn get(&self, dest: &Path) -> Option<&DestObject> {
        self.objects.get(&key(dest))
    }

    /// Take the first object in path order
    pub fn pop_first(&mut self) -> Option<DestObject> {
        self.objects.pop_first().map(|(_, object)| object)
    }

    /// Take the last object in path order
    ///
    /// Unwind steps pop from the back so children go before their parents.
    pub fn pop_last(&mut self) -> Option<DestObject> {
        self.objects.pop_last().map(|(_, object)| object)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DestObject> {
        self.objects.values()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.objects.values().map(|o| o.dest.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_ignores_case() {
        let mut set = DestSet::new();
        set.insert(DestObject::file("zip", "Apps/Zip/!Run", "/r/Apps/Zip/!Run".into(), 3));

        assert!(set.contains(Path::new("/r/apps/zip/!run")));
        let replaced = set.insert(DestObject::file("other", "Apps/ZIP/!Run", "/r/APPS/ZIP/!RUN".into(), 1));
        assert_eq!(replaced.unwrap().package, "zip");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_pop_order() {
        let mut set = DestSet::new();
        set.insert(DestObject::dir("p", "Apps/A", "/r/Apps/A".into()));
        set.insert(DestObject::file("p", "Apps/A/f", "/r/Apps/A/f".into(), 0));

        assert_eq!(set.pop_last().unwrap().dest, PathBuf::from("/r/Apps/A/f"));
        assert_eq!(set.pop_first().unwrap().dest, PathBuf::from("/r/Apps/A"));
        assert!(set.is_empty());
    }
}
