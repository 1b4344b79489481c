// src/paths.rs

//! Logical to physical path resolution
//!
//! Package contents are named by logical paths such as `Apps/Zip/!Run`.
//! The path table maps logical prefixes to physical locations; the longest
//! matching prefix wins and comparison ignores case. Physical templates may
//! use `{root}`, `{state}` and `{package}` placeholders.

use crate::db;
use crate::error::{Error, Result};
use rusqlite::{Connection, params};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Maps a package-relative logical path to an absolute destination path
pub trait PathResolver {
    fn resolve(&self, logical: &str, package: &str) -> Result<PathBuf>;
}

/// Mappings seeded into a fresh database
pub const DEFAULT_MAPPINGS: &[(&str, &str)] = &[
    ("Apps", "{root}/Apps"),
    ("Boot", "{root}/Boot"),
    ("Resources", "{root}/Resources"),
    ("System", "{root}/System"),
    ("Package", "{state}/info/{package}"),
];

#[derive(Debug, Clone)]
struct Mapping {
    logical: String,
    physical: String,
}

/// Persistent path table with explicit commit/rollback
#[derive(Debug, Clone)]
pub struct PathTable {
    root: PathBuf,
    state_dir: PathBuf,
    mappings: BTreeMap<String, Mapping>,
}

impl PathTable {
    /// An unpersisted table holding only the default mappings
    pub fn with_defaults(root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        let mut table = Self {
            root: root.into(),
            state_dir: state_dir.into(),
            mappings: BTreeMap::new(),
        };
        for (logical, physical) in DEFAULT_MAPPINGS {
            table.set(logical, physical);
        }
        table
    }

    /// Load the table from the database, seeding defaults into an empty one
    pub fn load(conn: &mut Connection, root: &Path, state_dir: &Path) -> Result<Self> {
        let mut table = Self {
            root: root.to_path_buf(),
            state_dir: state_dir.to_path_buf(),
            mappings: BTreeMap::new(),
        };
        table.reload(conn)?;

        if table.mappings.is_empty() {
            info!("Seeding default path table");
            table = Self::with_defaults(root, state_dir);
            table.commit(conn)?;
        }
        Ok(table)
    }

    fn reload(&mut self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare("SELECT logical, physical FROM paths")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.mappings.clear();
        for (logical, physical) in rows {
            self.set(&logical, &physical);
        }
        Ok(())
    }

    /// Set or replace the mapping for a logical prefix
    pub fn set(&mut self, logical: &str, physical: &str) {
        let logical = normalize(logical);
        self.mappings.insert(
            logical.to_lowercase(),
            Mapping {
                logical,
                physical: physical.to_string(),
            },
        );
    }

    /// Physical template mapped exactly at `logical`, if any
    pub fn get(&self, logical: &str) -> Option<&str> {
        self.mappings
            .get(&normalize(logical).to_lowercase())
            .map(|m| m.physical.as_str())
    }

    /// All mappings as (logical, physical template)
    pub fn mappings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.mappings
            .values()
            .map(|m| (m.logical.as_str(), m.physical.as_str()))
    }

    /// Write the in-memory mappings to the database
    pub fn commit(&self, conn: &mut Connection) -> Result<()> {
        db::transaction(conn, |tx| {
            tx.execute("DELETE FROM paths", [])?;
            for mapping in self.mappings.values() {
                tx.execute(
                    "INSERT INTO paths (logical, physical) VALUES (?1, ?2)",
                    params![&mapping.logical, &mapping.physical],
                )?;
            }
            Ok(())
        })?;
        debug!("Committed {} path mappings", self.mappings.len());
        Ok(())
    }

    /// Discard in-memory changes
    pub fn rollback(&mut self, conn: &Connection) -> Result<()> {
        self.reload(conn)
    }

    /// Physical directories that mapping targets live in
    ///
    /// These are the floors the directory helper must never delete.
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self
            .mappings
            .values()
            .map(|m| {
                let fixed = m.physical.split("{package}").next().unwrap_or("");
                self.expand(fixed.trim_end_matches('/'), "")
            })
            .collect();
        roots.sort();
        roots.dedup();
        roots
    }

    fn expand(&self, template: &str, package: &str) -> PathBuf {
        let expanded = template
            .replace("{root}", &self.root.to_string_lossy())
            .replace("{state}", &self.state_dir.to_string_lossy())
            .replace("{package}", package);
        PathBuf::from(expanded)
    }
}

impl PathResolver for PathTable {
    fn resolve(&self, logical: &str, package: &str) -> Result<PathBuf> {
        let logical = normalize(logical);
        let components: Vec<&str> = logical.split('/').filter(|c| !c.is_empty()).collect();

        if components.iter().any(|c| *c == ".." || *c == ".") {
            return Err(Error::ParseError(format!(
                "Logical path may not contain relative components: {}",
                logical
            )));
        }

        for split in (1..=components.len()).rev() {
            let prefix = components[..split].join("/").to_lowercase();
            if let Some(mapping) = self.mappings.get(&prefix) {
                let mut path = self.expand(&mapping.physical, package);
                for component in &components[split..] {
                    path.push(component);
                }
                return Ok(path);
            }
        }

        Err(Error::NotFoundError(format!(
            "No path mapping for {}",
            logical
        )))
    }
}

fn normalize(logical: &str) -> String {
    logical.trim_matches('/').to_string()
}
