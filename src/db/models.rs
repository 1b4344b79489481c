// src/db/models.rs

//! Data models for Stevedore database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::str::FromStr;

/// Changeset status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesetStatus {
    Pending,
    Applied,
    Failed,
}

impl ChangesetStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ChangesetStatus::Pending => "pending",
            ChangesetStatus::Applied => "applied",
            ChangesetStatus::Failed => "failed",
        }
    }
}

impl FromStr for ChangesetStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangesetStatus::Pending),
            "applied" => Ok(ChangesetStatus::Applied),
            "failed" => Ok(ChangesetStatus::Failed),
            _ => Err(format!("Invalid changeset status: {}", s)),
        }
    }
}

/// A Changeset records one commit session
#[derive(Debug, Clone)]
pub struct Changeset {
    pub id: Option<i64>,
    pub description: String,
    pub status: ChangesetStatus,
    /// JSON array of package names whose current status changed
    pub packages: Option<String>,
    pub message: Option<String>,
    pub created_at: Option<String>,
    pub finished_at: Option<String>,
}

impl Changeset {
    /// Create a new Changeset
    pub fn new(description: String) -> Self {
        Self {
            id: None,
            description,
            status: ChangesetStatus::Pending,
            packages: None,
            message: None,
            created_at: None,
            finished_at: None,
        }
    }

    /// Insert this changeset into the database
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO changesets (description, status) VALUES (?1, ?2)",
            params![&self.description, self.status.as_str()],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a changeset by ID
    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, status, packages, message, created_at, finished_at
             FROM changesets WHERE id = ?1",
        )?;

        let changeset = stmt.query_row([id], Self::from_row).optional()?;

        Ok(changeset)
    }

    /// List all changesets, newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, description, status, packages, message, created_at, finished_at
             FROM changesets ORDER BY id DESC",
        )?;

        let changesets = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(changesets)
    }

    /// Record the terminal status of this changeset
    pub fn finish(
        &mut self,
        conn: &Connection,
        status: ChangesetStatus,
        packages: &[String],
        message: Option<&str>,
    ) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InitError("Cannot update changeset without ID".to_string()))?;

        let packages_json = serde_json::to_string(packages)
            .map_err(|e| Error::PersistenceError(format!("Failed to encode package list: {}", e)))?;

        conn.execute(
            "UPDATE changesets SET status = ?1, packages = ?2, message = ?3,
             finished_at = CURRENT_TIMESTAMP WHERE id = ?4",
            params![status.as_str(), &packages_json, message, id],
        )?;

        self.status = status;
        self.packages = Some(packages_json);
        self.message = message.map(str::to_string);
        Ok(())
    }

    /// Decode the package list recorded by `finish`
    pub fn package_names(&self) -> Vec<String> {
        self.packages
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }

    /// Convert a database row to a Changeset
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_str: String = row.get(2)?;
        let status = status_str.parse::<ChangesetStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            id: Some(row.get(0)?),
            description: row.get(1)?,
            status,
            packages: row.get(3)?,
            message: row.get(4)?,
            created_at: row.get(5)?,
            finished_at: row.get(6)?,
        })
    }
}

/// A package available for installation, from an imported package list
#[derive(Debug, Clone, PartialEq)]
pub struct AvailablePackage {
    pub id: Option<i64>,
    pub name: String,
    pub version: String,
    pub environment: String,
    pub url: String,
    pub size: Option<u64>,
    pub sha256: Option<String>,
    pub installed_size: Option<u64>,
}

impl AvailablePackage {
    /// Create a new AvailablePackage
    pub fn new(name: String, version: String, url: String) -> Self {
        Self {
            id: None,
            name,
            version,
            environment: "any".to_string(),
            url,
            size: None,
            sha256: None,
            installed_size: None,
        }
    }

    /// Insert this package, replacing any entry with the same identity
    pub fn upsert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO available (name, version, environment, url, size, sha256, installed_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(name, version, environment) DO UPDATE SET
                url = excluded.url, size = excluded.size, sha256 = excluded.sha256,
                installed_size = excluded.installed_size,
                imported_at = CURRENT_TIMESTAMP",
            params![
                &self.name,
                &self.version,
                &self.environment,
                &self.url,
                self.size.map(|s| s as i64),
                &self.sha256,
                self.installed_size.map(|s| s as i64),
            ],
        )?;

        let id = conn.query_row(
            "SELECT id FROM available WHERE name = ?1 AND version = ?2 AND environment = ?3",
            params![&self.name, &self.version, &self.environment],
            |row| row.get(0),
        )?;
        self.id = Some(id);
        Ok(id)
    }

    /// Find all available versions of a package
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, environment, url, size, sha256, installed_size
             FROM available WHERE name = ?1",
        )?;

        let packages = stmt
            .query_map([name], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Find one specific build of a package
    pub fn find(conn: &Connection, name: &str, version: &str, environment: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, environment, url, size, sha256, installed_size
             FROM available WHERE name = ?1 AND version = ?2 AND environment = ?3",
        )?;

        let package = stmt
            .query_row(params![name, version, environment], Self::from_row)
            .optional()?;

        Ok(package)
    }

    /// List the whole index
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, version, environment, url, size, sha256, installed_size
             FROM available ORDER BY name, version",
        )?;

        let packages = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(packages)
    }

    /// Convert a database row to an AvailablePackage
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            version: row.get(2)?,
            environment: row.get(3)?,
            url: row.get(4)?,
            size: row.get::<_, Option<i64>>(5)?.map(|s| s as u64),
            sha256: row.get(6)?,
            installed_size: row.get::<_, Option<i64>>(7)?.map(|s| s as u64),
        })
    }
}

/// A key/value setting
pub struct Setting;

impl Setting {
    /// Read a setting, if present
    pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
        let value = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Write a setting
    pub fn set(conn: &Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// List all settings
    pub fn list_all(conn: &Connection) -> Result<Vec<(String, String)>> {
        let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
        let settings = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(settings)
    }
}

/// A queued request to move a component to a new install location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentUpdate {
    pub logical: String,
    pub physical: String,
}

impl ComponentUpdate {
    pub fn new(logical: String, physical: String) -> Self {
        Self { logical, physical }
    }

    /// Queue this update, replacing any earlier request for the component
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO component_updates (logical, physical) VALUES (?1, ?2)
             ON CONFLICT(logical) DO UPDATE SET physical = excluded.physical",
            params![&self.logical, &self.physical],
        )?;
        Ok(())
    }

    /// List queued updates
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt =
            conn.prepare("SELECT logical, physical FROM component_updates ORDER BY logical")?;
        let updates = stmt
            .query_map([], |row| Ok(Self::new(row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(updates)
    }

    /// Drop all queued updates
    pub fn clear(conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM component_updates", [])?;
        Ok(())
    }
}

/// A system module already resident on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentModule {
    pub name: String,
    pub version: String,
}

impl ResidentModule {
    pub fn new(name: String, version: String) -> Self {
        Self { name, version }
    }

    /// Record or update a resident module
    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO resident_modules (name, version) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET version = excluded.version",
            params![&self.name, &self.version],
        )?;
        Ok(())
    }

    /// List all resident modules
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare("SELECT name, version FROM resident_modules ORDER BY name")?;
        let modules = stmt
            .query_map([], |row| Ok(Self::new(row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(modules)
    }
}
