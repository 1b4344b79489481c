// src/db/mod.rs

//! Database layer for Stevedore
//!
//! The SQLite database holds everything that is not a status table or a
//! per-package metadata file:
//! - Settings (database-first configuration)
//! - The package index imported from package lists
//! - The path table and queued component updates
//! - Resident modules and changeset history

pub mod models;
pub mod schema;

use crate::error::{Error, Result};
use rusqlite::{Connection, Transaction};
use std::path::Path;
use tracing::{debug, info};

/// Initialize a new Stevedore database at the specified path
///
/// Creates the database file, sets pragmas and applies all migrations.
/// This is idempotent - calling it on an existing database is safe.
pub fn init(db_path: &str) -> Result<()> {
    debug!("Initializing database at: {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::InitError(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(db_path)?;

    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    schema::migrate(&conn)?;

    info!("Database initialized successfully");
    Ok(())
}

/// Open an existing Stevedore database
pub fn open(db_path: &str) -> Result<Connection> {
    if !Path::new(db_path).exists() {
        return Err(Error::DatabaseNotFound(db_path.to_string()));
    }

    let conn = Connection::open(db_path)?;

    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;

    // Older databases pick up new tables on open
    schema::migrate(&conn)?;

    Ok(conn)
}

/// Run `f` inside a database transaction
///
/// The transaction is committed if `f` returns `Ok` and rolled back
/// otherwise.
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let tx = conn.transaction()?;
    match f(&tx) {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(e) => {
            // Dropping the transaction rolls it back; report the original error
            drop(tx);
            Err(e)
        }
    }
}
