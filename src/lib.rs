// src/lib.rs

//! Stevedore package manager
//!
//! Transactional install, upgrade and removal of packages into a set of
//! logical directories, with the ability to unwind a failed session back to
//! the state it started from.
//!
//! # Architecture
//!
//! - Status tables: `current`, `selected` and `previous` package status,
//!   committed to disk with a stage-and-promote idiom
//! - Database-first: settings, package index, path table and changeset
//!   history live in SQLite
//! - Polled state machines: [`UnpackEngine`] moves files, [`Commit`] drives
//!   a whole session around it; each poll does one bounded unit of work
//! - Seams: downloads, trigger scripts and host integration sit behind
//!   traits so callers and tests can substitute their own

pub mod commit;
pub mod config;
pub mod db;
pub mod environment;
mod error;
pub mod filesystem;
pub mod integration;
pub mod manifest;
pub mod packages;
pub mod paths;
pub mod pkgbase;
pub mod progress;
pub mod repository;
pub mod status;
pub mod triggers;
pub mod unpack;
pub mod version;

pub use commit::{Commit, CommitState, Services};
pub use config::Settings;
pub use error::{Error, Result};
pub use integration::{HostIntegration, SystemIntegration};
pub use pkgbase::PackageBase;
pub use repository::{Downloader, HttpDownloader};
pub use status::{State, Status, StatusTable};
pub use triggers::{CommandTriggerRunner, TriggerRunner};
pub use unpack::{UnpackEngine, UnpackState};
