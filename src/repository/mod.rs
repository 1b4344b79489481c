// src/repository/mod.rs

//! Package index and archive retrieval
//!
//! This module provides functionality for:
//! - Importing package lists (rfc822 stanzas) into the `available` table
//! - Picking the newest compatible build of a package
//! - Downloading archives without blocking the caller
//! - Verifying archive checksums

pub mod download;

pub use download::{Download, DownloadState, Downloader, HttpDownloader};

use crate::config::Settings;
use crate::db;
use crate::db::models::AvailablePackage;
use crate::environment::{self, EnvironmentRegistry};
use crate::error::{Error, Result};
use crate::version;
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use rusqlite::Connection;
use serde::Deserialize;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::{debug, info};

/// Package list stanza for rfc822-like parsing
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IndexEntry {
    package: String,
    version: String,
    #[serde(default)]
    environment: Option<String>,
    #[serde(rename = "URL")]
    url: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "SHA256", default)]
    sha256: Option<String>,
    #[serde(rename = "Installed-Size", default)]
    installed_size: Option<String>,
}

/// Parse a package list
///
/// Relative URLs are resolved against `base`, the location the list came
/// from.
pub fn parse_index(content: &str, base: &str) -> Result<Vec<AvailablePackage>> {
    let entries: Vec<IndexEntry> = rfc822_like::from_str(content)
        .map_err(|e| Error::ParseError(format!("Failed to parse package list: {}", e)))?;

    debug!("Parsed {} package list entries", entries.len());

    let parse_size = |field: &Option<String>, name: &str| -> Result<Option<u64>> {
        field
            .as_deref()
            .map(|s| {
                s.trim()
                    .parse::<u64>()
                    .map_err(|e| Error::ParseError(format!("Invalid {} '{}': {}", name, s, e)))
            })
            .transpose()
    };

    entries
        .into_iter()
        .map(|entry| {
            let mut package =
                AvailablePackage::new(entry.package, entry.version, resolve_url(base, &entry.url));
            package.environment = environment::canonical_id(entry.environment.as_deref());
            package.size = parse_size(&entry.size, "Size")?;
            package.sha256 = entry.sha256.map(|s| s.trim().to_lowercase());
            package.installed_size = parse_size(&entry.installed_size, "Installed-Size")?;
            Ok(package)
        })
        .collect()
}

fn resolve_url(base: &str, url: &str) -> String {
    if url.contains("://") || url.starts_with('/') {
        return url.to_string();
    }
    match base.rfind('/') {
        Some(pos) => format!("{}/{}", &base[..pos], url),
        None => url.to_string(),
    }
}

/// Read a package list from a URL or local path, gunzipping if needed
pub fn fetch_index(source: &str, settings: &Settings) -> Result<String> {
    let bytes = if source.starts_with("http://") || source.starts_with("https://") {
        info!("Fetching package list from {}", source);
        let client = Client::builder()
            .timeout(settings.http_timeout())
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {}", e)))?;
        let response = client
            .get(source)
            .send()
            .map_err(|e| Error::DownloadError(format!("Failed to download {}: {}", source, e)))?;
        if !response.status().is_success() {
            return Err(Error::DownloadError(format!(
                "Failed to download {}: HTTP {}",
                source,
                response.status()
            )));
        }
        response
            .bytes()
            .map_err(|e| Error::DownloadError(format!("Failed to read response: {}", e)))?
            .to_vec()
    } else {
        let path = download::local_path(source);
        std::fs::read(&path)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {}", path.display(), e)))?
    };

    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut text = String::new();
        GzDecoder::new(bytes.as_slice())
            .read_to_string(&mut text)
            .map_err(|e| Error::ParseError(format!("Failed to decompress package list: {}", e)))?;
        Ok(text)
    } else {
        String::from_utf8(bytes)
            .map_err(|e| Error::ParseError(format!("Package list is not UTF-8: {}", e)))
    }
}

/// Import a package list into the index, returning the number of entries
pub fn import(conn: &mut Connection, source: &str, settings: &Settings) -> Result<usize> {
    let content = fetch_index(source, settings)?;
    let packages = parse_index(&content, source)?;

    db::transaction(conn, |tx| {
        for mut package in packages {
            package.upsert(tx)?;
        }
        Ok(())
    })?;

    let total = AvailablePackage::list_all(conn)?.len();
    info!("Imported package list from {}; index holds {} builds", source, total);
    Ok(total)
}

/// Newest build of `name` the host can run
pub fn latest(
    conn: &Connection,
    name: &str,
    environments: &EnvironmentRegistry,
) -> Result<Option<AvailablePackage>> {
    let mut candidates: Vec<AvailablePackage> = AvailablePackage::find_by_name(conn, name)?
        .into_iter()
        .filter(|p| environments.provides(&p.environment))
        .collect();

    candidates.sort_by(|a, b| version::compare(&a.version, &b.version));
    Ok(candidates.pop())
}

/// Verify file checksum matches expected value
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    use sha2::{Digest, Sha256};

    debug!("Verifying checksum for {}", path.display());

    let mut file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open file for checksum: {}", e)))?;

    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|e| Error::IoError(format!("Failed to read file for checksum: {}", e)))?;

    let actual = format!("{:x}", hasher.finalize());

    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }

    debug!("Checksum verified: {}", expected);
    Ok(())
}

/// True if `path` holds a verified copy of `package`
///
/// With no checksum in the index, any existing file counts as verified.
pub fn is_cached(path: &Path, package: &AvailablePackage) -> bool {
    if !path.is_file() {
        return false;
    }
    match &package.sha256 {
        Some(expected) => verify_checksum(path, expected).is_ok(),
        None => true,
    }
}
