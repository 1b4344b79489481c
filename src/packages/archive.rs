// src/packages/archive.rs

//! Package archive access
//!
//! Packages are tarballs, optionally compressed with gzip, zstd or xz.
//! Compressed archives are decompressed once into an anonymous spool file
//! and indexed; single entries are then extracted by seeking straight to
//! their data, so the unpack engine can pull one file per step.

use super::control::Control;
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use tar::Archive;
use tracing::debug;
use xz2::read::XzDecoder;

/// Logical directory holding package metadata
pub const METADATA_ROOT: &str = "Package";

/// Logical path of the control record
pub const CONTROL_PATH: &str = "Package/Control";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One file or directory in a package archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Logical path without leading `./` or trailing separator
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
}

impl ArchiveEntry {
    pub fn is_metadata(&self) -> bool {
        self.path == METADATA_ROOT || self.path.starts_with("Package/")
    }
}

/// Read access to a package archive
pub trait PackageArchive {
    /// All entries, in archive order
    fn entries(&self) -> &[ArchiveEntry];

    /// Read a file entry into memory
    fn read(&mut self, path: &str) -> Result<Vec<u8>>;

    /// Extract a file entry to `dest`, returning the number of bytes written
    fn extract(&mut self, path: &str, dest: &Path) -> Result<u64>;

    /// Parse the archive's control record
    fn control(&mut self) -> Result<Control> {
        let raw = self.read(CONTROL_PATH)?;
        let text = String::from_utf8(raw)
            .map_err(|e| Error::ParseError(format!("Control record is not UTF-8: {}", e)))?;
        Control::parse(&text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
    Zstd,
    Xz,
}

/// Detect compression from the leading magic bytes
fn detect_compression(file: &mut File) -> Result<Compression> {
    let mut magic = [0u8; 6];
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..])? {
            0 => break,
            n => read += n,
        }
    }
    file.seek(SeekFrom::Start(0))?;

    let magic = &magic[..read];
    Ok(if magic.starts_with(&[0x1f, 0x8b]) {
        Compression::Gzip
    } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Compression::Zstd
    } else if magic.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
        Compression::Xz
    } else {
        Compression::None
    })
}

#[derive(Debug, Clone, Copy)]
struct Location {
    offset: u64,
    size: u64,
}

/// Tar-backed package archive
pub struct TarArchive {
    label: String,
    spool: File,
    entries: Vec<ArchiveEntry>,
    locations: HashMap<String, Location>,
}

impl TarArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| {
            Error::IoError(format!("Failed to open package {}: {}", path.display(), e))
        })?;

        let compression = detect_compression(&mut file)?;
        debug!("Opening {} ({:?})", path.display(), compression);

        let mut spool = match compression {
            Compression::None => file,
            Compression::Gzip => spool_from(GzDecoder::new(file))?,
            Compression::Zstd => {
                let decoder = zstd::Decoder::new(file).map_err(|e| {
                    Error::ParseError(format!("Failed to create zstd decoder: {}", e))
                })?;
                spool_from(decoder)?
            }
            Compression::Xz => spool_from(XzDecoder::new(file))?,
        };
        spool.seek(SeekFrom::Start(0))?;

        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut entries = Vec::new();
        let mut locations = HashMap::new();
        {
            let mut archive = Archive::new(&spool);
            let iter = archive.entries().map_err(|e| {
                Error::ParseError(format!("Failed to read archive {}: {}", label, e))
            })?;

            for entry in iter {
                let entry = entry.map_err(|e| {
                    Error::ParseError(format!("Failed to read archive entry in {}: {}", label, e))
                })?;
                let header = entry.header();
                let kind = if header.entry_type().is_dir() {
                    EntryKind::Directory
                } else if header.entry_type().is_file() {
                    EntryKind::File
                } else {
                    debug!("Skipping unsupported entry type in {}", label);
                    continue;
                };

                let raw_path = entry.path().map_err(|e| {
                    Error::ParseError(format!("Invalid entry path in {}: {}", label, e))
                })?;
                let logical = normalize(&raw_path.to_string_lossy());
                if logical.is_empty() {
                    continue;
                }

                let size = entry.size();
                locations.insert(
                    logical.clone(),
                    Location {
                        offset: entry.raw_file_position(),
                        size,
                    },
                );
                entries.push(ArchiveEntry {
                    path: logical,
                    kind,
                    size,
                    mode: header.mode().unwrap_or(0o644),
                });
            }
        }

        debug!("Indexed {} entries in {}", entries.len(), label);
        Ok(Self {
            label,
            spool,
            entries,
            locations,
        })
    }

    fn locate(&self, path: &str) -> Result<Location> {
        self.locations
            .get(normalize(path).as_str())
            .copied()
            .ok_or_else(|| Error::FileInfoNotFound {
                package: self.label.clone(),
                path: path.to_string(),
            })
    }

    fn reader(&mut self, location: Location) -> Result<io::Take<&File>> {
        self.spool.seek(SeekFrom::Start(location.offset))?;
        Ok(Read::take(&self.spool, location.size))
    }
}

impl PackageArchive for TarArchive {
    fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    fn read(&mut self, path: &str) -> Result<Vec<u8>> {
        let location = self.locate(path)?;
        let mut buf = Vec::with_capacity(location.size as usize);
        self.reader(location)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn extract(&mut self, path: &str, dest: &Path) -> Result<u64> {
        let location = self.locate(path)?;
        let mode = self
            .entries
            .iter()
            .find(|e| e.path == normalize(path))
            .map(|e| e.mode)
            .unwrap_or(0o644);

        let mut out = File::create(dest).map_err(|e| {
            Error::IoError(format!("Failed to create {}: {}", dest.display(), e))
        })?;
        let written = io::copy(&mut self.reader(location)?, &mut out).map_err(|e| {
            Error::IoError(format!("Failed to extract {} to {}: {}", path, dest.display(), e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            out.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(written)
    }
}

/// Open a package archive from the cache
pub fn open(path: &Path) -> Result<Box<dyn PackageArchive>> {
    Ok(Box::new(TarArchive::open(path)?))
}

fn spool_from<R: Read>(mut reader: R) -> Result<File> {
    let mut spool = tempfile::tempfile()?;
    io::copy(&mut reader, &mut spool)
        .map_err(|e| Error::ParseError(format!("Failed to decompress archive: {}", e)))?;
    Ok(spool)
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut path = path.as_str();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.trim_matches('/').to_string()
}

/// Build a package archive from (logical path, contents) pairs
///
/// A path ending in `/` becomes a directory entry. Used by tests and by
/// tooling that assembles packages.
pub fn build_tar_gz(dest: &Path, files: &[(&str, &[u8])]) -> Result<()> {
    use flate2::Compression as Level;
    use flate2::write::GzEncoder;

    let file = File::create(dest)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Level::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        if path.ends_with('/') {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, path, io::empty())?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(contents.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents)?;
        }
    }
    builder.into_inner()?.finish()?;
    Ok(())
}
