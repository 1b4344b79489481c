// src/packages/mod.rs

//! Package archive and control record support
//!
//! A package is a tarball whose payload sits under logical top-level
//! directories (`Apps`, `System`, ...) and whose metadata sits under
//! `Package/`. [`PackageArchive`] is the seam the unpack engine reads
//! through; [`Control`] is the parsed `Package/Control` record.

pub mod archive;
pub mod control;

pub use archive::{ArchiveEntry, EntryKind, PackageArchive, TarArchive, CONTROL_PATH};
pub use control::{Component, ComponentOption, Control};
