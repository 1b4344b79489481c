// src/pkgbase.rs

//! The package base: every piece of persistent state one install root owns
//!
//! ```text
//! <root>/var/lib/stevedore/
//!     stevedore.db          settings, index, paths, modules, history
//!     status/current        status tables
//!     status/selected
//!     status/previous
//!     manifests/<package>   active manifests
//!     control/<package>     active control records
//!     cache/                downloaded archives
//!     triggers/             post-remove scripts saved for after removal
//!     scratch/              shared state of one session's triggers
//!     info/<package>/       installed `Package/` metadata
//!     sysvars, sprites, boot-options
//! ```

use crate::config::Settings;
use crate::db;
use crate::db::models::{AvailablePackage, ResidentModule};
use crate::environment::{EnvironmentRegistry, ModuleRegistry};
use crate::error::{Error, Result};
use crate::manifest::{Manifest, MetadataStore};
use crate::packages::Control;
use crate::paths::PathTable;
use crate::status::StatusTable;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Well-known locations under an install root
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    state_dir: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join("var/lib/stevedore");
        Self { root, state_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("stevedore.db")
    }

    pub fn status_path(&self, table: &str) -> PathBuf {
        self.state_dir.join("status").join(table)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    /// Where a package's post-remove script is kept while its files go away
    pub fn post_remove_copy(&self, package: &str) -> PathBuf {
        self.state_dir
            .join("triggers")
            .join(package.to_lowercase())
            .join("PostRemove")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.state_dir.join("scratch")
    }

    pub fn sysvars_path(&self) -> PathBuf {
        self.state_dir.join("sysvars")
    }

    pub fn sprites_path(&self) -> PathBuf {
        self.state_dir.join("sprites")
    }

    pub fn boot_options_path(&self) -> PathBuf {
        self.state_dir.join("boot-options")
    }

    /// Cache location of one build of a package
    pub fn archive_path(&self, package: &str, version: &str) -> PathBuf {
        self.cache_dir()
            .join(format!("{}_{}.pkg", package.to_lowercase(), version))
    }
}

/// Open handle on one install root's state
pub struct PackageBase {
    layout: Layout,
    conn: Connection,
    pub current: StatusTable,
    pub selected: StatusTable,
    pub previous: StatusTable,
    pub paths: PathTable,
    pub metadata: MetadataStore,
    pub environments: EnvironmentRegistry,
    pub modules: ModuleRegistry,
    pub settings: Settings,
}

impl PackageBase {
    /// Create the state directory and database under `root` and open them
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let layout = Layout::new(root);
        for dir in [
            layout.state_dir().to_path_buf(),
            layout.status_path(""),
            layout.cache_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::InitError(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }

        db::init(&layout.db_path().to_string_lossy())?;
        info!("Initialized package base at {}", layout.state_dir().display());
        Self::open_layout(layout)
    }

    /// Open the package base of an initialized root
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_layout(Layout::new(root))
    }

    fn open_layout(layout: Layout) -> Result<Self> {
        let mut conn = db::open(&layout.db_path().to_string_lossy())?;
        let settings = Settings::load(&conn)?;
        let paths = PathTable::load(&mut conn, layout.root(), layout.state_dir())?;
        let modules = ModuleRegistry::load(&conn)?;

        debug!("Opened package base at {}", layout.state_dir().display());
        Ok(Self {
            current: StatusTable::open(layout.status_path("current"))?,
            selected: StatusTable::open(layout.status_path("selected"))?,
            previous: StatusTable::open(layout.status_path("previous"))?,
            metadata: MetadataStore::new(layout.state_dir()),
            environments: EnvironmentRegistry::new(&settings.environments),
            modules,
            paths,
            settings,
            conn,
            layout,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Write the path table to the database
    pub fn commit_paths(&mut self) -> Result<()> {
        self.paths.commit(&mut self.conn)
    }

    /// Discard uncommitted path table changes
    pub fn rollback_paths(&mut self) -> Result<()> {
        self.paths.rollback(&self.conn)
    }

    /// Active manifest of an installed package
    pub fn manifest(&self, package: &str) -> Result<Option<Manifest>> {
        self.metadata.read_manifest(package)
    }

    /// Active control record of an installed package
    pub fn control(&self, package: &str) -> Result<Option<Control>> {
        self.metadata
            .read_control(package)?
            .map(|raw| Control::parse(&raw))
            .transpose()
    }

    /// Index entry for the selected build of `package`
    pub fn available(&self, package: &str, version: &str, environment: &str) -> Result<Option<AvailablePackage>> {
        AvailablePackage::find(&self.conn, package, version, environment)
    }

    pub fn archive_path(&self, package: &str, version: &str) -> PathBuf {
        self.layout.archive_path(package, version)
    }

    /// Record a module as resident on the host
    pub fn register_module(&mut self, name: &str, version: &str) -> Result<()> {
        ResidentModule::new(name.to_string(), version.to_string()).upsert(&self.conn)?;
        self.modules.insert(name, version);
        info!("Registered resident module {} {}", name, version);
        Ok(())
    }
}
