// src/environment.rs

//! Environment compatibility and resident module registries
//!
//! Both registries are built once per process from the database and passed
//! to whatever needs them.

use crate::db::models::ResidentModule;
use crate::error::Result;
use crate::packages::Control;
use crate::version;
use rusqlite::Connection;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Environment id of packages that run anywhere
pub const ANY: &str = "any";

/// Host environment features and package compatibility
#[derive(Debug, Clone)]
pub struct EnvironmentRegistry {
    features: BTreeSet<String>,
}

impl EnvironmentRegistry {
    pub fn new<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut features: BTreeSet<String> = features
            .into_iter()
            .map(|f| f.as_ref().trim().to_lowercase())
            .filter(|f| !f.is_empty())
            .collect();
        features.insert(ANY.to_string());
        Self { features }
    }

    /// Canonical id of the environment a control record requires
    pub fn environment_id(&self, control: &Control) -> String {
        canonical_id(control.environment.as_deref())
    }

    /// True if the host provides everything the package requires
    pub fn is_compatible(&self, control: &Control) -> bool {
        self.provides(&canonical_id(control.environment.as_deref()))
    }

    /// True if the host provides every feature of a canonical environment id
    pub fn provides(&self, environment_id: &str) -> bool {
        required(Some(environment_id))
            .iter()
            .all(|f| self.features.contains(f))
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(String::as_str)
    }
}

/// Sorted, lowercased, comma-joined feature list; `any` when nothing is required
pub fn canonical_id(environment: Option<&str>) -> String {
    let required = required(environment);
    if required.is_empty() {
        ANY.to_string()
    } else {
        required.into_iter().collect::<Vec<_>>().join(",")
    }
}

fn required(environment: Option<&str>) -> BTreeSet<String> {
    environment
        .unwrap_or("")
        .split(',')
        .map(|f| f.trim().to_lowercase())
        .filter(|f| !f.is_empty() && f.as_str() != ANY)
        .collect()
}

/// System modules already resident on the host
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, String>,
}

impl ModuleRegistry {
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut registry = Self::default();
        for module in ResidentModule::list_all(conn)? {
            registry.insert(&module.name, &module.version);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: &str, version: &str) {
        self.modules.insert(name.to_lowercase(), version.to_string());
    }

    pub fn resident_version(&self, name: &str) -> Option<&str> {
        self.modules.get(&name.to_lowercase()).map(String::as_str)
    }

    /// True if a module at least as new as `version` is resident
    pub fn satisfies(&self, name: &str, version: &str) -> bool {
        self.resident_version(name)
            .is_some_and(|resident| version::compare(resident, version) != Ordering::Less)
    }
}

/// Module name if `logical` is a system module file (`System/.../Modules/<name>`)
pub fn module_name(logical: &str) -> Option<&str> {
    let mut components: Vec<&str> = logical.split('/').filter(|c| !c.is_empty()).collect();
    let name = components.pop()?;
    let parent = components.pop()?;
    let top = components.first().copied().unwrap_or(parent);
    (top.eq_ignore_ascii_case("System") && parent.eq_ignore_ascii_case("Modules")).then_some(name)
}
