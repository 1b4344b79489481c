// src/packages/control.rs

//! Package control records
//!
//! A control record is a single RFC 822 style stanza stored in the archive
//! at `Package/Control`:
//!
//! ```text
//! Package: Zip
//! Version: 3.0-2
//! Standards-Version: 0.7
//! Environment: arm, vfp
//! Installed-Size: 204800
//! Components: Apps/Zip (Movable LookAt), Apps/Unzip
//! SysVars: Zip$Options=-9
//! Sprites: Apps/Zip/!Sprites
//! ```

use crate::error::{Error, Result};
use crate::version;
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::str::FromStr;

/// Newest package standards version this engine understands
pub const SUPPORTED_STANDARDS_VERSION: &str = "0.7";

/// Control record field layout for rfc822-like parsing
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ControlRecord {
    package: String,
    version: String,
    #[serde(rename = "Standards-Version", default)]
    standards_version: Option<String>,
    #[serde(default)]
    environment: Option<String>,
    #[serde(rename = "Installed-Size", default)]
    installed_size: Option<String>,
    #[serde(default)]
    components: Option<String>,
    #[serde(rename = "SysVars", default)]
    sysvars: Option<String>,
    #[serde(default)]
    sprites: Option<String>,
    #[serde(rename = "Module-Version", default)]
    module_version: Option<String>,
}

/// Integration options attached to a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentOption {
    /// May be installed somewhere other than its default location
    Movable,
    /// Boot at startup so its resources are known to the desktop
    LookAt,
    /// Run at startup
    Run,
    /// Register with the applications directory
    AddToApps,
}

impl FromStr for ComponentOption {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "movable" => Ok(ComponentOption::Movable),
            "lookat" => Ok(ComponentOption::LookAt),
            "run" => Ok(ComponentOption::Run),
            "addtoapps" => Ok(ComponentOption::AddToApps),
            _ => Err(format!("Invalid component option: {}", s)),
        }
    }
}

/// A top-level piece of a package that the system integrates with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub logical: String,
    pub options: BTreeSet<ComponentOption>,
}

/// Parsed control record, keeping the original text for rewriting
#[derive(Debug, Clone)]
pub struct Control {
    raw: String,
    pub package: String,
    pub version: String,
    pub standards_version: Option<String>,
    pub environment: Option<String>,
    pub installed_size: Option<u64>,
    components: Option<String>,
    sysvars: Option<String>,
    sprites: Option<String>,
    pub module_version: Option<String>,
}

impl Control {
    pub fn parse(raw: &str) -> Result<Self> {
        let records: Vec<ControlRecord> = rfc822_like::from_str(raw)
            .map_err(|e| Error::ParseError(format!("Failed to parse control record: {}", e)))?;

        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| Error::ParseError("Empty control record".to_string()))?;

        let installed_size = match &record.installed_size {
            Some(size) => Some(size.trim().parse::<u64>().map_err(|e| {
                Error::ParseError(format!("Invalid Installed-Size '{}': {}", size, e))
            })?),
            None => None,
        };

        Ok(Self {
            raw: raw.to_string(),
            package: record.package,
            version: record.version,
            standards_version: record.standards_version,
            environment: record.environment,
            installed_size,
            components: record.components,
            sysvars: record.sysvars,
            sprites: record.sprites,
            module_version: record.module_version,
        })
    }

    /// Original record text
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// True if the record's standards version is one this engine understands
    pub fn standards_supported(&self) -> bool {
        match &self.standards_version {
            Some(v) => version::compare(v.trim(), SUPPORTED_STANDARDS_VERSION) != Ordering::Greater,
            None => true,
        }
    }

    /// Record text with `key` set to `value`, replacing any existing field
    pub fn with_field(&self, key: &str, value: &str) -> String {
        let prefix = format!("{}:", key.to_ascii_lowercase());
        let mut out = String::new();
        let mut skipping = false;
        for line in self.raw.lines() {
            if skipping && line.starts_with([' ', '\t']) {
                continue;
            }
            skipping = line.to_ascii_lowercase().starts_with(&prefix);
            if skipping || line.trim().is_empty() {
                continue;
            }
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&format!("{}: {}\n", key, value));
        out
    }

    /// Components and their integration options
    pub fn components(&self) -> Vec<Component> {
        split_list(self.components.as_deref())
            .into_iter()
            .map(|item| match item.split_once('(') {
                Some((logical, options)) => Component {
                    logical: logical.trim().to_string(),
                    options: options
                        .trim_end_matches(')')
                        .split_whitespace()
                        .filter_map(|o| o.parse().ok())
                        .collect(),
                },
                None => Component {
                    logical: item,
                    options: BTreeSet::new(),
                },
            })
            .collect()
    }

    /// System variables as (name, value)
    pub fn sysvars(&self) -> Vec<(String, String)> {
        split_list(self.sysvars.as_deref())
            .into_iter()
            .filter_map(|item| {
                item.split_once('=')
                    .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }

    /// Logical paths of sprite files to add to the icon pool
    pub fn sprites(&self) -> Vec<String> {
        split_list(self.sprites.as_deref())
    }
}

fn split_list(field: Option<&str>) -> Vec<String> {
    field
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZIP: &str = "Package: Zip\n\
Version: 3.0-2\n\
Standards-Version: 0.7\n\
Environment: arm\n\
Installed-Size: 2048\n\
Components: Apps/Zip (Movable LookAt), Apps/Unzip\n\
SysVars: Zip$Options=-9, Zip$Dir=Apps/Zip\n\
Sprites: Apps/Zip/!Sprites\n";

    #[test]
    fn test_parse_control() {
        let control = Control::parse(ZIP).unwrap();
        assert_eq!(control.package, "Zip");
        assert_eq!(control.version, "3.0-2");
        assert_eq!(control.installed_size, Some(2048));
        assert!(control.standards_supported());
    }

    #[test]
    fn test_components_with_options() {
        let control = Control::parse(ZIP).unwrap();
        let components = control.components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].logical, "Apps/Zip");
        assert!(components[0].options.contains(&ComponentOption::LookAt));
        assert!(components[0].options.contains(&ComponentOption::Movable));
        assert!(components[1].options.is_empty());
    }

    #[test]
    fn test_sysvars_and_sprites() {
        let control = Control::parse(ZIP).unwrap();
        assert_eq!(
            control.sysvars(),
            vec![
                ("Zip$Options".to_string(), "-9".to_string()),
                ("Zip$Dir".to_string(), "Apps/Zip".to_string()),
            ]
        );
        assert_eq!(control.sprites(), vec!["Apps/Zip/!Sprites".to_string()]);
    }

    #[test]
    fn test_newer_standards_version_is_unsupported() {
        let control = Control::parse("Package: X\nVersion: 1\nStandards-Version: 9.0\n").unwrap();
        assert!(!control.standards_supported());
    }

    #[test]
    fn test_with_field_replaces_existing_value() {
        let control = Control::parse(ZIP).unwrap();
        let rewritten = control.with_field("Version", "3.1-1");
        let reparsed = Control::parse(&rewritten).unwrap();
        assert_eq!(reparsed.version, "3.1-1");
        assert_eq!(reparsed.package, "Zip");
        assert_eq!(reparsed.installed_size, Some(2048));
    }

    #[test]
    fn test_missing_required_field() {
        assert!(Control::parse("Package: X\n").is_err());
    }
}
