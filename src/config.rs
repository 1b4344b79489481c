// src/config.rs

//! Database-backed settings
//!
//! There are no configuration files. Settings live in the `settings` table
//! and are read into [`Settings`] once per command; anything unset takes
//! its default.

use crate::db::models::Setting;
use crate::error::{Error, Result};
use rusqlite::Connection;
use std::time::Duration;

/// Keys accepted by `stevedore config`
pub const KEYS: &[&str] = &[
    "environments",
    "trigger_shell",
    "boot_command",
    "run_command",
    "apps_command",
    "http_timeout_secs",
    "download_retries",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Environment features the host provides
    pub environments: Vec<String>,
    /// Shell used to run trigger scripts
    pub trigger_shell: String,
    /// Command run for each component newly flagged LookAt
    pub boot_command: Option<String>,
    /// Command run for each component newly flagged Run
    pub run_command: Option<String>,
    /// Command run for each component newly flagged AddToApps
    pub apps_command: Option<String>,
    pub http_timeout_secs: u64,
    pub download_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environments: vec!["any".to_string(), "arm".to_string(), "arm32".to_string()],
            trigger_shell: "sh".to_string(),
            boot_command: None,
            run_command: None,
            apps_command: None,
            http_timeout_secs: 30,
            download_retries: 3,
        }
    }
}

impl Settings {
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut settings = Self::default();
        for (key, value) in Setting::list_all(conn)? {
            settings.apply(&key, &value)?;
        }
        Ok(settings)
    }

    /// Validate and store one setting
    pub fn store(conn: &Connection, key: &str, value: &str) -> Result<()> {
        Self::default().apply(key, value)?;
        Setting::set(conn, key, value)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let command = |v: &str| {
            let v = v.trim();
            (!v.is_empty()).then(|| v.to_string())
        };

        match key {
            "environments" => {
                self.environments = value
                    .split(',')
                    .map(|e| e.trim().to_lowercase())
                    .filter(|e| !e.is_empty())
                    .collect();
            }
            "trigger_shell" => self.trigger_shell = value.trim().to_string(),
            "boot_command" => self.boot_command = command(value),
            "run_command" => self.run_command = command(value),
            "apps_command" => self.apps_command = command(value),
            "http_timeout_secs" => {
                self.http_timeout_secs = value.trim().parse().map_err(|_| {
                    Error::ParseError(format!("http_timeout_secs must be a number: {}", value))
                })?;
            }
            "download_retries" => {
                self.download_retries = value.trim().parse().map_err(|_| {
                    Error::ParseError(format!("download_retries must be a number: {}", value))
                })?;
            }
            _ => return Err(Error::NotFoundError(format!("Unknown setting: {}", key))),
        }
        Ok(())
    }
}
