// src/status.rs

//! Package status records and the tables that hold them
//!
//! Three tables share this type: *current* (last durably committed
//! reality), *selected* (desired end state) and *previous* (snapshot of
//! current taken when a commit starts). Each is a text file with one
//! tab-separated record per line:
//!
//! ```text
//! name<TAB>version<TAB>state<TAB>flags<TAB>environment
//! ```
//!
//! Missing trailing fields default to empty, so older three-field records
//! still load.

use crate::error::{Error, Result};
use crate::filesystem;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use tracing::{debug, info};

/// Installation state, ordered from absent to fully installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum State {
    #[default]
    NotPresent,
    Removed,
    HalfUnpacked,
    Unpacked,
    HalfConfigured,
    Installed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::NotPresent => "not_present",
            State::Removed => "removed",
            State::HalfUnpacked => "half_unpacked",
            State::Unpacked => "unpacked",
            State::HalfConfigured => "half_configured",
            State::Installed => "installed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "not_present" => Ok(State::NotPresent),
            "removed" => Ok(State::Removed),
            "half_unpacked" => Ok(State::HalfUnpacked),
            "unpacked" => Ok(State::Unpacked),
            "half_configured" => Ok(State::HalfConfigured),
            "installed" => Ok(State::Installed),
            _ => Err(format!("Invalid package state: {}", s)),
        }
    }
}

/// Per-package flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Flag {
    /// Installed only to satisfy another package
    Auto,
    /// Must not change without an explicit request
    Hold,
}

impl Flag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flag::Auto => "auto",
            Flag::Hold => "hold",
        }
    }
}

impl FromStr for Flag {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Flag::Auto),
            "hold" => Ok(Flag::Hold),
            _ => Err(format!("Invalid package flag: {}", s)),
        }
    }
}

/// Status of one package in one table
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    pub state: State,
    pub flags: BTreeSet<Flag>,
    pub version: String,
    pub environment_id: String,
}

impl Status {
    pub fn new(state: State, version: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            state,
            flags: BTreeSet::new(),
            version: version.into(),
            environment_id: environment_id.into(),
        }
    }

    /// Same status with a different state
    pub fn with_state(&self, state: State) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }

    /// True if version or environment differ, the "different build" test
    fn build_differs(&self, other: &Status) -> bool {
        self.version != other.version || self.environment_id != other.environment_id
    }

    /// Encode as a status record line (without newline)
    pub fn to_record(&self, name: &str) -> String {
        let flags = self
            .flags
            .iter()
            .map(Flag::as_str)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}\t{}\t{}\t{}\t{}",
            name, self.version, self.state, flags, self.environment_id
        )
    }

    /// Decode a status record line
    pub fn parse_record(line: &str) -> Result<(String, Status)> {
        let mut fields = line.split('\t');
        let name = fields
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::ParseError(format!("Status record without name: {:?}", line)))?;
        let version = fields.next().unwrap_or("");
        let state = match fields.next() {
            Some(s) if !s.is_empty() => s.parse::<State>().map_err(Error::ParseError)?,
            _ => State::NotPresent,
        };
        let flags = fields
            .next()
            .unwrap_or("")
            .split(',')
            .filter(|f| !f.is_empty())
            .map(|f| f.parse::<Flag>().map_err(Error::ParseError))
            .collect::<Result<BTreeSet<_>>>()?;
        let environment_id = fields.next().unwrap_or("");

        Ok((
            name.to_string(),
            Status {
                state,
                flags,
                version: version.to_string(),
                environment_id: environment_id.to_string(),
            },
        ))
    }
}

/// True if the selected build must be unpacked
pub fn unpack_req(cur: &Status, sel: &Status) -> bool {
    sel.state >= State::Unpacked && (cur.state < State::Unpacked || cur.build_differs(sel))
}

/// True if the current build must be removed
pub fn remove_req(cur: &Status, sel: &Status) -> bool {
    cur.state > State::Removed && (sel.state <= State::Removed || cur.build_differs(sel))
}

/// True if the package must be configured
pub fn config_req(cur: &Status, sel: &Status) -> bool {
    sel.state >= State::Installed && (cur.state < State::Installed || cur.build_differs(sel))
}

/// True if the package must be purged
pub fn purge_req(cur: &Status, sel: &Status) -> bool {
    sel.state == State::NotPresent && cur.state > State::NotPresent
}

/// Change notification delivered to table subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEvent {
    /// In-memory record for this package changed
    Changed(String),
    /// Table written to durable storage
    Committed,
    /// In-memory changes discarded
    RolledBack,
}

/// Receiving end of a table subscription
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: Receiver<TableEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drain all pending events without blocking
    pub fn drain(&self) -> Vec<TableEvent> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        events
    }
}

/// A persisted name → status table with explicit commit/rollback
#[derive(Debug)]
pub struct StatusTable {
    path: PathBuf,
    records: BTreeMap<String, Status>,
    subscribers: Vec<(u64, Sender<TableEvent>)>,
    next_subscriber: u64,
}

impl StatusTable {
    /// Load a table from `path`; a missing file is an empty table
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut table = Self {
            path: path.into(),
            records: BTreeMap::new(),
            subscribers: Vec::new(),
            next_subscriber: 0,
        };
        table.records = table.load()?;
        debug!(
            "Loaded {} status records from {}",
            table.records.len(),
            table.path.display()
        );
        Ok(table)
    }

    fn load(&self) -> Result<BTreeMap<String, Status>> {
        let mut records = BTreeMap::new();
        if let Some(raw) = filesystem::read_recovered(&self.path)? {
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                let (name, status) = Status::parse_record(line)?;
                records.insert(name, status);
            }
        }
        Ok(records)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Status of `name`; absent packages are `not_present`
    pub fn get(&self, name: &str) -> Status {
        self.records.get(name).cloned().unwrap_or_default()
    }

    /// True if the table holds a record for `name`
    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    /// Set the in-memory status of `name`
    pub fn insert(&mut self, name: &str, status: Status) {
        if self.records.get(name) == Some(&status) {
            return;
        }
        self.records.insert(name.to_string(), status);
        self.notify(TableEvent::Changed(name.to_string()));
    }

    /// Iterate over all records in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Status)> {
        self.records.iter()
    }

    /// Package names with a record
    pub fn names(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    /// Replace all records with those of `other`
    pub fn copy_from(&mut self, other: &StatusTable) {
        let changed: BTreeSet<String> = self
            .records
            .keys()
            .chain(other.records.keys())
            .filter(|name| self.records.get(*name) != other.records.get(*name))
            .cloned()
            .collect();
        self.records = other.records.clone();
        for name in changed {
            self.notify(TableEvent::Changed(name));
        }
    }

    /// Write the in-memory records to durable storage
    pub fn commit(&mut self) -> Result<()> {
        let mut payload = String::new();
        for (name, status) in &self.records {
            // Absent and not_present are the same; drop empty records
            if status == &Status::default() {
                continue;
            }
            payload.push_str(&status.to_record(name));
            payload.push('\n');
        }
        filesystem::write_replace(&self.path, payload.as_bytes())?;
        info!("Committed status table {}", self.path.display());
        self.notify(TableEvent::Committed);
        Ok(())
    }

    /// Discard in-memory changes and reload from durable storage
    pub fn rollback(&mut self) -> Result<()> {
        self.records = self.load()?;
        debug!("Rolled back status table {}", self.path.display());
        self.notify(TableEvent::RolledBack);
        Ok(())
    }

    /// Register for change notifications
    pub fn subscribe(&mut self) -> Subscription {
        let (sender, receiver) = mpsc::channel();
        let id = self.next_subscriber;
        self.next_subscriber += 1;
        self.subscribers.push((id, sender));
        Subscription { id, receiver }
    }

    /// Deregister a subscription
    pub fn unsubscribe(&mut self, subscription: Subscription) {
        self.subscribers.retain(|(id, _)| *id != subscription.id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn notify(&mut self, event: TableEvent) {
        // Subscribers that dropped their receiver are pruned here
        self.subscribers
            .retain(|(_, sender)| sender.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn status(state: State, version: &str) -> Status {
        Status::new(state, version, "any")
    }

    #[test]
    fn test_state_ordering() {
        assert!(State::NotPresent < State::Removed);
        assert!(State::HalfUnpacked < State::Unpacked);
        assert!(State::HalfConfigured < State::Installed);
    }

    #[test]
    fn test_record_roundtrip_with_flags() {
        let mut st = status(State::Installed, "1.2-1");
        st.flags.insert(Flag::Auto);
        st.flags.insert(Flag::Hold);

        let line = st.to_record("zip");
        assert_eq!(line, "zip\t1.2-1\tinstalled\tauto,hold\tany");

        let (name, parsed) = Status::parse_record(&line).unwrap();
        assert_eq!(name, "zip");
        assert_eq!(parsed, st);
    }

    #[test]
    fn test_short_record_defaults_trailing_fields() {
        let (name, parsed) = Status::parse_record("zip\t1.0\tunpacked").unwrap();
        assert_eq!(name, "zip");
        assert_eq!(parsed.state, State::Unpacked);
        assert!(parsed.flags.is_empty());
        assert_eq!(parsed.environment_id, "");
    }

    #[test]
    fn test_bad_state_is_rejected() {
        assert!(Status::parse_record("zip\t1.0\tgone").is_err());
    }

    #[test]
    fn test_unpack_req() {
        let absent = Status::default();
        let sel = status(State::Installed, "2");
        assert!(unpack_req(&absent, &sel));
        assert!(!unpack_req(&status(State::Installed, "2"), &sel));
        assert!(unpack_req(&status(State::Installed, "1"), &sel));
        assert!(unpack_req(&status(State::HalfUnpacked, "2"), &sel));

        let mut other_env = status(State::Installed, "2");
        other_env.environment_id = "arm".to_string();
        assert!(unpack_req(&other_env, &sel));

        assert!(!unpack_req(&absent, &status(State::Removed, "2")));
    }

    #[test]
    fn test_remove_req() {
        let cur = status(State::Installed, "1");
        assert!(remove_req(&cur, &status(State::Removed, "1")));
        assert!(remove_req(&cur, &status(State::Installed, "2")));
        assert!(!remove_req(&cur, &status(State::Installed, "1")));
        assert!(!remove_req(&status(State::Removed, "1"), &status(State::NotPresent, "")));
    }

    #[test]
    fn test_config_and_purge_req() {
        let sel = status(State::Installed, "1");
        assert!(config_req(&status(State::Unpacked, "1"), &sel));
        assert!(!config_req(&status(State::Installed, "1"), &sel));

        let purge = Status::default();
        assert!(purge_req(&status(State::Removed, "1"), &purge));
        assert!(!purge_req(&Status::default(), &purge));
        assert!(!purge_req(&status(State::Removed, "1"), &status(State::Removed, "1")));
    }

    #[test]
    fn test_satisfied_package_needs_nothing() {
        let cur = status(State::Installed, "1");
        let sel = status(State::Installed, "1");
        assert!(!unpack_req(&cur, &sel));
        assert!(!remove_req(&cur, &sel));
        assert!(!config_req(&cur, &sel));
        assert!(!purge_req(&cur, &sel));
    }

    #[test]
    fn test_table_commit_and_rollback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("current");

        let mut table = StatusTable::open(&path).unwrap();
        table.insert("zip", status(State::Installed, "1"));
        table.commit().unwrap();

        table.insert("zip", status(State::HalfUnpacked, "2"));
        assert_eq!(table.get("zip").state, State::HalfUnpacked);

        table.rollback().unwrap();
        assert_eq!(table.get("zip"), status(State::Installed, "1"));

        let reopened = StatusTable::open(&path).unwrap();
        assert_eq!(reopened.get("zip"), status(State::Installed, "1"));
    }

    #[test]
    fn test_uncommitted_changes_are_not_durable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("current");

        let mut table = StatusTable::open(&path).unwrap();
        table.insert("zip", status(State::Installed, "1"));

        let reopened = StatusTable::open(&path).unwrap();
        assert!(!reopened.contains("zip"));
    }

    #[test]
    fn test_subscription_receives_events() {
        let dir = tempdir().unwrap();
        let mut table = StatusTable::open(dir.path().join("current")).unwrap();
        let sub = table.subscribe();

        table.insert("zip", status(State::Installed, "1"));
        // Re-inserting an identical record is not a change
        table.insert("zip", status(State::Installed, "1"));
        table.commit().unwrap();

        assert_eq!(
            sub.drain(),
            vec![TableEvent::Changed("zip".to_string()), TableEvent::Committed]
        );

        table.unsubscribe(sub);
        assert_eq!(table.subscriber_count(), 0);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let dir = tempdir().unwrap();
        let mut table = StatusTable::open(dir.path().join("current")).unwrap();
        let sub = table.subscribe();
        drop(sub);

        table.insert("zip", status(State::Installed, "1"));
        assert_eq!(table.subscriber_count(), 0);
    }

    #[test]
    fn test_copy_from_reports_changed_names() {
        let dir = tempdir().unwrap();
        let mut current = StatusTable::open(dir.path().join("current")).unwrap();
        let mut previous = StatusTable::open(dir.path().join("previous")).unwrap();
        current.insert("zip", status(State::Installed, "1"));
        current.insert("unzip", status(State::Installed, "1"));
        previous.insert("zip", status(State::Installed, "1"));

        let sub = previous.subscribe();
        previous.copy_from(&current);

        assert_eq!(sub.drain(), vec![TableEvent::Changed("unzip".to_string())]);
        assert_eq!(previous.get("unzip"), status(State::Installed, "1"));
    }
}
