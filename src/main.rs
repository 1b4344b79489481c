// src/main.rs

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use stevedore::config::{KEYS, Settings};
use stevedore::db::models::{Changeset, ComponentUpdate, Setting};
use stevedore::repository;
use stevedore::status::Flag;
use stevedore::{
    CommandTriggerRunner, Commit, CommitState, HostIntegration, HttpDownloader, PackageBase,
    Services, State, Status,
};
use tracing::info;

/// Delay between polls while waiting on a transfer or a script
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser)]
#[command(name = "stevedore")]
#[command(author, version, about = "Transactional package manager with unwindable installs", long_about = None)]
struct Cli {
    /// Install root directory
    #[arg(short, long, global = true, default_value = "/")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the state directory and database under the root
    Init,
    /// Import a package list from a path or URL
    Import {
        /// Package list location
        source: String,
    },
    /// Select packages for installation at their newest available version
    Install {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Select packages for removal, keeping their metadata
    Remove {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Select packages for removal along with their metadata
    Purge {
        #[arg(required = true)]
        packages: Vec<String>,
    },
    /// Keep a package at its current selection
    Hold { package: String },
    /// Release a held package
    Unhold { package: String },
    /// Queue a component move, applied by the next commit
    Move {
        /// Logical component path, e.g. Apps/Hello
        component: String,
        /// New physical location; may use {root}
        path: String,
    },
    /// Record a module as resident on the host
    Module { name: String, version: String },
    /// Show or change a setting
    Config {
        key: Option<String>,
        value: Option<String>,
    },
    /// Show package status
    Status {
        /// Case-insensitive name filter
        pattern: Option<String>,
    },
    /// Show commit history
    History,
    /// Apply the selected status
    Commit,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let root = cli.root;

    match cli.command {
        Commands::Init => {
            info!("Initializing package base at {}", root.display());
            let pb = PackageBase::init(&root)?;
            println!(
                "Package base initialized at: {}",
                pb.layout().state_dir().display()
            );
            Ok(())
        }
        Commands::Import { source } => {
            let mut pb = open(&root)?;
            let settings = pb.settings.clone();
            let count = repository::import(pb.conn_mut(), &source, &settings)?;
            println!("Imported {} packages from {}", count, source);
            Ok(())
        }
        Commands::Install { packages } => {
            let mut pb = open(&root)?;
            for name in &packages {
                let candidate = repository::latest(pb.conn(), name, &pb.environments)?
                    .ok_or_else(|| anyhow!("Package '{}' is not available", name))?;
                let selected = pb.selected.get(name);
                refuse_held(name, &selected)?;

                let mut status = Status::new(
                    State::Installed,
                    candidate.version.clone(),
                    candidate.environment.clone(),
                );
                status.flags = selected.flags;
                pb.selected.insert(name, status);
                println!("Selected {} {}", name, candidate.version);
            }
            pb.selected.commit()?;
            Ok(())
        }
        Commands::Remove { packages } => select_removal(&root, &packages, State::Removed),
        Commands::Purge { packages } => select_removal(&root, &packages, State::NotPresent),
        Commands::Hold { package } => set_hold(&root, &package, true),
        Commands::Unhold { package } => set_hold(&root, &package, false),
        Commands::Move { component, path } => {
            let pb = open(&root)?;
            ComponentUpdate::new(component.clone(), path.clone()).insert(pb.conn())?;
            println!("Queued move of {} to {}", component, path);
            Ok(())
        }
        Commands::Module { name, version } => {
            let mut pb = open(&root)?;
            pb.register_module(&name, &version)?;
            println!("Registered module {} {}", name, version);
            Ok(())
        }
        Commands::Config { key, value } => {
            let pb = open(&root)?;
            match (key, value) {
                (None, _) => {
                    let stored = Setting::list_all(pb.conn())?;
                    for key in KEYS {
                        let value = stored
                            .iter()
                            .find(|(k, _)| k == key)
                            .map(|(_, v)| v.as_str())
                            .unwrap_or("(default)");
                        println!("{} = {}", key, value);
                    }
                }
                (Some(key), None) => {
                    let value = Setting::get(pb.conn(), &key)?;
                    println!("{} = {}", key, value.as_deref().unwrap_or("(default)"));
                }
                (Some(key), Some(value)) => {
                    Settings::store(pb.conn(), &key, &value)?;
                    println!("{} = {}", key, value);
                }
            }
            Ok(())
        }
        Commands::Status { pattern } => {
            let pb = open(&root)?;
            let pattern = pattern.map(|p| p.to_lowercase());
            let mut names: Vec<String> = pb
                .current
                .names()
                .into_iter()
                .chain(pb.selected.names())
                .filter(|n| {
                    pattern
                        .as_deref()
                        .is_none_or(|p| n.to_lowercase().contains(p))
                })
                .collect();
            names.sort_by_key(|n| n.to_lowercase());
            names.dedup();

            if names.is_empty() {
                println!("No packages found.");
                return Ok(());
            }
            for name in names {
                let current = pb.current.get(&name);
                let selected = pb.selected.get(&name);
                let held = if selected.has_flag(Flag::Hold) { " [held]" } else { "" };
                println!(
                    "{:<24} {:<16} {:<12} -> {} {}{}",
                    name,
                    current.state.as_str(),
                    current.version,
                    selected.state,
                    selected.version,
                    held
                );
            }
            Ok(())
        }
        Commands::History => {
            let pb = open(&root)?;
            let changesets = Changeset::list_all(pb.conn())?;
            if changesets.is_empty() {
                println!("No commits recorded.");
                return Ok(());
            }
            for changeset in changesets {
                println!(
                    "[{}] {} {} ({})",
                    changeset.id.unwrap_or_default(),
                    changeset.created_at.as_deref().unwrap_or("-"),
                    changeset.description,
                    changeset.status.as_str()
                );
                let packages = changeset.package_names();
                if !packages.is_empty() {
                    println!("    packages: {}", packages.join(", "));
                }
                if let Some(message) = &changeset.message {
                    println!("    {}", message);
                }
            }
            Ok(())
        }
        Commands::Commit => commit(&root),
    }
}

fn open(root: &Path) -> Result<PackageBase> {
    PackageBase::open(root)
        .with_context(|| format!("No package base at {}; run `stevedore init`", root.display()))
}

fn refuse_held(name: &str, selected: &Status) -> Result<()> {
    if selected.has_flag(Flag::Hold) {
        return Err(anyhow!("Package '{}' is held; unhold it first", name));
    }
    Ok(())
}

fn select_removal(root: &Path, packages: &[String], state: State) -> Result<()> {
    let mut pb = open(root)?;
    for name in packages {
        if !pb.current.contains(name) && !pb.selected.contains(name) {
            return Err(anyhow!("Package '{}' is not known", name));
        }
        let selected = pb.selected.get(name);
        refuse_held(name, &selected)?;
        pb.selected.insert(name, selected.with_state(state));
        println!("Selected {} for {}", name, state);
    }
    pb.selected.commit()?;
    Ok(())
}

fn set_hold(root: &Path, name: &str, hold: bool) -> Result<()> {
    let mut pb = open(root)?;
    if !pb.selected.contains(name) {
        return Err(anyhow!("Package '{}' is not selected", name));
    }
    let mut selected = pb.selected.get(name);
    if hold {
        selected.flags.insert(Flag::Hold);
    } else {
        selected.flags.remove(&Flag::Hold);
    }
    pb.selected.insert(name, selected);
    pb.selected.commit()?;
    println!("{} {}", if hold { "Held" } else { "Released" }, name);
    Ok(())
}

fn commit(root: &Path) -> Result<()> {
    let mut pb = open(root)?;
    let settings = pb.settings.clone();
    let mut downloader = HttpDownloader::new(settings.http_timeout(), settings.download_retries);
    let mut triggers =
        CommandTriggerRunner::new(settings.trigger_shell.clone(), pb.layout().scratch_dir());
    let mut integration = HostIntegration::new(settings);

    let mut commit = Commit::new(&mut pb, "stevedore commit")?;
    let mut services = Services {
        downloader: &mut downloader,
        triggers: &mut triggers,
        integration: &mut integration,
    };

    let mut last = None;
    let mut fetching: Option<String> = None;
    let state = loop {
        let state = commit.poll(&mut pb, &mut services);
        if last != Some(state) {
            report(&commit, state);
            last = Some(state);
        }
        if commit.downloading() != fetching.as_deref() {
            fetching = commit.downloading().map(str::to_string);
            if let Some(name) = &fetching {
                println!("  fetching {}", name);
            }
        }
        if state.is_terminal() {
            break state;
        }
        if matches!(
            state,
            CommitState::Download
                | CommitState::PostRemoveTriggers
                | CommitState::PostInstallTriggers
        ) {
            thread::sleep(POLL_INTERVAL);
        }
    };

    for warning in commit.warnings() {
        println!("warning: {}", warning);
    }

    if state == CommitState::Fail {
        if !commit.files_that_conflict().is_empty() {
            println!("Files that conflict:");
            for path in commit.files_that_conflict() {
                println!("  {}", path.display());
            }
        }
        if !commit.packages_cannot_process().is_empty() {
            println!("Packages that cannot be processed:");
            for name in commit.packages_cannot_process() {
                println!("  {}", name);
            }
        }
        return Err(anyhow!(
            "Commit failed: {}",
            commit.message().unwrap_or("unknown error")
        ));
    }

    let changed = commit.changed_packages();
    if changed.is_empty() {
        println!("Nothing to do.");
    } else {
        let names: Vec<&str> = changed.iter().map(String::as_str).collect();
        println!("Changed: {}", names.join(", "));
    }
    Ok(())
}

fn report(commit: &Commit, state: CommitState) {
    match state {
        CommitState::Download => match commit.bytes_total() {
            Some(total) => println!("Downloading ({} of ~{} bytes)", commit.bytes_done(), total),
            None => println!("Downloading"),
        },
        CommitState::Unpack => println!(
            "Unpacking ({}/{} files)",
            commit.files_done(),
            commit.files_total()
        ),
        CommitState::Done | CommitState::Fail => {}
        other => println!("{}", other),
    }
}
