// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;

fn packages_arg() -> Arg {
    Arg::new("packages")
        .required(true)
        .num_args(1..)
        .help("Package names")
}

fn build_cli() -> Command {
    Command::new("stevedore")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Stevedore Contributors")
        .about("Transactional package manager with unwindable installs")
        .subcommand_required(true)
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .value_name("DIR")
                .default_value("/")
                .global(true)
                .help("Install root directory"),
        )
        .subcommand(Command::new("init").about("Create the state directory and database under the root"))
        .subcommand(
            Command::new("import")
                .about("Import a package list from a path or URL")
                .arg(Arg::new("source").required(true).help("Package list location")),
        )
        .subcommand(
            Command::new("install")
                .about("Select packages for installation at their newest available version")
                .arg(packages_arg()),
        )
        .subcommand(
            Command::new("remove")
                .about("Select packages for removal, keeping their metadata")
                .arg(packages_arg()),
        )
        .subcommand(
            Command::new("purge")
                .about("Select packages for removal along with their metadata")
                .arg(packages_arg()),
        )
        .subcommand(
            Command::new("hold")
                .about("Keep a package at its current selection")
                .arg(Arg::new("package").required(true)),
        )
        .subcommand(
            Command::new("unhold")
                .about("Release a held package")
                .arg(Arg::new("package").required(true)),
        )
        .subcommand(
            Command::new("move")
                .about("Queue a component move, applied by the next commit")
                .arg(Arg::new("component").required(true).help("Logical component path"))
                .arg(Arg::new("path").required(true).help("New physical location")),
        )
        .subcommand(
            Command::new("module")
                .about("Record a module as resident on the host")
                .arg(Arg::new("name").required(true))
                .arg(Arg::new("version").required(true)),
        )
        .subcommand(
            Command::new("config")
                .about("Show or change a setting")
                .arg(Arg::new("key"))
                .arg(Arg::new("value")),
        )
        .subcommand(
            Command::new("status")
                .about("Show package status")
                .arg(Arg::new("pattern").help("Case-insensitive name filter")),
        )
        .subcommand(Command::new("history").about("Show commit history"))
        .subcommand(Command::new("commit").about("Apply the selected status"))
}

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed=build.rs");

    let out_dir = env::var("CARGO_MANIFEST_DIR")
        .map(PathBuf::from)
        .map_err(|e| io::Error::other(e.to_string()))?;
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir)?;

    let mut buffer = Vec::new();
    Man::new(build_cli()).render(&mut buffer)?;

    let man_path = man_dir.join("stevedore.1");
    fs::write(&man_path, buffer)?;

    println!("cargo:warning=Man page generated at {}", man_path.display());
    Ok(())
}
