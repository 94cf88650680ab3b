//! # Stowage CLI
//!
//! Offline tooling for a coordinator's configuration and persisted state.
//!
//! ## Usage
//! ```bash
//! # Check all four filter chains in a configuration directory
//! stowage validate conf/ --slave slave1 --slave slave2
//!
//! # Summarize a saved replica tree
//! stowage inspect tree.snapshot
//!
//! # Show one node of it
//! stowage inspect tree.snapshot --path /mp3/release
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage::{
    format_bytes, snapshot_slave_names, ChainKind, FilterChain, FilterContext, FilterRegistry, MemorySlave,
    ReplicaTree, SlaveRef, SlaveRegistry, StowageConfig,
};
use tracing_subscriber::EnvFilter;

/// Stowage CLI - inspect coordinator configuration and snapshots
#[derive(Parser)]
#[command(name = "stowage")]
#[command(version)]
#[command(about = "Validate slave-selection chains and inspect replica tree snapshots")]
#[command(long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the four filter chains and report their filters
    Validate {
        /// Directory holding slaveselection-*.conf, or a stowage.json file
        conf: PathBuf,

        /// Slave names the chains may refer to
        #[arg(short, long = "slave")]
        slaves: Vec<String>,
    },

    /// Parse a tree snapshot and print statistics
    Inspect {
        /// Snapshot file
        snapshot: PathBuf,

        /// Show a single node instead of the summary
        #[arg(short, long)]
        path: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    let outcome = match cli.command {
        Commands::Validate { conf, slaves } => cmd_validate(&conf, &slaves),
        Commands::Inspect { snapshot, path } => cmd_inspect(&snapshot, path.as_deref()),
    };
    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Offline stand-ins so chains and snapshots can name slaves
fn placeholder_registry<I, S>(names: I) -> Result<SlaveRegistry>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let registry = SlaveRegistry::new();
    for name in names {
        let slave = MemorySlave::new(name);
        slave.set_online(false);
        registry.register(SlaveRef::new(slave))?;
    }
    Ok(registry)
}

/// Load every chain; returns whether all of them are valid
fn cmd_validate(conf: &Path, slaves: &[String]) -> Result<bool> {
    let config = if conf.is_dir() {
        StowageConfig {
            conf_dir: conf.to_path_buf(),
            ..Default::default()
        }
    } else {
        StowageConfig::load(conf).with_context(|| format!("reading {}", conf.display()))?
    };

    let registry = Arc::new(placeholder_registry(slaves.iter().cloned())?);
    let ctx = FilterContext::new(registry, Arc::new(ReplicaTree::new()))
        .with_status_timeout(config.status_timeout()?);
    let filters = FilterRegistry::with_builtins();

    println!(
        "{} {}",
        "Validating chains in".blue().bold(),
        config.conf_dir.display()
    );
    let mut all_ok = true;
    for kind in ChainKind::ALL {
        let path = config.chain_path(kind);
        match FilterChain::load(&path, &filters, &ctx) {
            Ok(chain) if chain.is_empty() => {
                println!("  {} {:<8} {}", "✓".green().bold(), kind.as_str(), "(no filters)".dimmed());
            }
            Ok(chain) => {
                println!(
                    "  {} {:<8} {}",
                    "✓".green().bold(),
                    kind.as_str(),
                    chain.filter_names().join(" -> ")
                );
            }
            Err(e) => {
                all_ok = false;
                println!("  {} {:<8} {}", "✗".red().bold(), kind.as_str(), e.user_message().red());
            }
        }
    }
    Ok(all_ok)
}

/// Print tree statistics, or one node
fn cmd_inspect(snapshot: &Path, path: Option<&str>) -> Result<bool> {
    let text = fs::read_to_string(snapshot).with_context(|| format!("reading {}", snapshot.display()))?;
    let registry = placeholder_registry(snapshot_slave_names(&text))?;
    let tree = ReplicaTree::from_snapshot(&text, &registry)
        .with_context(|| format!("parsing {}", snapshot.display()))?;

    if let Some(path) = path {
        let node = tree.inspect(path)?;
        println!("{} {}", node.kind.as_fact().blue().bold(), node.path.bold());
        println!("  size:      {}", format_bytes(node.size));
        println!("  owner:     {}:{}", node.owner, node.group);
        if node.is_file() {
            println!("  checksum:  {:08X}", node.checksum);
            println!("  replicas:  {}", node.replica_names().join(", "));
        } else {
            println!("  children:  {}", node.children.join(", "));
        }
        if node.deleted {
            println!("  {}", "deleted, waiting for offline replicas".yellow());
        }
        return Ok(true);
    }

    let stats = tree.stats();
    println!("{} {}", "Snapshot".blue().bold(), snapshot.display());
    println!("  directories: {}", stats.directories);
    println!("  files:       {}", stats.files);
    println!("  tombstones:  {}", stats.tombstones);
    println!("  total size:  {}", format_bytes(stats.total_bytes));
    if !stats.files_per_slave.is_empty() {
        println!("\n{}", "Files per slave:".bold());
        for (slave, count) in &stats.files_per_slave {
            println!("  {:<16} {}", slave.yellow(), count);
        }
    }
    Ok(true)
}
