//! # Content Index CLI (`cidx`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cidx sources` | List configured sources and their status |
//! | `cidx sync` | Run one refresh pass over every source and print a summary |
//! | `cidx watch` | Keep sources synchronized, reloading the config, until Ctrl-C |
//! | `cidx get <key>...` | Sync once, then print the entries with the given keys |
//!
//! ## Examples
//!
//! ```bash
//! cidx --config ./sources.toml sync
//! RUST_LOG=content_index=debug cidx --config ./sources.json watch
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use content_index::config::{load_config, Config};
use content_index::generator::GeneratorRegistry;
use content_index::orchestrator::Orchestrator;
use content_index::sources;
use content_index::traits::SourceRegistry;

/// Content Index: keeps an in-memory index of posts synchronized with
/// local directories and GitHub repositories.
#[derive(Parser)]
#[command(name = "cidx", version)]
struct Cli {
    /// Path to the configuration file (TOML, or JSON when it ends in `.json`).
    #[arg(long, global = true, default_value = "./sources.toml")]
    config: PathBuf,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured sources and whether they look usable.
    Sources,

    /// Run one refresh pass over every source.
    Sync,

    /// Keep every source synchronized until interrupted.
    ///
    /// The configuration file is re-read on every reload tick; added
    /// sources are started and removed ones are uninstalled.
    Watch,

    /// Sync once, then print the entries with the given keys.
    Get {
        /// Entry keys; all entries when omitted.
        keys: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = load_config(&cli.config)?;
    let registry = Arc::new(SourceRegistry::with_builtins());
    let generators = Arc::new(GeneratorRegistry::with_builtins());

    match cli.command {
        Commands::Sources => {
            sources::list_sources(&cfg, &registry)?;
        }
        Commands::Sync => {
            run_sync(&cfg, registry, generators).await?;
        }
        Commands::Watch => {
            let orchestrator = Orchestrator::new(&cfg, registry, generators);
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, stopping");
                    on_signal.cancel();
                }
            });
            orchestrator.run(&cli.config, cancel).await?;
        }
        Commands::Get { keys } => {
            run_get(&cfg, registry, generators, &keys).await?;
        }
    }

    Ok(())
}

async fn run_sync(
    cfg: &Config,
    registry: Arc<SourceRegistry>,
    generators: Arc<GeneratorRegistry>,
) -> Result<()> {
    let orchestrator = Orchestrator::new(cfg, registry, generators);
    let outcomes = orchestrator.sync_once(cfg).await;

    println!("{:<40} {:>6} {:>8} {:>8} {:>7}", "SOURCE", "ADDED", "UPDATED", "REMOVED", "FAILED");
    let mut errors = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(r) => println!(
                "{:<40} {:>6} {:>8} {:>8} {:>7}",
                outcome.label, r.added, r.updated, r.removed, r.failed
            ),
            Err(e) => {
                errors += 1;
                println!("{:<40} error: {e:#}", outcome.label);
            }
        }
    }

    let total = orchestrator.index().get_all().await?.len();
    println!("\n{total} entries indexed from {} sources", outcomes.len());
    orchestrator.shutdown().await;

    if errors > 0 {
        bail!("{errors} source(s) failed to sync");
    }
    Ok(())
}

async fn run_get(
    cfg: &Config,
    registry: Arc<SourceRegistry>,
    generators: Arc<GeneratorRegistry>,
    keys: &[String],
) -> Result<()> {
    let orchestrator = Orchestrator::new(cfg, registry, generators);
    orchestrator.sync_once(cfg).await;

    let mut entries = orchestrator.index().get(keys).await?;
    entries.sort_by_date();
    for entry in entries.iter() {
        let meta = entry.snapshot();
        println!("key:    {}", meta.key);
        println!("title:  {}", meta.title);
        println!("date:   {}", meta.date.format("%Y-%m-%d"));
        if !meta.tags.is_empty() {
            println!("tags:   {}", meta.tags.join(", "));
        }
        if meta.is_slide {
            println!("kind:   slide");
        }
        for path in &meta.static_list {
            println!("static: {path}");
        }
        println!("\n{}\n", meta.content);
    }

    orchestrator.shutdown().await;
    Ok(())
}
