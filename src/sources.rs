use std::path::Path;

use anyhow::Result;

use crate::config::{Config, SourceConfig};
use crate::traits::SourceRegistry;

/// Static health of one configured source, as shown by `cidx sources`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub kind: String,
    pub root: String,
    /// The type has a registered constructor.
    pub supported: bool,
    /// The root looks usable without contacting anything remote.
    pub healthy: bool,
    pub note: &'static str,
}

pub fn source_status(source: &SourceConfig, registry: &SourceRegistry) -> SourceStatus {
    let supported = registry.contains(&source.kind);
    let (healthy, note) = if !supported {
        (false, "UNSUPPORTED TYPE")
    } else {
        match source.kind.as_str() {
            "local" if Path::new(&source.root).is_dir() => (true, "OK"),
            "local" => (false, "ROOT NOT A DIRECTORY"),
            "github" if !source.root.contains('/') && source.user.is_empty() => {
                (false, "NO OWNER (set user or owner/name)")
            }
            _ => (true, "OK"),
        }
    };
    SourceStatus {
        kind: source.kind.clone(),
        root: source.root.clone(),
        supported,
        healthy,
        note,
    }
}

pub fn list_sources(config: &Config, registry: &SourceRegistry) -> Result<()> {
    if config.sources.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    println!("{:<10} {:<40} {:<36} HEALTHY", "TYPE", "ROOT", "STATUS");
    for source in &config.sources {
        let status = source_status(source, registry);
        println!(
            "{:<10} {:<40} {:<36} {}",
            status.kind, status.root, status.note, status.healthy
        );
    }

    Ok(())
}
