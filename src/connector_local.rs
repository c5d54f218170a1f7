//! Local filesystem source adapter.
//!
//! Walks a directory tree, parses every file a generator matches and keeps
//! the index in step with the tree. Change detection is by modification
//! time: a file is parsed again only when its mtime is strictly newer than
//! the one recorded at its last successful parse.
//!
//! # Configuration
//!
//! ```toml
//! [[sources]]
//! type = "local"
//! root = "./posts"
//! ```
//!
//! Version-control and build directories (`.git`, `target`,
//! `node_modules`) are never walked.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::generator::{Generator, GeneratorRegistry};
use crate::index::Index;
use crate::reconcile::{publish, retire, RefreshReport, TrackedEntry};
use crate::statics::{resolve_under, StaticResolver, StaticStream};
use crate::traits::{SourceAdapter, SourceContext};

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Adapter for a directory on the local filesystem.
pub struct LocalAdapter {
    label: String,
    root: PathBuf,
    generators: Arc<GeneratorRegistry>,
    excludes: GlobSet,
    /// Relative path (with `/` separators) → record.
    tracked: BTreeMap<String, TrackedEntry<SystemTime>>,
}

/// A file found during discovery.
struct Discovered {
    relative: String,
    absolute: PathBuf,
    modified: Option<SystemTime>,
    generator: Arc<dyn Generator>,
}

impl LocalAdapter {
    pub fn new(config: &SourceConfig, ctx: &SourceContext) -> Self {
        Self::with_root(&config.root, Arc::clone(&ctx.generators))
    }

    pub fn with_root(root: impl AsRef<Path>, generators: Arc<GeneratorRegistry>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            label: format!("local:{}", root.display()),
            root,
            generators,
            excludes: GlobSet::empty(),
            tracked: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths currently tracked, sorted.
    pub fn tracked_paths(&self) -> Vec<&str> {
        self.tracked.keys().map(String::as_str).collect()
    }

    /// Drop tracked paths whose file no longer exists. A path that cannot
    /// be stat'ed keeps its entry until the file is known to be gone.
    async fn clean(&mut self, index: &Index) -> Result<usize> {
        let mut gone = Vec::new();
        for relative in self.tracked.keys() {
            match tokio::fs::try_exists(self.root.join(relative)).await {
                Ok(true) => {}
                Ok(false) => gone.push(relative.clone()),
                Err(e) => warn!(
                    source = %self.label,
                    path = %relative,
                    error = %e,
                    "cannot stat tracked file, keeping its entry"
                ),
            }
        }
        self.forget(index, gone).await
    }

    async fn forget(&mut self, index: &Index, paths: Vec<String>) -> Result<usize> {
        let records: Vec<_> = paths
            .iter()
            .filter_map(|p| self.tracked.remove(p).map(|r| (p, r)))
            .collect();
        for (path, _) in &records {
            debug!(source = %self.label, path = %path, "path removed");
        }
        retire(index, records.iter().map(|(_, r)| r)).await?;
        Ok(records.len())
    }

    async fn discover(&self) -> Result<Vec<Discovered>> {
        let root = self.root.clone();
        let excludes = self.excludes.clone();
        let generators = Arc::clone(&self.generators);

        tokio::task::spawn_blocking(move || walk(&root, &excludes, &generators))
            .await
            .context("directory walk task failed")?
    }
}

fn walk(
    root: &Path,
    excludes: &GlobSet,
    generators: &GeneratorRegistry,
) -> Result<Vec<Discovered>> {
    let mut found = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        // Match directories with a trailing component so `**/.git/**` prunes them.
        !excludes.is_match(relative.join("_"))
    });

    for entry in walker {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let Some(generator) = generators.find(&rel_str) else {
            continue;
        };
        let modified = entry.metadata().ok().and_then(|m| m.modified().ok());

        found.push(Discovered {
            relative: rel_str,
            absolute: path.to_path_buf(),
            modified,
            generator,
        });
    }

    // Sort for deterministic ordering
    found.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(found)
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn is_newer(recorded: Option<SystemTime>, current: Option<SystemTime>) -> bool {
    match (recorded, current) {
        (Some(old), Some(new)) => new > old,
        _ => true,
    }
}

#[async_trait]
impl SourceAdapter for LocalAdapter {
    fn label(&self) -> &str {
        &self.label
    }

    async fn install(&mut self, _user: &str, _secret: &str) -> Result<()> {
        let meta = tokio::fs::metadata(&self.root)
            .await
            .with_context(|| format!("Local source root does not exist: {}", self.root.display()))?;
        if !meta.is_dir() {
            bail!("Local source root is not a directory: {}", self.root.display());
        }
        self.excludes = build_globset(DEFAULT_EXCLUDES)?;
        info!(source = %self.label, "local source installed");
        Ok(())
    }

    async fn refresh(&mut self, index: &Index) -> Result<RefreshReport> {
        let mut report = RefreshReport {
            removed: self.clean(index).await?,
            ..Default::default()
        };

        let discovered = self.discover().await?;

        let current: BTreeSet<&str> = discovered.iter().map(|d| d.relative.as_str()).collect();
        let unmatched: Vec<String> = self
            .tracked
            .keys()
            .filter(|p| !current.contains(p.as_str()))
            .cloned()
            .collect();
        report.removed += self.forget(index, unmatched).await?;

        for file in discovered {
            let record = self.tracked.entry(file.relative.clone()).or_default();
            if !is_newer(record.version, file.modified) {
                continue;
            }

            let bytes = match tokio::fs::read(&file.absolute).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(source = %self.label, path = %file.relative, error = %e, "read failed");
                    report.failed += 1;
                    continue;
                }
            };

            let base_dir = file
                .absolute
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.root.clone());
            let statics = LocalStatics {
                root: self.root.clone(),
                base_dir,
            };

            let meta = match file.generator.generate(&bytes, &statics).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(
                        source = %self.label,
                        path = %file.relative,
                        generator = file.generator.name(),
                        error = %e,
                        "parse failed, keeping previous entry"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let resolver = move || -> Arc<dyn StaticResolver> { Arc::new(statics) };
            let added = publish(index, &mut record.entry, meta, resolver).await?;
            record.version = file.modified;
            if added {
                report.added += 1;
            } else {
                report.updated += 1;
            }
        }

        if !report.is_noop() {
            info!(
                source = %self.label,
                added = report.added,
                updated = report.updated,
                removed = report.removed,
                failed = report.failed,
                "refresh complete"
            );
        }
        Ok(report)
    }

    async fn uninstall(&mut self, index: &Index) {
        let tracked = std::mem::take(&mut self.tracked);
        match retire(index, tracked.values()).await {
            Ok(n) => info!(source = %self.label, removed = n, "local source uninstalled"),
            Err(e) => {
                warn!(source = %self.label, error = %e, "uninstall could not reach the index")
            }
        }
    }
}

/// Resolves resources next to a local file, confined to the source root.
#[derive(Debug, Clone)]
pub struct LocalStatics {
    root: PathBuf,
    base_dir: PathBuf,
}

#[async_trait]
impl StaticResolver for LocalStatics {
    async fn open(&self, relative_path: &str) -> StaticStream {
        let Some(path) = resolve_under(&self.root, &self.base_dir, relative_path) else {
            return StaticStream::failed(format!("'{relative_path}' is outside the source root"));
        };
        match tokio::fs::File::open(&path).await {
            Ok(file) => StaticStream::new(file),
            Err(e) => StaticStream::failed(format!("{}: {e}", path.display())),
        }
    }
}
