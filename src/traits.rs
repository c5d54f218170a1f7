//! Source adapter contract and the type registry.
//!
//! A [`SourceAdapter`] owns everything about one configured source: how to
//! authenticate, how to list and fetch its files and which entries it has
//! published. The orchestrator only sees this trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             SourceRegistry               │
//! │   "local"  ──► LocalAdapter::new         │
//! │   "github" ──► GithubAdapter::new        │
//! │   "<custom>" ► your constructor          │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!   install() → refresh() every tick → uninstall()
//!                │
//!                ▼
//!        Index (add / remove)
//! ```
//!
//! # Usage
//!
//! ```rust
//! use content_index::traits::SourceRegistry;
//!
//! let sources = SourceRegistry::with_builtins();
//! assert!(sources.contains("local"));
//! assert!(sources.contains("github"));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{RemoteConfig, SourceConfig};
use crate::generator::GeneratorRegistry;
use crate::index::Index;

pub use crate::reconcile::RefreshReport;

// ═══════════════════════════════════════════════════════════════════════
// Adapter Trait
// ═══════════════════════════════════════════════════════════════════════

/// One synchronized content source.
///
/// # Lifecycle
///
/// 1. Constructed through the [`SourceRegistry`] from a [`SourceConfig`].
/// 2. [`install`](SourceAdapter::install) verifies the source is usable.
/// 3. [`refresh`](SourceAdapter::refresh) runs once per tick, converging the
///    index with the source.
/// 4. [`uninstall`](SourceAdapter::uninstall) withdraws every entry the
///    adapter published.
///
/// An adapter is driven by exactly one task at a time, hence `&mut self`.
#[async_trait]
pub trait SourceAdapter: Send {
    /// Label used in logs, e.g. `"local:/srv/posts"`.
    fn label(&self) -> &str;

    /// Prepare the adapter. Credentials are passed through untouched.
    async fn install(&mut self, user: &str, secret: &str) -> Result<()>;

    /// Run one reconciliation pass against `index`.
    ///
    /// Per-path failures are logged and counted in the report; an error
    /// means the whole pass was abandoned and should be retried next tick.
    async fn refresh(&mut self, index: &Index) -> Result<RefreshReport>;

    /// Remove every entry this adapter owns from `index` in one batch.
    async fn uninstall(&mut self, index: &Index);
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// What an adapter constructor gets besides its own config record.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub generators: Arc<GeneratorRegistry>,
    pub remote: RemoteConfig,
}

impl SourceContext {
    pub fn new(generators: Arc<GeneratorRegistry>, remote: RemoteConfig) -> Self {
        Self { generators, remote }
    }
}

/// Builds an adapter for one configured source.
pub type SourceConstructor =
    Arc<dyn Fn(&SourceConfig, &SourceContext) -> Box<dyn SourceAdapter> + Send + Sync>;

/// Registry mapping source type names to adapter constructors.
///
/// Built once at startup and passed to the orchestrator.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    constructors: BTreeMap<String, SourceConstructor>,
}

impl SourceRegistry {
    /// Create an empty source registry.
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Create a registry with the built-in `local` and `github` adapters.
    pub fn with_builtins() -> Self {
        use crate::connector_github::GithubAdapter;
        use crate::connector_local::LocalAdapter;

        let mut registry = Self::new();
        registry.register("local", |config, ctx| {
            Box::new(LocalAdapter::new(config, ctx)) as Box<dyn SourceAdapter>
        });
        registry.register("github", |config, ctx| {
            Box::new(GithubAdapter::new(config, ctx)) as Box<dyn SourceAdapter>
        });
        registry
    }

    /// Register a constructor under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&SourceConfig, &SourceContext) -> Box<dyn SourceAdapter> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    /// Build an adapter for `config`, or `None` if its type is unknown.
    pub fn build(
        &self,
        config: &SourceConfig,
        ctx: &SourceContext,
    ) -> Option<Box<dyn SourceAdapter>> {
        self.constructors
            .get(&config.kind)
            .map(|construct| construct(config, ctx))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("types", &self.names())
            .finish()
    }
}
