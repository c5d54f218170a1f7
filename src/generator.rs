//! Generators turn raw source bytes into entries.
//!
//! A [`Generator`] claims the filenames it understands through
//! [`matches`](Generator::matches) and parses them through
//! [`generate`](Generator::generate). The [`GeneratorRegistry`] keeps
//! generators in registration order and hands out the first one that
//! matches, so registering a more specific generator earlier shadows a more
//! general one.
//!
//! ```rust
//! use content_index::generator::GeneratorRegistry;
//!
//! let generators = GeneratorRegistry::with_builtins();
//! assert!(generators.find("posts/hello.md").is_some());
//! assert!(generators.find("posts/cover.png").is_none());
//! ```

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::GenerateError;
use crate::markdown::MarkdownGenerator;
use crate::models::EntryMeta;
use crate::present::PresentGenerator;
use crate::statics::StaticResolver;

/// A stateless parser for one content format.
///
/// Implementations must be pure: the same bytes and the same resolver
/// answers always produce the same [`EntryMeta`].
#[async_trait]
pub trait Generator: Send + Sync {
    /// Short identifier used in logs (e.g. `"markdown"`).
    fn name(&self) -> &str;

    /// Whether this generator handles `filename`.
    fn matches(&self, filename: &str) -> bool;

    /// Parse `input` into an entry snapshot.
    ///
    /// `statics` resolves resources referenced by the document relative to
    /// its location; a failed resolution surfaces as an erroring stream.
    async fn generate(
        &self,
        input: &[u8],
        statics: &dyn StaticResolver,
    ) -> Result<EntryMeta, GenerateError>;
}

/// Ordered, first-match-wins collection of generators.
///
/// Built once at startup and then shared behind an `Arc`; lookups never
/// mutate it.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    generators: Vec<Arc<dyn Generator>>,
}

impl GeneratorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            generators: Vec::new(),
        }
    }

    /// Create a registry with the built-in markdown, article and slide generators.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MarkdownGenerator::new()));
        registry.register(Arc::new(PresentGenerator::article()));
        registry.register(Arc::new(PresentGenerator::slide()));
        registry
    }

    /// Append a generator. Earlier registrations win at lookup time.
    pub fn register(&mut self, generator: Arc<dyn Generator>) {
        self.generators.push(generator);
    }

    /// The first generator whose [`matches`](Generator::matches) accepts `filename`.
    pub fn find(&self, filename: &str) -> Option<Arc<dyn Generator>> {
        self.generators
            .iter()
            .find(|g| g.matches(filename))
            .cloned()
    }

    /// Names of all registered generators, in order.
    pub fn names(&self) -> Vec<&str> {
        self.generators.iter().map(|g| g.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }
}

impl std::fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("generators", &self.names())
            .finish()
    }
}
