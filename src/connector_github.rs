//! GitHub repository source adapter.
//!
//! Mirrors the files of one branch of a GitHub repository into the index.
//!
//! Each refresh pass:
//!
//! 1. Reads the branch tip commit. If it equals the commit of the last
//!    completed pass, nothing else happens.
//! 2. Lists the commit's tree recursively and keeps the blobs a generator
//!    matches, sorted by path.
//! 3. Removes entries whose path is no longer in the listing.
//! 4. Fetches and parses every path whose blob SHA differs from the one it
//!    was last parsed at.
//! 5. Records the commit, but only if every fetch succeeded, so a pass that
//!    hit a network error is retried in full on the next tick.
//!
//! The branch tip goes through a [`CachedClient`], so an unchanged branch
//! costs one conditional request per tick. Trees and blobs are addressed by
//! immutable ids and fetched uncached.
//!
//! # Configuration
//!
//! ```toml
//! [[sources]]
//! type = "github"
//! root = "octocat/blog-posts"   # or just "blog-posts" to use `user` as owner
//! user = "octocat"
//! secret = "ghp_..."
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CachedClient, ReqwestTransport};
use crate::config::{RemoteConfig, SourceConfig};
use crate::generator::GeneratorRegistry;
use crate::index::Index;
use crate::reconcile::{publish, retire, RefreshReport, TrackedEntry};
use crate::statics::{join_relative, StaticResolver, StaticStream};
use crate::traits::{SourceAdapter, SourceContext};

// ============ API ============

/// One item of a recursive tree listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TreeItem {
    pub path: String,
    pub sha: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl TreeItem {
    pub fn blob(path: &str, sha: &str) -> Self {
        Self {
            path: path.to_string(),
            sha: sha.to_string(),
            kind: "blob".to_string(),
        }
    }

    pub fn is_blob(&self) -> bool {
        self.kind == "blob"
    }
}

/// The repository operations the adapter needs.
#[async_trait]
pub trait RepoApi: Send + Sync {
    /// Commit SHA at the tip of the configured branch.
    async fn branch_tip(&self) -> Result<String>;

    /// Every item reachable from `commit`.
    async fn tree(&self, commit: &str) -> Result<Vec<TreeItem>>;

    /// Raw content of the blob `sha`.
    async fn blob(&self, sha: &str) -> Result<Vec<u8>>;
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: String,
    #[serde(default)]
    encoding: String,
}

/// [`RepoApi`] over the GitHub REST API.
pub struct GithubApi {
    client: Arc<CachedClient>,
    repo_url: String,
    branch: String,
    /// Last parsed tip response, reused while the cache returns the same payload.
    tip: Mutex<Option<(Arc<[u8]>, String)>>,
}

impl GithubApi {
    pub fn new(
        client: Arc<CachedClient>,
        api_base: &str,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Self {
        Self {
            client,
            repo_url: format!("{}/repos/{owner}/{name}", api_base.trim_end_matches('/')),
            branch: branch.to_string(),
            tip: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RepoApi for GithubApi {
    async fn branch_tip(&self) -> Result<String> {
        let url = format!("{}/commits/{}", self.repo_url, self.branch);
        let fetched = self.client.get(&url).await?;

        if let Some((payload, sha)) = &*self.tip.lock() {
            if Arc::ptr_eq(payload, &fetched.payload) {
                return Ok(sha.clone());
            }
        }

        let commit: CommitResponse =
            serde_json::from_slice(&fetched.payload).with_context(|| format!("parsing {url}"))?;
        *self.tip.lock() = Some((fetched.payload, commit.sha.clone()));
        Ok(commit.sha)
    }

    async fn tree(&self, commit: &str) -> Result<Vec<TreeItem>> {
        // Keyed by commit, so never revalidated; the tip check guards refetches.
        let url = format!("{}/git/trees/{commit}?recursive=1", self.repo_url);
        let body = self.client.fetch(&url).await?;
        let tree: TreeResponse =
            serde_json::from_slice(&body).with_context(|| format!("parsing {url}"))?;
        if tree.truncated {
            warn!(url = %url, "tree listing truncated by the API");
        }
        Ok(tree.tree)
    }

    async fn blob(&self, sha: &str) -> Result<Vec<u8>> {
        let url = format!("{}/git/blobs/{sha}", self.repo_url);
        let body = self.client.fetch(&url).await?;
        let blob: BlobResponse =
            serde_json::from_slice(&body).with_context(|| format!("parsing {url}"))?;
        decode_blob(blob)
    }
}

fn decode_blob(blob: BlobResponse) -> Result<Vec<u8>> {
    match blob.encoding.as_str() {
        "base64" => {
            let compact: String = blob.content.split_whitespace().collect();
            Ok(base64::engine::general_purpose::STANDARD.decode(compact)?)
        }
        "utf-8" | "" => Ok(blob.content.into_bytes()),
        other => bail!("unsupported blob encoding: {other}"),
    }
}

// ============ Statics ============

/// Path → blob SHA of the latest listed tree, shared with every entry.
type TreeMap = Arc<RwLock<HashMap<String, String>>>;

/// Resolves resources next to a repository file through the latest tree.
struct RemoteStatics {
    api: Arc<dyn RepoApi>,
    tree: TreeMap,
    base_dir: String,
}

#[async_trait]
impl StaticResolver for RemoteStatics {
    async fn open(&self, relative_path: &str) -> StaticStream {
        let Some(path) = join_relative(&self.base_dir, relative_path) else {
            return StaticStream::failed(format!("'{relative_path}' is outside the repository"));
        };
        let sha = self.tree.read().get(&path).cloned();
        let Some(sha) = sha else {
            return StaticStream::failed(format!("{path}: not in repository tree"));
        };
        match self.api.blob(&sha).await {
            Ok(bytes) => StaticStream::from_bytes(bytes),
            Err(e) => StaticStream::failed(format!("{path}: {e}")),
        }
    }
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

// ============ Adapter ============

/// Adapter for one branch of a GitHub repository.
pub struct GithubAdapter {
    label: String,
    owner: String,
    name: String,
    remote: RemoteConfig,
    generators: Arc<GeneratorRegistry>,
    api: Option<Arc<dyn RepoApi>>,
    revalidator: Option<CancellationToken>,
    tree: TreeMap,
    /// Repository path → record, versioned by blob SHA.
    tracked: BTreeMap<String, TrackedEntry<String>>,
    last_commit: Option<String>,
}

impl GithubAdapter {
    pub fn new(config: &SourceConfig, ctx: &SourceContext) -> Self {
        let (owner, name) = match config.root.split_once('/') {
            Some((owner, name)) => (owner.to_string(), name.to_string()),
            None => (String::new(), config.root.clone()),
        };
        Self {
            label: format!("github:{}", config.root),
            owner,
            name,
            remote: ctx.remote.clone(),
            generators: Arc::clone(&ctx.generators),
            api: None,
            revalidator: None,
            tree: Arc::new(RwLock::new(HashMap::new())),
            tracked: BTreeMap::new(),
            last_commit: None,
        }
    }

    /// Build an adapter over an existing API client; `install` then skips
    /// building its own.
    pub fn with_api(
        root: &str,
        generators: Arc<GeneratorRegistry>,
        api: Arc<dyn RepoApi>,
    ) -> Self {
        let ctx = SourceContext::new(generators, RemoteConfig::default());
        let mut adapter = Self::new(&SourceConfig::new("github", root), &ctx);
        adapter.api = Some(api);
        adapter
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Commit of the last completed pass.
    pub fn last_commit(&self) -> Option<&str> {
        self.last_commit.as_deref()
    }

    pub fn tracked_paths(&self) -> Vec<&str> {
        self.tracked.keys().map(String::as_str).collect()
    }

    fn stop_revalidator(&mut self) {
        if let Some(cancel) = self.revalidator.take() {
            cancel.cancel();
        }
    }
}

impl Drop for GithubAdapter {
    fn drop(&mut self) {
        self.stop_revalidator();
    }
}

#[async_trait]
impl SourceAdapter for GithubAdapter {
    fn label(&self) -> &str {
        &self.label
    }

    async fn install(&mut self, user: &str, secret: &str) -> Result<()> {
        if self.owner.is_empty() {
            self.owner = user.to_string();
        }
        if self.owner.is_empty() || self.name.is_empty() {
            bail!("GitHub source '{}' needs an owner and a repository name", self.label);
        }
        if self.api.is_none() {
            let transport = ReqwestTransport::new(user, secret, self.remote.request_timeout())?;
            let client = Arc::new(CachedClient::new(
                Arc::new(transport),
                self.remote.rate_limit_floor,
            ));
            let cancel = CancellationToken::new();
            client.spawn_revalidator(self.remote.revalidate_interval(), cancel.clone());
            self.revalidator = Some(cancel);
            self.api = Some(Arc::new(GithubApi::new(
                client,
                &self.remote.api_base,
                &self.owner,
                &self.name,
                &self.remote.branch,
            )));
        }
        info!(
            source = %self.label,
            owner = %self.owner,
            repo = %self.name,
            "github source installed"
        );
        Ok(())
    }

    async fn refresh(&mut self, index: &Index) -> Result<RefreshReport> {
        let api = self
            .api
            .clone()
            .with_context(|| format!("{} is not installed", self.label))?;

        let tip = api.branch_tip().await.context("reading branch tip")?;
        if self.last_commit.as_deref() == Some(tip.as_str()) {
            debug!(source = %self.label, commit = %tip, "branch unchanged");
            return Ok(RefreshReport::unchanged());
        }

        let items = api.tree(&tip).await.context("listing tree")?;
        let mut matched: Vec<(String, String)> = items
            .iter()
            .filter(|item| item.is_blob() && self.generators.find(&item.path).is_some())
            .map(|item| (item.path.clone(), item.sha.clone()))
            .collect();
        matched.sort();
        *self.tree.write() = items
            .into_iter()
            .filter(TreeItem::is_blob)
            .map(|item| (item.path, item.sha))
            .collect();

        let mut report = RefreshReport::default();

        // Clean
        let gone: Vec<String> = self
            .tracked
            .keys()
            .filter(|p| matched.binary_search_by(|(m, _)| m.as_str().cmp(p.as_str())).is_err())
            .cloned()
            .collect();
        let retired: Vec<_> = gone.iter().filter_map(|p| self.tracked.remove(p)).collect();
        report.removed = retired.len();
        retire(index, &retired).await?;

        // Update
        let mut fetch_errors = 0;
        for (path, sha) in matched {
            let record = self.tracked.entry(path.clone()).or_default();
            if record.version.as_deref() == Some(sha.as_str()) {
                continue;
            }
            let Some(generator) = self.generators.find(&path) else {
                continue;
            };

            let bytes = match api.blob(&sha).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(source = %self.label, path = %path, error = %e, "fetch failed");
                    fetch_errors += 1;
                    continue;
                }
            };

            let statics = RemoteStatics {
                api: Arc::clone(&api),
                tree: Arc::clone(&self.tree),
                base_dir: parent_dir(&path).to_string(),
            };
            let meta = match generator.generate(&bytes, &statics).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(
                        source = %self.label,
                        path = %path,
                        error = %e,
                        "parse failed, keeping previous entry"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let resolver = move || -> Arc<dyn StaticResolver> { Arc::new(statics) };
            let added = publish(index, &mut record.entry, meta, resolver).await?;
            record.version = Some(sha);
            if added {
                report.added += 1;
            } else {
                report.updated += 1;
            }
        }
        report.failed += fetch_errors;

        if fetch_errors == 0 {
            self.last_commit = Some(tip);
        } else {
            warn!(source = %self.label, errors = fetch_errors, "pass incomplete, will retry");
        }

        info!(
            source = %self.label,
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            failed = report.failed,
            "refresh complete"
        );
        Ok(report)
    }

    async fn uninstall(&mut self, index: &Index) {
        self.stop_revalidator();
        let tracked = std::mem::take(&mut self.tracked);
        match retire(index, tracked.values()).await {
            Ok(n) => info!(source = %self.label, removed = n, "github source uninstalled"),
            Err(e) => {
                warn!(source = %self.label, error = %e, "uninstall could not reach the index")
            }
        }
        self.last_commit = None;
    }
}
