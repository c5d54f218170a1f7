//! Source lifecycle and refresh scheduling.
//!
//! The [`Orchestrator`] owns the [`Index`] and one task per configured
//! source. Each task runs the adapter's `refresh` on a fixed interval
//! (the first pass starts immediately) until its cancellation token fires,
//! then hands the adapter back so it can be uninstalled.
//!
//! Sources are identified by [`SourceConfig::id`]. [`Orchestrator::apply`]
//! diffs a configuration against the running set: new sources are built,
//! installed and started; sources no longer configured are stopped and
//! uninstalled. [`Orchestrator::run`] repeats that on every reload tick.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{load_config, Config, SourceConfig};
use crate::generator::GeneratorRegistry;
use crate::index::Index;
use crate::reconcile::RefreshReport;
use crate::traits::{SourceAdapter, SourceContext, SourceRegistry};

struct RunningSource {
    label: String,
    cancel: CancellationToken,
    handle: JoinHandle<Box<dyn SourceAdapter>>,
}

/// What one [`Orchestrator::apply`] call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub started: usize,
    pub stopped: usize,
    /// Sources with an unknown type or a failed install.
    pub skipped: usize,
}

/// Outcome of one source in [`Orchestrator::sync_once`].
#[derive(Debug)]
pub struct SyncOutcome {
    pub id: String,
    pub label: String,
    pub result: Result<RefreshReport>,
}

pub struct Orchestrator {
    index: Index,
    sources: Arc<SourceRegistry>,
    ctx: SourceContext,
    refresh_every: Duration,
    running: BTreeMap<String, RunningSource>,
}

impl Orchestrator {
    /// Create an orchestrator with a fresh index sized from `config`.
    pub fn new(
        config: &Config,
        sources: Arc<SourceRegistry>,
        generators: Arc<GeneratorRegistry>,
    ) -> Self {
        Self::with_index(
            Index::with_capacity(config.engine.index_queue_depth),
            config,
            sources,
            generators,
        )
    }

    pub fn with_index(
        index: Index,
        config: &Config,
        sources: Arc<SourceRegistry>,
        generators: Arc<GeneratorRegistry>,
    ) -> Self {
        Self {
            index,
            sources,
            ctx: SourceContext::new(generators, config.remote.clone()),
            refresh_every: config.engine.refresh_interval(),
            running: BTreeMap::new(),
        }
    }

    /// Handle to the shared index; clones talk to the same writer.
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Ids of the sources with a live refresh loop, sorted.
    pub fn running(&self) -> Vec<&str> {
        self.running.keys().map(String::as_str).collect()
    }

    /// Converge the running sources with `config`.
    pub async fn apply(&mut self, config: &Config) -> ApplySummary {
        self.ctx.remote = config.remote.clone();
        self.refresh_every = config.engine.refresh_interval();

        let wanted: BTreeMap<String, &SourceConfig> =
            config.sources.iter().map(|s| (s.id(), s)).collect();
        let mut summary = ApplySummary::default();

        let gone: Vec<String> = self
            .running
            .keys()
            .filter(|id| !wanted.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(source) = self.running.remove(&id) {
                self.stop(&id, source).await;
                summary.stopped += 1;
            }
        }

        for (id, config) in wanted {
            if self.running.contains_key(&id) {
                continue;
            }
            match self.install(config).await {
                Some(adapter) => {
                    let source = self.start(adapter);
                    self.running.insert(id, source);
                    summary.started += 1;
                }
                None => summary.skipped += 1,
            }
        }

        if summary != ApplySummary::default() {
            info!(
                started = summary.started,
                stopped = summary.stopped,
                skipped = summary.skipped,
                running = self.running.len(),
                "sources applied"
            );
        }
        summary
    }

    /// Build and install every configured source, run one refresh pass each
    /// and return without starting any loop.
    pub async fn sync_once(&self, config: &Config) -> Vec<SyncOutcome> {
        let ctx = SourceContext::new(Arc::clone(&self.ctx.generators), config.remote.clone());
        let mut outcomes = Vec::new();
        for source in &config.sources {
            let Some(mut adapter) = install_adapter(&self.sources, source, &ctx).await else {
                continue;
            };
            let result = adapter.refresh(&self.index).await;
            if let Err(e) = &result {
                warn!(source = %adapter.label(), error = %e, "refresh failed");
            }
            outcomes.push(SyncOutcome {
                id: source.id(),
                label: adapter.label().to_string(),
                result,
            });
        }
        outcomes
    }

    /// Apply `config_path` now and again every reload interval until
    /// `cancel` fires, then shut down.
    ///
    /// The first load must succeed; later unreadable or invalid files are
    /// logged and the tick is skipped. Sources whose install failed are
    /// retried on every tick.
    pub async fn run(mut self, config_path: &Path, cancel: CancellationToken) -> Result<()> {
        let config = load_config(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        let mut reload = interval(config.engine.reload_interval());
        reload.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut current = config;
        self.apply(&current).await;
        reload.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = reload.tick() => {
                    match load_config(config_path) {
                        Ok(next) => {
                            if next.engine.reload_interval() != current.engine.reload_interval() {
                                reload = interval(next.engine.reload_interval());
                                reload.set_missed_tick_behavior(MissedTickBehavior::Delay);
                                reload.tick().await;
                            }
                            self.apply(&next).await;
                            current = next;
                        }
                        Err(e) => warn!(
                            path = %config_path.display(),
                            error = %e,
                            "configuration reload failed, keeping current sources"
                        ),
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stop every refresh loop and destroy the index.
    ///
    /// Adapters are not uninstalled: their entries die with the index.
    pub async fn shutdown(mut self) {
        let running = std::mem::take(&mut self.running);
        for source in running.values() {
            source.cancel.cancel();
        }
        for (id, source) in running {
            if let Err(e) = source.handle.await {
                warn!(source = %id, error = %e, "refresh loop ended abnormally");
            }
        }
        self.index.destroy();
        info!("orchestrator stopped");
    }

    async fn install(&self, config: &SourceConfig) -> Option<Box<dyn SourceAdapter>> {
        install_adapter(&self.sources, config, &self.ctx).await
    }

    fn start(&self, adapter: Box<dyn SourceAdapter>) -> RunningSource {
        let cancel = CancellationToken::new();
        let label = adapter.label().to_string();
        let handle = tokio::spawn(refresh_loop(
            adapter,
            self.index.clone(),
            self.refresh_every,
            cancel.clone(),
        ));
        RunningSource { label, cancel, handle }
    }

    async fn stop(&self, id: &str, source: RunningSource) {
        source.cancel.cancel();
        match source.handle.await {
            Ok(mut adapter) => adapter.uninstall(&self.index).await,
            Err(e) => warn!(source = %id, error = %e, "refresh loop ended abnormally"),
        }
        info!(source = %source.label, "source stopped");
    }
}

async fn install_adapter(
    registry: &SourceRegistry,
    config: &SourceConfig,
    ctx: &SourceContext,
) -> Option<Box<dyn SourceAdapter>> {
    let Some(mut adapter) = registry.build(config, ctx) else {
        warn!(kind = %config.kind, root = %config.root, "unsupported source type, skipping");
        return None;
    };
    if let Err(e) = adapter.install(&config.user, &config.secret).await {
        warn!(source = %adapter.label(), error = %e, "install failed, skipping source");
        return None;
    }
    Some(adapter)
}

async fn refresh_loop(
    mut adapter: Box<dyn SourceAdapter>,
    index: Index,
    every: Duration,
    cancel: CancellationToken,
) -> Box<dyn SourceAdapter> {
    let label = adapter.label().to_string();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                if index.is_destroyed() {
                    break;
                }
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    result = adapter.refresh(&index) => {
                        if let Err(e) = result {
                            warn!(
                                source = %label,
                                error = %e,
                                "refresh failed, retrying next tick"
                            );
                        }
                    }
                }
            }
        }
    }

    debug!(source = %label, "refresh loop stopped");
    adapter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entry, EntryMeta};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Journal {
        refreshes: Mutex<BTreeMap<String, usize>>,
        uninstalled: Mutex<Vec<String>>,
        installs: AtomicUsize,
    }

    impl Journal {
        fn refreshes(&self, root: &str) -> usize {
            self.refreshes.lock().get(root).copied().unwrap_or(0)
        }
    }

    /// Publishes one entry keyed by its root on every pass.
    struct Recording {
        root: String,
        label: String,
        journal: Arc<Journal>,
    }

    #[async_trait]
    impl SourceAdapter for Recording {
        fn label(&self) -> &str {
            &self.label
        }

        async fn install(&mut self, _user: &str, secret: &str) -> Result<()> {
            self.journal.installs.fetch_add(1, Ordering::SeqCst);
            anyhow::ensure!(secret != "reject", "credentials rejected");
            Ok(())
        }

        async fn refresh(&mut self, index: &Index) -> Result<RefreshReport> {
            *self.journal.refreshes.lock().entry(self.root.clone()).or_default() += 1;
            let meta = EntryMeta {
                key: self.root.clone(),
                ..Default::default()
            };
            index.add(vec![Arc::new(Entry::detached(meta))]).await?;
            Ok(RefreshReport::default())
        }

        async fn uninstall(&mut self, index: &Index) {
            let _ = index.remove(&[self.root.as_str()]).await;
            self.journal.uninstalled.lock().push(self.root.clone());
        }
    }

    fn orchestrator(journal: &Arc<Journal>, config: &Config) -> Orchestrator {
        let mut sources = SourceRegistry::new();
        let journal = Arc::clone(journal);
        sources.register("fake", move |config, _| {
            Box::new(Recording {
                root: config.root.clone(),
                label: format!("fake:{}", config.root),
                journal: Arc::clone(&journal),
            }) as Box<dyn SourceAdapter>
        });
        Orchestrator::new(config, Arc::new(sources), Arc::new(GeneratorRegistry::new()))
    }

    fn config(sources: &[(&str, &str)]) -> Config {
        let mut config = Config::default();
        for (kind, root) in sources {
            config.sources.push(SourceConfig::new(*kind, *root));
        }
        config
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn apply_skips_unknown_types_and_failed_installs() {
        let journal = Arc::new(Journal::default());
        let mut cfg = config(&[("fake", "a"), ("svn", "b"), ("fake", "c")]);
        cfg.sources[2].secret = "reject".to_string();

        let mut orch = orchestrator(&journal, &cfg);
        let summary = orch.apply(&cfg).await;

        assert_eq!(
            summary,
            ApplySummary {
                started: 1,
                stopped: 0,
                skipped: 2
            }
        );
        assert_eq!(orch.running(), vec!["fake-a"]);
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_runs_immediately_then_every_interval() {
        let journal = Arc::new(Journal::default());
        let cfg = config(&[("fake", "a"), ("fake", "b")]);
        let mut orch = orchestrator(&journal, &cfg);
        orch.apply(&cfg).await;

        settle().await;
        assert_eq!(journal.refreshes("a"), 1);
        assert_eq!(orch.index().get(&["a", "b"]).await.unwrap().len(), 2);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(journal.refreshes("a"), 3);
        assert_eq!(journal.refreshes("b"), 3);
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reapplying_the_same_config_changes_nothing() {
        let journal = Arc::new(Journal::default());
        let cfg = config(&[("fake", "a")]);
        let mut orch = orchestrator(&journal, &cfg);
        orch.apply(&cfg).await;

        assert_eq!(orch.apply(&cfg).await, ApplySummary::default());
        assert_eq!(journal.installs.load(Ordering::SeqCst), 1);
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn removed_source_is_stopped_and_uninstalled() {
        let journal = Arc::new(Journal::default());
        let mut orch = orchestrator(&journal, &Config::default());
        orch.apply(&config(&[("fake", "a"), ("fake", "b")])).await;
        settle().await;

        let summary = orch.apply(&config(&[("fake", "b")])).await;
        assert_eq!(summary.stopped, 1);
        assert_eq!(orch.running(), vec!["fake-b"]);
        assert_eq!(*journal.uninstalled.lock(), vec!["a".to_string()]);
        assert_eq!(orch.index().get_all().await.unwrap().keys(), vec!["b"]);

        let before = journal.refreshes("a");
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(journal.refreshes("a"), before);
        orch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_loops_and_destroys_the_index() {
        let journal = Arc::new(Journal::default());
        let cfg = config(&[("fake", "a")]);
        let mut orch = orchestrator(&journal, &cfg);
        orch.apply(&cfg).await;
        settle().await;

        let index = orch.index().clone();
        orch.shutdown().await;
        assert!(index.is_destroyed());
        assert!(journal.uninstalled.lock().is_empty());
    }

    #[tokio::test]
    async fn sync_once_refreshes_each_source_once() {
        let journal = Arc::new(Journal::default());
        let cfg = config(&[("fake", "a"), ("svn", "x"), ("fake", "b")]);
        let orch = orchestrator(&journal, &cfg);

        let outcomes = orch.sync_once(&cfg).await;
        let ids: Vec<_> = outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["fake-a", "fake-b"]);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert_eq!(journal.refreshes("a"), 1);
        assert!(orch.running().is_empty());
        assert_eq!(orch.index().get_all().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn run_applies_reloads_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.toml");
        let write = |roots: &[&str]| {
            let mut text = String::from("[engine]\nreload_interval_secs = 5\n");
            for root in roots {
                text.push_str(&format!("[[sources]]\ntype = \"fake\"\nroot = \"{root}\"\n"));
            }
            std::fs::write(&path, text).unwrap();
        };
        write(&["a"]);

        let journal = Arc::new(Journal::default());
        let orch = orchestrator(&journal, &Config::default());
        let index = orch.index().clone();
        let cancel = CancellationToken::new();
        let task = {
            let path = path.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orch.run(&path, cancel).await })
        };

        settle().await;
        assert_eq!(journal.refreshes("a"), 1);

        write(&["b"]);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(*journal.uninstalled.lock(), vec!["a".to_string()]);
        assert!(journal.refreshes("b") >= 1);

        std::fs::write(&path, "not [valid toml").unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(index.get_all().await.unwrap().keys(), vec!["b"]);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(index.is_destroyed());
    }
}
