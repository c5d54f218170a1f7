//! Configuration loading.
//!
//! The engine reads one file describing the sources to synchronize plus a
//! few tuning knobs. TOML is the primary format; a file ending in `.json` is
//! parsed as JSON, either in the same shape or as a bare array of source
//! records with `username`/`password` fields.
//!
//! ```toml
//! [engine]
//! refresh_interval_secs = 10
//!
//! [remote]
//! branch = "main"
//!
//! [[sources]]
//! type = "local"
//! root = "/srv/posts"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EngineConfig {
    /// Seconds between two refresh passes of one source.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Seconds between two reads of the configuration file in `watch` mode.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
    /// Capacity of the index request queue.
    #[serde(default = "default_queue_depth")]
    pub index_queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            reload_interval_secs: default_reload_interval(),
            index_queue_depth: default_queue_depth(),
        }
    }
}

impl EngineConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

fn default_refresh_interval() -> u64 {
    10
}
fn default_reload_interval() -> u64 {
    10
}
fn default_queue_depth() -> usize {
    crate::index::DEFAULT_QUEUE_DEPTH
}

/// Settings shared by every remote (hosted repository) source.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RemoteConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Seconds between background revalidations of cached responses.
    #[serde(default = "default_revalidate_interval")]
    pub revalidate_interval_secs: u64,
    /// Remaining request budget below which cached responses are preferred.
    #[serde(default = "default_rate_limit_floor")]
    pub rate_limit_floor: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            branch: default_branch(),
            revalidate_interval_secs: default_revalidate_interval(),
            rate_limit_floor: default_rate_limit_floor(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl RemoteConfig {
    pub fn revalidate_interval(&self) -> Duration {
        Duration::from_secs(self.revalidate_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}
fn default_branch() -> String {
    "master".to_string()
}
fn default_revalidate_interval() -> u64 {
    60
}
fn default_rate_limit_floor() -> u64 {
    100
}
fn default_request_timeout() -> u64 {
    30
}

/// One configured source.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct SourceConfig {
    /// Registered source type, e.g. `"local"` or `"github"`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Directory for local sources; repository name for remote ones.
    #[serde(default)]
    pub root: String,
    #[serde(default, alias = "username")]
    pub user: String,
    #[serde(default, alias = "password")]
    pub secret: String,
}

impl SourceConfig {
    pub fn new(kind: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            root: root.into(),
            ..Default::default()
        }
    }

    /// Identity of the source across configuration reloads.
    pub fn id(&self) -> String {
        format!("{}-{}", self.kind, self.root)
    }

    fn is_usable(&self) -> bool {
        !self.kind.is_empty() && !self.root.is_empty()
    }
}

/// Input formats [`parse_config`] understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// JSON for `*.json`, TOML for everything else.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonLayout {
    // Tried first: a derived struct would also accept a short array.
    Sources(Vec<SourceConfig>),
    Full(Config),
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content, ConfigFormat::from_path(path))
        .with_context(|| format!("Invalid config file: {}", path.display()))
}

/// Parse and validate configuration text. Records without a type or root
/// are dropped.
pub fn parse_config(content: &str, format: ConfigFormat) -> Result<Config> {
    let mut config: Config = match format {
        ConfigFormat::Toml => toml::from_str(content).context("Failed to parse TOML config")?,
        ConfigFormat::Json => {
            match serde_json::from_str(content).context("Failed to parse JSON config")? {
                JsonLayout::Full(config) => config,
                JsonLayout::Sources(sources) => Config {
                    sources,
                    ..Default::default()
                },
            }
        }
    };

    config.sources.retain(SourceConfig::is_usable);

    if config.engine.refresh_interval_secs == 0 {
        bail!("engine.refresh_interval_secs must be > 0");
    }
    if config.engine.reload_interval_secs == 0 {
        bail!("engine.reload_interval_secs must be > 0");
    }
    if config.engine.index_queue_depth == 0 {
        bail!("engine.index_queue_depth must be > 0");
    }
    if config.remote.revalidate_interval_secs == 0 {
        bail!("remote.revalidate_interval_secs must be > 0");
    }
    if config.remote.request_timeout_secs == 0 {
        bail!("remote.request_timeout_secs must be > 0");
    }
    if config.remote.branch.trim().is_empty() {
        bail!("remote.branch must not be empty");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_with_defaults() {
        let config = parse_config(
            r#"
[[sources]]
type = "local"
root = "/srv/posts"
"#,
            ConfigFormat::Toml,
        )
        .unwrap();

        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.remote.branch, "master");
        assert_eq!(config.remote.api_base, "https://api.github.com");
        assert_eq!(config.sources, vec![SourceConfig::new("local", "/srv/posts")]);
        assert_eq!(config.sources[0].id(), "local-/srv/posts");
    }

    #[test]
    fn legacy_json_array() {
        let config = parse_config(
            r#"[
                {"type": "github", "root": "blog", "username": "octo", "password": "pw"},
                {"type": "", "root": "ignored"},
                {"type": "local", "root": ""},
                {"type": "local", "root": "./posts"}
            ]"#,
            ConfigFormat::Json,
        )
        .unwrap();

        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].user, "octo");
        assert_eq!(config.sources[0].secret, "pw");
        assert_eq!(config.sources[1].root, "./posts");
        assert_eq!(config.engine.refresh_interval_secs, 10);
    }

    #[test]
    fn json_object_layout() {
        let config = parse_config(
            r#"{
                "engine": {"refresh_interval_secs": 3},
                "sources": [{"type": "local", "root": "a"}]
            }"#,
            ConfigFormat::Json,
        )
        .unwrap();
        assert_eq!(config.engine.refresh_interval_secs, 3);
        assert_eq!(config.sources.len(), 1);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = parse_config("[engine]\nrefresh_interval_secs = 0\n", ConfigFormat::Toml)
            .unwrap_err();
        assert!(err.to_string().contains("refresh_interval_secs"));
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(parse_config("[[sources]\n", ConfigFormat::Toml).is_err());
        assert!(parse_config("{", ConfigFormat::Json).is_err());
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(ConfigFormat::from_path(Path::new("a/b.JSON")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("a/b.toml")), ConfigFormat::Toml);
        assert_eq!(ConfigFormat::from_path(Path::new("config")), ConfigFormat::Toml);
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.json");
        std::fs::write(&path, r#"[{"type": "local", "root": "x"}]"#).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.sources[0].kind, "local");

        assert!(load_config(&dir.path().join("missing.toml")).is_err());
    }
}
