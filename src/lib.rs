//! # Content Index
//!
//! Keeps an in-memory index of rendered posts and slide decks synchronized
//! with one or more content sources (local directories, GitHub repositories).
//!
//! Source files are turned into entries by pluggable generators, published
//! into a single-writer [`index::Index`], and queried concurrently by any
//! number of callers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Sources    │──▶│  Generators  │──▶│    Index     │◀── get / add / remove
//! │ local/github │   │ md/article/  │   │ (one writer) │
//! └──────┬───────┘   │    slide     │   └──────────────┘
//!        │           └──────────────┘
//!        ▼
//! ┌──────────────┐
//! │ Cached HTTP  │  ETag revalidation, rate budget
//! └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cidx --config ./sources.toml sources     # check configured sources
//! cidx --config ./sources.toml sync        # one pass, print a summary
//! cidx --config ./sources.toml watch       # keep syncing until Ctrl-C
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML/JSON configuration parsing |
//! | [`models`] | Entry snapshots and query results |
//! | [`key`] | Key derivation |
//! | [`statics`] | Resources referenced by entries |
//! | [`generator`] | Generator contract and registry |
//! | [`markdown`] | Markdown posts |
//! | [`present`] | Articles and slide decks |
//! | [`index`] | Single-writer index actor |
//! | [`error`] | Typed errors |
//! | [`reconcile`] | Publish/retire helpers for adapters |
//! | [`traits`] | Source adapter contract and registry |
//! | [`connector_local`] | Local directory source |
//! | [`cache`] | Conditional-GET response cache |
//! | [`connector_github`] | GitHub repository source |
//! | [`orchestrator`] | Source lifecycle and refresh loops |
//! | [`sources`] | Source status listing |

pub mod cache;
pub mod config;
pub mod connector_github;
pub mod connector_local;
pub mod error;
pub mod generator;
pub mod index;
pub mod key;
pub mod markdown;
pub mod models;
pub mod orchestrator;
pub mod present;
pub mod reconcile;
pub mod sources;
pub mod statics;
pub mod traits;
