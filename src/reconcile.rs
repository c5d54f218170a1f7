//! Per-path publish/retire steps shared by the source adapters.
//!
//! An adapter keeps one [`TrackedEntry`] per source path. When a path parses
//! successfully its entry is [published](publish): the existing `Arc<Entry>`
//! gets the new snapshot (so readers already holding it see the change) and
//! is re-added to the index under its possibly new key. When a path goes
//! away its entry is [retired](retire).

use std::sync::Arc;

use tracing::debug;

use crate::error::IndexError;
use crate::index::Index;
use crate::models::{Entry, EntryMeta, Keyed};
use crate::statics::StaticResolver;

/// Adapter-owned record for one source path.
///
/// `entry` is `None` until the path parses successfully for the first time.
/// `version` is the adapter's change token for the path (a modification time,
/// a blob hash).
#[derive(Debug, Clone)]
pub struct TrackedEntry<V> {
    pub entry: Option<Arc<Entry>>,
    pub version: Option<V>,
}

impl<V> Default for TrackedEntry<V> {
    fn default() -> Self {
        Self {
            entry: None,
            version: None,
        }
    }
}

impl<V> TrackedEntry<V> {
    pub fn key(&self) -> Option<String> {
        self.entry.as_ref().map(|e| e.key())
    }
}

/// Counters for one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Paths seen for the first time and published.
    pub added: usize,
    /// Known paths re-parsed and republished.
    pub updated: usize,
    /// Paths that disappeared from the source.
    pub removed: usize,
    /// Paths whose fetch or parse failed; their previous entry is kept.
    pub failed: usize,
    /// Set when the whole pass was skipped because nothing changed upstream.
    pub unchanged: bool,
}

impl RefreshReport {
    pub fn unchanged() -> Self {
        Self {
            unchanged: true,
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0 && self.failed == 0
    }
}

/// Publish a freshly generated snapshot for a tracked path.
///
/// With an existing entry, the snapshot replaces the old one in place. If the
/// key changed, the old key is removed from the index first so no stale key
/// survives. Returns `true` when the path was new.
pub async fn publish(
    index: &Index,
    slot: &mut Option<Arc<Entry>>,
    meta: EntryMeta,
    statics: impl FnOnce() -> Arc<dyn StaticResolver>,
) -> Result<bool, IndexError> {
    match slot {
        Some(entry) => {
            let old_key = entry.key();
            if old_key != meta.key {
                debug!(old = %old_key, new = %meta.key, "entry key changed");
                index.remove(&[old_key]).await?;
            }
            entry.update(meta);
            index.add(vec![Arc::clone(entry)]).await?;
            Ok(false)
        }
        None => {
            let entry = Arc::new(Entry::new(meta, statics()));
            index.add(vec![Arc::clone(&entry)]).await?;
            *slot = Some(entry);
            Ok(true)
        }
    }
}

/// Remove the entries of all given records from the index in one batch.
pub async fn retire<'a, V: 'a>(
    index: &Index,
    records: impl IntoIterator<Item = &'a TrackedEntry<V>>,
) -> Result<usize, IndexError> {
    let keys: Vec<String> = records.into_iter().filter_map(TrackedEntry::key).collect();
    if keys.is_empty() {
        return Ok(0);
    }
    index.remove(&keys).await?;
    Ok(keys.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statics::NoStatics;

    fn meta(key: &str, content: &str) -> EntryMeta {
        EntryMeta {
            key: key.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    fn no_statics() -> Arc<dyn StaticResolver> {
        Arc::new(NoStatics)
    }

    #[tokio::test]
    async fn publish_reuses_the_same_entry() {
        let index = Index::spawn();
        let mut slot = None;

        assert!(publish(&index, &mut slot, meta("a", "v1"), no_statics).await.unwrap());
        let first = slot.clone().unwrap();

        assert!(!publish(&index, &mut slot, meta("a", "v2"), no_statics).await.unwrap());
        assert!(Arc::ptr_eq(&first, slot.as_ref().unwrap()));
        assert_eq!(first.content(), "v2");
        assert_eq!(index.get(&["a"]).await.unwrap().content[0].content(), "v2");
    }

    #[tokio::test]
    async fn publish_drops_the_old_key_on_rename() {
        let index = Index::spawn();
        let mut slot = None;
        publish(&index, &mut slot, meta("old", "x"), no_statics).await.unwrap();
        publish(&index, &mut slot, meta("new", "x"), no_statics).await.unwrap();

        assert_eq!(index.get_all().await.unwrap().keys(), vec!["new"]);
    }

    #[tokio::test]
    async fn retire_removes_in_one_batch_and_skips_unparsed() {
        let index = Index::spawn();
        let mut records = vec![TrackedEntry::<u32>::default(); 3];
        publish(&index, &mut records[0].entry, meta("a", ""), no_statics).await.unwrap();
        publish(&index, &mut records[2].entry, meta("c", ""), no_statics).await.unwrap();
        index.add(vec![Arc::new(Entry::detached(meta("other", "")))]).await.unwrap();

        assert_eq!(retire(&index, &records).await.unwrap(), 2);
        assert_eq!(index.get_all().await.unwrap().keys(), vec!["other"]);
    }
}
