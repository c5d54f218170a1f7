//! Core data models.
//!
//! An [`EntryMeta`] is one immutable snapshot of a rendered content item. An
//! [`Entry`] wraps the current snapshot behind a read/write lock so that the
//! owning source adapter can replace it while readers holding the same
//! `Arc<Entry>` keep seeing whole snapshots, never a mix of two.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::statics::{NoStatics, StaticResolver, StaticStream};

/// Anything identifiable by a key.
pub trait Keyed {
    /// Returns the key; an empty string means "no key".
    fn key(&self) -> String;
}

impl Keyed for str {
    fn key(&self) -> String {
        self.to_string()
    }
}

impl Keyed for String {
    fn key(&self) -> String {
        self.clone()
    }
}

impl<T: Keyed + ?Sized> Keyed for &T {
    fn key(&self) -> String {
        (**self).key()
    }
}

impl<T: Keyed + ?Sized> Keyed for Arc<T> {
    fn key(&self) -> String {
        (**self).key()
    }
}

/// One rendered content item, as produced by a [`Generator`](crate::generator::Generator).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntryMeta {
    /// Unique key within the index.
    pub key: String,
    pub title: String,
    pub date: DateTime<Utc>,
    /// Pre-rendered HTML.
    pub content: String,
    /// Tags in document order.
    pub tags: Vec<String>,
    pub is_slide: bool,
    /// Resource links the content references, in document order.
    pub static_list: Vec<String>,
}

impl Keyed for EntryMeta {
    fn key(&self) -> String {
        self.key.clone()
    }
}

/// Thread-safe accessor over the current [`EntryMeta`] snapshot.
///
/// Every accessor returns an owned copy taken under the shared lock;
/// [`update`](Entry::update) swaps the whole snapshot under the exclusive
/// lock.
pub struct Entry {
    meta: RwLock<Arc<EntryMeta>>,
    statics: Arc<dyn StaticResolver>,
}

impl Entry {
    /// Create an entry that resolves static resources through `statics`.
    pub fn new(meta: EntryMeta, statics: Arc<dyn StaticResolver>) -> Self {
        Self {
            meta: RwLock::new(Arc::new(meta)),
            statics,
        }
    }

    /// Create an entry with no origin for static resources.
    pub fn detached(meta: EntryMeta) -> Self {
        Self::new(meta, Arc::new(NoStatics))
    }

    /// The current snapshot. All fields come from the same generation.
    pub fn snapshot(&self) -> Arc<EntryMeta> {
        self.meta.read().clone()
    }

    /// Replace the whole snapshot.
    pub fn update(&self, meta: EntryMeta) {
        *self.meta.write() = Arc::new(meta);
    }

    pub fn title(&self) -> String {
        self.meta.read().title.clone()
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.meta.read().date
    }

    pub fn content(&self) -> String {
        self.meta.read().content.clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.meta.read().tags.clone()
    }

    pub fn is_slide(&self) -> bool {
        self.meta.read().is_slide
    }

    pub fn static_list(&self) -> Vec<String> {
        self.meta.read().static_list.clone()
    }

    /// Open a resource relative to this entry's origin.
    pub async fn open_static(&self, relative_path: &str) -> StaticStream {
        self.statics.open(relative_path).await
    }
}

impl Keyed for Entry {
    fn key(&self) -> String {
        self.meta.read().key.clone()
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("meta", &*self.snapshot())
            .finish_non_exhaustive()
    }
}

/// The answer to an index `get`: an unordered snapshot of entries.
#[derive(Debug, Clone, Default)]
pub struct Entries {
    pub content: Vec<Arc<Entry>>,
}

impl Entries {
    pub fn new(content: Vec<Arc<Entry>>) -> Self {
        Self { content }
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Entry>> {
        self.content.iter()
    }

    /// Keys of all entries, in current order.
    pub fn keys(&self) -> Vec<String> {
        self.content.iter().map(|e| e.key()).collect()
    }

    /// Order newest first; entries with the same date are ordered by key.
    pub fn sort_by_date(&mut self) {
        self.content.sort_by_cached_key(|e| {
            let meta = e.snapshot();
            (std::cmp::Reverse(meta.date), meta.key.clone())
        });
    }
}

impl IntoIterator for Entries {
    type Item = Arc<Entry>;
    type IntoIter = std::vec::IntoIter<Arc<Entry>>;

    fn into_iter(self) -> Self::IntoIter {
        self.content.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta(key: &str, day: u32) -> EntryMeta {
        EntryMeta {
            key: key.to_string(),
            title: format!("title {key}"),
            date: Utc.with_ymd_and_hms(2020, 1, day, 0, 0, 0).unwrap(),
            content: format!("<p>{key}</p>"),
            tags: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn update_replaces_whole_snapshot() {
        let entry = Entry::detached(meta("one", 1));
        let before = entry.snapshot();
        entry.update(meta("two", 2));

        assert_eq!(before.key, "one");
        assert_eq!(entry.key(), "two");
        assert_eq!(entry.title(), "title two");
        assert_eq!(entry.content(), "<p>two</p>");
    }

    #[test]
    fn sort_by_date_is_newest_first() {
        let mut entries = Entries::new(vec![
            Arc::new(Entry::detached(meta("old", 1))),
            Arc::new(Entry::detached(meta("new", 9))),
            Arc::new(Entry::detached(meta("mid-b", 5))),
            Arc::new(Entry::detached(meta("mid-a", 5))),
        ]);
        entries.sort_by_date();
        assert_eq!(entries.keys(), vec!["new", "mid-a", "mid-b", "old"]);
    }

    #[test]
    fn readers_never_see_torn_snapshots() {
        let entry = Arc::new(Entry::detached(meta("k0", 1)));
        let writer = {
            let entry = Arc::clone(&entry);
            std::thread::spawn(move || {
                for i in 0..2_000 {
                    let mut m = meta(&format!("k{i}"), 1);
                    m.content = format!("<p>k{i}</p>");
                    entry.update(m);
                }
            })
        };
        for _ in 0..2_000 {
            let snap = entry.snapshot();
            assert_eq!(snap.content, format!("<p>{}</p>", snap.key));
        }
        writer.join().unwrap();
    }

    #[test]
    fn keyed_is_implemented_for_common_handles() {
        let entry = Arc::new(Entry::detached(meta("x", 1)));
        assert_eq!(entry.key(), "x");
        assert_eq!("y".key(), "y");
        assert_eq!(String::from("z").key(), "z");
    }
}
