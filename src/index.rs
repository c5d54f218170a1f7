//! Single-writer entry index.
//!
//! The [`Index`] is a cheap, cloneable handle to a writer task that owns the
//! `key → Entry` map. Every operation is a request placed on a bounded queue
//! and answered over a oneshot channel, so requests are applied strictly in
//! arrival order and the keys of one batch are never interleaved with
//! another caller's request.
//!
//! ```text
//! adapter ─┐
//! adapter ─┼─► mpsc (bounded) ─► writer task ─► HashMap<String, Arc<Entry>>
//! caller  ─┘        ▲                 │
//!                   └──── oneshot ◄───┘
//! ```
//!
//! [`destroy`](Index::destroy) cancels the writer; any request issued
//! afterwards fails with [`IndexError::Closed`] instead of waiting on a queue
//! nobody drains.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::IndexError;
use crate::models::{Entries, Entry, Keyed};

/// Default depth of the request queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, IndexError>>;

enum Request {
    Add {
        entries: Vec<Arc<Entry>>,
        reply: Reply<()>,
    },
    Remove {
        keys: Vec<String>,
        reply: Reply<()>,
    },
    Get {
        keys: Vec<String>,
        reply: Reply<Entries>,
    },
}

/// Handle to the index writer task.
#[derive(Clone, Debug)]
pub struct Index {
    tx: mpsc::Sender<Request>,
    shutdown: CancellationToken,
}

impl Index {
    /// Spawn a writer task with the default queue depth.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_DEPTH)
    }

    /// Spawn a writer task whose request queue holds `depth` requests.
    pub fn with_capacity(depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let shutdown = CancellationToken::new();
        let writer = Writer {
            entries: HashMap::new(),
            rx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(writer.run());
        Self { tx, shutdown }
    }

    /// Insert or replace entries by key.
    ///
    /// Fails with [`IndexError::MissingKey`] if any entry has an empty key;
    /// in that case nothing is inserted.
    pub async fn add(&self, entries: Vec<Arc<Entry>>) -> Result<(), IndexError> {
        self.request(|reply| Request::Add { entries, reply }).await
    }

    /// Delete entries by key. Absent keys are ignored.
    pub async fn remove<K: Keyed>(&self, keys: &[K]) -> Result<(), IndexError> {
        let keys = keys.iter().map(Keyed::key).collect();
        self.request(|reply| Request::Remove { keys, reply }).await
    }

    /// Look up entries by key.
    ///
    /// An empty key list returns every entry. Otherwise the result holds
    /// exactly the requested entries, or the call fails with
    /// [`IndexError::UnknownKey`] and returns nothing.
    pub async fn get<K: Keyed>(&self, keys: &[K]) -> Result<Entries, IndexError> {
        let keys = keys.iter().map(Keyed::key).collect();
        self.request(|reply| Request::Get { keys, reply }).await
    }

    /// Every entry currently in the index.
    pub async fn get_all(&self) -> Result<Entries, IndexError> {
        self.get::<String>(&[]).await
    }

    /// Stop the writer task. Idempotent.
    pub fn destroy(&self) {
        self.shutdown.cancel();
    }

    pub fn is_destroyed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, IndexError> {
        if self.is_destroyed() {
            return Err(IndexError::Closed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = make(reply_tx);
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(IndexError::Closed),
            sent = self.tx.send(request) => sent.map_err(|_| IndexError::Closed)?,
        }
        reply_rx.await.map_err(|_| IndexError::Closed)?
    }
}

struct Writer {
    entries: HashMap<String, Arc<Entry>>,
    rx: mpsc::Receiver<Request>,
    shutdown: CancellationToken,
}

impl Writer {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!(entries = self.entries.len(), "index destroyed");
                    break;
                }

                request = self.rx.recv() => match request {
                    Some(request) => self.handle(request),
                    None => {
                        debug!("all index handles dropped");
                        break;
                    }
                },
            }
        }
        // Dropping the receiver fails every queued request with `Closed`.
        self.rx.close();
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Add { entries, reply } => {
                let _ = reply.send(self.add(entries));
            }
            Request::Remove { keys, reply } => {
                let _ = reply.send(self.remove(keys));
            }
            Request::Get { keys, reply } => {
                let _ = reply.send(self.get(&keys));
            }
        }
    }

    fn add(&mut self, entries: Vec<Arc<Entry>>) -> Result<(), IndexError> {
        let keys = entries.iter().map(|e| e.key()).collect::<Vec<_>>();
        check_keys(&keys)?;
        for (key, entry) in keys.into_iter().zip(entries) {
            debug!(key = %key, "index add");
            self.entries.insert(key, entry);
        }
        Ok(())
    }

    fn remove(&mut self, keys: Vec<String>) -> Result<(), IndexError> {
        check_keys(&keys)?;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                debug!(key = %key, "index remove");
            }
        }
        Ok(())
    }

    fn get(&self, keys: &[String]) -> Result<Entries, IndexError> {
        if keys.is_empty() {
            return Ok(Entries::new(self.entries.values().cloned().collect()));
        }
        let content = keys
            .iter()
            .map(|key| {
                self.entries
                    .get(key)
                    .cloned()
                    .ok_or_else(|| IndexError::UnknownKey(key.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Entries::new(content))
    }
}

fn check_keys(keys: &[String]) -> Result<(), IndexError> {
    match keys.iter().position(|k| k.is_empty()) {
        Some(position) => Err(IndexError::MissingKey { position }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntryMeta;
    use std::collections::BTreeMap;

    fn entry(key: &str, content: &str) -> Arc<Entry> {
        Arc::new(Entry::detached(EntryMeta {
            key: key.to_string(),
            title: key.to_string(),
            content: content.to_string(),
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn add_then_get_returns_the_entry() {
        let index = Index::spawn();
        let e = entry("a", "1");
        index.add(vec![Arc::clone(&e)]).await.unwrap();

        let got = index.get(&["a"]).await.unwrap();
        assert_eq!(got.len(), 1);
        assert!(Arc::ptr_eq(&got.content[0], &e));
    }

    #[tokio::test]
    async fn add_with_same_key_replaces() {
        let index = Index::spawn();
        index.add(vec![entry("a", "first")]).await.unwrap();
        index.add(vec![entry("a", "second")]).await.unwrap();

        let got = index.get(&["a"]).await.unwrap();
        assert_eq!(got.content[0].content(), "second");
        assert_eq!(index.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_absent_key_is_noop() {
        let index = Index::spawn();
        index.add(vec![entry("a", "1")]).await.unwrap();
        index.remove(&["missing"]).await.unwrap();
        assert_eq!(index.get_all().await.unwrap().keys(), vec!["a"]);
    }

    #[tokio::test]
    async fn get_unknown_key_returns_nothing() {
        let index = Index::spawn();
        index.add(vec![entry("a", "1")]).await.unwrap();

        let err = index.get(&["a", "b"]).await.unwrap_err();
        assert!(matches!(err, IndexError::UnknownKey(ref k) if k == "b"));
    }

    #[tokio::test]
    async fn get_without_keys_returns_everything() {
        let index = Index::spawn();
        index
            .add(vec![entry("a", "1"), entry("b", "2"), entry("c", "3")])
            .await
            .unwrap();
        let mut keys = index.get_all().await.unwrap().keys();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn keyless_argument_rejects_whole_batch() {
        let index = Index::spawn();
        let err = index
            .add(vec![entry("a", "1"), entry("", "2"), entry("c", "3")])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::MissingKey { position: 1 }));
        assert!(index.get_all().await.unwrap().is_empty());

        index.add(vec![entry("a", "1")]).await.unwrap();
        let err = index.remove(&["a", ""]).await.unwrap_err();
        assert!(matches!(err, IndexError::MissingKey { position: 1 }));
        assert_eq!(index.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn requests_after_destroy_fail_fast() {
        let index = Index::spawn();
        index.add(vec![entry("a", "1")]).await.unwrap();
        index.destroy();
        index.destroy();

        assert!(index.is_destroyed());
        assert!(matches!(index.get_all().await, Err(IndexError::Closed)));
        assert!(matches!(
            index.add(vec![entry("b", "1")]).await,
            Err(IndexError::Closed)
        ));
        let clone = index.clone();
        assert!(matches!(clone.remove(&["a"]).await, Err(IndexError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_match_sequential_oracle() {
        const TASKS: usize = 8;
        const OPS: usize = 200;
        const KEYS_PER_TASK: usize = 10;

        let index = Index::with_capacity(8);

        // Each task owns a disjoint key range, so applying every task's
        // operations sequentially in any order yields the same final map.
        let script = |task: usize, op: usize| -> (bool, String, String) {
            let slot = (op * 7 + task * 3) % KEYS_PER_TASK;
            let key = format!("t{task}-k{slot}");
            let is_add = (op + task) % 3 != 0;
            (is_add, key, format!("t{task}-op{op}"))
        };

        let mut handles = Vec::new();
        for task in 0..TASKS {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                for op in 0..OPS {
                    let (is_add, key, content) = script(task, op);
                    if is_add {
                        index.add(vec![entry(&key, &content)]).await.unwrap();
                    } else {
                        index.remove(&[key.as_str()]).await.unwrap();
                    }
                    if op % 25 == 0 {
                        index.get_all().await.unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut oracle = BTreeMap::new();
        for task in 0..TASKS {
            for op in 0..OPS {
                let (is_add, key, content) = script(task, op);
                if is_add {
                    oracle.insert(key, content);
                } else {
                    oracle.remove(&key);
                }
            }
        }

        let actual: BTreeMap<String, String> = index
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.key(), e.content()))
            .collect();
        assert_eq!(actual, oracle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn batches_are_never_observed_half_applied() {
        let index = Index::spawn();
        index
            .add(vec![entry("left", "0"), entry("right", "0")])
            .await
            .unwrap();

        let writer = {
            let index = index.clone();
            tokio::spawn(async move {
                for generation in 1..300 {
                    let g = generation.to_string();
                    index
                        .add(vec![entry("left", &g), entry("right", &g)])
                        .await
                        .unwrap();
                }
            })
        };

        for _ in 0..300 {
            let got = index.get(&["left", "right"]).await.unwrap();
            assert_eq!(got.content[0].content(), got.content[1].content());
        }
        writer.await.unwrap();
    }
}
