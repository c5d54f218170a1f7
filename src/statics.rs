//! Static resource resolution.
//!
//! Entries reference resources that live next to them in their source
//! (images, embedded code files). A [`StaticResolver`] turns a path relative
//! to the entry's origin into a [`StaticStream`].
//!
//! Resolution never fails outright: a missing or unreadable resource comes
//! back as a stream whose reads return an error. Generators can then log the
//! problem and keep rendering the rest of the document.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::warn;

/// Resolves resources relative to an entry's origin.
#[async_trait]
pub trait StaticResolver: Send + Sync {
    /// Open the resource at `relative_path`.
    async fn open(&self, relative_path: &str) -> StaticStream;
}

/// A readable resource, or a reader that reports why it could not be opened.
pub struct StaticStream {
    inner: Box<dyn AsyncRead + Send + Unpin>,
}

impl StaticStream {
    /// Wrap any async reader.
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            inner: Box::new(reader),
        }
    }

    /// A stream over bytes already held in memory.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(io::Cursor::new(bytes.into()))
    }

    /// A stream whose every read fails with `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(FailedRead {
            message: message.into(),
            logged: false,
        })
    }

    /// Read the whole resource into memory.
    pub async fn read_all(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.inner.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl AsyncRead for StaticStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for StaticStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticStream").finish_non_exhaustive()
    }
}

struct FailedRead {
    message: String,
    logged: bool,
}

impl AsyncRead for FailedRead {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.logged {
            warn!(reason = %self.message, "static resource unavailable");
            self.logged = true;
        }
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::NotFound,
            self.message.clone(),
        )))
    }
}

/// Resolver for entries that have no origin to read from.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStatics;

#[async_trait]
impl StaticResolver for NoStatics {
    async fn open(&self, relative_path: &str) -> StaticStream {
        StaticStream::failed(format!("no static resources available for '{relative_path}'"))
    }
}

/// Join `relative` onto `base` lexically, resolving `.` and `..`.
///
/// Returns `None` when the result would climb above `base`'s root. A leading
/// `/` in `relative` anchors it at the root instead of at `base`.
pub fn join_relative(base: &str, relative: &str) -> Option<String> {
    let mut parts: Vec<&str> = if relative.starts_with('/') {
        Vec::new()
    } else {
        base.split('/').filter(|p| !p.is_empty() && *p != ".").collect()
    };
    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

/// Filesystem flavour of [`join_relative`]: resolves `relative` against
/// `base_dir` and refuses anything that escapes `root`.
pub fn resolve_under(root: &Path, base_dir: &Path, relative: &str) -> Option<PathBuf> {
    let base = base_dir.strip_prefix(root).ok()?;
    let base = base
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    let relative = relative.replace('\\', "/");
    let joined = join_relative(&base, &relative)?;
    Some(root.join(joined))
}
