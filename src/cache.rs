//! Remote client cache.
//!
//! [`CachedClient`] sits between the remote adapter and the HTTP API. Every
//! successful response is cached by URL together with its `ETag`; later
//! requests for the same URL are conditional (`If-None-Match`) and a
//! `304 Not Modified` hands back the cached payload itself, so callers can
//! detect "nothing changed" with [`Arc::ptr_eq`].
//!
//! The client tracks the API's remaining request budget from the
//! `X-RateLimit-*` headers. While the budget is below the configured floor,
//! URLs that are already cached are answered from memory without a request;
//! URLs that were never fetched still go out, since there is nothing else to
//! serve.
//!
//! A background task ([`CachedClient::spawn_revalidator`]) revalidates all
//! cached URLs on a fixed interval so steady-state reads stay in memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("content-index/", env!("CARGO_PKG_VERSION"));

/// Request budget reported by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateStatus {
    /// Requests left in the current window.
    pub remaining: u64,
    /// When the window resets, if reported.
    pub reset_at: Option<DateTime<Utc>>,
}

/// What a transport hands back for one GET.
#[derive(Debug, Clone, Default)]
pub struct TransportResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub body: Vec<u8>,
    pub rate: Option<RateStatus>,
}

/// Performs one (optionally conditional) GET.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// GET `url`, sending `validator` as `If-None-Match` when present.
    async fn send(&self, url: &str, validator: Option<&str>) -> Result<TransportResponse>;
}

/// [`HttpTransport`] backed by `reqwest`, speaking the GitHub REST dialect.
pub struct ReqwestTransport {
    client: reqwest::Client,
    user: String,
    secret: String,
}

impl ReqwestTransport {
    /// Build a client with basic auth credentials and a per-request timeout.
    pub fn new(user: &str, secret: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            user: user.to_string(),
            secret: secret.to_string(),
        })
    }
}

fn header_str<'a>(headers: &'a reqwest::header::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_rate(headers: &reqwest::header::HeaderMap) -> Option<RateStatus> {
    let remaining = header_str(headers, "x-ratelimit-remaining")?.parse().ok()?;
    let reset_at = header_str(headers, "x-ratelimit-reset")
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    Some(RateStatus {
        remaining,
        reset_at,
    })
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, url: &str, validator: Option<&str>) -> Result<TransportResponse> {
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if !self.user.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.secret));
        }
        if let Some(validator) = validator {
            request = request.header(reqwest::header::IF_NONE_MATCH, validator);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let status = response.status().as_u16();
        let headers = response.headers();
        let etag = header_str(headers, "etag").map(str::to_string);
        let rate = parse_rate(headers);
        let body = response.bytes().await?.to_vec();

        Ok(TransportResponse {
            status,
            etag,
            body,
            rate,
        })
    }
}

/// How a [`Fetched`] payload was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// A full response from the server.
    Network,
    /// The server confirmed the cached payload is current.
    NotModified,
    /// Served from cache without asking, to preserve the request budget.
    Stale,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub payload: Arc<[u8]>,
    pub source: FetchSource,
}

#[derive(Debug, Clone)]
struct CachedEntry {
    payload: Arc<[u8]>,
    validator: Option<String>,
}

/// URL-keyed response cache with conditional revalidation.
pub struct CachedClient {
    transport: Arc<dyn HttpTransport>,
    entries: RwLock<HashMap<String, CachedEntry>>,
    budget: Mutex<Option<RateStatus>>,
    floor: u64,
}

impl CachedClient {
    /// `floor` is the remaining-request count below which cached URLs are
    /// served without a request.
    pub fn new(transport: Arc<dyn HttpTransport>, floor: u64) -> Self {
        Self {
            transport,
            entries: RwLock::new(HashMap::new()),
            budget: Mutex::new(None),
            floor,
        }
    }

    /// GET `url` through the cache.
    pub async fn get(&self, url: &str) -> Result<Fetched> {
        let cached = self.entries.read().get(url).cloned();

        if let Some(entry) = &cached {
            if self.under_pressure() {
                debug!(url = %url, "rate budget low, serving cached response");
                return Ok(Fetched {
                    payload: Arc::clone(&entry.payload),
                    source: FetchSource::Stale,
                });
            }
        }

        let validator = cached.as_ref().and_then(|e| e.validator.as_deref());
        let response = self.transport.send(url, validator).await?;
        self.record_rate(response.rate);

        match (response.status, cached) {
            (304, Some(entry)) => Ok(Fetched {
                payload: entry.payload,
                source: FetchSource::NotModified,
            }),
            (200..=299, _) => {
                let payload: Arc<[u8]> = response.body.into();
                self.entries.write().insert(
                    url.to_string(),
                    CachedEntry {
                        payload: Arc::clone(&payload),
                        validator: response.etag,
                    },
                );
                Ok(Fetched {
                    payload,
                    source: FetchSource::Network,
                })
            }
            (403 | 429, Some(entry)) => {
                warn!(
                    url = %url,
                    status = response.status,
                    "rate limited, serving cached response"
                );
                Ok(Fetched {
                    payload: entry.payload,
                    source: FetchSource::Stale,
                })
            }
            (status, _) => bail!("GET {url} returned status {status}"),
        }
    }

    /// GET `url` without caching the response. Still accounts the budget.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.transport.send(url, None).await?;
        self.record_rate(response.rate);
        if !(200..=299).contains(&response.status) {
            bail!("GET {url} returned status {}", response.status);
        }
        Ok(response.body)
    }

    /// Revalidate every cached URL once. Returns how many were checked.
    ///
    /// Does nothing while the request budget is below the floor.
    pub async fn revalidate_all(&self) -> usize {
        if self.under_pressure() {
            debug!("rate budget low, skipping revalidation");
            return 0;
        }
        let urls: Vec<String> = self.entries.read().keys().cloned().collect();
        let mut checked = 0;
        for url in urls {
            match self.get(&url).await {
                Ok(fetched) => {
                    if fetched.source == FetchSource::Stale {
                        break;
                    }
                    checked += 1;
                }
                Err(e) => warn!(url = %url, error = %e, "revalidation failed"),
            }
        }
        checked
    }

    /// Run [`revalidate_all`](Self::revalidate_all) every `every` until `cancel` fires.
    pub fn spawn_revalidator(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + every;
            let mut ticker = tokio::time::interval_at(start, every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let checked = client.revalidate_all().await;
                        debug!(checked, "cache revalidated");
                    }
                }
            }
        })
    }

    /// Whether the last reported budget is below the floor and not yet reset.
    pub fn under_pressure(&self) -> bool {
        match *self.budget.lock() {
            Some(RateStatus {
                remaining,
                reset_at,
            }) if remaining < self.floor => reset_at.map_or(true, |at| at > Utc::now()),
            _ => false,
        }
    }

    pub fn rate_status(&self) -> Option<RateStatus> {
        *self.budget.lock()
    }

    fn record_rate(&self, rate: Option<RateStatus>) {
        if let Some(rate) = rate {
            *self.budget.lock() = Some(rate);
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.read().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
