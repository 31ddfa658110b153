//! Rate-limited HTTP fetches with retry, plus an on-disk response cache.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use jobsift_core::SourceTag;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Whether a failed attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    Transient,
    Permanent,
}

impl Retry {
    /// Throttling (429) and server errors are transient.
    pub fn for_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Retry::Transient,
            s if s.is_server_error() => Retry::Transient,
            _ => Retry::Permanent,
        }
    }

    /// Timeouts and connection failures are transient; body or decode errors are not.
    pub fn for_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Retry::Transient
        } else {
            Retry::Permanent
        }
    }
}

/// Exponential delay between retries, capped at `cap`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub retries: u32,
    pub initial: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial: Duration::from_millis(300),
            cap: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across all sources.
    pub max_in_flight: usize,
    /// Requests in flight per source.
    pub max_in_flight_per_source: usize,
    /// Minimum spacing between two requests to the same source.
    pub min_request_interval: Option<Duration>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 8,
            max_in_flight_per_source: 2,
            min_request_interval: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Hands out request slots no closer together than `interval`.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Waits until this caller's slot arrives.
    pub async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next.map_or(now, |at| at.max(now));
            *next = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{url} answered {status}")]
    HttpStatus { status: u16, url: String },
    #[error("response body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

struct SourceLane {
    in_flight: Semaphore,
    pacer: Option<RequestPacer>,
}

/// Shared GET client: global and per-source concurrency caps, optional pacing, retries.
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    lanes: BTreeMap<SourceTag, SourceLane>,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(agent);
        }
        let client = builder.build().context("building HTTP client")?;

        let lanes = SourceTag::all()
            .into_iter()
            .map(|source| {
                let lane = SourceLane {
                    in_flight: Semaphore::new(config.max_in_flight_per_source.max(1)),
                    pacer: config.min_request_interval.map(RequestPacer::new),
                };
                (source, lane)
            })
            .collect();

        Ok(Self {
            client,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            lanes,
            backoff: config.backoff,
        })
    }

    /// GET `url` with the given query and headers, retrying transient failures.
    pub async fn get_bytes(
        &self,
        source: SourceTag,
        url: &str,
        query: &[(String, String)],
        headers: &[(&'static str, String)],
    ) -> Result<Vec<u8>, FetchError> {
        let _global = self.in_flight.acquire().await.expect("semaphore not closed");
        let lane = self.lanes.get(&source);
        let _lane = match lane {
            Some(lane) => Some(lane.in_flight.acquire().await.expect("semaphore not closed")),
            None => None,
        };
        if let Some(pacer) = lane.and_then(|l| l.pacer.as_ref()) {
            pacer.wait_turn().await;
        }

        let span = info_span!("http_fetch", source = %source, url);
        self.send_with_retries(url, query, headers).instrument(span).await
    }

    pub async fn get_json(
        &self,
        source: SourceTag,
        url: &str,
        query: &[(String, String)],
        headers: &[(&'static str, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let body = self.get_bytes(source, url, query, headers).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn send_with_retries(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: &[(&'static str, String)],
    ) -> Result<Vec<u8>, FetchError> {
        let mut retry = 0;
        loop {
            let request = headers
                .iter()
                .fold(self.client.get(url).query(query), |req, (name, value)| {
                    req.header(*name, value)
                });

            let (failure, why) = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (err, Retry::for_status(status))
                }
                Err(err) => {
                    let why = Retry::for_transport(&err);
                    (FetchError::Request(err), why)
                }
            };

            if why == Retry::Permanent || retry >= self.backoff.retries {
                return Err(failure);
            }
            let delay = self.backoff.delay(retry);
            warn!(retry, ?delay, error = %failure, "transient failure, retrying");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

/// A cached response body and where it lives on disk.
#[derive(Debug, Clone)]
pub struct CachedPage {
    pub key: String,
    pub path: PathBuf,
    pub body: Vec<u8>,
}

/// Response bodies keyed by a sha256 of the request, expired by file age.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    root: PathBuf,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Stable key for a request; query pair order does not matter.
    pub fn request_key(source: SourceTag, url: &str, query: &[(String, String)]) -> String {
        let mut pairs: Vec<_> = query.iter().collect();
        pairs.sort();
        let mut material = format!("{}\n{}", source.as_str(), url);
        for (name, value) in pairs {
            material.push('\n');
            material.push_str(name);
            material.push('=');
            material.push_str(value);
        }
        Self::sha256_hex(material.as_bytes())
    }

    pub fn entry_path(&self, source: SourceTag, key: &str) -> PathBuf {
        self.root.join(source.as_str()).join(format!("{key}.json"))
    }

    /// Returns the cached body if present and younger than the TTL.
    pub async fn load(&self, source: SourceTag, key: &str) -> anyhow::Result<Option<CachedPage>> {
        let path = self.entry_path(source, key);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading cache metadata {}", path.display()))
            }
        };

        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default();
        if age > self.ttl {
            debug!(path = %path.display(), ?age, "cache entry expired");
            return Ok(None);
        }

        let body = fs::read(&path)
            .await
            .with_context(|| format!("reading cache entry {}", path.display()))?;
        Ok(Some(CachedPage {
            key: key.to_string(),
            path,
            body,
        }))
    }

    /// Writes via temp file + rename so readers never see a partial entry.
    pub async fn store(&self, source: SourceTag, key: &str, bytes: &[u8]) -> anyhow::Result<CachedPage> {
        let path = self.entry_path(source, key);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating cache directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp cache file {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(CachedPage {
            key: key.to_string(),
            path,
            body: bytes.to_vec(),
        })
    }
}
