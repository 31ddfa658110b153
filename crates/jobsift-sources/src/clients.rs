//! Paging clients for the HeadHunter and SuperJob public APIs, plus an offline fixture client.
//!
//! Options reaching `fetch` are already in the source's native naming.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use jobsift_core::SourceTag;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{
    options_to_query, HttpFetcher, RawRecord, ResponseCache, SourceClient, SourceFetchError,
    SourceOptions,
};

pub const HH_VACANCIES_URL: &str = "https://api.hh.ru/vacancies";
pub const SJ_VACANCIES_URL: &str = "https://api.superjob.ru/2.0/vacancies/";

/// SuperJob rejects `count` above this.
const SJ_MAX_COUNT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingConfig {
    pub max_pages: u32,
    pub per_page: u32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            max_pages: 20,
            per_page: 100,
        }
    }
}

impl PagingConfig {
    /// `max_pages` / `per_page` request options override the configured values.
    pub fn with_overrides(self, options: &SourceOptions) -> Self {
        let read = |name: &str| {
            options
                .get(name)
                .and_then(JsonValue::as_u64)
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
        };
        Self {
            max_pages: read("max_pages").unwrap_or(self.max_pages),
            per_page: read("per_page").unwrap_or(self.per_page),
        }
    }
}

async fn fetch_page(
    http: &HttpFetcher,
    cache: Option<&ResponseCache>,
    source: SourceTag,
    url: &str,
    query: &[(String, String)],
    headers: &[(&'static str, String)],
) -> Result<JsonValue, SourceFetchError> {
    let key = cache.map(|_| ResponseCache::request_key(source, url, query));

    if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
        match cache.load(source, key).await {
            Ok(Some(hit)) => match serde_json::from_slice(&hit.body) {
                Ok(value) => {
                    debug!(source = %source, path = %hit.path.display(), "response cache hit");
                    return Ok(value);
                }
                Err(err) => warn!(source = %source, error = %err, "discarding unreadable cache entry"),
            },
            Ok(None) => {}
            Err(err) => warn!(source = %source, error = %err, "response cache read failed"),
        }
    }

    let body = http.get_bytes(source, url, query, headers).await?;
    let value: JsonValue =
        serde_json::from_slice(&body).map_err(crate::FetchError::from)?;

    if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
        if let Err(err) = cache.store(source, key, &body).await {
            warn!(source = %source, error = %err, "response cache write failed");
        }
    }
    Ok(value)
}

fn page_items(body: &JsonValue, field: &str) -> Result<Vec<RawRecord>, SourceFetchError> {
    body.get(field)
        .and_then(JsonValue::as_array)
        .cloned()
        .ok_or_else(|| SourceFetchError::Malformed(format!("response has no `{field}` array")))
}

#[derive(Debug, Clone)]
pub struct HeadHunterClient {
    http: Arc<HttpFetcher>,
    cache: Option<Arc<ResponseCache>>,
    paging: PagingConfig,
    base_url: String,
}

impl HeadHunterClient {
    pub fn new(http: Arc<HttpFetcher>, cache: Option<Arc<ResponseCache>>, paging: PagingConfig) -> Self {
        Self {
            http,
            cache,
            paging,
            base_url: HH_VACANCIES_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl SourceClient for HeadHunterClient {
    fn source(&self) -> SourceTag {
        SourceTag::HeadHunter
    }

    async fn fetch(&self, query: &str, options: &SourceOptions) -> Result<Vec<RawRecord>, SourceFetchError> {
        let paging = self.paging.with_overrides(options);
        let native = options_to_query(options);
        let mut out = Vec::new();

        for page in 0..paging.max_pages {
            let mut params = vec![
                ("text".to_string(), query.to_string()),
                ("page".to_string(), page.to_string()),
                ("per_page".to_string(), paging.per_page.to_string()),
            ];
            params.extend(native.iter().cloned());

            let body = fetch_page(
                &self.http,
                self.cache.as_deref(),
                self.source(),
                &self.base_url,
                &params,
                &[],
            )
            .await?;
            let items = page_items(&body, "items")?;
            let last_page = items.is_empty()
                || body
                    .get("pages")
                    .and_then(JsonValue::as_u64)
                    .map_or(true, |pages| u64::from(page) + 1 >= pages);
            out.extend(items);
            if last_page {
                break;
            }
        }

        info!(source = "hh", query, fetched = out.len(), "source fetch finished");
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct SuperJobClient {
    http: Arc<HttpFetcher>,
    cache: Option<Arc<ResponseCache>>,
    paging: PagingConfig,
    api_key: Option<String>,
    base_url: String,
}

impl SuperJobClient {
    pub fn new(
        http: Arc<HttpFetcher>,
        cache: Option<Arc<ResponseCache>>,
        paging: PagingConfig,
        api_key: Option<String>,
    ) -> Self {
        Self {
            http,
            cache,
            paging,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: SJ_VACANCIES_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl SourceClient for SuperJobClient {
    fn source(&self) -> SourceTag {
        SourceTag::SuperJob
    }

    async fn fetch(&self, query: &str, options: &SourceOptions) -> Result<Vec<RawRecord>, SourceFetchError> {
        let Some(api_key) = self.api_key.clone() else {
            return Err(SourceFetchError::MissingCredentials("SJ_API_KEY"));
        };
        let paging = self.paging.with_overrides(options);
        let count = paging.per_page.min(SJ_MAX_COUNT);
        let native = options_to_query(options);
        let headers = [("X-Api-App-Id", api_key)];
        let mut out = Vec::new();

        for page in 0..paging.max_pages {
            let mut params = vec![
                ("keyword".to_string(), query.to_string()),
                ("page".to_string(), page.to_string()),
                ("count".to_string(), count.to_string()),
            ];
            params.extend(native.iter().cloned());

            let body = fetch_page(
                &self.http,
                self.cache.as_deref(),
                self.source(),
                &self.base_url,
                &params,
                &headers,
            )
            .await?;
            let items = page_items(&body, "objects")?;
            let more = body.get("more").and_then(JsonValue::as_bool).unwrap_or(false);
            let empty = items.is_empty();
            out.extend(items);
            if !more || empty {
                break;
            }
        }

        info!(source = "sj", query, fetched = out.len(), "source fetch finished");
        Ok(out)
    }
}

/// Replays a saved API response instead of calling the network.
///
/// The file is either a bare array of raw records or a page object
/// (`items` for HeadHunter, `objects` for SuperJob).
#[derive(Debug, Clone)]
pub struct FixtureSourceClient {
    source: SourceTag,
    path: PathBuf,
}

impl FixtureSourceClient {
    pub fn new(source: SourceTag, path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceClient for FixtureSourceClient {
    fn source(&self) -> SourceTag {
        self.source
    }

    async fn fetch(&self, _query: &str, _options: &SourceOptions) -> Result<Vec<RawRecord>, SourceFetchError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading fixture {}", self.path.display()))?;
        let value: JsonValue = serde_json::from_str(&text)
            .with_context(|| format!("parsing fixture {}", self.path.display()))?;

        match value {
            JsonValue::Array(items) => Ok(items),
            other => {
                let field = match self.source {
                    SourceTag::HeadHunter => "items",
                    SourceTag::SuperJob => "objects",
                };
                page_items(&other, field)
            }
        }
    }
}
