//! Source client + normalizer capabilities and their concrete implementations.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use jobsift_core::{SourceTag, VacancyRecord};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod clients;
mod http;
mod normalize;

pub use clients::{FixtureSourceClient, HeadHunterClient, PagingConfig, SuperJobClient};
pub use http::{
    BackoffPolicy, CachedPage, FetchError, HttpClientConfig, HttpFetcher, RequestPacer,
    ResponseCache, Retry,
};
pub use normalize::JsonRecordNormalizer;

pub const CRATE_NAME: &str = "jobsift-sources";

/// Source-specific payload for one vacancy, exactly as the provider sent it.
pub type RawRecord = JsonValue;

/// Generic request options keyed by generic name (`period`, `area`, ...).
pub type SourceOptions = BTreeMap<String, JsonValue>;

/// Option names that steer paging inside a client and are never sent upstream.
pub const PAGING_OPTION_NAMES: [&str; 2] = ["max_pages", "per_page"];

#[derive(Debug, Error)]
pub enum SourceFetchError {
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("unexpected response shape: {0}")]
    Malformed(String),
    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),
    #[error("fetch did not finish before the aggregation deadline")]
    TimedOut,
    #[error("fetch task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("raw record is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` contains a NUL byte")]
    NulByte(&'static str),
}

/// Fetches raw candidate records for a query. Retry, paging and caching are
/// the implementation's business.
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source(&self) -> SourceTag;

    async fn fetch(
        &self,
        query: &str,
        options: &SourceOptions,
    ) -> Result<Vec<RawRecord>, SourceFetchError>;
}

/// Converts one raw record into the common vacancy shape.
pub trait RecordNormalizer: Send + Sync {
    fn normalize(&self, raw: &RawRecord, source: SourceTag) -> Result<VacancyRecord, NormalizationError>;
}

/// Renames generic option names to the source's native ones.
pub fn translate_options(source: SourceTag, options: &SourceOptions) -> SourceOptions {
    options
        .iter()
        .map(|(name, value)| (source.native_option_name(name).to_string(), value.clone()))
        .collect()
}

/// Flattens options into query pairs; nulls are dropped and arrays repeat the key.
pub fn options_to_query(options: &SourceOptions) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in options {
        if PAGING_OPTION_NAMES.contains(&name.as_str()) {
            continue;
        }
        match value {
            JsonValue::Array(items) => {
                out.extend(items.iter().filter_map(scalar_to_string).map(|v| (name.clone(), v)))
            }
            other => {
                if let Some(v) = scalar_to_string(other) {
                    out.push((name.clone(), v));
                }
            }
        }
    }
    out
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

/// Everything needed to build the client for each known source.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub http: HttpClientConfig,
    pub paging: PagingConfig,
    pub cache_dir: Option<PathBuf>,
    pub cache_ttl: Duration,
    pub sj_api_key: Option<String>,
    /// When set, clients replay `fixtures/<source>/sample/raw.json` instead of calling the network.
    pub fixtures_root: Option<PathBuf>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            http: HttpClientConfig::default(),
            paging: PagingConfig::default(),
            cache_dir: None,
            cache_ttl: Duration::from_secs(3600),
            sj_api_key: None,
            fixtures_root: None,
        }
    }
}

pub fn fixture_path(root: impl Into<PathBuf>, source: SourceTag) -> PathBuf {
    root.into()
        .join(source.as_str())
        .join("sample")
        .join("raw.json")
}

/// Builds one client per known source, in priority order.
pub fn build_clients(settings: &ClientSettings) -> Result<Vec<Arc<dyn SourceClient>>> {
    if let Some(root) = &settings.fixtures_root {
        return Ok(SourceTag::all()
            .into_iter()
            .map(|source| {
                Arc::new(FixtureSourceClient::new(source, fixture_path(root, source)))
                    as Arc<dyn SourceClient>
            })
            .collect());
    }

    let http = Arc::new(HttpFetcher::new(settings.http.clone())?);
    let cache = settings
        .cache_dir
        .as_ref()
        .map(|dir| Arc::new(ResponseCache::new(dir.clone(), settings.cache_ttl)));

    let hh = HeadHunterClient::new(http.clone(), cache.clone(), settings.paging);
    let sj = SuperJobClient::new(http, cache, settings.paging, settings.sj_api_key.clone());
    Ok(vec![Arc::new(hh), Arc::new(sj)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn period_becomes_published_for_superjob_only() {
        let mut options = SourceOptions::new();
        options.insert("period".into(), json!(7));
        options.insert("area".into(), json!("1"));

        let sj = translate_options(SourceTag::SuperJob, &options);
        assert_eq!(sj.get("published"), Some(&json!(7)));
        assert!(!sj.contains_key("period"));
        assert_eq!(sj.get("area"), Some(&json!("1")));

        let hh = translate_options(SourceTag::HeadHunter, &options);
        assert_eq!(hh, options);
    }

    #[test]
    fn query_pairs_skip_nulls_and_paging_knobs() {
        let mut options = SourceOptions::new();
        options.insert("period".into(), json!(3));
        options.insert("only_with_salary".into(), json!(true));
        options.insert("area".into(), json!(["1", "2"]));
        options.insert("schedule".into(), JsonValue::Null);
        options.insert("max_pages".into(), json!(2));

        let pairs = options_to_query(&options);
        assert_eq!(
            pairs,
            vec![
                ("area".to_string(), "1".to_string()),
                ("area".to_string(), "2".to_string()),
                ("only_with_salary".to_string(), "true".to_string()),
                ("period".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn fixture_settings_build_offline_clients() {
        let settings = ClientSettings {
            fixtures_root: Some(PathBuf::from("fixtures")),
            ..Default::default()
        };
        let clients = build_clients(&settings).unwrap();
        let sources: Vec<_> = clients.iter().map(|c| c.source()).collect();
        assert_eq!(sources, vec![SourceTag::HeadHunter, SourceTag::SuperJob]);
    }
}
