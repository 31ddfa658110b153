//! Core vacancy model, dedup keys, and target-company resolution for jobsift.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod companies;

pub use companies::{
    pattern_matches, CanonicalCompanyId, EmployerRef, MatchPattern, TargetCompanies,
    TargetCompany, TargetCompanyResolver, SUBSTRING_GUARD_CHARS,
};

pub const CRATE_NAME: &str = "jobsift-core";

/// Canonical code for roubles; `RUB` and friends are folded into it.
pub const CANONICAL_RUBLE: &str = "RUR";

/// One external job-posting provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceTag {
    #[serde(rename = "hh")]
    HeadHunter,
    #[serde(rename = "sj")]
    SuperJob,
}

impl SourceTag {
    /// Every known source, in merge priority order.
    pub const fn all() -> [SourceTag; 2] {
        [SourceTag::HeadHunter, SourceTag::SuperJob]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::HeadHunter => "hh",
            SourceTag::SuperJob => "sj",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceTag::HeadHunter => "HeadHunter",
            SourceTag::SuperJob => "SuperJob",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "hh" | "hh.ru" | "headhunter" => Some(SourceTag::HeadHunter),
            "sj" | "sj.ru" | "superjob" | "superjob.ru" => Some(SourceTag::SuperJob),
            _ => None,
        }
    }

    /// Native name of a generic request option for this source.
    pub fn native_option_name<'a>(&self, generic: &'a str) -> &'a str {
        match (self, generic) {
            (SourceTag::SuperJob, "period") => "published",
            _ => generic,
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized vacancy flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VacancyRecord {
    pub external_id: String,
    pub source: SourceTag,
    pub title: String,
    pub employer_name: String,
    pub employer_source_id: Option<String>,
    pub salary_from: Option<i64>,
    pub salary_to: Option<i64>,
    pub salary_currency: Option<String>,
    pub url: String,
    pub description: Option<String>,
    pub requirements: Option<String>,
    pub responsibilities: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

impl VacancyRecord {
    /// Source-qualified key, unique across every source.
    pub fn storage_key(&self) -> String {
        storage_key(self.source, &self.external_id)
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::from_record(self)
    }

    pub fn has_salary(&self) -> bool {
        self.salary_from.is_some() || self.salary_to.is_some()
    }

    pub fn employer(&self) -> EmployerRef<'_> {
        EmployerRef {
            source_id: self.employer_source_id.as_deref(),
            name: &self.employer_name,
        }
    }
}

pub fn storage_key(source: SourceTag, external_id: &str) -> String {
    format!("{}:{}", source.as_str(), external_id)
}

/// Derived identity used to spot the same vacancy posted on several sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    pub title: String,
    pub employer: String,
    pub salary_range: String,
}

impl DedupKey {
    pub fn from_record(record: &VacancyRecord) -> Self {
        Self {
            title: normalize_text(&record.title),
            employer: normalize_text(&record.employer_name),
            salary_range: salary_range_key(record.salary_from, record.salary_to),
        }
    }
}

pub fn normalize_text(input: &str) -> String {
    input.trim().to_lowercase()
}

/// `"<from>-<to>"` with an absent bound rendered as an empty string.
pub fn salary_range_key(from: Option<i64>, to: Option<i64>) -> String {
    let bound = |v: Option<i64>| v.map(|n| n.to_string()).unwrap_or_default();
    format!("{}-{}", bound(from), bound(to))
}

/// Folds the currency spellings sources emit into one canonical code.
///
/// A salary without a currency is taken to be in roubles; a record without
/// any salary bound carries no currency at all. Anything that is not a
/// three-letter code is dropped.
pub fn canonical_currency(raw: Option<&str>, has_salary: bool) -> Option<String> {
    if !has_salary {
        return None;
    }
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Some(CANONICAL_RUBLE.to_string());
    };
    let upper = raw.to_uppercase();
    match upper.as_str() {
        "RUR" | "RUB" | "РУБ" | "РУБ." => Some(CANONICAL_RUBLE.to_string()),
        code if code.chars().count() == 3 && code.chars().all(char::is_alphabetic) => {
            Some(upper)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistOutcome {
    Added,
    SkippedExisting,
    SkippedUnresolvedCompany,
}

impl PersistOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PersistOutcome::Added => "added",
            PersistOutcome::SkippedExisting => "skipped: already exists",
            PersistOutcome::SkippedUnresolvedCompany => "skipped: unresolved company",
        }
    }
}

/// Per-record result of a batch write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMessage {
    pub storage_key: String,
    pub title: String,
    pub outcome: PersistOutcome,
}

impl OperationMessage {
    pub fn new(record: &VacancyRecord, outcome: PersistOutcome) -> Self {
        Self {
            storage_key: record.storage_key(),
            title: record.title.clone(),
            outcome,
        }
    }
}

impl fmt::Display for OperationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}': {}", self.storage_key, self.title, self.outcome.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn record(source: SourceTag, id: &str, title: &str, employer: &str) -> VacancyRecord {
        VacancyRecord {
            external_id: id.to_string(),
            source,
            title: title.to_string(),
            employer_name: employer.to_string(),
            employer_source_id: None,
            salary_from: None,
            salary_to: None,
            salary_currency: None,
            url: format!("https://example.test/{id}"),
            description: None,
            requirements: None,
            responsibilities: None,
            published_at: None,
        }
    }

    #[test]
    fn source_aliases_parse() {
        assert_eq!(SourceTag::parse("HH.ru"), Some(SourceTag::HeadHunter));
        assert_eq!(SourceTag::parse(" superjob "), Some(SourceTag::SuperJob));
        assert_eq!(SourceTag::parse("linkedin"), None);
    }

    #[test]
    fn period_is_renamed_only_for_superjob() {
        assert_eq!(SourceTag::SuperJob.native_option_name("period"), "published");
        assert_eq!(SourceTag::HeadHunter.native_option_name("period"), "period");
        assert_eq!(SourceTag::SuperJob.native_option_name("area"), "area");
    }

    #[test]
    fn dedup_key_ignores_case_and_whitespace() {
        let mut a = record(SourceTag::HeadHunter, "1", " Py Dev ", "Acme");
        a.salary_from = Some(100_000);
        a.salary_to = Some(120_000);
        let mut b = record(SourceTag::SuperJob, "9", "py dev", "ACME ");
        b.salary_from = Some(100_000);
        b.salary_to = Some(120_000);
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.dedup_key().salary_range, "100000-120000");
    }

    #[test]
    fn missing_salary_bounds_render_empty() {
        assert_eq!(salary_range_key(None, None), "-");
        assert_eq!(salary_range_key(Some(5), None), "5-");
        assert_eq!(salary_range_key(None, Some(7)), "-7");
    }

    #[test]
    fn cyrillic_titles_lowercase() {
        assert_eq!(normalize_text("  Разработчик Python "), "разработчик python");
    }

    #[test]
    fn currency_policy_folds_rouble_spellings() {
        assert_eq!(canonical_currency(Some("rub"), true).as_deref(), Some("RUR"));
        assert_eq!(canonical_currency(Some("RUR"), true).as_deref(), Some("RUR"));
        assert_eq!(canonical_currency(None, true).as_deref(), Some("RUR"));
        assert_eq!(canonical_currency(Some("usd"), true).as_deref(), Some("USD"));
        assert_eq!(canonical_currency(Some("RUB"), false), None);
        assert_eq!(canonical_currency(Some("rubles-per-month"), true), None);
        assert_eq!(canonical_currency(Some("US$"), true), None);
        assert_eq!(canonical_currency(Some("€"), true), None);
    }

    #[test]
    fn storage_key_is_source_qualified() {
        let a = record(SourceTag::HeadHunter, "1", "t", "e");
        let b = record(SourceTag::SuperJob, "1", "t", "e");
        assert_eq!(a.storage_key(), "hh:1");
        assert_ne!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn operation_message_renders_outcome() {
        let r = record(SourceTag::HeadHunter, "42", "Rust Dev", "Acme");
        let msg = OperationMessage::new(&r, PersistOutcome::SkippedExisting);
        assert_eq!(msg.to_string(), "hh:42 'Rust Dev': skipped: already exists");
    }

    #[test]
    fn source_tag_serializes_as_short_code() {
        let json = serde_json::to_string(&SourceTag::SuperJob).unwrap();
        assert_eq!(json, "\"sj\"");
    }
}
