//! Target-company configuration and employer resolution.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{normalize_text, SourceTag, VacancyRecord};

/// Substring matching only applies when both strings are longer than this.
pub const SUBSTRING_GUARD_CHARS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCompany {
    pub name: String,
    #[serde(default)]
    pub hh_id: Option<String>,
    #[serde(default)]
    pub sj_id: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl TargetCompany {
    pub fn source_id(&self, source: SourceTag) -> Option<&str> {
        match source {
            SourceTag::HeadHunter => self.hh_id.as_deref(),
            SourceTag::SuperJob => self.sj_id.as_deref(),
        }
    }
}

/// Ordered curated employer list. Read-only once loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCompanies {
    #[serde(default)]
    pub companies: Vec<TargetCompany>,
}

impl TargetCompanies {
    pub fn new(companies: Vec<TargetCompany>) -> Self {
        Self { companies }
    }

    pub fn len(&self) -> usize {
        self.companies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.companies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetCompany> {
        self.companies.iter()
    }

    pub fn by_name(&self, name: &str) -> Option<&TargetCompany> {
        let wanted = normalize_text(name);
        self.companies
            .iter()
            .find(|c| normalize_text(&c.name) == wanted)
    }

    /// Flattened name/alias patterns in precedence order.
    ///
    /// Each company contributes its canonical name first, then its aliases
    /// as configured. Empty patterns are skipped.
    pub fn match_patterns(&self) -> Vec<MatchPattern> {
        let mut out = Vec::new();
        for company in &self.companies {
            let candidates = std::iter::once(&company.name).chain(company.aliases.iter());
            for raw in candidates {
                let pattern = normalize_text(raw);
                if pattern.is_empty() {
                    continue;
                }
                out.push(MatchPattern {
                    priority: out.len() as i32,
                    company_name: company.name.clone(),
                    pattern,
                });
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPattern {
    pub priority: i32,
    pub company_name: String,
    pub pattern: String,
}

/// Name-based match between a normalized pattern and a normalized employer.
pub fn pattern_matches(pattern: &str, employer: &str) -> bool {
    if pattern.is_empty() || employer.is_empty() {
        return false;
    }
    if pattern == employer {
        return true;
    }
    let long_enough = |s: &str| s.chars().count() > SUBSTRING_GUARD_CHARS;
    long_enough(pattern)
        && long_enough(employer)
        && (employer.contains(pattern) || pattern.contains(employer))
}

/// Identifies a configured target company by its canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalCompanyId(String);

impl CanonicalCompanyId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalCompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmployerRef<'a> {
    pub source_id: Option<&'a str>,
    pub name: &'a str,
}

#[derive(Debug, Clone)]
pub struct TargetCompanyResolver {
    companies: Arc<TargetCompanies>,
    patterns: Vec<MatchPattern>,
}

impl TargetCompanyResolver {
    pub fn new(companies: Arc<TargetCompanies>) -> Self {
        let patterns = companies.match_patterns();
        Self {
            companies,
            patterns,
        }
    }

    pub fn companies(&self) -> &TargetCompanies {
        &self.companies
    }

    pub fn patterns(&self) -> &[MatchPattern] {
        &self.patterns
    }

    /// Source-specific id first, then the first name/alias pattern that matches.
    pub fn resolve(&self, employer: EmployerRef<'_>, source: SourceTag) -> Option<CanonicalCompanyId> {
        if let Some(id) = employer.source_id.map(str::trim).filter(|s| !s.is_empty()) {
            let by_id = self
                .companies
                .iter()
                .find(|c| c.source_id(source).map(str::trim) == Some(id));
            if let Some(company) = by_id {
                return Some(CanonicalCompanyId::new(company.name.clone()));
            }
        }

        let employer_norm = normalize_text(employer.name);
        self.patterns
            .iter()
            .find(|p| pattern_matches(&p.pattern, &employer_norm))
            .map(|p| CanonicalCompanyId::new(p.company_name.clone()))
    }

    pub fn resolve_record(&self, record: &VacancyRecord) -> Option<CanonicalCompanyId> {
        self.resolve(record.employer(), record.source)
    }
}
