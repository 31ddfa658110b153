//! Raw HeadHunter / SuperJob payloads to `VacancyRecord`.

use chrono::{DateTime, TimeZone, Utc};
use jobsift_core::{canonical_currency, SourceTag, VacancyRecord};
use serde_json::Value as JsonValue;

use crate::{NormalizationError, RawRecord, RecordNormalizer};

/// Field mapping for the JSON shapes both public APIs return.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordNormalizer;

impl RecordNormalizer for JsonRecordNormalizer {
    fn normalize(&self, raw: &RawRecord, source: SourceTag) -> Result<VacancyRecord, NormalizationError> {
        if !raw.is_object() {
            return Err(NormalizationError::NotAnObject);
        }
        let record = match source {
            SourceTag::HeadHunter => normalize_hh(raw)?,
            SourceTag::SuperJob => normalize_sj(raw)?,
        };
        reject_nul(record)
    }
}

/// PostgreSQL text cannot hold NUL, so such a record could never be stored.
fn reject_nul(record: VacancyRecord) -> Result<VacancyRecord, NormalizationError> {
    let fields: [(&'static str, Option<&str>); 8] = [
        ("id", Some(&record.external_id)),
        ("title", Some(&record.title)),
        ("employer.name", Some(&record.employer_name)),
        ("employer.id", record.employer_source_id.as_deref()),
        ("url", Some(&record.url)),
        ("description", record.description.as_deref()),
        ("requirements", record.requirements.as_deref()),
        ("responsibilities", record.responsibilities.as_deref()),
    ];
    let offending = fields
        .into_iter()
        .find(|(_, value)| value.is_some_and(|v| v.contains('\0')))
        .map(|(name, _)| name);
    match offending {
        Some(name) => Err(NormalizationError::NulByte(name)),
        None => Ok(record),
    }
}

fn normalize_hh(raw: &JsonValue) -> Result<VacancyRecord, NormalizationError> {
    let external_id = json_id(raw, &["id"]).ok_or(NormalizationError::MissingField("id"))?;
    let title = required(raw, &["name"], "name")?;
    let url = json_str(raw, &["alternate_url"])
        .or_else(|| json_str(raw, &["url"]))
        .map(ToString::to_string)
        .ok_or(NormalizationError::MissingField("alternate_url"))?;
    let employer_name = required(raw, &["employer", "name"], "employer.name")?;

    let salary_from = json_amount(raw, &["salary", "from"]);
    let salary_to = json_amount(raw, &["salary", "to"]);
    let has_salary = salary_from.is_some() || salary_to.is_some();

    Ok(VacancyRecord {
        external_id,
        source: SourceTag::HeadHunter,
        title,
        employer_name,
        employer_source_id: json_id(raw, &["employer", "id"]),
        salary_from,
        salary_to,
        salary_currency: canonical_currency(json_str(raw, &["salary", "currency"]), has_salary),
        url,
        description: json_text(raw, &["description"]),
        requirements: json_text(raw, &["snippet", "requirement"]),
        responsibilities: json_text(raw, &["snippet", "responsibility"]),
        published_at: json_str(raw, &["published_at"]).and_then(parse_timestamp),
    })
}

fn normalize_sj(raw: &JsonValue) -> Result<VacancyRecord, NormalizationError> {
    let external_id = json_id(raw, &["id"]).ok_or(NormalizationError::MissingField("id"))?;
    let title = required(raw, &["profession"], "profession")?;
    let url = required(raw, &["link"], "link")?;
    let employer_name = json_text(raw, &["firm_name"])
        .or_else(|| json_text(raw, &["client", "title"]))
        .ok_or(NormalizationError::MissingField("firm_name"))?;

    // SuperJob reports an unset bound as 0.
    let salary_from = json_amount(raw, &["payment_from"]).filter(|v| *v > 0);
    let salary_to = json_amount(raw, &["payment_to"]).filter(|v| *v > 0);
    let has_salary = salary_from.is_some() || salary_to.is_some();

    Ok(VacancyRecord {
        external_id,
        source: SourceTag::SuperJob,
        title,
        employer_name,
        employer_source_id: json_id(raw, &["client", "id"]).or_else(|| json_id(raw, &["id_client"])),
        salary_from,
        salary_to,
        salary_currency: canonical_currency(json_str(raw, &["currency"]), has_salary),
        url,
        description: json_text(raw, &["vacancyRichText"]),
        requirements: json_text(raw, &["candidat"]),
        responsibilities: json_text(raw, &["work"]),
        published_at: json_i64(raw, &["date_published"])
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
    })
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    json_at(value, path)?.as_i64()
}

/// Trimmed, non-empty text.
fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_str(value, path)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn required(value: &JsonValue, path: &[&str], name: &'static str) -> Result<String, NormalizationError> {
    json_text(value, path).ok_or(NormalizationError::MissingField(name))
}

/// Ids arrive as strings on one API and as numbers on the other.
fn json_id(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_amount(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let v = json_at(value, path)?;
    v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
