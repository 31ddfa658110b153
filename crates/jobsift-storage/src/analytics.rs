//! Read-side queries over stored companies and vacancies.

use chrono::{DateTime, Utc};
use jobsift_core::CANONICAL_RUBLE;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredCompany {
    pub id: i64,
    pub name: String,
    pub hh_id: Option<String>,
    pub sj_id: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredVacancy {
    pub id: i64,
    pub external_id: String,
    pub title: String,
    pub company_id: Option<i64>,
    pub company_name: Option<String>,
    pub salary_from: Option<i64>,
    pub salary_to: Option<i64>,
    pub salary_currency: Option<String>,
    pub source: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompanyVacancyCount {
    pub company_name: String,
    pub vacancy_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub total_vacancies: i64,
    pub companies_with_vacancies: i64,
    pub vacancies_with_salary: i64,
    pub latest_published_at: Option<DateTime<Utc>>,
}

/// Midpoint of both bounds, or whichever bound is present.
const SALARY_POINT_SQL: &str = "CASE WHEN v.salary_from IS NOT NULL AND v.salary_to IS NOT NULL \
     THEN (v.salary_from + v.salary_to) / 2.0 \
     ELSE COALESCE(v.salary_from, v.salary_to)::numeric END";

const VACANCY_COLUMNS_SQL: &str = "v.id, v.external_id, v.title, v.company_id, c.name AS company_name, \
     v.salary_from, v.salary_to, v.salary_currency, v.source, v.url, v.published_at, v.created_at";

fn stored_vacancy(row: &PgRow) -> Result<StoredVacancy, sqlx::Error> {
    Ok(StoredVacancy {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        company_id: row.try_get("company_id")?,
        company_name: row.try_get("company_name")?,
        salary_from: row.try_get("salary_from")?,
        salary_to: row.try_get("salary_to")?,
        salary_currency: row.try_get("salary_currency")?,
        source: row.try_get("source")?,
        url: row.try_get("url")?,
        published_at: row.try_get("published_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn stored_vacancies(rows: &[PgRow]) -> Result<Vec<StoredVacancy>, StorageError> {
    Ok(rows.iter().map(stored_vacancy).collect::<Result<_, _>>()?)
}

pub async fn list_companies(pool: &PgPool) -> Result<Vec<StoredCompany>, StorageError> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, hh_id, sj_id, description
          FROM companies
         ORDER BY name
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(StoredCompany {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            hh_id: row.try_get("hh_id")?,
            sj_id: row.try_get("sj_id")?,
            description: row.try_get("description")?,
        });
    }
    Ok(out)
}

/// Every seeded company with its vacancy count, busiest first.
pub async fn companies_and_vacancies_count(pool: &PgPool) -> Result<Vec<CompanyVacancyCount>, StorageError> {
    let rows = sqlx::query(
        r#"
        SELECT c.name AS company_name, COUNT(v.id) AS vacancy_count
          FROM companies c
          LEFT JOIN vacancies v ON v.company_id = c.id
         GROUP BY c.id, c.name
         ORDER BY vacancy_count DESC, c.name
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(CompanyVacancyCount {
            company_name: row.try_get("company_name")?,
            vacancy_count: row.try_get("vacancy_count")?,
        });
    }
    Ok(out)
}

pub async fn all_vacancies(pool: &PgPool) -> Result<Vec<StoredVacancy>, StorageError> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {VACANCY_COLUMNS_SQL}
          FROM vacancies v
          LEFT JOIN companies c ON c.id = v.company_id
         ORDER BY c.name NULLS LAST, v.title, v.id
        "#
    ))
    .fetch_all(pool)
    .await?;
    stored_vacancies(&rows)
}

/// Average rouble salary; `None` when no vacancy has a rouble salary.
pub async fn avg_salary(pool: &PgPool) -> Result<Option<f64>, StorageError> {
    let row = sqlx::query(&format!(
        r#"
        SELECT AVG({SALARY_POINT_SQL})::float8 AS avg_salary
          FROM vacancies v
         WHERE v.salary_currency = $1
           AND (v.salary_from IS NOT NULL OR v.salary_to IS NOT NULL)
        "#
    ))
    .bind(CANONICAL_RUBLE)
    .fetch_one(pool)
    .await?;
    Ok(row.try_get("avg_salary")?)
}

/// Rouble vacancies paying above the average, best paid first.
pub async fn vacancies_with_higher_salary(pool: &PgPool) -> Result<Vec<StoredVacancy>, StorageError> {
    let rows = sqlx::query(&format!(
        r#"
        WITH priced AS (
            SELECT v.id, {SALARY_POINT_SQL} AS salary_point
              FROM vacancies v
             WHERE v.salary_currency = $1
               AND (v.salary_from IS NOT NULL OR v.salary_to IS NOT NULL)
        ),
        average AS (
            SELECT AVG(salary_point) AS value FROM priced
        )
        SELECT {VACANCY_COLUMNS_SQL}
          FROM priced p
          JOIN average a ON p.salary_point > a.value
          JOIN vacancies v ON v.id = p.id
          LEFT JOIN companies c ON c.id = v.company_id
         ORDER BY p.salary_point DESC, v.id
        "#
    ))
    .bind(CANONICAL_RUBLE)
    .fetch_all(pool)
    .await?;
    stored_vacancies(&rows)
}

/// Case-insensitive match on title, description or requirements.
pub async fn vacancies_with_keyword(pool: &PgPool, keyword: &str) -> Result<Vec<StoredVacancy>, StorageError> {
    let keyword = keyword.trim();
    if keyword.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(&format!(
        r#"
        SELECT {VACANCY_COLUMNS_SQL}
          FROM vacancies v
          LEFT JOIN companies c ON c.id = v.company_id
         WHERE v.title ILIKE $1
            OR v.description ILIKE $1
            OR v.requirements ILIKE $1
         ORDER BY v.published_at DESC NULLS LAST, v.id
        "#
    ))
    .bind(like_pattern(keyword))
    .fetch_all(pool)
    .await?;
    stored_vacancies(&rows)
}

pub async fn database_stats(pool: &PgPool) -> Result<DatabaseStats, StorageError> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS total_vacancies,
               COUNT(DISTINCT company_id) AS companies_with_vacancies,
               COUNT(*) FILTER (WHERE salary_from IS NOT NULL OR salary_to IS NOT NULL)
                   AS vacancies_with_salary,
               MAX(published_at) AS latest_published_at
          FROM vacancies
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(DatabaseStats {
        total_vacancies: row.try_get("total_vacancies")?,
        companies_with_vacancies: row.try_get("companies_with_vacancies")?,
        vacancies_with_salary: row.try_get("vacancies_with_salary")?,
        latest_published_at: row.try_get("latest_published_at")?,
    })
}

/// `%keyword%` with LIKE wildcards in the keyword taken literally.
fn like_pattern(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len() + 2);
    escaped.push('%');
    for ch in keyword.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}
