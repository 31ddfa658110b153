use std::collections::HashMap;

use jobsift_core::{
    OperationMessage, PersistOutcome, TargetCompanies, TargetCompanyResolver, VacancyRecord,
};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{info, warn};

use crate::{PersistenceError, StorageError};

/// Inserts each configured company, or refreshes its ids and description.
///
/// The filter stage matches employer ids against these rows, so they must
/// follow the configuration. Returns how many rows were new.
pub async fn seed_companies(pool: &PgPool, companies: &TargetCompanies) -> Result<u64, StorageError> {
    let mut tx = pool.begin().await?;
    let mut inserted = 0;
    let mut updated = 0;

    for company in companies.iter() {
        let row = sqlx::query(
            r#"
            INSERT INTO companies (name, hh_id, sj_id, description)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
               SET hh_id = EXCLUDED.hh_id,
                   sj_id = EXCLUDED.sj_id,
                   description = EXCLUDED.description
             WHERE (companies.hh_id, companies.sj_id, companies.description)
                   IS DISTINCT FROM (EXCLUDED.hh_id, EXCLUDED.sj_id, EXCLUDED.description)
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&company.name)
        .bind(company.hh_id.as_deref().map(str::trim))
        .bind(company.sj_id.as_deref().map(str::trim))
        .bind(&company.description)
        .fetch_optional(&mut *tx)
        .await?;

        match row {
            Some(row) if row.try_get::<bool, _>("inserted")? => inserted += 1,
            Some(_) => updated += 1,
            None => {}
        }
    }

    tx.commit().await?;
    info!(configured = companies.len(), inserted, updated, "seeded target companies");
    Ok(inserted)
}

/// Writes the batch in one transaction: all of it or none of it.
///
/// Records whose employer does not resolve to a seeded company are reported
/// and not written. A conflicting storage key is a skip, not an error.
pub async fn persist_batch(
    pool: &PgPool,
    resolver: &TargetCompanyResolver,
    records: &[VacancyRecord],
) -> Result<Vec<OperationMessage>, PersistenceError> {
    let batch_size = records.len();
    let mut processed = 0;

    let mut tx = pool.begin().await.map_err(|source| PersistenceError {
        batch_size,
        processed,
        source,
    })?;

    match write_records(&mut *tx, resolver, records, &mut processed).await {
        Ok(messages) => {
            tx.commit().await.map_err(|source| PersistenceError {
                batch_size,
                processed,
                source,
            })?;
            let added = messages
                .iter()
                .filter(|m| m.outcome == PersistOutcome::Added)
                .count();
            info!(batch_size, added, skipped = batch_size - added, "batch persisted");
            Ok(messages)
        }
        Err(source) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "persist rollback failed");
            }
            warn!(batch_size, processed, error = %source, "batch rolled back");
            Err(PersistenceError {
                batch_size,
                processed,
                source,
            })
        }
    }
}

async fn write_records(
    conn: &mut PgConnection,
    resolver: &TargetCompanyResolver,
    records: &[VacancyRecord],
    processed: &mut usize,
) -> Result<Vec<OperationMessage>, sqlx::Error> {
    let rows = sqlx::query("SELECT id, name FROM companies")
        .fetch_all(&mut *conn)
        .await?;
    let mut company_ids: HashMap<String, i64> = HashMap::with_capacity(rows.len());
    for row in &rows {
        let id: i64 = row.try_get("id")?;
        let name: String = row.try_get("name")?;
        company_ids.insert(name, id);
    }

    let mut messages = Vec::with_capacity(records.len());
    for record in records {
        let company_id = resolver
            .resolve_record(record)
            .and_then(|canonical| company_ids.get(canonical.as_str()).copied());

        let outcome = match company_id {
            None => PersistOutcome::SkippedUnresolvedCompany,
            Some(company_id) => {
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO vacancies (
                        external_id, title, salary_from, salary_to, salary_currency,
                        company_id, source, url, description, requirements,
                        responsibilities, published_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    ON CONFLICT (external_id) DO NOTHING
                    RETURNING id
                    "#,
                )
                .bind(record.storage_key())
                .bind(&record.title)
                .bind(record.salary_from)
                .bind(record.salary_to)
                .bind(&record.salary_currency)
                .bind(company_id)
                .bind(record.source.as_str())
                .bind(&record.url)
                .bind(&record.description)
                .bind(&record.requirements)
                .bind(&record.responsibilities)
                .bind(record.published_at)
                .fetch_optional(&mut *conn)
                .await?;

                if inserted.is_some() {
                    PersistOutcome::Added
                } else {
                    PersistOutcome::SkippedExisting
                }
            }
        };

        *processed += 1;
        messages.push(OperationMessage::new(record, outcome));
    }
    Ok(messages)
}

/// Storage key -> stored, for the whole batch in a single query.
pub async fn existence_check_batch(
    pool: &PgPool,
    records: &[VacancyRecord],
) -> Result<HashMap<String, bool>, StorageError> {
    let keys: Vec<String> = records.iter().map(VacancyRecord::storage_key).collect();
    let mut out: HashMap<String, bool> = keys.iter().map(|k| (k.clone(), false)).collect();
    if keys.is_empty() {
        return Ok(out);
    }

    let rows = sqlx::query("SELECT external_id FROM vacancies WHERE external_id = ANY($1)")
        .bind(&keys)
        .fetch_all(pool)
        .await?;
    for row in rows {
        let key: String = row.try_get("external_id")?;
        out.insert(key, true);
    }
    Ok(out)
}
