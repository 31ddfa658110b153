use jobsift_core::{normalize_text, MatchPattern, SourceTag, VacancyRecord, SUBSTRING_GUARD_CHARS};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{FilterStage, FilterStageError};

/// Resolves target-company membership and drops already-stored records in one transaction.
///
/// The batch is staged into a per-call temp table (`ON COMMIT DROP`) and joined
/// against `companies`, the name/alias patterns and `vacancies`. The
/// transaction is ended on every path so no staging table outlives the call.
/// A record that matches no company id and no pattern is never returned.
pub async fn filter_new_target(
    pool: &PgPool,
    patterns: &[MatchPattern],
    records: &[VacancyRecord],
) -> Result<Vec<VacancyRecord>, FilterStageError> {
    let batch_size = records.len();
    if records.is_empty() {
        debug!("filter stage skipped for empty batch");
        return Ok(Vec::new());
    }

    let mut stage = FilterStage::Received;
    let mut tx = pool.begin().await.map_err(|source| FilterStageError {
        stage,
        batch_size,
        source,
    })?;

    match run_stage(&mut *tx, &mut stage, patterns, records).await {
        Ok(ordinals) => {
            tx.commit().await.map_err(|source| FilterStageError {
                stage,
                batch_size,
                source,
            })?;
            stage = FilterStage::Returned;
            let kept: Vec<VacancyRecord> = ordinals
                .into_iter()
                .filter_map(|i| usize::try_from(i).ok())
                .filter_map(|i| records.get(i).cloned())
                .collect();
            info!(batch_size, kept = kept.len(), %stage, "filter stage finished");
            Ok(kept)
        }
        Err(source) => {
            let failed_after = stage;
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "filter stage rollback failed");
            }
            stage = FilterStage::Aborted;
            warn!(batch_size, %failed_after, %stage, error = %source, "filter stage aborted");
            Err(FilterStageError {
                stage: failed_after,
                batch_size,
                source,
            })
        }
    }
}

async fn run_stage(
    conn: &mut PgConnection,
    stage: &mut FilterStage,
    patterns: &[MatchPattern],
    records: &[VacancyRecord],
) -> Result<Vec<i32>, sqlx::Error> {
    let suffix = Uuid::new_v4().simple().to_string();
    let staged = format!("staged_vacancies_{suffix}");

    sqlx::query(&format!(
        r#"
        CREATE TEMP TABLE {staged} (
            ordinal            INT4 NOT NULL,
            storage_key        TEXT NOT NULL,
            source             TEXT NOT NULL,
            employer_source_id TEXT,
            employer_norm      TEXT NOT NULL
        ) ON COMMIT DROP
        "#
    ))
    .execute(&mut *conn)
    .await?;

    let mut ordinals = Vec::with_capacity(records.len());
    let mut keys = Vec::with_capacity(records.len());
    let mut sources = Vec::with_capacity(records.len());
    let mut source_ids: Vec<Option<String>> = Vec::with_capacity(records.len());
    let mut employers = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        ordinals.push(i as i32);
        keys.push(record.storage_key());
        sources.push(record.source.as_str().to_string());
        source_ids.push(
            record
                .employer_source_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string),
        );
        employers.push(normalize_text(&record.employer_name));
    }

    sqlx::query(&format!(
        r#"
        INSERT INTO {staged} (ordinal, storage_key, source, employer_source_id, employer_norm)
        SELECT * FROM UNNEST($1::int4[], $2::text[], $3::text[], $4::text[], $5::text[])
        "#
    ))
    .bind(&ordinals)
    .bind(&keys)
    .bind(&sources)
    .bind(&source_ids)
    .bind(&employers)
    .execute(&mut *conn)
    .await?;

    *stage = FilterStage::TempTableLoaded;
    debug!(
        batch_size = records.len(),
        patterns = patterns.len(),
        stage = %FilterStage::TempTableLoaded,
        "staged batch"
    );

    let guard = SUBSTRING_GUARD_CHARS as i32;
    let priorities: Vec<i32> = patterns.iter().map(|p| p.priority).collect();
    let company_names: Vec<String> = patterns.iter().map(|p| p.company_name.clone()).collect();
    let texts: Vec<String> = patterns.iter().map(|p| p.pattern.clone()).collect();
    let rows = sqlx::query(&format!(
        r#"
        WITH id_matches AS (
            SELECT s.ordinal, c.id AS company_id, 0 AS match_rank, 0 AS priority
              FROM {staged} s
              JOIN companies c
                ON (s.source = $1 AND c.hh_id = s.employer_source_id)
                OR (s.source = $2 AND c.sj_id = s.employer_source_id)
        ),
        alias_matches AS (
            SELECT s.ordinal, c.id AS company_id, 1 AS match_rank, a.priority
              FROM {staged} s
              JOIN UNNEST($4::int4[], $5::text[], $6::text[]) AS a(priority, company_name, pattern)
                ON a.pattern = s.employer_norm
                OR (char_length(a.pattern) > $3
                    AND char_length(s.employer_norm) > $3
                    AND (strpos(s.employer_norm, a.pattern) > 0
                         OR strpos(a.pattern, s.employer_norm) > 0))
              JOIN companies c ON c.name = a.company_name
        ),
        resolved AS (
            SELECT DISTINCT ON (m.ordinal) m.ordinal, m.company_id
              FROM (SELECT * FROM id_matches UNION ALL SELECT * FROM alias_matches) m
             ORDER BY m.ordinal, m.match_rank, m.priority
        )
        SELECT r.ordinal
          FROM resolved r
          JOIN {staged} s ON s.ordinal = r.ordinal
         WHERE NOT EXISTS (
               SELECT 1 FROM vacancies v WHERE v.external_id = s.storage_key
         )
         ORDER BY r.ordinal
        "#
    ))
    .bind(SourceTag::HeadHunter.as_str())
    .bind(SourceTag::SuperJob.as_str())
    .bind(guard)
    .bind(&priorities)
    .bind(&company_names)
    .bind(&texts)
    .fetch_all(&mut *conn)
    .await?;

    *stage = FilterStage::JoinedAndFiltered;

    rows.iter()
        .map(|row| row.try_get::<i32, _>("ordinal"))
        .collect()
}
