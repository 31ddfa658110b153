//! PostgreSQL persistence for jobsift: schema, seeding, filter stage, batch writes, analytics.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobsift_core::{OperationMessage, TargetCompanyResolver, VacancyRecord};
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::info;

mod analytics;
mod filter;
mod persist;

pub use analytics::{
    all_vacancies, avg_salary, companies_and_vacancies_count, database_stats, list_companies,
    vacancies_with_higher_salary, vacancies_with_keyword, CompanyVacancyCount, DatabaseStats,
    StoredCompany, StoredVacancy,
};
pub use filter::filter_new_target;
pub use persist::{existence_check_batch, persist_batch, seed_companies};
pub use sqlx::{Error as DatabaseError, PgPool};

pub const CRATE_NAME: &str = "jobsift-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Progress of one filter-stage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStage {
    Received,
    TempTableLoaded,
    JoinedAndFiltered,
    Returned,
    Aborted,
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterStage::Received => "received",
            FilterStage::TempTableLoaded => "temp_table_loaded",
            FilterStage::JoinedAndFiltered => "joined_and_filtered",
            FilterStage::Returned => "returned",
            FilterStage::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// The batch was rolled back; retrying the whole batch is safe.
#[derive(Debug, Error)]
#[error("filter stage failed after `{stage}` for a batch of {batch_size} records")]
pub struct FilterStageError {
    pub stage: FilterStage,
    pub batch_size: usize,
    pub source: sqlx::Error,
}

/// Nothing from the batch was committed.
#[derive(Debug, Error)]
#[error("persisting batch of {batch_size} records failed after {processed} writes")]
pub struct PersistenceError {
    pub batch_size: usize,
    pub processed: usize,
    pub source: sqlx::Error,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StorageError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<(), StorageError> {
    MIGRATOR.run(pool).await?;
    info!("database migrations applied");
    Ok(())
}

/// The storage operations the pipeline depends on.
#[async_trait]
pub trait VacancyStorage: Send + Sync {
    /// Records that belong to a target company and are not stored yet.
    async fn filter_new_target(
        &self,
        records: &[VacancyRecord],
    ) -> Result<Vec<VacancyRecord>, FilterStageError>;

    /// Insert-or-skip; one message per input record.
    async fn persist(&self, records: &[VacancyRecord]) -> Result<Vec<OperationMessage>, PersistenceError>;

    /// Storage key -> already stored, in one query.
    async fn existence_check_batch(
        &self,
        records: &[VacancyRecord],
    ) -> Result<HashMap<String, bool>, StorageError>;
}

#[derive(Debug, Clone)]
pub struct PgVacancyStorage {
    pool: PgPool,
    resolver: Arc<TargetCompanyResolver>,
}

impl PgVacancyStorage {
    pub fn new(pool: PgPool, resolver: Arc<TargetCompanyResolver>) -> Self {
        Self { pool, resolver }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl VacancyStorage for PgVacancyStorage {
    async fn filter_new_target(
        &self,
        records: &[VacancyRecord],
    ) -> Result<Vec<VacancyRecord>, FilterStageError> {
        filter_new_target(&self.pool, self.resolver.patterns(), records).await
    }

    async fn persist(&self, records: &[VacancyRecord]) -> Result<Vec<OperationMessage>, PersistenceError> {
        persist_batch(&self.pool, &self.resolver, records).await
    }

    async fn existence_check_batch(
        &self,
        records: &[VacancyRecord],
    ) -> Result<HashMap<String, bool>, StorageError> {
        existence_check_batch(&self.pool, records).await
    }
}
