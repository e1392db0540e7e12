//! SQLite-backed dedup store for notices, plus out-of-band maintenance.

use chrono::{DateTime, Duration, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::SqlitePoolOptions;
use thiserror::Error;
use tracing::{error, info};
use tw_core::{NoticeDraft, NoticeRecord};

pub const CRATE_NAME: &str = "tw-store";

pub type DbPool = sqlx::SqlitePool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub async fn connect(database_url: &str) -> Result<DbPool, StoreError> {
    connect_with_settings(database_url, 5, 30).await
}

pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Size of the database file on disk. `None` for an in-memory database or
/// when the file does not exist.
pub fn database_file_size(path: &str) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}

/// Aggregate statistics for the maintenance CLI.
#[derive(Debug, Clone, Default)]
pub struct StoreStatistics {
    pub total: i64,
    pub by_keyword: Vec<(String, i64)>,
    pub by_category: Vec<(String, i64)>,
    pub oldest_created_at: Option<DateTime<Utc>>,
    pub newest_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NoticeStore {
    pool: DbPool,
}

impl NoticeStore {
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let pool = connect(database_url).await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Insert-if-absent keyed by `external_key`. Returns the subset that was
    /// newly inserted, preserving input order. Duplicates within the batch or
    /// across runs are silently skipped. A write failure on one record is
    /// logged and does not abort the rest of the batch.
    pub async fn persist_new(&self, drafts: &[NoticeDraft]) -> Vec<NoticeRecord> {
        let mut inserted = Vec::new();
        for draft in drafts {
            let created_at = Utc::now();
            let result = sqlx::query(
                "INSERT OR IGNORE INTO notices (
                    external_key, project_name, organization_name, category,
                    procedure_type, location, cft_issue_date,
                    tender_submission_deadline, opening_tenders_event,
                    period_end_time, external_document_uri, file_type,
                    file_size, search_keyword, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&draft.external_key)
            .bind(&draft.project_name)
            .bind(&draft.organization_name)
            .bind(&draft.category)
            .bind(&draft.procedure_type)
            .bind(&draft.location)
            .bind(&draft.cft_issue_date)
            .bind(&draft.tender_submission_deadline)
            .bind(&draft.opening_tenders_event)
            .bind(&draft.period_end_time)
            .bind(&draft.external_document_uri)
            .bind(&draft.file_type)
            .bind(draft.file_size)
            .bind(&draft.search_keyword)
            .bind(created_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) if done.rows_affected() > 0 => {
                    inserted.push(NoticeRecord::from_draft(draft.clone(), created_at));
                }
                Ok(_) => {
                    // Already known; no-op by design.
                }
                Err(err) => {
                    error!(
                        external_key = %draft.external_key,
                        keyword = %draft.search_keyword,
                        %err,
                        "store write failed; skipping record"
                    );
                }
            }
        }
        inserted
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notices")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    /// Retention sweep: delete records whose `created_at` is older than the
    /// cutoff. Administrative; never runs on the ingestion path.
    pub async fn delete_older_than(&self, days: i64) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(days);
        let done = sqlx::query("DELETE FROM notices WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let deleted = done.rows_affected();
        info!(days, deleted, "retention sweep finished");
        Ok(deleted)
    }

    pub async fn vacuum(&self) -> Result<(), StoreError> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        info!("database compacted");
        Ok(())
    }

    pub async fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        let total = self.count().await?;
        let by_keyword: Vec<(String, i64)> = sqlx::query_as(
            "SELECT search_keyword, COUNT(*) AS count FROM notices
             GROUP BY search_keyword ORDER BY count DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let by_category: Vec<(String, i64)> = sqlx::query_as(
            "SELECT category, COUNT(*) AS count FROM notices
             WHERE category IS NOT NULL
             GROUP BY category ORDER BY count DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let (oldest_created_at, newest_created_at): (
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
        ) = sqlx::query_as("SELECT MIN(created_at), MAX(created_at) FROM notices")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStatistics {
            total,
            by_keyword,
            by_category,
            oldest_created_at,
            newest_created_at,
        })
    }
}
