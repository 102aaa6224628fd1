//! Best-effort run bookkeeping (`scraper_runs`, `scraper_logs`).
//!
//! The pipeline never depends on these writes. Which sink is used is decided
//! once at startup: `PgRunAudit::detect` falls back to `NoopAudit` when the
//! tables are missing, and `BestEffortAudit` is the only place failures are
//! swallowed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealflow_core::RunStats;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub vertical_slug: String,
    pub broker_source: String,
    pub scraper_type: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub stats: RunStats,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl AuditLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub message: String,
    pub context: JsonValue,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start_run(&self, record: &RunRecord) -> Result<(), AuditError>;
    async fn finish_run(&self, record: &RunRecord) -> Result<(), AuditError>;
    async fn record_event(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAudit;

#[async_trait]
impl AuditSink for NoopAudit {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn start_run(&self, _record: &RunRecord) -> Result<(), AuditError> {
        Ok(())
    }

    async fn finish_run(&self, _record: &RunRecord) -> Result<(), AuditError> {
        Ok(())
    }

    async fn record_event(&self, _event: &AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

fn counter(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone)]
pub struct PgRunAudit {
    pool: PgPool,
}

impl PgRunAudit {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Postgres audit when both tables exist, otherwise the no-op sink.
    pub async fn detect(pool: PgPool) -> Box<dyn AuditSink> {
        match Self::tables_present(&pool).await {
            Ok(true) => Box::new(Self::new(pool)),
            Ok(false) => {
                info!("scraper_runs/scraper_logs not found; run audit disabled");
                Box::new(NoopAudit)
            }
            Err(err) => {
                info!(error = %err, "could not probe audit tables; run audit disabled");
                Box::new(NoopAudit)
            }
        }
    }

    async fn tables_present(pool: &PgPool) -> Result<bool, sqlx::Error> {
        let (runs, logs): (bool, bool) = sqlx::query_as(
            "SELECT to_regclass('scraper_runs') IS NOT NULL, to_regclass('scraper_logs') IS NOT NULL",
        )
        .fetch_one(pool)
        .await?;
        Ok(runs && logs)
    }
}

#[async_trait]
impl AuditSink for PgRunAudit {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn start_run(&self, record: &RunRecord) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO scraper_runs (
                id, vertical_slug, broker_source, scraper_type, started_at, status,
                total_listings_found, new_listings, updated_listings, failed_listings
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, 0, 0, 0)
            "#,
        )
        .bind(record.run_id)
        .bind(&record.vertical_slug)
        .bind(&record.broker_source)
        .bind(&record.scraper_type)
        .bind(record.started_at)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_run(&self, record: &RunRecord) -> Result<(), AuditError> {
        let result = sqlx::query(
            r#"
            UPDATE scraper_runs
            SET completed_at = $2,
                status = $3,
                total_listings_found = $4,
                new_listings = $5,
                updated_listings = $6,
                failed_listings = $7,
                error_message = $8
            WHERE id = $1
            "#,
        )
        .bind(record.run_id)
        .bind(record.finished_at.unwrap_or_else(Utc::now))
        .bind(record.status.as_str())
        .bind(counter(record.stats.total_found))
        .bind(counter(record.stats.new_listings))
        .bind(counter(record.stats.updated_listings))
        .bind(counter(record.stats.errors))
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AuditError::Unavailable(format!(
                "run {} was never recorded",
                record.run_id
            )));
        }
        Ok(())
    }

    async fn record_event(&self, event: &AuditEvent) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO scraper_logs (id, scraper_run_id, timestamp, level, message, context)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.run_id)
        .bind(event.timestamp)
        .bind(event.level.as_str())
        .bind(&event.message)
        .bind(&event.context)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Wraps any sink so that audit failures never reach the caller.
pub struct BestEffortAudit {
    inner: Box<dyn AuditSink>,
}

impl BestEffortAudit {
    pub fn new(inner: Box<dyn AuditSink>) -> Self {
        Self { inner }
    }

    pub fn noop() -> Self {
        Self::new(Box::new(NoopAudit))
    }

    pub fn sink_name(&self) -> &'static str {
        self.inner.name()
    }

    pub async fn start_run(&self, record: &RunRecord) {
        if let Err(err) = self.inner.start_run(record).await {
            debug!(sink = self.inner.name(), run_id = %record.run_id, error = %err, "audit start_run skipped");
        }
    }

    pub async fn finish_run(&self, record: &RunRecord) {
        if let Err(err) = self.inner.finish_run(record).await {
            debug!(sink = self.inner.name(), run_id = %record.run_id, error = %err, "audit finish_run skipped");
        }
    }

    pub async fn record_event(&self, event: AuditEvent) {
        if let Err(err) = self.inner.record_event(&event).await {
            debug!(sink = self.inner.name(), run_id = %event.run_id, error = %err, "audit event skipped");
        }
    }
}
