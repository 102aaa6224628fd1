//! One scrape run for one vertical:
//! `NotStarted → Authenticating → Fetching → Filtering → Persisting → Completed | Failed`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dealflow_adapters::{CredentialProvider, Normalizer, PageFetcher, VerticalFilter, SOURCE_KEY, SOURCE_NAME};
use dealflow_core::{CanonicalListing, RawListing, RunStats, VerticalDefinition};
use dealflow_storage::{AuditEvent, AuditLevel, BestEffortAudit, PersistenceSink, RunRecord, RunStatus};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collector::ConcurrentCollector;
use crate::persist::{persist_in_batches, DEFAULT_BATCH_SIZE};
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Authenticating,
    Fetching,
    Filtering,
    Persisting,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Authenticating => "authenticating",
            Self::Fetching => "fetching",
            Self::Filtering => "filtering",
            Self::Persisting => "persisting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_id: Uuid,
    pub max_pages: u32,
    pub workers: usize,
    pub batch_size: usize,
    pub page_timeout: Option<Duration>,
}

impl RunOptions {
    pub fn new(max_pages: u32, workers: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            max_pages,
            workers,
            batch_size: DEFAULT_BATCH_SIZE,
            page_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub vertical_slug: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RunStats,
    pub pages_total: usize,
    pub pages_failed: usize,
    pub duplicates_dropped: usize,
    pub failed_batches: usize,
    pub states: Vec<RunState>,
}

#[derive(Debug, Error)]
#[error("run {run_id} failed while {failed_in}: {source}")]
pub struct RunFailure {
    pub run_id: Uuid,
    pub failed_in: RunState,
    pub stats: RunStats,
    #[source]
    pub source: SyncError,
}

#[derive(Debug, Default)]
struct PageCounters {
    total: usize,
    failed: usize,
    duplicates: usize,
    failed_batches: usize,
}

pub struct RunCoordinator {
    vertical: VerticalDefinition,
    credentials: Arc<dyn CredentialProvider>,
    fetcher: Arc<dyn PageFetcher>,
    sink: Arc<dyn PersistenceSink>,
    audit: BestEffortAudit,
    options: RunOptions,
    state: RunState,
    history: Vec<RunState>,
}

impl RunCoordinator {
    pub fn new(
        vertical: VerticalDefinition,
        credentials: Arc<dyn CredentialProvider>,
        fetcher: Arc<dyn PageFetcher>,
        sink: Arc<dyn PersistenceSink>,
        audit: BestEffortAudit,
        options: RunOptions,
    ) -> Self {
        Self {
            vertical,
            credentials,
            fetcher,
            sink,
            audit,
            options,
            state: RunState::NotStarted,
            history: vec![RunState::NotStarted],
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.options.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    /// Executes the run once. A coordinator that has already left
    /// `NotStarted` refuses to run again and leaves its state untouched.
    pub async fn run(&mut self) -> Result<RunSummary, RunFailure> {
        if self.state != RunState::NotStarted {
            warn!(run_id = %self.options.run_id, state = %self.state, "run already executed");
            return Err(RunFailure {
                run_id: self.options.run_id,
                failed_in: self.state,
                stats: RunStats::default(),
                source: SyncError::AlreadyRun { state: self.state },
            });
        }
        let started_at = Utc::now();
        let mut stats = RunStats::default();
        let mut counters = PageCounters::default();

        info!(
            run_id = %self.options.run_id,
            vertical = %self.vertical.slug,
            max_pages = self.options.max_pages,
            workers = self.options.workers,
            audit = self.audit.sink_name(),
            "scrape run starting"
        );
        self.audit
            .start_run(&self.record(started_at, None, RunStatus::Running, stats, None))
            .await;

        match self.execute(started_at, &mut stats, &mut counters).await {
            Ok(()) => {
                self.transition(RunState::Completed);
                let finished_at = Utc::now();
                self.audit
                    .finish_run(&self.record(started_at, Some(finished_at), RunStatus::Completed, stats, None))
                    .await;
                info!(
                    run_id = %self.options.run_id,
                    total_found = stats.total_found,
                    matched = stats.matched,
                    filtered_out = stats.filtered_out,
                    persisted = stats.persisted,
                    new = stats.new_listings,
                    updated = stats.updated_listings,
                    errors = stats.errors,
                    "scrape run completed"
                );
                Ok(RunSummary {
                    run_id: self.options.run_id,
                    vertical_slug: self.vertical.slug.clone(),
                    started_at,
                    finished_at,
                    stats,
                    pages_total: counters.total,
                    pages_failed: counters.failed,
                    duplicates_dropped: counters.duplicates,
                    failed_batches: counters.failed_batches,
                    states: self.history.clone(),
                })
            }
            Err(source) => {
                let failed_in = self.state;
                self.transition(RunState::Failed);
                let message = source.to_string();
                error!(run_id = %self.options.run_id, %failed_in, error = %message, "scrape run failed");
                self.event(AuditLevel::Error, &message, json!({ "state": failed_in })).await;
                self.audit
                    .finish_run(&self.record(
                        started_at,
                        Some(Utc::now()),
                        RunStatus::Failed,
                        stats,
                        Some(message),
                    ))
                    .await;
                Err(RunFailure {
                    run_id: self.options.run_id,
                    failed_in,
                    stats,
                    source,
                })
            }
        }
    }

    async fn execute(
        &mut self,
        observed_at: DateTime<Utc>,
        stats: &mut RunStats,
        counters: &mut PageCounters,
    ) -> Result<(), SyncError> {
        self.transition(RunState::Authenticating);
        let token = self.credentials.bearer_token().await?;
        self.event(AuditLevel::Info, "bearer token obtained", JsonValue::Null).await;

        self.transition(RunState::Fetching);
        let mut collector = ConcurrentCollector::new(Arc::clone(&self.fetcher), self.options.workers);
        if let Some(timeout) = self.options.page_timeout {
            collector = collector.with_page_timeout(timeout);
        }
        let outcome = collector.collect(self.options.max_pages, &token).await;
        counters.total = outcome.pages_total;
        counters.failed = outcome.pages_failed;
        counters.duplicates = outcome.duplicates_dropped;
        stats.total_found = outcome.listings.len();
        self.event(
            AuditLevel::Info,
            &format!("fetched {} unique listings", stats.total_found),
            json!({
                "pages": outcome.pages_total,
                "pages_failed": outcome.pages_failed,
                "duplicates_dropped": outcome.duplicates_dropped,
                "failures": outcome.failures.iter().map(|f| json!({
                    "page": f.page,
                    "status": f.status,
                    "error": f.message,
                })).collect::<Vec<_>>(),
            }),
        )
        .await;
        if outcome.listings.is_empty() {
            return Err(SyncError::NoListings {
                pages: self.options.max_pages,
                failed: outcome.pages_failed,
            });
        }

        self.transition(RunState::Filtering);
        let rows = self.filter_and_normalize(&outcome.listings, observed_at, stats);
        self.event(
            AuditLevel::Info,
            &format!("{} listings matched {}", stats.matched, self.vertical.slug),
            json!({ "filtered_out": stats.filtered_out, "errors": stats.errors }),
        )
        .await;
        if rows.is_empty() {
            warn!(run_id = %self.options.run_id, vertical = %self.vertical.slug, "no listings matched; nothing to persist");
            self.event(AuditLevel::Warning, "no listings matched the vertical", JsonValue::Null)
                .await;
        }

        self.transition(RunState::Persisting);
        let report = persist_in_batches(self.sink.as_ref(), &rows, self.options.batch_size).await;
        stats.persisted = report.persisted;
        stats.new_listings = report.inserted;
        stats.updated_listings = report.updated;
        stats.errors += report.errors;
        counters.failed_batches = report.failed_batches;
        let level = if report.failed_batches > 0 {
            AuditLevel::Warning
        } else {
            AuditLevel::Info
        };
        self.event(
            level,
            &format!("persisted {} listings", report.persisted),
            json!({
                "batches": report.batches,
                "failed_batches": report.failed_batches,
                "new": report.inserted,
                "updated": report.updated,
            }),
        )
        .await;
        Ok(())
    }

    fn filter_and_normalize(
        &self,
        listings: &[RawListing],
        observed_at: DateTime<Utc>,
        stats: &mut RunStats,
    ) -> Vec<CanonicalListing> {
        let filter = VerticalFilter::new(&self.vertical);
        let normalizer = Normalizer::new(self.vertical.slug.clone(), observed_at);
        let mut rows = Vec::new();
        for raw in listings {
            if !filter.matches(raw) {
                stats.filtered_out += 1;
                continue;
            }
            match normalizer.normalize(raw) {
                Ok(row) => rows.push(row),
                Err(err) => {
                    warn!(run_id = %self.options.run_id, identity = %raw.identity(), error = %err, "listing skipped");
                    stats.errors += 1;
                }
            }
        }
        stats.matched = rows.len();
        rows
    }

    fn transition(&mut self, next: RunState) {
        info!(run_id = %self.options.run_id, from = %self.state, to = %next, "run state");
        self.state = next;
        self.history.push(next);
    }

    async fn event(&self, level: AuditLevel, message: &str, context: JsonValue) {
        self.audit
            .record_event(AuditEvent {
                run_id: self.options.run_id,
                timestamp: Utc::now(),
                level,
                message: message.to_string(),
                context,
            })
            .await;
    }

    fn record(
        &self,
        started_at: DateTime<Utc>,
        finished_at: Option<DateTime<Utc>>,
        status: RunStatus,
        stats: RunStats,
        error_message: Option<String>,
    ) -> RunRecord {
        RunRecord {
            run_id: self.options.run_id,
            vertical_slug: self.vertical.slug.clone(),
            broker_source: SOURCE_NAME.to_string(),
            scraper_type: SOURCE_KEY.to_string(),
            started_at,
            finished_at,
            status,
            stats,
            error_message,
        }
    }
}
