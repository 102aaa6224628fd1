//! Chunked upserts of canonical listings with per-batch failure accounting.

use dealflow_core::CanonicalListing;
use dealflow_storage::{PersistenceSink, LISTINGS_CONFLICT_KEY, LISTINGS_TABLE};
use tracing::{info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub batch: usize,
    pub rows: usize,
    pub message: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PersistReport {
    pub batches: usize,
    pub failed_batches: usize,
    pub persisted: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Rows belonging to failed batches.
    pub errors: usize,
    pub failures: Vec<BatchFailure>,
}

/// Upserts `listings` into `listings` in chunks of `batch_size`.
///
/// A failing batch is logged and its rows counted as errors; later batches
/// are still attempted. Nothing is retried.
pub async fn persist_in_batches(
    sink: &dyn PersistenceSink,
    listings: &[CanonicalListing],
    batch_size: usize,
) -> PersistReport {
    let mut report = PersistReport::default();
    for (index, batch) in listings.chunks(batch_size.max(1)).enumerate() {
        report.batches += 1;
        match sink.upsert(LISTINGS_TABLE, batch, LISTINGS_CONFLICT_KEY).await {
            Ok(outcome) => {
                report.persisted += outcome.affected;
                report.inserted += outcome.inserted;
                report.updated += outcome.updated;
                info!(
                    batch = index + 1,
                    rows = batch.len(),
                    inserted = outcome.inserted,
                    updated = outcome.updated,
                    "batch upserted"
                );
            }
            Err(err) => {
                warn!(batch = index + 1, rows = batch.len(), error = %err, "batch upsert failed");
                report.failed_batches += 1;
                report.errors += batch.len();
                report.failures.push(BatchFailure {
                    batch: index + 1,
                    rows: batch.len(),
                    message: err.to_string(),
                });
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use dealflow_core::ListingStatus;
    use dealflow_storage::{MemoryListingSink, PersistenceError, UpsertOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn listing(id: usize) -> CanonicalListing {
        let now = Utc::now();
        CanonicalListing {
            id: format!("id-{id}"),
            vertical_slug: "cleaning".into(),
            title: format!("Listing {id}"),
            slug: format!("listing-{id}"),
            description: None,
            city: None,
            state: None,
            country: "US".into(),
            zip_code: None,
            asking_price: None,
            revenue: None,
            sde: None,
            ebitda: None,
            cash_flow: None,
            category: None,
            status: ListingStatus::Pending,
            source: "BizBuySell".into(),
            external_id: id.to_string(),
            external_url: String::new(),
            images: Vec::new(),
            documents: Vec::new(),
            meta_title: format!("Listing {id}"),
            meta_description: None,
            custom_fields: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rejects the second call, accepts everything else.
    struct FlakySink {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PersistenceSink for FlakySink {
        async fn upsert(
            &self,
            _table: &str,
            batch: &[CanonicalListing],
            _conflict_key: &str,
        ) -> Result<UpsertOutcome, PersistenceError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(PersistenceError::Rejected("constraint violation".into()));
            }
            Ok(UpsertOutcome {
                affected: batch.len(),
                inserted: batch.len(),
                updated: 0,
            })
        }
    }

    #[tokio::test]
    async fn splits_into_bounded_batches() {
        let sink = MemoryListingSink::new();
        let rows: Vec<_> = (0..1203).map(listing).collect();

        let report = persist_in_batches(&sink, &rows, DEFAULT_BATCH_SIZE).await;
        assert_eq!(report.batches, 3);
        assert_eq!(report.persisted, 1203);
        assert_eq!(report.inserted, 1203);
        assert_eq!(report.errors, 0);
        assert_eq!(sink.len(LISTINGS_TABLE), 1203);
    }

    #[tokio::test]
    async fn failed_batch_is_counted_and_later_batches_continue() {
        let sink = FlakySink {
            calls: AtomicUsize::new(0),
        };
        let rows: Vec<_> = (0..5).map(listing).collect();

        let report = persist_in_batches(&sink, &rows, 2).await;
        assert_eq!(report.batches, 3);
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.errors, 2);
        assert_eq!(report.persisted, 3);
        assert_eq!(report.failures[0].batch, 2);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_input_issues_no_writes() {
        let sink = FlakySink {
            calls: AtomicUsize::new(0),
        };
        let report = persist_in_batches(&sink, &[], DEFAULT_BATCH_SIZE).await;
        assert_eq!(report, PersistReport::default());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }
}
