//! Bounded concurrent page collection with first-arrival-wins deduplication.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dealflow_adapters::{PageFetchError, PageFetcher};
use dealflow_core::RawListing;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    pub page: u32,
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct CollectOutcome {
    pub listings: Vec<RawListing>,
    pub pages_total: usize,
    pub pages_failed: usize,
    pub duplicates_dropped: usize,
    pub failures: Vec<PageFailure>,
}

/// Fetches pages `1..=max_pages` over at most `workers` concurrent tasks.
///
/// Workers never touch shared state: each sends its page result over a
/// channel and the single aggregator loop in `collect` owns the dedup set.
pub struct ConcurrentCollector {
    fetcher: Arc<dyn PageFetcher>,
    workers: usize,
    page_timeout: Option<Duration>,
}

impl ConcurrentCollector {
    pub fn new(fetcher: Arc<dyn PageFetcher>, workers: usize) -> Self {
        Self {
            fetcher,
            workers: workers.max(1),
            page_timeout: None,
        }
    }

    pub fn with_page_timeout(mut self, timeout: Duration) -> Self {
        self.page_timeout = Some(timeout);
        self
    }

    pub async fn collect(&self, max_pages: u32, token: &str) -> CollectOutcome {
        let mut outcome = CollectOutcome {
            pages_total: max_pages as usize,
            ..CollectOutcome::default()
        };
        if max_pages == 0 {
            return outcome;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Result<Vec<RawListing>, PageFetchError>>();
        let limit = Arc::new(Semaphore::new(self.workers));
        let fetcher = Arc::clone(&self.fetcher);
        let token: Arc<str> = Arc::from(token);
        let page_timeout = self.page_timeout;

        // Pages are dispatched in order; a page only starts once a permit is free.
        let dispatcher = tokio::spawn(async move {
            for page in 1..=max_pages {
                let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                    break;
                };
                let fetcher = Arc::clone(&fetcher);
                let token = Arc::clone(&token);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = match page_timeout {
                        Some(after) => {
                            match tokio::time::timeout(after, fetcher.fetch_page(page, &token)).await {
                                Ok(result) => result,
                                Err(_) => Err(PageFetchError::Timeout { page, after }),
                            }
                        }
                        None => fetcher.fetch_page(page, &token).await,
                    };
                    let _ = tx.send(result);
                    drop(permit);
                });
            }
        });

        let mut seen = HashSet::new();
        let mut reported = 0usize;
        while let Some(result) = rx.recv().await {
            reported += 1;
            match result {
                Ok(listings) => {
                    for raw in listings {
                        if seen.insert(raw.identity()) {
                            outcome.listings.push(raw);
                        } else {
                            outcome.duplicates_dropped += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(page = err.page(), status = ?err.status(), error = %err, "page fetch failed; counting it as empty");
                    outcome.failures.push(PageFailure {
                        page: err.page(),
                        status: err.status(),
                        message: err.to_string(),
                    });
                }
            }
        }

        if let Err(err) = dispatcher.await {
            warn!(error = %err, "page dispatcher stopped early");
        }

        // A worker that panicked never reported; its page counts as failed.
        let unreported = outcome.pages_total.saturating_sub(reported);
        outcome.pages_failed = outcome.failures.len() + unreported;
        debug!(
            pages = outcome.pages_total,
            failed = outcome.pages_failed,
            unique = outcome.listings.len(),
            duplicates = outcome.duplicates_dropped,
            "collection finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dealflow_storage::FetchError;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn raw(stub: &str, header: &str, marker: &str) -> RawListing {
        RawListing::new(json!({"urlStub": stub, "header": header, "description": marker}))
    }

    struct PagedFetcher {
        pages: HashMap<u32, Vec<RawListing>>,
        failing: Vec<u32>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl PagedFetcher {
        fn new(pages: HashMap<u32, Vec<RawListing>>) -> Self {
            Self {
                pages,
                failing: Vec::new(),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl PageFetcher for PagedFetcher {
        async fn fetch_page(&self, page: u32, token: &str) -> Result<Vec<RawListing>, PageFetchError> {
            assert_eq!(token, "tok");
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.contains(&page) {
                return Err(PageFetchError::Http {
                    page,
                    source: FetchError::HttpStatus {
                        status: 503,
                        url: "https://api.example.com".into(),
                    },
                });
            }
            Ok(self.pages.get(&page).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn duplicate_identity_keeps_first_observed() {
        let pages = HashMap::from([
            (1, vec![raw("/a", "Maid Co", "page-1"), raw("/b", "Janitor", "page-1")]),
            (2, vec![raw("/a", "Maid Co", "page-2"), raw("/c", "Carpet", "page-2")]),
        ]);
        let collector = ConcurrentCollector::new(Arc::new(PagedFetcher::new(pages)), 1);

        let outcome = collector.collect(3, "tok").await;
        assert_eq!(outcome.listings.len(), 3);
        assert_eq!(outcome.duplicates_dropped, 1);
        assert_eq!(outcome.pages_total, 3);
        assert_eq!(outcome.pages_failed, 0);

        let maid = outcome
            .listings
            .iter()
            .find(|l| l.str_field("urlStub") == Some("/a"))
            .expect("maid listing");
        assert_eq!(maid.str_field("description"), Some("page-1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn identical_pages_collapse_under_any_interleaving() {
        let page: Vec<_> = (0..20).map(|i| raw(&format!("/{i}"), "Same", "x")).collect();
        let pages = (1..=10).map(|p| (p, page.clone())).collect();
        let collector = ConcurrentCollector::new(Arc::new(PagedFetcher::new(pages)), 8);

        let outcome = collector.collect(10, "tok").await;
        assert_eq!(outcome.listings.len(), 20);
        assert_eq!(outcome.duplicates_dropped, 180);
    }

    #[tokio::test]
    async fn failed_pages_count_as_empty_and_do_not_abort() {
        let pages = HashMap::from([
            (1, vec![raw("/a", "A", "")]),
            (2, vec![raw("/b", "B", "")]),
            (3, vec![raw("/c", "C", "")]),
        ]);
        let mut fetcher = PagedFetcher::new(pages);
        fetcher.failing = vec![2];
        let collector = ConcurrentCollector::new(Arc::new(fetcher), 2);

        let outcome = collector.collect(3, "tok").await;
        assert_eq!(outcome.listings.len(), 2);
        assert_eq!(outcome.pages_failed, 1);
        assert_eq!(
            outcome.failures,
            vec![PageFailure {
                page: 2,
                status: Some(503),
                message: "page 2: http status 503 for https://api.example.com".into(),
            }]
        );
    }

    #[tokio::test]
    async fn worker_count_bounds_concurrency() {
        let mut fetcher = PagedFetcher::new(HashMap::new());
        fetcher.delay = Duration::from_millis(20);
        let fetcher = Arc::new(fetcher);
        let collector = ConcurrentCollector::new(fetcher.clone(), 3);

        let outcome = collector.collect(12, "tok").await;
        assert!(outcome.listings.is_empty());
        assert_eq!(outcome.pages_failed, 0);
        let peak = fetcher.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak} exceeded the worker bound");
        assert!(peak >= 2);
    }

    #[tokio::test]
    async fn slow_pages_time_out() {
        let mut fetcher = PagedFetcher::new(HashMap::from([(1, vec![raw("/a", "A", "")])]));
        fetcher.delay = Duration::from_millis(200);
        let collector = ConcurrentCollector::new(Arc::new(fetcher), 2)
            .with_page_timeout(Duration::from_millis(10));

        let outcome = collector.collect(2, "tok").await;
        assert!(outcome.listings.is_empty());
        assert_eq!(outcome.pages_failed, 2);
        assert!(outcome.failures.iter().all(|f| f.status.is_none()));
    }

    #[tokio::test]
    async fn zero_pages_returns_immediately() {
        let collector = ConcurrentCollector::new(Arc::new(PagedFetcher::new(HashMap::new())), 4);
        let outcome = collector.collect(0, "tok").await;
        assert_eq!(outcome.pages_total, 0);
        assert!(outcome.listings.is_empty());
    }
}
