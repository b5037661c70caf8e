//! Concurrent latest-version fetching for due items

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::WatchItem;
use crate::version::error::RegistryError;
use crate::version::registry::{Fetched, MetadataSource};

/// A due item paired with the freshness token captured before the fetch phase
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub item: WatchItem,
    pub etag: Option<String>,
}

/// Result of fetching one item
#[derive(Debug)]
pub struct FetchOutcome {
    pub item: WatchItem,
    pub url: String,
    pub result: Result<Fetched, RegistryError>,
}

/// Fetch one item, giving up as soon as the run is cancelled
async fn fetch_one(
    source: &dyn MetadataSource,
    job: FetchJob,
    cancel: &CancellationToken,
) -> FetchOutcome {
    let url = source.url_for(&job.item);
    let result = if cancel.is_cancelled() {
        Err(RegistryError::Cancelled)
    } else {
        tokio::select! {
            _ = cancel.cancelled() => Err(RegistryError::Cancelled),
            result = source.fetch_latest(&job.item, job.etag) => result,
        }
    };
    if let Err(e) = &result {
        debug!(key = %job.item.key(), "Fetch failed: {}", e);
    }
    FetchOutcome {
        item: job.item,
        url,
        result,
    }
}

/// Fetch every job with a fixed pool of `workers`.
///
/// Workers pull from a shared queue that is closed before they start, and push
/// into a result channel that closes once every worker has finished. Every job
/// yields exactly one outcome, in no particular order; after cancellation the
/// remaining jobs resolve to [`RegistryError::Cancelled`].
pub async fn fetch_all(
    source: Arc<dyn MetadataSource>,
    jobs: Vec<FetchJob>,
    workers: usize,
    cancel: CancellationToken,
) -> Vec<FetchOutcome> {
    if jobs.is_empty() {
        return Vec::new();
    }
    let total = jobs.len();

    let (job_tx, job_rx) = mpsc::channel(total);
    for job in jobs {
        // Capacity equals the job count, so this never waits
        if job_tx.send(job).await.is_err() {
            break;
        }
    }
    drop(job_tx);
    let job_rx = Arc::new(Mutex::new(job_rx));

    let (result_tx, mut result_rx) = mpsc::channel(total);
    let mut tasks = JoinSet::new();
    for worker in 0..workers.max(1) {
        let source = Arc::clone(&source);
        let job_rx = Arc::clone(&job_rx);
        let result_tx = result_tx.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            loop {
                let job = job_rx.lock().await.recv().await;
                let Some(job) = job else { break };
                let outcome = fetch_one(source.as_ref(), job, &cancel).await;
                if result_tx.send(outcome).await.is_err() {
                    break;
                }
            }
            debug!("Fetch worker {} finished", worker);
        });
    }
    drop(result_tx);

    let mut outcomes = Vec::with_capacity(total);
    while let Some(outcome) = result_rx.recv().await {
        outcomes.push(outcome);
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Fetch worker panicked: {}", e);
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackageKind;
    use crate::version::registry::{Latest, MockMetadataSource};
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn job(name: &str, etag: Option<&str>) -> FetchJob {
        FetchJob {
            item: WatchItem::new(name, PackageKind::Formula, Utc::now()),
            etag: etag.map(str::to_string),
        }
    }

    fn mock_source() -> MockMetadataSource {
        let mut source = MockMetadataSource::new();
        source
            .expect_url_for()
            .returning(|item| format!("https://api.test/formula/{}.json", item.name));
        source
    }

    #[tokio::test]
    async fn fetch_all_yields_one_outcome_per_job() {
        let mut source = mock_source();
        source.expect_fetch_latest().times(10).returning(|item, _| {
            Ok(Fetched::Modified {
                latest: Latest {
                    version: format!("{}-1.0", item.name),
                    scheme: 0,
                },
                etag: None,
            })
        });

        let jobs: Vec<_> = (0..10).map(|i| job(&format!("pkg{i}"), None)).collect();
        let outcomes = fetch_all(Arc::new(source), jobs, 4, CancellationToken::new()).await;

        assert_eq!(outcomes.len(), 10);
        let names: HashSet<_> = outcomes.iter().map(|o| o.item.name.clone()).collect();
        assert_eq!(names.len(), 10);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
    }

    #[tokio::test]
    async fn fetch_all_passes_captured_etag_and_url() {
        let mut source = mock_source();
        source
            .expect_fetch_latest()
            .withf(|item, etag| item.name == "jq" && etag.as_deref() == Some("\"e1\""))
            .times(1)
            .returning(|_, _| Ok(Fetched::NotModified));

        let outcomes = fetch_all(
            Arc::new(source),
            vec![job("jq", Some("\"e1\""))],
            4,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcomes[0].url, "https://api.test/formula/jq.json");
        assert!(matches!(outcomes[0].result, Ok(Fetched::NotModified)));
    }

    #[tokio::test]
    async fn fetch_all_keeps_errors_per_item() {
        let mut source = mock_source();
        source
            .expect_fetch_latest()
            .withf(|item, _| item.name == "broken")
            .returning(|_, _| Err(RegistryError::Status(500)));
        source
            .expect_fetch_latest()
            .withf(|item, _| item.name == "jq")
            .returning(|_, _| Ok(Fetched::NotModified));

        let outcomes = fetch_all(
            Arc::new(source),
            vec![job("broken", None), job("jq", None)],
            4,
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcomes.len(), 2);
        let broken = outcomes.iter().find(|o| o.item.name == "broken").unwrap();
        assert!(matches!(broken.result, Err(RegistryError::Status(500))));
        let jq = outcomes.iter().find(|o| o.item.name == "jq").unwrap();
        assert!(jq.result.is_ok());
    }

    #[tokio::test]
    async fn fetch_all_handles_empty_job_list() {
        let mut source = mock_source();
        source.expect_fetch_latest().times(0);

        let outcomes = fetch_all(Arc::new(source), vec![], 4, CancellationToken::new()).await;

        assert!(outcomes.is_empty());
    }

    /// Source that tracks how many fetches run at once
    struct SlowSource {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MetadataSource for SlowSource {
        fn url_for(&self, item: &WatchItem) -> String {
            item.name.clone()
        }

        async fn fetch_latest(
            &self,
            _item: &WatchItem,
            _etag: Option<String>,
        ) -> Result<Fetched, RegistryError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Fetched::NotModified)
        }
    }

    #[tokio::test]
    async fn fetch_all_never_exceeds_worker_count() {
        let source = Arc::new(SlowSource {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let jobs: Vec<_> = (0..12).map(|i| job(&format!("pkg{i}"), None)).collect();

        let outcomes = fetch_all(source.clone(), jobs, 3, CancellationToken::new()).await;

        assert_eq!(outcomes.len(), 12);
        assert!(source.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn fetch_all_resolves_every_job_after_cancellation() {
        struct Hanging;

        #[async_trait::async_trait]
        impl MetadataSource for Hanging {
            fn url_for(&self, item: &WatchItem) -> String {
                item.name.clone()
            }

            async fn fetch_latest(
                &self,
                _item: &WatchItem,
                _etag: Option<String>,
            ) -> Result<Fetched, RegistryError> {
                std::future::pending().await
            }
        }

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let jobs: Vec<_> = (0..6).map(|i| job(&format!("pkg{i}"), None)).collect();
        let outcomes = fetch_all(Arc::new(Hanging), jobs, 2, cancel).await;

        assert_eq!(outcomes.len(), 6);
        assert!(
            outcomes
                .iter()
                .all(|o| matches!(o.result, Err(RegistryError::Cancelled)))
        );
    }
}
