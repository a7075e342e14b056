//! Distributed scrape coordinator.
//!
//! Dispatches a pool of workers against the shared bounded queue, applying
//! per-source circuit breaking, rate limiting, and bounded exponential
//! backoff on the way out, and cursor/ETag filtering, dedup, heat scoring,
//! and idempotent ingestion on the way back in. Worker shutdown is
//! cooperative via `CancellationToken`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::breaker::BreakerDecision;
use crate::config::{PipelineSettings, ScrapeConfig};
use crate::coordination::{Coordination, QueuedScrape, ScrapeOutcome};
use crate::dedup::{DedupSet, content_hash};
use crate::error::AppError;
use crate::heat::HeatScorer;
use crate::models::{CaptureMode, ScraperState, TrendSource};
use crate::run::RunConfig;
use crate::traits::{AdapterRegistry, FetchOutcome, FetchRequest, SourceStore};

/// Per-source request pacing: enforces the configured RPS as a minimum
/// interval between calls, independent of how many workers are running.
#[derive(Clone)]
struct RateGate {
    last_call: Arc<tokio::sync::Mutex<HashMap<String, Instant>>>,
    rps: Arc<HashMap<String, f64>>,
}

impl RateGate {
    fn new(rps: HashMap<String, f64>) -> Self {
        Self {
            last_call: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            rps: Arc::new(rps),
        }
    }

    async fn wait(&self, source: &str) {
        let Some(rate) = self.rps.get(&source.to_lowercase()).copied() else {
            return;
        };
        if rate <= 0.0 {
            return;
        }
        let min_interval = Duration::from_secs_f64(1.0 / rate);

        let mut map = self.last_call.lock().await;
        if let Some(&last) = map.get(source) {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                let sleep_for = min_interval - elapsed;
                // Drop the lock while sleeping so other sources aren't blocked.
                drop(map);
                tracing::debug!(source, sleep_ms = sleep_for.as_millis() as u64, "rate limiting");
                tokio::time::sleep(sleep_for).await;
                let mut map = self.last_call.lock().await;
                map.insert(source.to_string(), Instant::now());
                return;
            }
        }
        map.insert(source.to_string(), Instant::now());
    }
}

/// Outcome counters for one `scrape` call.
#[derive(Debug, Clone, Default)]
pub struct ScrapeReport {
    /// Items returned by adapters before any filtering.
    pub raw_count: usize,
    /// Dropped as intra-batch near/exact duplicates.
    pub deduplicated: usize,
    /// Dropped because the ingest triple was already in the ledger.
    pub duplicate_triples: usize,
    /// New rows written.
    pub ingested: usize,
    /// (source, error) pairs for jobs that failed or could not be submitted.
    pub failures: Vec<(String, String)>,
}

/// A scored, deduplicated, ingested scrape result.
#[derive(Debug, Clone, Default)]
pub struct ScrapeBatch {
    pub items: Vec<TrendSource>,
    pub report: ScrapeReport,
}

pub struct ScrapeCoordinator<C: Coordination, S: SourceStore> {
    coordination: C,
    store: S,
    adapters: AdapterRegistry,
    heat: HeatScorer,
    config: ScrapeConfig,
    dequeue_timeout: Duration,
    rate: RateGate,
    instance_id: String,
}

impl<C: Coordination, S: SourceStore> Clone for ScrapeCoordinator<C, S> {
    fn clone(&self) -> Self {
        Self {
            coordination: self.coordination.clone(),
            store: self.store.clone(),
            adapters: self.adapters.clone(),
            heat: self.heat.clone(),
            config: self.config.clone(),
            dequeue_timeout: self.dequeue_timeout,
            rate: self.rate.clone(),
            instance_id: self.instance_id.clone(),
        }
    }
}

impl<C, S> ScrapeCoordinator<C, S>
where
    C: Coordination,
    S: SourceStore + 'static,
{
    pub fn new(
        coordination: C,
        store: S,
        adapters: AdapterRegistry,
        settings: &PipelineSettings,
    ) -> Self {
        Self {
            coordination,
            store,
            adapters,
            heat: HeatScorer::new(settings.heat.clone()),
            config: settings.scrape.clone(),
            dequeue_timeout: settings.queue.dequeue_timeout,
            rate: RateGate::new(settings.scrape.source_rps.clone()),
            instance_id: format!("instance-{}", &Uuid::new_v4().simple().to_string()[..8]),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Spawn the worker pool. Workers drain the shared queue until the token
    /// is cancelled; pool size bounds platform-request concurrency.
    pub fn spawn_workers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.worker_count.max(1))
            .map(|index| {
                let worker = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker = index, "scrape worker started");
                    worker.worker_loop(cancel).await;
                    tracing::debug!(worker = index, "scrape worker stopped");
                })
            })
            .collect()
    }

    async fn worker_loop(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let job = tokio::select! {
                job = self.coordination.dequeue(self.dequeue_timeout) => job,
                () = cancel.cancelled() => break,
            };
            match job {
                Ok(Some(job)) => {
                    let outcome = match self.execute_job(&job).await {
                        Ok(items) => ScrapeOutcome::success(&job, items),
                        Err(error) => {
                            tracing::warn!(
                                source = %job.source,
                                job_id = %job.job_id,
                                error = %error,
                                "scrape job failed"
                            );
                            ScrapeOutcome::failure(&job, &error)
                        }
                    };
                    if let Err(error) = self
                        .coordination
                        .publish_outcome(outcome, &job.owner_id)
                        .await
                    {
                        tracing::error!(error = %error, "failed to hand off scrape outcome");
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::error!(error = %error, "queue poll failed");
                    tokio::select! {
                        () = tokio::time::sleep(self.dequeue_timeout) => {}
                        () = cancel.cancelled() => break,
                    }
                }
            }
        }
    }

    /// One job: breaker gate, rate gate, incremental fetch, bounded retries.
    async fn execute_job(&self, job: &QueuedScrape) -> Result<Vec<TrendSource>, AppError> {
        let adapter = self
            .adapters
            .get(&job.source)
            .ok_or_else(|| AppError::NotFound(format!("source adapter '{}'", job.source)))?;

        let request = FetchRequest {
            query: job.query.clone(),
            limit: job.limit,
            capture_mode: job.capture_mode,
            sort_strategy: job.sort_strategy,
            window_start: job.window_start,
            window_end: job.window_end,
        };
        let channel = job.query.clone().unwrap_or_else(|| "default".to_string());
        let max_attempts = self.config.retry_max_attempts.max(1);

        for attempt in 0..max_attempts {
            let decision = self.coordination.breaker_check(&job.source).await?;
            if let BreakerDecision::Open { retry_after } = decision {
                // Deferred, not dropped: the failure propagates back to the
                // submitter, which sees CircuitOpen and leaves the source for
                // a later poll.
                return Err(AppError::CircuitOpen {
                    source_name: job.source.clone(),
                    retry_after,
                });
            }

            self.rate.wait(&job.source).await;

            let state = self
                .store
                .get_scraper_state(&job.source, &channel)
                .await?
                .unwrap_or_else(|| ScraperState::empty(&job.source, &channel));

            match adapter
                .fetch_since(&request, state.cursor, state.etag.as_deref())
                .await
            {
                Ok(FetchOutcome::NotModified) => {
                    self.coordination.breaker_record(&job.source, true).await?;
                    tracing::debug!(source = %job.source, "not modified since last poll");
                    return Ok(Vec::new());
                }
                Ok(FetchOutcome::Batch {
                    items,
                    cursor,
                    etag,
                }) => {
                    self.coordination.breaker_record(&job.source, true).await?;
                    let new_state = ScraperState {
                        platform: job.source.clone(),
                        channel: channel.clone(),
                        cursor: cursor.or(state.cursor),
                        etag: etag.or(state.etag),
                        updated_at: chrono::Utc::now(),
                    };
                    self.store.upsert_scraper_state(&new_state).await?;
                    return Ok(items);
                }
                Err(error) => {
                    // A reserved probe must be released whatever the error;
                    // otherwise only upstream-health failures count.
                    if error.should_trip_circuit() || decision == BreakerDecision::Probe {
                        self.coordination.breaker_record(&job.source, false).await?;
                    }
                    if attempt + 1 >= max_attempts {
                        return Err(error);
                    }
                    let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt);
                    tracing::debug!(
                        source = %job.source,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "scrape attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        unreachable!("retry loop returns on its final attempt")
    }

    /// Submit one job per requested source, collect the handed-off outcomes,
    /// then filter, score, rank, and idempotently ingest the batch.
    pub async fn scrape(
        &self,
        run: &RunConfig,
        run_id: Option<Uuid>,
    ) -> Result<ScrapeBatch, AppError> {
        let sources = if run.sources.is_empty() {
            self.adapters.platforms()
        } else {
            run.sources.clone()
        };

        let mut report = ScrapeReport::default();
        let mut expected = 0usize;

        for source in &sources {
            if self.adapters.get(source).is_none() {
                report
                    .failures
                    .push((source.clone(), "unknown source adapter".to_string()));
                continue;
            }
            let job = QueuedScrape {
                job_id: Uuid::new_v4(),
                owner_id: self.instance_id.clone(),
                source: source.clone(),
                query: run.query.clone(),
                limit: run.max_items,
                capture_mode: run.capture_mode,
                sort_strategy: run.sort_strategy,
                window_start: run.window_start,
                window_end: run.window_end,
                priority: self.resolve_priority(source, run.capture_mode),
            };
            match self.coordination.enqueue(job).await {
                Ok(()) => expected += 1,
                Err(error) => {
                    tracing::warn!(source = %source, error = %error, "job submission rejected");
                    report.failures.push((source.clone(), error.to_string()));
                }
            }
        }

        let mut raw: Vec<TrendSource> = Vec::new();
        let deadline = Instant::now() + self.config.collect_timeout;
        for _ in 0..expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self
                .coordination
                .next_outcome(&self.instance_id, remaining)
                .await?
            {
                Some(outcome) => match outcome.error {
                    None => raw.extend(outcome.items),
                    Some(error) => report.failures.push((outcome.source, error)),
                },
                None => {
                    tracing::error!("timed out collecting scrape outcomes");
                    report
                        .failures
                        .push(("collect".to_string(), "outcome collection timed out".to_string()));
                    break;
                }
            }
        }
        report.raw_count = raw.len();

        // Time-window filter.
        if matches!(run.capture_mode, CaptureMode::ByTime | CaptureMode::Hybrid)
            && (run.window_start.is_some() || run.window_end.is_some())
        {
            raw.retain(|item| {
                let reference = item.published_at.unwrap_or(item.scraped_at);
                run.window_start.is_none_or(|start| reference >= start)
                    && run.window_end.is_none_or(|end| reference <= end)
            });
        }

        // Intra-batch dedup on content + media.
        let mut dedup = DedupSet::default();
        let mut unique: Vec<TrendSource> = Vec::new();
        for mut item in raw {
            let key_text = format!("{}\n{}", item.dedup_text(), item.media_urls.join("\n"));
            if dedup.check_and_add(&key_text) {
                report.deduplicated += 1;
                continue;
            }
            if item.content_hash.is_empty() {
                item.content_hash = content_hash(&item.dedup_text());
            }
            unique.push(item);
        }

        // Rank and truncate.
        self.heat.score_batch(&mut unique);
        let strategy = run.sort_strategy.effective(run.capture_mode);
        self.heat.sort_items(&mut unique, strategy);
        unique.truncate(run.max_items.max(1));

        // Idempotent ingest: the ledger gates every write, so re-ingesting an
        // unchanged triple is a silent no-op.
        let mut ingested: Vec<TrendSource> = Vec::new();
        for mut item in unique {
            item.capture_mode = run.capture_mode;
            item.sort_strategy = run.sort_strategy;
            item.pipeline_run_id = run_id;

            let key = item.ingest_key();
            if self.store.ingest_recorded(&key).await? {
                report.duplicate_triples += 1;
                continue;
            }
            let row_id = self.store.upsert_source(&item).await?;
            item.id = row_id;
            self.store.record_ingest(&key).await?;
            report.ingested += 1;
            ingested.push(item);
        }

        tracing::info!(
            raw = report.raw_count,
            ingested = report.ingested,
            duplicates = report.duplicate_triples,
            deduplicated = report.deduplicated,
            failures = report.failures.len(),
            "scrape batch complete"
        );
        Ok(ScrapeBatch {
            items: ingested,
            report,
        })
    }

    fn resolve_priority(&self, source: &str, capture_mode: CaptureMode) -> u32 {
        let base = self
            .config
            .source_priorities
            .get(&source.to_lowercase())
            .copied()
            .unwrap_or(self.config.default_priority);
        // Hot captures jump the line a little.
        if capture_mode == CaptureMode::ByHot {
            base.saturating_sub(10)
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, QueueConfig};
    use crate::coordination::MemoryCoordination;
    use crate::memory::MemorySourceStore;
    use crate::testutil::MockAdapter;

    fn settings(threshold: u32, open_window: Duration) -> PipelineSettings {
        PipelineSettings {
            breaker: BreakerConfig {
                failure_threshold: threshold,
                open_window,
            },
            queue: QueueConfig {
                capacity: 16,
                enqueue_timeout: Duration::from_millis(100),
                dequeue_timeout: Duration::from_millis(50),
            },
            scrape: ScrapeConfig {
                worker_count: 2,
                retry_max_attempts: 1,
                retry_base_delay: Duration::from_millis(10),
                collect_timeout: Duration::from_secs(5),
                ..ScrapeConfig::default()
            },
            ..PipelineSettings::default()
        }
    }

    fn coordinator(
        adapter: MockAdapter,
        settings: &PipelineSettings,
    ) -> (
        ScrapeCoordinator<MemoryCoordination, MemorySourceStore>,
        MemorySourceStore,
    ) {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(adapter));
        let store = MemorySourceStore::new();
        let coordination =
            MemoryCoordination::new(settings.breaker.clone(), settings.queue.clone());
        (
            ScrapeCoordinator::new(coordination, store.clone(), registry, settings),
            store,
        )
    }

    fn run_config(source: &str) -> RunConfig {
        RunConfig {
            sources: vec![source.to_string()],
            max_items: 50,
            ..RunConfig::default()
        }
    }

    #[tokio::test]
    async fn test_scrape_ingests_items() {
        let adapter = MockAdapter::new("weibo").with_items(vec![
            MockAdapter::item("weibo", "post-1", "hot topic one", 100.0),
            MockAdapter::item("weibo", "post-2", "hot topic two entirely different subject", 50.0),
        ]);
        let settings = settings(5, Duration::from_secs(60));
        let (coordinator, store) = coordinator(adapter, &settings);

        let cancel = CancellationToken::new();
        let workers = coordinator.spawn_workers(cancel.clone());

        let batch = coordinator.scrape(&run_config("weibo"), None).await.unwrap();
        assert_eq!(batch.report.raw_count, 2);
        assert_eq!(batch.report.ingested, 2);
        assert_eq!(store.source_count(), 2);
        assert!(batch.items.iter().all(|i| i.normalized_heat_score >= 0.0));

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_reingesting_same_triple_is_noop() {
        let items = vec![MockAdapter::item("weibo", "post-1", "stable content", 10.0)];
        let adapter = MockAdapter::new("weibo")
            .with_items(items.clone())
            .with_items(items);
        let settings = settings(5, Duration::from_secs(60));
        let (coordinator, store) = coordinator(adapter, &settings);

        let cancel = CancellationToken::new();
        let workers = coordinator.spawn_workers(cancel.clone());

        let first = coordinator.scrape(&run_config("weibo"), None).await.unwrap();
        assert_eq!(first.report.ingested, 1);

        let second = coordinator.scrape(&run_config("weibo"), None).await.unwrap();
        assert_eq!(second.report.ingested, 0);
        assert_eq!(second.report.duplicate_triples, 1);
        assert_eq!(store.source_count(), 1, "exactly one row for the triple");

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast_then_probes() {
        // Threshold 3, short window. The adapter always errors.
        let adapter = MockAdapter::new("weibo").always_failing();
        let calls = adapter.calls.clone();
        let settings = settings(3, Duration::from_millis(150));
        let (coordinator, _store) = coordinator(adapter, &settings);

        let cancel = CancellationToken::new();
        let workers = coordinator.spawn_workers(cancel.clone());

        // Three failing scrapes open the circuit.
        for _ in 0..3 {
            let batch = coordinator.scrape(&run_config("weibo"), None).await.unwrap();
            assert_eq!(batch.report.failures.len(), 1);
        }
        assert_eq!(*calls.lock().unwrap(), 3);

        // Fourth job fails fast with CircuitOpen — no adapter call.
        let batch = coordinator.scrape(&run_config("weibo"), None).await.unwrap();
        assert!(batch.report.failures[0].1.contains("circuit open"));
        assert_eq!(*calls.lock().unwrap(), 3, "open circuit must not reach the adapter");

        // After the window elapses exactly one probe is dispatched.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = coordinator.scrape(&run_config("weibo"), None).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), 4);

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_not_modified_short_circuits_with_persisted_etag() {
        let adapter = MockAdapter::new("github")
            .with_batch(
                vec![MockAdapter::item("github", "r1", "trending repo readme text", 5.0)],
                None,
                Some("etag-v1".to_string()),
            )
            .not_modified_when_etag("etag-v1");
        let seen_etags = adapter.seen_etags.clone();
        let settings = settings(5, Duration::from_secs(60));
        let (coordinator, store) = coordinator(adapter, &settings);

        let cancel = CancellationToken::new();
        let workers = coordinator.spawn_workers(cancel.clone());

        let first = coordinator.scrape(&run_config("github"), None).await.unwrap();
        assert_eq!(first.report.ingested, 1);
        let state = store
            .get_scraper_state("github", "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.etag.as_deref(), Some("etag-v1"));

        let second = coordinator.scrape(&run_config("github"), None).await.unwrap();
        assert_eq!(second.report.raw_count, 0);
        assert!(second.report.failures.is_empty(), "NotModified is not an error");
        assert_eq!(
            seen_etags.lock().unwrap().last().map(String::as_str),
            Some("etag-v1"),
            "second poll must present the persisted etag"
        );

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_duplicate_content_deduplicated_within_batch() {
        // Same text scraped under two platform-native ids.
        let adapter = MockAdapter::new("weibo").with_items(vec![
            MockAdapter::item(
                "weibo",
                "a",
                "major platform outage affects millions of users this morning",
                10.0,
            ),
            MockAdapter::item(
                "weibo",
                "b",
                "major platform outage affects millions of users this morning",
                9.0,
            ),
        ]);
        let settings = settings(5, Duration::from_secs(60));
        let (coordinator, _store) = coordinator(adapter, &settings);

        let cancel = CancellationToken::new();
        let workers = coordinator.spawn_workers(cancel.clone());

        let batch = coordinator.scrape(&run_config("weibo"), None).await.unwrap();
        assert_eq!(batch.report.deduplicated, 1);
        assert_eq!(batch.report.ingested, 1);

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_queue_backpressure_reports_queue_full() {
        let adapter = MockAdapter::new("weibo").with_items(vec![]);
        let mut settings = settings(5, Duration::from_secs(60));
        settings.queue.capacity = 1;
        settings.queue.enqueue_timeout = Duration::from_millis(30);
        let (coordinator, _store) = coordinator(adapter, &settings);

        // No workers running: the queue stays full after the first job.
        let pre_fill = QueuedScrape {
            job_id: Uuid::new_v4(),
            owner_id: "someone-else".to_string(),
            source: "weibo".to_string(),
            query: None,
            limit: 1,
            capture_mode: CaptureMode::Hybrid,
            sort_strategy: crate::models::SortStrategy::Hybrid,
            window_start: None,
            window_end: None,
            priority: 1,
        };
        coordinator.coordination.enqueue(pre_fill).await.unwrap();

        let batch = coordinator.scrape(&run_config("weibo"), None).await.unwrap();
        assert_eq!(batch.report.failures.len(), 1);
        assert!(batch.report.failures[0].1.contains("queue full"));
    }

    #[tokio::test]
    async fn test_per_source_rate_limit_spans_workers() {
        let adapter = MockAdapter::new("weibo").with_items(vec![]).endless_empty();
        let call_times = adapter.call_times.clone();
        let mut settings = settings(5, Duration::from_secs(60));
        settings.scrape.worker_count = 4;
        settings
            .scrape
            .source_rps
            .insert("weibo".to_string(), 10.0); // 100ms min interval
        let (coordinator, _store) = coordinator(adapter, &settings);

        let cancel = CancellationToken::new();
        let workers = coordinator.spawn_workers(cancel.clone());

        // Two concurrent jobs for the same source.
        let run = run_config("weibo");
        let (a, b) = tokio::join!(
            coordinator.scrape(&run, None),
            coordinator.scrape(&run, None)
        );
        a.unwrap();
        b.unwrap();

        let times = call_times.lock().unwrap();
        assert_eq!(times.len(), 2);
        let gap = if times[1] > times[0] {
            times[1] - times[0]
        } else {
            times[0] - times[1]
        };
        assert!(
            gap >= Duration::from_millis(90),
            "rate limit must pace calls across workers, gap was {gap:?}"
        );

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }
}
