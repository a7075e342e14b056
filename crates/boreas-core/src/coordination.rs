//! Cross-instance coordination backend.
//!
//! The circuit-breaker registry and the scrape queue are the only shared
//! mutable state in the system, so both live behind this single interface.
//! [`MemoryCoordination`] is the in-process implementation; boreas-db
//! provides a shared-store implementation with identical semantics, so a
//! second process instance observes an `open` breaker opened elsewhere and
//! queue backpressure applies across all participants. Completed results are
//! handed back to the submitting instance through the owner-keyed outcome
//! mailbox, so work dequeued by one instance is never lost to another.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::breaker::{BreakerDecision, BreakerRecord};
use crate::config::{BreakerConfig, QueueConfig};
use crate::error::AppError;
use crate::models::{CaptureMode, SortStrategy, TrendSource};
use crate::queue::BoundedPriorityQueue;

/// One scrape job on the shared queue. Serializable so distributed backends
/// can move it across instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedScrape {
    pub job_id: Uuid,
    /// Instance that submitted the job and expects its outcome.
    pub owner_id: String,
    pub source: String,
    pub query: Option<String>,
    pub limit: usize,
    pub capture_mode: CaptureMode,
    pub sort_strategy: SortStrategy,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    /// Lower dispatches first.
    pub priority: u32,
}

/// Completed (or failed) scrape handed back to the submitting instance.
/// Errors cross the wire as strings plus a retryability flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub job_id: Uuid,
    pub source: String,
    pub items: Vec<TrendSource>,
    pub error: Option<String>,
}

impl ScrapeOutcome {
    pub fn success(job: &QueuedScrape, items: Vec<TrendSource>) -> Self {
        Self {
            job_id: job.job_id,
            source: job.source.clone(),
            items,
            error: None,
        }
    }

    pub fn failure(job: &QueuedScrape, error: &AppError) -> Self {
        Self {
            job_id: job.job_id,
            source: job.source.clone(),
            items: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

/// The coordination backend contract. All core logic depends only on this
/// trait; swapping the in-process backend for the shared-store one changes
/// deployment topology, not behavior.
pub trait Coordination: Send + Sync + Clone + 'static {
    /// Breaker gate for one dispatch attempt. May perform the lazy
    /// open -> half-open transition and reserve the single probe slot.
    fn breaker_check(
        &self,
        source: &str,
    ) -> impl Future<Output = Result<BreakerDecision, AppError>> + Send;

    /// Record a dispatch outcome, driving breaker transitions. Returns true
    /// when a failure opened the circuit.
    fn breaker_record(
        &self,
        source: &str,
        success: bool,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Read-only snapshot of a source's breaker record.
    fn breaker_snapshot(
        &self,
        source: &str,
    ) -> impl Future<Output = Result<BreakerRecord, AppError>> + Send;

    /// Submit a job, blocking up to the configured backpressure timeout.
    /// Fails with [`AppError::QueueFull`] instead of growing unbounded.
    fn enqueue(&self, job: QueuedScrape) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Claim the next job by priority, waiting up to `timeout` when empty.
    fn dequeue(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<QueuedScrape>, AppError>> + Send;

    fn queue_len(&self) -> impl Future<Output = Result<usize, AppError>> + Send;

    /// Deliver a completed job's outcome to its owner's mailbox.
    fn publish_outcome(
        &self,
        outcome: ScrapeOutcome,
        owner_id: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Take the next outcome addressed to `owner_id`, waiting up to `timeout`.
    fn next_outcome(
        &self,
        owner_id: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<ScrapeOutcome>, AppError>> + Send;
}

// ---------------------------------------------------------------------------
// In-process backend
// ---------------------------------------------------------------------------

struct MemoryInner {
    // Breaker transitions are a fast, non-blocking critical section; a std
    // mutex is never held across an await point.
    breakers: Mutex<HashMap<String, BreakerRecord>>,
    breaker_config: BreakerConfig,
    queue: BoundedPriorityQueue<QueuedScrape>,
    queue_config: QueueConfig,
    outcomes: Mutex<HashMap<String, VecDeque<ScrapeOutcome>>>,
    outcome_ready: Notify,
}

/// Single-instance coordination backend.
#[derive(Clone)]
pub struct MemoryCoordination {
    inner: Arc<MemoryInner>,
}

impl MemoryCoordination {
    pub fn new(breaker_config: BreakerConfig, queue_config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                breakers: Mutex::new(HashMap::new()),
                breaker_config,
                queue: BoundedPriorityQueue::new(queue_config.capacity),
                queue_config,
                outcomes: Mutex::new(HashMap::new()),
                outcome_ready: Notify::new(),
            }),
        }
    }

    fn with_breaker<R>(&self, source: &str, f: impl FnOnce(&mut BreakerRecord) -> R) -> R {
        let mut breakers = self.inner.breakers.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned breaker mutex");
            poisoned.into_inner()
        });
        let record = breakers.entry(source.to_string()).or_default();
        f(record)
    }
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new(BreakerConfig::default(), QueueConfig::default())
    }
}

impl Coordination for MemoryCoordination {
    async fn breaker_check(&self, source: &str) -> Result<BreakerDecision, AppError> {
        let config = self.inner.breaker_config.clone();
        let decision = self.with_breaker(source, |record| record.check(Utc::now(), &config));
        if let BreakerDecision::Probe = decision {
            tracing::info!(source, "circuit half-open, dispatching probe");
        }
        Ok(decision)
    }

    async fn breaker_record(&self, source: &str, success: bool) -> Result<bool, AppError> {
        let config = self.inner.breaker_config.clone();
        let opened = self.with_breaker(source, |record| {
            if success {
                record.record_success();
                false
            } else {
                record.record_failure(Utc::now(), &config)
            }
        });
        if opened {
            tracing::warn!(source, "circuit opened after consecutive failures");
        }
        Ok(opened)
    }

    async fn breaker_snapshot(&self, source: &str) -> Result<BreakerRecord, AppError> {
        Ok(self.with_breaker(source, |record| record.clone()))
    }

    async fn enqueue(&self, job: QueuedScrape) -> Result<(), AppError> {
        let source = job.source.clone();
        let priority = job.priority;
        self.inner
            .queue
            .enqueue(job, priority, self.inner.queue_config.enqueue_timeout)
            .await
            .map_err(|_| AppError::QueueFull { source_name: source })
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<QueuedScrape>, AppError> {
        Ok(self.inner.queue.dequeue(timeout).await)
    }

    async fn queue_len(&self) -> Result<usize, AppError> {
        Ok(self.inner.queue.len())
    }

    async fn publish_outcome(&self, outcome: ScrapeOutcome, owner_id: &str) -> Result<(), AppError> {
        {
            let mut outcomes = self.inner.outcomes.lock().unwrap_or_else(|poisoned| {
                tracing::warn!("Recovered from poisoned outcome mutex");
                poisoned.into_inner()
            });
            outcomes
                .entry(owner_id.to_string())
                .or_default()
                .push_back(outcome);
        }
        self.inner.outcome_ready.notify_waiters();
        Ok(())
    }

    async fn next_outcome(
        &self,
        owner_id: &str,
        timeout: Duration,
    ) -> Result<Option<ScrapeOutcome>, AppError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut outcomes = self.inner.outcomes.lock().unwrap_or_else(|poisoned| {
                    tracing::warn!("Recovered from poisoned outcome mutex");
                    poisoned.into_inner()
                });
                if let Some(mailbox) = outcomes.get_mut(owner_id)
                    && let Some(outcome) = mailbox.pop_front()
                {
                    return Ok(Some(outcome));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(deadline, self.inner.outcome_ready.notified()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(source: &str, priority: u32) -> QueuedScrape {
        QueuedScrape {
            job_id: Uuid::new_v4(),
            owner_id: "owner-1".to_string(),
            source: source.to_string(),
            query: None,
            limit: 10,
            capture_mode: CaptureMode::Hybrid,
            sort_strategy: SortStrategy::Hybrid,
            window_start: None,
            window_end: None,
            priority,
        }
    }

    fn coordination(threshold: u32, window: Duration) -> MemoryCoordination {
        MemoryCoordination::new(
            BreakerConfig {
                failure_threshold: threshold,
                open_window: window,
            },
            QueueConfig {
                capacity: 4,
                enqueue_timeout: Duration::from_millis(50),
                dequeue_timeout: Duration::from_millis(50),
            },
        )
    }

    #[tokio::test]
    async fn test_breaker_opens_and_half_opens() {
        let coordination = coordination(2, Duration::from_millis(40));

        assert!(
            coordination
                .breaker_check("weibo")
                .await
                .unwrap()
                .permits_dispatch()
        );
        assert!(!coordination.breaker_record("weibo", false).await.unwrap());
        assert!(coordination.breaker_record("weibo", false).await.unwrap());

        assert!(matches!(
            coordination.breaker_check("weibo").await.unwrap(),
            BreakerDecision::Open { .. }
        ));
        // Other sources unaffected.
        assert_eq!(
            coordination.breaker_check("github").await.unwrap(),
            BreakerDecision::Allow
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            coordination.breaker_check("weibo").await.unwrap(),
            BreakerDecision::Probe
        );
        // Only one probe while it is in flight.
        assert!(matches!(
            coordination.breaker_check("weibo").await.unwrap(),
            BreakerDecision::Open { .. }
        ));

        coordination.breaker_record("weibo", true).await.unwrap();
        assert_eq!(
            coordination.breaker_check("weibo").await.unwrap(),
            BreakerDecision::Allow
        );
        let snapshot = coordination.breaker_snapshot("weibo").await.unwrap();
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test]
    async fn test_queue_backpressure_maps_to_queue_full() {
        let coordination = coordination(5, Duration::from_secs(60));
        for _ in 0..4 {
            coordination.enqueue(job("weibo", 100)).await.unwrap();
        }
        let err = coordination.enqueue(job("weibo", 100)).await.unwrap_err();
        assert!(matches!(err, AppError::QueueFull { source_name } if source_name == "weibo"));
        assert_eq!(coordination.queue_len().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_dequeue_respects_priority() {
        let coordination = coordination(5, Duration::from_secs(60));
        coordination.enqueue(job("slow", 100)).await.unwrap();
        coordination.enqueue(job("hot", 10)).await.unwrap();

        let first = coordination
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.source, "hot");
    }

    #[tokio::test]
    async fn test_outcome_mailbox_roundtrip() {
        let coordination = coordination(5, Duration::from_secs(60));
        let job = job("weibo", 100);
        let outcome = ScrapeOutcome::success(&job, vec![]);
        coordination
            .publish_outcome(outcome, &job.owner_id)
            .await
            .unwrap();

        let received = coordination
            .next_outcome("owner-1", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.job_id, job.job_id);
        assert!(received.error.is_none());

        // Mailboxes are per-owner.
        assert!(
            coordination
                .next_outcome("owner-2", Duration::from_millis(20))
                .await
                .unwrap()
                .is_none()
        );
    }
}
