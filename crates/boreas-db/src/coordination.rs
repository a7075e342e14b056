//! Shared-store coordination backend.
//!
//! Breaker state and the scrape queue live in PostgreSQL so every process
//! instance observes the same circuit decisions and the same backpressure
//! limits. Transitions reuse the exact state machine from
//! `boreas_core::breaker` inside row-locked transactions, so semantics are
//! identical to the in-process backend; a state change made by one instance
//! is visible to the others within one poll interval (bounded propagation
//! delay, no strict linearizability required). Completed results are handed
//! off through the `scrape_outcomes` mailbox table, claimed with
//! `FOR UPDATE SKIP LOCKED` so no outcome is lost or double-delivered.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use boreas_core::breaker::{BreakerDecision, BreakerRecord, CircuitState};
use boreas_core::config::{BreakerConfig, QueueConfig};
use boreas_core::coordination::{Coordination, QueuedScrape, ScrapeOutcome};
use boreas_core::error::AppError;

/// How often blocked enqueue/dequeue/outcome waits re-poll the store.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct PgCoordination {
    pool: Pool<Postgres>,
    breaker: BreakerConfig,
    queue: QueueConfig,
}

impl PgCoordination {
    pub fn new(pool: PgPool, breaker: BreakerConfig, queue: QueueConfig) -> Self {
        Self {
            pool,
            breaker,
            queue,
        }
    }

    /// Load the breaker row under a row lock, apply `f` to the record, and
    /// persist the result in the same transaction.
    async fn with_breaker_row<R>(
        &self,
        source: &str,
        f: impl FnOnce(&mut BreakerRecord) -> R,
    ) -> Result<R, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("INSERT INTO breaker_states (source) VALUES ($1) ON CONFLICT (source) DO NOTHING")
            .bind(source)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let row: (String, i32, Option<DateTime<Utc>>, Option<DateTime<Utc>>) = sqlx::query_as(
            "SELECT state, failure_count, opened_at, half_open_probe_at \
             FROM breaker_states WHERE source = $1 FOR UPDATE",
        )
        .bind(source)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut record = BreakerRecord {
            state: row.0.parse().unwrap_or(CircuitState::Closed),
            failure_count: row.1.max(0) as u32,
            opened_at: row.2,
            half_open_probe_at: row.3,
        };
        let result = f(&mut record);

        sqlx::query(
            "UPDATE breaker_states \
             SET state = $2, failure_count = $3, opened_at = $4, \
                 half_open_probe_at = $5, updated_at = NOW() \
             WHERE source = $1",
        )
        .bind(source)
        .bind(record.state.as_str())
        .bind(record.failure_count as i32)
        .bind(record.opened_at)
        .bind(record.half_open_probe_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(result)
    }
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

impl Coordination for PgCoordination {
    async fn breaker_check(&self, source: &str) -> Result<BreakerDecision, AppError> {
        let config = self.breaker.clone();
        self.with_breaker_row(source, |record| record.check(Utc::now(), &config))
            .await
    }

    async fn breaker_record(&self, source: &str, success: bool) -> Result<bool, AppError> {
        let config = self.breaker.clone();
        let opened = self
            .with_breaker_row(source, |record| {
                if success {
                    record.record_success();
                    false
                } else {
                    record.record_failure(Utc::now(), &config)
                }
            })
            .await?;
        if opened {
            tracing::warn!(source, "circuit opened (shared store)");
        }
        Ok(opened)
    }

    async fn breaker_snapshot(&self, source: &str) -> Result<BreakerRecord, AppError> {
        let row: Option<(String, i32, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> =
            sqlx::query_as(
                "SELECT state, failure_count, opened_at, half_open_probe_at \
                 FROM breaker_states WHERE source = $1",
            )
            .bind(source)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(match row {
            Some(row) => BreakerRecord {
                state: row.0.parse().unwrap_or(CircuitState::Closed),
                failure_count: row.1.max(0) as u32,
                opened_at: row.2,
                half_open_probe_at: row.3,
            },
            None => BreakerRecord::new(),
        })
    }

    async fn enqueue(&self, job: QueuedScrape) -> Result<(), AppError> {
        let deadline = tokio::time::Instant::now() + self.queue.enqueue_timeout;
        loop {
            // Capacity check and insert in one statement; a full queue
            // inserts nothing.
            let inserted: Option<i64> = sqlx::query_scalar(
                r#"
                INSERT INTO scrape_queue (priority, payload)
                SELECT $1, $2
                WHERE (SELECT COUNT(*) FROM scrape_queue) < $3
                RETURNING seq
                "#,
            )
            .bind(job.priority as i32)
            .bind(Json(&job))
            .bind(self.queue.capacity as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if inserted.is_some() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::QueueFull {
                    source_name: job.source.clone(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<QueuedScrape>, AppError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let claimed: Option<Json<QueuedScrape>> = sqlx::query_scalar(
                r#"
                DELETE FROM scrape_queue
                WHERE seq = (
                    SELECT seq FROM scrape_queue
                    ORDER BY priority ASC, seq ASC
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                RETURNING payload
                "#,
            )
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some(Json(job)) = claimed {
                return Ok(Some(job));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
        }
    }

    async fn queue_len(&self) -> Result<usize, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scrape_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count.max(0) as usize)
    }

    async fn publish_outcome(&self, outcome: ScrapeOutcome, owner_id: &str) -> Result<(), AppError> {
        sqlx::query("INSERT INTO scrape_outcomes (id, owner_id, payload) VALUES ($1, $2, $3)")
            .bind(Uuid::new_v4())
            .bind(owner_id)
            .bind(Json(&outcome))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn next_outcome(
        &self,
        owner_id: &str,
        timeout: Duration,
    ) -> Result<Option<ScrapeOutcome>, AppError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let claimed: Option<Json<ScrapeOutcome>> = sqlx::query_scalar(
                r#"
                DELETE FROM scrape_outcomes
                WHERE id = (
                    SELECT id FROM scrape_outcomes
                    WHERE owner_id = $1
                    ORDER BY created_at ASC, id ASC
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
                )
                RETURNING payload
                "#,
            )
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some(Json(outcome)) = claimed {
                return Ok(Some(outcome));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
        }
    }
}
