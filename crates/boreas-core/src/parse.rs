//! Parse router: takes scraped sources from `pending`/`delayed` to a
//! terminal parse state.
//!
//! Routing per source:
//! 1. cache check on (content_hash, schema_version) — a hit short-circuits to
//!    `completed` without invoking the parser again;
//! 2. contract validation of the parser's structured output;
//! 3. confidence routing — above threshold completes, below threshold
//!    retries in-run, then `delayed` (exponential backoff) or
//!    `manual_review` per policy;
//! 4. error classification — recoverable errors are scheduled for delayed
//!    retry, unrecoverable ones dead-letter immediately so retry storms
//!    cannot form.
//!
//! Every decision commits atomically through one `ParseStateUpdate`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::config::ParseConfig;
use crate::contract::{composite_confidence, validate_contract};
use crate::error::AppError;
use crate::models::{ParseDeadLetter, ParseStatus, TrendSource};
use crate::traits::{Parser, ParseStateUpdate, SourceStore};

/// Where one routing pass left a source.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseDisposition {
    Completed { cached: bool, confidence: f64 },
    Delayed { retry_at: DateTime<Utc> },
    ManualReview { confidence: f64 },
    DeadLettered { dlq_id: Uuid },
    /// Already terminal, or nothing to do.
    Skipped,
}

/// Tallies for one `parse_pending` batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseCounters {
    pub processed: u64,
    pub completed: u64,
    pub cached: u64,
    pub delayed: u64,
    pub manual_review: u64,
    pub dead_lettered: u64,
    pub skipped: u64,
}

#[derive(Clone)]
struct CachedParse {
    payload: serde_json::Value,
    confidence: f64,
}

pub struct ParseRouter<S: SourceStore> {
    store: S,
    parser: Arc<dyn Parser>,
    config: ParseConfig,
    cache: moka::future::Cache<(String, String), CachedParse>,
}

impl<S: SourceStore> ParseRouter<S> {
    pub fn new(store: S, parser: Arc<dyn Parser>, config: ParseConfig) -> Self {
        let cache = moka::future::Cache::new(config.cache_capacity.max(1));
        Self {
            store,
            parser,
            config,
            cache,
        }
    }

    /// Route every due source (pending, or delayed with an elapsed retry
    /// time), up to the configured batch size.
    pub async fn parse_pending(&self) -> Result<ParseCounters, AppError> {
        let due = self
            .store
            .list_sources_for_parsing(
                &[ParseStatus::Pending, ParseStatus::Delayed],
                Utc::now(),
                self.config.batch_size,
            )
            .await?;

        let mut counters = ParseCounters::default();
        for source in &due {
            counters.processed += 1;
            match self.parse_source(source, false).await {
                Ok(ParseDisposition::Completed { cached, .. }) => {
                    counters.completed += 1;
                    if cached {
                        counters.cached += 1;
                    }
                }
                Ok(ParseDisposition::Delayed { .. }) => counters.delayed += 1,
                Ok(ParseDisposition::ManualReview { .. }) => counters.manual_review += 1,
                Ok(ParseDisposition::DeadLettered { .. }) => counters.dead_lettered += 1,
                Ok(ParseDisposition::Skipped) => counters.skipped += 1,
                Err(e) => {
                    tracing::error!(source_row_id = %source.id, error = %e, "parse routing failed");
                }
            }
        }
        Ok(counters)
    }

    pub async fn parse_source_by_id(
        &self,
        source_row_id: Uuid,
        force: bool,
    ) -> Result<ParseDisposition, AppError> {
        let source = self
            .store
            .get_source(source_row_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("source row {source_row_id}")))?;
        self.parse_source(&source, force).await
    }

    /// Run steps 1–4 for one source. `force` bypasses the terminal-state
    /// short-circuit and the cache (used by DLQ replay).
    pub async fn parse_source(
        &self,
        source: &TrendSource,
        force: bool,
    ) -> Result<ParseDisposition, AppError> {
        let schema_version = self.config.schema_version.clone();
        let attempts_done = source.parse_attempts;

        if source.parse_status == ParseStatus::Completed && !force {
            return Ok(ParseDisposition::Skipped);
        }

        // Step 1: content-hash cache.
        if self.config.cache_enabled && !source.content_hash.is_empty() && !force {
            let key = (source.content_hash.clone(), schema_version.clone());
            if let Some(cached) = self.cache.get(&key).await
                && cached.confidence >= self.config.low_confidence_threshold
            {
                self.commit_completed(source, cached.payload.clone(), cached.confidence, attempts_done)
                    .await?;
                tracing::debug!(source_row_id = %source.id, "parse cache hit");
                return Ok(ParseDisposition::Completed {
                    cached: true,
                    confidence: cached.confidence,
                });
            }
        }

        let per_run_attempts = self.config.max_attempts_per_run.max(1);
        let low_conf_retry = self.config.low_confidence_retry_attempts;

        for run_attempt in 1..=per_run_attempts {
            let total_attempts = attempts_done + run_attempt;

            // Steps 2–3: invoke, validate, score.
            let attempt = async {
                let raw = self.parser.parse(source).await?;
                let contract = validate_contract(&raw, &schema_version)?;
                Ok::<_, AppError>(contract)
            }
            .await;

            match attempt {
                Ok(contract) => {
                    let confidence = composite_confidence(&contract);
                    let mut payload = serde_json::to_value(&contract)?;
                    payload["_meta"] = json!({
                        "schema_version": schema_version,
                        "confidence": confidence,
                        "parsed_at": Utc::now().to_rfc3339(),
                    });

                    if confidence < self.config.low_confidence_threshold {
                        let can_retry_in_run = run_attempt <= low_conf_retry
                            && total_attempts < self.config.manual_review_after_attempts;
                        if can_retry_in_run && run_attempt < per_run_attempts {
                            tracing::debug!(
                                source_row_id = %source.id,
                                confidence,
                                "low confidence, retrying in-run"
                            );
                            continue;
                        }
                        return self
                            .commit_low_confidence(source, payload, confidence, total_attempts)
                            .await;
                    }

                    self.commit_completed(source, payload.clone(), confidence, total_attempts)
                        .await?;
                    if self.config.cache_enabled && !source.content_hash.is_empty() {
                        self.cache
                            .insert(
                                (source.content_hash.clone(), schema_version.clone()),
                                CachedParse {
                                    payload,
                                    confidence,
                                },
                            )
                            .await;
                    }
                    return Ok(ParseDisposition::Completed {
                        cached: false,
                        confidence,
                    });
                }
                // Step 4: classify and route the failure.
                Err(error) => {
                    let recoverable = error.is_recoverable_parse();
                    if recoverable
                        && run_attempt < per_run_attempts
                        && total_attempts < self.config.recoverable_max_attempts
                    {
                        tracing::debug!(
                            source_row_id = %source.id,
                            error = %error,
                            "recoverable parse error, retrying in-run"
                        );
                        continue;
                    }
                    return self.commit_failure(source, &error, total_attempts).await;
                }
            }
        }

        // Unreachable: the loop always returns on its final attempt.
        Ok(ParseDisposition::Skipped)
    }

    /// Reconstruct a dead letter's source context and re-run routing.
    /// Replaying an unknown id reports `NotFound`.
    pub async fn replay_dead_letter(&self, dlq_id: Uuid) -> Result<ParseDisposition, AppError> {
        let letter = self
            .store
            .get_dead_letter(dlq_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("dead letter {dlq_id}")))?;

        let Some(source) = self.store.get_source(letter.source_row_id).await? else {
            tracing::warn!(dlq_id = %dlq_id, "dead letter source row no longer exists");
            self.store
                .mark_dead_letter_replayed(dlq_id, Utc::now())
                .await?;
            return Ok(ParseDisposition::Skipped);
        };

        let disposition = self.parse_source(&source, true).await?;
        self.store
            .mark_dead_letter_replayed(dlq_id, Utc::now())
            .await?;
        Ok(disposition)
    }

    async fn commit_completed(
        &self,
        source: &TrendSource,
        payload: serde_json::Value,
        confidence: f64,
        attempts: u32,
    ) -> Result<(), AppError> {
        self.store
            .update_parse_state(&ParseStateUpdate {
                source_row_id: source.id,
                status: ParseStatus::Completed,
                payload: Some(payload),
                schema_version: self.config.schema_version.clone(),
                confidence,
                attempts,
                error_kind: None,
                last_error: None,
                retry_at: None,
                parsed_at: Some(Utc::now()),
            })
            .await
    }

    async fn commit_low_confidence(
        &self,
        source: &TrendSource,
        payload: serde_json::Value,
        confidence: f64,
        attempts: u32,
    ) -> Result<ParseDisposition, AppError> {
        let manual = attempts >= self.config.manual_review_after_attempts;
        let (status, retry_at) = if manual {
            (ParseStatus::ManualReview, None)
        } else {
            (ParseStatus::Delayed, Some(self.next_retry_at(attempts)))
        };

        self.store
            .update_parse_state(&ParseStateUpdate {
                source_row_id: source.id,
                status,
                payload: Some(payload),
                schema_version: self.config.schema_version.clone(),
                confidence,
                attempts,
                error_kind: Some("low_confidence".to_string()),
                last_error: Some(format!(
                    "confidence={confidence:.4} below threshold={:.4}",
                    self.config.low_confidence_threshold
                )),
                retry_at,
                parsed_at: None,
            })
            .await?;

        Ok(if manual {
            ParseDisposition::ManualReview { confidence }
        } else {
            ParseDisposition::Delayed {
                retry_at: retry_at.unwrap_or_else(Utc::now),
            }
        })
    }

    async fn commit_failure(
        &self,
        source: &TrendSource,
        error: &AppError,
        attempts: u32,
    ) -> Result<ParseDisposition, AppError> {
        let recoverable = error.is_recoverable_parse();
        let kind = if recoverable {
            "recoverable"
        } else {
            "unrecoverable"
        };

        if recoverable && attempts < self.config.recoverable_max_attempts {
            let retry_at = self.next_retry_at(attempts);
            self.store
                .update_parse_state(&ParseStateUpdate {
                    source_row_id: source.id,
                    status: ParseStatus::Delayed,
                    payload: None,
                    schema_version: self.config.schema_version.clone(),
                    confidence: source.parse_confidence,
                    attempts,
                    error_kind: Some(kind.to_string()),
                    last_error: Some(format!("{}:{error}", error.parse_error_code())),
                    retry_at: Some(retry_at),
                    parsed_at: None,
                })
                .await?;
            return Ok(ParseDisposition::Delayed { retry_at });
        }

        // Retries exhausted or unrecoverable: dead-letter in the same commit
        // as the status change.
        let letter = ParseDeadLetter {
            id: Uuid::new_v4(),
            source_row_id: source.id,
            source_platform: source.source_platform.clone(),
            source_id: source.source_id.clone(),
            content_hash: source.content_hash.clone(),
            schema_version: self.config.schema_version.clone(),
            error_kind: kind.to_string(),
            error_code: error.parse_error_code(),
            error_message: error.to_string(),
            retryable: recoverable,
            attempts,
            payload_snapshot: serde_json::to_value(source)?,
            created_at: Utc::now(),
            replayed_at: None,
        };
        let update = ParseStateUpdate {
            source_row_id: source.id,
            status: ParseStatus::Failed,
            payload: None,
            schema_version: self.config.schema_version.clone(),
            confidence: source.parse_confidence,
            attempts,
            error_kind: Some(kind.to_string()),
            last_error: Some(format!("{}:{error}", error.parse_error_code())),
            retry_at: None,
            parsed_at: None,
        };
        let dlq_id = self.store.dead_letter(&letter, &update).await?;
        tracing::warn!(
            source_row_id = %source.id,
            dlq_id = %dlq_id,
            error = %error,
            "parse failure dead-lettered"
        );
        Ok(ParseDisposition::DeadLettered { dlq_id })
    }

    fn next_retry_at(&self, attempts: u32) -> DateTime<Utc> {
        let base = self.config.retry_base_delay.max(Duration::from_secs(1));
        let exponent = attempts.saturating_sub(1).min(16);
        let delay = base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.config.retry_max_delay);
        Utc::now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::seconds(60))
    }
}

/// Deterministic parser used when no model-backed parser is wired: summarizes
/// from the source's own text and scores itself by output richness.
#[derive(Debug, Clone, Default)]
pub struct HeuristicParser;

#[async_trait::async_trait]
impl Parser for HeuristicParser {
    async fn parse(&self, source: &TrendSource) -> Result<serde_json::Value, AppError> {
        let title = source.title.trim();
        let description = source.description.trim();
        let text = format!("{title}\n{description}");
        if text.trim().is_empty() {
            return Err(AppError::UnrecoverableParse {
                code: "empty_text".to_string(),
                message: "empty source text".to_string(),
            });
        }

        let summary: String = if description.is_empty() {
            title.chars().take(300).collect()
        } else {
            description.chars().take(300).collect()
        };

        let mut key_points: Vec<String> = description
            .split(['.', '!', '?', '\n', '。', '！', '？'])
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .take(4)
            .map(str::to_string)
            .collect();
        if key_points.is_empty() {
            key_points.push(title.to_string());
        }

        let mut keywords: Vec<String> = Vec::new();
        for tag in &source.hashtags {
            let token = tag.trim_matches(['#', ' ']).to_string();
            if !token.is_empty() && !keywords.contains(&token) {
                keywords.push(token);
            }
        }
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if keywords.len() >= 10 {
                break;
            }
            let token = word.to_lowercase();
            if token.len() >= 3 && !keywords.contains(&token) {
                keywords.push(token);
            }
        }
        if keywords.is_empty() {
            keywords.push(source.source_platform.clone());
        }

        let mut confidence: f64 = 0.45;
        if summary.chars().count() >= 40 {
            confidence += 0.20;
        }
        if key_points.len() >= 2 {
            confidence += 0.15;
        }
        if keywords.len() >= 3 {
            confidence += 0.12;
        }
        if title.chars().count() >= 8 {
            confidence += 0.10;
        }

        Ok(json!({
            "schema_version": crate::contract::PARSE_SCHEMA_VERSION_V1,
            "source_platform": source.source_platform,
            "source_id": source.source_id,
            "title": if title.is_empty() { "untitled" } else { title },
            "summary": if summary.is_empty() { "n/a".to_string() } else { summary },
            "key_points": key_points,
            "keywords": keywords,
            "sentiment": "neutral",
            "language": source.language,
            "confidence_model": confidence.min(0.95),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySourceStore;
    use crate::testutil::MockParser;

    fn source_with_text(title: &str, description: &str) -> TrendSource {
        let mut source = TrendSource::new("github", "rust-lang/rust");
        source.title = title.to_string();
        source.description = description.to_string();
        source.language = "en".to_string();
        source.content_hash = crate::dedup::content_hash(&format!("{title}{description}"));
        source
    }

    fn rich_source() -> TrendSource {
        source_with_text(
            "Rust 1.90 released with faster incremental builds",
            "The new release brings dramatically faster incremental builds. \
             Diagnostics got clearer. The borrow checker got friendlier. \
             Cargo resolves workspaces more quickly.",
        )
    }

    fn good_payload(source: &TrendSource) -> serde_json::Value {
        json!({
            "schema_version": "v1",
            "source_platform": source.source_platform,
            "source_id": source.source_id,
            "title": "Rust 1.90 released",
            "summary": "A release with much faster incremental builds and clearer diagnostics for everyday development workflows across the ecosystem.",
            "key_points": ["faster builds", "clearer diagnostics", "friendlier borrow checker"],
            "keywords": ["rust", "release", "compiler", "cargo"],
            "sentiment": "positive",
            "language": "en",
            "confidence_model": 0.92
        })
    }

    fn router(
        store: MemorySourceStore,
        parser: MockParser,
        config: ParseConfig,
    ) -> ParseRouter<MemorySourceStore> {
        ParseRouter::new(store, Arc::new(parser), config)
    }

    #[tokio::test]
    async fn test_valid_output_completes() {
        let store = MemorySourceStore::new();
        let source = rich_source();
        store.upsert_source(&source).await.unwrap();
        let parser = MockParser::with_responses(vec![Ok(good_payload(&source))]);
        let router = router(store.clone(), parser, ParseConfig::default());

        let disposition = router.parse_source(&source, false).await.unwrap();
        assert!(matches!(
            disposition,
            ParseDisposition::Completed { cached: false, .. }
        ));

        let stored = store.get_source(source.id).await.unwrap().unwrap();
        assert_eq!(stored.parse_status, ParseStatus::Completed);
        assert_eq!(stored.parse_attempts, 1);
        assert!(stored.parse_payload.is_some());
        assert!(stored.parsed_at.is_some());
    }

    #[tokio::test]
    async fn test_cache_prevents_second_parser_invocation() {
        let store = MemorySourceStore::new();
        let source_a = rich_source();
        let mut source_b = rich_source();
        source_b.id = Uuid::new_v4();
        source_b.source_id = "rust-lang/cargo".to_string();
        // Same content hash + schema version => cache hit.
        source_b.content_hash = source_a.content_hash.clone();
        store.upsert_source(&source_a).await.unwrap();
        store.upsert_source(&source_b).await.unwrap();

        let parser = MockParser::with_responses(vec![Ok(good_payload(&source_a))]);
        let calls = parser.calls.clone();
        let router = router(store.clone(), parser, ParseConfig::default());

        let first = router.parse_source(&source_a, false).await.unwrap();
        assert!(matches!(first, ParseDisposition::Completed { cached: false, .. }));

        let second = router.parse_source(&source_b, false).await.unwrap();
        assert!(matches!(second, ParseDisposition::Completed { cached: true, .. }));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_contract_violation_dead_letters_without_retry() {
        let store = MemorySourceStore::new();
        let source = rich_source();
        store.upsert_source(&source).await.unwrap();

        // Missing required fields — unrecoverable, must not retry.
        let parser = MockParser::with_responses(vec![
            Ok(json!({"schema_version": "v1"})),
            Ok(good_payload(&source)),
        ]);
        let calls = parser.calls.clone();
        let router = router(store.clone(), parser, ParseConfig::default());

        let disposition = router.parse_source(&source, false).await.unwrap();
        assert!(matches!(disposition, ParseDisposition::DeadLettered { .. }));
        assert_eq!(*calls.lock().unwrap(), 1, "unrecoverable errors must not retry");

        let stored = store.get_source(source.id).await.unwrap().unwrap();
        assert_eq!(stored.parse_status, ParseStatus::Failed);
        let letters = store.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error_kind, "unrecoverable");
        assert_eq!(letters[0].error_code, "contract_validation");
    }

    #[tokio::test]
    async fn test_recoverable_error_delays_with_backoff() {
        let store = MemorySourceStore::new();
        let source = rich_source();
        store.upsert_source(&source).await.unwrap();

        let config = ParseConfig {
            max_attempts_per_run: 1,
            recoverable_max_attempts: 5,
            ..ParseConfig::default()
        };
        let parser = MockParser::with_responses(vec![Err(AppError::RecoverableParse {
            code: "llm_retryable".into(),
            message: "overloaded".into(),
        })]);
        let router = router(store.clone(), parser, config);

        let disposition = router.parse_source(&source, false).await.unwrap();
        let ParseDisposition::Delayed { retry_at } = disposition else {
            panic!("expected Delayed, got {disposition:?}");
        };
        assert!(retry_at > Utc::now());

        let stored = store.get_source(source.id).await.unwrap().unwrap();
        assert_eq!(stored.parse_status, ParseStatus::Delayed);
        assert_eq!(stored.parse_attempts, 1);
        assert!(stored.parse_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_recoverable_exhaustion_dead_letters() {
        let store = MemorySourceStore::new();
        let mut source = rich_source();
        source.parse_attempts = 4; // one short of recoverable_max_attempts
        store.upsert_source(&source).await.unwrap();

        let config = ParseConfig {
            max_attempts_per_run: 1,
            recoverable_max_attempts: 5,
            ..ParseConfig::default()
        };
        let parser = MockParser::with_responses(vec![Err(AppError::RecoverableParse {
            code: "llm_retryable".into(),
            message: "still overloaded".into(),
        })]);
        let router = router(store.clone(), parser, config);

        let disposition = router.parse_source(&source, false).await.unwrap();
        assert!(matches!(disposition, ParseDisposition::DeadLettered { .. }));
        let letters = store.list_dead_letters(10).await.unwrap();
        assert_eq!(letters[0].error_kind, "recoverable");
        assert_eq!(letters[0].attempts, 5);
    }

    #[tokio::test]
    async fn test_low_confidence_routes_to_manual_review_after_policy() {
        let store = MemorySourceStore::new();
        let mut source = rich_source();
        source.parse_attempts = 3;
        store.upsert_source(&source).await.unwrap();

        let mut payload = good_payload(&source);
        payload["confidence_model"] = json!(0.05);
        payload["summary"] = json!("thin");
        payload["key_points"] = json!(["only one"]);
        payload["keywords"] = json!(["kw"]);

        let config = ParseConfig {
            max_attempts_per_run: 1,
            low_confidence_retry_attempts: 0,
            manual_review_after_attempts: 4,
            ..ParseConfig::default()
        };
        let parser = MockParser::with_responses(vec![Ok(payload)]);
        let router = router(store.clone(), parser, config);

        let disposition = router.parse_source(&source, false).await.unwrap();
        assert!(matches!(disposition, ParseDisposition::ManualReview { .. }));
        let stored = store.get_source(source.id).await.unwrap().unwrap();
        assert_eq!(stored.parse_status, ParseStatus::ManualReview);
        assert_eq!(stored.parse_error_kind.as_deref(), Some("low_confidence"));
    }

    #[tokio::test]
    async fn test_completed_source_is_skipped_without_force() {
        let store = MemorySourceStore::new();
        let mut source = rich_source();
        source.parse_status = ParseStatus::Completed;
        store.upsert_source(&source).await.unwrap();

        let parser = MockParser::with_responses(vec![Ok(good_payload(&source))]);
        let calls = parser.calls.clone();
        let router = router(store.clone(), parser, ParseConfig::default());

        let disposition = router.parse_source(&source, false).await.unwrap();
        assert_eq!(disposition, ParseDisposition::Skipped);
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_transitions_source_to_completed() {
        let store = MemorySourceStore::new();
        let source = rich_source();
        store.upsert_source(&source).await.unwrap();

        // First pass fails unrecoverably and dead-letters.
        let parser = MockParser::with_responses(vec![
            Err(AppError::UnrecoverableParse {
                code: "llm_unrecoverable".into(),
                message: "bad prompt".into(),
            }),
            Ok(good_payload(&source)),
        ]);
        let router = router(store.clone(), parser, ParseConfig::default());

        let ParseDisposition::DeadLettered { dlq_id } =
            router.parse_source(&source, false).await.unwrap()
        else {
            panic!("expected dead letter");
        };

        // Replay now succeeds and marks the letter replayed.
        let disposition = router.replay_dead_letter(dlq_id).await.unwrap();
        assert!(matches!(disposition, ParseDisposition::Completed { .. }));

        let stored = store.get_source(source.id).await.unwrap().unwrap();
        assert_eq!(stored.parse_status, ParseStatus::Completed);
        let letter = store.get_dead_letter(dlq_id).await.unwrap().unwrap();
        assert!(letter.replayed_at.is_some());
    }

    #[tokio::test]
    async fn test_replay_unknown_id_is_not_found() {
        let store = MemorySourceStore::new();
        let parser = MockParser::with_responses(vec![]);
        let router = router(store, parser, ParseConfig::default());

        let err = router.replay_dead_letter(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_parse_pending_tallies() {
        let store = MemorySourceStore::new();
        let good = rich_source();
        let mut bad = rich_source();
        bad.id = Uuid::new_v4();
        bad.source_id = "other/repo".to_string();
        bad.content_hash = "different".to_string();
        store.upsert_source(&good).await.unwrap();
        store.upsert_source(&bad).await.unwrap();

        let parser = MockParser::with_keyed_responses(vec![
            (good.id, Ok(good_payload(&good))),
            (
                bad.id,
                Err(AppError::UnrecoverableParse {
                    code: "empty_text".into(),
                    message: "empty".into(),
                }),
            ),
        ]);
        let router = router(store.clone(), parser, ParseConfig::default());

        let counters = router.parse_pending().await.unwrap();
        assert_eq!(counters.processed, 2);
        assert_eq!(counters.completed, 1);
        assert_eq!(counters.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_heuristic_parser_produces_contract_valid_output() {
        let source = rich_source();
        let raw = HeuristicParser.parse(&source).await.unwrap();
        let contract = validate_contract(&raw, "v1").unwrap();
        assert!(!contract.key_points.is_empty());
        assert!(!contract.keywords.is_empty());
        assert!(contract.confidence_model > 0.5);
    }

    #[tokio::test]
    async fn test_heuristic_parser_rejects_empty_source() {
        let source = TrendSource::new("weibo", "1");
        let err = HeuristicParser.parse(&source).await.unwrap_err();
        assert!(matches!(err, AppError::UnrecoverableParse { .. }));
    }
}
