//! Trait seams between the pipeline core and its collaborators.
//!
//! Capability traits (`SourceAdapter`, `Publisher`, `VideoProvider`,
//! `Generator`, `Parser`, `Categorizer`) are object-safe and registered in
//! platform-keyed registries — the core never branches on platform identity
//! itself. Store traits are generic parameters in the worker/stage structs
//! and use the `impl Future` style throughout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::draft::{ContentDraft, DraftVersion};
use crate::error::AppError;
use crate::models::{
    CaptureMode, IngestKey, ParseDeadLetter, ParseStatus, ScraperState, SortStrategy, TrendSource,
};
use crate::run::{PipelineRun, ScheduleSpec};

// ---------------------------------------------------------------------------
// Scraping
// ---------------------------------------------------------------------------

/// Parameters for one incremental poll of a platform.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub query: Option<String>,
    pub limit: usize,
    pub capture_mode: CaptureMode,
    pub sort_strategy: SortStrategy,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self {
            query: None,
            limit: 50,
            capture_mode: CaptureMode::default(),
            sort_strategy: SortStrategy::default(),
            window_start: None,
            window_end: None,
        }
    }
}

/// Result of one incremental poll.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Upstream reported nothing changed since (cursor, etag).
    NotModified,
    /// Fresh items plus the new incremental state to persist.
    Batch {
        items: Vec<TrendSource>,
        cursor: Option<DateTime<Utc>>,
        etag: Option<String>,
    },
}

/// One platform's scraper. Implementations own all platform-specific wire
/// handling; the coordinator only sees this contract.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn platform(&self) -> &str;

    /// Poll for items newer than `cursor`, passing `etag` for conditional
    /// requests where the platform supports them.
    async fn fetch_since(
        &self,
        request: &FetchRequest,
        cursor: Option<DateTime<Utc>>,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, AppError>;
}

/// Platform-name-keyed adapter registry.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters
            .insert(adapter.platform().to_lowercase(), adapter);
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&platform.to_lowercase()).cloned()
    }

    pub fn platforms(&self) -> Vec<String> {
        let mut names: Vec<_> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Confirmation returned by a platform publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub platform_post_id: String,
    pub platform_url: Option<String>,
}

/// One platform's publisher. Best-effort: the pipeline retries a bounded
/// number of times and records the outcome, nothing guarantees exactly-once.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn platform(&self) -> &str;

    async fn publish(&self, draft: &ContentDraft) -> Result<PublishReceipt, AppError>;
}

#[derive(Default, Clone)]
pub struct PublisherRegistry {
    publishers: HashMap<String, Arc<dyn Publisher>>,
}

impl PublisherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, publisher: Arc<dyn Publisher>) {
        self.publishers
            .insert(publisher.platform().to_lowercase(), publisher);
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn Publisher>> {
        self.publishers.get(&platform.to_lowercase()).cloned()
    }
}

// ---------------------------------------------------------------------------
// Video generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoStatus {
    Pending,
    Processing,
    Completed { url: String },
    Failed { reason: String },
}

/// AIGC video provider: submit a job, then poll it.
#[async_trait]
pub trait VideoProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Submit a generation job. Returns the provider's job id.
    async fn submit(&self, prompt: &str) -> Result<String, AppError>;

    async fn poll(&self, job_id: &str) -> Result<VideoStatus, AppError>;
}

// ---------------------------------------------------------------------------
// Text generation & parsing
// ---------------------------------------------------------------------------

/// A single text-generation backend (one model on one API).
#[async_trait]
pub trait Generator: Send + Sync {
    fn backend(&self) -> &str;

    fn model(&self) -> &str;

    /// Generate a completion under an explicit per-call time budget.
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        budget: Duration,
    ) -> Result<String, AppError>;
}

/// Produces raw structured output for one source; the parse router validates
/// it against the versioned contract afterwards.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse(&self, source: &TrendSource) -> Result<serde_json::Value, AppError>;
}

/// Scores reported by a model-backed secondary review of generated text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityScores {
    pub quality: f64,
    pub compliance: f64,
    pub repetition: f64,
}

/// Optional second opinion on a draft. The generation stage blends these
/// scores conservatively with its own rule-based evaluation; a scorer
/// failure degrades to rule-based scoring, never fails the draft.
#[async_trait]
pub trait QualityScorer: Send + Sync {
    async fn score(&self, text: &str) -> Result<QualityScores, AppError>;
}

/// Assigns a category to a scraped source.
#[async_trait]
pub trait Categorizer: Send + Sync {
    async fn categorize(&self, source: &TrendSource) -> Result<Category, AppError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub category: String,
    pub confidence: f64,
    pub tags: Vec<String>,
}

/// Keyword-rule categorizer used when no model-backed categorizer is wired.
#[derive(Debug, Clone, Default)]
pub struct KeywordCategorizer {
    /// (category, trigger keywords); first match wins.
    rules: Vec<(String, Vec<String>)>,
    fallback: String,
}

impl KeywordCategorizer {
    pub fn new(rules: Vec<(String, Vec<String>)>, fallback: impl Into<String>) -> Self {
        Self {
            rules,
            fallback: fallback.into(),
        }
    }
}

#[async_trait]
impl Categorizer for KeywordCategorizer {
    async fn categorize(&self, source: &TrendSource) -> Result<Category, AppError> {
        let text = format!("{} {}", source.title, source.description).to_lowercase();
        for (category, keywords) in &self.rules {
            if let Some(hit) = keywords.iter().find(|k| text.contains(&k.to_lowercase())) {
                return Ok(Category {
                    category: category.clone(),
                    confidence: 0.6,
                    tags: vec![hit.clone()],
                });
            }
        }
        Ok(Category {
            category: if self.fallback.is_empty() {
                "other".to_string()
            } else {
                self.fallback.clone()
            },
            confidence: 0.3,
            tags: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Atomic commit of one parse-router decision. Status and attempt counters
/// must land together: a crash between scoring and persistence must never
/// leave an inconsistent (parse_status, parse_attempts) pair.
#[derive(Debug, Clone)]
pub struct ParseStateUpdate {
    pub source_row_id: Uuid,
    pub status: ParseStatus,
    pub payload: Option<serde_json::Value>,
    pub schema_version: String,
    pub confidence: f64,
    pub attempts: u32,
    pub error_kind: Option<String>,
    pub last_error: Option<String>,
    pub retry_at: Option<DateTime<Utc>>,
    pub parsed_at: Option<DateTime<Utc>>,
}

/// Persistence for sources, the idempotency ledger, scraper cursor state and
/// the parse dead-letter queue.
pub trait SourceStore: Send + Sync + Clone {
    /// Whether the ingest triple is already in the ledger.
    fn ingest_recorded(
        &self,
        key: &IngestKey,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Append the triple to the ledger. Inserting an existing key is a no-op.
    fn record_ingest(&self, key: &IngestKey) -> impl Future<Output = Result<(), AppError>> + Send;

    fn upsert_source(
        &self,
        source: &TrendSource,
    ) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    fn get_source(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<TrendSource>, AppError>> + Send;

    fn list_sources_for_parsing(
        &self,
        statuses: &[ParseStatus],
        due_before: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<TrendSource>, AppError>> + Send;

    fn update_parse_state(
        &self,
        update: &ParseStateUpdate,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Dead-letter the source and commit the matching parse-state update in
    /// one transaction.
    fn dead_letter(
        &self,
        letter: &ParseDeadLetter,
        update: &ParseStateUpdate,
    ) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    fn get_dead_letter(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<ParseDeadLetter>, AppError>> + Send;

    fn list_dead_letters(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ParseDeadLetter>, AppError>> + Send;

    fn mark_dead_letter_replayed(
        &self,
        id: Uuid,
        replayed_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_scraper_state(
        &self,
        platform: &str,
        channel: &str,
    ) -> impl Future<Output = Result<Option<ScraperState>, AppError>> + Send;

    fn upsert_scraper_state(
        &self,
        state: &ScraperState,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Persistence for drafts and their immutable version history.
pub trait DraftStore: Send + Sync + Clone {
    fn save_draft(&self, draft: &ContentDraft)
    -> impl Future<Output = Result<Uuid, AppError>> + Send;

    fn update_draft(
        &self,
        draft: &ContentDraft,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_draft(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<ContentDraft>, AppError>> + Send;

    /// Append a version snapshot, assigning the next monotonic version_no.
    /// Returns the assigned number.
    fn append_version(
        &self,
        version: &DraftVersion,
    ) -> impl Future<Output = Result<u32, AppError>> + Send;

    fn get_version(
        &self,
        draft_id: Uuid,
        version_no: u32,
    ) -> impl Future<Output = Result<Option<DraftVersion>, AppError>> + Send;

    fn list_versions(
        &self,
        draft_id: Uuid,
    ) -> impl Future<Output = Result<Vec<DraftVersion>, AppError>> + Send;

    /// Most recent accepted bodies for a platform, newest first. Reference
    /// set for repetition scoring.
    fn recent_bodies(
        &self,
        platform: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;
}

/// Persistence for pipeline runs and scrape schedules.
pub trait RunStore: Send + Sync + Clone {
    fn create_run(&self, run: &PipelineRun) -> impl Future<Output = Result<(), AppError>> + Send;

    fn update_run(&self, run: &PipelineRun) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_run(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<PipelineRun>, AppError>> + Send;

    fn list_schedules(&self) -> impl Future<Output = Result<Vec<ScheduleSpec>, AppError>> + Send;

    fn save_schedule(
        &self,
        schedule: &ScheduleSpec,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_schedule(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<ScheduleSpec>, AppError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_case_insensitive() {
        struct Nop;
        #[async_trait]
        impl SourceAdapter for Nop {
            fn platform(&self) -> &str {
                "GitHub"
            }
            async fn fetch_since(
                &self,
                _request: &FetchRequest,
                _cursor: Option<DateTime<Utc>>,
                _etag: Option<&str>,
            ) -> Result<FetchOutcome, AppError> {
                Ok(FetchOutcome::NotModified)
            }
        }

        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(Nop));
        assert!(registry.get("github").is_some());
        assert!(registry.get("GITHUB").is_some());
        assert!(registry.get("weibo").is_none());
        assert_eq!(registry.platforms(), vec!["github".to_string()]);
    }

    #[tokio::test]
    async fn test_keyword_categorizer() {
        let categorizer = KeywordCategorizer::new(
            vec![
                ("tech".into(), vec!["rust".into(), "compiler".into()]),
                ("finance".into(), vec!["market".into()]),
            ],
            "other",
        );

        let mut source = TrendSource::new("github", "1");
        source.title = "Rust compiler speedups".into();
        let category = categorizer.categorize(&source).await.unwrap();
        assert_eq!(category.category, "tech");

        let plain = TrendSource::new("weibo", "2");
        let category = categorizer.categorize(&plain).await.unwrap();
        assert_eq!(category.category, "other");
    }
}
