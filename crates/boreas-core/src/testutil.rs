//! Test utilities: mock implementations of the capability traits.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks use
//! `Arc<Mutex<_>>` for interior mutability, allowing assertions on recorded
//! calls. Store backends live in [`crate::memory`]; these cover the external
//! collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::draft::ContentDraft;
use crate::error::AppError;
use crate::models::TrendSource;
use crate::traits::{
    FetchOutcome, FetchRequest, Generator, Parser, PublishReceipt, Publisher, QualityScorer,
    QualityScores, SourceAdapter, VideoProvider, VideoStatus,
};

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// Mock source adapter with a queue of fetch outcomes and call recording.
pub struct MockAdapter {
    platform: String,
    responses: Arc<Mutex<VecDeque<Result<FetchOutcome, AppError>>>>,
    not_modified_etag: Option<String>,
    always_fail: bool,
    endless_empty: bool,
    pub calls: Arc<Mutex<usize>>,
    pub seen_etags: Arc<Mutex<Vec<String>>>,
    pub seen_cursors: Arc<Mutex<Vec<Option<DateTime<Utc>>>>>,
    pub call_times: Arc<Mutex<Vec<Duration>>>,
    created: Instant,
}

impl MockAdapter {
    pub fn new(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            not_modified_etag: None,
            always_fail: false,
            endless_empty: false,
            calls: Arc::new(Mutex::new(0)),
            seen_etags: Arc::new(Mutex::new(Vec::new())),
            seen_cursors: Arc::new(Mutex::new(Vec::new())),
            call_times: Arc::new(Mutex::new(Vec::new())),
            created: Instant::now(),
        }
    }

    /// Queue one successful batch with no incremental state.
    pub fn with_items(self, items: Vec<TrendSource>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(FetchOutcome::Batch {
                items,
                cursor: None,
                etag: None,
            }));
        self
    }

    /// Queue one successful batch with explicit cursor/etag.
    pub fn with_batch(
        self,
        items: Vec<TrendSource>,
        cursor: Option<DateTime<Utc>>,
        etag: Option<String>,
    ) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(FetchOutcome::Batch {
                items,
                cursor,
                etag,
            }));
        self
    }

    /// Every call fails with a network error.
    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Calls presenting this etag short-circuit to `NotModified`.
    pub fn not_modified_when_etag(mut self, etag: &str) -> Self {
        self.not_modified_etag = Some(etag.to_string());
        self
    }

    /// Once the response queue is drained, keep returning empty batches.
    pub fn endless_empty(mut self) -> Self {
        self.endless_empty = true;
        self
    }

    /// Build a minimal trend item for tests.
    pub fn item(platform: &str, id: &str, title: &str, engagement: f64) -> TrendSource {
        let mut source = TrendSource::new(platform, id);
        source.title = title.to_string();
        source.description = format!("{title}. More detail in the original post.");
        source.engagement_score = engagement;
        source.published_at = Some(Utc::now() - TimeDelta::minutes(30));
        source
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_since(
        &self,
        _request: &FetchRequest,
        cursor: Option<DateTime<Utc>>,
        etag: Option<&str>,
    ) -> Result<FetchOutcome, AppError> {
        *self.calls.lock().unwrap() += 1;
        self.call_times.lock().unwrap().push(self.created.elapsed());
        self.seen_cursors.lock().unwrap().push(cursor);
        if let Some(etag) = etag {
            self.seen_etags.lock().unwrap().push(etag.to_string());
        }

        if self.always_fail {
            return Err(AppError::NetworkError("connection reset".to_string()));
        }
        if let (Some(expected), Some(presented)) = (&self.not_modified_etag, etag)
            && expected == presented
        {
            return Ok(FetchOutcome::NotModified);
        }

        let queued = self.responses.lock().unwrap().pop_front();
        match queued {
            Some(response) => response,
            None if self.endless_empty => Ok(FetchOutcome::Batch {
                items: Vec::new(),
                cursor: None,
                etag: None,
            }),
            None => Err(AppError::Generic("mock adapter exhausted".to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// MockParser
// ---------------------------------------------------------------------------

/// Mock parser with either a FIFO response queue or per-source responses.
pub struct MockParser {
    responses: Arc<Mutex<VecDeque<Result<serde_json::Value, AppError>>>>,
    keyed: Arc<Mutex<HashMap<Uuid, Result<serde_json::Value, AppError>>>>,
    pub calls: Arc<Mutex<usize>>,
}

impl MockParser {
    pub fn with_responses(responses: Vec<Result<serde_json::Value, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            keyed: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_keyed_responses(
        responses: Vec<(Uuid, Result<serde_json::Value, AppError>)>,
    ) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            keyed: Arc::new(Mutex::new(responses.into_iter().collect())),
            calls: Arc::new(Mutex::new(0)),
        }
    }
}

#[async_trait]
impl Parser for MockParser {
    async fn parse(&self, source: &TrendSource) -> Result<serde_json::Value, AppError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(response) = self.keyed.lock().unwrap().remove(&source.id) {
            return response;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(AppError::UnrecoverableParse {
                    code: "mock_exhausted".to_string(),
                    message: "no queued response".to_string(),
                })
            })
    }
}

// ---------------------------------------------------------------------------
// MockGenerator
// ---------------------------------------------------------------------------

/// Mock text generator: queued responses, optional artificial latency, and
/// recorded prompts.
pub struct MockGenerator {
    backend: String,
    model: String,
    responses: Arc<Mutex<VecDeque<Result<String, AppError>>>>,
    delay: Option<Duration>,
    pub calls: Arc<Mutex<usize>>,
    pub prompts: Arc<Mutex<Vec<String>>>,
}

impl MockGenerator {
    pub fn with_responses(backend: &str, responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            backend: backend.to_string(),
            model: format!("{backend}-model"),
            responses: Arc::new(Mutex::new(responses.into())),
            delay: None,
            calls: Arc::new(Mutex::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(
        backend: &str,
        responses: Vec<Result<String, AppError>>,
        delay: Duration,
    ) -> Self {
        let mut generator = Self::with_responses(backend, responses);
        generator.delay = Some(delay);
        generator
    }
}

#[async_trait]
impl Generator for MockGenerator {
    fn backend(&self) -> &str {
        &self.backend
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &str,
        _max_tokens: u32,
        _budget: Duration,
    ) -> Result<String, AppError> {
        *self.calls.lock().unwrap() += 1;
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(r#"{"title":"default title","body":"default body text that satisfies the usual length constraints for a mock draft without saying anything in particular, padded out to stay comfortably above minimums.","summary":"default summary","hashtags":[]}"#.to_string())
            })
    }
}

// ---------------------------------------------------------------------------
// MockQualityScorer
// ---------------------------------------------------------------------------

/// Mock secondary reviewer returning fixed scores (or an error).
pub struct MockQualityScorer {
    scores: Option<QualityScores>,
    pub calls: Arc<Mutex<usize>>,
}

impl MockQualityScorer {
    pub fn fixed(quality: f64, compliance: f64, repetition: f64) -> Self {
        Self {
            scores: Some(QualityScores {
                quality,
                compliance,
                repetition,
            }),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            scores: None,
            calls: Arc::new(Mutex::new(0)),
        }
    }
}

#[async_trait]
impl QualityScorer for MockQualityScorer {
    async fn score(&self, _text: &str) -> Result<QualityScores, AppError> {
        *self.calls.lock().unwrap() += 1;
        self.scores
            .clone()
            .ok_or_else(|| AppError::LlmError {
                message: "review backend down".to_string(),
                status_code: 503,
                retryable: true,
            })
    }
}

// ---------------------------------------------------------------------------
// MockPublisher
// ---------------------------------------------------------------------------

/// Mock publisher that can fail the first N calls, recording everything.
pub struct MockPublisher {
    platform: String,
    fail_first: usize,
    pub calls: Arc<Mutex<usize>>,
    pub published: Arc<Mutex<Vec<ContentDraft>>>,
}

impl MockPublisher {
    pub fn new(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
            fail_first: 0,
            calls: Arc::new(Mutex::new(0)),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn publish(&self, draft: &ContentDraft) -> Result<PublishReceipt, AppError> {
        let call_no = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        if call_no <= self.fail_first {
            return Err(AppError::PublishError {
                platform: self.platform.clone(),
                reason: "temporary upstream error".to_string(),
            });
        }
        self.published.lock().unwrap().push(draft.clone());
        Ok(PublishReceipt {
            platform_post_id: format!("post-{call_no}"),
            platform_url: Some(format!("https://{}/p/{call_no}", self.platform)),
        })
    }
}

// ---------------------------------------------------------------------------
// MockVideoProvider
// ---------------------------------------------------------------------------

/// Mock video provider: configurable submit outcome and poll sequence.
pub struct MockVideoProvider {
    name: String,
    submit_fails: bool,
    polls: Arc<Mutex<VecDeque<VideoStatus>>>,
    pub submits: Arc<Mutex<Vec<String>>>,
}

impl MockVideoProvider {
    pub fn new(name: &str, polls: Vec<VideoStatus>) -> Self {
        Self {
            name: name.to_string(),
            submit_fails: false,
            polls: Arc::new(Mutex::new(polls.into())),
            submits: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn submit_failing(name: &str) -> Self {
        let mut provider = Self::new(name, Vec::new());
        provider.submit_fails = true;
        provider
    }
}

#[async_trait]
impl VideoProvider for MockVideoProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, prompt: &str) -> Result<String, AppError> {
        if self.submit_fails {
            return Err(AppError::HttpError("submit rejected".to_string()));
        }
        self.submits.lock().unwrap().push(prompt.to_string());
        Ok(format!("job-{}", self.submits.lock().unwrap().len()))
    }

    async fn poll(&self, _job_id: &str) -> Result<VideoStatus, AppError> {
        Ok(self
            .polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(VideoStatus::Completed {
                url: "https://video.example/final.mp4".to_string(),
            }))
    }
}
