use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// How a scrape window was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    ByHot,
    ByTime,
    #[default]
    Hybrid,
}

impl CaptureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::ByHot => "by_hot",
            CaptureMode::ByTime => "by_time",
            CaptureMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "by_hot" => Ok(CaptureMode::ByHot),
            "by_time" => Ok(CaptureMode::ByTime),
            "hybrid" => Ok(CaptureMode::Hybrid),
            _ => Err(format!("Unknown capture mode: {s}")),
        }
    }
}

/// Ranking strategy applied to a scraped batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortStrategy {
    #[default]
    Hybrid,
    Engagement,
    Recency,
}

impl SortStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortStrategy::Hybrid => "hybrid",
            SortStrategy::Engagement => "engagement",
            SortStrategy::Recency => "recency",
        }
    }

    /// Hybrid capture collapses to a concrete strategy depending on how the
    /// window was captured.
    pub fn effective(self, capture_mode: CaptureMode) -> SortStrategy {
        match (self, capture_mode) {
            (SortStrategy::Hybrid, CaptureMode::ByTime) => SortStrategy::Recency,
            (SortStrategy::Hybrid, CaptureMode::ByHot) => SortStrategy::Engagement,
            (strategy, _) => strategy,
        }
    }
}

impl fmt::Display for SortStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SortStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hybrid" => Ok(SortStrategy::Hybrid),
            "engagement" => Ok(SortStrategy::Engagement),
            "recency" => Ok(SortStrategy::Recency),
            _ => Err(format!("Unknown sort strategy: {s}")),
        }
    }
}

/// Parse workflow status of a scraped source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Delayed,
    ManualReview,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStatus::Pending => "pending",
            ParseStatus::Processing => "processing",
            ParseStatus::Completed => "completed",
            ParseStatus::Failed => "failed",
            ParseStatus::Delayed => "delayed",
            ParseStatus::ManualReview => "manual_review",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ParseStatus::Completed | ParseStatus::Failed)
    }
}

impl fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ParseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ParseStatus::Pending),
            "processing" => Ok(ParseStatus::Processing),
            "completed" => Ok(ParseStatus::Completed),
            "failed" => Ok(ParseStatus::Failed),
            "delayed" => Ok(ParseStatus::Delayed),
            "manual_review" => Ok(ParseStatus::ManualReview),
            _ => Err(format!("Unknown parse status: {s}")),
        }
    }
}

/// The dedup triple identifying one logical version of a scraped item.
///
/// Re-ingesting the same triple is a no-op: the idempotency ledger is keyed
/// on it, and `trend_sources` carries a matching unique constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngestKey {
    pub platform: String,
    pub source_id: String,
    pub source_updated_at: Option<DateTime<Utc>>,
}

impl IngestKey {
    /// Stable string form stored in the ledger's unique column.
    pub fn idempotency_key(&self) -> String {
        let updated = self
            .source_updated_at
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_else(|| "-".to_string());
        format!("{}:{}:{}", self.platform, self.source_id, updated)
    }
}

/// One scraped trending item, normalized across platforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendSource {
    pub id: Uuid,
    pub source_platform: String,
    pub source_channel: String,
    pub source_type: String,
    pub source_id: String,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub author: String,
    pub language: String,
    pub capture_mode: CaptureMode,
    pub sort_strategy: SortStrategy,

    // Normalized content
    pub normalized_text: String,
    pub hashtags: Vec<String>,
    pub mentions: Vec<String>,
    pub external_urls: Vec<String>,
    pub media_urls: Vec<String>,
    pub media_assets: Vec<String>,
    pub multimodal: serde_json::Value,

    // Ranking
    pub engagement_score: f64,
    pub normalized_heat_score: f64,
    pub heat_breakdown: HashMap<String, f64>,
    pub platform_metrics: serde_json::Value,
    pub category: Option<String>,

    // Parse workflow
    pub parse_status: ParseStatus,
    pub parse_payload: Option<serde_json::Value>,
    pub parse_schema_version: String,
    pub parse_confidence: f64,
    pub parse_attempts: u32,
    pub parse_error_kind: Option<String>,
    pub parse_last_error: Option<String>,
    pub parse_retry_at: Option<DateTime<Utc>>,
    pub parsed_at: Option<DateTime<Utc>>,

    pub published_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub content_hash: String,
    pub pipeline_run_id: Option<Uuid>,
}

impl TrendSource {
    /// Minimal constructor; adapters fill in the rest field-by-field.
    pub fn new(platform: impl Into<String>, source_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_platform: platform.into(),
            source_channel: String::new(),
            source_type: "post".to_string(),
            source_id: source_id.into(),
            source_url: String::new(),
            title: String::new(),
            description: String::new(),
            author: String::new(),
            language: "en".to_string(),
            capture_mode: CaptureMode::default(),
            sort_strategy: SortStrategy::default(),
            normalized_text: String::new(),
            hashtags: Vec::new(),
            mentions: Vec::new(),
            external_urls: Vec::new(),
            media_urls: Vec::new(),
            media_assets: Vec::new(),
            multimodal: serde_json::Value::Null,
            engagement_score: 0.0,
            normalized_heat_score: 0.0,
            heat_breakdown: HashMap::new(),
            platform_metrics: serde_json::Value::Null,
            category: None,
            parse_status: ParseStatus::Pending,
            parse_payload: None,
            parse_schema_version: String::new(),
            parse_confidence: 0.0,
            parse_attempts: 0,
            parse_error_kind: None,
            parse_last_error: None,
            parse_retry_at: None,
            parsed_at: None,
            published_at: None,
            source_updated_at: None,
            scraped_at: now,
            last_seen_at: now,
            content_hash: String::new(),
            pipeline_run_id: None,
        }
    }

    pub fn ingest_key(&self) -> IngestKey {
        IngestKey {
            platform: self.source_platform.clone(),
            source_id: self.source_id.clone(),
            source_updated_at: self.source_updated_at,
        }
    }

    /// Text used for dedup and parse-cache hashing.
    pub fn dedup_text(&self) -> String {
        let base = if self.normalized_text.trim().is_empty() {
            format!("{} {}", self.title, self.description)
        } else {
            self.normalized_text.clone()
        };
        if base.trim().is_empty() {
            format!("{}:{}", self.source_platform, self.source_id)
        } else {
            base
        }
    }
}

/// Append-only idempotency ledger row; existence of the key gates ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceIngestRecord {
    pub id: Uuid,
    pub platform: String,
    pub source_id: String,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    pub first_seen_at: DateTime<Utc>,
}

impl SourceIngestRecord {
    pub fn from_key(key: &IngestKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            platform: key.platform.clone(),
            source_id: key.source_id.clone(),
            source_updated_at: key.source_updated_at,
            idempotency_key: key.idempotency_key(),
            first_seen_at: Utc::now(),
        }
    }
}

/// Persisted per-(platform, channel) incremental scrape state.
///
/// Read before polling, written after each successful poll; survives process
/// restarts so a scraper resumes where it left off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperState {
    pub platform: String,
    pub channel: String,
    pub cursor: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ScraperState {
    pub fn empty(platform: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            channel: channel.into(),
            cursor: None,
            etag: None,
            updated_at: Utc::now(),
        }
    }
}

/// One unrecoverable or retry-exhausted parse failure awaiting manual replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseDeadLetter {
    pub id: Uuid,
    pub source_row_id: Uuid,
    pub source_platform: String,
    pub source_id: String,
    pub content_hash: String,
    pub schema_version: String,
    /// "recoverable" (retries exhausted) or "unrecoverable".
    pub error_kind: String,
    pub error_code: String,
    pub error_message: String,
    pub retryable: bool,
    pub attempts: u32,
    pub payload_snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(compute_hash("hello"), compute_hash("world"));
    }

    #[test]
    fn test_parse_status_roundtrip() {
        for status in [
            ParseStatus::Pending,
            ParseStatus::Processing,
            ParseStatus::Completed,
            ParseStatus::Failed,
            ParseStatus::Delayed,
            ParseStatus::ManualReview,
        ] {
            let parsed: ParseStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_effective_sort_strategy() {
        assert_eq!(
            SortStrategy::Hybrid.effective(CaptureMode::ByTime),
            SortStrategy::Recency
        );
        assert_eq!(
            SortStrategy::Hybrid.effective(CaptureMode::ByHot),
            SortStrategy::Engagement
        );
        assert_eq!(
            SortStrategy::Hybrid.effective(CaptureMode::Hybrid),
            SortStrategy::Hybrid
        );
        assert_eq!(
            SortStrategy::Recency.effective(CaptureMode::ByHot),
            SortStrategy::Recency
        );
    }

    #[test]
    fn test_idempotency_key_distinguishes_updates() {
        let t1 = Utc::now();
        let key_a = IngestKey {
            platform: "github".into(),
            source_id: "rust-lang/rust".into(),
            source_updated_at: Some(t1),
        };
        let key_b = IngestKey {
            source_updated_at: Some(t1 + chrono::TimeDelta::seconds(1)),
            ..key_a.clone()
        };
        assert_ne!(key_a.idempotency_key(), key_b.idempotency_key());
        assert_eq!(key_a.idempotency_key(), key_a.clone().idempotency_key());
    }

    #[test]
    fn test_dedup_text_falls_back() {
        let mut source = TrendSource::new("weibo", "42");
        assert_eq!(source.dedup_text(), "weibo:42");
        source.title = "hot topic".into();
        assert_eq!(source.dedup_text(), "hot topic ");
        source.normalized_text = "normalized".into();
        assert_eq!(source.dedup_text(), "normalized");
    }
}
