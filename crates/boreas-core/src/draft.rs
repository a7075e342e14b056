use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a generated draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    #[default]
    Summarized,
    QualityChecked,
    Published,
    Rejected,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Summarized => "summarized",
            DraftStatus::QualityChecked => "quality_checked",
            DraftStatus::Published => "published",
            DraftStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DraftStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summarized" => Ok(DraftStatus::Summarized),
            "quality_checked" => Ok(DraftStatus::QualityChecked),
            "published" => Ok(DraftStatus::Published),
            "rejected" => Ok(DraftStatus::Rejected),
            _ => Err(format!("Unknown draft status: {s}")),
        }
    }
}

/// Metadata about the model invocation that produced a draft state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerationMeta {
    pub backend: String,
    pub model: String,
    pub latency_ms: f64,
    pub used_fallback: bool,
    /// 1-indexed attempt within the self-repair loop.
    pub attempt: u32,
    pub prompt_hash: String,
    pub output_hash: String,
}

/// Detailed scoring attached by generation and the publish gate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QualityDetails {
    pub compliance_score: f64,
    pub repetition_ratio: f64,
    pub issues: Vec<String>,
}

/// One platform-targeted generated piece.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentDraft {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_platform: String,
    pub title: String,
    pub body: String,
    pub summary: String,
    pub hashtags: Vec<String>,
    pub media_urls: Vec<String>,
    pub video_url: Option<String>,
    pub video_provider: Option<String>,
    pub language: String,
    pub status: DraftStatus,
    pub quality_score: f64,
    pub compliance_score: f64,
    pub repetition_ratio: f64,
    /// False when the self-repair loop exhausted its bound without a clean
    /// attempt; such drafts never reach the publish gate as candidates.
    pub gate_eligible: bool,
    pub quality_details: QualityDetails,
    pub generation_meta: GenerationMeta,
    pub current_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentDraft {
    pub fn new(source_id: Uuid, target_platform: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_id,
            target_platform: target_platform.into(),
            title: String::new(),
            body: String::new(),
            summary: String::new(),
            hashtags: Vec::new(),
            media_urls: Vec::new(),
            video_url: None,
            video_provider: None,
            language: "en".to_string(),
            status: DraftStatus::Summarized,
            quality_score: 0.0,
            compliance_score: 0.0,
            repetition_ratio: 0.0,
            gate_eligible: false,
            quality_details: QualityDetails::default(),
            generation_meta: GenerationMeta::default(),
            current_version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Text the near-duplicate clustering operates on.
    pub fn dedup_text(&self) -> String {
        format!("{}\n{}", self.title, self.body)
    }
}

/// Immutable snapshot of one draft content state.
///
/// Append-only: rollback copies a version forward into the draft's current
/// fields and records that as a new version, never rewriting history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftVersion {
    pub id: Uuid,
    pub draft_id: Uuid,
    /// Monotonic per draft, starting at 1.
    pub version_no: u32,
    pub title: String,
    pub body: String,
    pub summary: String,
    pub hashtags: Vec<String>,
    pub media_urls: Vec<String>,
    pub prompt: String,
    pub model: String,
    pub params: serde_json::Value,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl DraftVersion {
    /// Snapshot the draft's current content under the given prompt/model.
    pub fn snapshot(
        draft: &ContentDraft,
        prompt: impl Into<String>,
        model: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        let content = format!("{}\n{}\n{}", draft.title, draft.body, draft.summary);
        Self {
            id: Uuid::new_v4(),
            draft_id: draft.id,
            version_no: 0, // assigned by the store on append
            title: draft.title.clone(),
            body: draft.body.clone(),
            summary: draft.summary.clone(),
            hashtags: draft.hashtags.clone(),
            media_urls: draft.media_urls.clone(),
            prompt: prompt.into(),
            model: model.into(),
            params,
            content_hash: crate::models::compute_hash(&content),
            created_at: Utc::now(),
        }
    }

    /// Copy this version's content over a draft's current fields.
    pub fn apply_to(&self, draft: &mut ContentDraft) {
        draft.title = self.title.clone();
        draft.body = self.body.clone();
        draft.summary = self.summary.clone();
        draft.hashtags = self.hashtags.clone();
        draft.media_urls = self.media_urls.clone();
        draft.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            DraftStatus::Summarized,
            DraftStatus::QualityChecked,
            DraftStatus::Published,
            DraftStatus::Rejected,
        ] {
            let parsed: DraftStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_snapshot_and_apply() {
        let mut draft = ContentDraft::new(Uuid::new_v4(), "wechat");
        draft.title = "original title".into();
        draft.body = "original body".into();
        draft.summary = "original summary".into();

        let version = DraftVersion::snapshot(&draft, "prompt", "model-a", serde_json::json!({}));
        assert_eq!(version.title, "original title");
        assert_eq!(version.content_hash.len(), 64);

        draft.title = "edited".into();
        draft.body = "edited".into();
        version.apply_to(&mut draft);
        assert_eq!(draft.title, "original title");
        assert_eq!(draft.body, "original body");
    }
}
