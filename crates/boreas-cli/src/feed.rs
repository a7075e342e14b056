//! File-backed source adapter for local runs.
//!
//! Platform adapters proper live outside this repository; the CLI feeds the
//! pipeline from a JSON file of pre-fetched items instead, which exercises
//! the full coordination path (cursor filtering included) without network
//! access.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use boreas_core::error::AppError;
use boreas_core::models::TrendSource;
use boreas_core::traits::{FetchOutcome, FetchRequest, SourceAdapter};

#[derive(Debug, Deserialize)]
struct FeedItem {
    source_id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    author: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    engagement_score: f64,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    hashtags: Vec<String>,
    #[serde(default)]
    media_urls: Vec<String>,
}

/// Serves one platform's items from a JSON array on disk.
pub struct FeedFileAdapter {
    platform: String,
    path: PathBuf,
}

impl FeedFileAdapter {
    pub fn new(platform: impl Into<String>, path: PathBuf) -> Self {
        Self {
            platform: platform.into(),
            path,
        }
    }
}

#[async_trait]
impl SourceAdapter for FeedFileAdapter {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn fetch_since(
        &self,
        request: &FetchRequest,
        cursor: Option<DateTime<Utc>>,
        _etag: Option<&str>,
    ) -> Result<FetchOutcome, AppError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AppError::Generic(format!("feed file {}: {e}", self.path.display())))?;
        let items: Vec<FeedItem> = serde_json::from_str(&raw)?;

        let mut sources = Vec::new();
        let mut newest = cursor;
        for item in items.into_iter().take(request.limit.max(1)) {
            // Cursor filter: only items newer than the last successful poll.
            if let (Some(cursor), Some(published)) = (cursor, item.published_at)
                && published <= cursor
            {
                continue;
            }
            if newest.is_none() || item.published_at > newest {
                newest = item.published_at;
            }

            let mut source = TrendSource::new(&self.platform, &item.source_id);
            source.title = item.title;
            source.description = item.description;
            source.source_url = item.url;
            source.author = item.author;
            if let Some(language) = item.language {
                source.language = language;
            }
            source.engagement_score = item.engagement_score;
            source.published_at = item.published_at;
            source.source_updated_at = item.published_at;
            source.hashtags = item.hashtags;
            source.media_urls = item.media_urls;
            sources.push(source);
        }

        if sources.is_empty() && cursor.is_some() {
            return Ok(FetchOutcome::NotModified);
        }
        Ok(FetchOutcome::Batch {
            items: sources,
            cursor: newest,
            etag: None,
        })
    }
}
