use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use boreas_core::error::AppError;
use boreas_core::models::{
    CaptureMode, IngestKey, ParseDeadLetter, ParseStatus, ScraperState, SortStrategy, TrendSource,
};
use boreas_core::traits::{ParseStateUpdate, SourceStore};

/// PostgreSQL-backed store for sources, the ingest ledger, scraper state,
/// and the parse dead-letter queue.
#[derive(Clone)]
pub struct SourceRepository {
    pool: Pool<Postgres>,
}

impl SourceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

// -- Internal row types for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct TrendSourceRow {
    id: Uuid,
    source_platform: String,
    source_channel: String,
    source_type: String,
    source_id: String,
    source_url: String,
    title: String,
    description: String,
    author: String,
    language: String,
    capture_mode: String,
    sort_strategy: String,
    normalized_text: String,
    hashtags: Json<Vec<String>>,
    mentions: Json<Vec<String>>,
    external_urls: Json<Vec<String>>,
    media_urls: Json<Vec<String>>,
    media_assets: Json<Vec<String>>,
    multimodal: serde_json::Value,
    engagement_score: f64,
    normalized_heat_score: f64,
    heat_breakdown: Json<HashMap<String, f64>>,
    platform_metrics: serde_json::Value,
    category: Option<String>,
    parse_status: String,
    parse_payload: Option<serde_json::Value>,
    parse_schema_version: String,
    parse_confidence: f64,
    parse_attempts: i32,
    parse_error_kind: Option<String>,
    parse_last_error: Option<String>,
    parse_retry_at: Option<DateTime<Utc>>,
    parsed_at: Option<DateTime<Utc>>,
    published_at: Option<DateTime<Utc>>,
    source_updated_at: Option<DateTime<Utc>>,
    scraped_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    content_hash: String,
    pipeline_run_id: Option<Uuid>,
}

impl From<TrendSourceRow> for TrendSource {
    fn from(row: TrendSourceRow) -> Self {
        TrendSource {
            id: row.id,
            source_platform: row.source_platform,
            source_channel: row.source_channel,
            source_type: row.source_type,
            source_id: row.source_id,
            source_url: row.source_url,
            title: row.title,
            description: row.description,
            author: row.author,
            language: row.language,
            capture_mode: row.capture_mode.parse().unwrap_or(CaptureMode::Hybrid),
            sort_strategy: row.sort_strategy.parse().unwrap_or(SortStrategy::Hybrid),
            normalized_text: row.normalized_text,
            hashtags: row.hashtags.0,
            mentions: row.mentions.0,
            external_urls: row.external_urls.0,
            media_urls: row.media_urls.0,
            media_assets: row.media_assets.0,
            multimodal: row.multimodal,
            engagement_score: row.engagement_score,
            normalized_heat_score: row.normalized_heat_score,
            heat_breakdown: row.heat_breakdown.0,
            platform_metrics: row.platform_metrics,
            category: row.category,
            parse_status: row.parse_status.parse().unwrap_or(ParseStatus::Pending),
            parse_payload: row.parse_payload,
            parse_schema_version: row.parse_schema_version,
            parse_confidence: row.parse_confidence,
            parse_attempts: row.parse_attempts.max(0) as u32,
            parse_error_kind: row.parse_error_kind,
            parse_last_error: row.parse_last_error,
            parse_retry_at: row.parse_retry_at,
            parsed_at: row.parsed_at,
            published_at: row.published_at,
            source_updated_at: row.source_updated_at,
            scraped_at: row.scraped_at,
            last_seen_at: row.last_seen_at,
            content_hash: row.content_hash,
            pipeline_run_id: row.pipeline_run_id,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    source_row_id: Uuid,
    source_platform: String,
    source_id: String,
    content_hash: String,
    schema_version: String,
    error_kind: String,
    error_code: String,
    error_message: String,
    retryable: bool,
    attempts: i32,
    payload_snapshot: serde_json::Value,
    created_at: DateTime<Utc>,
    replayed_at: Option<DateTime<Utc>>,
}

impl From<DeadLetterRow> for ParseDeadLetter {
    fn from(row: DeadLetterRow) -> Self {
        ParseDeadLetter {
            id: row.id,
            source_row_id: row.source_row_id,
            source_platform: row.source_platform,
            source_id: row.source_id,
            content_hash: row.content_hash,
            schema_version: row.schema_version,
            error_kind: row.error_kind,
            error_code: row.error_code,
            error_message: row.error_message,
            retryable: row.retryable,
            attempts: row.attempts.max(0) as u32,
            payload_snapshot: row.payload_snapshot,
            created_at: row.created_at,
            replayed_at: row.replayed_at,
        }
    }
}

/// Apply a [`ParseStateUpdate`] on whatever executor the caller holds, so the
/// dead-letter path can run it inside a transaction.
async fn apply_parse_update<'e, E>(executor: E, update: &ParseStateUpdate) -> Result<(), AppError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE trend_sources
        SET parse_status = $2,
            parse_payload = COALESCE($3, parse_payload),
            parse_schema_version = $4,
            parse_confidence = $5,
            parse_attempts = $6,
            parse_error_kind = $7,
            parse_last_error = $8,
            parse_retry_at = $9,
            parsed_at = COALESCE($10, parsed_at),
            last_seen_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(update.source_row_id)
    .bind(update.status.as_str())
    .bind(&update.payload)
    .bind(&update.schema_version)
    .bind(update.confidence)
    .bind(update.attempts as i32)
    .bind(&update.error_kind)
    .bind(&update.last_error)
    .bind(update.retry_at)
    .bind(update.parsed_at)
    .execute(executor)
    .await
    .map_err(db_err)?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "source row {}",
            update.source_row_id
        )));
    }
    Ok(())
}

impl SourceStore for SourceRepository {
    async fn ingest_recorded(&self, key: &IngestKey) -> Result<bool, AppError> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM source_ingest_records WHERE idempotency_key = $1 LIMIT 1",
        )
        .bind(key.idempotency_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(found.is_some())
    }

    async fn record_ingest(&self, key: &IngestKey) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO source_ingest_records
                (id, source_platform, source_id, source_updated_at, idempotency_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&key.platform)
        .bind(&key.source_id)
        .bind(key.source_updated_at)
        .bind(key.idempotency_key())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_source(&self, source: &TrendSource) -> Result<Uuid, AppError> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO trend_sources (
                id, source_platform, source_channel, source_type, source_id,
                source_url, title, description, author, language,
                capture_mode, sort_strategy, normalized_text, hashtags, mentions,
                external_urls, media_urls, media_assets, multimodal,
                engagement_score, normalized_heat_score, heat_breakdown,
                platform_metrics, category, parse_status, parse_payload,
                parse_schema_version, parse_confidence, parse_attempts,
                parse_error_kind, parse_last_error, parse_retry_at, parsed_at,
                published_at, source_updated_at, scraped_at, last_seen_at,
                content_hash, pipeline_run_id
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
                $21, $22, $23, $24, $25, $26, $27, $28, $29, $30,
                $31, $32, $33, $34, $35, $36, $37, $38, $39
            )
            ON CONFLICT (source_platform, source_id, COALESCE(source_updated_at, 'epoch'::timestamptz))
            DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                normalized_text = EXCLUDED.normalized_text,
                hashtags = EXCLUDED.hashtags,
                mentions = EXCLUDED.mentions,
                external_urls = EXCLUDED.external_urls,
                media_urls = EXCLUDED.media_urls,
                media_assets = EXCLUDED.media_assets,
                multimodal = EXCLUDED.multimodal,
                engagement_score = EXCLUDED.engagement_score,
                normalized_heat_score = EXCLUDED.normalized_heat_score,
                heat_breakdown = EXCLUDED.heat_breakdown,
                platform_metrics = EXCLUDED.platform_metrics,
                last_seen_at = NOW()
            RETURNING id
            "#,
        )
        .bind(source.id)
        .bind(&source.source_platform)
        .bind(&source.source_channel)
        .bind(&source.source_type)
        .bind(&source.source_id)
        .bind(&source.source_url)
        .bind(&source.title)
        .bind(&source.description)
        .bind(&source.author)
        .bind(&source.language)
        .bind(source.capture_mode.as_str())
        .bind(source.sort_strategy.as_str())
        .bind(&source.normalized_text)
        .bind(Json(&source.hashtags))
        .bind(Json(&source.mentions))
        .bind(Json(&source.external_urls))
        .bind(Json(&source.media_urls))
        .bind(Json(&source.media_assets))
        .bind(&source.multimodal)
        .bind(source.engagement_score)
        .bind(source.normalized_heat_score)
        .bind(Json(&source.heat_breakdown))
        .bind(&source.platform_metrics)
        .bind(&source.category)
        .bind(source.parse_status.as_str())
        .bind(&source.parse_payload)
        .bind(&source.parse_schema_version)
        .bind(source.parse_confidence)
        .bind(source.parse_attempts as i32)
        .bind(&source.parse_error_kind)
        .bind(&source.parse_last_error)
        .bind(source.parse_retry_at)
        .bind(source.parsed_at)
        .bind(source.published_at)
        .bind(source.source_updated_at)
        .bind(source.scraped_at)
        .bind(source.last_seen_at)
        .bind(&source.content_hash)
        .bind(source.pipeline_run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(id)
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<TrendSource>, AppError> {
        let row = sqlx::query_as::<_, TrendSourceRow>("SELECT * FROM trend_sources WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn list_sources_for_parsing(
        &self,
        statuses: &[ParseStatus],
        due_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TrendSource>, AppError> {
        let status_strings: Vec<String> =
            statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, TrendSourceRow>(
            r#"
            SELECT * FROM trend_sources
            WHERE parse_status = ANY($1)
              AND (parse_retry_at IS NULL OR parse_retry_at <= $2)
            ORDER BY scraped_at ASC
            LIMIT $3
            "#,
        )
        .bind(&status_strings)
        .bind(due_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_parse_state(&self, update: &ParseStateUpdate) -> Result<(), AppError> {
        apply_parse_update(&self.pool, update).await
    }

    async fn dead_letter(
        &self,
        letter: &ParseDeadLetter,
        update: &ParseStateUpdate,
    ) -> Result<Uuid, AppError> {
        // The letter and the status flip must land together.
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO parse_dead_letters (
                id, source_row_id, source_platform, source_id, content_hash,
                schema_version, error_kind, error_code, error_message,
                retryable, attempts, payload_snapshot, created_at, replayed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(letter.id)
        .bind(letter.source_row_id)
        .bind(&letter.source_platform)
        .bind(&letter.source_id)
        .bind(&letter.content_hash)
        .bind(&letter.schema_version)
        .bind(&letter.error_kind)
        .bind(&letter.error_code)
        .bind(&letter.error_message)
        .bind(letter.retryable)
        .bind(letter.attempts as i32)
        .bind(&letter.payload_snapshot)
        .bind(letter.created_at)
        .bind(letter.replayed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        apply_parse_update(&mut *tx, update).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(letter.id)
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<ParseDeadLetter>, AppError> {
        let row =
            sqlx::query_as::<_, DeadLetterRow>("SELECT * FROM parse_dead_letters WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<ParseDeadLetter>, AppError> {
        let rows = sqlx::query_as::<_, DeadLetterRow>(
            "SELECT * FROM parse_dead_letters ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_dead_letter_replayed(
        &self,
        id: Uuid,
        replayed_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE parse_dead_letters SET replayed_at = $2 WHERE id = $1")
            .bind(id)
            .bind(replayed_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("dead letter {id}")));
        }
        Ok(())
    }

    async fn get_scraper_state(
        &self,
        platform: &str,
        channel: &str,
    ) -> Result<Option<ScraperState>, AppError> {
        let row: Option<(Option<DateTime<Utc>>, Option<String>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT cursor_at, etag, updated_at FROM scraper_states WHERE platform = $1 AND channel = $2",
            )
            .bind(platform)
            .bind(channel)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|(cursor, etag, updated_at)| ScraperState {
            platform: platform.to_string(),
            channel: channel.to_string(),
            cursor,
            etag,
            updated_at,
        }))
    }

    async fn upsert_scraper_state(&self, state: &ScraperState) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO scraper_states (platform, channel, cursor_at, etag, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (platform, channel)
            DO UPDATE SET cursor_at = EXCLUDED.cursor_at, etag = EXCLUDED.etag, updated_at = NOW()
            "#,
        )
        .bind(&state.platform)
        .bind(&state.channel)
        .bind(state.cursor)
        .bind(&state.etag)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
