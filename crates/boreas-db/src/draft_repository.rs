use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use boreas_core::draft::{ContentDraft, DraftStatus, DraftVersion, GenerationMeta, QualityDetails};
use boreas_core::error::AppError;
use boreas_core::traits::DraftStore;

/// PostgreSQL-backed store for drafts and their append-only version history.
#[derive(Clone)]
pub struct DraftRepository {
    pool: Pool<Postgres>,
}

impl DraftRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

#[derive(sqlx::FromRow)]
struct DraftRow {
    id: Uuid,
    source_id: Uuid,
    target_platform: String,
    title: String,
    body: String,
    summary: String,
    hashtags: Json<Vec<String>>,
    media_urls: Json<Vec<String>>,
    video_url: Option<String>,
    video_provider: Option<String>,
    language: String,
    status: String,
    quality_score: f64,
    compliance_score: f64,
    repetition_ratio: f64,
    gate_eligible: bool,
    quality_details: Json<QualityDetails>,
    generation_meta: Json<GenerationMeta>,
    current_version: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DraftRow> for ContentDraft {
    fn from(row: DraftRow) -> Self {
        ContentDraft {
            id: row.id,
            source_id: row.source_id,
            target_platform: row.target_platform,
            title: row.title,
            body: row.body,
            summary: row.summary,
            hashtags: row.hashtags.0,
            media_urls: row.media_urls.0,
            video_url: row.video_url,
            video_provider: row.video_provider,
            language: row.language,
            status: row.status.parse().unwrap_or(DraftStatus::Summarized),
            quality_score: row.quality_score,
            compliance_score: row.compliance_score,
            repetition_ratio: row.repetition_ratio,
            gate_eligible: row.gate_eligible,
            quality_details: row.quality_details.0,
            generation_meta: row.generation_meta.0,
            current_version: row.current_version.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: Uuid,
    draft_id: Uuid,
    version_no: i32,
    title: String,
    body: String,
    summary: String,
    hashtags: Json<Vec<String>>,
    media_urls: Json<Vec<String>>,
    prompt: String,
    model: String,
    params: serde_json::Value,
    content_hash: String,
    created_at: DateTime<Utc>,
}

impl From<VersionRow> for DraftVersion {
    fn from(row: VersionRow) -> Self {
        DraftVersion {
            id: row.id,
            draft_id: row.draft_id,
            version_no: row.version_no.max(0) as u32,
            title: row.title,
            body: row.body,
            summary: row.summary,
            hashtags: row.hashtags.0,
            media_urls: row.media_urls.0,
            prompt: row.prompt,
            model: row.model,
            params: row.params,
            content_hash: row.content_hash,
            created_at: row.created_at,
        }
    }
}

impl DraftStore for DraftRepository {
    async fn save_draft(&self, draft: &ContentDraft) -> Result<Uuid, AppError> {
        sqlx::query(
            r#"
            INSERT INTO content_drafts (
                id, source_id, target_platform, title, body, summary,
                hashtags, media_urls, video_url, video_provider, language,
                status, quality_score, compliance_score, repetition_ratio,
                gate_eligible, quality_details, generation_meta,
                current_version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(draft.id)
        .bind(draft.source_id)
        .bind(&draft.target_platform)
        .bind(&draft.title)
        .bind(&draft.body)
        .bind(&draft.summary)
        .bind(Json(&draft.hashtags))
        .bind(Json(&draft.media_urls))
        .bind(&draft.video_url)
        .bind(&draft.video_provider)
        .bind(&draft.language)
        .bind(draft.status.as_str())
        .bind(draft.quality_score)
        .bind(draft.compliance_score)
        .bind(draft.repetition_ratio)
        .bind(draft.gate_eligible)
        .bind(Json(&draft.quality_details))
        .bind(Json(&draft.generation_meta))
        .bind(draft.current_version as i32)
        .bind(draft.created_at)
        .bind(draft.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(draft.id)
    }

    async fn update_draft(&self, draft: &ContentDraft) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE content_drafts
            SET title = $2, body = $3, summary = $4, hashtags = $5,
                media_urls = $6, video_url = $7, video_provider = $8,
                status = $9, quality_score = $10, compliance_score = $11,
                repetition_ratio = $12, gate_eligible = $13,
                quality_details = $14, generation_meta = $15,
                current_version = $16, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(draft.id)
        .bind(&draft.title)
        .bind(&draft.body)
        .bind(&draft.summary)
        .bind(Json(&draft.hashtags))
        .bind(Json(&draft.media_urls))
        .bind(&draft.video_url)
        .bind(&draft.video_provider)
        .bind(draft.status.as_str())
        .bind(draft.quality_score)
        .bind(draft.compliance_score)
        .bind(draft.repetition_ratio)
        .bind(draft.gate_eligible)
        .bind(Json(&draft.quality_details))
        .bind(Json(&draft.generation_meta))
        .bind(draft.current_version as i32)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("draft {}", draft.id)));
        }
        Ok(())
    }

    async fn get_draft(&self, id: Uuid) -> Result<Option<ContentDraft>, AppError> {
        let row = sqlx::query_as::<_, DraftRow>("SELECT * FROM content_drafts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn append_version(&self, version: &DraftVersion) -> Result<u32, AppError> {
        // The (draft_id, version_no) unique constraint makes the number
        // assignment safe under concurrent appends: a loser of the race gets
        // a duplicate-key error and retries with the fresh max.
        for _ in 0..3 {
            let next: i32 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(version_no), 0) + 1 FROM draft_versions WHERE draft_id = $1",
            )
            .bind(version.draft_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO draft_versions (
                    id, draft_id, version_no, title, body, summary, hashtags,
                    media_urls, prompt, model, params, content_hash, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (draft_id, version_no) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(version.draft_id)
            .bind(next)
            .bind(&version.title)
            .bind(&version.body)
            .bind(&version.summary)
            .bind(Json(&version.hashtags))
            .bind(Json(&version.media_urls))
            .bind(&version.prompt)
            .bind(&version.model)
            .bind(&version.params)
            .bind(&version.content_hash)
            .bind(version.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

            if inserted.rows_affected() == 1 {
                return Ok(next.max(0) as u32);
            }
        }
        Err(AppError::DatabaseError(
            "could not append draft version after repeated conflicts".into(),
        ))
    }

    async fn get_version(
        &self,
        draft_id: Uuid,
        version_no: u32,
    ) -> Result<Option<DraftVersion>, AppError> {
        let row = sqlx::query_as::<_, VersionRow>(
            "SELECT * FROM draft_versions WHERE draft_id = $1 AND version_no = $2",
        )
        .bind(draft_id)
        .bind(version_no as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn list_versions(&self, draft_id: Uuid) -> Result<Vec<DraftVersion>, AppError> {
        let rows = sqlx::query_as::<_, VersionRow>(
            "SELECT * FROM draft_versions WHERE draft_id = $1 ORDER BY version_no ASC",
        )
        .bind(draft_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn recent_bodies(&self, platform: &str, limit: usize) -> Result<Vec<String>, AppError> {
        let bodies: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT body FROM content_drafts
            WHERE target_platform = $1
              AND gate_eligible
              AND status <> 'rejected'
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(platform)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(bodies)
    }
}
