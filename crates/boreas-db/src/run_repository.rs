use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use boreas_core::error::AppError;
use boreas_core::run::{PipelineRun, PipelineStage, RunConfig, RunStatus, ScheduleSpec, TriggerType};
use boreas_core::traits::RunStore;

/// PostgreSQL-backed store for pipeline runs and scrape schedules.
#[derive(Clone)]
pub struct RunRepository {
    pool: Pool<Postgres>,
}

impl RunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    trigger_type: String,
    status: String,
    config: Json<RunConfig>,
    items_scraped: i64,
    items_published: i64,
    items_rejected: i64,
    stage: String,
    stage_history: Json<Vec<PipelineStage>>,
    error_message: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<RunRow> for PipelineRun {
    fn from(row: RunRow) -> Self {
        PipelineRun {
            id: row.id,
            trigger_type: if row.trigger_type == "scheduled" {
                TriggerType::Scheduled
            } else {
                TriggerType::Manual
            },
            status: row.status.parse().unwrap_or(RunStatus::Running),
            config: row.config.0,
            items_scraped: row.items_scraped.max(0) as u64,
            items_published: row.items_published.max(0) as u64,
            items_rejected: row.items_rejected.max(0) as u64,
            stage: row.stage.parse().unwrap_or(PipelineStage::Failed),
            stage_history: row.stage_history.0,
            error_message: row.error_message,
            started_at: row.started_at,
            finished_at: row.finished_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    name: String,
    cron_expression: String,
    run_config: Json<RunConfig>,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ScheduleRow> for ScheduleSpec {
    fn from(row: ScheduleRow) -> Self {
        ScheduleSpec {
            id: row.id,
            name: row.name,
            cron_expression: row.cron_expression,
            run: row.run_config.0,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl RunStore for RunRepository {
    async fn create_run(&self, run: &PipelineRun) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (
                id, trigger_type, status, config, items_scraped,
                items_published, items_rejected, stage, stage_history,
                error_message, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(run.id)
        .bind(run.trigger_type.as_str())
        .bind(run.status.as_str())
        .bind(Json(&run.config))
        .bind(run.items_scraped as i64)
        .bind(run.items_published as i64)
        .bind(run.items_rejected as i64)
        .bind(run.stage.as_str())
        .bind(Json(&run.stage_history))
        .bind(&run.error_message)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = $2, items_scraped = $3, items_published = $4,
                items_rejected = $5, stage = $6, stage_history = $7,
                error_message = $8, finished_at = $9
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.items_scraped as i64)
        .bind(run.items_published as i64)
        .bind(run.items_rejected as i64)
        .bind(run.stage.as_str())
        .bind(Json(&run.stage_history))
        .bind(&run.error_message)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("pipeline run {}", run.id)));
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<PipelineRun>, AppError> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM pipeline_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleSpec>, AppError> {
        let rows =
            sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_schedule(&self, schedule: &ScheduleSpec) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, name, cron_expression, run_config, enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (id)
            DO UPDATE SET name = EXCLUDED.name,
                          cron_expression = EXCLUDED.cron_expression,
                          run_config = EXCLUDED.run_config,
                          enabled = EXCLUDED.enabled,
                          updated_at = NOW()
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(Json(&schedule.run))
        .bind(schedule.enabled)
        .bind(schedule.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduleSpec>, AppError> {
        let row = sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(Into::into))
    }
}
