use boreas_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::coordination::PgCoordination;
use crate::draft_repository::DraftRepository;
use crate::run_repository::RunRepository;
use crate::source_repository::SourceRepository;

/// Central database facade — owns the connection pool, runs migrations,
/// and vends repository instances.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn source_repo(&self) -> SourceRepository {
        SourceRepository::new(self.pool.clone())
    }

    pub fn draft_repo(&self) -> DraftRepository {
        DraftRepository::new(self.pool.clone())
    }

    pub fn run_repo(&self) -> RunRepository {
        RunRepository::new(self.pool.clone())
    }

    /// Shared-store coordination backend for multi-instance deployments.
    pub fn coordination(
        &self,
        breaker: boreas_core::config::BreakerConfig,
        queue: boreas_core::config::QueueConfig,
    ) -> PgCoordination {
        PgCoordination::new(self.pool.clone(), breaker, queue)
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
