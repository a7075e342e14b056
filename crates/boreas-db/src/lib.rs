//! PostgreSQL persistence for Boreas: repositories for every pipeline
//! entity plus the shared-store coordination backend used by multi-instance
//! deployments.

pub mod config;
pub mod coordination;
pub mod database;
pub mod draft_repository;
pub mod run_repository;
pub mod source_repository;

pub use config::DatabaseConfig;
pub use coordination::PgCoordination;
pub use database::Database;
pub use draft_repository::DraftRepository;
pub use run_repository::RunRepository;
pub use source_repository::SourceRepository;
