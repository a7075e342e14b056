//! Boreas core: the resilience and consistency machinery of the
//! trend-to-content pipeline.
//!
//! Scraped items flow strictly downstream — scrape coordinator → parse
//! router → generation stage → publish gate → publishers — with feedback
//! edges only for delayed retries and draft rollback. Everything here is
//! safe to run concurrently, repeatedly, and across multiple process
//! instances: shared breaker/queue state lives behind the
//! [`coordination::Coordination`] interface, ingestion is idempotent via the
//! ledger, and every parse decision commits atomically.

pub mod breaker;
pub mod config;
pub mod contract;
pub mod coordination;
pub mod coordinator;
pub mod dedup;
pub mod draft;
pub mod error;
pub mod gate;
pub mod generation;
pub mod heat;
pub mod memory;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod queue;
pub mod run;
pub mod testutil;
pub mod traits;

pub use breaker::{BreakerDecision, BreakerRecord, CircuitState};
pub use config::PipelineSettings;
pub use coordination::{Coordination, MemoryCoordination};
pub use coordinator::ScrapeCoordinator;
pub use draft::{ContentDraft, DraftStatus, DraftVersion};
pub use error::AppError;
pub use gate::evaluate_batch;
pub use generation::{FallbackGenerator, GenerationStage};
pub use models::{ParseStatus, TrendSource, compute_hash};
pub use parse::ParseRouter;
pub use pipeline::Orchestrator;
pub use run::{PipelineRun, PipelineStage, RunConfig, RunStatus, TriggerType};
