//! In-process store backends.
//!
//! Functional equivalents of the Postgres repositories for single-process
//! deployments and tests: same contracts, same invariants (unique ingest
//! triple, monotonic version numbers, atomic parse-state commits), no I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::draft::{ContentDraft, DraftStatus, DraftVersion};
use crate::error::AppError;
use crate::models::{IngestKey, ParseDeadLetter, ParseStatus, ScraperState, TrendSource};
use crate::run::{PipelineRun, ScheduleSpec};
use crate::traits::{DraftStore, ParseStateUpdate, RunStore, SourceStore};

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(store = what, "Recovered from poisoned store mutex");
        poisoned.into_inner()
    })
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SourceStoreInner {
    sources: HashMap<Uuid, TrendSource>,
    ledger: HashSet<String>,
    scraper_states: HashMap<(String, String), ScraperState>,
    dead_letters: HashMap<Uuid, ParseDeadLetter>,
}

#[derive(Clone, Default)]
pub struct MemorySourceStore {
    inner: Arc<Mutex<SourceStoreInner>>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_count(&self) -> usize {
        lock(&self.inner, "sources").sources.len()
    }

    pub fn ledger_len(&self) -> usize {
        lock(&self.inner, "sources").ledger.len()
    }
}

impl SourceStore for MemorySourceStore {
    async fn ingest_recorded(&self, key: &IngestKey) -> Result<bool, AppError> {
        Ok(lock(&self.inner, "sources")
            .ledger
            .contains(&key.idempotency_key()))
    }

    async fn record_ingest(&self, key: &IngestKey) -> Result<(), AppError> {
        lock(&self.inner, "sources")
            .ledger
            .insert(key.idempotency_key());
        Ok(())
    }

    async fn upsert_source(&self, source: &TrendSource) -> Result<Uuid, AppError> {
        let mut inner = lock(&self.inner, "sources");
        let triple = source.ingest_key();
        // Mirror the unique (platform, source_id, source_updated_at)
        // constraint: an existing triple is updated in place.
        let existing = inner
            .sources
            .values()
            .find(|s| s.ingest_key() == triple)
            .map(|s| s.id);
        match existing {
            Some(id) => {
                let mut updated = source.clone();
                updated.id = id;
                updated.last_seen_at = Utc::now();
                inner.sources.insert(id, updated);
                Ok(id)
            }
            None => {
                inner.sources.insert(source.id, source.clone());
                Ok(source.id)
            }
        }
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<TrendSource>, AppError> {
        Ok(lock(&self.inner, "sources").sources.get(&id).cloned())
    }

    async fn list_sources_for_parsing(
        &self,
        statuses: &[ParseStatus],
        due_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TrendSource>, AppError> {
        let inner = lock(&self.inner, "sources");
        let mut due: Vec<TrendSource> = inner
            .sources
            .values()
            .filter(|s| statuses.contains(&s.parse_status))
            .filter(|s| s.parse_retry_at.is_none_or(|at| at <= due_before))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.scraped_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn update_parse_state(&self, update: &ParseStateUpdate) -> Result<(), AppError> {
        let mut inner = lock(&self.inner, "sources");
        let source = inner
            .sources
            .get_mut(&update.source_row_id)
            .ok_or_else(|| AppError::NotFound(format!("source row {}", update.source_row_id)))?;
        source.parse_status = update.status;
        if let Some(payload) = &update.payload {
            source.parse_payload = Some(payload.clone());
        }
        source.parse_schema_version = update.schema_version.clone();
        source.parse_confidence = update.confidence;
        source.parse_attempts = update.attempts;
        source.parse_error_kind = update.error_kind.clone();
        source.parse_last_error = update.last_error.clone();
        source.parse_retry_at = update.retry_at;
        if update.parsed_at.is_some() {
            source.parsed_at = update.parsed_at;
        }
        Ok(())
    }

    async fn dead_letter(
        &self,
        letter: &ParseDeadLetter,
        update: &ParseStateUpdate,
    ) -> Result<Uuid, AppError> {
        // Single lock scope = the in-process equivalent of one transaction.
        let mut inner = lock(&self.inner, "sources");
        let source = inner
            .sources
            .get_mut(&update.source_row_id)
            .ok_or_else(|| AppError::NotFound(format!("source row {}", update.source_row_id)))?;
        source.parse_status = update.status;
        source.parse_schema_version = update.schema_version.clone();
        source.parse_attempts = update.attempts;
        source.parse_error_kind = update.error_kind.clone();
        source.parse_last_error = update.last_error.clone();
        source.parse_retry_at = update.retry_at;
        inner.dead_letters.insert(letter.id, letter.clone());
        Ok(letter.id)
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<ParseDeadLetter>, AppError> {
        Ok(lock(&self.inner, "sources").dead_letters.get(&id).cloned())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<ParseDeadLetter>, AppError> {
        let inner = lock(&self.inner, "sources");
        let mut letters: Vec<_> = inner.dead_letters.values().cloned().collect();
        letters.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        letters.truncate(limit);
        Ok(letters)
    }

    async fn mark_dead_letter_replayed(
        &self,
        id: Uuid,
        replayed_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut inner = lock(&self.inner, "sources");
        let letter = inner
            .dead_letters
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("dead letter {id}")))?;
        letter.replayed_at = Some(replayed_at);
        Ok(())
    }

    async fn get_scraper_state(
        &self,
        platform: &str,
        channel: &str,
    ) -> Result<Option<ScraperState>, AppError> {
        Ok(lock(&self.inner, "sources")
            .scraper_states
            .get(&(platform.to_string(), channel.to_string()))
            .cloned())
    }

    async fn upsert_scraper_state(&self, state: &ScraperState) -> Result<(), AppError> {
        lock(&self.inner, "sources").scraper_states.insert(
            (state.platform.clone(), state.channel.clone()),
            state.clone(),
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Drafts
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DraftStoreInner {
    drafts: HashMap<Uuid, ContentDraft>,
    versions: HashMap<Uuid, Vec<DraftVersion>>,
}

#[derive(Clone, Default)]
pub struct MemoryDraftStore {
    inner: Arc<Mutex<DraftStoreInner>>,
}

impl MemoryDraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draft_count(&self) -> usize {
        lock(&self.inner, "drafts").drafts.len()
    }

    pub fn drafts_snapshot(&self) -> Vec<ContentDraft> {
        let mut drafts: Vec<_> = lock(&self.inner, "drafts").drafts.values().cloned().collect();
        drafts.sort_by_key(|d| d.created_at);
        drafts
    }
}

impl DraftStore for MemoryDraftStore {
    async fn save_draft(&self, draft: &ContentDraft) -> Result<Uuid, AppError> {
        lock(&self.inner, "drafts")
            .drafts
            .insert(draft.id, draft.clone());
        Ok(draft.id)
    }

    async fn update_draft(&self, draft: &ContentDraft) -> Result<(), AppError> {
        let mut inner = lock(&self.inner, "drafts");
        if !inner.drafts.contains_key(&draft.id) {
            return Err(AppError::NotFound(format!("draft {}", draft.id)));
        }
        inner.drafts.insert(draft.id, draft.clone());
        Ok(())
    }

    async fn get_draft(&self, id: Uuid) -> Result<Option<ContentDraft>, AppError> {
        Ok(lock(&self.inner, "drafts").drafts.get(&id).cloned())
    }

    async fn append_version(&self, version: &DraftVersion) -> Result<u32, AppError> {
        let mut inner = lock(&self.inner, "drafts");
        let versions = inner.versions.entry(version.draft_id).or_default();
        let next = versions.len() as u32 + 1;
        let mut stored = version.clone();
        stored.version_no = next;
        versions.push(stored);
        Ok(next)
    }

    async fn get_version(
        &self,
        draft_id: Uuid,
        version_no: u32,
    ) -> Result<Option<DraftVersion>, AppError> {
        Ok(lock(&self.inner, "drafts")
            .versions
            .get(&draft_id)
            .and_then(|versions| versions.iter().find(|v| v.version_no == version_no))
            .cloned())
    }

    async fn list_versions(&self, draft_id: Uuid) -> Result<Vec<DraftVersion>, AppError> {
        let mut versions = lock(&self.inner, "drafts")
            .versions
            .get(&draft_id)
            .cloned()
            .unwrap_or_default();
        versions.sort_by_key(|v| v.version_no);
        Ok(versions)
    }

    async fn recent_bodies(&self, platform: &str, limit: usize) -> Result<Vec<String>, AppError> {
        let inner = lock(&self.inner, "drafts");
        let mut accepted: Vec<&ContentDraft> = inner
            .drafts
            .values()
            .filter(|d| d.target_platform.eq_ignore_ascii_case(platform))
            .filter(|d| d.gate_eligible && d.status != DraftStatus::Rejected)
            .collect();
        accepted.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(accepted
            .into_iter()
            .take(limit)
            .map(|d| d.body.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Runs & schedules
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RunStoreInner {
    runs: HashMap<Uuid, PipelineRun>,
    schedules: HashMap<Uuid, ScheduleSpec>,
}

#[derive(Clone, Default)]
pub struct MemoryRunStore {
    inner: Arc<Mutex<RunStoreInner>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: &PipelineRun) -> Result<(), AppError> {
        lock(&self.inner, "runs").runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<(), AppError> {
        let mut inner = lock(&self.inner, "runs");
        if !inner.runs.contains_key(&run.id) {
            return Err(AppError::NotFound(format!("pipeline run {}", run.id)));
        }
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<PipelineRun>, AppError> {
        Ok(lock(&self.inner, "runs").runs.get(&id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleSpec>, AppError> {
        let inner = lock(&self.inner, "runs");
        let mut schedules: Vec<_> = inner.schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schedules)
    }

    async fn save_schedule(&self, schedule: &ScheduleSpec) -> Result<(), AppError> {
        lock(&self.inner, "runs")
            .schedules
            .insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<ScheduleSpec>, AppError> {
        Ok(lock(&self.inner, "runs").schedules.get(&id).cloned())
    }
}
