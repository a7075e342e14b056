use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{CaptureMode, SortStrategy};

/// Per-run (and per-item, mirrored) pipeline stage.
///
/// Transitions are one-directional; the only feedback edges in the system are
/// owned by the parse router (delayed retries) and by draft rollback, neither
/// of which moves the pipeline stage backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Scraping,
    Categorizing,
    Summarizing,
    QualityChecking,
    VideoGenerating,
    Publishing,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Scraping => "scraping",
            PipelineStage::Categorizing => "categorizing",
            PipelineStage::Summarizing => "summarizing",
            PipelineStage::QualityChecking => "quality_checking",
            PipelineStage::VideoGenerating => "video_generating",
            PipelineStage::Publishing => "publishing",
            PipelineStage::Completed => "completed",
            PipelineStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Completed | PipelineStage::Failed)
    }

    /// Whether `next` is a legal successor. The video edge only exists when
    /// video generation was requested for the run; `Failed` is reachable from
    /// any non-terminal stage.
    pub fn can_transition_to(&self, next: PipelineStage, video_requested: bool) -> bool {
        if next == PipelineStage::Failed {
            return !self.is_terminal();
        }
        match (self, next) {
            (PipelineStage::Scraping, PipelineStage::Categorizing)
            | (PipelineStage::Categorizing, PipelineStage::Summarizing)
            | (PipelineStage::Summarizing, PipelineStage::QualityChecking)
            | (PipelineStage::VideoGenerating, PipelineStage::Publishing)
            | (PipelineStage::Publishing, PipelineStage::Completed) => true,
            (PipelineStage::QualityChecking, PipelineStage::VideoGenerating) => video_requested,
            (PipelineStage::QualityChecking, PipelineStage::Publishing) => !video_requested,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scraping" => Ok(PipelineStage::Scraping),
            "categorizing" => Ok(PipelineStage::Categorizing),
            "summarizing" => Ok(PipelineStage::Summarizing),
            "quality_checking" => Ok(PipelineStage::QualityChecking),
            "video_generating" => Ok(PipelineStage::VideoGenerating),
            "publishing" => Ok(PipelineStage::Publishing),
            "completed" => Ok(PipelineStage::Completed),
            "failed" => Ok(PipelineStage::Failed),
            _ => Err(format!("Unknown pipeline stage: {s}")),
        }
    }
}

/// What kicked a run off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Scheduled,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Overall run outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("Unknown run status: {s}")),
        }
    }
}

/// Immutable input configuration snapshot for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub sources: Vec<String>,
    pub target_platforms: Vec<String>,
    pub category_filter: Vec<String>,
    pub generate_video: bool,
    pub video_provider: Option<String>,
    pub max_items: usize,
    pub query: Option<String>,
    pub capture_mode: CaptureMode,
    pub sort_strategy: SortStrategy,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            target_platforms: Vec::new(),
            category_filter: Vec::new(),
            generate_video: false,
            video_provider: None,
            max_items: 50,
            query: None,
            capture_mode: CaptureMode::default(),
            sort_strategy: SortStrategy::default(),
            window_start: None,
            window_end: None,
        }
    }
}

/// One orchestration execution and its accumulated outcome counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub trigger_type: TriggerType,
    pub status: RunStatus,
    pub config: RunConfig,
    pub items_scraped: u64,
    pub items_published: u64,
    pub items_rejected: u64,
    pub stage: PipelineStage,
    pub stage_history: Vec<PipelineStage>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(trigger_type: TriggerType, config: RunConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger_type,
            status: RunStatus::Running,
            config,
            items_scraped: 0,
            items_published: 0,
            items_rejected: 0,
            stage: PipelineStage::Scraping,
            stage_history: Vec::new(),
            error_message: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Advance the run to `next`, validating the edge.
    pub fn enter_stage(&mut self, next: PipelineStage) -> Result<(), crate::error::AppError> {
        let legal = if self.stage_history.is_empty() && next == PipelineStage::Scraping {
            true
        } else {
            self.stage
                .can_transition_to(next, self.config.generate_video)
        };
        if !legal {
            return Err(crate::error::AppError::Generic(format!(
                "illegal pipeline transition {} -> {next}",
                self.stage
            )));
        }
        self.stage = next;
        self.stage_history.push(next);
        Ok(())
    }

    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.error_message = error;
        self.finished_at = Some(Utc::now());
    }
}

/// A named scrape schedule. The cron runner itself lives outside the core;
/// updating strategy fields here only changes which scrape jobs get
/// submitted, never the coordination machinery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub run: RunConfig,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleSpec {
    pub fn new(name: impl Into<String>, cron_expression: impl Into<String>, run: RunConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            cron_expression: cron_expression.into(),
            run,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions_without_video() {
        let order = [
            PipelineStage::Scraping,
            PipelineStage::Categorizing,
            PipelineStage::Summarizing,
            PipelineStage::QualityChecking,
            PipelineStage::Publishing,
            PipelineStage::Completed,
        ];
        for pair in order.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1], false),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_video_edge_only_when_requested() {
        assert!(
            PipelineStage::QualityChecking.can_transition_to(PipelineStage::VideoGenerating, true)
        );
        assert!(
            !PipelineStage::QualityChecking.can_transition_to(PipelineStage::VideoGenerating, false)
        );
        assert!(!PipelineStage::QualityChecking.can_transition_to(PipelineStage::Publishing, true));
        assert!(PipelineStage::VideoGenerating.can_transition_to(PipelineStage::Publishing, true));
    }

    #[test]
    fn test_no_backward_edges() {
        assert!(!PipelineStage::Publishing.can_transition_to(PipelineStage::Scraping, false));
        assert!(!PipelineStage::Completed.can_transition_to(PipelineStage::Publishing, false));
        assert!(!PipelineStage::QualityChecking.can_transition_to(PipelineStage::Summarizing, false));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_only() {
        assert!(PipelineStage::Scraping.can_transition_to(PipelineStage::Failed, false));
        assert!(PipelineStage::Publishing.can_transition_to(PipelineStage::Failed, false));
        assert!(!PipelineStage::Completed.can_transition_to(PipelineStage::Failed, false));
        assert!(!PipelineStage::Failed.can_transition_to(PipelineStage::Failed, false));
    }

    #[test]
    fn test_run_enter_stage_validates() {
        let mut run = PipelineRun::new(TriggerType::Manual, RunConfig::default());
        run.enter_stage(PipelineStage::Scraping).unwrap();
        run.enter_stage(PipelineStage::Categorizing).unwrap();
        assert!(run.enter_stage(PipelineStage::Publishing).is_err());
        assert_eq!(run.stage, PipelineStage::Categorizing);
        assert_eq!(
            run.stage_history,
            vec![PipelineStage::Scraping, PipelineStage::Categorizing]
        );
    }
}
