//! Pipeline orchestrator: sequences
//! scraping → categorizing → summarizing → quality_checking →
//! [video_generating] → publishing → completed for one run, wiring the
//! coordinator, parse router, generation stage, and publish gate, and
//! recording run-level outcomes.
//!
//! Stage failures inside an item (parse errors, a bad generation, a publisher
//! outage) are absorbed into that item's own retry/reject paths; only
//! run-level errors (store failures, illegal transitions) fail the run.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{GateConfig, PipelineSettings, PublishConfig};
use crate::coordination::Coordination;
use crate::coordinator::ScrapeCoordinator;
use crate::draft::{ContentDraft, DraftStatus};
use crate::error::AppError;
use crate::gate::{GateVerdict, evaluate_batch};
use crate::generation::GenerationStage;
use crate::models::TrendSource;
use crate::parse::ParseRouter;
use crate::run::{PipelineRun, PipelineStage, RunConfig, RunStatus, TriggerType};
use crate::traits::{
    Categorizer, DraftStore, Publisher, PublisherRegistry, RunStore, SourceStore, VideoProvider,
    VideoStatus,
};

pub struct Orchestrator<C, S, D, R>
where
    C: Coordination,
    S: SourceStore + 'static,
    D: DraftStore,
    R: RunStore,
{
    coordinator: ScrapeCoordinator<C, S>,
    parse_router: ParseRouter<S>,
    generation: GenerationStage<D>,
    categorizer: Arc<dyn Categorizer>,
    publishers: PublisherRegistry,
    video: Option<Arc<dyn VideoProvider>>,
    video_fallback: Option<Arc<dyn VideoProvider>>,
    draft_store: D,
    run_store: R,
    gate: GateConfig,
    publish: PublishConfig,
}

impl<C, S, D, R> Orchestrator<C, S, D, R>
where
    C: Coordination,
    S: SourceStore + 'static,
    D: DraftStore,
    R: RunStore,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: ScrapeCoordinator<C, S>,
        parse_router: ParseRouter<S>,
        generation: GenerationStage<D>,
        categorizer: Arc<dyn Categorizer>,
        publishers: PublisherRegistry,
        video: Option<Arc<dyn VideoProvider>>,
        video_fallback: Option<Arc<dyn VideoProvider>>,
        draft_store: D,
        run_store: R,
        settings: &PipelineSettings,
    ) -> Self {
        Self {
            coordinator,
            parse_router,
            generation,
            categorizer,
            publishers,
            video,
            video_fallback,
            draft_store,
            run_store,
            gate: settings.gate.clone(),
            publish: settings.publish.clone(),
        }
    }

    /// Spawn the scrape worker pool backing this orchestrator.
    pub fn spawn_workers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.coordinator.spawn_workers(cancel)
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Option<PipelineRun>, AppError> {
        self.run_store.get_run(id).await
    }

    /// Execute a full pipeline run. Returns the run id; the run record holds
    /// status, counters, and any run-level error.
    pub async fn run_pipeline(
        &self,
        trigger: TriggerType,
        config: RunConfig,
    ) -> Result<Uuid, AppError> {
        let mut run = PipelineRun::new(trigger, config);
        self.run_store.create_run(&run).await?;
        let run_id = run.id;
        tracing::info!(%run_id, trigger = %run.trigger_type, "pipeline run started");

        match self.execute(&mut run).await {
            Ok(()) => {
                run.finish(RunStatus::Completed, None);
            }
            Err(error) => {
                tracing::error!(%run_id, error = %error, "pipeline run failed");
                let _ = run.enter_stage(PipelineStage::Failed);
                run.finish(RunStatus::Failed, Some(error.to_string()));
            }
        }
        self.run_store.update_run(&run).await?;
        tracing::info!(
            %run_id,
            status = %run.status,
            scraped = run.items_scraped,
            published = run.items_published,
            rejected = run.items_rejected,
            "pipeline run finished"
        );
        Ok(run_id)
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<(), AppError> {
        // Scraping.
        run.enter_stage(PipelineStage::Scraping)?;
        let batch = self.coordinator.scrape(&run.config, Some(run.id)).await?;
        run.items_scraped = batch.items.len() as u64;

        // Parse stage: failures are absorbed into the router's own
        // delayed-retry/DLQ paths and never abort the run.
        for item in &batch.items {
            if let Err(error) = self.parse_router.parse_source(item, false).await {
                tracing::warn!(source_row_id = %item.id, error = %error, "parse routing error");
            }
        }

        // Categorizing.
        run.enter_stage(PipelineStage::Categorizing)?;
        let mut items = batch.items;
        for item in items.iter_mut() {
            match self.categorizer.categorize(item).await {
                Ok(category) => item.category = Some(category.category),
                Err(error) => {
                    tracing::warn!(source_row_id = %item.id, error = %error, "categorization failed");
                }
            }
        }
        if !run.config.category_filter.is_empty() {
            items.retain(|item| {
                item.category
                    .as_ref()
                    .is_some_and(|c| run.config.category_filter.contains(c))
            });
        }

        // Summarizing.
        run.enter_stage(PipelineStage::Summarizing)?;
        let drafts = self.generate_drafts(&items, &run.config).await;

        // Quality checking.
        run.enter_stage(PipelineStage::QualityChecking)?;
        let mut approved = self.apply_gate(run, drafts).await?;

        // Video generation, only when requested and wired.
        if run.config.generate_video && self.video.is_some() {
            run.enter_stage(PipelineStage::VideoGenerating)?;
            for draft in approved.iter_mut().take(self.publish.video_max_drafts) {
                self.attach_video(draft).await;
                self.draft_store.update_draft(draft).await?;
            }
        }

        // Publishing.
        run.enter_stage(PipelineStage::Publishing)?;
        for draft in approved.iter_mut() {
            let Some(publisher) = self.publishers.get(&draft.target_platform) else {
                tracing::warn!(
                    platform = %draft.target_platform,
                    draft_id = %draft.id,
                    "no publisher registered"
                );
                continue;
            };
            match self.publish_with_retry(publisher, draft).await {
                Ok(receipt) => {
                    draft.status = DraftStatus::Published;
                    self.draft_store.update_draft(draft).await?;
                    run.items_published += 1;
                    tracing::info!(
                        draft_id = %draft.id,
                        platform = %draft.target_platform,
                        post_id = %receipt.platform_post_id,
                        "draft published"
                    );
                }
                Err(error) => {
                    // Best-effort: the draft keeps its pre-publish status.
                    tracing::error!(
                        draft_id = %draft.id,
                        platform = %draft.target_platform,
                        error = %error,
                        "publish failed after retries"
                    );
                }
            }
        }

        run.enter_stage(PipelineStage::Completed)?;
        Ok(())
    }

    async fn generate_drafts(&self, items: &[TrendSource], config: &RunConfig) -> Vec<ContentDraft> {
        let mut drafts = Vec::new();
        for item in items {
            for platform in &config.target_platforms {
                match self.generation.draft_for(item, platform).await {
                    Ok(draft) => drafts.push(draft),
                    Err(error) => {
                        tracing::error!(
                            source_row_id = %item.id,
                            platform = %platform,
                            error = %error,
                            "draft generation failed"
                        );
                    }
                }
            }
        }
        drafts
    }

    async fn apply_gate(
        &self,
        run: &mut PipelineRun,
        mut drafts: Vec<ContentDraft>,
    ) -> Result<Vec<ContentDraft>, AppError> {
        let decisions = evaluate_batch(&drafts, &self.gate);
        let mut approved = Vec::new();
        for (draft, decision) in drafts.iter_mut().zip(decisions) {
            match decision.verdict {
                GateVerdict::Approved => {
                    draft.status = DraftStatus::QualityChecked;
                    self.draft_store.update_draft(draft).await?;
                    approved.push(draft.clone());
                }
                GateVerdict::Rejected { reasons } => {
                    tracing::info!(draft_id = %draft.id, ?reasons, "draft gate-rejected");
                    draft.status = DraftStatus::Rejected;
                    draft.quality_details.issues.extend(reasons);
                    self.draft_store.update_draft(draft).await?;
                    run.items_rejected += 1;
                }
            }
        }
        Ok(approved)
    }

    /// Submit and poll a video job for one draft. Provider failures degrade
    /// (fallback provider, then no video) instead of failing the item.
    async fn attach_video(&self, draft: &mut ContentDraft) {
        let Some(primary) = &self.video else { return };
        let prompt = if draft.summary.is_empty() {
            draft.title.clone()
        } else {
            draft.summary.clone()
        };

        let (provider, job_id) = match primary.submit(&prompt).await {
            Ok(job_id) => (primary.clone(), job_id),
            Err(error) => {
                let Some(fallback) = &self.video_fallback else {
                    tracing::warn!(draft_id = %draft.id, error = %error, "video submission failed");
                    return;
                };
                tracing::warn!(
                    draft_id = %draft.id,
                    error = %error,
                    fallback = fallback.name(),
                    "video submission failed, trying fallback provider"
                );
                match fallback.submit(&prompt).await {
                    Ok(job_id) => (fallback.clone(), job_id),
                    Err(fallback_error) => {
                        tracing::warn!(
                            draft_id = %draft.id,
                            error = %fallback_error,
                            "fallback video submission failed"
                        );
                        return;
                    }
                }
            }
        };

        let deadline = tokio::time::Instant::now() + self.publish.video_max_wait;
        loop {
            match provider.poll(&job_id).await {
                Ok(VideoStatus::Completed { url }) => {
                    draft.video_url = Some(url);
                    draft.video_provider = Some(provider.name().to_string());
                    return;
                }
                Ok(VideoStatus::Failed { reason }) => {
                    tracing::warn!(draft_id = %draft.id, %reason, "video generation failed");
                    return;
                }
                Ok(VideoStatus::Pending | VideoStatus::Processing) => {}
                Err(error) => {
                    tracing::warn!(draft_id = %draft.id, error = %error, "video poll failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(draft_id = %draft.id, job_id = %job_id, "video generation timed out");
                return;
            }
            tokio::time::sleep(self.publish.video_poll_interval).await;
        }
    }

    async fn publish_with_retry(
        &self,
        publisher: Arc<dyn Publisher>,
        draft: &ContentDraft,
    ) -> Result<crate::traits::PublishReceipt, AppError> {
        let max_attempts = self.publish.retry_max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            match publisher.publish(draft).await {
                Ok(receipt) => return Ok(receipt),
                Err(error) => {
                    tracing::warn!(
                        draft_id = %draft.id,
                        attempt,
                        error = %error,
                        "publish attempt failed"
                    );
                    last_error = Some(error);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.publish.retry_delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| AppError::PublishError {
            platform: draft.target_platform.clone(),
            reason: "no attempts made".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{BreakerConfig, GenerationConfig, QueueConfig, ScrapeConfig};
    use crate::coordination::MemoryCoordination;
    use crate::generation::FallbackGenerator;
    use crate::memory::{MemoryDraftStore, MemoryRunStore, MemorySourceStore};
    use crate::testutil::{
        MockAdapter, MockGenerator, MockParser, MockPublisher, MockVideoProvider,
    };
    use crate::traits::{AdapterRegistry, Generator, KeywordCategorizer, Parser, SourceAdapter};

    fn settings() -> PipelineSettings {
        PipelineSettings {
            breaker: BreakerConfig::default(),
            queue: QueueConfig {
                capacity: 16,
                enqueue_timeout: Duration::from_millis(100),
                dequeue_timeout: Duration::from_millis(30),
            },
            scrape: ScrapeConfig {
                worker_count: 2,
                retry_max_attempts: 1,
                retry_base_delay: Duration::from_millis(5),
                collect_timeout: Duration::from_secs(5),
                ..ScrapeConfig::default()
            },
            generation: GenerationConfig {
                self_repair_max_attempts: 0,
                ..GenerationConfig::default()
            },
            publish: PublishConfig {
                retry_max_attempts: 2,
                retry_delay: Duration::from_millis(5),
                video_max_drafts: 5,
                video_poll_interval: Duration::from_millis(5),
                video_max_wait: Duration::from_millis(200),
            },
            ..PipelineSettings::default()
        }
    }

    fn good_generation() -> String {
        serde_json::json!({
            "title": "Why the new toolchain release matters",
            "body": "A practical look at what the latest update changes for day-to-day \
                     development: quicker feedback loops, clearer errors, and fewer \
                     surprises when refactoring large codebases across teams.",
            "summary": "The toolchain update shortens feedback loops.",
            "hashtags": ["devtools"]
        })
        .to_string()
    }

    fn good_parse(source_platform: &str) -> serde_json::Value {
        serde_json::json!({
            "schema_version": "v1",
            "source_platform": source_platform,
            "source_id": "any",
            "title": "Parsed title",
            "summary": "A parsed summary that is comfortably long enough to look like a real model output for confidence purposes.",
            "key_points": ["point one", "point two", "point three"],
            "keywords": ["rust", "release", "tooling", "compiler"],
            "sentiment": "neutral",
            "language": "en",
            "confidence_model": 0.9
        })
    }

    struct Fixture {
        orchestrator: Orchestrator<
            MemoryCoordination,
            MemorySourceStore,
            MemoryDraftStore,
            MemoryRunStore,
        >,
        draft_store: MemoryDraftStore,
        run_store: MemoryRunStore,
        publisher_published: Arc<std::sync::Mutex<Vec<ContentDraft>>>,
    }

    fn fixture(
        adapter: MockAdapter,
        generator_responses: Vec<Result<String, AppError>>,
        publisher: MockPublisher,
        video: Option<Arc<dyn VideoProvider>>,
        video_fallback: Option<Arc<dyn VideoProvider>>,
    ) -> Fixture {
        let settings = settings();
        let source_store = MemorySourceStore::new();
        let draft_store = MemoryDraftStore::new();
        let run_store = MemoryRunStore::new();
        let coordination =
            MemoryCoordination::new(settings.breaker.clone(), settings.queue.clone());

        let mut adapters = AdapterRegistry::new();
        let platform = adapter.platform().to_string();
        adapters.register(Arc::new(adapter));

        let coordinator = ScrapeCoordinator::new(
            coordination,
            source_store.clone(),
            adapters,
            &settings,
        );
        let parser =
            MockParser::with_responses((0..8).map(|_| Ok(good_parse(&platform))).collect());
        let parse_router = ParseRouter::new(
            source_store.clone(),
            Arc::new(parser) as Arc<dyn Parser>,
            settings.parse.clone(),
        );
        let generation = GenerationStage::new(
            FallbackGenerator::new(
                Arc::new(MockGenerator::with_responses("primary", generator_responses))
                    as Arc<dyn Generator>,
                None,
            ),
            draft_store.clone(),
            settings.generation.clone(),
        );

        let publisher_published = publisher.published.clone();
        let mut publishers = PublisherRegistry::new();
        publishers.register(Arc::new(publisher));

        let orchestrator = Orchestrator::new(
            coordinator,
            parse_router,
            generation,
            Arc::new(KeywordCategorizer::new(
                vec![("tech".to_string(), vec!["release".to_string()])],
                "other",
            )),
            publishers,
            video,
            video_fallback,
            draft_store.clone(),
            run_store.clone(),
            &settings,
        );

        Fixture {
            orchestrator,
            draft_store,
            run_store,
            publisher_published,
        }
    }

    fn run_config(source: &str, platform: &str) -> RunConfig {
        RunConfig {
            sources: vec![source.to_string()],
            target_platforms: vec![platform.to_string()],
            max_items: 10,
            ..RunConfig::default()
        }
    }

    #[tokio::test]
    async fn test_happy_path_end_to_end() {
        let adapter = MockAdapter::new("weibo").with_items(vec![MockAdapter::item(
            "weibo",
            "post-1",
            "toolchain release announcement",
            100.0,
        )]);
        let fixture = fixture(
            adapter,
            vec![Ok(good_generation())],
            MockPublisher::new("wechat"),
            None,
            None,
        );

        let cancel = CancellationToken::new();
        let workers = fixture.orchestrator.spawn_workers(cancel.clone());

        let run_id = fixture
            .orchestrator
            .run_pipeline(TriggerType::Manual, run_config("weibo", "wechat"))
            .await
            .unwrap();

        let run = fixture.run_store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.items_scraped, 1);
        assert_eq!(run.items_published, 1);
        assert_eq!(run.items_rejected, 0);
        assert!(run.finished_at.is_some());
        assert_eq!(
            run.stage_history,
            vec![
                PipelineStage::Scraping,
                PipelineStage::Categorizing,
                PipelineStage::Summarizing,
                PipelineStage::QualityChecking,
                PipelineStage::Publishing,
                PipelineStage::Completed,
            ]
        );

        let published = fixture.publisher_published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].target_platform, "wechat");

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_category_filter_drops_unmatched_items() {
        let adapter = MockAdapter::new("weibo").with_items(vec![MockAdapter::item(
            "weibo",
            "post-1",
            "cooking trends nobody expected",
            50.0,
        )]);
        let fixture = fixture(
            adapter,
            vec![Ok(good_generation())],
            MockPublisher::new("wechat"),
            None,
            None,
        );

        let cancel = CancellationToken::new();
        let workers = fixture.orchestrator.spawn_workers(cancel.clone());

        let mut config = run_config("weibo", "wechat");
        config.category_filter = vec!["tech".to_string()];
        let run_id = fixture
            .orchestrator
            .run_pipeline(TriggerType::Manual, config)
            .await
            .unwrap();

        let run = fixture.run_store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.items_scraped, 1);
        assert_eq!(run.items_published, 0);
        assert_eq!(fixture.draft_store.draft_count(), 0);

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_gate_rejection_keeps_draft_unpublished() {
        let adapter = MockAdapter::new("weibo").with_items(vec![MockAdapter::item(
            "weibo",
            "post-1",
            "toolchain release announcement",
            100.0,
        )]);
        // Body far below the minimum length: generation marks it rejected and
        // the gate never approves it.
        let thin = serde_json::json!({
            "title": "Too thin",
            "body": "tiny",
            "summary": "tiny",
            "hashtags": []
        })
        .to_string();
        let fixture = fixture(
            adapter,
            vec![Ok(thin)],
            MockPublisher::new("wechat"),
            None,
            None,
        );

        let cancel = CancellationToken::new();
        let workers = fixture.orchestrator.spawn_workers(cancel.clone());

        let run_id = fixture
            .orchestrator
            .run_pipeline(TriggerType::Manual, run_config("weibo", "wechat"))
            .await
            .unwrap();

        let run = fixture.run_store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.items_published, 0);
        assert_eq!(run.items_rejected, 1);
        assert!(fixture.publisher_published.lock().unwrap().is_empty());

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_video_stage_entered_only_when_requested() {
        let adapter = MockAdapter::new("weibo").with_items(vec![MockAdapter::item(
            "weibo",
            "post-1",
            "toolchain release announcement",
            100.0,
        )]);
        let video = MockVideoProvider::new(
            "mockvid",
            vec![
                VideoStatus::Processing,
                VideoStatus::Completed {
                    url: "https://video.example/1.mp4".to_string(),
                },
            ],
        );
        let fixture = fixture(
            adapter,
            vec![Ok(good_generation())],
            MockPublisher::new("wechat"),
            Some(Arc::new(video)),
            None,
        );

        let cancel = CancellationToken::new();
        let workers = fixture.orchestrator.spawn_workers(cancel.clone());

        let mut config = run_config("weibo", "wechat");
        config.generate_video = true;
        let run_id = fixture
            .orchestrator
            .run_pipeline(TriggerType::Manual, config)
            .await
            .unwrap();

        let run = fixture.run_store.get_run(run_id).await.unwrap().unwrap();
        assert!(run.stage_history.contains(&PipelineStage::VideoGenerating));

        let published = fixture.publisher_published.lock().unwrap();
        assert_eq!(
            published[0].video_url.as_deref(),
            Some("https://video.example/1.mp4")
        );
        assert_eq!(published[0].video_provider.as_deref(), Some("mockvid"));

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_video_stage_skipped_when_not_requested() {
        let adapter = MockAdapter::new("weibo").with_items(vec![MockAdapter::item(
            "weibo",
            "post-1",
            "toolchain release announcement",
            100.0,
        )]);
        let video = MockVideoProvider::new("mockvid", vec![]);
        let fixture = fixture(
            adapter,
            vec![Ok(good_generation())],
            MockPublisher::new("wechat"),
            Some(Arc::new(video)),
            None,
        );

        let cancel = CancellationToken::new();
        let workers = fixture.orchestrator.spawn_workers(cancel.clone());

        let run_id = fixture
            .orchestrator
            .run_pipeline(TriggerType::Manual, run_config("weibo", "wechat"))
            .await
            .unwrap();

        let run = fixture.run_store.get_run(run_id).await.unwrap().unwrap();
        assert!(!run.stage_history.contains(&PipelineStage::VideoGenerating));

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_video_submit_failure_falls_back_to_secondary_provider() {
        let adapter = MockAdapter::new("weibo").with_items(vec![MockAdapter::item(
            "weibo",
            "post-1",
            "toolchain release announcement",
            100.0,
        )]);
        let fallback = MockVideoProvider::new(
            "backupvid",
            vec![VideoStatus::Completed {
                url: "https://backup.example/1.mp4".to_string(),
            }],
        );
        let fixture = fixture(
            adapter,
            vec![Ok(good_generation())],
            MockPublisher::new("wechat"),
            Some(Arc::new(MockVideoProvider::submit_failing("brokenvid"))),
            Some(Arc::new(fallback)),
        );

        let cancel = CancellationToken::new();
        let workers = fixture.orchestrator.spawn_workers(cancel.clone());

        let mut config = run_config("weibo", "wechat");
        config.generate_video = true;
        fixture
            .orchestrator
            .run_pipeline(TriggerType::Manual, config)
            .await
            .unwrap();

        let published = fixture.publisher_published.lock().unwrap();
        assert_eq!(published[0].video_provider.as_deref(), Some("backupvid"));

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_publish_retries_then_succeeds() {
        let adapter = MockAdapter::new("weibo").with_items(vec![MockAdapter::item(
            "weibo",
            "post-1",
            "toolchain release announcement",
            100.0,
        )]);
        let publisher = MockPublisher::new("wechat").failing_first(1);
        let calls = publisher.calls.clone();
        let fixture = fixture(adapter, vec![Ok(good_generation())], publisher, None, None);

        let cancel = CancellationToken::new();
        let workers = fixture.orchestrator.spawn_workers(cancel.clone());

        let run_id = fixture
            .orchestrator
            .run_pipeline(TriggerType::Manual, run_config("weibo", "wechat"))
            .await
            .unwrap();

        let run = fixture.run_store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.items_published, 1);
        assert_eq!(*calls.lock().unwrap(), 2);

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_publish_exhaustion_leaves_draft_quality_checked() {
        let adapter = MockAdapter::new("weibo").with_items(vec![MockAdapter::item(
            "weibo",
            "post-1",
            "toolchain release announcement",
            100.0,
        )]);
        // retry_max_attempts is 2 in the fixture settings.
        let publisher = MockPublisher::new("wechat").failing_first(5);
        let fixture = fixture(adapter, vec![Ok(good_generation())], publisher, None, None);

        let cancel = CancellationToken::new();
        let workers = fixture.orchestrator.spawn_workers(cancel.clone());

        let run_id = fixture
            .orchestrator
            .run_pipeline(TriggerType::Manual, run_config("weibo", "wechat"))
            .await
            .unwrap();

        let run = fixture.run_store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed, "publish failure is per-item");
        assert_eq!(run.items_published, 0);

        // The draft keeps its pre-publish status rather than being deleted.
        let drafts = fixture.draft_store.drafts_snapshot();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].status, DraftStatus::QualityChecked);

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }
}
