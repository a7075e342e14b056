mod feed;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use boreas_client::{ChatGenerator, LlmParser};
use boreas_core::config::PipelineSettings;
use boreas_core::coordination::MemoryCoordination;
use boreas_core::draft::ContentDraft;
use boreas_core::error::AppError;
use boreas_core::generation::{FallbackGenerator, GenerationStage};
use boreas_core::memory::{MemoryDraftStore, MemoryRunStore, MemorySourceStore};
use boreas_core::parse::{HeuristicParser, ParseRouter};
use boreas_core::pipeline::Orchestrator;
use boreas_core::coordinator::ScrapeCoordinator;
use boreas_core::run::{RunConfig, TriggerType};
use boreas_core::traits::{
    AdapterRegistry, DraftStore, Generator, KeywordCategorizer, Parser as SourceParser,
    PublishReceipt, Publisher, PublisherRegistry, RunStore, SourceStore,
};
use boreas_db::{Database, DatabaseConfig};
use feed::FeedFileAdapter;

#[derive(Parser)]
#[command(name = "boreas", version, about = "Trend-to-content pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once over JSON feed files
    Run {
        /// Feed files as platform=path pairs (repeatable)
        #[arg(long = "feed", value_parser = parse_feed_arg, required = true)]
        feeds: Vec<(String, PathBuf)>,

        /// Target platforms to draft for
        #[arg(long = "platform", required = true)]
        platforms: Vec<String>,

        /// Keep only items in these categories
        #[arg(long = "category")]
        categories: Vec<String>,

        /// Maximum items per run
        #[arg(long, default_value_t = 20)]
        max_items: usize,

        /// Persist to PostgreSQL (DATABASE_URL) instead of in-memory stores
        #[arg(long, default_value_t = false)]
        persist: bool,

        /// OpenAI-compatible API base URL for generation
        #[arg(long, env = "BOREAS_LLM_BASE_URL")]
        llm_base_url: Option<String>,

        /// API key for the LLM backend
        #[arg(long, env = "BOREAS_LLM_API_KEY")]
        llm_api_key: Option<String>,

        /// Model name for the primary generator
        #[arg(long, env = "BOREAS_LLM_MODEL", default_value = "gpt-4o-mini")]
        llm_model: String,

        /// Fallback model name (same backend)
        #[arg(long, env = "BOREAS_LLM_FALLBACK_MODEL")]
        llm_fallback_model: Option<String>,
    },

    /// Show a pipeline run
    ShowRun {
        #[arg(long)]
        id: Uuid,
    },

    /// List parse dead letters
    DlqList {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Replay a parse dead letter
    DlqReplay {
        #[arg(long)]
        id: Uuid,
    },

    /// List a draft's version history
    Versions {
        #[arg(long)]
        draft_id: Uuid,
    },

    /// Roll a draft back to an earlier version
    Rollback {
        #[arg(long)]
        draft_id: Uuid,

        #[arg(long)]
        version: u32,
    },

    /// List scrape schedules
    Schedules,

    /// Enable or disable a schedule
    ScheduleEnable {
        #[arg(long)]
        id: Uuid,

        #[arg(long)]
        enabled: bool,
    },

    /// Update a schedule's scrape strategy fields
    ScheduleStrategy {
        #[arg(long)]
        id: Uuid,

        #[arg(long)]
        query: Option<String>,

        #[arg(long)]
        capture_mode: Option<String>,

        #[arg(long)]
        sort_strategy: Option<String>,
    },
}

fn parse_feed_arg(raw: &str) -> Result<(String, PathBuf), String> {
    let (platform, path) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected platform=path, got '{raw}'"))?;
    if platform.is_empty() || path.is_empty() {
        return Err(format!("expected platform=path, got '{raw}'"));
    }
    Ok((platform.to_string(), PathBuf::from(path)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("boreas=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            feeds,
            platforms,
            categories,
            max_items,
            persist,
            llm_base_url,
            llm_api_key,
            llm_model,
            llm_fallback_model,
        } => {
            let config = RunConfig {
                sources: feeds.iter().map(|(platform, _)| platform.clone()).collect(),
                target_platforms: platforms,
                category_filter: categories,
                max_items,
                ..RunConfig::default()
            };
            let llm = LlmArgs {
                base_url: llm_base_url,
                api_key: llm_api_key,
                model: llm_model,
                fallback_model: llm_fallback_model,
            };
            if persist {
                let db = connect_db().await?;
                db.migrate().await?;
                cmd_run(feeds, config, llm, db.source_repo(), db.draft_repo(), db.run_repo())
                    .await?;
            } else {
                cmd_run(
                    feeds,
                    config,
                    llm,
                    MemorySourceStore::new(),
                    MemoryDraftStore::new(),
                    MemoryRunStore::new(),
                )
                .await?;
            }
        }
        Commands::ShowRun { id } => {
            let db = connect_db().await?;
            let run = db
                .run_repo()
                .get_run(id)
                .await?
                .context("run not found")?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::DlqList { limit } => {
            let db = connect_db().await?;
            let letters = db.source_repo().list_dead_letters(limit).await?;
            for letter in letters {
                println!(
                    "{}  {}  {}/{}  attempts={}  replayed={}  {}",
                    letter.id,
                    letter.error_kind,
                    letter.source_platform,
                    letter.source_id,
                    letter.attempts,
                    letter.replayed_at.is_some(),
                    letter.error_message,
                );
            }
        }
        Commands::DlqReplay { id } => {
            let db = connect_db().await?;
            let router = ParseRouter::new(
                db.source_repo(),
                Arc::new(HeuristicParser) as Arc<dyn SourceParser>,
                PipelineSettings::default().parse,
            );
            let disposition = router.replay_dead_letter(id).await?;
            println!("replayed {id}: {disposition:?}");
        }
        Commands::Versions { draft_id } => {
            let db = connect_db().await?;
            let versions = db.draft_repo().list_versions(draft_id).await?;
            for version in versions {
                println!(
                    "v{}  {}  model={}  hash={}",
                    version.version_no,
                    version.created_at.to_rfc3339(),
                    version.model,
                    &version.content_hash[..version.content_hash.len().min(12)],
                );
            }
        }
        Commands::Rollback { draft_id, version } => {
            let db = connect_db().await?;
            let generation = GenerationStage::new(
                FallbackGenerator::new(offline_generator(), None),
                db.draft_repo(),
                PipelineSettings::default().generation,
            );
            let draft = generation.rollback(draft_id, version).await?;
            println!(
                "draft {} now at version {} (\"{}\")",
                draft.id, draft.current_version, draft.title
            );
        }
        Commands::Schedules => {
            let db = connect_db().await?;
            for schedule in db.run_repo().list_schedules().await? {
                println!(
                    "{}  {}  [{}]  enabled={}  sources={}",
                    schedule.id,
                    schedule.name,
                    schedule.cron_expression,
                    schedule.enabled,
                    schedule.run.sources.join(","),
                );
            }
        }
        Commands::ScheduleEnable { id, enabled } => {
            let db = connect_db().await?;
            let repo = db.run_repo();
            let mut schedule = repo.get_schedule(id).await?.context("schedule not found")?;
            schedule.enabled = enabled;
            repo.save_schedule(&schedule).await?;
            println!("schedule {} enabled={}", schedule.name, schedule.enabled);
        }
        Commands::ScheduleStrategy {
            id,
            query,
            capture_mode,
            sort_strategy,
        } => {
            let db = connect_db().await?;
            let repo = db.run_repo();
            let mut schedule = repo.get_schedule(id).await?.context("schedule not found")?;
            if let Some(query) = query {
                schedule.run.query = if query.is_empty() { None } else { Some(query) };
            }
            if let Some(mode) = capture_mode {
                schedule.run.capture_mode = mode.parse().map_err(AppError::Generic)?;
            }
            if let Some(strategy) = sort_strategy {
                schedule.run.sort_strategy = strategy.parse().map_err(AppError::Generic)?;
            }
            repo.save_schedule(&schedule).await?;
            println!("schedule {} strategy updated", schedule.name);
        }
    }

    Ok(())
}

struct LlmArgs {
    base_url: Option<String>,
    api_key: Option<String>,
    model: String,
    fallback_model: Option<String>,
}

async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config).await?;
    Ok(db)
}

/// Deterministic generator for offline runs: reshapes the prompt's source
/// block into a draft without calling any model.
fn offline_generator() -> Arc<dyn Generator> {
    struct Offline;

    #[async_trait::async_trait]
    impl Generator for Offline {
        fn backend(&self) -> &str {
            "offline"
        }
        fn model(&self) -> &str {
            "template"
        }
        async fn generate(
            &self,
            prompt: &str,
            _max_tokens: u32,
            _budget: std::time::Duration,
        ) -> Result<String, AppError> {
            let title = prompt
                .lines()
                .find_map(|l| l.strip_prefix("Source title: "))
                .unwrap_or("Untitled")
                .to_string();
            let description = prompt
                .lines()
                .find_map(|l| l.strip_prefix("Source description: "))
                .unwrap_or("")
                .to_string();
            let body = format!(
                "{description} Readers keep coming back to this one, and the discussion \
                 around it says as much about the audience as about the topic itself. \
                 Worth a look before it moves on."
            );
            Ok(serde_json::to_string(&serde_json::json!({
                "title": format!("Trending: {title}"),
                "body": body,
                "summary": description.chars().take(120).collect::<String>(),
                "hashtags": ["trending"],
            }))?)
        }
    }

    Arc::new(Offline)
}

/// Publisher used by CLI runs: prints the draft instead of posting it.
struct StdoutPublisher {
    platform: String,
}

#[async_trait::async_trait]
impl Publisher for StdoutPublisher {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn publish(&self, draft: &ContentDraft) -> Result<PublishReceipt, AppError> {
        println!("--- [{}] {} ---", self.platform, draft.title);
        println!("{}", draft.body);
        if !draft.hashtags.is_empty() {
            println!("tags: {}", draft.hashtags.join(" "));
        }
        Ok(PublishReceipt {
            platform_post_id: format!("stdout-{}", draft.id.simple()),
            platform_url: None,
        })
    }
}

async fn cmd_run<S, D, R>(
    feeds: Vec<(String, PathBuf)>,
    config: RunConfig,
    llm: LlmArgs,
    source_store: S,
    draft_store: D,
    run_store: R,
) -> Result<()>
where
    S: SourceStore + 'static,
    D: DraftStore + 'static,
    R: RunStore + 'static,
{
    let settings = PipelineSettings::default();

    let mut adapters = AdapterRegistry::new();
    for (platform, path) in feeds {
        if !path.exists() {
            bail!("feed file not found: {}", path.display());
        }
        adapters.register(Arc::new(FeedFileAdapter::new(platform, path)));
    }

    // Generators: a real backend when configured, the offline template
    // renderer otherwise.
    let (primary, fallback): (Arc<dyn Generator>, Option<Arc<dyn Generator>>) =
        match (&llm.base_url, &llm.api_key) {
            (Some(base_url), Some(api_key)) => {
                let primary: Arc<dyn Generator> =
                    Arc::new(ChatGenerator::new("primary", base_url, api_key, &llm.model)?);
                let fallback = llm
                    .fallback_model
                    .as_deref()
                    .map(|model| {
                        ChatGenerator::new("fallback", base_url, api_key, model)
                            .map(|g| Arc::new(g) as Arc<dyn Generator>)
                    })
                    .transpose()?;
                (primary, fallback)
            }
            _ => (offline_generator(), None),
        };

    let parser: Arc<dyn SourceParser> = match (&llm.base_url, &llm.api_key) {
        (Some(base_url), Some(api_key)) => Arc::new(LlmParser::new(ChatGenerator::new(
            "parser", base_url, api_key, &llm.model,
        )?)),
        _ => Arc::new(HeuristicParser),
    };

    let coordination =
        MemoryCoordination::new(settings.breaker.clone(), settings.queue.clone());
    let coordinator =
        ScrapeCoordinator::new(coordination, source_store.clone(), adapters, &settings);
    let parse_router = ParseRouter::new(source_store, parser, settings.parse.clone());
    let generation = GenerationStage::new(
        FallbackGenerator::new(primary, fallback),
        draft_store.clone(),
        settings.generation.clone(),
    );

    let mut publishers = PublisherRegistry::new();
    for platform in &config.target_platforms {
        publishers.register(Arc::new(StdoutPublisher {
            platform: platform.clone(),
        }));
    }

    let orchestrator = Orchestrator::new(
        coordinator,
        parse_router,
        generation,
        Arc::new(KeywordCategorizer::new(
            vec![
                ("tech".to_string(), vec!["ai".into(), "rust".into(), "release".into()]),
                ("business".to_string(), vec!["market".into(), "funding".into()]),
            ],
            "other",
        )),
        publishers,
        None,
        None,
        draft_store,
        run_store.clone(),
        &settings,
    );

    let cancel = CancellationToken::new();
    let workers = orchestrator.spawn_workers(cancel.clone());

    let run_id = orchestrator
        .run_pipeline(TriggerType::Manual, config)
        .await?;
    let run = run_store.get_run(run_id).await?.context("run vanished")?;
    println!(
        "run {}: {} (scraped={} published={} rejected={})",
        run.id, run.status, run.items_scraped, run.items_published, run.items_rejected
    );

    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}
