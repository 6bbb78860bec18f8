//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use showrunner_core::chapters::format_timestamp;
use showrunner_core::pipeline::{self, PipelineContext, PipelineSettings, ProgressReporter, checkpoint};
use showrunner_core::publish::{self, OutboxPublisher, Publisher};
use showrunner_core::{DirectoryAssetProvider, FfmpegRenderer, RenderSettings};
use showrunner_corpus::{Bm25Params, IndexedCorpus, load_jsonl};
use showrunner_providers::{ElevenLabsClient, OpenAiCompatibleClient};
use showrunner_shared::{
    AppConfig, Episode, EpisodeSpec, Stage, expand_home, init_config, load_config,
};
use showrunner_storage::{CacheKind, Storage};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Showrunner - weekly scripture study episodes from a commentary corpus.
#[derive(Parser)]
#[command(
    name = "showrunner",
    version,
    about = "Generate narrated scripture study episodes grounded in a document corpus.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Produce (or resume) the episode described by a spec file.
    Run {
        /// Episode spec (TOML).
        #[arg(long)]
        spec: PathBuf,

        /// Corpus file (JSON Lines).
        #[arg(long)]
        corpus: PathBuf,

        /// Directory of `segment_{i}` visuals (defaults to the configured
        /// `visuals_dir` next to the spec file).
        #[arg(long)]
        visuals: Option<PathBuf>,

        /// Place the finished episode in the publisher outbox.
        #[arg(long)]
        publish: bool,
    },

    /// Query the corpus index.
    Search {
        /// Corpus file (JSON Lines).
        #[arg(long)]
        corpus: PathBuf,

        /// Free-text query.
        query: String,

        /// Number of hits to show (defaults to `retrieval.top_k`).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Show the persisted state of the run for a spec.
    Status {
        /// Episode spec (TOML).
        #[arg(long)]
        spec: PathBuf,

        /// Corpus file (JSON Lines).
        #[arg(long)]
        corpus: PathBuf,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "showrunner=info",
        1 => "showrunner=debug",
        _ => "showrunner=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            spec,
            corpus,
            visuals,
            publish,
        } => cmd_run(&spec, &corpus, visuals.as_deref(), publish).await,
        Command::Search {
            corpus,
            query,
            top_k,
        } => cmd_search(&corpus, &query, top_k).await,
        Command::Status { spec, corpus } => cmd_status(&spec, &corpus).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared loading
// ---------------------------------------------------------------------------

fn load_spec(path: &Path) -> Result<EpisodeSpec> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read spec {}", path.display()))?;
    let spec: EpisodeSpec =
        toml::from_str(&content).wrap_err_with(|| format!("invalid spec {}", path.display()))?;
    spec.validate()?;
    Ok(spec)
}

fn load_index(path: &Path, config: &AppConfig) -> Result<IndexedCorpus> {
    let documents = load_jsonl(path)?;
    let params = Bm25Params {
        k1: config.retrieval.k1,
        b: config.retrieval.b,
    };
    let index = IndexedCorpus::build(documents, params)?;
    info!(
        documents = index.len(),
        version = %&index.version()[..16],
        "corpus indexed"
    );
    Ok(index)
}

fn database_path(config: &AppConfig) -> Result<PathBuf> {
    Ok(expand_home(&config.defaults.database)?)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(
    spec_path: &Path,
    corpus_path: &Path,
    visuals_dir: Option<&Path>,
    publish: bool,
) -> Result<()> {
    let config = load_config()?;
    let spec = load_spec(spec_path)?;
    let index = load_index(corpus_path, &config)?;

    // Resolve API keys before doing anything
    let model = OpenAiCompatibleClient::from_config(&config)?;
    let tts = ElevenLabsClient::from_config(&config)?;

    let storage = Storage::open(&database_path(&config)?).await?;
    let renderer = FfmpegRenderer::new(RenderSettings::from(&config.assembly));

    let visuals_dir = match visuals_dir {
        Some(dir) => dir.to_path_buf(),
        None => spec_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&config.assembly.visuals_dir),
    };
    let background = config
        .assembly
        .background
        .as_deref()
        .map(expand_home)
        .transpose()?;
    let visuals = DirectoryAssetProvider::new(visuals_dir, background);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current unit of work");
            on_interrupt.cancel();
        }
    });

    info!(episode = %spec.episode_id, topic = %spec.topic, "producing episode");

    let reporter = CliProgress::new();
    let ctx = PipelineContext {
        storage: &storage,
        model: &model,
        tts: &tts,
        renderer: &renderer,
        visuals: &visuals,
        settings: PipelineSettings::from_config(&config)?,
        cancel,
        progress: &reporter,
    };

    let episode = match ctx.run_episode(&spec, &index).await {
        Ok(episode) => episode,
        Err(e) => {
            reporter.abandon();
            return Err(e.into());
        }
    };

    print_episode(&episode);

    if publish {
        let metadata = publish::build_metadata(
            &spec,
            &episode,
            &config.publisher.tags,
            config.publisher.publish_hour_utc,
            Utc::now(),
        );
        let publisher = OutboxPublisher::new(expand_home(&config.publisher.outbox_dir)?);
        let confirmation = publisher.publish(&episode, &metadata).await?;
        println!("  Published: {}", confirmation.location);
        println!("  Goes live: {}", confirmation.publish_at.to_rfc3339());
        println!();
    }

    Ok(())
}

fn print_episode(episode: &Episode) {
    println!();
    println!("  Episode ready!");
    println!("  ID:       {}", episode.episode_id);
    println!("  Title:    {}", episode.title);
    println!("  Duration: {}", format_timestamp(episode.duration_ms));
    println!("  Path:     {}", episode.artifact_path.display());
    println!("  SHA-256:  {}", episode.artifact_sha256);
    if let Some(transcript) = &episode.transcript_path {
        println!("  Transcript: {}", transcript.display());
    }
    println!();
    for chapter in &episode.chapters {
        println!("    {} - {}", format_timestamp(chapter.start_ms), chapter.title);
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn abandon(&self) {
        self.spinner.abandon();
    }
}

fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Retrieving => "Retrieving sources",
        Stage::Generating => "Writing script",
        Stage::Synthesizing => "Synthesizing narration",
        Stage::Assembling => "Rendering episode",
    }
}

impl ProgressReporter for CliProgress {
    fn stage(&self, stage: Stage) {
        self.spinner.set_message(stage_label(stage).to_string());
    }

    fn resumed(&self, stage: Stage) {
        self.spinner
            .set_message(format!("{} (from checkpoint)", stage_label(stage)));
    }

    fn unit_done(&self, stage: Stage, current: usize, total: usize) {
        self.spinner
            .set_message(format!("{} [{current}/{total}]", stage_label(stage)));
    }

    fn done(&self, _episode: &Episode) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// search
// ---------------------------------------------------------------------------

async fn cmd_search(corpus_path: &Path, query: &str, top_k: Option<usize>) -> Result<()> {
    let config = load_config()?;
    let index = load_index(corpus_path, &config)?;
    let top_k = top_k.unwrap_or(config.retrieval.top_k);

    let hits = index.search(query, top_k)?;
    println!();
    for (rank, hit) in hits.iter().enumerate() {
        let title = index
            .document(&hit.document_id)
            .map(|d| d.title.as_str())
            .unwrap_or("");
        println!("  {:>2}. {:>8.4}  [{}] {title}", rank + 1, hit.score, hit.document_id);
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(spec_path: &Path, corpus_path: &Path) -> Result<()> {
    let config = load_config()?;
    let spec = load_spec(spec_path)?;
    let index = load_index(corpus_path, &config)?;

    let db = database_path(&config)?;
    if !db.exists() {
        return Err(eyre!("no database at {}; nothing has run yet", db.display()));
    }
    let storage = Storage::open_readonly(&db).await?;

    let settings = PipelineSettings::from_config(&config)?;
    let key = pipeline::run_key(&spec, index.version(), &config.llm.model, &settings)?;

    println!();
    println!("  Episode: {}", spec.episode_id);
    println!("  Run key: {}", &key[..16]);

    match storage.get_run(&key).await? {
        Some(run) => {
            println!("  State:   {}", run.state);
            println!("  Updated: {}", run.updated_at);
            if let Some(error) = &run.last_error {
                println!("  Error:   {error}");
            }
            let names = storage.list_checkpoints(&key).await?;
            println!("  Checkpoints: {}", names.join(", "));
            if let Some(done) = storage
                .load_checkpoint::<Vec<usize>>(&key, checkpoint::AUDIO_PROGRESS)
                .await?
            {
                println!("  Narrated segments before failure: {done:?}");
            }
        }
        None => println!("  State:   not started"),
    }

    let scripts = storage.count_cache_entries(CacheKind::Script).await?;
    let clips = storage.count_cache_entries(CacheKind::Audio).await?;
    println!("  Cache:   {scripts} scripts, {clips} audio clips");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
