//! CLI binary for edgequake-pdfvision.
//!
//! A thin shim over the library crate: it wires the local substrate
//! (directory object store, JSON run table, in-process queue) to the
//! pipeline, maps flags onto `PipelineConfig`, and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_pdfvision::{
    Dispatcher, EventQueue, FailurePolicy, FileRunStore, InboxWatcher, LocalObjectStore, MemoryQueue,
    ModelInferStage, ObjectStore, Orchestrator, PdfExtractStage, PdfiumReader,
    PipelineConfig, ProviderVisionModel, PipelineObserver, PipelineRun, ProgressObserver, RetryPolicy,
    RunId, RunIdStrategy, RunStatus, RunStore, StoreResultSink, UploadClient, UploadEvent,
    Worker, WorkerSummary,
};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress observer using indicatif ────────────────────────────────────

/// Terminal observer: one bar counting described images across all runs,
/// plus a log line per run and per failed image. Runs extract at different
/// times, so the bar length grows as each extraction reports its count.
struct CliObserver {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} images  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(style);
        bar.set_prefix("Describing");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
        let failed = self.errors.load(Ordering::SeqCst);
        if failed > 0 {
            eprintln!("{} {} image(s) could not be described", cyan("⚠"), red(&failed.to_string()));
        }
    }
}

impl PipelineObserver for CliObserver {
    fn on_run_start(&self, run_id: &str) {
        self.bar
            .println(format!("{} {}", cyan("◆"), bold(&format!("{run_id}: extracting…"))));
    }

    fn on_extracted(&self, run_id: &str, image_count: usize) {
        self.bar.inc_length(image_count as u64);
        self.bar.println(format!(
            "  {} {}",
            dim(run_id),
            dim(&format!("{image_count} image(s) found"))
        ));
    }

    fn on_image_complete(&self, run_id: &str, page: usize, image: usize, len: usize) {
        self.bar.set_message(format!("{run_id} p{} #{}", page + 1, image + 1));
        self.bar.inc(1);
        tracing::debug!("{run_id}: page {} image {} → {len} chars", page + 1, image + 1);
    }

    fn on_image_error(&self, run_id: &str, page: usize, image: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {} page {} image {}  {}",
            red("✗"),
            run_id,
            page + 1,
            image + 1,
            red(&msg)
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, run: &PipelineRun) {
        let secs = run.duration_ms().unwrap_or(0) as f64 / 1000.0;
        let line = match run.status {
            RunStatus::Succeeded => format!(
                "{} {}  {}",
                green("✔"),
                bold(run.run_id.as_str()),
                dim(&format!("{secs:.1}s"))
            ),
            _ => format!(
                "{} {}  {}",
                red("✘"),
                bold(run.run_id.as_str()),
                red(run.error.as_deref().unwrap_or("failed"))
            ),
        };
        self.bar.println(line);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Describe every image in two local PDFs
  pdfvision process report.pdf slides.pdf

  # Same, printing the aggregated JSON outputs
  pdfvision process --json report.pdf > outputs.json

  # Keep watching the upload bucket for new PDFs
  pdfvision watch --data-dir ./pdfvision-data

  # Show all runs, or one run
  pdfvision status
  pdfvision status report.pdf

  # Upload through the two-step credential protocol
  pdfvision upload report.pdf --api-url https://api.example.com/prod

LOCAL LAYOUT (under --data-dir):
  objects/uploads/<key>                  uploaded PDFs
  objects/images/<run>/page-NNNN/...     extracted images
  objects/results/outputs/<run>.json     aggregated outputs
  objects/results/failures/<run>.json    failure records
  runs.json                              run-status table

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  PDFVISION_PROVIDER      Provider name (openai, anthropic, gemini, ollama, azure)
  PDFVISION_MODEL         Override model ID
  EDGEQUAKE_LLM_PROVIDER  Provider used with EDGEQUAKE_MODEL when no flag is set
  PDFVISION_DATA_DIR      Local data directory
  PDFIUM_LIB_PATH         Directory containing libpdfium
  RUST_LOG                Log filter (overrides --verbose / --quiet)
"#;

/// Describe images embedded in PDF documents with a vision model.
#[derive(Parser, Debug)]
#[command(
    name = "pdfvision",
    version,
    about = "Describe images embedded in PDF documents using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Local data directory (object store root and run table).
    #[arg(long, global = true, env = "PDFVISION_DATA_DIR", default_value = "./pdfvision-data")]
    data_dir: PathBuf,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDFVISION_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDFVISION_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process local PDF files and wait until every run is terminal.
    Process {
        /// PDF files to process.
        #[arg(required = true)]
        pdfs: Vec<PathBuf>,

        /// Print aggregated outputs as JSON on stdout.
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Watch the upload bucket and process new PDFs until Ctrl-C.
    Watch {
        /// Bucket scan interval in milliseconds.
        #[arg(long, env = "PDFVISION_WATCH_INTERVAL_MS", default_value_t = 2000)]
        interval_ms: u64,

        /// Also process PDFs already in the bucket at startup.
        #[arg(long)]
        include_existing: bool,

        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Show run status from the run table.
    Status {
        /// Run id; all runs when omitted.
        run_id: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Upload a PDF through the credential issuer.
    Upload {
        pdf: PathBuf,

        /// Base URL of the credential issuer API.
        #[arg(long, env = "PDFVISION_API_URL")]
        api_url: String,
    },
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Vision model ID (default: gpt-4.1-nano).
    #[arg(long, env = "PDFVISION_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(
        long,
        env = "PDFVISION_PROVIDER",
        long_help = "LLM provider. Auto-detected from API key env vars if not set.\n\
          Supported: openai, anthropic, gemini, azure, ollama."
    )]
    provider: Option<String>,

    /// Concurrent model calls per run.
    #[arg(short, long, env = "PDFVISION_CONCURRENCY", default_value_t = 8)]
    concurrency: usize,

    /// Runs executing at once.
    #[arg(long, env = "PDFVISION_MAX_RUNS", default_value_t = 4)]
    max_runs: usize,

    /// What a failed image does to its run.
    #[arg(long, env = "PDFVISION_FAILURE_POLICY", value_enum, default_value = "partial")]
    failure_policy: FailurePolicyArg,

    /// How run ids are derived from upload events.
    #[arg(long, env = "PDFVISION_RUN_ID", value_enum, default_value = "key")]
    run_id: RunIdArg,

    /// Attempts per model call.
    #[arg(long, env = "PDFVISION_INFER_ATTEMPTS", default_value_t = 4)]
    infer_attempts: u32,

    /// Per-attempt model call timeout in seconds.
    #[arg(long, env = "PDFVISION_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Max output tokens per image.
    #[arg(long, env = "PDFVISION_MAX_TOKENS", default_value_t = 1024)]
    max_tokens: usize,

    /// Model temperature (0.0–2.0).
    #[arg(long, env = "PDFVISION_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDFVISION_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Path to a text file containing a custom instruction prompt.
    #[arg(long, env = "PDFVISION_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Do not write failure records for failed runs.
    #[arg(long)]
    no_failure_records: bool,

    /// Disable the progress bar.
    #[arg(long, env = "PDFVISION_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum FailurePolicyArg {
    /// Keep going; failed images are recorded in the output.
    Partial,
    /// Fail the run on the first failed image.
    Abort,
}

impl From<FailurePolicyArg> for FailurePolicy {
    fn from(v: FailurePolicyArg) -> Self {
        match v {
            FailurePolicyArg::Partial => FailurePolicy::PartialSuccess,
            FailurePolicyArg::Abort => FailurePolicy::AbortOnImageFailure,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum RunIdArg {
    /// The object key.
    Key,
    /// Object key plus event time; re-uploads start new runs.
    KeyAndTime,
}

impl From<RunIdArg> for RunIdStrategy {
    fn from(v: RunIdArg) -> Self {
        match v {
            RunIdArg::Key => RunIdStrategy::ObjectKey,
            RunIdArg::KeyAndTime => RunIdStrategy::KeyAndEventTime,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the feedback that matters; INFO logs would
    // tear it, so they are only shown when the bar is off.
    let bar_active = match &cli.command {
        Command::Process { json, pipeline, .. } => !cli.quiet && !pipeline.no_progress && !json,
        Command::Watch { pipeline, .. } => !cli.quiet && !pipeline.no_progress,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || bar_active {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Process {
            pdfs,
            json,
            pipeline,
        } => process(&cli, pdfs, *json, pipeline, bar_active).await,
        Command::Watch {
            interval_ms,
            include_existing,
            pipeline,
        } => watch_inbox(&cli, *interval_ms, *include_existing, pipeline, bar_active).await,
        Command::Status { run_id, json } => status(&cli, run_id.as_deref(), *json).await,
        Command::Upload { pdf, api_url } => upload(&cli, pdf, api_url).await,
    }
}

// ── Wiring ───────────────────────────────────────────────────────────────

struct Local {
    config: Arc<PipelineConfig>,
    objects: Arc<LocalObjectStore>,
    queue: Arc<MemoryQueue>,
    sink: Arc<StoreResultSink>,
    dispatcher: Dispatcher,
}

async fn wire(cli: &Cli, args: &PipelineArgs, observer: Option<ProgressObserver>) -> Result<Local> {
    let config = Arc::new(build_config(args, observer).await?);

    let objects = Arc::new(LocalObjectStore::new(cli.data_dir.join("objects")));
    let runs: Arc<dyn RunStore> = Arc::new(
        FileRunStore::open(cli.data_dir.join("runs.json"))
            .await
            .context("Failed to open run table")?,
    );
    let queue = Arc::new(MemoryQueue::new(config.visibility_timeout()));
    let model = Arc::new(ProviderVisionModel::from_config(&config).context("Invalid model settings")?);
    let sink = Arc::new(StoreResultSink::new(objects.clone(), &config));

    let orchestrator = Orchestrator::new(
        Arc::clone(&config),
        runs,
        Arc::new(PdfExtractStage::new(
            objects.clone(),
            Arc::new(PdfiumReader::new()),
            &config,
        )),
        Arc::new(ModelInferStage::new(objects.clone(), model, Arc::clone(&config))),
        sink.clone(),
    );
    let dispatcher = Dispatcher::new(orchestrator, queue.clone());

    Ok(Local {
        config,
        objects,
        queue,
        sink,
        dispatcher,
    })
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(args: &PipelineArgs, progress: Option<ProgressObserver>) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::builder()
        .infer_concurrency(args.concurrency)
        .max_concurrent_runs(args.max_runs)
        .failure_policy(args.failure_policy.clone().into())
        .run_id_strategy(args.run_id.clone().into())
        .infer_retry(RetryPolicy::new(args.infer_attempts, 500, 8_000))
        .infer_timeout_secs(args.api_timeout)
        .max_tokens(args.max_tokens)
        .temperature(args.temperature)
        .record_failures(!args.no_failure_records);

    if let Some(ref model) = args.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref name) = args.provider {
        builder = builder.provider_name(name.clone());
    }
    if let Some(ref pwd) = args.password {
        builder = builder.pdf_password(pwd.clone());
    }
    if let Some(ref path) = args.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(observer) = progress {
        builder = builder.progress(observer);
    }

    builder.build().context("Invalid configuration")
}

// ── Subcommands ──────────────────────────────────────────────────────────

async fn process(
    cli: &Cli,
    pdfs: &[PathBuf],
    json: bool,
    args: &PipelineArgs,
    show_progress: bool,
) -> Result<()> {
    let observer = show_progress.then(CliObserver::new);
    let local = wire(cli, args, observer.clone().map(|o| o as ProgressObserver)).await?;

    for path in pdfs {
        let key = object_key_for(path)?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        local
            .objects
            .put(&local.config.upload_bucket, &key, bytes)
            .await
            .with_context(|| format!("Failed to store {}", path.display()))?;
        let event = UploadEvent::new(local.config.upload_bucket.clone(), key, Utc::now());
        local.queue.send(event.to_notification()).await?;
    }

    let summary = Worker::new(local.dispatcher)
        .run_until_idle()
        .await
        .context("Worker failed")?;
    if let Some(ref o) = observer {
        o.finish();
    }

    if json {
        let mut outputs = Vec::new();
        for run in summary.runs.iter().filter(|r| r.status == RunStatus::Succeeded) {
            if let Some(output) = local.sink.load(&run.run_id).await? {
                outputs.push(output);
            }
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&outputs).context("Failed to serialise outputs")?
        );
    }

    if !cli.quiet {
        print_summary(&summary, &local.sink, &local.config);
    }
    if summary.failed() > 0 {
        anyhow::bail!("{} run(s) failed", summary.failed());
    }
    Ok(())
}

async fn watch_inbox(
    cli: &Cli,
    interval_ms: u64,
    include_existing: bool,
    args: &PipelineArgs,
    show_progress: bool,
) -> Result<()> {
    let observer = show_progress.then(CliObserver::new);
    let local = wire(cli, args, observer.clone().map(|o| o as ProgressObserver)).await?;

    let mut watcher = InboxWatcher::new(
        local.objects.clone(),
        local.queue.clone(),
        Arc::clone(&local.config),
    );
    if !include_existing {
        watcher.skip_existing().await.context("Failed to list upload bucket")?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher_task = tokio::spawn(watcher.run(Duration::from_millis(interval_ms), shutdown_rx.clone()));
    let worker_task = tokio::spawn(Worker::new(local.dispatcher).run(shutdown_rx));

    if !cli.quiet {
        eprintln!(
            "{} watching {} (Ctrl-C to stop)",
            cyan("◆"),
            bold(&cli.data_dir.join("objects").join(&local.config.upload_bucket).display().to_string())
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    let _ = shutdown_tx.send(true);

    watcher_task.await.context("Watcher task failed")?;
    let summary = worker_task.await.context("Worker task failed")?;
    if let Some(ref o) = observer {
        o.finish();
    }
    if !cli.quiet {
        print_summary(&summary, &local.sink, &local.config);
    }
    Ok(())
}

async fn status(cli: &Cli, run_id: Option<&str>, json: bool) -> Result<()> {
    let store = FileRunStore::open(cli.data_dir.join("runs.json"))
        .await
        .context("Failed to open run table")?;

    let runs = match run_id {
        Some(id) => match store.get(&RunId::new(id)).await? {
            Some(run) => vec![run],
            None => anyhow::bail!("No run with id '{id}'"),
        },
        None => store.list().await?,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&runs).context("Failed to serialise runs")?
        );
        return Ok(());
    }

    if runs.is_empty() {
        println!("No runs recorded in {}", cli.data_dir.display());
        return Ok(());
    }
    for run in &runs {
        let status = match run.status {
            RunStatus::Succeeded => green(&run.status.to_string()),
            RunStatus::Failed => red(&run.status.to_string()),
            _ => cyan(&run.status.to_string()),
        };
        let images = run
            .image_count
            .map(|n| format!("{n} image(s)"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:<22} {:<12} attempt {}  {}",
            run.run_id.as_str(),
            status,
            images,
            run.attempt,
            dim(run.error.as_deref().unwrap_or(""))
        );
    }
    Ok(())
}

async fn upload(cli: &Cli, pdf: &Path, api_url: &str) -> Result<()> {
    let client = UploadClient::new(api_url)?;
    let key = client.upload_file(pdf).await?;
    if !cli.quiet {
        eprintln!(
            "{} uploaded {}{}",
            green("✔"),
            bold(&pdf.display().to_string()),
            key.map(|k| dim(&format!("  → {k}"))).unwrap_or_default()
        );
    }
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn object_key_for(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("'{}' has no usable file name", path.display()))
}

fn print_summary(summary: &WorkerSummary, sink: &StoreResultSink, config: &PipelineConfig) {
    let total = summary.runs.len();
    let failed = summary.failed();
    eprintln!(
        "{}  {}/{} run(s) succeeded",
        if failed == 0 { green("✔") } else { cyan("⚠") },
        bold(&summary.succeeded().to_string()),
        total
    );
    for run in &summary.runs {
        if run.status == RunStatus::Succeeded {
            eprintln!(
                "   {} → {}",
                run.run_id,
                dim(&format!("{}/{}", config.result_bucket, sink.output_key(&run.run_id)))
            );
        } else {
            eprintln!(
                "   {} {}",
                run.run_id,
                red(run.error.as_deref().unwrap_or("failed"))
            );
        }
    }
}
