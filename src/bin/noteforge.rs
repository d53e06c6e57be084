//! CLI binary for noteforge.
//!
//! `serve` runs the queue controller with periodic watch-root scans and the
//! HTTP control surface; `convert` converts one document in the foreground
//! with a progress bar.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use noteforge::{
    attribute_subject, convert_document, server, AiClient, ConversionContext, Controller,
    DocumentJob, EdgequakeModel, NoopProgress, PdfiumRenderer, ProgressSink, QuotaTracker,
    RateGovernor, Settings, StateStore, STATE_FILE,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress sink using indicatif ────────────────────────────────────────

/// Percentage bar with activity lines printed above it.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(title: &str) -> Arc<Self> {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix(title.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl ProgressSink for CliProgress {
    fn on_progress(&self, percent: u8) {
        let p = u64::from(percent.min(100));
        if p > self.bar.position() {
            self.bar.set_position(p);
        }
    }

    fn on_message(&self, message: &str) {
        self.bar.println(format!("  {}", dim(message)));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the service on the default port, data in the current folder
  noteforge serve

  # Separate data directory and bind address
  noteforge --data-dir ~/.noteforge serve --bind 0.0.0.0:3001

  # Convert one lecture in the foreground
  noteforge convert input_pdfs/Math/Week1/L1.pdf

ENVIRONMENT VARIABLES:
  NOTEFORGE_DATA_DIR      Folder holding server_config.json, subjects, prompts
  NOTEFORGE_BIND          Listen address for `serve`
  NOTEFORGE_API_KEY       Credential used when the settings file has none
  GEMINI_API_KEY, ...     Provider credential when neither of the above is set
  PDFIUM_LIB_PATH         Path to an existing libpdfium
  RUST_LOG                Overrides --verbose / --quiet
"#;

/// Turn scanned lecture PDFs into note-app bundles using a vision model.
#[derive(Parser, Debug)]
#[command(
    name = "noteforge",
    version,
    about = "Turn scanned lecture PDFs into note-app bundles using a vision model",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Data directory for settings, subjects, prompts and quota state.
    #[arg(long, global = true, env = "NOTEFORGE_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Fallback credential when the settings file has no API key.
    #[arg(long, global = true, env = "NOTEFORGE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "NOTEFORGE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "NOTEFORGE_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the queue controller, watch-root scanner and HTTP control surface.
    Serve {
        /// Listen address.
        #[arg(long, env = "NOTEFORGE_BIND", default_value = "127.0.0.1:3001")]
        bind: String,
    },
    /// Convert a single PDF in the foreground.
    Convert {
        /// Source PDF.
        input: PathBuf,

        /// Subject used to resolve prompts. Default: derived from the path.
        #[arg(long)]
        subject: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
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

    let store = StateStore::open(&cli.data_dir)
        .with_context(|| format!("Failed to open data directory {:?}", cli.data_dir))?;

    let mut settings = store.load_settings();
    let fallback_key = fallback_credential(&settings, cli.api_key.as_deref());
    if !settings.has_credential() {
        if let Some(key) = &fallback_key {
            settings.api_key = key.clone();
        }
    }

    match cli.command {
        Command::Serve { bind } => serve(store, settings, &bind).await,
        Command::Convert { input, subject } => {
            convert_one(store, settings, input, subject, cli.quiet).await
        }
    }
}

/// Credential used when the settings file has none: `--api-key` /
/// `NOTEFORGE_API_KEY`, else the provider's own variable (`GEMINI_API_KEY`).
fn fallback_credential(settings: &Settings, cli_key: Option<&str>) -> Option<String> {
    cli_key
        .map(str::to_string)
        .or_else(|| std::env::var(settings.credential_env_var()).ok())
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

async fn serve(store: StateStore, settings: Settings, bind: &str) -> Result<()> {
    let model = Arc::new(EdgequakeModel::new(settings.provider_name.clone()));
    let controller = Controller::new(store, model, Arc::new(PdfiumRenderer::new()));
    controller.use_fallback_credential(&settings.api_key);

    info!("Watching: {:?}", settings.watched_folders);
    info!("Output: {}", settings.output_folder.display());

    let scanner = controller.clone();
    tokio::spawn(async move {
        loop {
            let queued = scanner.rescan();
            if queued > 0 {
                info!("Scan queued {queued} new document(s)");
            }
            let secs = scanner.settings().scan_interval_secs.max(1);
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
    });

    server::serve(controller, bind)
        .await
        .with_context(|| format!("Server on {bind} failed"))
}

async fn convert_one(
    store: StateStore,
    settings: Settings,
    input: PathBuf,
    subject: Option<String>,
    quiet: bool,
) -> Result<()> {
    if !settings.has_credential() {
        bail!("API key missing: set apiKey in the settings or NOTEFORGE_API_KEY");
    }
    let attribution = attribute_subject(&input, &settings.watched_folders);
    let job = DocumentJob {
        source: input.clone(),
        relative_folder: attribution.relative_folder,
        subject: subject.unwrap_or(attribution.subject),
    };

    let settings = Arc::new(settings);
    let resolved = store.resolve_subject(&job.subject, &store.load_subjects(), &settings);
    let model = Arc::new(EdgequakeModel::new(settings.provider_name.clone()));
    let quota = Arc::new(QuotaTracker::load(store.path(STATE_FILE)));
    let client = AiClient::new(model, Arc::new(RateGovernor::new()), quota, Arc::clone(&settings));

    let bar = (!quiet).then(|| CliProgress::new(&job.title()));
    let progress: Arc<dyn ProgressSink> = match &bar {
        Some(b) => Arc::clone(b) as Arc<dyn ProgressSink>,
        None => Arc::new(NoopProgress),
    };
    let ctx = ConversionContext {
        settings,
        subject: resolved,
        renderer: Arc::new(PdfiumRenderer::new()),
        client,
        progress,
    };

    let result = convert_document(&ctx, &job).await;
    if let Some(b) = &bar {
        b.bar.finish_and_clear();
    }
    let report = result.with_context(|| format!("Conversion of {} failed", input.display()))?;

    if !quiet {
        eprintln!(
            "{}  {} pages  {} drawings  {} images  {}ms  →  {}",
            green("✔"),
            report.pages,
            report.drawings,
            report.rasters,
            report.duration_ms,
            bold(&report.output.display().to_string()),
        );
        eprintln!(
            "   {} calls  /  {} tokens in  /  {} tokens out",
            dim(&report.calls.to_string()),
            dim(&report.input_tokens.to_string()),
            dim(&report.output_tokens.to_string()),
        );
    }
    Ok(())
}
