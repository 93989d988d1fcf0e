//! CLI binary for docmerge.
//!
//! Runs one single-user collection session end to end: every file on the
//! command line is submitted in argument order, the session is finalized and
//! named, and the merged Markdown is written to a file or stdout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use docmerge::{
    BoxError, ChatId, DocumentSeparator, FileStore, IncomingDocument, JobResult, LocalFileStore,
    MergeConfig, MergeService, Notifier, Recipient, UserId,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
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

// ── Console notifier ─────────────────────────────────────────────────────────

/// What the runner delivered, with the artifact read before cleanup.
struct Delivery {
    result: JobResult,
    markdown: Option<String>,
}

/// Prints progress lines under a spinner and hands the single job result
/// back to `main`.
struct ConsoleNotifier {
    bar: Option<ProgressBar>,
    store: Arc<dyn FileStore>,
    done: Mutex<Option<oneshot::Sender<Delivery>>>,
}

impl ConsoleNotifier {
    fn new(store: Arc<dyn FileStore>, show_progress: bool) -> (Arc<Self>, oneshot::Receiver<Delivery>) {
        let bar = show_progress.then(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(
                ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
            );
            bar.set_prefix("Collecting");
            bar.enable_steady_tick(Duration::from_millis(80));
            bar
        });
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                bar,
                store,
                done: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn line(&self, text: String) {
        match &self.bar {
            Some(bar) => bar.println(text),
            None => eprintln!("{text}"),
        }
    }

    fn set_stage(&self, prefix: &'static str, msg: String) {
        if let Some(bar) = &self.bar {
            bar.set_prefix(prefix);
            bar.set_message(msg);
        }
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify_progress(&self, _to: Recipient, text: String) {
        self.set_stage("Merging", text.clone());
        self.line(dim(&text));
    }

    async fn notify_result(&self, _to: Recipient, result: JobResult) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
        // The artifact is deleted once this returns.
        let markdown = match &result {
            JobResult::Delivered { artifact, .. } => match self.store.load(artifact).await {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => {
                    tracing::error!("Could not read merged artifact: {}", e);
                    None
                }
            },
            JobResult::Failed { .. } => None,
        };
        let sender = self.done.lock().ok().and_then(|mut slot| slot.take());
        if let Some(tx) = sender {
            let _ = tx.send(Delivery { result, markdown });
        }
    }

    async fn notify_timeout(&self, _to: Recipient, discarded: usize) {
        self.line(red(&format!("✗ collection timed out, {discarded} files discarded")));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Merge into stdout
  docmerge intro.txt chapter1.fb2 chapter2.epub

  # Merge into a file with a custom title
  docmerge *.docx --name "Collected Papers" -o papers.md

  # Page-break separators, JSON report
  docmerge --separator pagebreak --json a.md b.md > report.json

SUPPORTED FORMATS:
  .md .markdown  passed through unchanged
  .txt           UTF-8 or Windows-1251, one paragraph per line
  .fb2           FictionBook 2 (sections, titles, emphasis)
  .epub          EPUB 2/3 in spine order
  .docx          Word documents (heading styles, bold/italic runs)

ENVIRONMENT VARIABLES:
  RUST_LOG                  tracing filter (overrides --verbose/--quiet)
  DOCMERGE_MAX_FILES        daily per-user file limit
  DOCMERGE_MAX_FILE_SIZE_MB per-file size limit
  DOCMERGE_WORKERS          conversion worker threads
  DOCMERGE_MAX_JOBS         jobs processed at the same time
  DOCMERGE_TIMEOUT_SECS     collection inactivity timeout
  DOCMERGE_STATUS_PAGE_SIZE jobs per status page
  DOCMERGE_MAX_NAME_LEN     longest output name after sanitizing
"#;

/// Merge documents into one Markdown file, in the order given.
#[derive(Parser, Debug)]
#[command(
    name = "docmerge",
    version,
    about = "Merge TXT, FB2, EPUB, DOCX and Markdown files into one Markdown document",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Files to merge, in merge order.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Write Markdown to this file instead of stdout.
    #[arg(short, long, env = "DOCMERGE_OUTPUT")]
    output: Option<PathBuf>,

    /// Base name of the merged document (default: "merged").
    #[arg(long, env = "DOCMERGE_NAME")]
    name: Option<String>,

    /// Separator between documents: hr, pagebreak, comment, or a custom string.
    #[arg(long, env = "DOCMERGE_SEPARATOR", default_value = "hr")]
    separator: String,

    /// Maximum files accepted per user per UTC day.
    #[arg(long, env = "DOCMERGE_MAX_FILES", default_value_t = 30)]
    max_files: u32,

    /// Maximum size of one file in MiB.
    #[arg(long, env = "DOCMERGE_MAX_FILE_SIZE_MB", default_value_t = 15)]
    max_file_size_mb: u64,

    /// Conversion worker threads.
    #[arg(short, long, env = "DOCMERGE_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Leading lines inspected for an existing heading.
    #[arg(long, env = "DOCMERGE_HEADING_WINDOW", default_value_t = 5)]
    heading_window: usize,

    /// Jobs converted and merged at the same time.
    #[arg(long, env = "DOCMERGE_MAX_JOBS", default_value_t = 1)]
    max_jobs: usize,

    /// Seconds of inactivity before a collection is cancelled.
    #[arg(long, env = "DOCMERGE_TIMEOUT_SECS", default_value_t = 300)]
    timeout_secs: u64,

    /// Jobs listed per status page.
    #[arg(long, env = "DOCMERGE_STATUS_PAGE_SIZE", default_value_t = 4)]
    status_page_size: usize,

    /// Longest output name, in characters, after sanitizing.
    #[arg(long, env = "DOCMERGE_MAX_NAME_LEN", default_value_t = 100)]
    max_name_len: usize,

    /// Directory for temporary files (default: a fresh temp dir).
    #[arg(long, env = "DOCMERGE_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Output a JSON report (job result + Markdown) instead of Markdown.
    #[arg(long, env = "DOCMERGE_JSON")]
    json: bool,

    /// Disable the spinner.
    #[arg(long, env = "DOCMERGE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCMERGE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCMERGE_QUIET")]
    quiet: bool,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    result: &'a JobResult,
    rejected: &'a [Rejection],
    markdown: Option<&'a str>,
}

#[derive(Serialize)]
struct Rejection {
    file: String,
    reason: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
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

    // ── Build services ───────────────────────────────────────────────────
    let config = build_config(&cli)?;
    let store: Arc<dyn FileStore> = Arc::new(match &cli.work_dir {
        Some(dir) => LocalFileStore::new(dir)
            .with_context(|| format!("Failed to create work dir {}", dir.display()))?,
        None => LocalFileStore::temporary().context("Failed to create temp dir")?,
    });
    let (notifier, delivered) = ConsoleNotifier::new(store.clone(), show_progress);
    let service = MergeService::new(config, store, notifier.clone());
    let shutdown = CancellationToken::new();
    let runner = service.spawn_runner(shutdown.clone());

    // ── Collect ──────────────────────────────────────────────────────────
    let (chat, user) = (ChatId(0), UserId(0));
    service.sessions.begin(chat, user)?;

    let mut rejected = Vec::new();
    for (seq, path) in cli.files.iter().enumerate() {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        notifier.set_stage("Collecting", file_name.clone());

        let size = match tokio::fs::metadata(path).await {
            Ok(m) => m.len(),
            Err(e) => {
                notifier.line(format!("  {} {}  {}", red("✗"), file_name, red(&e.to_string())));
                rejected.push(Rejection {
                    file: file_name,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        let fetch = {
            let path = path.clone();
            async move { tokio::fs::read(&path).await.map_err(BoxError::from) }
        };
        match service
            .sessions
            .submit_document(chat, user, IncomingDocument::new(&file_name, size, seq as u64), fetch)
            .await
        {
            Ok(doc) => notifier.line(format!(
                "  {} {:<40} {}",
                green("✓"),
                file_name,
                dim(&format!("{} ({} bytes)", doc.format, doc.size_bytes))
            )),
            Err(e) => {
                notifier.line(format!("  {} {}  {}", red("✗"), file_name, red(&e.to_string())));
                rejected.push(Rejection {
                    file: file_name,
                    reason: e.to_string(),
                });
            }
        }
    }

    let accepted = match service.sessions.finalize(chat, user) {
        Ok(n) => n,
        Err(e) => {
            service.sessions.cancel(chat, user).await.ok();
            shutdown.cancel();
            anyhow::bail!("Nothing to merge: {e}");
        }
    };
    let queued = service
        .sessions
        .set_output_name(chat, user, cli.name.as_deref())
        .context("Failed to submit the merge job")?;
    tracing::info!(job_id = %queued.job_id, accepted, "Merge job submitted");

    // ── Wait for the result ──────────────────────────────────────────────
    let delivery = delivered.await.context("Job runner stopped without a result")?;
    shutdown.cancel();
    runner.await.context("Job runner panicked")?;

    if cli.json {
        let report = JsonReport {
            result: &delivery.result,
            rejected: &rejected,
            markdown: delivery.markdown.as_deref(),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
        return Ok(());
    }

    let (file_name, merged, failed) = match &delivery.result {
        JobResult::Delivered {
            file_name,
            merged,
            failed,
            ..
        } => (file_name.clone(), *merged, failed.len()),
        JobResult::Failed { reason, .. } => anyhow::bail!("Merge failed: {reason}"),
    };
    let markdown = delivery
        .markdown
        .context("Merged document could not be read")?;

    match &cli.output {
        Some(path) => {
            tokio::fs::write(path, markdown.as_bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(markdown.as_bytes())
                .context("Failed to write to stdout")?;
        }
    }

    if !cli.quiet {
        let target = cli
            .output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or(file_name);
        eprintln!(
            "{}  {} merged, {} failed, {} rejected  →  {}",
            if failed == 0 && rejected.is_empty() {
                green("✔")
            } else {
                red("⚠")
            },
            merged,
            failed,
            rejected.len(),
            bold(&target),
        );
    }
    Ok(())
}

/// Map CLI args to `MergeConfig`.
fn build_config(cli: &Cli) -> Result<MergeConfig> {
    MergeConfig::builder()
        .max_files_per_day(cli.max_files)
        .max_file_size_mb(cli.max_file_size_mb)
        .conversion_workers(cli.workers)
        .heading_scan_window(cli.heading_window)
        .max_concurrent_jobs(cli.max_jobs)
        .collection_timeout_secs(cli.timeout_secs)
        .items_per_status_page(cli.status_page_size)
        .max_output_name_len(cli.max_name_len)
        .separator(parse_separator(&cli.separator))
        .build()
        .context("Invalid configuration")
}

/// Parse `--separator` into a `DocumentSeparator`.
fn parse_separator(s: &str) -> DocumentSeparator {
    match s.to_lowercase().as_str() {
        "hr" | "---" => DocumentSeparator::HorizontalRule,
        "pagebreak" | "page-break" => DocumentSeparator::PageBreak,
        "comment" => DocumentSeparator::Comment,
        _ => DocumentSeparator::Custom(s.to_string()),
    }
}
