use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use autoreel_core::run::RunStoreError;
use autoreel_core::upload_log::UploadLogError;
use autoreel_core::{
    load_pipeline_config, InitialInput, OrchestratorError, PipelineConfig, ProgressEvent,
    RunHandle, RunStatus, SqliteRunStore, SqliteUploadLog, StageKind, UploadLogEntry,
    WorkflowMode, WorkflowOrchestrator, WorkflowRun,
};
use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] autoreel_core::ConfigError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("run store error: {0}")]
    RunStore(#[from] RunStoreError),
    #[error("upload log error: {0}")]
    UploadLog(#[from] UploadLogError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("run {run_id} failed: {message}")]
    RunFailed { run_id: String, message: String },
    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "autoreel script, video and upload pipeline", long_about = None)]
pub struct Cli {
    /// Pipeline configuration file
    #[arg(long, default_value = "configs/autoreel.toml")]
    pub config: PathBuf,
    /// Selector catalog, overrides paths.selectors_file
    #[arg(long)]
    pub selectors: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Debug logging for autoreel crates
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs one workflow to completion
    Run(RunArgs),
    /// Runs one workflow per topic line of a file, one after another
    Batch(BatchArgs),
    /// Continues a paused, failed or abandoned run
    Resume(ResumeArgs),
    /// Inspects persisted runs
    #[command(subcommand)]
    Runs(RunsCommands),
    /// Inspects the upload log
    #[command(subcommand)]
    Uploads(UploadsCommands),
    /// Configuration checks
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Checks files, databases and credentials
    Health,
    /// Prints shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Workflow mode
    #[arg(long, default_value_t = WorkflowMode::FullAuto)]
    pub mode: WorkflowMode,
    /// Topic for modes starting with the script stage
    #[arg(long, conflicts_with_all = ["script_file", "video_file"])]
    pub topic: Option<String>,
    /// Saved script for modes starting with the video or upload stage
    #[arg(long)]
    pub script_file: Option<PathBuf>,
    /// Existing video for upload-only runs
    #[arg(long, requires = "script_file")]
    pub video_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    /// File with one topic per line; blank lines and `#` comments are skipped
    #[arg(long)]
    pub file: PathBuf,
    /// Workflow mode for every topic
    #[arg(long, default_value_t = WorkflowMode::FullAuto)]
    pub mode: WorkflowMode,
}

#[derive(Args, Debug)]
pub struct ResumeArgs {
    pub run_id: String,
}

#[derive(Subcommand, Debug)]
pub enum RunsCommands {
    /// Lists runs, most recently updated first
    List(RunsListArgs),
    /// Shows one run with its stage results
    Show(RunsShowArgs),
}

#[derive(Args, Debug)]
pub struct RunsListArgs {
    /// Filter by status
    #[arg(long)]
    pub status: Option<RunStatus>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct RunsShowArgs {
    pub run_id: String,
}

#[derive(Subcommand, Debug)]
pub enum UploadsCommands {
    /// Lists published videos, newest first
    List(UploadsListArgs),
}

#[derive(Args, Debug)]
pub struct UploadsListArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validates the configuration for one mode, or every mode
    Check(ConfigCheckArgs),
}

#[derive(Args, Debug)]
pub struct ConfigCheckArgs {
    #[arg(long)]
    pub mode: Option<WorkflowMode>,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "autoreelctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Run(args) => {
            let input = initial_input(args)?;
            let run = context.execute(args.mode, input, cli.format)?;
            render(&run, cli.format)?;
            ensure_not_failed(&run)?;
        }
        Commands::Batch(args) => {
            let report = context.batch(args, cli.format)?;
            render(&report, cli.format)?;
            if report.failed > 0 {
                return Err(AppError::RunFailed {
                    run_id: "batch".to_string(),
                    message: format!("{} of {} topics failed", report.failed, report.runs.len()),
                });
            }
        }
        Commands::Resume(args) => {
            let run = context.resume(&args.run_id, cli.format)?;
            render(&run, cli.format)?;
            ensure_not_failed(&run)?;
        }
        Commands::Runs(RunsCommands::List(args)) => {
            let list = context.runs_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Runs(RunsCommands::Show(args)) => {
            let run = context.runs_show(&args.run_id)?;
            render(&run, cli.format)?;
        }
        Commands::Uploads(UploadsCommands::List(args)) => {
            let list = context.uploads_list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Config(ConfigCommands::Check(args)) => {
            let report = context.config_check(args);
            render(&report, cli.format)?;
            if report.has_errors() {
                return Err(AppError::InvalidArgs(
                    "configuration is not valid for every checked mode".to_string(),
                ));
            }
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report.has_errors() {
                return Err(AppError::MissingResource(
                    "one or more health checks failed".to_string(),
                ));
            }
        }
        Commands::Completions(_) => {}
    }

    Ok(())
}

/// Installs the global subscriber; call once, before [`run`]. Logs go to
/// stderr so `--format json` output stays parseable.
pub fn init_tracing(verbose: bool) -> Result<()> {
    let default = if verbose {
        "info,autoreel_core=debug,autoreelctl=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| AppError::Logging(err.to_string()))
}

fn initial_input(args: &RunArgs) -> Result<InitialInput> {
    let input = match (&args.topic, &args.script_file, &args.video_file) {
        (Some(topic), None, None) => {
            let topic = topic.trim();
            if topic.is_empty() {
                return Err(AppError::InvalidArgs("--topic must not be empty".to_string()));
            }
            InitialInput::Topic {
                topic: topic.to_string(),
            }
        }
        (None, Some(script), None) => InitialInput::Script {
            script: script.clone(),
        },
        (None, Some(script), Some(video)) => InitialInput::Publish {
            script: script.clone(),
            video: video.clone(),
        },
        _ => {
            return Err(AppError::InvalidArgs(
                "pass --topic, --script-file, or --script-file with --video-file".to_string(),
            ))
        }
    };
    Ok(input)
}

/// Non-empty, non-comment lines of a batch file, trimmed.
fn batch_topics(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn ensure_not_failed(run: &WorkflowRun) -> Result<()> {
    if run.status != RunStatus::Failed {
        return Ok(());
    }
    let message = run
        .failure
        .as_ref()
        .map(|failure| format!("{} stage: {}", failure.stage, failure.message))
        .unwrap_or_else(|| "no failure recorded".to_string());
    Err(AppError::RunFailed {
        run_id: run.run_id.clone(),
        message,
    })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: Arc<PipelineConfig>,
    config_path: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_pipeline_config(&cli.config)?;
        if let Some(selectors) = &cli.selectors {
            let selectors = if selectors.is_absolute() {
                selectors.clone()
            } else {
                std::env::current_dir()?.join(selectors)
            };
            config.paths.selectors_file = Some(selectors.display().to_string());
        }
        Ok(Self {
            config: Arc::new(config),
            config_path: cli.config.clone(),
        })
    }

    fn runtime(&self) -> Result<tokio::runtime::Runtime> {
        Ok(tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?)
    }

    fn orchestrator(&self) -> Result<WorkflowOrchestrator> {
        let store = SqliteRunStore::builder()
            .path(self.config.run_db_path())
            .create_if_missing(true)
            .build()?;
        store.initialize()?;
        let log = SqliteUploadLog::new(self.config.upload_log_path());
        log.initialize()?;
        Ok(WorkflowOrchestrator::from_config(
            Arc::clone(&self.config),
            Arc::new(store),
            Arc::new(log),
        )?)
    }

    fn execute(&self, mode: WorkflowMode, input: InitialInput, format: OutputFormat) -> Result<WorkflowRun> {
        let runtime = self.runtime()?;
        runtime.block_on(async {
            let orchestrator = self.orchestrator()?;
            let printer = spawn_progress_printer(&orchestrator, format);
            let result = match orchestrator.start(mode, input).await {
                Ok(handle) => follow(handle).await,
                Err(err) => Err(err.into()),
            };
            printer.abort();
            result
        })
    }

    fn resume(&self, run_id: &str, format: OutputFormat) -> Result<WorkflowRun> {
        let runtime = self.runtime()?;
        runtime.block_on(async {
            let orchestrator = self.orchestrator()?;
            let printer = spawn_progress_printer(&orchestrator, format);
            let result = match orchestrator.resume(run_id).await {
                Ok(handle) => follow(handle).await,
                Err(err) => Err(err.into()),
            };
            printer.abort();
            result
        })
    }

    fn batch(&self, args: &BatchArgs, format: OutputFormat) -> Result<BatchReport> {
        if args.mode.stages().first() != Some(&StageKind::Script) {
            return Err(AppError::InvalidArgs(format!(
                "batch runs need a mode that starts with the script stage, not {}",
                args.mode
            )));
        }
        let contents = fs::read_to_string(&args.file)?;
        let topics = batch_topics(&contents);
        if topics.is_empty() {
            return Err(AppError::InvalidArgs(format!(
                "{} contains no topics",
                args.file.display()
            )));
        }

        let runtime = self.runtime()?;
        runtime.block_on(async {
            let orchestrator = self.orchestrator()?;
            let printer = spawn_progress_printer(&orchestrator, format);
            let mut report = BatchReport::default();
            for (position, topic) in topics.iter().enumerate() {
                info!(topic = %topic, position = position + 1, total = topics.len(), "batch topic");
                let input = InitialInput::Topic {
                    topic: topic.clone(),
                };
                let run = match orchestrator.start(args.mode, input).await {
                    Ok(handle) => follow(handle).await?,
                    Err(err) => {
                        printer.abort();
                        return Err(err.into());
                    }
                };
                let status = run.status;
                report.push(topic, &run);
                if status == RunStatus::Stopped {
                    warn!(remaining = topics.len() - position - 1, "batch stopped");
                    break;
                }
            }
            printer.abort();
            Ok(report)
        })
    }

    fn run_store(&self) -> Result<SqliteRunStore> {
        let path = self.config.run_db_path();
        require_file("run database", &path)?;
        Ok(SqliteRunStore::builder().path(path).read_only(true).build()?)
    }

    fn runs_list(&self, args: &RunsListArgs) -> Result<RunList> {
        let rows = self
            .run_store()?
            .list(args.status, args.limit)?
            .iter()
            .map(RunEntry::from)
            .collect();
        Ok(RunList { rows })
    }

    fn runs_show(&self, run_id: &str) -> Result<WorkflowRun> {
        self.run_store()?
            .fetch(run_id)?
            .ok_or_else(|| AppError::MissingResource(format!("run {run_id}")))
    }

    fn uploads_list(&self, args: &UploadsListArgs) -> Result<UploadList> {
        let path = self.config.upload_log_path();
        require_file("upload log", &path)?;
        let rows = SqliteUploadLog::read_only(path).list(args.limit)?;
        Ok(UploadList { rows })
    }

    fn config_check(&self, args: &ConfigCheckArgs) -> HealthReport {
        let modes = match args.mode {
            Some(mode) => vec![mode],
            None => WorkflowMode::ALL.to_vec(),
        };
        let mut entries: Vec<HealthEntry> = modes
            .into_iter()
            .map(|mode| match self.config.validate_for(mode) {
                Ok(()) => HealthEntry::ok(mode.as_str(), "valid"),
                Err(err) => HealthEntry::error(mode.as_str(), err.to_string()),
            })
            .collect();
        if let Some(file) = &self.config.paths.selectors_file {
            let path = self.config.resolve_path(file);
            entries.push(match autoreel_core::browser::SelectorCatalog::load(&path) {
                Ok(catalog) => HealthEntry::ok(
                    "selectors",
                    format!("{} sites in {}", catalog.sites().count(), path.display()),
                ),
                Err(err) => HealthEntry::error("selectors", err.to_string()),
            });
        }
        HealthReport { entries }
    }

    fn health_check(&self) -> HealthReport {
        let config = &self.config;
        let mut entries = vec![self.check_path("config", &self.config_path)];
        if let Some(file) = &config.paths.selectors_file {
            entries.push(self.check_path("selectors", &config.resolve_path(file)));
        }
        entries.push(self.check_directory("data_dir", &config.resolve_path(&config.paths.data_dir)));
        for (name, dir) in [
            ("scripts_dir", &config.paths.scripts_dir),
            ("videos_dir", &config.paths.videos_dir),
            ("downloads_dir", &config.paths.downloads_dir),
        ] {
            if let Some(dir) = dir {
                entries.push(self.check_directory(name, &config.resolve_path(dir)));
            }
        }
        entries.push(self.check_database("runs.sqlite", &config.run_db_path()));
        entries.push(self.check_database("uploads.sqlite", &config.upload_log_path()));

        for (name, section) in &config.providers {
            if let Some(var) = &section.api_key_env {
                entries.push(match std::env::var(var) {
                    Ok(value) if !value.trim().is_empty() => {
                        HealthEntry::ok(name.as_str(), format!("{var} set"))
                    }
                    _ => HealthEntry::warn(name.as_str(), format!("{var} not set")),
                });
            }
            if let Some(file) = &section.credentials_file {
                let path = config.resolve_path(file);
                entries.push(if path.is_file() {
                    HealthEntry::ok(name.as_str(), format!("{}", path.display()))
                } else {
                    HealthEntry::warn(name.as_str(), format!("{} not found", path.display()))
                });
            }
        }
        HealthReport { entries }
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{} missing", path.display()))
        }
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
            Ok(_) => HealthEntry::warn(name, format!("{} is not a directory", path.display())),
            Err(_) => HealthEntry::warn(
                name,
                format!("{} not found, created on first run", path.display()),
            ),
        }
    }

    fn check_database(&self, name: &str, path: &Path) -> HealthEntry {
        if !path.exists() {
            return HealthEntry::warn(
                name,
                format!("{} not found, created on first run", path.display()),
            );
        }
        match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
            Ok(conn) => {
                let pragma: rusqlite::Result<String> =
                    conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
                match pragma {
                    Ok(result) if result.eq_ignore_ascii_case("ok") => {
                        HealthEntry::ok(name, "integrity ok")
                    }
                    Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                    Err(err) => HealthEntry::warn(name, format!("error: {err}")),
                }
            }
            Err(err) => HealthEntry::error(name, format!("cannot open: {err}")),
        }
    }
}

fn require_file(label: &str, path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(AppError::MissingResource(format!(
            "{label} not found at {}",
            path.display()
        )))
    }
}

/// Waits for the run; the first Ctrl-C requests a cooperative stop.
async fn follow(handle: RunHandle) -> Result<WorkflowRun> {
    let control = handle.control();
    let run_id = handle.run_id().to_string();
    let wait = handle.wait();
    tokio::pin!(wait);
    tokio::select! {
        result = &mut wait => return Ok(result?),
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "interrupt received, stopping at the next checkpoint");
            control.request_stop();
        }
    }
    Ok(wait.await?)
}

fn spawn_progress_printer(
    orchestrator: &WorkflowOrchestrator,
    format: OutputFormat,
) -> tokio::task::JoinHandle<()> {
    let mut events = orchestrator.progress().subscribe();
    tokio::spawn(async move {
        if format == OutputFormat::Json {
            return;
        }
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", progress_line(&event)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn progress_line(event: &ProgressEvent) -> String {
    let stage = event.stage.map(|stage| stage.as_str()).unwrap_or("-");
    match &event.message {
        Some(message) if !message.is_empty() => format!(
            "[{:>3}%] {} {stage}: {message}",
            event.percent,
            event.kind.as_str()
        ),
        _ => format!("[{:>3}%] {} {stage}", event.percent, event.kind.as_str()),
    }
}

impl DisplayFallback for WorkflowRun {
    fn display(&self) -> String {
        let mut lines = vec![
            format!("Run {} ({})", self.run_id, self.mode),
            format!(
                "  status: {} at stage {}/{} ({}%)",
                self.status,
                self.stage_index,
                self.stages().len(),
                self.progress_percent()
            ),
            format!("  input: {}", self.input.describe()),
        ];
        for result in &self.results {
            let provider = result
                .provider
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "  - {}: {} (provider={}, attempts={})",
                result.stage,
                result.artifact.summary(),
                provider,
                result.attempts.len()
            ));
        }
        if let Some(failure) = &self.failure {
            lines.push(format!(
                "  failed in {} [{}] after {} attempts: {}",
                failure.stage, failure.error_kind, failure.attempts, failure.message
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct RunList {
    pub rows: Vec<RunEntry>,
}

#[derive(Debug, Serialize)]
pub struct RunEntry {
    pub run_id: String,
    pub mode: WorkflowMode,
    pub status: RunStatus,
    pub percent: u8,
    pub current_stage: Option<StageKind>,
    pub error_kind: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowRun> for RunEntry {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            mode: run.mode,
            status: run.status,
            percent: run.progress_percent(),
            current_stage: run.current_stage(),
            error_kind: run.failure.as_ref().map(|failure| failure.error_kind.clone()),
            updated_at: run.updated_at,
        }
    }
}

impl DisplayFallback for RunList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No runs found".to_string();
        }
        self.rows
            .iter()
            .map(|entry| {
                let stage = entry
                    .current_stage
                    .map(|stage| stage.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let mut line = format!(
                    "{} | {} | status={} | {}% | next={} | {}",
                    entry.run_id,
                    entry.mode,
                    entry.status,
                    entry.percent,
                    stage,
                    entry.updated_at.format("%Y-%m-%d %H:%M")
                );
                if let Some(kind) = &entry.error_kind {
                    line.push_str(&format!(" | error={kind}"));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct UploadList {
    pub rows: Vec<UploadLogEntry>,
}

impl DisplayFallback for UploadList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No uploads logged".to_string();
        }
        self.rows
            .iter()
            .map(|entry| {
                let record = &entry.record;
                let scheduled = record
                    .scheduled_publish_at
                    .map(|at| format!(" | publish_at={}", at.to_rfc3339()))
                    .unwrap_or_default();
                format!(
                    "{} | {} | {} | {}{}",
                    record.video_id,
                    record.title,
                    record.privacy,
                    entry.original_file.display(),
                    scheduled
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub runs: Vec<BatchEntry>,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct BatchEntry {
    pub topic: String,
    pub run_id: String,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl BatchReport {
    fn push(&mut self, topic: &str, run: &WorkflowRun) {
        match run.status {
            RunStatus::Completed => self.completed += 1,
            RunStatus::Failed => self.failed += 1,
            _ => {}
        }
        self.runs.push(BatchEntry {
            topic: topic.to_string(),
            run_id: run.run_id.clone(),
            status: run.status,
            error: run.failure.as_ref().map(|failure| failure.message.clone()),
        });
    }
}

impl DisplayFallback for BatchReport {
    fn display(&self) -> String {
        let mut lines: Vec<String> = self
            .runs
            .iter()
            .map(|entry| match &entry.error {
                Some(error) => format!("{} | {} | {} | {error}", entry.status, entry.run_id, entry.topic),
                None => format!("{} | {} | {}", entry.status, entry.run_id, entry.topic),
            })
            .collect();
        lines.push(format!(
            "{} completed, {} failed, {} total",
            self.completed,
            self.failed,
            self.runs.len()
        ));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub entries: Vec<HealthEntry>,
}

impl HealthReport {
    fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| matches!(entry.status, CheckStatus::Error))
    }
}

impl DisplayFallback for HealthReport {
    fn display(&self) -> String {
        self.entries
            .iter()
            .map(HealthEntry::display)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for HealthEntry {
    fn display(&self) -> String {
        format!(
            "[{status}] {name}: {detail}",
            status = self.status,
            name = self.name,
            detail = self.detail
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoreel_core::StageArtifact;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[paths]
base_dir = "BASE"
data_dir = "data"
run_db = "data/runs.sqlite"
upload_log_db = "data/uploads.sqlite"
scripts_dir = "scripts"
videos_dir = "videos"

[workflow]
prompt_template = "Write a short video script about {topic}."
max_words = 60
save_scripts = true

[retry]
max_attempts = 2
base_delay_ms = 1
max_delay_ms = 2
jitter_ms = 0

[stages.script]
providers = ["template"]

[metadata]
default_title = "{topic}"
default_description = "All about {topic}."
default_tags = ["shorts"]
"#;

    #[test]
    fn logging_is_installed_only_once() {
        init_tracing(false).unwrap();
        assert!(matches!(init_tracing(true), Err(AppError::Logging(_))));
    }

    fn prepare_test_context(command: Commands) -> (TempDir, Cli, AppContext) {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("autoreel.toml");
        fs::write(
            &config_path,
            CONFIG.replace("BASE", &temp.path().display().to_string()),
        )
        .unwrap();
        let cli = Cli {
            config: config_path,
            selectors: None,
            format: OutputFormat::Json,
            verbose: false,
            command,
        };
        let context = AppContext::new(&cli).unwrap();
        (temp, cli, context)
    }

    fn topic_args(mode: WorkflowMode, topic: &str) -> RunArgs {
        RunArgs {
            mode,
            topic: Some(topic.to_string()),
            script_file: None,
            video_file: None,
        }
    }

    #[test]
    fn cli_parses_run_and_rejects_mixed_inputs() {
        let cli = Cli::try_parse_from([
            "autoreelctl",
            "--format",
            "json",
            "run",
            "--mode",
            "script_only",
            "--topic",
            "AI Facts",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.mode, WorkflowMode::ScriptOnly);
                assert_eq!(args.topic.as_deref(), Some("AI Facts"));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.config, PathBuf::from("configs/autoreel.toml"));

        assert!(Cli::try_parse_from([
            "autoreelctl",
            "run",
            "--topic",
            "x",
            "--script-file",
            "a.txt"
        ])
        .is_err());
        assert!(Cli::try_parse_from(["autoreelctl", "run", "--video-file", "v.mp4"]).is_err());
        assert!(Cli::try_parse_from(["autoreelctl", "runs", "list", "--status", "bogus"]).is_err());
    }

    #[test]
    fn input_follows_the_flags_given() {
        let publish = RunArgs {
            mode: WorkflowMode::UploadOnly,
            topic: None,
            script_file: Some("s.txt".into()),
            video_file: Some("v.mp4".into()),
        };
        assert!(matches!(
            initial_input(&publish).unwrap(),
            InitialInput::Publish { .. }
        ));
        assert!(initial_input(&topic_args(WorkflowMode::FullAuto, "  ")).is_err());
    }

    #[test]
    fn batch_file_skips_blank_and_comment_lines() {
        let topics = batch_topics("AI Facts\n\n# later\n  Space Facts  \n");
        assert_eq!(topics, vec!["AI Facts".to_string(), "Space Facts".to_string()]);
    }

    #[test]
    fn script_only_run_is_persisted_and_listed() {
        let (_temp, _cli, context) = prepare_test_context(Commands::Health);
        let run = context
            .execute(
                WorkflowMode::ScriptOnly,
                InitialInput::Topic {
                    topic: "AI Facts".into(),
                },
                OutputFormat::Json,
            )
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        match &run.results[0].artifact {
            StageArtifact::Script(script) => {
                assert!(script.saved_to.as_ref().is_some_and(|path| path.is_file()))
            }
            other => panic!("unexpected artifact {other:?}"),
        }

        let list = context
            .runs_list(&RunsListArgs {
                status: Some(RunStatus::Completed),
                limit: 5,
            })
            .unwrap();
        assert_eq!(list.rows.len(), 1);
        assert_eq!(list.rows[0].run_id, run.run_id);
        assert_eq!(list.rows[0].percent, 100);

        let shown = context.runs_show(&run.run_id).unwrap();
        assert!(shown.display().contains("script \"AI Facts"));
        assert!(matches!(
            context.runs_show("run-missing"),
            Err(AppError::MissingResource(_))
        ));
    }

    #[test]
    fn batch_requires_a_script_first_mode() {
        let (temp, _cli, context) = prepare_test_context(Commands::Health);
        let file = temp.path().join("topics.txt");
        fs::write(&file, "AI Facts\nSpace Facts\n").unwrap();

        let err = context
            .batch(
                &BatchArgs {
                    file: file.clone(),
                    mode: WorkflowMode::UploadOnly,
                },
                OutputFormat::Json,
            )
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgs(_)));

        let report = context
            .batch(
                &BatchArgs {
                    file,
                    mode: WorkflowMode::ScriptOnly,
                },
                OutputFormat::Json,
            )
            .unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 0);
        assert_ne!(report.runs[0].run_id, report.runs[1].run_id);
    }

    #[test]
    fn config_check_reports_modes_missing_sections() {
        let (_temp, _cli, context) = prepare_test_context(Commands::Health);
        let report = context.config_check(&ConfigCheckArgs { mode: None });
        let status_of = |name: &str| {
            report
                .entries
                .iter()
                .find(|entry| entry.name == name)
                .map(|entry| entry.status.to_string())
        };
        assert_eq!(status_of("script_only").as_deref(), Some("OK"));
        assert_eq!(status_of("full_auto").as_deref(), Some("ERROR"));
        assert!(report.has_errors());

        let single = context.config_check(&ConfigCheckArgs {
            mode: Some(WorkflowMode::ScriptOnly),
        });
        assert!(!single.has_errors());
    }

    #[test]
    fn listings_need_existing_databases() {
        let (_temp, _cli, context) = prepare_test_context(Commands::Health);
        assert!(matches!(
            context.uploads_list(&UploadsListArgs { limit: 5 }),
            Err(AppError::MissingResource(_))
        ));
        let health = context.health_check();
        assert!(!health.has_errors());
        assert!(health
            .entries
            .iter()
            .any(|entry| entry.name == "runs.sqlite" && matches!(entry.status, CheckStatus::Warn)));
    }
}
