//! CLI command definitions for automl-forge.
//!
//! - `serve`: run the HTTP service
//! - `run`: run one pipeline in-process, streaming NDJSON events to stdout
//! - `models`: inspect and delete recorded models
//! - `settings`: show the effective settings

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::{AlgorithmType, SchemaContext};
use crate::pipeline::{PipelineOrchestrator, PipelineRequest, TerminalState};
use crate::registry::{FsModelRegistry, ModelRegistry};
use crate::settings::{Settings, SettingsStore};
use crate::transport::{self, AppState, NdjsonWriter};

/// Default settings file.
const DEFAULT_SETTINGS_FILE: &str = "automl-forge.yaml";

/// Default bind address of the HTTP service.
const DEFAULT_BIND: &str = "127.0.0.1:8000";

/// Events buffered between the orchestrator and stdout.
const EVENT_BUFFER: usize = 64;

/// LLM-driven AutoML pipeline generator.
#[derive(Parser)]
#[command(name = "automl-forge")]
#[command(about = "Generate, run and repair ML pipeline scripts with an LLM")]
#[command(version)]
#[command(
    long_about = "automl-forge asks an LLM for a machine learning pipeline script, runs it in a sandboxed child process, and feeds failures back for repair until the script reports a result or the retry budget is spent.\n\nExample usage:\n  automl-forge run --schema schema.json --algorithm random_forest --objective \"Predict churn\""
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML settings file (read if present, written by settings updates).
    #[arg(long, env = "AUTOML_SETTINGS_FILE", default_value = DEFAULT_SETTINGS_FILE, global = true)]
    pub settings: PathBuf,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the HTTP service.
    Serve(ServeArgs),

    /// Run one pipeline and stream its events to stdout as NDJSON.
    Run(RunArgs),

    /// Inspect recorded models.
    Models(ModelsArgs),

    /// Inspect settings.
    Settings(SettingsArgs),
}

/// Arguments for `automl-forge serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "AUTOML_BIND", default_value = DEFAULT_BIND)]
    pub bind: String,
}

/// Arguments for `automl-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Schema description file (JSON, or YAML by extension).
    #[arg(long)]
    pub schema: PathBuf,

    /// Algorithm to implement (e.g. random_forest, clustering_kmeans).
    #[arg(short, long)]
    pub algorithm: String,

    /// What the user wants from the data.
    #[arg(short, long)]
    pub objective: Option<String>,

    /// File with an exploratory analysis summary to include in the prompt.
    #[arg(long)]
    pub eda: Option<PathBuf>,

    /// Resume from this script instead of generating one. Starts a fresh
    /// attempt budget.
    #[arg(long)]
    pub code: Option<PathBuf>,

    /// Override the configured number of repair retries.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Override the script timeout, in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Override the LLM model.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Override the interpreter used to run scripts.
    #[arg(long)]
    pub interpreter: Option<String>,
}

/// Arguments for `automl-forge models`.
#[derive(Parser, Debug)]
pub struct ModelsArgs {
    #[command(subcommand)]
    pub command: ModelsSubcommand,
}

/// Model registry subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum ModelsSubcommand {
    /// List recorded models, newest first.
    List {
        /// Output JSON instead of a table.
        #[arg(short = 'j', long)]
        json: bool,
    },

    /// Show one recorded model as JSON.
    Show {
        /// Run id of the model.
        run_id: String,
    },

    /// Delete a recorded model and its artifacts.
    Delete {
        /// Run id of the model.
        run_id: String,
    },
}

/// Arguments for `automl-forge settings`.
#[derive(Parser, Debug)]
pub struct SettingsArgs {
    #[command(subcommand)]
    pub command: SettingsSubcommand,
}

/// Settings subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum SettingsSubcommand {
    /// Print the effective settings (file, then environment), key masked.
    Show {
        /// Output JSON instead of YAML.
        #[arg(short = 'j', long)]
        json: bool,
    },
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args, &cli.settings).await,
        Commands::Run(args) => run_pipeline_command(args, &cli.settings).await,
        Commands::Models(args) => run_models_command(args, &cli.settings).await,
        Commands::Settings(args) => run_settings_command(args, &cli.settings),
    }
}

fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    Settings::load(Some(path))
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, shutting down");
            token.cancel();
        }
    });
}

// ============================================================================
// serve
// ============================================================================

async fn run_serve_command(args: ServeArgs, settings_path: &Path) -> anyhow::Result<()> {
    let settings = load_settings(settings_path)?;
    info!(
        provider = %settings.llm.provider,
        model = %settings.llm.model,
        max_retries = settings.pipeline.max_retries,
        models_dir = %settings.models_dir.display(),
        "Starting automl-forge service"
    );

    let store = SettingsStore::new(settings, Some(settings_path.to_path_buf()));
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    transport::serve(&args.bind, AppState::new(store), shutdown).await?;
    info!("Service stopped");
    Ok(())
}

// ============================================================================
// run
// ============================================================================

fn apply_run_overrides(settings: &mut Settings, args: &RunArgs) {
    if let Some(max_retries) = args.max_retries {
        settings.pipeline.max_retries = max_retries;
    }
    if let Some(timeout) = args.timeout {
        settings.pipeline.script_timeout_secs = timeout;
    }
    if let Some(model) = &args.model {
        settings.llm.model = model.clone();
    }
    if let Some(interpreter) = &args.interpreter {
        settings.pipeline.interpreter = interpreter.clone();
    }
}

fn load_schema(path: &Path) -> anyhow::Result<SchemaContext> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let schema = if is_yaml {
        serde_yaml::from_str(&contents)?
    } else {
        serde_json::from_str(&contents)?
    };
    Ok(schema)
}

fn build_request(args: &RunArgs) -> anyhow::Result<PipelineRequest> {
    let schema = load_schema(&args.schema)?;
    let algorithm: AlgorithmType = args.algorithm.parse()?;
    let mut request = PipelineRequest::new(schema, algorithm);

    if let Some(objective) = &args.objective {
        request = request.with_objective(objective.clone());
    }
    if let Some(path) = &args.eda {
        let summary = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read EDA summary {}", path.display()))?;
        request = request.with_eda_summary(summary);
    }
    if let Some(path) = &args.code {
        let code = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display()))?;
        if code.trim().is_empty() {
            anyhow::bail!("Script {} is empty", path.display());
        }
        request = request.with_initial_code(code);
    }
    Ok(request)
}

async fn run_pipeline_command(args: RunArgs, settings_path: &Path) -> anyhow::Result<()> {
    let mut settings = load_settings(settings_path)?;
    apply_run_overrides(&mut settings, &args);
    settings.validate()?;

    let request = build_request(&args)?;
    let orchestrator = PipelineOrchestrator::from_settings(&settings)?;

    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { orchestrator.run(request, tx, run_cancel).await });

    let mut writer = NdjsonWriter::new(tokio::io::stdout());
    if let Err(e) = writer.forward(&mut rx).await {
        cancel.cancel();
        return Err(e.into());
    }

    let run = handle.await?;
    info!(
        run_id = %run.run_id,
        terminal_state = %run.terminal_state,
        attempts = run.attempts.len(),
        "Pipeline run finished"
    );

    match run.terminal_state {
        TerminalState::Succeeded => Ok(()),
        TerminalState::AbortedByCaller => anyhow::bail!("Pipeline run cancelled"),
        other => anyhow::bail!(
            "Pipeline ended as {}: {}",
            other,
            run.summary.unwrap_or_default()
        ),
    }
}

// ============================================================================
// models
// ============================================================================

fn format_metrics(metrics: &BTreeMap<String, f64>) -> String {
    metrics
        .iter()
        .map(|(name, value)| format!("{}={:.4}", name, value))
        .collect::<Vec<_>>()
        .join(" ")
}

async fn run_models_command(args: ModelsArgs, settings_path: &Path) -> anyhow::Result<()> {
    let settings = load_settings(settings_path)?;
    let registry = FsModelRegistry::new(settings.models_dir.clone());

    match args.command {
        ModelsSubcommand::List { json } => {
            let records = registry.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No models recorded in {}", registry.root().display());
            } else {
                for record in &records {
                    println!(
                        "{}  {}  {:<24} {}",
                        record.run_id,
                        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        record.model_type,
                        format_metrics(&record.metrics)
                    );
                }
            }
        }
        ModelsSubcommand::Show { run_id } => {
            let record = registry.get(&run_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        ModelsSubcommand::Delete { run_id } => {
            registry.delete(&run_id).await?;
            println!("✓ Deleted {}", run_id);
        }
    }
    Ok(())
}

// ============================================================================
// settings
// ============================================================================

fn run_settings_command(args: SettingsArgs, settings_path: &Path) -> anyhow::Result<()> {
    let settings = load_settings(settings_path)?.redacted();
    match args.command {
        SettingsSubcommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                print!("{}", serde_yaml::to_string(&settings)?);
            }
        }
    }
    Ok(())
}
