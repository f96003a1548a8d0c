//! CLI command definitions for legacy-forge.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::context::{ContextConfig, ContextManager, ContextPayload, StageObjective};
use crate::llm::{ClientSettings, InferenceBackend, LiteLlmClient, MockBackend, ProviderBackend};
use crate::pipeline::{EventKind, PipelineConfig, PipelineState, PipelineStatus, StageStatus};
use crate::scheduler::{JobMode, JobRequest, JobScheduler};

/// Default output directory for modernized modules.
const DEFAULT_OUTPUT_DIR: &str = "./modernized";

/// Modernize legacy C++/Java source into idiomatic Python.
#[derive(Parser)]
#[command(name = "legacy-forge")]
#[command(about = "Modernize legacy C++/Java source files through a staged LLM pipeline")]
#[command(version)]
#[command(
    long_about = "legacy-forge runs a legacy source file through extraction, mapping, generation, validation and documentation stages.\n\nLarge inputs are fed to the model directly, in overlapping windows, or through retrieval, depending on their size.\n\nExample usage:\n  legacy-forge run --input engine.cpp --mode mock --output ./modernized"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run one modernization job and write its outputs.
    Run(RunArgs),

    /// Show how a file would be fed to the model.
    Context(ContextArgs),
}

/// Arguments for `legacy-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Legacy source file.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Source language (cpp, java). Inferred from the extension if omitted.
    #[arg(long)]
    pub language: Option<String>,

    /// Inference backend: mock or real.
    #[arg(short, long, default_value = "mock")]
    pub mode: String,

    /// Failed validations tolerated before the job fails.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Output directory for the generated module, README.md and state.json.
    #[arg(short = 'o', long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// Model for real mode (defaults to LITELLM_DEFAULT_MODEL).
    #[arg(long)]
    pub model: Option<String>,

    /// API key for real mode (can also be set via OPENROUTER_API_KEY or LITELLM_API_KEY env var).
    #[arg(long, env = "OPENROUTER_API_KEY")]
    pub api_key: Option<String>,

    /// Output a JSON summary instead of log lines.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `legacy-forge context`.
#[derive(Parser, Debug)]
pub struct ContextArgs {
    /// Legacy source file.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
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
        Commands::Run(args) => run_job_command(args).await,
        Commands::Context(args) => run_context_command(args),
    }
}

// ============================================================================
// run
// ============================================================================

#[derive(Debug, Serialize)]
struct RunSummary {
    job_id: String,
    status: PipelineStatus,
    strategy: Option<String>,
    retry_count: u32,
    attempts: usize,
    failure: Option<String>,
    files: Vec<PathBuf>,
}

async fn run_job_command(args: RunArgs) -> anyhow::Result<()> {
    let text = fs::read_to_string(&args.input)?;
    let file_name = args
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("input path has no file name"))?;

    let mode: JobMode = args.mode.parse()?;
    let mut config = PipelineConfig::from_env()?;
    if let Some(max) = args.max_retries {
        config = config.with_max_retries(max);
    }
    let context = ContextConfig::from_env()?;

    let mut scheduler = JobScheduler::new(config, context, Arc::new(MockBackend::new()))?;
    if mode == JobMode::Real {
        let backend = build_real_backend(args.api_key.clone(), args.model.clone())?;
        scheduler = scheduler.with_real_backend(backend)?;
    }

    let request = JobRequest::new(
        text,
        args.language.clone().unwrap_or_default(),
        file_name,
        mode,
    );
    let job_id = scheduler.submit(request)?;
    let mut progress = scheduler.take_progress(job_id)?;
    info!(job_id = %job_id, mode = %mode, input = %args.input.display(), "Job started");

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = progress.recv() => {
                let Some(event) = event else { break };
                if !args.json {
                    log_event(&event.kind);
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!(job_id = %job_id, "Interrupted, cancelling job");
                interrupted = true;
                scheduler.cancel(job_id)?;
            }
        }
    }

    let state = scheduler.wait(job_id).await?;
    let files = write_outputs(&state, &args.output)?;

    let summary = RunSummary {
        job_id: job_id.to_string(),
        status: state.status(),
        strategy: state.context_strategy().map(|s| s.to_string()),
        retry_count: state.retry_count(),
        attempts: state.validation_history().len(),
        failure: state
            .failure()
            .map(|e| format!("{}: {}", e.category, e.message)),
        files,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for file in &summary.files {
            info!(path = %file.display(), "Wrote");
        }
        info!(
            status = %summary.status,
            retry_count = summary.retry_count,
            strategy = summary.strategy.as_deref().unwrap_or("-"),
            "Job finished"
        );
    }

    match summary.failure {
        Some(reason) if state.status() == PipelineStatus::Failed => {
            Err(anyhow::anyhow!("job {} failed: {}", job_id, reason))
        }
        _ => Ok(()),
    }
}

fn log_event(kind: &EventKind) {
    match kind {
        EventKind::Stage {
            stage,
            status,
            message,
            progress,
        } => {
            if *status == StageStatus::Pending {
                return;
            }
            info!(
                stage = %stage,
                status = ?status,
                progress = %format!("{:.0}%", progress * 100.0),
                "{}",
                message.as_deref().unwrap_or("")
            );
        }
        EventKind::Artifact {
            file_name, attempt, ..
        } => info!(file = %file_name, attempt, "Artifact ready"),
        EventKind::Error {
            stage,
            category,
            message,
        } => warn!(
            stage = %stage.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            category = %category,
            "{}",
            message
        ),
        EventKind::Finished { status } => info!(status = %status, "Pipeline finished"),
    }
}

fn build_real_backend(
    api_key: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Arc<dyn InferenceBackend>> {
    let settings = match (std::env::var("LITELLM_API_BASE").is_ok(), api_key) {
        (false, Some(key)) => {
            info!("Using OpenRouter with the supplied API key");
            ClientSettings::openrouter(key)
        }
        _ => ClientSettings::from_env().map_err(|e| {
            anyhow::anyhow!(
                "Failed to configure LLM client: {}. Provide --api-key or set \
                 LITELLM_API_BASE/OPENROUTER_API_KEY.",
                e
            )
        })?,
    };
    let settings = match model {
        Some(model) => settings.with_model(model),
        None => settings,
    };
    info!(api_base = %settings.api_base, model = %settings.default_model, "Using real backend");

    let client = LiteLlmClient::new(settings)?;
    Ok(Arc::new(ProviderBackend::new(Arc::new(client), "")))
}

/// Writes the generated module, README.md and state.json.
///
/// Failed jobs still get state.json, plus the last artifact if one exists.
pub(crate) fn write_outputs(state: &PipelineState, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();

    if let Some(artifact) = state.generated_artifact() {
        let path = dir.join(&artifact.file_name);
        fs::write(&path, &artifact.code)?;
        written.push(path);
    }

    if let Some(docs) = state.documentation() {
        let path = dir.join("README.md");
        fs::write(&path, &docs.markdown)?;
        written.push(path);
    }

    let path = dir.join("state.json");
    fs::write(&path, serde_json::to_string_pretty(state)?)?;
    written.push(path);

    Ok(written)
}

// ============================================================================
// context
// ============================================================================

#[derive(Debug, Serialize)]
struct ContextSummary {
    file: String,
    strategy: String,
    tokens: Option<usize>,
    warnings: Vec<String>,
    sections: Vec<ContextSection>,
}

#[derive(Debug, Serialize)]
struct ContextSection {
    label: String,
    start_line: usize,
    end_line: usize,
    tokens: usize,
    score: Option<f64>,
}

fn run_context_command(args: ContextArgs) -> anyhow::Result<()> {
    let text = fs::read_to_string(&args.input)?;
    let manager = ContextManager::new(ContextConfig::from_env()?)?;
    let summary = describe_context(&manager, &args.input.display().to_string(), &text)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("File:     {}", summary.file);
    println!("Strategy: {}", summary.strategy);
    if let Some(tokens) = summary.tokens {
        println!("Tokens:   {}", tokens);
    }
    for warning in &summary.warnings {
        println!("Warning:  {}", warning);
    }
    for section in &summary.sections {
        match section.score {
            Some(score) => println!(
                "  {:<14} lines {:>5}-{:<5} {:>6} tokens  score {:.3}",
                section.label, section.start_line, section.end_line, section.tokens, score
            ),
            None => println!(
                "  {:<14} lines {:>5}-{:<5} {:>6} tokens",
                section.label, section.start_line, section.end_line, section.tokens
            ),
        }
    }
    Ok(())
}

fn describe_context(
    manager: &ContextManager,
    file: &str,
    text: &str,
) -> anyhow::Result<ContextSummary> {
    let prepared = manager.prepare(text)?;

    let sections = match prepared.payload() {
        ContextPayload::Direct { .. } => vec![ContextSection {
            label: "full".to_string(),
            start_line: 1,
            end_line: text.lines().count().max(1),
            tokens: prepared.token_estimate().unwrap_or(0),
            score: None,
        }],
        ContextPayload::Windowed { chunks } => chunks
            .iter()
            .map(|c| ContextSection {
                label: format!("window {}", c.index + 1),
                start_line: c.start_line,
                end_line: c.end_line,
                tokens: c.token_count(),
                score: None,
            })
            .collect(),
        ContextPayload::Retrieval(payload) => payload
            .retrieve(StageObjective::Extraction.query(&[]))?
            .retrieved
            .into_iter()
            .map(|hit| ContextSection {
                label: format!("segment {}", hit.segment.id),
                start_line: hit.segment.start_line,
                end_line: hit.segment.end_line,
                tokens: hit.segment.token_count,
                score: Some(hit.score),
            })
            .collect(),
    };

    Ok(ContextSummary {
        file: file.to_string(),
        strategy: prepared.strategy().to_string(),
        tokens: prepared.token_estimate(),
        warnings: prepared.warnings().to_vec(),
        sections,
    })
}
