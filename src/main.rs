use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use maestro_core::config::AppConfig;
use maestro_core::workflow::{OnError, WorkflowDefinition};
use maestro_engine::WorkflowEngine;

#[derive(Parser)]
#[command(name = "maestro", version, about = "Multi-agent workflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml", env = "MAESTRO_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check workflow definition files (TOML or JSON) without running them
    Validate {
        /// Definition files to check
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Register the configured workflows and list them
    Workflows,
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "maestro", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        AppConfig::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("maestro={},warn", config.log.level))
        }))
        .with_target(false)
        .init();

    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
    }

    match cli.command {
        Commands::Validate { files } => Ok(validate_files(&files)),
        Commands::Workflows => {
            let base_dir = config_dir(&cli.config);
            list_workflows(&config, &base_dir).await
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }
}

fn config_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn validate_files(files: &[PathBuf]) -> ExitCode {
    let mut failures = 0;
    for path in files {
        match WorkflowDefinition::load(path).and_then(|wf| wf.validate().map(|_| wf)) {
            Ok(wf) => println!(
                "ok    {} ({} v{}, {} steps)",
                path.display(),
                wf.id,
                wf.version,
                wf.steps.len()
            ),
            Err(e) => {
                failures += 1;
                println!("error {}: {}", path.display(), e);
            }
        }
    }

    if failures == 0 {
        ExitCode::SUCCESS
    } else {
        eprintln!("{} of {} definition(s) invalid", failures, files.len());
        ExitCode::FAILURE
    }
}

async fn list_workflows(config: &AppConfig, base_dir: &Path) -> anyhow::Result<ExitCode> {
    let engine = WorkflowEngine::new(config.engine.clone());

    for path in config.workflow_paths(base_dir) {
        let workflow = WorkflowDefinition::load(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        engine
            .register_workflow(workflow)
            .await
            .with_context(|| format!("registering {}", path.display()))?;
    }

    let workflows = engine.get_workflows().await;
    if workflows.is_empty() {
        println!("No workflows configured.");
        return Ok(ExitCode::SUCCESS);
    }

    info!(count = workflows.len(), "Workflows registered");
    for wf in workflows {
        println!("{} v{}  {}", wf.id, wf.version, wf.name);
        if !wf.description.is_empty() {
            println!("    {}", wf.description);
        }
        for step in &wf.steps {
            let condition = step
                .condition
                .as_deref()
                .map(|c| format!("  when {}", c))
                .unwrap_or_default();
            println!("    - {} -> {}{}", step.id, step.agent_id, condition);
        }
        if let Some(policy) = &wf.error_handling {
            let on_error = match policy.on_error {
                OnError::Stop => "stop",
                OnError::Continue => "continue",
                OnError::Retry => "retry",
                OnError::Fallback => "fallback",
            };
            if policy.fallback_steps.is_empty() {
                println!("    on error: {}", on_error);
            } else {
                println!(
                    "    on error: {} [{}]",
                    on_error,
                    policy.fallback_steps.join(", ")
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
