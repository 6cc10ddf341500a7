//! CLI command definitions for trainforge.
//!
//! `serve` boots the orchestration service and keeps it running behind an
//! operator console; the other commands boot, run one pipeline and exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use super::console::{ConsoleCommand, HELP};
use crate::config::ServiceConfig;
use crate::metrics::{export_metrics, init_metrics};
use crate::orchestrator::{CheckpointPoller, Orchestrator, StatusRecord, TrainingStatus};
use crate::runtime::DockerRuntime;
use crate::store::{JsonProjectStore, ProjectStore};

/// Orchestrates containerized training, export and test workloads.
#[derive(Parser)]
#[command(name = "trainforge")]
#[command(about = "Orchestrate containerized model training, export and test pipelines")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file. `TRAINFORGE_*` variables override it.
    #[arg(short, long, env = "TRAINFORGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Boot the service and accept commands on stdin until `quit` or Ctrl-C.
    Serve,

    /// Run one training pipeline. Ctrl-C halts the training container.
    Train {
        /// Project id.
        project: String,
    },

    /// Export the checkpoint written at an epoch.
    Export {
        /// Project id.
        project: String,
        /// Checkpoint epoch.
        checkpoint: u32,
        /// Export name.
        #[arg(short, long, default_value = "export")]
        name: String,
    },

    /// Run an export against a video.
    Test {
        /// Project id.
        project: String,
        /// Export id.
        export: String,
        /// Input video id.
        video: String,
        /// Test name.
        #[arg(short, long, default_value = "test")]
        name: String,
    },

    /// List stored projects without booting the service.
    #[command(alias = "ls")]
    Projects,
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
    let config = ServiceConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve => run_serve_command(&config).await,
        Commands::Train { project } => run_train_command(&config, &project).await,
        Commands::Export {
            project,
            checkpoint,
            name,
        } => run_export_command(&config, &project, checkpoint, &name).await,
        Commands::Test {
            project,
            export,
            video,
            name,
        } => run_test_command(&config, &name, &project, &export, &video).await,
        Commands::Projects => run_projects_command(&config).await,
    }
}

/// Connects to Docker, opens the store and boots the service.
async fn boot_service(config: &ServiceConfig) -> anyhow::Result<Arc<Orchestrator>> {
    let runtime = Arc::new(DockerRuntime::new().context("Failed to connect to Docker")?);
    let store = Arc::new(JsonProjectStore::new(&config.store_dir));
    let orchestrator = Arc::new(Orchestrator::containerized(runtime, store, config));

    orchestrator.boot().await.context("Service failed to boot")?;
    Ok(orchestrator)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_status(project_id: &str, record: &StatusRecord) {
    println!(
        "{:<24} {:<13} epoch {}/{}",
        project_id, record.training_status, record.current_epoch, record.last_epoch
    );
}

// ============================================================================
// Serve
// ============================================================================

async fn run_serve_command(config: &ServiceConfig) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;
    let orchestrator = boot_service(config).await?;
    let poller = CheckpointPoller::start(orchestrator.clone(), config.checkpoint_poll_interval());

    println!("trainforge ready. Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("error: {e}");
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        if let Err(e) = execute(&orchestrator, command).await {
            println!("error: {e:#}");
        }
    }

    poller.stop().await;
    halt_active_training(&orchestrator).await;
    Ok(())
}

/// Halts every project with a live training container so none outlives the
/// console.
async fn halt_active_training(orchestrator: &Orchestrator) {
    let active = orchestrator
        .list_statuses()
        .await
        .into_iter()
        .filter(|(_, record)| {
            matches!(
                record.training_status,
                TrainingStatus::Training | TrainingStatus::Paused
            )
        });

    for (project_id, _) in active {
        match orchestrator.halt(&project_id).await {
            Ok(()) => info!(project_id = %project_id, "Training halted on shutdown"),
            Err(e) => warn!(project_id = %project_id, error = %e, "Failed to halt training on shutdown"),
        }
    }
}

async fn execute(orchestrator: &Arc<Orchestrator>, command: ConsoleCommand) -> anyhow::Result<()> {
    match command {
        ConsoleCommand::Train { project } => {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.start(&project).await {
                    warn!(project_id = %project, error = %e, "Training run ended with an error");
                }
            });
            println!("training started");
        }
        ConsoleCommand::Pause { project } => {
            orchestrator.pause_training(&project).await?;
            println!("paused");
        }
        ConsoleCommand::Resume { project } => {
            orchestrator.resume_training(&project).await?;
            println!("resumed");
        }
        ConsoleCommand::Halt { project } => {
            orchestrator.halt(&project).await?;
            println!("halted");
        }
        ConsoleCommand::Export {
            project,
            checkpoint,
            name,
        } => {
            let export = orchestrator.export(&project, checkpoint, &name).await?;
            print_json(&export)?;
        }
        ConsoleCommand::Test {
            project,
            export,
            video,
            name,
        } => {
            let test = orchestrator.test(&name, &project, &export, &video).await?;
            print_json(&test)?;
        }
        ConsoleCommand::Status { project: Some(project) } => {
            let record = orchestrator.get_status(&project).await?;
            print_status(&project, &record);
        }
        ConsoleCommand::Status { project: None } => {
            for (project_id, record) in orchestrator.list_statuses().await {
                print_status(&project_id, &record);
            }
        }
        ConsoleCommand::Checkpoints { project } => {
            print_json(&orchestrator.get_checkpoints(&project).await?)?;
        }
        ConsoleCommand::Exports { project } => {
            print_json(&orchestrator.get_exports(&project).await?)?;
        }
        ConsoleCommand::Videos { project } => {
            print_json(&orchestrator.get_videos(&project).await?)?;
        }
        ConsoleCommand::Tests { project } => {
            print_json(&orchestrator.get_tests(&project).await?)?;
        }
        ConsoleCommand::Readiness => {
            let history: Vec<_> = orchestrator
                .readiness_history()
                .iter()
                .map(|s| s.as_str())
                .collect();
            println!("{}", history.join(" -> "));
        }
        ConsoleCommand::Metrics => print!("{}", export_metrics()),
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

// ============================================================================
// One-shot pipelines
// ============================================================================

async fn run_train_command(config: &ServiceConfig, project: &str) -> anyhow::Result<()> {
    let orchestrator = boot_service(config).await?;
    let poller = CheckpointPoller::start(orchestrator.clone(), config.checkpoint_poll_interval());

    let mut run = {
        let orchestrator = orchestrator.clone();
        let project = project.to_string();
        tokio::spawn(async move { orchestrator.start(&project).await })
    };

    let finished = tokio::select! {
        joined = &mut run => Some(joined),
        _ = tokio::signal::ctrl_c() => None,
    };

    let Some(joined) = finished else {
        info!(project_id = project, "Interrupt received, halting training");
        let halted = orchestrator.halt(project).await;
        let _ = run.await;
        poller.stop().await;
        halted.context("Failed to halt training")?;
        println!("halted");
        return Ok(());
    };

    poller.stop().await;
    joined.context("Training task panicked")??;

    let record = orchestrator.get_status(project).await?;
    print_status(project, &record);
    Ok(())
}

async fn run_export_command(
    config: &ServiceConfig,
    project: &str,
    checkpoint: u32,
    name: &str,
) -> anyhow::Result<()> {
    let orchestrator = boot_service(config).await?;
    let export = orchestrator.export(project, checkpoint, name).await?;
    print_json(&export)
}

async fn run_test_command(
    config: &ServiceConfig,
    name: &str,
    project: &str,
    export: &str,
    video: &str,
) -> anyhow::Result<()> {
    let orchestrator = boot_service(config).await?;
    let test = orchestrator.test(name, project, export, video).await?;
    print_json(&test)
}

async fn run_projects_command(config: &ServiceConfig) -> anyhow::Result<()> {
    let store = JsonProjectStore::new(&config.store_dir);
    let projects = store.retrieve_all().await?;

    if projects.is_empty() {
        println!("No projects in {}", config.store_dir.display());
        return Ok(());
    }

    println!(
        "{:<24} {:<24} {:>6} {:>11} {:>7} {:>6}",
        "ID", "NAME", "EPOCHS", "CHECKPOINTS", "EXPORTS", "VIDEOS"
    );
    for project in projects {
        println!(
            "{:<24} {:<24} {:>6} {:>11} {:>7} {:>6}",
            project.id,
            project.name,
            project.hyperparameters.epochs,
            project.checkpoints.len(),
            project.exports.len(),
            project.videos.len()
        );
    }
    Ok(())
}
