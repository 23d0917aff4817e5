use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use std::path::Path;
use tracing_subscriber::EnvFilter;

use waypoint::config::ProjectConfig;
use waypoint::orchestrator::Orchestrator;
use waypoint::process::{abort_running_agent, check_agent_installed};
use waypoint::state::StateStore;

#[derive(Parser)]
#[command(
    name = "waypoint",
    version,
    about = "Agent-driven feature workflow: specification, implementation, QA, PR"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow for a feature (expects docs/features/<name>/PRD.md)
    Run {
        /// Feature name
        feature: String,
        /// Start over instead of resuming a failed or rejected run
        #[arg(long)]
        fresh: bool,
        /// Auto-approve all validation gates
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Show workflow state for a feature
    Status {
        /// Feature name
        feature: String,
    },
    /// Terminate the agent process recorded in the PID file
    Abort,
    /// Reset workflow state for a feature
    Reset {
        /// Feature name
        feature: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// Write a default .waypoint/config.yaml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let project_dir = std::env::current_dir().context("Failed to resolve current directory")?;

    match cli.command {
        Commands::Run {
            feature,
            fresh,
            yes,
        } => cmd_run(&project_dir, &feature, fresh, yes).await,
        Commands::Status { feature } => cmd_status(&project_dir, &feature),
        Commands::Abort => cmd_abort(&project_dir),
        Commands::Reset { feature, force } => cmd_reset(&project_dir, &feature, force),
        Commands::Init => cmd_init(&project_dir),
    }
}

async fn cmd_run(project_dir: &Path, feature: &str, fresh: bool, yes: bool) -> Result<()> {
    let orchestrator = Orchestrator::new(project_dir, feature, yes)?;
    if !check_agent_installed("claude").await {
        bail!("The 'claude' CLI is not installed or not responding; install it first");
    }

    // Ctrl-C cancels the in-flight agent; the run loop then winds down.
    let registry = orchestrator.abort_registry();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, aborting agent");
            registry.abort();
        }
    });

    println!(
        "{} feature {}",
        style("Running").bold().green(),
        style(feature).bold()
    );
    if orchestrator.run(fresh).await? {
        println!("{}", style("Workflow completed").bold().green());
        Ok(())
    } else {
        let state = orchestrator.state_store().state();
        let reason = state
            .error_message
            .unwrap_or_else(|| format!("stopped in phase {}", state.phase));
        println!("{} {reason}", style("Workflow did not finish:").bold().red());
        std::process::exit(1);
    }
}

fn cmd_status(project_dir: &Path, feature: &str) -> Result<()> {
    let store = StateStore::open(project_dir, feature)?;
    let state = store.state();

    println!("{} {}", style("Feature:").bold(), feature);
    println!("{} {}", style("Phase:").bold(), state.phase);
    println!("{} {:?}", style("Status:").bold(), state.status);
    if let Some(started) = &state.started_at {
        println!("{} {started}", style("Started:").bold());
    }
    if state.tasks_total > 0 {
        println!(
            "{} {}/{}",
            style("Tasks:").bold(),
            state.tasks_completed,
            state.tasks_total
        );
    }
    if let Some(last) = &state.last_completed_phase {
        println!("{} {last}", style("Last completed phase:").bold());
    }
    if let Some(task_id) = &state.last_in_progress_task_id {
        println!("{} {task_id}", style("Task in progress:").bold());
    }
    println!(
        "{} {} ({} warnings{})",
        style("Circuit breaker:").bold(),
        state.circuit_breaker_state,
        state.circuit_breaker_attempts,
        state
            .circuit_breaker_last_trigger
            .as_deref()
            .map(|t| format!(", last trigger {t}"))
            .unwrap_or_default()
    );
    if let Some(error) = &state.error_message {
        println!("{} {error}", style("Error:").bold().red());
    }
    Ok(())
}

fn cmd_abort(project_dir: &Path) -> Result<()> {
    if abort_running_agent(project_dir)? {
        println!("{}", style("Agent process terminated").green());
    } else {
        println!("No running agent found");
    }
    Ok(())
}

fn cmd_reset(project_dir: &Path, feature: &str, force: bool) -> Result<()> {
    let store = StateStore::open(project_dir, feature)?;
    if !force {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Reset workflow state for '{feature}'?"))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted");
            return Ok(());
        }
    }
    store.reset()?;
    println!("{} {feature}", style("State reset for").green());
    Ok(())
}

fn cmd_init(project_dir: &Path) -> Result<()> {
    let config_file = project_dir.join(".waypoint").join("config.yaml");
    if config_file.exists() {
        bail!("{} already exists", config_file.display());
    }
    let mut config = ProjectConfig::default();
    config.name = project_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    config.save(project_dir)?;
    println!("{} {}", style("Wrote").green(), config_file.display());
    Ok(())
}
