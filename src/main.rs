use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "Cluster lifecycle orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Node state directory (defaults to /var/lib/anvil)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Log output format: text or json
    #[arg(long, global = true, default_value = "text")]
    pub log_format: anvil::logging::LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and drive operation plans
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Display the plan with per-phase states
    Display {
        #[arg(long)]
        operation_id: Option<String>,
    },
    /// Execute a phase, or the whole plan for `/`
    Execute {
        #[arg(long, default_value = "/")]
        phase: String,
        /// Re-run completed phases and ignore unmet prerequisites
        #[arg(long)]
        force: bool,
        /// Resume the whole plan from where it stopped
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        operation_id: Option<String>,
        /// Per-phase timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Roll back a phase, or the whole plan for `/`
    Rollback {
        #[arg(long, default_value = "/")]
        phase: String,
        #[arg(long)]
        force: bool,
        /// Report what would be rolled back without doing it
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        operation_id: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Resume plan execution from where it stopped
    Resume {
        #[arg(long)]
        operation_id: Option<String>,
    },
    /// Stream plan progress until the operation reaches a terminal state
    Follow {
        #[arg(long)]
        operation_id: Option<String>,
    },
    /// Settle the operation state from the plan's current state
    Complete {
        #[arg(long)]
        operation_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = anvil::logging::init(cli.verbose, cli.log_format);

    let state_dir = match cli.state_dir.clone() {
        Some(dir) => dir,
        None => anvil::config::AnvilConfig::default().node.state_dir,
    };
    let config = anvil::config::AnvilConfig::load_or_default(&state_dir)
        .context("failed to load configuration")?;

    match &cli.command {
        Commands::Plan { command } => match command {
            PlanCommands::Display { operation_id } => {
                cmd::cmd_display(&config, operation_id.as_deref()).await
            }
            PlanCommands::Execute {
                phase,
                force,
                resume,
                operation_id,
                timeout,
            } => {
                // Resuming re-enters the whole plan; completed phases are
                // skipped by the engine.
                let phase = if *resume { "/" } else { phase.as_str() };
                cmd::cmd_execute(&config, phase, *force, operation_id.as_deref(), *timeout).await
            }
            PlanCommands::Rollback {
                phase,
                force,
                dry_run,
                operation_id,
                timeout,
            } => {
                cmd::cmd_rollback(
                    &config,
                    phase,
                    *force,
                    *dry_run,
                    operation_id.as_deref(),
                    *timeout,
                )
                .await
            }
            PlanCommands::Resume { operation_id } => {
                cmd::cmd_execute(&config, "/", false, operation_id.as_deref(), None).await
            }
            PlanCommands::Follow { operation_id } => {
                cmd::cmd_follow(&config, operation_id.as_deref()).await
            }
            PlanCommands::Complete { operation_id } => {
                cmd::cmd_complete(&config, operation_id.as_deref()).await
            }
        },
    }
}
