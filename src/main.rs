use clap::{Parser, Subcommand};
use scout::checkpoint::{CheckpointStore, FileCheckpointStore};
use scout::config::ResearchConfig;
use std::path::PathBuf;
use tracing::debug;

/// Inspect and manage checkpointed research runs
#[derive(Parser)]
#[command(name = "scout")]
#[command(about = "Checkpointed research run orchestration", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to a TOML configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage checkpointed runs
    Runs {
        #[command(subcommand)]
        command: RunsCommands,
    },
}

#[derive(Subcommand)]
enum RunsCommands {
    /// List all checkpointed runs
    List,
    /// Show the state of one run
    Show {
        /// Run id to show
        run_id: String,
    },
    /// Delete checkpoints for finished runs, or one run by id
    Clean {
        /// Specific run to delete
        run_id: Option<String>,
        /// Delete every checkpointed run
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(cli.verbose >= 2)
        .init();

    debug!("Scout started with verbosity level: {}", cli.verbose);

    let result = run(cli).await;
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => ResearchConfig::load(path)?,
        None => ResearchConfig::default(),
    };
    let store = FileCheckpointStore::new(config.resolve_checkpoint_dir()?);

    match cli.command {
        Commands::Runs { command } => match command {
            RunsCommands::List => {
                let run_ids = store.list().await?;
                if run_ids.is_empty() {
                    println!("No checkpointed runs found.");
                    return Ok(());
                }
                for run_id in run_ids {
                    match store.load(&run_id).await {
                        Ok(Some(checkpoint)) => {
                            let state = &checkpoint.state;
                            println!(
                                "{run_id}  phase={} steps={} topic={:?}",
                                state.phase,
                                state.plan.len(),
                                state.topic
                            );
                        }
                        Ok(None) => {}
                        Err(e) => eprintln!("{run_id}  unreadable: {e}"),
                    }
                }
            }
            RunsCommands::Show { run_id } => {
                let checkpoint = store
                    .load(&run_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("run {run_id} not found"))?;
                let state = &checkpoint.state;
                println!("Run {run_id}");
                println!("  topic:    {}", state.topic);
                println!("  phase:    {}", state.phase);
                println!("  sequence: {}", checkpoint.sequence);
                println!("  saved at: {}", checkpoint.saved_at);
                println!(
                    "  usage:    {} decisions, {} tool calls",
                    state.usage.decision_calls, state.usage.tool_calls
                );
                for step in &state.plan {
                    println!(
                        "  step {}: [{:?}] {} ({} attempts, {} findings)",
                        step.id + 1,
                        step.status,
                        step.description,
                        step.attempts.len(),
                        step.accumulated_findings.len()
                    );
                }
                if let Some(pending) = &state.pending_approval {
                    println!(
                        "  pending approval: `{}` (fingerprint {})",
                        pending.action, pending.fingerprint
                    );
                }
            }
            RunsCommands::Clean { run_id, all } => {
                if let Some(run_id) = run_id {
                    store.delete(&run_id).await?;
                    println!("Deleted run {run_id}.");
                    return Ok(());
                }
                let mut deleted = 0usize;
                for run_id in store.list().await? {
                    let Ok(Some(checkpoint)) = store.load(&run_id).await else {
                        continue;
                    };
                    if all || checkpoint.state.phase.is_terminal() {
                        store.delete(&run_id).await?;
                        deleted += 1;
                    }
                }
                println!("Deleted {deleted} run(s).");
            }
        },
    }
    Ok(())
}
