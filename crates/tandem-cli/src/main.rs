mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    checkpoint::CheckpointSubcommand, config::ConfigSubcommand, context::ContextSubcommand,
    plan::PlanSubcommand, task::TaskSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tandem",
    about = "Coordinate role-specialized workers through test-driven lanes with durable, checkpointed context",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .tandem/ or .git/)
    #[arg(long, global = true, env = "TANDEM_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize tandem in the current project
    Init,

    /// Run a workflow to completion
    Run {
        /// Workflow definition (YAML)
        workflow: PathBuf,

        /// Use simulated workers regardless of the workflow's agent settings
        #[arg(long)]
        simulate: bool,

        /// Continue from the saved context instead of starting fresh
        #[arg(long)]
        resume: bool,
    },

    /// Show saved workflows, or one workflow's tasks
    Status {
        /// Workflow id (omit to list all)
        id: Option<String>,
    },

    /// Inspect a workflow definition without running it
    Plan {
        #[command(subcommand)]
        subcommand: PlanSubcommand,
    },

    /// Inspect stored workflow contexts
    Context {
        #[command(subcommand)]
        subcommand: ContextSubcommand,
    },

    /// Accept failed tasks or unblock blocked ones in a saved workflow
    Task {
        #[command(subcommand)]
        subcommand: TaskSubcommand,
    },

    /// Create, list and roll back to checkpoints
    Checkpoint {
        #[command(subcommand)]
        subcommand: CheckpointSubcommand,
    },

    /// Show or validate the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Run {
            workflow,
            simulate,
            resume,
        } => cmd::run::run(&root, &workflow, simulate, resume, cli.json),
        Commands::Status { id } => cmd::status::run(&root, id.as_deref(), cli.json),
        Commands::Plan { subcommand } => cmd::plan::run(subcommand, cli.json),
        Commands::Context { subcommand } => cmd::context::run(&root, subcommand, cli.json),
        Commands::Task { subcommand } => cmd::task::run(&root, subcommand, cli.json),
        Commands::Checkpoint { subcommand } => cmd::checkpoint::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
