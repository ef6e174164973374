mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{action::EnqueueArgs, action::ListArgs, config::ConfigSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "hookq",
    about = "Durable action scheduler: enqueue hooks, run them on schedule, inspect the queue",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .hookq/)
    #[arg(long, global = true, env = "HOOKQ_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .hookq/ with a default config and an empty store
    Init,

    /// Schedule a hook invocation
    Enqueue(EnqueueArgs),

    /// Cancel an action (in-progress actions finish their current run first)
    Cancel { id: String },

    /// Show one action with its event history
    Get { id: String },

    /// List actions with filters, sorting and paging
    List(ListArgs),

    /// Per-status totals
    Counts {
        #[arg(long)]
        group: Option<String>,
    },

    /// Counts plus the next due and oldest running action
    Summary,

    /// Run a single scheduler pass and exit
    Tick,

    /// Run schedulers until interrupted
    Work {
        /// Number of schedulers sharing the store (default: worker.workers)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Return actions held by expired claims to the queue
    Reclaim,

    /// Delete finished actions older than the retention window
    Purge {
        /// Override retention.completed_days
        #[arg(long)]
        older_than_days: Option<u32>,
    },

    /// Inspect and validate .hookq/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Serve the JSON API (and run workers unless --no-worker)
    Serve {
        #[arg(long, default_value = "3170")]
        port: u16,

        /// Only serve the API; do not execute actions
        #[arg(long)]
        no_worker: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Work { .. } | Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, cli.json),
        Commands::Enqueue(args) => cmd::action::enqueue(&root, args, cli.json),
        Commands::Cancel { id } => cmd::action::cancel(&root, &id, cli.json),
        Commands::Get { id } => cmd::action::get(&root, &id, cli.json),
        Commands::List(args) => cmd::action::list(&root, args, cli.json),
        Commands::Counts { group } => cmd::status::counts(&root, group.as_deref(), cli.json),
        Commands::Summary => cmd::status::summary(&root, cli.json),
        Commands::Tick => cmd::worker::tick(&root, cli.json),
        Commands::Work { workers } => cmd::worker::work(&root, workers),
        Commands::Reclaim => cmd::worker::reclaim(&root, cli.json),
        Commands::Purge { older_than_days } => cmd::worker::purge(&root, older_than_days, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Serve { port, no_worker } => cmd::serve::run(&root, port, no_worker),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
