use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vault_cli::cmd::{self, config::ConfigSubcommand, run::RunExit};
use vault_cli::root;

#[derive(Parser)]
#[command(
    name = "vault",
    about = "Supervise the watchers, router and scheduler of a Markdown work vault",
    version,
    propagate_version = true
)]
struct Cli {
    /// Vault root (default: nearest directory with .vault/, else cwd)
    #[arg(long, global = true, env = "VAULT_PATH")]
    vault: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the stage folders, state directory and default config
    Init,

    /// Start every configured unit and supervise it until Ctrl-C / SIGTERM
    Run {
        /// Log intended actions without touching the vault
        #[arg(long)]
        dry_run: bool,
    },

    /// Write a self-reflection report for the trailing window
    Reflect {
        /// Window length in days (default: reflection.window_days)
        #[arg(long)]
        days: Option<u32>,

        /// Print the report without writing it or logging
        #[arg(long)]
        dry_run: bool,
    },

    /// Show item counts, overdue items and escalations
    Status,

    /// Inspect and validate .vault/config.yaml
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
        .init();

    let root = root::resolve_root(cli.vault.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Run { dry_run } => cmd::run::run(&root, dry_run),
        Commands::Reflect { days, dry_run } => cmd::reflect::run(&root, days, dry_run, cli.json),
        Commands::Status => cmd::status::run(&root, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(e.downcast_ref::<RunExit>().map_or(1, RunExit::exit_code));
    }
}
