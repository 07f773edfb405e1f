//! TMI CLI — the main entry point.
//!
//! Commands:
//! - `serve`        — Start the collaboration server
//! - `migrate`      — Bootstrap or upgrade the database schema
//! - `doctor`       — Diagnose configuration and storage health
//! - `config`       — Configuration management
//! - `completions`  — Generate shell completions

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

mod commands;

#[derive(Parser)]
#[command(
    name = "tmi",
    about = "TMI — multi-tenant threat modeling collaboration server.",
    version,
    long_about = "TMI (Threat Modeling Improved) serves threat models and diagrams with\nreal-time collaborative editing, webhook fan-out of domain events, and\nadmin-registered addon integrations."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket server and background workers
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the host (e.g. 0.0.0.0 for Docker)
        #[arg(long)]
        host: Option<String>,
    },

    /// Create or upgrade the database schema
    Migrate,

    /// Diagnose configuration and storage health
    Doctor,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the current configuration
    Validate,
    /// Show the resolved configuration
    Show,
    /// Write a default tmi.toml in the working directory
    Init,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { port, host } => commands::serve::run(port, host).await?,
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Doctor => commands::doctor::run().await?,
        Commands::Config { action } => match action {
            ConfigAction::Validate => commands::config_cmd::validate().await?,
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Init => commands::config_cmd::init().await?,
        },
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "tmi", &mut std::io::stdout());
        }
    }

    Ok(())
}
