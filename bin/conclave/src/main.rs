mod commands;

use clap::{Parser, Subcommand};
use conclave_core::Paths;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "conclave")]
#[command(about = "Multi-agent orchestration runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Base directory for config and data (default: ~/.conclave)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show paths, configuration and memory status
    Status,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Run a demo runtime: agents, bus, scheduler and memory wired together
    Run {
        /// Number of agents to start
        #[arg(short, long, default_value_t = 3)]
        agents: usize,

        /// Number of tasks to submit
        #[arg(short, long, default_value_t = 6)]
        tasks: usize,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // -v wins over RUST_LOG
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let paths = cli.home.map(Paths::with_base).unwrap_or_default();

    match cli.command {
        Commands::Status => {
            commands::status::run(&paths).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Init { force } => {
                commands::config_cmd::init(&paths, force).await?;
            }
            ConfigCommands::Show => {
                commands::config_cmd::show(&paths).await?;
            }
        },
        Commands::Run { agents, tasks } => {
            commands::run_cmd::run(&paths, agents, tasks).await?;
        }
    }

    Ok(())
}
