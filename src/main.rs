use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sequencer::config::{SequencerConfig, default_config_path};

mod cmd;

#[derive(Parser)]
#[command(name = "sequencer")]
#[command(version, about = "Chained episode generation coordinator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to sequencer.toml (defaults to .sequencer/sequencer.toml)
    #[arg(short, long, global = true, env = "SEQUENCER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP service
    Serve {
        /// Port to serve on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (permissive CORS for a local front-end)
        #[arg(long)]
        dev: bool,
    },
    /// Write a default config file and create the database
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Generate one sequence in-process and print each episode as it lands
    Run {
        /// Topics, in playback order
        #[arg(required = true)]
        topics: Vec<String>,

        /// Forced parameter for each index (repeatable)
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,

        /// Don't confirm delivered jobs; later jobs then start at the wait ceiling
        #[arg(long)]
        no_confirm: bool,
    },
    /// Delete expired sequences from the database
    Purge,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(std::path::Path::new(".")));

    // `init` and `config validate` must work on a config that doesn't load
    // cleanly yet, so they resolve it themselves.
    match &cli.command {
        Commands::Init { force } => return cmd::cmd_init(&config_path, *force),
        Commands::Config { command } => return cmd::cmd_config(&config_path, command.clone()),
        _ => {}
    }

    let config = SequencerConfig::resolve(&config_path)?;
    let _log_guard = sequencer::logging::init_tracing(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Serve { port, host, dev } => cmd::cmd_serve(config, port, host, dev).await?,
        Commands::Run {
            topics,
            params,
            no_confirm,
        } => cmd::cmd_run(&config, topics, params, !no_confirm).await?,
        Commands::Purge => cmd::cmd_purge(&config).await?,
        Commands::Init { .. } | Commands::Config { .. } => {}
    }

    Ok(())
}
