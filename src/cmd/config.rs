//! Configuration view and validation commands: `sequencer config`.

use anyhow::{Context, Result};
use std::path::Path;

use sequencer::config::SequencerConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {} (using defaults)", config_path.display());
            }
            println!();

            let mut config = SequencerConfig::load_or_default(config_path)?;
            dotenvy::dotenv().ok();
            config.apply_env_with(|key| std::env::var(key).ok())?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("Effective values (with env overrides):");
            println!();
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No sequencer.toml found. Using defaults (valid).");
                return Ok(());
            }

            let config = SequencerConfig::load(config_path)?;
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                anyhow::bail!("{} configuration problem(s) found", problems.len());
            }
            println!();
        }
    }

    Ok(())
}
