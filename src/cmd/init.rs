//! `sequencer init`: default config file plus an empty database.

use anyhow::{Context, Result};
use std::path::Path;

use sequencer::config::SequencerConfig;
use sequencer::sequence::server::open_store;

pub fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    let config = if config_path.exists() && !force {
        println!("Config already exists at {}", config_path.display());
        SequencerConfig::load(config_path)?
    } else {
        if let Some(dir) = config_path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let config = SequencerConfig::default();
        config.save(config_path)?;
        println!("Created {}", config_path.display());
        config
    };

    open_store(&config.server.db_path, config.ttl())?;
    println!(
        "Sequence database initialized at {}",
        config.server.db_path.display()
    );
    println!();
    println!("Next: set [generator] url, then run 'sequencer serve'.");
    Ok(())
}
