use anyhow::Result;

use sequencer::config::SequencerConfig;
use sequencer::sequence::server::open_store;
use sequencer::sequence::store::StateStore;

pub async fn cmd_purge(config: &SequencerConfig) -> Result<()> {
    let store = open_store(&config.server.db_path, config.ttl())?;
    let removed = store.purge_expired().await?;
    println!(
        "Removed {} expired sequence(s) from {}",
        removed,
        config.server.db_path.display()
    );
    Ok(())
}
