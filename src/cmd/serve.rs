//! HTTP service command: `sequencer serve`.

use anyhow::Result;

use sequencer::config::SequencerConfig;
use sequencer::sequence::server::{ServerConfig, build_collaborators, start_server};

pub async fn cmd_serve(
    mut config: SequencerConfig,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    config.server.dev_mode |= dev;

    let (generator, processors) = build_collaborators(&config)?;
    tracing::info!(
        generator = %config.generator.url,
        processors = processors.len(),
        "collaborators configured"
    );

    start_server(
        ServerConfig::from_config(&config),
        config.coordinator_options(),
        generator,
        processors,
    )
    .await
}
