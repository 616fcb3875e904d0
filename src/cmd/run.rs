//! In-process sequence run: `sequencer run <topics>...`.
//!
//! Acts as the consumer: prints each episode as it is delivered and confirms
//! it, which releases generation of the next-but-one job.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use sequencer::config::SequencerConfig;
use sequencer::sequence::coordinator::SequenceCoordinator;
use sequencer::sequence::gate::ConfirmationGate;
use sequencer::sequence::memory::MemoryStore;
use sequencer::sequence::server::build_collaborators;
use sequencer::sequence::stream::{ResultStream, StreamEvent};

const PREVIEW_CHARS: usize = 160;

pub async fn cmd_run(
    config: &SequencerConfig,
    topics: Vec<String>,
    params: Vec<String>,
    confirm: bool,
) -> Result<()> {
    let (generator, processors) = build_collaborators(config)?;
    let store = Arc::new(MemoryStore::new(config.ttl()));
    let coordinator =
        SequenceCoordinator::new(store.clone(), generator, processors, config.coordinator_options());
    let stream = ResultStream::new(
        store.clone(),
        config.timing(),
        coordinator.shutdown_token(),
    );
    let gate = ConfirmationGate::new(store);

    println!();
    println!("{}", console::style("Episode Sequencer").bold().cyan());
    println!("  topics: {}", topics.len());
    println!("  generator: {}", config.generator.url);
    println!();

    let sequence_id = coordinator.create_sequence(topics, params).await?;
    println!("  sequence: {}", console::style(&sequence_id).dim());
    println!();

    let mut events = stream.subscribe(&sequence_id).await?;
    let mut failed = 0usize;
    let mut finished = false;

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::JobReady { index, result, .. } => {
                println!(
                    "{} [{}] {}",
                    console::style("✓").green(),
                    index,
                    console::style(&result.topic).bold()
                );
                if let Some(param) = &result.forced_param {
                    println!("    param: {}", param);
                }
                println!("    {}", preview(&result.content));
                for artifact in &result.artifacts {
                    println!("    {}: {}", artifact.collaborator, artifact.uri);
                }
                if confirm {
                    gate.confirm(&sequence_id, index)
                        .await
                        .with_context(|| format!("Failed to confirm job {}", index))?;
                }
            }
            StreamEvent::JobFailed { index, error, .. } => {
                failed += 1;
                println!(
                    "{} [{}] {} {}",
                    console::style("✗").red(),
                    index,
                    console::style("Error:").red().bold(),
                    error
                );
            }
            StreamEvent::SequenceComplete {
                total, succeeded, ..
            } => {
                println!();
                println!("Sequence complete: {}/{} episodes ready", succeeded, total);
                finished = true;
                break;
            }
        }
    }

    drop(events);
    coordinator.shutdown(Duration::from_secs(5)).await;

    if !finished {
        anyhow::bail!("Stream ended before sequence {} completed", sequence_id);
    }
    if failed > 0 {
        anyhow::bail!("{} job(s) failed", failed);
    }
    Ok(())
}

fn preview(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        flat
    } else {
        let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
        format!("{}…", cut)
    }
}
