//! `kgpipe reset`: recreate the shared volume.

use anyhow::Result;
use colored::Colorize;
use kgpipe::pipeline::Orchestrator;

/// Destroys and recreates the volume.
pub async fn run(orchestrator: &Orchestrator) -> Result<u8> {
    let marker = orchestrator.reset().await?;
    println!(
        "{} {} (generation {})",
        "Reset volume".green(),
        orchestrator.volume().root().display(),
        marker.generation
    );
    Ok(0)
}
