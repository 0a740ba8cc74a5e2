//! `kgpipe down`: stop the deploy server.

use anyhow::Result;
use colored::Colorize;
use kgpipe::pipeline::{Orchestrator, TeardownMode};

/// Stops deploy; with `purge` also destroys the volume.
pub async fn run(orchestrator: &Orchestrator, purge: bool) -> Result<u8> {
    let mode = if purge {
        TeardownMode::Purge
    } else {
        TeardownMode::StopOnly
    };
    let report = orchestrator.teardown(mode).await?;

    match report.stopped_pid {
        Some(pid) => println!("{} deploy (pid {pid})", "Stopped".green()),
        None => println!("Deploy was not running"),
    }
    if report.purged {
        println!(
            "{} {}",
            "Destroyed volume".yellow(),
            orchestrator.volume().root().display()
        );
    }
    Ok(0)
}
