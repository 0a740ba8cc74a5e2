//! `kgpipe status`: show the last run record.

use super::paint_status;
use anyhow::Result;
use colored::Colorize;
use kgpipe::pipeline::{Orchestrator, PipelineStatus};

/// Prints the volume state and the last run record.
pub async fn run(orchestrator: &Orchestrator, json: bool) -> Result<u8> {
    let status = orchestrator.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", render(&status));
    }
    Ok(0)
}

fn render(status: &PipelineStatus) -> String {
    let mut lines = Vec::new();
    lines.push(format!("{} {}", "Volume:".bold(), status.volume.display()));

    let Some(marker) = &status.marker else {
        lines.push("  not created yet; run `kgpipe up`".dimmed().to_string());
        return lines.join("\n") + "\n";
    };
    lines.push(format!(
        "  generation {} created {}",
        marker.generation,
        marker.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    lines.push(format!("  {} artifacts published", status.artifacts.len()));

    match &status.last_run {
        Some(record) => {
            lines.push(format!(
                "{} {} ({})",
                "Last run:".bold(),
                record.run_id,
                record.phase
            ));
            for entry in &record.stages {
                let mut line = format!("  {:<8} {}", entry.stage.as_str(), paint_status(entry.status));
                if let Some(code) = entry.exit_code {
                    line.push_str(&format!("  exit {code}"));
                }
                if let Some(ref failure) = entry.failure {
                    line.push_str(&format!("  {}: {}", failure.kind, failure.message).red().to_string());
                }
                lines.push(line);
            }
        }
        None => lines.push(format!("{} none", "Last run:".bold())),
    }

    match (status.deploy_pid, status.deploy_alive) {
        (Some(pid), true) => lines.push(format!("{} running (pid {pid})", "Deploy:".bold())),
        (Some(pid), false) => lines.push(format!(
            "{} {}",
            "Deploy:".bold(),
            format!("pid {pid} recorded but not running").yellow()
        )),
        (None, _) => lines.push(format!("{} not running", "Deploy:".bold())),
    }
    lines.join("\n") + "\n"
}
