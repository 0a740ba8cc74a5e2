//! `kgpipe up`: run the pipeline.

use super::paint_status;
use anyhow::Result;
use colored::Colorize;
use kgpipe::pipeline::{Orchestrator, PipelineReport, RunOptions, TeardownMode};
use tracing::warn;

/// Runs the pipeline; Ctrl-C before deploy is up cancels the run.
pub async fn run(orchestrator: Orchestrator, reset: bool, attach: bool) -> Result<u8> {
    let cancel = orchestrator.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel("interrupted by operator");
        }
    });

    let report = orchestrator.run_pipeline(RunOptions { reset }).await;
    interrupt.abort();
    let report = report?;

    print_report(&report);
    let code = u8::try_from(report.exit_code()).unwrap_or(1);
    if !report.is_success() || !attach {
        return Ok(code);
    }

    println!(
        "{} serving at {}; press Ctrl-C to stop",
        "kgpipe".bold(),
        report.endpoint().unwrap_or("?").cyan()
    );
    tokio::signal::ctrl_c().await?;
    let teardown = orchestrator.teardown(TeardownMode::StopOnly).await?;
    match teardown.stopped_pid {
        Some(pid) => println!("Stopped deploy (pid {pid})"),
        None => warn!("Deploy was no longer running"),
    }
    Ok(0)
}

fn print_report(report: &PipelineReport) {
    for entry in &report.record.stages {
        let duration = entry
            .duration_ms()
            .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
            .unwrap_or_default();
        println!("  {:<8} {} {}", entry.stage.as_str(), paint_status(entry.status), duration.dimmed());
    }

    if report.is_success() {
        println!(
            "{} {} ({})",
            "Pipeline up:".green().bold(),
            report.endpoint().unwrap_or("?"),
            report.phase
        );
    } else if report.is_cancelled() {
        println!("{} {}", "Pipeline cancelled".yellow().bold(), report.phase);
    } else if let Some(failure) = report.failure() {
        println!(
            "{} stage '{}' ({}): {}",
            "Pipeline failed:".red().bold(),
            failure.stage,
            failure.kind,
            failure.message
        );
        println!("  see `kgpipe logs {}`", failure.stage);
    }
}
