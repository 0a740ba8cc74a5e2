//! Command implementations for the kgpipe CLI.
//!
//! Each command module provides a `run` function returning the process exit
//! code.

pub mod down;
pub mod logs;
pub mod reset;
pub mod status;
pub mod up;

use colored::{ColoredString, Colorize};
use kgpipe::core::StageStatus;

/// Renders a stage status with a color matching its outcome.
pub fn paint_status(status: StageStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        StageStatus::Succeeded | StageStatus::Up => text.green(),
        StageStatus::Failed => text.red().bold(),
        StageStatus::Cancelled => text.yellow(),
        StageStatus::Running => text.cyan(),
        StageStatus::Pending | StageStatus::Stopped => text.dimmed(),
    }
}
