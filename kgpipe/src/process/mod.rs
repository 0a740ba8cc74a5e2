//! Launching and supervising stage processes.
//!
//! Stages never spawn processes directly. They describe the command with a
//! [`CommandSpec`] and hand it to a [`ProcessLauncher`]: either
//! [`TokioLauncher`] for real child processes or the scripted launcher in
//! [`crate::testing`].

mod launcher;
mod probe;

pub use launcher::{read_log_tail, TokioLauncher, TokioService};
pub use probe::{HealthProbe, TcpProbe};

use crate::cancellation::CancellationToken;
use crate::core::StageName;
use crate::errors::{KgpipeError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A command to run for a stage.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Creates a command for a program.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Creates a command from a configured argv.
    ///
    /// # Errors
    ///
    /// Returns [`KgpipeError::Config`] if the argv is empty.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| KgpipeError::Config("command cannot be empty".to_string()))?;
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments.
    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl AsRef<Path>) -> Self {
        self.env
            .insert(key.into(), value.as_ref().to_string_lossy().into_owned());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Returns the command line as a single string for logs.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a run-to-completion process ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExitReport {
    /// Exit code; `None` if the process was killed by a signal.
    pub code: Option<i32>,
    /// True if the process was killed because the run was cancelled.
    pub cancelled: bool,
    /// Last lines the process wrote to stderr.
    pub stderr_tail: String,
}

impl ExitReport {
    /// A report for a process that exited with `code`.
    #[must_use]
    pub fn exited(code: i32, stderr_tail: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            cancelled: false,
            stderr_tail: stderr_tail.into(),
        }
    }

    /// Returns true if the process exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.cancelled && self.code == Some(0)
    }

    /// Describes the failure using the process's own error output when it
    /// wrote any.
    #[must_use]
    pub fn failure_message(&self, program: &str) -> String {
        let status = self
            .code
            .map_or_else(|| "was terminated by a signal".to_string(), |c| format!("exited with code {c}"));
        if self.stderr_tail.trim().is_empty() {
            format!("{program} {status}")
        } else {
            format!("{program} {status}: {}", self.stderr_tail.trim_end())
        }
    }
}

/// Handle to a long-running process.
///
/// The process leads its own process group. Dropping the handle leaves the
/// process running.
#[async_trait]
pub trait ServiceHandle: Send + Debug {
    /// Returns the OS process id.
    fn pid(&self) -> Option<u32>;

    /// Returns the exit code if the process has already exited.
    fn try_wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Kills the process and everything in its process group, then waits
    /// for the process to exit.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// Starts and stops stage processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync + Debug {
    /// Runs a command to completion, appending its output to `log_path`.
    ///
    /// The command runs in its own process group. When `cancel` fires the
    /// whole group is killed and the report is marked cancelled; processes
    /// the command leaves behind are killed once it exits.
    async fn run(
        &self,
        stage: StageName,
        spec: &CommandSpec,
        log_path: &Path,
        cancel: &CancellationToken,
    ) -> std::io::Result<ExitReport>;

    /// Spawns a long-running command, appending its output to `log_path`.
    async fn spawn(
        &self,
        stage: StageName,
        spec: &CommandSpec,
        log_path: &Path,
    ) -> std::io::Result<Box<dyn ServiceHandle>>;

    /// Returns a token identifying the running process with this pid, or
    /// `None` if no such process is running.
    ///
    /// The token stays the same for the life of the process and differs for
    /// a later process that reuses the pid.
    async fn identity(&self, pid: u32) -> Option<String>;

    /// Stops the process group led by `pid`, escalating to a hard kill after
    /// `grace`.
    ///
    /// Returns false if nothing in the group was running.
    async fn terminate(&self, pid: u32, grace: Duration) -> std::io::Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_from_argv() {
        let argv = vec!["python".to_string(), "create_knowledge_graph.py".to_string()];
        let spec = CommandSpec::from_argv(&argv)
            .unwrap()
            .arg("--offline")
            .env("KGPIPE_CONFIG", "/tmp/config.yaml")
            .current_dir("/srv");

        assert_eq!(spec.program, "python");
        assert_eq!(spec.args, vec!["create_knowledge_graph.py", "--offline"]);
        assert_eq!(spec.env.get("KGPIPE_CONFIG").map(String::as_str), Some("/tmp/config.yaml"));
        assert_eq!(spec.display(), "python create_knowledge_graph.py --offline");
        assert!(CommandSpec::from_argv(&[]).is_err());
    }

    #[test]
    fn test_exit_report_failure_message() {
        let report = ExitReport::exited(2, "Input error: bad header\n");
        assert!(!report.success());
        assert_eq!(
            report.failure_message("sh"),
            "sh exited with code 2: Input error: bad header"
        );

        let silent = ExitReport {
            code: None,
            cancelled: false,
            stderr_tail: String::new(),
        };
        assert_eq!(silent.failure_message("neo4j"), "neo4j was terminated by a signal");
        assert!(ExitReport::exited(0, "").success());
    }
}
