//! Child-process launcher backed by `tokio::process`.

use super::{CommandSpec, ExitReport, ProcessLauncher, ServiceHandle};
use crate::cancellation::CancellationToken;
use crate::core::StageName;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

const DEFAULT_TAIL_LINES: usize = 20;

/// How long stderr may stay open after the stage process has ended.
const STDERR_DRAIN: Duration = Duration::from_secs(2);

/// Launches stage commands as OS child processes.
///
/// Every child leads a new process group. Signals aimed at the stage reach
/// the processes it starts, and a Ctrl-C in the terminal reaches only the
/// orchestrator, which then cancels the run.
#[derive(Debug, Clone)]
pub struct TokioLauncher {
    tail_lines: usize,
}

impl Default for TokioLauncher {
    fn default() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

impl TokioLauncher {
    /// Creates a launcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how many trailing stderr lines are kept for failure messages.
    #[must_use]
    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines.max(1);
        self
    }
}

fn open_log(log_path: &Path, stage: StageName, spec: &CommandSpec) -> std::io::Result<File> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;
    writeln!(
        file,
        "==> [{}] {} {}",
        chrono::Utc::now().to_rfc3339(),
        stage,
        spec.display()
    )?;
    Ok(file)
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args).envs(&spec.env).stdin(Stdio::null());
    if let Some(ref dir) = spec.cwd {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

async fn collect_stderr(
    stderr: ChildStderr,
    log: File,
    tail: Arc<Mutex<VecDeque<String>>>,
    keep: usize,
) {
    let mut log = tokio::fs::File::from_std(log);
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if let Err(e) = log.write_all(format!("{line}\n").as_bytes()).await {
            debug!(error = %e, "Failed to append stderr line to log");
        }
        let mut tail = tail.lock();
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    if let Err(e) = log.flush().await {
        debug!(error = %e, "Failed to flush stage log");
    }
}

/// Classifies how a stage process ended.
///
/// `None` means the process was killed for cancellation. A process that
/// ends unsuccessfully after the run was cancelled counts as cancelled too,
/// whichever signal reached it first.
fn exit_report(
    status: Option<ExitStatus>,
    cancel: &CancellationToken,
    stderr_tail: String,
) -> ExitReport {
    let cancelled = status.map_or(true, |s| !s.success() && cancel.is_cancelled());
    ExitReport {
        code: status.and_then(|s| s.code()),
        cancelled,
        stderr_tail,
    }
}

/// Kills the child's process group, then reaps the child.
async fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    if let Some(pgid) = child.id() {
        if signal_group(pgid, "-KILL").await.is_ok() {
            child.wait().await?;
            return Ok(());
        }
    }
    child.kill().await
}

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn run(
        &self,
        stage: StageName,
        spec: &CommandSpec,
        log_path: &Path,
        cancel: &CancellationToken,
    ) -> std::io::Result<ExitReport> {
        let log = open_log(log_path, stage, spec)?;
        let stderr_log = log.try_clone()?;

        let mut child = build_command(spec)
            .stdout(Stdio::from(log))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let pgid = child.id();
        debug!(stage = %stage, pid = ?pgid, command = %spec.display(), "Spawned stage process");

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr was not captured"))?;
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.tail_lines)));
        let mut collector = tokio::spawn(collect_stderr(
            stderr,
            stderr_log,
            tail.clone(),
            self.tail_lines,
        ));

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            () = cancel.cancelled() => {
                warn!(stage = %stage, "Cancellation requested, killing stage processes");
                kill_tree(&mut child).await?;
                None
            }
        };

        if status.is_some() {
            if let Some(pgid) = pgid {
                if signal_group(pgid, "-KILL").await.is_ok() {
                    warn!(stage = %stage, pgid, "Killed processes the stage left running");
                }
            }
        }

        if tokio::time::timeout(STDERR_DRAIN, &mut collector).await.is_err() {
            collector.abort();
            debug!(stage = %stage, "Stopped reading stderr still held open after exit");
        }
        let stderr_tail = Vec::from(std::mem::take(&mut *tail.lock())).join("\n");
        Ok(exit_report(status, cancel, stderr_tail))
    }

    async fn spawn(
        &self,
        stage: StageName,
        spec: &CommandSpec,
        log_path: &Path,
    ) -> std::io::Result<Box<dyn ServiceHandle>> {
        let log = open_log(log_path, stage, spec)?;
        let stderr_log = log.try_clone()?;

        let child = build_command(spec)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log))
            .spawn()?;
        info!(stage = %stage, pid = ?child.id(), command = %spec.display(), "Spawned service process");

        Ok(Box::new(TokioService {
            child,
            log_path: log_path.to_path_buf(),
        }))
    }

    async fn identity(&self, pid: u32) -> Option<String> {
        if Path::new("/proc/self/stat").exists() {
            return proc_identity(pid);
        }
        let output = Command::new("ps")
            .args(["-o", "lstart=", "-p"])
            .arg(pid.to_string())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        let started = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (output.status.success() && !started.is_empty()).then_some(started)
    }

    async fn terminate(&self, pid: u32, grace: Duration) -> std::io::Result<bool> {
        if !group_alive(pid).await {
            return Ok(false);
        }
        if let Err(e) = signal_group(pid, "-TERM").await {
            return if group_alive(pid).await { Err(e) } else { Ok(true) };
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !group_alive(pid).await {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        warn!(pid, "Process group ignored SIGTERM, sending SIGKILL");
        if let Err(e) = signal_group(pid, "-KILL").await {
            debug!(pid, error = %e, "Process group exited before SIGKILL");
        }
        Ok(true)
    }
}

/// Boot id and start time of a live process; zombies count as gone.
fn proc_identity(pid: u32) -> Option<String> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields after the command name, starting with the state.
    let fields: Vec<&str> = stat.rsplit_once(')')?.1.split_whitespace().collect();
    if matches!(fields.first().copied(), Some("Z" | "X")) {
        return None;
    }
    let start_ticks = fields.get(19)?;
    let boot_id = std::fs::read_to_string("/proc/sys/kernel/random/boot_id").unwrap_or_default();
    Some(format!("{}:{start_ticks}", boot_id.trim()))
}

/// Sends `signal` to every process in the group led by `pgid`.
async fn signal_group(pgid: u32, signal: &str) -> std::io::Result<()> {
    let status = Command::new("kill")
        .arg(signal)
        .arg("--")
        .arg(format!("-{pgid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "kill {signal} -{pgid} exited with {status}"
        )))
    }
}

async fn group_alive(pgid: u32) -> bool {
    signal_group(pgid, "-0").await.is_ok()
}

/// A spawned long-running child process.
#[derive(Debug)]
pub struct TokioService {
    child: Child,
    log_path: PathBuf,
}

impl TokioService {
    /// Returns the log file the service writes to.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

#[async_trait]
impl ServiceHandle for TokioService {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(|s| s.code().unwrap_or(-1)))
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        kill_tree(&mut self.child).await
    }
}

/// Reads the last `lines` lines of a log file.
///
/// Returns an empty string if the file does not exist.
#[must_use]
pub fn read_log_tail(path: &Path, lines: usize) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    async fn read_pid_file(path: &Path) -> u32 {
        for _ in 0..100 {
            if let Ok(text) = std::fs::read_to_string(path) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} was never written", path.display());
    }

    async fn gone_within(launcher: &TokioLauncher, pid: u32, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if launcher.identity(pid).await.is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_run_success_captures_stdout_in_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/build.log");
        let launcher = TokioLauncher::new();

        let report = launcher
            .run(StageName::Build, &sh("echo built"), &log, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.success());
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("==> ["));
        assert!(content.contains("built"));
    }

    #[tokio::test]
    async fn test_run_failure_keeps_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("import.log");
        let launcher = TokioLauncher::new().with_tail_lines(2);

        let report = launcher
            .run(
                StageName::Import,
                &sh("echo one >&2; echo two >&2; echo three >&2; exit 3"),
                &log,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.code, Some(3));
        assert_eq!(report.stderr_tail, "two\nthree");
        assert!(std::fs::read_to_string(&log).unwrap().contains("one"));
    }

    #[tokio::test]
    async fn test_run_passes_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("build.log");
        let spec = sh("printf '%s' \"$KGPIPE_OUTPUT_DIR\" > out.txt")
            .env("KGPIPE_OUTPUT_DIR", "/volume/staging")
            .current_dir(dir.path());

        let report = TokioLauncher::new()
            .run(StageName::Build, &spec, &log, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.success());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "/volume/staging"
        );
    }

    #[tokio::test]
    async fn test_run_cancel_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("build.log");
        let cancel = Arc::new(CancellationToken::new());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel("operator interrupt");
        });

        let started = Instant::now();
        let report = TokioLauncher::new()
            .run(StageName::Build, &sh("sleep 30"), &log, &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert!(!report.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_run_cancel_kills_background_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("import.log");
        let grand_pid_file = dir.path().join("grand.pid");
        let spec = sh("sleep 30 & echo $! > grand.pid; wait").current_dir(dir.path());
        let cancel = Arc::new(CancellationToken::new());
        let launcher = TokioLauncher::new();

        let run = {
            let launcher = launcher.clone();
            let cancel = cancel.clone();
            let log = log.clone();
            tokio::spawn(async move { launcher.run(StageName::Import, &spec, &log, &cancel).await })
        };
        let grandchild = read_pid_file(&grand_pid_file).await;

        let started = Instant::now();
        cancel.cancel("operator interrupt");
        let report = run.await.unwrap().unwrap();

        assert!(report.cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(gone_within(&launcher, grandchild, Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn test_run_kills_descendants_left_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("sleep 30 & echo $! > grand.pid").current_dir(dir.path());
        let launcher = TokioLauncher::new();

        let started = Instant::now();
        let report = launcher
            .run(
                StageName::Build,
                &spec,
                &dir.path().join("build.log"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.success());
        assert!(started.elapsed() < Duration::from_secs(5));
        let grandchild = read_pid_file(&dir.path().join("grand.pid")).await;
        assert!(gone_within(&launcher, grandchild, Duration::from_secs(3)).await);
    }

    #[test]
    fn test_signal_death_during_cancellation_counts_as_cancelled() {
        let cancel = CancellationToken::new();
        let interrupted = ExitStatus::from_raw(2);

        let report = exit_report(Some(interrupted), &cancel, String::new());
        assert!(!report.cancelled);
        assert_eq!(report.code, None);

        cancel.cancel("operator interrupt");
        let report = exit_report(Some(interrupted), &cancel, String::new());
        assert!(report.cancelled);

        let failed = ExitStatus::from_raw(3 << 8);
        assert!(exit_report(Some(failed), &cancel, String::new()).cancelled);
        assert!(!exit_report(Some(ExitStatus::from_raw(0)), &cancel, String::new()).cancelled);
        assert!(exit_report(None, &CancellationToken::new(), String::new()).cancelled);
    }

    #[tokio::test]
    async fn test_run_missing_program_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = TokioLauncher::new()
            .run(
                StageName::Build,
                &CommandSpec::new("kgpipe-definitely-not-a-program"),
                &dir.path().join("build.log"),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_spawn_and_kill_service() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TokioLauncher::new();
        let mut service = launcher
            .spawn(StageName::Deploy, &sh("sleep 30"), &dir.path().join("deploy.log"))
            .await
            .unwrap();
        assert!(service.pid().is_some());

        assert!(service.try_wait().unwrap().is_none());
        service.kill().await.unwrap();
        assert!(service.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_service_kill_reaches_forked_server() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TokioLauncher::new();
        let spec = sh("sleep 30 & echo $! > grand.pid; wait").current_dir(dir.path());
        let mut service = launcher
            .spawn(StageName::Deploy, &spec, &dir.path().join("deploy.log"))
            .await
            .unwrap();
        let grandchild = read_pid_file(&dir.path().join("grand.pid")).await;
        assert!(launcher.identity(grandchild).await.is_some());

        service.kill().await.unwrap();

        assert!(gone_within(&launcher, grandchild, Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn test_terminate_stops_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TokioLauncher::new();
        let spec = sh("sleep 30 & echo $! > grand.pid; wait").current_dir(dir.path());
        let mut service = launcher
            .spawn(StageName::Deploy, &spec, &dir.path().join("deploy.log"))
            .await
            .unwrap();
        let pid = service.pid().unwrap();
        let grandchild = read_pid_file(&dir.path().join("grand.pid")).await;

        assert!(launcher.terminate(pid, Duration::from_secs(2)).await.unwrap());
        assert!(gone_within(&launcher, grandchild, Duration::from_secs(3)).await);
        assert!(service.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_identity_is_stable_and_cleared_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = TokioLauncher::new();
        let mut service = launcher
            .spawn(StageName::Deploy, &sh("sleep 30"), &dir.path().join("deploy.log"))
            .await
            .unwrap();
        let pid = service.pid().unwrap();

        let first = launcher.identity(pid).await;
        assert!(first.is_some());
        assert_eq!(launcher.identity(pid).await, first);

        service.kill().await.unwrap();
        assert!(launcher.identity(pid).await.is_none());
    }

    #[test]
    fn test_read_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.log");
        std::fs::write(&path, "a\nb\nc\n").unwrap();

        assert_eq!(read_log_tail(&path, 2), "b\nc");
        assert_eq!(read_log_tail(&dir.path().join("missing.log"), 2), "");
    }
}
