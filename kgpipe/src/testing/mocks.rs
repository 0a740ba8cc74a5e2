//! Scripted process launcher and readiness probe.

use crate::cancellation::CancellationToken;
use crate::core::StageName;
use crate::process::{CommandSpec, ExitReport, HealthProbe, ProcessLauncher, ServiceHandle};
use crate::stages::ENV_PORT;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A file a scripted run writes into a directory named by an environment
/// variable of the launched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockWrite {
    /// Environment variable holding the target directory.
    pub dir_env: String,
    /// File name inside that directory.
    pub file: String,
    /// File contents.
    pub contents: String,
}

/// How a run-to-completion stage behaves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockRun {
    /// Exit code to report.
    pub exit_code: i32,
    /// Stderr text to report.
    pub stderr: String,
    /// Files to write before exiting.
    pub writes: Vec<MockWrite>,
    /// How long the run takes.
    pub delay: Option<Duration>,
}

impl MockRun {
    /// A run that exits 0.
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    /// A run that exits with `code` and writes `stderr`.
    #[must_use]
    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: code,
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// Adds a file write.
    #[must_use]
    pub fn write(
        mut self,
        dir_env: impl Into<String>,
        file: impl Into<String>,
        contents: impl Into<String>,
    ) -> Self {
        self.writes.push(MockWrite {
            dir_env: dir_env.into(),
            file: file.into(),
            contents: contents.into(),
        });
        self
    }

    /// Makes the run take `delay`; it can be cancelled meanwhile.
    #[must_use]
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// How a spawned long-running stage behaves.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MockSpawn {
    /// Starts listening on `KGPIPE_PORT` immediately.
    #[default]
    Healthy,
    /// Runs but never listens.
    NeverReady,
    /// Exits with the code before listening.
    ExitImmediately(i32),
    /// Cannot be spawned.
    SpawnError(String),
}

#[derive(Debug, Default)]
struct MockState {
    runs: HashMap<StageName, MockRun>,
    spawn: MockSpawn,
    launches: BTreeMap<StageName, usize>,
    commands: Vec<(StageName, CommandSpec)>,
    alive: BTreeSet<u32>,
    listening: BTreeMap<u32, u16>,
    ports: Vec<u16>,
    terminated: Vec<u32>,
    next_pid: u32,
}

/// A [`ProcessLauncher`] that runs nothing and follows a script instead.
///
/// Unscripted stages exit 0 without writing anything. Every launch is
/// counted per stage, so tests can assert that a stage never started.
#[derive(Debug, Clone, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
}

impl MockLauncher {
    /// Creates a launcher where every stage succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts every run of `stage`.
    pub fn on_run(&self, stage: StageName, run: MockRun) -> &Self {
        self.state.lock().runs.insert(stage, run);
        self
    }

    /// Scripts every spawn.
    pub fn on_spawn(&self, spawn: MockSpawn) -> &Self {
        self.state.lock().spawn = spawn;
        self
    }

    /// Returns a probe that sees the ports this launcher's services listen on.
    #[must_use]
    pub fn probe(&self) -> Arc<MockProbe> {
        Arc::new(MockProbe {
            state: self.state.clone(),
        })
    }

    /// Number of times `stage` was launched.
    #[must_use]
    pub fn launches(&self, stage: StageName) -> usize {
        self.state.lock().launches.get(&stage).copied().unwrap_or(0)
    }

    /// Commands launched so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<(StageName, CommandSpec)> {
        self.state.lock().commands.clone()
    }

    /// The last command launched for `stage`.
    #[must_use]
    pub fn last_command(&self, stage: StageName) -> Option<CommandSpec> {
        self.state
            .lock()
            .commands
            .iter()
            .rev()
            .find(|(s, _)| *s == stage)
            .map(|(_, spec)| spec.clone())
    }

    /// Ports healthy services listened on, one entry per spawn.
    #[must_use]
    pub fn listened_ports(&self) -> Vec<u16> {
        self.state.lock().ports.clone()
    }

    /// Pids of services still running.
    #[must_use]
    pub fn alive(&self) -> Vec<u32> {
        self.state.lock().alive.iter().copied().collect()
    }

    /// Pids stopped through `terminate`.
    #[must_use]
    pub fn terminated(&self) -> Vec<u32> {
        self.state.lock().terminated.clone()
    }

    fn record_launch(&self, stage: StageName, spec: &CommandSpec) -> Script {
        let mut state = self.state.lock();
        *state.launches.entry(stage).or_insert(0) += 1;
        state.commands.push((stage, spec.clone()));
        Script {
            run: state.runs.get(&stage).cloned().unwrap_or_default(),
            spawn: state.spawn.clone(),
        }
    }
}

struct Script {
    run: MockRun,
    spawn: MockSpawn,
}

fn append_log(log_path: &Path, text: &str) -> std::io::Result<()> {
    use std::io::Write;
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    writeln!(file, "{text}")
}

#[async_trait]
impl ProcessLauncher for MockLauncher {
    async fn run(
        &self,
        stage: StageName,
        spec: &CommandSpec,
        log_path: &Path,
        cancel: &CancellationToken,
    ) -> std::io::Result<ExitReport> {
        let run = self.record_launch(stage, spec).run;
        append_log(log_path, &format!("==> {stage} {}", spec.display()))?;

        if let Some(delay) = run.delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    return Ok(ExitReport {
                        code: None,
                        cancelled: true,
                        stderr_tail: String::new(),
                    });
                }
            }
        }

        for write in &run.writes {
            let dir = spec.env.get(&write.dir_env).ok_or_else(|| {
                std::io::Error::other(format!("{} is not set for {stage}", write.dir_env))
            })?;
            let path = Path::new(dir).join(&write.file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &write.contents)?;
        }
        if !run.stderr.is_empty() {
            append_log(log_path, &run.stderr)?;
        }
        Ok(ExitReport::exited(run.exit_code, run.stderr))
    }

    async fn spawn(
        &self,
        stage: StageName,
        spec: &CommandSpec,
        log_path: &Path,
    ) -> std::io::Result<Box<dyn ServiceHandle>> {
        let spawn = self.record_launch(stage, spec).spawn;
        append_log(log_path, &format!("==> {stage} {}", spec.display()))?;

        if let MockSpawn::SpawnError(ref message) = spawn {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, message.clone()));
        }

        let mut state = self.state.lock();
        state.next_pid += 1;
        let pid = 40_000 + state.next_pid;
        let exit_code = match spawn {
            MockSpawn::Healthy => {
                let port = spec
                    .env
                    .get(ENV_PORT)
                    .and_then(|p| p.parse().ok())
                    .unwrap_or_default();
                state.alive.insert(pid);
                state.listening.insert(pid, port);
                state.ports.push(port);
                None
            }
            MockSpawn::NeverReady => {
                state.alive.insert(pid);
                None
            }
            MockSpawn::ExitImmediately(code) => Some(code),
            MockSpawn::SpawnError(_) => None,
        };
        Ok(Box::new(MockService {
            pid,
            exit_code,
            state: self.state.clone(),
        }))
    }

    async fn identity(&self, pid: u32) -> Option<String> {
        self.state
            .lock()
            .alive
            .contains(&pid)
            .then(|| format!("mock:{pid}"))
    }

    async fn terminate(&self, pid: u32, _grace: Duration) -> std::io::Result<bool> {
        let mut state = self.state.lock();
        if !state.alive.remove(&pid) {
            return Ok(false);
        }
        state.listening.remove(&pid);
        state.terminated.push(pid);
        Ok(true)
    }
}

/// Handle to a scripted service.
#[derive(Debug)]
pub struct MockService {
    pid: u32,
    exit_code: Option<i32>,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl ServiceHandle for MockService {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.exit_code)
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        let mut state = self.state.lock();
        state.alive.remove(&self.pid);
        state.listening.remove(&self.pid);
        self.exit_code.get_or_insert(-9);
        Ok(())
    }
}

/// A probe that reports ready when a [`MockLauncher`] service listens on
/// the port.
#[derive(Debug, Clone)]
pub struct MockProbe {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl HealthProbe for MockProbe {
    async fn is_ready(&self, _host: &str, port: u16) -> bool {
        self.state.lock().listening.values().any(|&p| p == port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_run_writes_into_env_dir() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = MockLauncher::new();
        launcher.on_run(
            StageName::Build,
            MockRun::ok().write("KGPIPE_OUTPUT_DIR", "nodes.csv", "id\n"),
        );
        let spec = CommandSpec::new("python").env("KGPIPE_OUTPUT_DIR", dir.path());

        let report = launcher
            .run(StageName::Build, &spec, &dir.path().join("build.log"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.success());
        assert!(dir.path().join("nodes.csv").is_file());
        assert_eq!(launcher.launches(StageName::Build), 1);
        assert_eq!(launcher.launches(StageName::Import), 0);
    }

    #[tokio::test]
    async fn test_mock_spawn_listens_until_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = MockLauncher::new();
        let probe = launcher.probe();
        let spec = CommandSpec::new("neo4j").env(ENV_PORT, "7687");

        let service = launcher
            .spawn(StageName::Deploy, &spec, &dir.path().join("deploy.log"))
            .await
            .unwrap();
        let pid = service.pid().unwrap();

        assert!(probe.is_ready("127.0.0.1", 7687).await);
        assert_eq!(launcher.identity(pid).await, Some(format!("mock:{pid}")));
        assert!(launcher.terminate(pid, Duration::ZERO).await.unwrap());
        assert!(launcher.identity(pid).await.is_none());
        assert!(!probe.is_ready("127.0.0.1", 7687).await);
        assert!(!launcher.terminate(pid, Duration::ZERO).await.unwrap());
        assert_eq!(launcher.listened_ports(), vec![7687]);
    }
}
