//! Deploy stage: starts the database server and waits for it to listen.

use super::{Stage, ENV_DATABASE_DIR, ENV_PORT};
use crate::context::StageContext;
use crate::core::{StageName, StageOutput};
use crate::errors::StageFailure;
use crate::process::{read_log_tail, CommandSpec, HealthProbe, ProcessLauncher, ServiceHandle};
use crate::volume::{DeployRecord, ImportMarker};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use std::path::Path;
use tracing::{debug, info, warn};

const LOG_TAIL_LINES: usize = 20;

/// Starts the database server and reports it `up` once it accepts TCP
/// connections.
///
/// The port must be free before the server starts, so a listener found
/// afterwards is the server's own. On success the server is left running
/// detached from the orchestrator, and a [`DeployRecord`] in the volume lets
/// later commands find and stop it.
#[derive(Debug, Clone)]
pub struct DeployStage {
    launcher: Arc<dyn ProcessLauncher>,
    probe: Arc<dyn HealthProbe>,
}

impl DeployStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>, probe: Arc<dyn HealthProbe>) -> Self {
        Self { launcher, probe }
    }

    async fn abandon(&self, ctx: &StageContext, handle: &mut dyn ServiceHandle) {
        if let Err(e) = handle.kill().await {
            debug!(error = %e, "Server process already gone");
        }
        if let Err(e) = ctx.volume().clear_deploy_record() {
            warn!(error = %e, "Cannot remove deploy record");
        }
    }
}

/// Returns the failure to report if the server has already exited.
fn exited_early(
    ctx: &StageContext,
    handle: &mut dyn ServiceHandle,
    program: &str,
    endpoint: &str,
    log_path: &Path,
) -> Option<StageOutput> {
    let code = match handle.try_wait() {
        Ok(Some(code)) => code,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "Cannot poll server process");
            return None;
        }
    };
    if let Err(e) = ctx.volume().clear_deploy_record() {
        warn!(error = %e, "Cannot remove deploy record");
    }
    let tail = read_log_tail(log_path, LOG_TAIL_LINES);
    let mut message =
        format!("{program} exited with code {code} before accepting connections on {endpoint}");
    if !tail.trim().is_empty() {
        message = format!("{message}: {}", tail.trim_end());
    }
    Some(StageOutput::fail(StageFailure::server_start(message)).with_exit_code(Some(code)))
}

#[async_trait]
impl Stage for DeployStage {
    fn name(&self) -> StageName {
        StageName::Deploy
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let volume = ctx.volume();
        let deploy = &ctx.config().deploy;

        match ImportMarker::load(volume) {
            Ok(Some(marker)) => {
                debug!(import_run = %marker.run_id, "Found import completion marker");
            }
            Ok(None) => {
                return StageOutput::fail(StageFailure::server_start(format!(
                    "import completion marker not found: {}",
                    volume.import_marker_path().display()
                )))
            }
            Err(e) => {
                return StageOutput::fail(StageFailure::server_start(format!(
                    "cannot read import completion marker: {e}"
                )))
            }
        }

        let endpoint = deploy.endpoint();
        if self.probe.is_ready(&deploy.host, deploy.port).await {
            return StageOutput::fail(StageFailure::server_start(format!(
                "{endpoint} is already in use by another process"
            )));
        }

        let spec = match CommandSpec::from_argv(&deploy.command) {
            Ok(spec) => spec
                .env(ENV_DATABASE_DIR, volume.database_dir())
                .env(ENV_PORT, deploy.port.to_string())
                .current_dir(volume.root()),
            Err(e) => return StageOutput::fail(StageFailure::server_start(e.to_string())),
        };

        let log_path = ctx.log_path();
        let mut handle = match self.launcher.spawn(StageName::Deploy, &spec, &log_path).await {
            Ok(handle) => handle,
            Err(e) => {
                return StageOutput::fail(StageFailure::server_start(format!(
                    "cannot start {}: {e}",
                    spec.program
                )))
            }
        };

        let recorded = match handle.pid() {
            Some(pid) => {
                let record =
                    DeployRecord::new(pid, self.launcher.identity(pid).await, spec.display());
                volume
                    .write_deploy_record(&record)
                    .map_err(|e| format!("cannot record server pid {pid}: {e}"))
            }
            None => Err(format!("{} has no pid to record", spec.program)),
        };
        if let Err(message) = recorded {
            self.abandon(ctx, handle.as_mut()).await;
            return StageOutput::fail(StageFailure::server_start(message));
        }
        let pid = handle.pid();

        let deadline = Instant::now() + deploy.startup_timeout();
        loop {
            if let Some(failed) =
                exited_early(ctx, handle.as_mut(), &spec.program, &endpoint, &log_path)
            {
                return failed;
            }

            if self.probe.is_ready(&deploy.host, deploy.port).await {
                if let Some(failed) =
                    exited_early(ctx, handle.as_mut(), &spec.program, &endpoint, &log_path)
                {
                    return failed;
                }
                info!(run_id = %ctx.run_id(), ?pid, endpoint = %endpoint, "Server accepting connections");
                return StageOutput::up(pid, endpoint);
            }

            if Instant::now() >= deadline {
                self.abandon(ctx, handle.as_mut()).await;
                return StageOutput::fail(StageFailure::server_start(format!(
                    "{} did not accept connections on {endpoint} within {}s",
                    spec.program, deploy.startup_timeout_secs
                )));
            }

            tokio::select! {
                () = tokio::time::sleep(deploy.poll_interval()) => {}
                () = ctx.cancel_token().cancelled() => {
                    self.abandon(ctx, handle.as_mut()).await;
                    return StageOutput::cancel(ctx.cancel_reason());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::core::StageStatus;
    use crate::errors::FailureKind;
    use crate::process::{TcpProbe, TokioLauncher};
    use crate::testing::{MockLauncher, MockSpawn};
    use crate::volume::SharedVolume;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;
    use uuid::Uuid;

    /// Answers readiness checks from a script, then repeats `then`.
    #[derive(Debug)]
    struct ScriptedProbe {
        answers: Mutex<VecDeque<bool>>,
        then: bool,
    }

    impl ScriptedProbe {
        fn new(answers: &[bool], then: bool) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                then,
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn is_ready(&self, _host: &str, _port: u16) -> bool {
            self.answers.lock().pop_front().unwrap_or(self.then)
        }
    }

    fn context(dir: &Path, command: &str, port: u16) -> StageContext {
        context_with_timeout(dir, command, port, 5)
    }

    fn context_with_timeout(dir: &Path, command: &str, port: u16, timeout_secs: u64) -> StageContext {
        let mut config = PipelineConfig::default().with_base_dir(dir);
        config.deploy.command = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        config.deploy.port = port;
        config.deploy.startup_timeout_secs = timeout_secs;
        config.deploy.poll_interval_ms = 50;
        let volume = SharedVolume::open_or_create(dir.join("volume")).unwrap();
        StageContext::new(Uuid::new_v4(), StageName::Deploy, volume, Arc::new(config))
    }

    fn mark_imported(ctx: &StageContext) {
        ImportMarker::new(ctx.run_id(), "abc").store(ctx.volume()).unwrap();
    }

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
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

    #[tokio::test]
    async fn test_deploy_without_import_marker_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "sleep 30", 7474);
        let launcher = Arc::new(TokioLauncher::new());

        let output = DeployStage::new(launcher, Arc::new(TcpProbe::default()))
            .execute(&ctx)
            .await;

        assert_eq!(output.failure.unwrap().kind, FailureKind::ServerStartFailure);
        assert!(ctx.volume().read_deploy_record().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deploy_server_exit_is_server_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "echo 'port already in use' >&2; exit 4", 1);
        mark_imported(&ctx);

        let output = DeployStage::new(
            Arc::new(TokioLauncher::new()),
            Arc::new(TcpProbe::new(Duration::from_millis(50))),
        )
        .execute(&ctx)
        .await;

        assert_eq!(output.exit_code, Some(4));
        let failure = output.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ServerStartFailure);
        assert!(failure.message.contains("port already in use"));
        assert!(ctx.volume().read_deploy_record().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deploy_refuses_port_already_in_use() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            "sleep 0.3; echo 'Address already in use' >&2; exit 4",
            port,
        );
        mark_imported(&ctx);

        let output = DeployStage::new(Arc::new(TokioLauncher::new()), Arc::new(TcpProbe::default()))
            .execute(&ctx)
            .await;

        assert_eq!(output.status, StageStatus::Failed);
        let failure = output.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ServerStartFailure);
        assert!(failure.message.contains("already in use by another process"));
        assert!(ctx.volume().read_deploy_record().unwrap().is_none());
        assert!(!ctx.log_path().exists());
    }

    #[tokio::test]
    async fn test_deploy_never_reports_up_for_exited_server() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "exit 4", 7474);
        mark_imported(&ctx);
        let launcher = MockLauncher::new();
        launcher.on_spawn(MockSpawn::ExitImmediately(4));

        let output = DeployStage::new(Arc::new(launcher), ScriptedProbe::new(&[false], true))
            .execute(&ctx)
            .await;

        assert_eq!(output.status, StageStatus::Failed);
        assert_eq!(output.exit_code, Some(4));
        assert!(ctx.volume().read_deploy_record().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deploy_reports_up_and_records_identity() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "sleep 30", free_port().await);
        mark_imported(&ctx);
        let launcher = Arc::new(TokioLauncher::new());

        let output = DeployStage::new(launcher.clone(), ScriptedProbe::new(&[false], true))
            .execute(&ctx)
            .await;

        assert_eq!(output.status, StageStatus::Up);
        let pid = output.pid.unwrap();
        let record = ctx.volume().read_deploy_record().unwrap().unwrap();
        assert_eq!(record.pid, pid);
        assert!(record.matches(launcher.identity(pid).await.as_deref()));
        assert!(launcher.terminate(pid, Duration::from_secs(2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_deploy_times_out_when_never_ready() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with_timeout(dir.path(), "sleep 30", free_port().await, 0);
        mark_imported(&ctx);

        let output = DeployStage::new(
            Arc::new(TokioLauncher::new()),
            Arc::new(TcpProbe::new(Duration::from_millis(50))),
        )
        .execute(&ctx)
        .await;

        let failure = output.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ServerStartFailure);
        assert!(failure.message.contains("within 0s"));
        assert!(ctx.volume().read_deploy_record().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deploy_timeout_stops_forked_server() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with_timeout(
            dir.path(),
            "sleep 30 & echo $! > grand.pid; wait",
            free_port().await,
            1,
        );
        mark_imported(&ctx);
        let launcher = Arc::new(TokioLauncher::new());

        let output = DeployStage::new(launcher.clone(), ScriptedProbe::new(&[], false))
            .execute(&ctx)
            .await;

        assert_eq!(output.failure.unwrap().kind, FailureKind::ServerStartFailure);
        let grandchild = read_pid_file(&ctx.volume().root().join("grand.pid")).await;
        let mut gone = false;
        for _ in 0..60 {
            if launcher.identity(grandchild).await.is_none() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "server child {grandchild} outlived the deploy stage");
    }

    #[tokio::test]
    async fn test_deploy_stops_server_it_cannot_record() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), "neo4j console", 7474);
        mark_imported(&ctx);
        let blocker = ctx.volume().deploy_record_path();
        std::fs::create_dir_all(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), "x").unwrap();
        let launcher = MockLauncher::new();

        let output = DeployStage::new(Arc::new(launcher.clone()), launcher.probe())
            .execute(&ctx)
            .await;

        let failure = output.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::ServerStartFailure);
        assert!(failure.message.contains("cannot record server pid"));
        assert_eq!(launcher.launches(StageName::Deploy), 1);
        assert!(launcher.alive().is_empty());
    }
}
