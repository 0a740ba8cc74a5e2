//! Sequential pipeline orchestrator.
//!
//! The orchestrator is a single async control loop. It starts each stage
//! only after the stage's dependencies have succeeded, awaits the stage's
//! tagged output, and halts at the first stage that does not succeed. The
//! run record in the volume is rewritten after every transition.

use super::{PipelineBuilder, StageGraph, StageSpec};
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::context::StageContext;
use crate::core::{PipelinePhase, StageName, StageOutput, StageStatus};
use crate::errors::{Result, StageFailure};
use crate::events::{EventSink, NoOpEventSink};
use crate::process::{HealthProbe, ProcessLauncher};
use crate::stages::{BuildStage, DeployStage, ImportStage};
use crate::volume::{RunRecord, SharedVolume, VolumeMarker};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Options for a single run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Destroy and recreate the volume before the first stage runs.
    pub reset: bool,
}

/// What `teardown` does with the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownMode {
    /// Stop the serving stage; keep the volume.
    StopOnly,
    /// Stop the serving stage and destroy the volume.
    Purge,
}

/// Result of a teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    /// Pid of the server that was stopped, if one was running.
    pub stopped_pid: Option<u32>,
    /// Whether the volume was destroyed.
    pub purged: bool,
}

/// Snapshot of the volume for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    /// Volume root.
    pub volume: std::path::PathBuf,
    /// Volume marker, if the volume exists.
    pub marker: Option<VolumeMarker>,
    /// The last run record.
    pub last_run: Option<RunRecord>,
    /// Recorded deploy pid.
    pub deploy_pid: Option<u32>,
    /// Whether the recorded deploy process is still the one that was
    /// started and is alive.
    pub deploy_alive: bool,
    /// Published artifact names.
    pub artifacts: Vec<String>,
}

/// Outcome of `run_pipeline`.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Run id.
    pub run_id: Uuid,
    /// Final phase.
    pub phase: PipelinePhase,
    /// Outputs of the stages that ran.
    pub outputs: BTreeMap<StageName, StageOutput>,
    /// The persisted run record.
    pub record: RunRecord,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
    stage_count: usize,
}

impl PipelineReport {
    /// Returns true if every stage succeeded (or is up).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outputs.len() == self.stage_count && self.outputs.values().all(StageOutput::is_success)
    }

    /// Returns true if the run was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.phase == PipelinePhase::Cancelled
    }

    /// Returns the stage that failed.
    #[must_use]
    pub fn failed_stage(&self) -> Option<StageName> {
        self.outputs
            .iter()
            .find(|(_, o)| o.status == StageStatus::Failed)
            .map(|(name, _)| *name)
    }

    /// Returns the failure that halted the run.
    #[must_use]
    pub fn failure(&self) -> Option<&StageFailure> {
        self.outputs.values().find_map(|o| o.failure.as_ref())
    }

    /// Returns a stage's output.
    #[must_use]
    pub fn output(&self, stage: StageName) -> Option<&StageOutput> {
        self.outputs.get(&stage)
    }

    /// Returns the serving endpoint, once deploy is up.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.output(StageName::Deploy)
            .filter(|o| o.status == StageStatus::Up)
            .and_then(|o| o.get("endpoint"))
            .and_then(|v| v.as_str())
    }

    /// Returns the pid of the serving deploy process.
    #[must_use]
    pub fn deploy_pid(&self) -> Option<u32> {
        self.output(StageName::Deploy)
            .filter(|o| o.status == StageStatus::Up)
            .and_then(|o| o.pid)
    }

    /// Process exit code for the run: 0 when healthy, 130 when cancelled,
    /// otherwise the failed stage's code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_cancelled() {
            130
        } else {
            self.failed_stage().map_or(0, StageName::exit_code)
        }
    }
}

/// Runs the pipeline and owns the shared volume's lifecycle.
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    graph: StageGraph,
    volume: SharedVolume,
    launcher: Arc<dyn ProcessLauncher>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    stop_grace: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("pipeline", &self.graph.name())
            .field("stages", &self.graph.execution_order())
            .field("volume", &self.volume.root())
            .finish_non_exhaustive()
    }
}

/// Builds the build → import → deploy graph.
///
/// # Errors
///
/// Returns an error if the graph fails validation.
pub fn standard_graph(
    name: &str,
    launcher: &Arc<dyn ProcessLauncher>,
    probe: Arc<dyn HealthProbe>,
) -> Result<StageGraph> {
    let graph = PipelineBuilder::new(name)
        .stage(StageSpec::new(Arc::new(BuildStage::new(launcher.clone()))))?
        .stage(
            StageSpec::new(Arc::new(ImportStage::new(launcher.clone())))
                .with_dependency(StageName::Build),
        )?
        .stage(
            StageSpec::new(Arc::new(DeployStage::new(launcher.clone(), probe)))
                .with_dependency(StageName::Import)
                .long_running(),
        )?
        .build()?;
    Ok(graph)
}

impl Orchestrator {
    /// Creates an orchestrator for a validated graph.
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        graph: StageGraph,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let volume = SharedVolume::new(config.volume_root());
        Self {
            config: Arc::new(config),
            graph,
            volume,
            launcher,
            events: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Creates an orchestrator running the standard three stages.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn standard(
        config: PipelineConfig,
        launcher: Arc<dyn ProcessLauncher>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let graph = standard_graph(&config.pipeline.name, &launcher, probe)?;
        Ok(Self::new(config, graph, launcher))
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets how long a stopping server gets before it is killed.
    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Returns the token that cancels the current run.
    #[must_use]
    pub fn cancel_token(&self) -> Arc<CancellationToken> {
        self.cancel.clone()
    }

    /// Returns the shared volume.
    #[must_use]
    pub fn volume(&self) -> &SharedVolume {
        &self.volume
    }

    /// Returns the stage graph.
    #[must_use]
    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Runs the stages in dependency order.
    ///
    /// Stage failures and cancellation are reported through the returned
    /// [`PipelineReport`]; `Err` is reserved for orchestrator problems such
    /// as an unwritable volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be prepared or the run record
    /// cannot be written.
    pub async fn run_pipeline(&self, options: RunOptions) -> Result<PipelineReport> {
        let started = Instant::now();
        let volume = &self.volume;

        if options.reset {
            self.reset().await?;
        } else {
            SharedVolume::open_or_create(volume.root())?;
            if let Some(pid) = self.stop_recorded_deploy().await? {
                info!(pid, "Stopped server left by a previous run");
            }
        }

        let generation = volume.marker()?.generation;
        let run_id = Uuid::now_v7();
        let mut record = RunRecord::new(
            run_id,
            self.graph.name(),
            volume,
            generation,
            self.graph.execution_order(),
        );
        record.store(volume)?;

        info!(run_id = %run_id, pipeline = %self.graph.name(), generation, "Pipeline started");
        self.events
            .emit(
                "pipeline.started",
                Some(json!({
                    "run_id": run_id,
                    "pipeline": self.graph.name(),
                    "volume_generation": generation,
                    "stages": self.graph.execution_order(),
                })),
            )
            .await;

        let mut phase = PipelinePhase::NotStarted;
        let mut outputs = BTreeMap::new();
        let mut succeeded: BTreeSet<StageName> = BTreeSet::new();

        for spec in self.graph.iter() {
            let name = spec.name;

            if self.cancel.is_cancelled() {
                phase = phase.transition(PipelinePhase::Cancelled)?;
                break;
            }
            if let Some(dep) = spec.dependencies.iter().find(|d| !succeeded.contains(*d)) {
                warn!(stage = %name, dependency = %dep, "Dependency has not succeeded; halting");
                break;
            }

            phase = phase.transition(PipelinePhase::running(name))?;
            record.mark_started(name);
            record.set_phase(phase);
            record.store(volume)?;
            info!(run_id = %run_id, stage = %name, "Stage started");
            self.events
                .emit("stage.started", Some(json!({"run_id": run_id, "stage": name})))
                .await;

            let ctx = StageContext::new(run_id, name, volume.clone(), self.config.clone())
                .with_events(self.events.clone())
                .with_cancel(self.cancel.clone());
            let stage_started = Instant::now();
            let output = spec.runner.execute(&ctx).await;
            let duration_ms = u64::try_from(stage_started.elapsed().as_millis()).unwrap_or(u64::MAX);

            record.mark_finished(name, &output);
            phase = self.observe(run_id, name, &output, duration_ms, phase).await?;
            if output.is_success() {
                succeeded.insert(name);
            }
            record.set_phase(phase);
            record.store(volume)?;

            let halted = !output.is_success();
            outputs.insert(name, output);
            if halted {
                break;
            }
        }

        if phase == PipelinePhase::Cancelled && record.finished_at.is_none() {
            record.set_phase(phase);
            record.store(volume)?;
        }

        let report = PipelineReport {
            run_id,
            phase,
            outputs,
            record,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            stage_count: self.graph.stage_count(),
        };
        self.finish(&report).await;
        Ok(report)
    }

    async fn observe(
        &self,
        run_id: Uuid,
        name: StageName,
        output: &StageOutput,
        duration_ms: u64,
        phase: PipelinePhase,
    ) -> Result<PipelinePhase> {
        match output.status {
            StageStatus::Cancelled => {
                warn!(run_id = %run_id, stage = %name, duration_ms, "Stage cancelled");
                self.events
                    .emit(
                        "stage.cancelled",
                        Some(json!({"run_id": run_id, "stage": name, "reason": output.cancel_reason})),
                    )
                    .await;
                phase.transition(PipelinePhase::Cancelled)
            }
            StageStatus::Up => {
                info!(run_id = %run_id, stage = %name, pid = ?output.pid, duration_ms, "Stage up");
                self.events
                    .emit(
                        "stage.up",
                        Some(json!({
                            "run_id": run_id,
                            "stage": name,
                            "pid": output.pid,
                            "endpoint": output.get("endpoint"),
                            "duration_ms": duration_ms,
                        })),
                    )
                    .await;
                phase.transition(PipelinePhase::finished(name, true))
            }
            status if status.is_success() => {
                info!(
                    run_id = %run_id,
                    stage = %name,
                    exit_code = ?output.exit_code,
                    duration_ms,
                    "Stage completed"
                );
                self.events
                    .emit(
                        "stage.completed",
                        Some(json!({
                            "run_id": run_id,
                            "stage": name,
                            "exit_code": output.exit_code,
                            "duration_ms": duration_ms,
                        })),
                    )
                    .await;
                phase.transition(PipelinePhase::finished(name, true))
            }
            _ => {
                if let Some(ref failure) = output.failure {
                    error!(
                        run_id = %run_id,
                        stage = %name,
                        kind = %failure.kind,
                        exit_code = ?output.exit_code,
                        duration_ms,
                        "{}",
                        failure.message
                    );
                }
                self.events
                    .emit(
                        "stage.failed",
                        Some(json!({
                            "run_id": run_id,
                            "stage": name,
                            "exit_code": output.exit_code,
                            "failure": output.failure,
                            "duration_ms": duration_ms,
                        })),
                    )
                    .await;
                phase.transition(PipelinePhase::finished(name, false))
            }
        }
    }

    async fn finish(&self, report: &PipelineReport) {
        if report.is_success() {
            info!(
                run_id = %report.run_id,
                endpoint = ?report.endpoint(),
                duration_ms = report.duration_ms,
                "Pipeline completed"
            );
            self.events
                .emit(
                    "pipeline.completed",
                    Some(json!({
                        "run_id": report.run_id,
                        "phase": report.phase,
                        "endpoint": report.endpoint(),
                        "duration_ms": report.duration_ms,
                    })),
                )
                .await;
        } else if report.is_cancelled() {
            warn!(run_id = %report.run_id, "Pipeline cancelled");
            self.events
                .emit(
                    "pipeline.cancelled",
                    Some(json!({"run_id": report.run_id, "reason": self.cancel.reason()})),
                )
                .await;
        } else {
            error!(
                run_id = %report.run_id,
                stage = ?report.failed_stage(),
                phase = %report.phase,
                "Pipeline failed"
            );
            self.events
                .emit(
                    "pipeline.failed",
                    Some(json!({
                        "run_id": report.run_id,
                        "phase": report.phase,
                        "stage": report.failed_stage(),
                        "failure": report.failure(),
                    })),
                )
                .await;
        }
    }

    /// Destroys and recreates the shared volume.
    ///
    /// A server still serving from the volume is stopped first.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be stopped or the volume cannot
    /// be recreated.
    pub async fn reset(&self) -> Result<VolumeMarker> {
        self.stop_recorded_deploy().await?;
        let marker = self.volume.reset()?;
        self.events
            .emit(
                "volume.reset",
                Some(json!({
                    "volume": self.volume.root(),
                    "generation": marker.generation,
                })),
            )
            .await;
        Ok(marker)
    }

    /// Stops the serving stage and optionally destroys the volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be stopped or the volume cannot
    /// be removed.
    pub async fn teardown(&self, mode: TeardownMode) -> Result<TeardownReport> {
        let stopped_pid = if self.volume.exists() {
            self.stop_recorded_deploy().await?
        } else {
            None
        };

        let purged = mode == TeardownMode::Purge;
        if purged {
            self.volume.destroy()?;
            self.events
                .emit("volume.destroyed", Some(json!({"volume": self.volume.root()})))
                .await;
        }
        Ok(TeardownReport {
            stopped_pid,
            purged,
        })
    }

    /// Reads the last run record and the volume's current state.
    ///
    /// # Errors
    ///
    /// Returns an error if a state file exists but cannot be parsed.
    pub async fn status(&self) -> Result<PipelineStatus> {
        let volume = &self.volume;
        if !volume.exists() {
            return Ok(PipelineStatus {
                volume: volume.root().to_path_buf(),
                marker: None,
                last_run: None,
                deploy_pid: None,
                deploy_alive: false,
                artifacts: Vec::new(),
            });
        }

        let deploy = volume.read_deploy_record()?;
        let deploy_alive = match deploy {
            Some(ref record) => record.matches(self.launcher.identity(record.pid).await.as_deref()),
            None => false,
        };
        let deploy_pid = deploy.map(|record| record.pid);
        Ok(PipelineStatus {
            volume: volume.root().to_path_buf(),
            marker: volume.marker().ok(),
            last_run: RunRecord::load(volume)?,
            deploy_pid,
            deploy_alive,
            artifacts: volume.list_artifacts()?,
        })
    }

    /// Stops the deploy process recorded in the volume, if it is running.
    ///
    /// A recorded pid now held by a process with another identity is
    /// treated as a stale record: it is cleared and nothing is signalled.
    async fn stop_recorded_deploy(&self) -> Result<Option<u32>> {
        let volume = &self.volume;
        let Some(deploy) = volume.read_deploy_record()? else {
            return Ok(None);
        };
        let pid = deploy.pid;

        let current = self.launcher.identity(pid).await;
        let stopped = if deploy.matches(current.as_deref()) {
            self.launcher.terminate(pid, self.stop_grace).await?
        } else {
            if current.is_some() {
                warn!(
                    pid,
                    command = %deploy.command,
                    "Recorded deploy pid belongs to another process; clearing stale record"
                );
            }
            false
        };
        volume.clear_deploy_record()?;

        if let Some(mut record) = RunRecord::load(volume)? {
            record.mark_stopped(StageName::Deploy);
            record.store(volume)?;
        }

        if stopped {
            info!(pid, "Stopped deploy server");
            self.events
                .emit("deploy.stopped", Some(json!({"pid": pid})))
                .await;
            Ok(Some(pid))
        } else {
            warn!(pid, "Recorded deploy server was not running");
            Ok(None)
        }
    }
}
