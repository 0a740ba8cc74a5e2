//! Persisted record of the last pipeline run.

use super::SharedVolume;
use crate::core::{PipelinePhase, StageName, StageOutput, StageStatus};
use crate::errors::{Result, StageFailure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Per-stage entry of a run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name.
    pub stage: StageName,
    /// Current status.
    pub status: StageStatus,
    /// When the stage started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage finished (or came up, for deploy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Observed process exit code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Process id, for the long-running stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Typed failure, if the stage failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,
    /// Where the stage's output was captured.
    pub log_path: PathBuf,
}

impl StageRecord {
    /// Creates a pending entry.
    #[must_use]
    pub fn pending(stage: StageName, log_path: PathBuf) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            started_at: None,
            ended_at: None,
            exit_code: None,
            pid: None,
            failure: None,
            log_path,
        }
    }

    /// Returns the duration in milliseconds once the stage has ended.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// The record of one pipeline run, rewritten after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run id.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Volume generation the run used.
    pub volume_generation: u64,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Current phase.
    pub phase: PipelinePhase,
    /// Digest of the import script the run built or loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_script_sha256: Option<String>,
    /// Stage entries in pipeline order.
    pub stages: Vec<StageRecord>,
}

impl RunRecord {
    /// Creates a record with every stage pending.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        pipeline: impl Into<String>,
        volume: &SharedVolume,
        volume_generation: u64,
        stages: &[StageName],
    ) -> Self {
        Self {
            run_id,
            pipeline: pipeline.into(),
            volume_generation,
            started_at: Utc::now(),
            finished_at: None,
            phase: PipelinePhase::NotStarted,
            import_script_sha256: None,
            stages: stages
                .iter()
                .map(|&stage| StageRecord::pending(stage, volume.log_path(stage)))
                .collect(),
        }
    }

    /// Returns the entry for a stage.
    #[must_use]
    pub fn stage(&self, stage: StageName) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.stage == stage)
    }

    fn stage_mut(&mut self, stage: StageName) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|r| r.stage == stage)
    }

    /// Marks a stage as started.
    pub fn mark_started(&mut self, stage: StageName) {
        if let Some(entry) = self.stage_mut(stage) {
            entry.status = StageStatus::Running;
            entry.started_at = Some(Utc::now());
        }
    }

    /// Records a stage's output.
    pub fn mark_finished(&mut self, stage: StageName, output: &StageOutput) {
        if let Some(entry) = self.stage_mut(stage) {
            entry.status = output.status;
            entry.ended_at = Some(Utc::now());
            entry.exit_code = output.exit_code;
            entry.pid = output.pid;
            entry.failure.clone_from(&output.failure);
        }
        if let Some(digest) = output.get("import_script_sha256").and_then(|v| v.as_str()) {
            self.import_script_sha256 = Some(digest.to_string());
        }
    }

    /// Marks the long-running stage as stopped by the operator.
    pub fn mark_stopped(&mut self, stage: StageName) {
        if let Some(entry) = self.stage_mut(stage) {
            if entry.status == StageStatus::Up {
                entry.status = StageStatus::Stopped;
                entry.ended_at = Some(Utc::now());
            }
        }
    }

    /// Sets the phase, stamping the finish time for terminal phases.
    pub fn set_phase(&mut self, phase: PipelinePhase) {
        self.phase = phase;
        if phase.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Returns the failed stage's failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<&StageFailure> {
        self.stages.iter().find_map(|r| r.failure.as_ref())
    }

    /// Loads the last run record, if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be parsed.
    pub fn load(volume: &SharedVolume) -> Result<Option<Self>> {
        match std::fs::read(volume.run_record_path()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the record atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn store(&self, volume: &SharedVolume) -> Result<()> {
        volume.write_atomic(&volume.run_record_path(), &serde_json::to_vec_pretty(self)?)
    }
}
