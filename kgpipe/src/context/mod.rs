//! Per-stage execution context.

use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::core::StageName;
use crate::events::{EventSink, NoOpEventSink};
use crate::volume::SharedVolume;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a stage is handed when it runs.
///
/// The shared volume arrives here as an explicit handle; stages never locate
/// it on their own.
#[derive(Clone)]
pub struct StageContext {
    run_id: Uuid,
    stage: StageName,
    volume: SharedVolume,
    config: Arc<PipelineConfig>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl StageContext {
    /// Creates a context with a no-op event sink and a fresh token.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        stage: StageName,
        volume: SharedVolume,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            run_id,
            stage,
            volume,
            config,
            events: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the stage this context was created for.
    #[must_use]
    pub fn stage(&self) -> StageName {
        self.stage
    }

    /// Returns the shared volume.
    #[must_use]
    pub fn volume(&self) -> &SharedVolume {
        &self.volume
    }

    /// Returns the pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the event sink.
    #[must_use]
    pub fn events(&self) -> &dyn EventSink {
        self.events.as_ref()
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the log file for this stage.
    #[must_use]
    pub fn log_path(&self) -> std::path::PathBuf {
        self.volume.log_path(self.stage)
    }

    /// Returns true if the run has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns the cancellation reason, or a generic one.
    #[must_use]
    pub fn cancel_reason(&self) -> String {
        self.cancel
            .reason()
            .unwrap_or_else(|| "run cancelled".to_string())
    }

    /// Returns a context for another stage of the same run.
    #[must_use]
    pub fn for_stage(&self, stage: StageName) -> Self {
        Self {
            stage,
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.run_id)
            .field("stage", &self.stage)
            .field("volume", &self.volume.root())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
