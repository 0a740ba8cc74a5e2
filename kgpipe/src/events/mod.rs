//! Event sink system for pipeline observability.
//!
//! The orchestrator emits lifecycle events (`pipeline.started`,
//! `stage.started`, `stage.completed`, `stage.failed`, `stage.up`,
//! `stage.cancelled`, `pipeline.completed`, `pipeline.failed`,
//! `pipeline.cancelled`, `volume.reset`, `volume.destroyed`,
//! `deploy.stopped`) through an [`EventSink`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
