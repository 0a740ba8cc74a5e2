//! Cooperative cancellation for pipeline runs.
//!
//! The orchestrator checks the token between stages; the process launcher
//! awaits it while a stage's child process runs and kills the child when it
//! fires.

mod token;

pub use token::CancellationToken;
