//! Job and pipeline execution tracking.
//!
//! - [`PathRegistry`]: resolves job paths to definitions.
//! - [`catalog`]: loads definitions from a Jenkins-style jobs directory.
//! - [`dsl`]: parses declarative pipeline scripts into stages.
//! - [`ExecutionHandle`]: the execution state machine for one workflow run.
//! - [`ExecutionStore`]: table of active and recently finished executions.
//! - [`JobRunner`]: seam to whatever actually executes a definition;
//!   [`ShellRunner`] is the bundled implementation.
//! - [`SubmissionCoordinator`]: resolves, creates and drives executions.
//! - [`Tracker`]: owns all of the above for the lifetime of the process.

pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod dsl;
pub mod execution;
pub mod registry;
pub mod runner;
pub mod shell;
pub mod store;
pub mod tracker;

pub use config::TrackerConfig;
pub use coordinator::SubmissionCoordinator;
pub use execution::{Execution, ExecutionHandle, ExecutionSummary};
pub use registry::PathRegistry;
pub use runner::{JobRunner, RunContext, RunnerError, StageStatus};
pub use shell::ShellRunner;
pub use store::{ExecutionFilter, ExecutionStore, RetentionPolicy};
pub use tracker::Tracker;
