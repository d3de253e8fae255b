//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Scenario orchestration over the virtual clock, sampler, and fault injector."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
//! Scenario orchestration for the Tachyon harness.
//!
//! A [`ScenarioRunner`] composes the virtual clock, the telemetry sampler and
//! the fault injector to drive one [`Scenario`] against a [`Collaborator`].
//! [`ScenarioPool`] runs several of them side by side, each with its own
//! clock and fault state.

pub mod collaborator;
pub mod pool;
pub mod registry;
pub mod report;
pub mod result;
pub mod runner;
pub mod scenario;

pub use collaborator::{
    CatalogSnapshot, Collaborator, CollaboratorBackend, CollaboratorError, CollaboratorSignal,
    HealthReport, JobId, JobReport, JobStatus, LiveRecorder, RecordingRequest, RunEnvironment,
    SimulatedRecorder, TriggerReport,
};
pub use pool::ScenarioPool;
pub use registry::ScenarioRegistry;
pub use report::{JsonReportSink, ReportSink};
pub use result::{AssertionOutcome, DatasetInfo, RunStatus, ScenarioResult};
pub use runner::{ProbeFactory, RunError, RunnerState, ScenarioRunner};
pub use scenario::{Checkpoint, Scenario, ScenarioCategory, ScenarioError, Step};
