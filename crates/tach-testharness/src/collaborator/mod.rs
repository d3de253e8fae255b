//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Capability interface for the application under test."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
//! The harness never looks inside the application it drives. Everything a
//! scenario can do goes through [`Collaborator`], implemented in-process by
//! [`SimulatedRecorder`] and over HTTP by [`LiveRecorder`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tach_common::{BackendConfig, BackendKind};
use tach_resilience::{FaultError, FaultInjector, FaultProfile, RetryPolicy};
use tach_rt::VirtualClock;
use tach_sim::{Dataset, Program};
use thiserror::Error;

pub mod live;
pub mod simulated;

pub use live::LiveRecorder;
pub use simulated::SimulatedRecorder;

/// Identifier the collaborator assigns to a recording job.
pub type JobId = String;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("unknown recording job '{0}'")]
    UnknownJob(JobId),
    #[error("no dataset has been loaded")]
    NoDataset,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Fault(#[from] FaultError),
}

impl CollaboratorError {
    /// The injected fault behind this error, if any.
    pub fn fault(&self) -> Option<&FaultError> {
        match self {
            CollaboratorError::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Ad-hoc or scheduled recording of one program airing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRequest {
    pub program_id: u32,
    pub station_id: u32,
    #[serde(default)]
    pub schedule_id: Option<u32>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl RecordingRequest {
    pub fn for_program(program: &Program, epoch: DateTime<Utc>, schedule_id: Option<u32>) -> Self {
        Self {
            program_id: program.id,
            station_id: program.station_id,
            schedule_id,
            starts_at: program.starts_at(epoch),
            ends_at: program.ends_at(epoch),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Recording,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Recording)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub id: JobId,
    pub program_id: u32,
    pub status: JobStatus,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(default)]
    pub active_jobs: usize,
}

/// What the collaborator currently knows about stations, programs, and schedules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub stations: usize,
    pub programs: usize,
    pub schedules: usize,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerReport {
    /// Schedules whose program was due in the trigger window.
    pub due: usize,
    /// Jobs created for due schedules.
    pub started: Vec<JobId>,
    /// Due schedules whose job could not be created.
    pub failed: usize,
    /// Schedules whose program ended before any trigger reached it.
    pub missed: usize,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CollaboratorSignal {
    /// Orderly stop; the collaborator refuses requests until restarted.
    Shutdown,
    /// Abnormal termination; active jobs fail.
    Kill,
    Restart,
}

/// Public operations a scenario may invoke on the application under test.
#[async_trait]
pub trait Collaborator: Send + Sync {
    fn name(&self) -> &str;

    async fn health_check(&self) -> Result<HealthReport, CollaboratorError>;

    /// Inject the run's dataset so the collaborator mirrors the harness fixture.
    async fn load_dataset(&self, dataset: Arc<Dataset>) -> Result<(), CollaboratorError>;

    async fn list_catalog(&self) -> Result<CatalogSnapshot, CollaboratorError>;

    async fn start_recording(&self, request: RecordingRequest) -> Result<JobId, CollaboratorError>;

    async fn stop_recording(&self, job: &str) -> Result<JobReport, CollaboratorError>;

    async fn job_status(&self, job: &str) -> Result<JobReport, CollaboratorError>;

    /// Start every schedule that is due at virtual instant `now`.
    async fn trigger_scheduled(&self, now: DateTime<Utc>) -> Result<TriggerReport, CollaboratorError>;

    async fn signal(&self, signal: CollaboratorSignal) -> Result<(), CollaboratorError>;

    /// Impair the collaborator's own upstream traffic with `profile`.
    ///
    /// Collaborators whose upstream calls already pass through the run's
    /// injector have nothing to do here.
    async fn apply_fault_profile(&self, profile: &FaultProfile) -> Result<(), CollaboratorError> {
        let _ = profile;
        Ok(())
    }
}

/// Per-run resources a collaborator is attached to.
#[derive(Clone)]
pub struct RunEnvironment {
    pub clock: Arc<VirtualClock>,
    pub injector: Arc<FaultInjector>,
    pub dataset: Arc<Dataset>,
    pub seed: u64,
}

impl fmt::Debug for RunEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunEnvironment")
            .field("link", &self.injector.link())
            .field("factor", &self.clock.factor())
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

/// Builds a collaborator for a run; used for embedding custom implementations.
pub type CollaboratorFactory =
    Arc<dyn Fn(&RunEnvironment) -> Result<Arc<dyn Collaborator>, CollaboratorError> + Send + Sync>;

/// Selects which collaborator variant a run drives.
#[derive(Clone)]
pub enum CollaboratorBackend {
    Simulated { retry: RetryPolicy },
    Live { base_url: String, request_timeout: Duration },
    Custom(CollaboratorFactory),
}

impl CollaboratorBackend {
    pub fn from_config(config: &BackendConfig) -> Self {
        match config.kind {
            BackendKind::Simulated => CollaboratorBackend::Simulated {
                retry: RetryPolicy {
                    max_attempts: config.upstream_attempts.max(1) as usize,
                    ..RetryPolicy::default()
                },
            },
            BackendKind::Live => CollaboratorBackend::Live {
                base_url: config.base_url.clone().unwrap_or_default(),
                request_timeout: config.request_timeout,
            },
        }
    }

    pub fn custom<F>(factory: F) -> Self
    where
        F: Fn(&RunEnvironment) -> Result<Arc<dyn Collaborator>, CollaboratorError>
            + Send
            + Sync
            + 'static,
    {
        CollaboratorBackend::Custom(Arc::new(factory))
    }

    pub fn label(&self) -> &'static str {
        match self {
            CollaboratorBackend::Simulated { .. } => "simulated",
            CollaboratorBackend::Live { .. } => "live",
            CollaboratorBackend::Custom(_) => "custom",
        }
    }

    /// Build the collaborator for one run.
    pub fn attach(&self, env: &RunEnvironment) -> Result<Arc<dyn Collaborator>, CollaboratorError> {
        match self {
            CollaboratorBackend::Simulated { retry } => {
                Ok(Arc::new(SimulatedRecorder::new(env, *retry)))
            }
            CollaboratorBackend::Live {
                base_url,
                request_timeout,
            } => Ok(Arc::new(LiveRecorder::new(
                base_url,
                *request_timeout,
                env.injector.clone(),
            )?)),
            CollaboratorBackend::Custom(factory) => factory(env),
        }
    }
}

impl Default for CollaboratorBackend {
    fn default() -> Self {
        CollaboratorBackend::Simulated {
            retry: RetryPolicy::default(),
        }
    }
}

impl fmt::Debug for CollaboratorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollaboratorBackend::Simulated { retry } => f
                .debug_struct("Simulated")
                .field("retry", retry)
                .finish(),
            CollaboratorBackend::Live {
                base_url,
                request_timeout,
            } => f
                .debug_struct("Live")
                .field("base_url", base_url)
                .field("request_timeout", request_timeout)
                .finish(),
            CollaboratorBackend::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_follows_configuration() {
        let mut config = BackendConfig::default();
        config.upstream_attempts = 5;
        match CollaboratorBackend::from_config(&config) {
            CollaboratorBackend::Simulated { retry } => assert_eq!(retry.max_attempts, 5),
            other => panic!("unexpected backend {other:?}"),
        }

        config.kind = BackendKind::Live;
        config.base_url = Some("http://127.0.0.1:8080".into());
        let backend = CollaboratorBackend::from_config(&config);
        assert_eq!(backend.label(), "live");
    }

    #[test]
    fn status_and_signal_names_are_snake_case() {
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert_eq!("kill".parse::<CollaboratorSignal>().unwrap(), CollaboratorSignal::Kill);
        let json = serde_json::to_string(&CollaboratorSignal::Restart).unwrap();
        assert_eq!(json, "\"restart\"");
        assert!(JobStatus::Recording.is_active());
        assert!(!JobStatus::Cancelled.is_active());
    }
}
