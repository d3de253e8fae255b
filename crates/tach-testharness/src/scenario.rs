//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Scenario, checkpoint, and step definitions."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use thiserror::Error;

use crate::collaborator::{CollaboratorSignal, JobStatus};

/// Scenario families, resolved once when the registry or CLI is built.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    ValueEnum,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ScenarioCategory {
    Soak,
    ScheduleBurst,
    NetworkDegradation,
    Recovery,
}

impl ScenarioCategory {
    pub const ALL: [ScenarioCategory; 4] = [
        ScenarioCategory::Soak,
        ScenarioCategory::ScheduleBurst,
        ScenarioCategory::NetworkDegradation,
        ScenarioCategory::Recovery,
    ];
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScenarioError {
    #[error("scenario name must not be empty")]
    EmptyName,
    #[error("scenario '{0}' declares no checkpoints")]
    NoCheckpoints(String),
    #[error("checkpoint '{checkpoint}' of scenario '{scenario}' is earlier than the one before it")]
    OffsetRegression { scenario: String, checkpoint: String },
    #[error("checkpoint '{checkpoint}' of scenario '{scenario}' expects ratio {ratio} outside [0, 1]")]
    InvalidRatio {
        scenario: String,
        checkpoint: String,
        ratio: f64,
    },
    #[error("checkpoint '{checkpoint}' of scenario '{scenario}' has a zero soft timeout")]
    ZeroSoftTimeout { scenario: String, checkpoint: String },
}

fn expect_healthy_default() -> bool {
    true
}

/// One action or assertion executed at a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    SetFaultProfile {
        profile: String,
    },
    ClearFaults,
    /// Start ad-hoc recordings for the next `count` upcoming programs.
    StartRecordings {
        count: usize,
    },
    /// Stop every recording the run started.
    StopRecordings,
    TriggerScheduler,
    Signal {
        signal: CollaboratorSignal,
    },
    ExpectHealthy {
        #[serde(default = "expect_healthy_default")]
        healthy: bool,
    },
    ExpectCatalogMatches,
    /// At least `min_ratio` of the run's jobs are in `status`.
    ExpectJobs {
        status: JobStatus,
        min_ratio: f64,
    },
}

impl Step {
    /// Short label used for assertion outcomes and logs.
    pub fn label(&self) -> String {
        match self {
            Step::SetFaultProfile { profile } => format!("set_fault_profile({profile})"),
            Step::ClearFaults => "clear_faults".into(),
            Step::StartRecordings { count } => format!("start_recordings({count})"),
            Step::StopRecordings => "stop_recordings".into(),
            Step::TriggerScheduler => "trigger_scheduler".into(),
            Step::Signal { signal } => format!("signal({signal})"),
            Step::ExpectHealthy { healthy } => format!("expect_healthy({healthy})"),
            Step::ExpectCatalogMatches => "expect_catalog_matches".into(),
            Step::ExpectJobs { status, min_ratio } => format!("expect_jobs({status} >= {min_ratio})"),
        }
    }

    /// Fault profile this step references, if any.
    pub fn fault_profile(&self) -> Option<&str> {
        match self {
            Step::SetFaultProfile { profile } => Some(profile),
            _ => None,
        }
    }
}

/// A point in virtual time at which steps execute.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub label: String,
    /// Virtual offset from the run epoch.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub offset: Duration,
    /// Real-time budget for the steps; overrides the run-wide default.
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub soft_timeout: Option<Duration>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Checkpoint {
    pub fn new(label: impl Into<String>, offset: Duration) -> Self {
        Self {
            label: label.into(),
            offset,
            soft_timeout: None,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_soft_timeout(mut self, timeout: Duration) -> Self {
        self.soft_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub category: ScenarioCategory,
    #[serde(default)]
    pub description: String,
    /// Stop at the first failed assertion.
    #[serde(default)]
    pub fail_fast: bool,
    pub checkpoints: Vec<Checkpoint>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, category: ScenarioCategory) -> Self {
        Self {
            name: name.into(),
            category,
            description: String::new(),
            fail_fast: false,
            checkpoints: Vec::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoints.push(checkpoint);
        self
    }

    /// Virtual span covered by the scenario.
    pub fn virtual_span(&self) -> Duration {
        self.checkpoints
            .last()
            .map(|checkpoint| checkpoint.offset)
            .unwrap_or_default()
    }

    pub fn fault_profiles(&self) -> impl Iterator<Item = &str> {
        self.checkpoints
            .iter()
            .flat_map(|checkpoint| checkpoint.steps.iter())
            .filter_map(Step::fault_profile)
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.name.trim().is_empty() {
            return Err(ScenarioError::EmptyName);
        }
        if self.checkpoints.is_empty() {
            return Err(ScenarioError::NoCheckpoints(self.name.clone()));
        }
        let mut previous = Duration::ZERO;
        for checkpoint in &self.checkpoints {
            if checkpoint.offset < previous {
                return Err(ScenarioError::OffsetRegression {
                    scenario: self.name.clone(),
                    checkpoint: checkpoint.label.clone(),
                });
            }
            previous = checkpoint.offset;
            if checkpoint.soft_timeout.is_some_and(|timeout| timeout.is_zero()) {
                return Err(ScenarioError::ZeroSoftTimeout {
                    scenario: self.name.clone(),
                    checkpoint: checkpoint.label.clone(),
                });
            }
            for step in &checkpoint.steps {
                if let Step::ExpectJobs { min_ratio, .. } = step {
                    if !(0.0..=1.0).contains(min_ratio) {
                        return Err(ScenarioError::InvalidRatio {
                            scenario: self.name.clone(),
                            checkpoint: checkpoint.label.clone(),
                            ratio: *min_ratio,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
