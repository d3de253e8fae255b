//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Run result records handed to report sinks."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tach_common::DriftSummary;
use tach_resilience::FaultStats;
use tach_sim::DatasetCounts;
use tach_telemetry::TelemetrySummary;
use uuid::Uuid;

use crate::scenario::ScenarioCategory;

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionOutcome {
    pub checkpoint: String,
    pub assertion: String,
    pub passed: bool,
    pub message: String,
    /// Virtual instant at which the outcome was recorded.
    pub virtual_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub seed: u64,
    pub counts: DatasetCounts,
    pub fingerprint: String,
}

/// Everything a run produced, including partial outcomes of runs that did not complete.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub run_id: Uuid,
    pub scenario: String,
    pub category: ScenarioCategory,
    pub status: RunStatus,
    pub started_virtual: DateTime<Utc>,
    pub ended_virtual: DateTime<Utc>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub real_elapsed: Duration,
    pub acceleration_factor: f64,
    pub outcomes: Vec<AssertionOutcome>,
    pub telemetry: Option<TelemetrySummary>,
    /// Why no telemetry summary is available.
    pub telemetry_error: Option<String>,
    pub fault_stats: FaultStats,
    pub clock_drift: Option<DriftSummary>,
    pub dataset: DatasetInfo,
    pub error: Option<String>,
}

impl ScenarioResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn failed_assertions(&self) -> impl Iterator<Item = &AssertionOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.passed)
    }

    /// Virtual time covered by the run.
    pub fn virtual_elapsed(&self) -> chrono::Duration {
        self.ended_virtual - self.started_virtual
    }

    /// One-line summary for CLI output.
    pub fn summary_line(&self) -> String {
        let failed = self.failed_assertions().count();
        format!(
            "{} [{}] {}: {} assertions, {} failed, {:.1}h virtual in {:.2}s real",
            self.scenario,
            self.run_id,
            self.status,
            self.outcomes.len(),
            failed,
            self.virtual_elapsed().num_seconds() as f64 / 3_600.0,
            self.real_elapsed.as_secs_f64()
        )
    }
}
