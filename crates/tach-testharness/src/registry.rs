//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Category-keyed registry of runnable scenarios."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::collaborator::{CollaboratorSignal, JobStatus};
use crate::scenario::{Checkpoint, Scenario, ScenarioCategory, ScenarioError, Step};

const HOUR: Duration = Duration::from_secs(3_600);
const DAY: Duration = Duration::from_secs(86_400);

/// Scenarios addressable by name and by category.
#[derive(Debug, Clone, Default)]
pub struct ScenarioRegistry {
    scenarios: IndexMap<String, Scenario>,
}

#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    scenarios: Vec<Scenario>,
}

impl ScenarioRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in scenarios, at least one per category.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for scenario in builtin_scenarios() {
            // built-ins are covered by the validation test below
            let _ = registry.register(scenario);
        }
        registry
    }

    /// Built-ins extended (or overridden by name) with the scenarios in a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario file {}", path.display()))?;
        raw.parse()
            .with_context(|| format!("failed to parse scenario file {}", path.display()))
    }

    /// Validate and add a scenario, returning the one it replaced.
    pub fn register(&mut self, scenario: Scenario) -> Result<Option<Scenario>, ScenarioError> {
        scenario.validate()?;
        Ok(self.scenarios.insert(scenario.name.clone(), scenario))
    }

    pub fn find(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.get(name)
    }

    pub fn by_category(&self, category: ScenarioCategory) -> Vec<&Scenario> {
        self.scenarios
            .values()
            .filter(|scenario| scenario.category == category)
            .collect()
    }

    /// Categories with at least one scenario, in declaration order.
    pub fn categories(&self) -> Vec<ScenarioCategory> {
        ScenarioCategory::ALL
            .into_iter()
            .filter(|category| self.scenarios.values().any(|s| s.category == *category))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.values()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

impl FromStr for ScenarioRegistry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let file: ScenarioFile = toml::from_str(s).context("invalid scenario definition")?;
        let mut registry = Self::builtin();
        for scenario in file.scenarios {
            let name = scenario.name.clone();
            registry
                .register(scenario)
                .with_context(|| format!("scenario '{name}' is invalid"))?;
        }
        Ok(registry)
    }
}

fn builtin_scenarios() -> Vec<Scenario> {
    vec![
        Scenario::new("recording-soak", ScenarioCategory::Soak)
            .describe("A week of scheduled and ad-hoc recordings on a clean network.")
            .checkpoint(
                Checkpoint::new("warmup", Duration::ZERO)
                    .step(Step::ExpectHealthy { healthy: true })
                    .step(Step::ExpectCatalogMatches)
                    .step(Step::StartRecordings { count: 20 }),
            )
            .checkpoint(Checkpoint::new("first-trigger", 6 * HOUR).step(Step::TriggerScheduler))
            .checkpoint(
                Checkpoint::new("day-1", DAY)
                    .step(Step::ExpectJobs {
                        status: JobStatus::Completed,
                        min_ratio: 0.95,
                    })
                    .step(Step::TriggerScheduler),
            )
            .checkpoint(Checkpoint::new("day-3", 3 * DAY).step(Step::TriggerScheduler))
            .checkpoint(
                Checkpoint::new("day-7", 7 * DAY)
                    .step(Step::ExpectJobs {
                        status: JobStatus::Completed,
                        min_ratio: 0.95,
                    })
                    .step(Step::ExpectHealthy { healthy: true }),
            ),
        Scenario::new("schedule-burst", ScenarioCategory::ScheduleBurst)
            .describe("Repeated scheduler triggers over a busy first day.")
            .checkpoint(Checkpoint::new("ready", Duration::ZERO).step(Step::ExpectHealthy { healthy: true }))
            .checkpoint(Checkpoint::new("hour-1", HOUR).step(Step::TriggerScheduler))
            .checkpoint(Checkpoint::new("hour-2", 2 * HOUR).step(Step::TriggerScheduler))
            .checkpoint(Checkpoint::new("midday", 12 * HOUR).step(Step::TriggerScheduler))
            .checkpoint(
                Checkpoint::new("day-1", DAY)
                    .step(Step::ExpectJobs {
                        status: JobStatus::Completed,
                        min_ratio: 0.9,
                    })
                    .step(Step::ExpectHealthy { healthy: true }),
            ),
        Scenario::new("poor-connection-recording", ScenarioCategory::NetworkDegradation)
            .describe("Recording under sustained latency and packet loss.")
            .checkpoint(
                Checkpoint::new("degrade", Duration::ZERO)
                    .step(Step::SetFaultProfile {
                        profile: "poor-connection".into(),
                    })
                    .step(Step::StartRecordings { count: 50 }),
            )
            .checkpoint(Checkpoint::new("trigger", 6 * HOUR).step(Step::TriggerScheduler))
            .checkpoint(
                Checkpoint::new("day-1", DAY)
                    .step(Step::ExpectJobs {
                        status: JobStatus::Completed,
                        min_ratio: 0.5,
                    })
                    .step(Step::ClearFaults)
                    .step(Step::ExpectHealthy { healthy: true }),
            ),
        Scenario::new("link-flap", ScenarioCategory::NetworkDegradation)
            .describe("Upstream disconnect followed by recovery of the link.")
            .checkpoint(
                Checkpoint::new("link-down", Duration::ZERO)
                    .step(Step::SetFaultProfile {
                        profile: "disconnect".into(),
                    })
                    .step(Step::StartRecordings { count: 10 })
                    .step(Step::ExpectJobs {
                        status: JobStatus::Failed,
                        min_ratio: 1.0,
                    }),
            )
            .checkpoint(
                Checkpoint::new("link-up", HOUR)
                    .step(Step::ClearFaults)
                    .step(Step::StartRecordings { count: 10 }),
            )
            .checkpoint(Checkpoint::new("settled", DAY).step(Step::ExpectJobs {
                status: JobStatus::Completed,
                min_ratio: 0.5,
            })),
        Scenario::new("crash-recovery", ScenarioCategory::Recovery)
            .describe("Kill the recorder mid-recording, restart it, and keep recording.")
            .checkpoint(Checkpoint::new("record", Duration::ZERO).step(Step::StartRecordings { count: 10 }))
            .checkpoint(
                Checkpoint::new("crash", HOUR / 2)
                    .step(Step::Signal {
                        signal: CollaboratorSignal::Kill,
                    })
                    .step(Step::ExpectHealthy { healthy: false }),
            )
            .checkpoint(
                Checkpoint::new("restart", HOUR)
                    .step(Step::Signal {
                        signal: CollaboratorSignal::Restart,
                    })
                    .step(Step::ExpectHealthy { healthy: true })
                    .step(Step::ExpectCatalogMatches)
                    .step(Step::StartRecordings { count: 10 }),
            )
            .checkpoint(Checkpoint::new("day-1", DAY).step(Step::ExpectJobs {
                status: JobStatus::Completed,
                min_ratio: 0.4,
            })),
    ]
}
