//! ---
//! tach_section: "15-testing-qa-runbook"
//! tach_subsection: "integration-tests"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Concurrent scenario runs on the worker pool."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tach_common::{HarnessConfig, TelemetryConfig};
use tach_metrics::{new_registry, HarnessMetrics};
use tach_resilience::FaultMetrics;
use tach_telemetry::{ProbeError, ResourceProbe, ResourceReading};
use tach_testharness::{RunStatus, Scenario, ScenarioPool, ScenarioRegistry};

struct FlatProbe;

#[async_trait]
impl ResourceProbe for FlatProbe {
    fn name(&self) -> &str {
        "flat"
    }

    async fn probe(&mut self) -> Result<ResourceReading, ProbeError> {
        Ok(ResourceReading {
            cpu_percent: 1.0,
            resident_bytes: 1 << 20,
            io_bytes_per_sec: 0.0,
            open_handles: 8,
        })
    }
}

fn harness_config(workers: usize) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.pool.max_workers = workers;
    config.run.acceleration_factor = 3_600.0;
    config.run.telemetry.interval = Duration::from_secs(10);
    config
}

fn flat_probe() -> tach_testharness::ProbeFactory {
    Arc::new(|_: &TelemetryConfig| Box::new(FlatProbe) as Box<dyn ResourceProbe>)
}

fn sample_value(registry: &tach_metrics::SharedRegistry, name: &str) -> f64 {
    registry
        .gather()
        .into_iter()
        .filter(|family| family.get_name() == name)
        .flat_map(|family| family.get_metric().to_vec())
        .map(|metric| {
            if metric.has_counter() {
                metric.get_counter().get_value()
            } else {
                metric.get_gauge().get_value()
            }
        })
        .sum()
}

#[tokio::test(start_paused = true)]
async fn every_builtin_scenario_completes_on_the_pool() {
    let registry = ScenarioRegistry::builtin();
    let scenarios: Vec<Scenario> = registry.iter().cloned().collect();
    let metrics_registry = new_registry();
    let pool = ScenarioPool::from_config(&harness_config(3))
        .with_probe_factory(flat_probe())
        .with_metrics(HarnessMetrics::new(metrics_registry.clone()).unwrap())
        .with_fault_metrics(FaultMetrics::new(metrics_registry.clone()).unwrap());

    let results = pool.run_all(scenarios.clone()).await;
    assert_eq!(results.len(), scenarios.len());

    let mut run_ids = HashSet::new();
    for (scenario, result) in scenarios.iter().zip(&results) {
        let result = result.as_ref().unwrap();
        assert_eq!(result.scenario, scenario.name);
        assert_eq!(
            result.status,
            RunStatus::Completed,
            "{}: {:?}",
            scenario.name,
            result.failed_assertions().collect::<Vec<_>>()
        );
        assert!(result.telemetry.is_some());
        assert!(run_ids.insert(result.run_id));
    }

    let crash = results
        .iter()
        .flatten()
        .find(|result| result.scenario == "crash-recovery")
        .unwrap();
    assert!(crash
        .outcomes
        .iter()
        .any(|outcome| outcome.assertion == "expect_healthy(false)" && outcome.passed));

    assert_eq!(sample_value(&metrics_registry, "tach_runs_total"), scenarios.len() as f64);
    assert_eq!(sample_value(&metrics_registry, "tach_active_runs"), 0.0);
    assert!(sample_value(&metrics_registry, "tach_checkpoints_total") > 0.0);
}

#[tokio::test(start_paused = true)]
async fn runs_with_different_profiles_keep_separate_fault_state() {
    let mut config = harness_config(2);
    config.run.fault_profile = Some("unstable".into());
    let registry = ScenarioRegistry::builtin();
    let scenarios = vec![
        registry.find("link-flap").unwrap().clone(),
        registry.find("schedule-burst").unwrap().clone(),
    ];
    let results = ScenarioPool::from_config(&config)
        .with_probe_factory(flat_probe())
        .run_all(scenarios)
        .await;

    let flap = results[0].as_ref().unwrap();
    let burst = results[1].as_ref().unwrap();
    assert!(flap.fault_stats.refused > 0);
    assert_eq!(burst.fault_stats.refused, 0);
    assert_eq!(flap.fault_stats.active_profile, "baseline");
    assert_eq!(burst.fault_stats.active_profile, "unstable");
}

#[tokio::test(start_paused = true)]
async fn unknown_initial_profile_rejects_every_run_before_running() {
    let mut config = harness_config(2);
    config.run.fault_profile = Some("does-not-exist".into());
    let registry = ScenarioRegistry::builtin();
    let results = ScenarioPool::from_config(&config)
        .with_probe_factory(flat_probe())
        .run_all(registry.iter().cloned().collect())
        .await;
    assert!(results
        .iter()
        .all(|result| matches!(result, Err(tach_testharness::RunError::Configuration(_)))));
}
