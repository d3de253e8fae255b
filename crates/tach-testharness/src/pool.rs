//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Bounded worker pool running independent scenarios concurrently."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::sync::Arc;

use tach_common::{HarnessConfig, RunConfig};
use tach_metrics::HarnessMetrics;
use tach_resilience::{FaultMetrics, FaultProfileCatalog};
use tach_rt::{AbortSignal, WorkerGroup};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::collaborator::CollaboratorBackend;
use crate::result::ScenarioResult;
use crate::runner::{ProbeFactory, RunError, ScenarioRunner};
use crate::scenario::Scenario;

/// Runs scenarios on at most `max_workers` concurrent workers.
///
/// Every scenario gets its own [`ScenarioRunner`], so clocks, fault
/// injectors, and samplers are never shared between runs. The abort signal
/// is shared: firing it stops every run at its next boundary.
pub struct ScenarioPool {
    max_workers: usize,
    config: RunConfig,
    catalog: Arc<FaultProfileCatalog>,
    backend: CollaboratorBackend,
    abort: AbortSignal,
    metrics: Option<HarnessMetrics>,
    fault_metrics: Option<FaultMetrics>,
    probe_factory: Option<ProbeFactory>,
}

impl ScenarioPool {
    pub fn new(config: RunConfig, max_workers: usize) -> Self {
        let backend = CollaboratorBackend::from_config(&config.backend);
        Self {
            max_workers: max_workers.max(1),
            config,
            catalog: Arc::new(FaultProfileCatalog::builtin()),
            backend,
            abort: AbortSignal::never(),
            metrics: None,
            fault_metrics: None,
            probe_factory: None,
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(config.run.clone(), config.pool.max_workers)
    }

    pub fn with_catalog(mut self, catalog: Arc<FaultProfileCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_backend(mut self, backend: CollaboratorBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_metrics(mut self, metrics: HarnessMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_fault_metrics(mut self, metrics: FaultMetrics) -> Self {
        self.fault_metrics = Some(metrics);
        self
    }

    pub fn with_probe_factory(mut self, factory: ProbeFactory) -> Self {
        self.probe_factory = Some(factory);
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    fn runner_for(&self, worker: u64) -> ScenarioRunner {
        let mut runner = ScenarioRunner::new(self.config.clone())
            .with_catalog(self.catalog.clone())
            .with_backend(self.backend.clone())
            .with_abort(self.abort.clone())
            .with_worker(worker);
        if let Some(metrics) = &self.metrics {
            runner = runner.with_metrics(metrics.clone());
        }
        if let Some(metrics) = &self.fault_metrics {
            runner = runner.with_fault_metrics(metrics.clone());
        }
        if let Some(factory) = &self.probe_factory {
            runner = runner.with_probe_factory(factory.clone());
        }
        runner
    }

    /// Run every scenario and return their results in submission order.
    pub async fn run_all(&self, scenarios: Vec<Scenario>) -> Vec<Result<ScenarioResult, RunError>> {
        let permits = Arc::new(Semaphore::new(self.max_workers));
        let mut group = WorkerGroup::new();
        for (slot, scenario) in scenarios.into_iter().enumerate() {
            let runner = self.runner_for(slot as u64);
            let permits = permits.clone();
            group.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|err| RunError::Worker(err.to_string()))?;
                debug!(
                    target: "tach::testharness::pool",
                    scenario = %scenario.name,
                    worker = slot,
                    "worker acquired"
                );
                runner.run(&scenario).await
            });
        }
        debug!(
            target: "tach::testharness::pool",
            submitted = group.len(),
            max_workers = self.max_workers,
            "scenarios queued"
        );
        group
            .join()
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|err| Err(RunError::Worker(err.to_string()))))
            .collect()
    }
}
