//! ---
//! tach_section: "05-networking-external-interfaces"
//! tach_subsection: "binary"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Scenario execution subcommand."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use indexmap::IndexMap;
use tach_common::{init_tracing, BackendKind, HarnessConfig};
use tach_logging::{log_run_event, RunEventOutcome};
use tach_metrics::{new_registry, spawn_http_server, HarnessMetrics};
use tach_resilience::{FaultMetrics, FaultProfileCatalog};
use tach_rt::AbortHandle;
use tach_testharness::{
    JsonReportSink, ReportSink, RunStatus, Scenario, ScenarioCategory, ScenarioPool, ScenarioRegistry,
};
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Args)]
pub struct RunCommand {
    /// Scenario to run by name. Repeatable.
    #[arg(long = "scenario", value_name = "NAME")]
    scenarios: Vec<String>,

    /// Run every scenario of a category. Repeatable.
    #[arg(long = "category", value_enum, value_name = "CATEGORY")]
    categories: Vec<ScenarioCategory>,

    /// TOML file with extra scenarios; entries override built-ins by name.
    #[arg(long = "scenario-file", value_name = "FILE")]
    scenario_file: Option<PathBuf>,

    /// Directory receiving one JSON report per run.
    #[arg(long = "report-dir", value_name = "DIR", default_value = "target/tach-reports")]
    report_dir: PathBuf,

    /// Override the acceleration factor.
    #[arg(long, value_name = "FACTOR")]
    factor: Option<f64>,

    /// Fault profile active when each run starts.
    #[arg(long = "fault-profile", value_name = "NAME")]
    fault_profile: Option<String>,

    /// Override the number of concurrent workers.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Drive a live recorder at this base URL instead of the simulated one.
    #[arg(long = "backend-url", value_name = "URL", env = "TACH_BACKEND_URL")]
    backend_url: Option<String>,
}

impl RunCommand {
    fn apply_overrides(&self, config: &mut HarnessConfig) {
        if let Some(factor) = self.factor {
            config.run.acceleration_factor = factor;
        }
        if let Some(profile) = &self.fault_profile {
            config.run.fault_profile = Some(profile.clone());
        }
        if let Some(workers) = self.workers {
            config.pool.max_workers = workers;
        }
        if let Some(url) = &self.backend_url {
            config.run.backend.kind = BackendKind::Live;
            config.run.backend.base_url = Some(url.clone());
        }
    }

    fn registry(&self) -> Result<ScenarioRegistry> {
        match &self.scenario_file {
            Some(path) => ScenarioRegistry::from_file(path),
            None => Ok(ScenarioRegistry::builtin()),
        }
    }

    pub async fn execute(self, mut config: HarnessConfig, source: Option<PathBuf>) -> Result<ExitCode> {
        self.apply_overrides(&mut config);
        config.validate()?;
        let session = init_tracing("tachctl", &config.logging)?;
        match &source {
            Some(path) => info!(session = %session.id, config_path = %path.display(), "configuration loaded"),
            None => info!(session = %session.id, "no configuration file found; using built-in defaults"),
        }

        let registry = self.registry()?;
        let selected = select_scenarios(&registry, &self.scenarios, &self.categories)?;
        let catalog = match &config.run.fault_catalog {
            Some(path) => FaultProfileCatalog::from_file(path)?,
            None => FaultProfileCatalog::builtin(),
        };

        let metrics_registry = new_registry();
        let harness_metrics = HarnessMetrics::new(metrics_registry.clone())?;
        let fault_metrics = FaultMetrics::new(metrics_registry.clone())?;
        let metrics_server = if config.metrics.enabled {
            let server = spawn_http_server(metrics_registry, config.metrics.listen)?;
            info!(address = %server.addr(), "metrics exporter enabled");
            Some(server)
        } else {
            None
        };

        let (abort, abort_signal) = AbortHandle::new();
        let interrupt = tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("ctrl-c received; aborting runs at their next boundary");
                abort.abort("interrupted by operator");
            }
        });

        let pool = ScenarioPool::from_config(&config)
            .with_catalog(Arc::new(catalog))
            .with_abort(abort_signal)
            .with_metrics(harness_metrics)
            .with_fault_metrics(fault_metrics);
        info!(
            scenarios = selected.len(),
            workers = pool.max_workers(),
            factor = config.run.acceleration_factor,
            "starting scenario runs"
        );
        let names: Vec<String> = selected.iter().map(|scenario| scenario.name.clone()).collect();
        let results = pool.run_all(selected).await;
        interrupt.abort();

        let sink = JsonReportSink::new(&self.report_dir);
        let mut all_completed = true;
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(result) => {
                    all_completed &= result.status == RunStatus::Completed;
                    let path = sink
                        .publish(&result)
                        .with_context(|| format!("failed to write report for '{name}'"))?;
                    println!("{}", result.summary_line());
                    println!("  report: {}", path.display());
                    for failed in result.failed_assertions() {
                        println!("  ✗ {} / {}: {}", failed.checkpoint, failed.assertion, failed.message);
                    }
                    if let Some(error) = &result.error {
                        println!("  error: {error}");
                    }
                }
                Err(err) => {
                    all_completed = false;
                    log_run_event(None, "run.rejected", &format!("{name}: {err}"), RunEventOutcome::Fault);
                    eprintln!("{name}: {err}");
                }
            }
        }

        if let Some(server) = metrics_server {
            server.shutdown().await?;
        }
        Ok(if all_completed {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }
}

/// Scenarios named explicitly, then those of the requested categories; everything when neither is given.
pub(crate) fn select_scenarios(
    registry: &ScenarioRegistry,
    names: &[String],
    categories: &[ScenarioCategory],
) -> Result<Vec<Scenario>> {
    let mut selected: IndexMap<String, Scenario> = IndexMap::new();
    for name in names {
        let scenario = registry
            .find(name)
            .ok_or_else(|| anyhow!("unknown scenario '{name}'"))?;
        selected.insert(scenario.name.clone(), scenario.clone());
    }
    for category in categories {
        let matching = registry.by_category(*category);
        if matching.is_empty() {
            return Err(anyhow!("no scenarios registered for category '{category}'"));
        }
        for scenario in matching {
            selected.insert(scenario.name.clone(), scenario.clone());
        }
    }
    if names.is_empty() && categories.is_empty() {
        for scenario in registry.iter() {
            selected.insert(scenario.name.clone(), scenario.clone());
        }
    }
    Ok(selected.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunCommand,
    }

    #[test]
    fn run_flags_parse() {
        let parsed = Harness::try_parse_from([
            "run",
            "--scenario",
            "link-flap",
            "--category",
            "recovery",
            "--factor",
            "120",
            "--workers",
            "2",
            "--fault-profile",
            "unstable",
        ])
        .unwrap();
        assert_eq!(parsed.run.scenarios, vec!["link-flap".to_string()]);
        assert_eq!(parsed.run.categories, vec![ScenarioCategory::Recovery]);

        let mut config = HarnessConfig::default();
        parsed.run.apply_overrides(&mut config);
        assert_eq!(config.run.acceleration_factor, 120.0);
        assert_eq!(config.pool.max_workers, 2);
        assert_eq!(config.run.fault_profile.as_deref(), Some("unstable"));
        assert_eq!(config.run.backend.kind, BackendKind::Simulated);
    }

    #[test]
    fn backend_url_switches_to_live() {
        let parsed = Harness::try_parse_from(["run", "--backend-url", "http://127.0.0.1:8080"]).unwrap();
        let mut config = HarnessConfig::default();
        parsed.run.apply_overrides(&mut config);
        assert_eq!(config.run.backend.kind, BackendKind::Live);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn selection_deduplicates_and_preserves_order() {
        let registry = ScenarioRegistry::builtin();
        let selected = select_scenarios(
            &registry,
            &["crash-recovery".into()],
            &[ScenarioCategory::Recovery, ScenarioCategory::Soak],
        )
        .unwrap();
        let names: Vec<_> = selected.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["crash-recovery", "recording-soak"]);

        let everything = select_scenarios(&registry, &[], &[]).unwrap();
        assert_eq!(everything.len(), registry.len());
        assert!(select_scenarios(&registry, &["nope".into()], &[]).is_err());
    }
}
