//! ---
//! tach_section: "05-networking-external-interfaces"
//! tach_subsection: "binary"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Scenario and fault catalog listings."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tach_common::HarnessConfig;
use tach_resilience::{FaultProfile, FaultProfileCatalog};
use tach_testharness::{Scenario, ScenarioCategory, ScenarioRegistry};

#[derive(Debug, Args)]
pub struct ScenariosCommand {
    /// Only list scenarios of this category.
    #[arg(long, value_enum)]
    category: Option<ScenarioCategory>,

    /// TOML file with extra scenarios.
    #[arg(long = "scenario-file", value_name = "FILE")]
    scenario_file: Option<PathBuf>,

    /// Print full definitions as JSON.
    #[arg(long)]
    json: bool,
}

impl ScenariosCommand {
    pub fn execute(&self) -> Result<()> {
        let registry = match &self.scenario_file {
            Some(path) => ScenarioRegistry::from_file(path)?,
            None => ScenarioRegistry::builtin(),
        };
        let scenarios: Vec<&Scenario> = match self.category {
            Some(category) => registry.by_category(category),
            None => registry.iter().collect(),
        };
        if self.json {
            println!("{}", serde_json::to_string_pretty(&scenarios)?);
            return Ok(());
        }
        for scenario in scenarios {
            println!("{}", scenario_line(scenario));
        }
        Ok(())
    }
}

fn scenario_line(scenario: &Scenario) -> String {
    let hours = scenario.virtual_span().as_secs_f64() / 3_600.0;
    let mut line = format!(
        "{:<28} {:<20} {:>3} checkpoints {:>7.1}h",
        scenario.name,
        scenario.category.to_string(),
        scenario.checkpoints.len(),
        hours
    );
    if !scenario.description.is_empty() {
        line.push_str("  ");
        line.push_str(&scenario.description);
    }
    line
}

#[derive(Debug, Args)]
pub struct ProfilesCommand {
    /// Fault catalog file; defaults to `run.fault_catalog` from the configuration.
    #[arg(long, value_name = "FILE")]
    catalog: Option<PathBuf>,
}

impl ProfilesCommand {
    pub fn execute(&self, config: &HarnessConfig) -> Result<()> {
        let catalog = match self.catalog.as_ref().or(config.run.fault_catalog.as_ref()) {
            Some(path) => FaultProfileCatalog::from_file(path)?,
            None => FaultProfileCatalog::builtin(),
        };
        for profile in catalog.iter() {
            println!("{}", profile_line(profile));
        }
        Ok(())
    }
}

fn profile_line(profile: &FaultProfile) -> String {
    let shape = if profile.disconnected {
        "disconnected".to_string()
    } else {
        format!(
            "{}±{} ms, loss {:.0}%",
            profile.latency_ms,
            profile.jitter_ms,
            profile.loss_rate * 100.0
        )
    };
    format!(
        "{:<16} {:<26} {:<12} {}",
        profile.name,
        shape,
        profile.delay_mode.to_string(),
        profile.description.as_deref().unwrap_or("")
    )
}
