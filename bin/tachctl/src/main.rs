//! ---
//! tach_section: "05-networking-external-interfaces"
//! tach_subsection: "binary"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Control CLI for running and inspecting Tachyon scenarios."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tach_common::HarnessConfig;

mod inspect;
mod run;

/// Looked up when neither `--config` nor `TACH_CONFIG` is given.
const DEFAULT_CONFIG_PATH: &str = "tachyon.toml";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tachyon time-accelerated scenario harness",
    long_about = None
)]
struct Cli {
    /// Harness configuration file (TOML or YAML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run scenarios on the worker pool and write one JSON report per run.
    Run(run::RunCommand),
    /// List registered scenarios.
    Scenarios(inspect::ScenariosCommand),
    /// List fault profiles.
    Profiles(inspect::ProfilesCommand),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(cmd) => {
            let (config, source) = load_config(cli.config.as_deref())?;
            cmd.execute(config, source).await
        }
        Commands::Scenarios(cmd) => {
            tach_logging::init();
            cmd.execute()?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Profiles(cmd) => {
            tach_logging::init();
            let (config, _) = load_config(cli.config.as_deref())?;
            cmd.execute(&config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Explicit paths must exist; without one, a missing default file means built-in defaults.
fn load_config(path: Option<&Path>) -> Result<(HarnessConfig, Option<PathBuf>)> {
    let from_env = std::env::var(HarnessConfig::ENV_CONFIG_PATH)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    if path.is_none() && !from_env && !Path::new(DEFAULT_CONFIG_PATH).exists() {
        let config = HarnessConfig::default();
        config.validate()?;
        return Ok((config, None));
    }
    let mut candidates = Vec::new();
    if let Some(path) = path {
        candidates.push(path.to_path_buf());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));
    let loaded = HarnessConfig::load_with_source(&candidates)?;
    Ok((loaded.config, Some(loaded.source)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_config_flag_is_accepted_after_subcommand() {
        let cli = Cli::try_parse_from(["tachctl", "scenarios", "--config", "harness.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("harness.toml")));
        assert!(matches!(cli.command, Commands::Scenarios(_)));
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        if std::env::var(HarnessConfig::ENV_CONFIG_PATH).is_ok() {
            return;
        }
        assert!(load_config(Some(&missing)).is_err());
    }

    #[test]
    fn explicit_config_is_loaded() {
        if std::env::var(HarnessConfig::ENV_CONFIG_PATH).is_ok() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "[run]\nacceleration_factor = 120.0\n\n[pool]\nmax_workers = 3\n").unwrap();
        let (config, source) = load_config(Some(&path)).unwrap();
        assert_eq!(config.run.acceleration_factor, 120.0);
        assert_eq!(config.pool.max_workers, 3);
        assert_eq!(source, Some(path));
    }
}
