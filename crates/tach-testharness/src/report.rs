//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Reporting boundary for scenario results."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::result::ScenarioResult;

/// Receives finished results. Rendering beyond JSON is left to downstream tooling.
pub trait ReportSink: Send + Sync {
    /// Persist one result and return where it went.
    fn publish(&self, result: &ScenarioResult) -> Result<PathBuf>;
}

/// Writes `<dir>/<scenario>-<run_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonReportSink {
    directory: PathBuf,
}

impl JsonReportSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, result: &ScenarioResult) -> PathBuf {
        self.directory
            .join(format!("{}-{}.json", result.scenario, result.run_id))
    }
}

impl ReportSink for JsonReportSink {
    fn publish(&self, result: &ScenarioResult) -> Result<PathBuf> {
        fs::create_dir_all(&self.directory).with_context(|| {
            format!("failed to create report directory {}", self.directory.display())
        })?;
        let path = self.path_for(result);
        let file = File::create(&path)
            .with_context(|| format!("failed to create report {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, result)
            .with_context(|| format!("failed to encode report {}", path.display()))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        info!(
            target: "tach::testharness::report",
            scenario = %result.scenario,
            status = %result.status,
            path = %path.display(),
            "report written"
        );
        Ok(path)
    }
}
