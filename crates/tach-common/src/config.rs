//! ---
//! tach_section: "01-core-functionality"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Shared primitives and utilities for the harness runtime."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use thiserror::Error;
use tracing::debug;

use crate::logging::LogFormat;

/// 2024-01-01T00:00:00Z, the default origin of virtual time.
const DEFAULT_VIRTUAL_EPOCH_SECS: i64 = 1_704_067_200;

fn default_acceleration_factor() -> f64 {
    60.0
}

fn default_virtual_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(DEFAULT_VIRTUAL_EPOCH_SECS, 0).unwrap_or_default()
}

fn default_hard_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_loss_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_fault_seed() -> u64 {
    0xFA_17u64
}

fn default_dataset_seed() -> u64 {
    0x5EED_F00Du64
}

fn default_stations() -> u32 {
    10
}

fn default_program_days() -> u32 {
    7
}

fn default_schedules() -> u32 {
    200
}

fn default_programs_per_day() -> u32 {
    4
}

fn default_regions() -> Vec<String> {
    ["north", "south", "east", "west", "central"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_upstream_attempts() -> u32 {
    3
}

fn default_telemetry_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_gap_ratio() -> f64 {
    0.25
}

fn default_min_attempts() -> u32 {
    4
}

fn default_clock_ticks_per_sec() -> u64 {
    100
}

fn default_page_size_bytes() -> u64 {
    4096
}

fn default_max_workers() -> usize {
    4
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    "127.0.0.1:9899"
        .parse()
        .expect("valid default metrics address")
}

/// Validation failures raised before any run resource is acquired.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// The acceleration factor is not a finite value of at least one.
    #[error("acceleration factor must be a finite value >= 1, got {0}")]
    InvalidAcceleration(f64),
    /// A duration that must be positive was zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
    /// The per-checkpoint soft timeout would never fire before the hard timeout.
    #[error("checkpoint soft timeout {soft:?} must be shorter than the hard timeout {hard:?}")]
    SoftExceedsHard { soft: Duration, hard: Duration },
    /// A procfs unit conversion was configured as zero.
    #[error("{field} must be greater than zero")]
    ZeroUnit { field: &'static str },
    /// The sampler gap ratio threshold is outside `[0, 1]`.
    #[error("telemetry gap ratio must lie within [0, 1], got {0}")]
    InvalidGapRatio(f64),
    /// A live backend was selected without an endpoint.
    #[error("live backend requires a base_url")]
    MissingBaseUrl,
    /// Dataset scale parameters are inconsistent.
    #[error("invalid dataset scale: {0}")]
    InvalidDataset(String),
    /// The requested fault profile is not part of the catalog.
    #[error("unknown fault profile '{0}'")]
    UnknownFaultProfile(String),
    /// A scenario definition is malformed.
    #[error("invalid scenario '{scenario}': {reason}")]
    InvalidScenario { scenario: String, reason: String },
    /// The worker pool was configured without capacity.
    #[error("pool must allow at least one worker")]
    EmptyPool,
}

/// Top-level configuration for a harness invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Metadata describing where a [`HarnessConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedHarnessConfig {
    pub config: HarnessConfig,
    pub source: PathBuf,
}

impl HarnessConfig {
    pub const ENV_CONFIG_PATH: &'static str = "TACH_CONFIG";

    /// Load configuration from disk, respecting the `TACH_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedHarnessConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedHarnessConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedHarnessConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse a configuration file, choosing YAML or TOML by extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str::<HarnessConfig>(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?,
            _ => toml::from_str::<HarnessConfig>(&contents)
                .with_context(|| format!("failed to parse config file {}", path.display()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants of every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.run.validate()?;
        if self.pool.max_workers == 0 {
            return Err(ConfigError::EmptyPool);
        }
        Ok(())
    }
}

impl std::str::FromStr for HarnessConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: HarnessConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Parameters for a single scenario run.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_acceleration_factor")]
    pub acceleration_factor: f64,
    #[serde(default = "default_virtual_epoch")]
    pub virtual_epoch: DateTime<Utc>,
    #[serde(default)]
    pub dataset: DatasetScale,
    /// Name of the fault profile active when the run enters `Running`.
    #[serde(default)]
    pub fault_profile: Option<String>,
    /// Extra fault profiles merged over the built-in catalog.
    #[serde(default)]
    pub fault_catalog: Option<PathBuf>,
    #[serde(default = "default_fault_seed")]
    pub fault_seed: u64,
    #[serde(default = "default_hard_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub hard_timeout: Duration,
    #[serde(default)]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub checkpoint_soft_timeout: Option<Duration>,
    /// How long a dropped operation takes to surface as a timeout.
    #[serde(default = "default_loss_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub loss_timeout: Duration,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            acceleration_factor: default_acceleration_factor(),
            virtual_epoch: default_virtual_epoch(),
            dataset: DatasetScale::default(),
            fault_profile: None,
            fault_catalog: None,
            fault_seed: default_fault_seed(),
            hard_timeout: default_hard_timeout(),
            checkpoint_soft_timeout: None,
            loss_timeout: default_loss_timeout(),
            fail_fast: false,
            backend: BackendConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl RunConfig {
    /// Validate the run parameters; called once at `Preparing` entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.acceleration_factor.is_finite() || self.acceleration_factor < 1.0 {
            return Err(ConfigError::InvalidAcceleration(self.acceleration_factor));
        }
        if self.hard_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "hard_timeout",
            });
        }
        if let Some(soft) = self.checkpoint_soft_timeout {
            if soft.is_zero() {
                return Err(ConfigError::ZeroDuration {
                    field: "checkpoint_soft_timeout",
                });
            }
            if soft >= self.hard_timeout {
                return Err(ConfigError::SoftExceedsHard {
                    soft,
                    hard: self.hard_timeout,
                });
            }
        }
        if self.loss_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "loss_timeout",
            });
        }
        self.dataset.validate()?;
        self.backend.validate()?;
        self.telemetry.validate()?;
        Ok(())
    }
}

/// Scale parameters handed to the dataset generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetScale {
    #[serde(default = "default_stations")]
    pub stations: u32,
    #[serde(default = "default_program_days")]
    pub program_days: u32,
    #[serde(default = "default_schedules")]
    pub schedules: u32,
    #[serde(default = "default_programs_per_day")]
    pub programs_per_day: u32,
    #[serde(default = "default_dataset_seed")]
    pub seed: u64,
    #[serde(default = "default_regions")]
    pub regions: Vec<String>,
}

impl Default for DatasetScale {
    fn default() -> Self {
        Self {
            stations: default_stations(),
            program_days: default_program_days(),
            schedules: default_schedules(),
            programs_per_day: default_programs_per_day(),
            seed: default_dataset_seed(),
            regions: default_regions(),
        }
    }
}

impl DatasetScale {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.program_days > 0 && self.programs_per_day == 0 {
            return Err(ConfigError::InvalidDataset(
                "programs_per_day must be positive when program_days > 0".into(),
            ));
        }
        if self.regions.is_empty() {
            return Err(ConfigError::InvalidDataset(
                "at least one region is required".into(),
            ));
        }
        Ok(())
    }
}

/// Which collaborator implementation a run drives.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Simulated,
    Live,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simulated" => Ok(BackendKind::Simulated),
            "live" => Ok(BackendKind::Live),
            other => Err(format!("unknown backend: {}", other)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// Attempts the simulated recorder makes against its upstream before failing a job.
    #[serde(default = "default_upstream_attempts")]
    pub upstream_attempts: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            base_url: None,
            request_timeout: default_request_timeout(),
            upstream_attempts: default_upstream_attempts(),
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind == BackendKind::Live
            && self
                .base_url
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            return Err(ConfigError::MissingBaseUrl);
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "backend.request_timeout",
            });
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Real-time sampling interval; never scaled by the acceleration factor.
    #[serde(default = "default_telemetry_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
    #[serde(default = "default_max_gap_ratio")]
    pub max_gap_ratio: f64,
    #[serde(default = "default_min_attempts")]
    pub min_attempts_for_degradation: u32,
    /// Process to observe; the harness itself when unset.
    #[serde(default)]
    pub target_pid: Option<u32>,
    /// `USER_HZ` of the observed host, used to turn `/proc/<pid>/stat` ticks into seconds.
    #[serde(default = "default_clock_ticks_per_sec")]
    pub clock_ticks_per_sec: u64,
    /// Page size of the observed host, used to turn the resident set into bytes.
    /// Set to 16384 or 65536 on arm64 kernels built with larger pages.
    #[serde(default = "default_page_size_bytes")]
    pub page_size_bytes: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval: default_telemetry_interval(),
            max_gap_ratio: default_max_gap_ratio(),
            min_attempts_for_degradation: default_min_attempts(),
            target_pid: None,
            clock_ticks_per_sec: default_clock_ticks_per_sec(),
            page_size_bytes: default_page_size_bytes(),
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "telemetry.interval",
            });
        }
        if !(0.0..=1.0).contains(&self.max_gap_ratio) {
            return Err(ConfigError::InvalidGapRatio(self.max_gap_ratio));
        }
        if self.clock_ticks_per_sec == 0 {
            return Err(ConfigError::ZeroUnit {
                field: "telemetry.clock_ticks_per_sec",
            });
        }
        if self.page_size_bytes == 0 {
            return Err(ConfigError::ZeroUnit {
                field: "telemetry.page_size_bytes",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_validate() {
        let config = HarnessConfig::default();
        config.validate().expect("defaults are valid");
        assert_eq!(config.run.virtual_epoch.timestamp(), DEFAULT_VIRTUAL_EPOCH_SECS);
    }

    #[test]
    fn rejects_sub_unit_acceleration() {
        let mut run = RunConfig::default();
        run.acceleration_factor = 0.0;
        assert_eq!(run.validate(), Err(ConfigError::InvalidAcceleration(0.0)));
        run.acceleration_factor = f64::NAN;
        assert!(matches!(
            run.validate(),
            Err(ConfigError::InvalidAcceleration(_))
        ));
    }

    #[test]
    fn rejects_soft_timeout_longer_than_hard() {
        let run = RunConfig {
            hard_timeout: Duration::from_secs(1),
            checkpoint_soft_timeout: Some(Duration::from_secs(5)),
            ..RunConfig::default()
        };
        assert!(matches!(
            run.validate(),
            Err(ConfigError::SoftExceedsHard { .. })
        ));
    }

    #[test]
    fn live_backend_requires_url() {
        let mut run = RunConfig::default();
        run.backend.kind = BackendKind::Live;
        assert_eq!(run.validate(), Err(ConfigError::MissingBaseUrl));
        run.backend.base_url = Some("http://127.0.0.1:8080".into());
        run.validate().expect("url supplied");
    }

    #[test]
    fn parses_toml_with_durations() {
        let config = r#"
            [run]
            acceleration_factor = 100.0
            hard_timeout = 30000
            checkpoint_soft_timeout = 5000
            fault_profile = "poor-connection"
            fail_fast = true

            [run.dataset]
            stations = 50
            program_days = 30
            schedules = 5000

            [pool]
            max_workers = 2
        "#
        .parse::<HarnessConfig>()
        .unwrap();
        assert_eq!(config.run.acceleration_factor, 100.0);
        assert_eq!(config.run.hard_timeout, Duration::from_secs(30));
        assert_eq!(
            config.run.checkpoint_soft_timeout,
            Some(Duration::from_secs(5))
        );
        assert_eq!(config.run.dataset.stations, 50);
        assert_eq!(config.run.dataset.programs_per_day, 4);
        assert_eq!(config.pool.max_workers, 2);
        assert!(config.run.fail_fast);
    }

    #[test]
    fn procfs_units_are_configurable() {
        let config = "[run.telemetry]\npage_size_bytes = 65536\n"
            .parse::<HarnessConfig>()
            .unwrap();
        assert_eq!(config.run.telemetry.page_size_bytes, 65_536);
        assert_eq!(config.run.telemetry.clock_ticks_per_sec, 100);

        let telemetry = TelemetryConfig {
            clock_ticks_per_sec: 0,
            ..TelemetryConfig::default()
        };
        assert_eq!(
            telemetry.validate(),
            Err(ConfigError::ZeroUnit {
                field: "telemetry.clock_ticks_per_sec"
            })
        );
    }

    #[test]
    fn loads_yaml_by_extension() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
        writeln!(file, "run:\n  acceleration_factor: 25.0\n  fail_fast: true")?;
        file.flush()?;
        let config = HarnessConfig::from_path(file.path())?;
        assert_eq!(config.run.acceleration_factor, 25.0);
        assert!(config.run.fail_fast);
        Ok(())
    }

    #[test]
    fn load_with_source_reports_missing_candidates() {
        let missing = NamedTempFile::new().unwrap().into_temp_path();
        let path = missing.to_path_buf();
        missing.close().unwrap();
        if std::env::var(HarnessConfig::ENV_CONFIG_PATH).is_ok() {
            return;
        }
        let err = HarnessConfig::load_with_source(&[path]).unwrap_err();
        assert!(err.to_string().contains("no configuration files found"));
    }
}
