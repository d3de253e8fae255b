//! ---
//! tach_section: "01-core-functionality"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Shared primitives and utilities for the harness runtime."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
//! Core shared primitives for the Tachyon harness workspace.
//! This crate exposes run configuration loading and validation, tracing
//! initialisation, and the timing helpers consumed across the workspace.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod time;

pub use config::{
    BackendConfig, BackendKind, ConfigError, DatasetScale, HarnessConfig, LoadedHarnessConfig,
    LoggingConfig, MetricsConfig, PoolConfig, RunConfig, TelemetryConfig,
};
pub use logging::{init_tracing, LogFormat, LogSession};
pub use metrics::{DriftHistogram, DriftSummary};
