//! ---
//! tach_section: "03-persistence-logging"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Resource telemetry probes, sampler, and summaries."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Resource telemetry collected alongside accelerated scenario runs.
//!
//! Sampling runs on a fixed real-time interval in its own task and is never
//! scaled by the virtual clock.

pub mod probe;
pub mod sampler;
pub mod summary;

pub use probe::{ProbeError, ProcfsProbe, ProcfsUnits, ResourceProbe, ResourceReading};
pub use sampler::{SamplerError, SamplerHealth, SamplerPolicy, TelemetrySample, TelemetrySampler};
pub use summary::{MetricSummary, TelemetrySummary};
