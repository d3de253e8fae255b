//! ---
//! tach_section: "03-persistence-logging"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Resource telemetry probes, sampler, and summaries."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};

use crate::sampler::{SamplerHealth, TelemetrySample};

/// Aggregate of one metric across the sample series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Smallest observed value.
    pub min: f64,
    /// Largest observed value.
    pub max: f64,
    /// Arithmetic mean, always within `[min, max]`.
    pub mean: f64,
    /// 95th percentile.
    pub p95: f64,
}

impl MetricSummary {
    /// Summarise a non-empty series; `None` when empty.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        // rounding in the sum can push the mean a hair outside the observed range
        let mean = (values.iter().sum::<f64>() / values.len() as f64).clamp(min, max);
        let mut data = Data::new(values.to_vec());
        let p95 = data.percentile(95).clamp(min, max);
        Some(Self { min, max, mean, p95 })
    }
}

/// Summary of one sampling session, attached to the scenario result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    /// Successful readings.
    pub samples: u64,
    /// Ticks on which a reading was attempted.
    pub attempts: u64,
    /// Attempts whose probe failed.
    pub gaps: u64,
    /// Ticks dropped because collection ran late.
    pub skipped_ticks: u64,
    /// Health at the time the summary was taken.
    pub health: SamplerHealth,
    /// Number of health transitions observed.
    pub health_transitions: u64,
    /// Real timestamp of the first sample.
    pub first_sample_at: DateTime<Utc>,
    /// Real timestamp of the last sample.
    pub last_sample_at: DateTime<Utc>,
    /// CPU utilisation in percent.
    pub cpu_percent: MetricSummary,
    /// Resident memory in bytes.
    pub resident_bytes: MetricSummary,
    /// Disk I/O in bytes per second.
    pub io_bytes_per_sec: MetricSummary,
    /// Open handle count.
    pub open_handles: MetricSummary,
}

pub(crate) struct SeriesCounters {
    pub attempts: u64,
    pub gaps: u64,
    pub skipped_ticks: u64,
    pub health: SamplerHealth,
    pub health_transitions: u64,
}

pub(crate) fn summarize(
    samples: &[TelemetrySample],
    counters: SeriesCounters,
) -> Option<TelemetrySummary> {
    let first = samples.first()?;
    let last = samples.last()?;
    let column = |select: fn(&TelemetrySample) -> f64| -> Option<MetricSummary> {
        let values: Vec<f64> = samples.iter().map(select).collect();
        MetricSummary::from_values(&values)
    };
    Some(TelemetrySummary {
        samples: samples.len() as u64,
        attempts: counters.attempts,
        gaps: counters.gaps,
        skipped_ticks: counters.skipped_ticks,
        health: counters.health,
        health_transitions: counters.health_transitions,
        first_sample_at: first.timestamp,
        last_sample_at: last.timestamp,
        cpu_percent: column(|s| s.cpu_percent)?,
        resident_bytes: column(|s| s.resident_bytes as f64)?,
        io_bytes_per_sec: column(|s| s.io_bytes_per_sec)?,
        open_handles: column(|s| s.open_handles as f64)?,
    })
}
