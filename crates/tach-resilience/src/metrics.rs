//! ---
//! tach_section: "07-resilience-fault-tolerance"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Network fault profiles, injection, and retry policies."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, Opts};
use tach_metrics::SharedRegistry;

/// Metrics published by the fault injection layer.
#[derive(Clone)]
pub struct FaultMetrics {
    registry: SharedRegistry,
    operations_total: IntCounterVec,
    injected_delay_seconds: HistogramVec,
    profile_switches_total: IntCounterVec,
}

impl FaultMetrics {
    /// Register the fault metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let operations_total = IntCounterVec::new(
            Opts::new(
                "tach_fault_operations_total",
                "Operations seen by the fault injector, by outcome",
            ),
            &["link", "outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "tach_fault_injected_delay_seconds",
            "Delay injected ahead of data-plane operations, in the profile's time base",
        )
        .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?);
        let injected_delay_seconds = HistogramVec::new(histogram_opts, &["link"])?;
        registry.register(Box::new(injected_delay_seconds.clone()))?;

        let profile_switches_total = IntCounterVec::new(
            Opts::new(
                "tach_fault_profile_switches_total",
                "Active fault profile replacements",
            ),
            &["link", "profile"],
        )?;
        registry.register(Box::new(profile_switches_total.clone()))?;

        Ok(Self {
            registry,
            operations_total,
            injected_delay_seconds,
            profile_switches_total,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Count one operation outcome (`passed`, `dropped`, `refused`, `bypassed`).
    pub fn record_operation(&self, link: &str, outcome: &str) {
        self.operations_total.with_label_values(&[link, outcome]).inc();
    }

    /// Observe an injected delay.
    pub fn observe_delay(&self, link: &str, delay: Duration) {
        self.injected_delay_seconds
            .with_label_values(&[link])
            .observe(delay.as_secs_f64());
    }

    /// Track a profile replacement.
    pub fn record_switch(&self, link: &str, profile: &str) {
        self.profile_switches_total
            .with_label_values(&[link, profile])
            .inc();
    }
}

impl std::fmt::Debug for FaultMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultMetrics").finish_non_exhaustive()
    }
}
