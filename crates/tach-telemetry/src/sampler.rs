//! ---
//! tach_section: "03-persistence-logging"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Resource telemetry probes, sampler, and summaries."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tach_common::TelemetryConfig;
use tach_rt::SampleTicker;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::probe::{ResourceProbe, ResourceReading};
use crate::summary::{summarize, SeriesCounters, TelemetrySummary};

/// Errors surfaced by [`TelemetrySampler`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SamplerError {
    /// No sample was collected before the summary was requested.
    #[error("no telemetry samples were collected")]
    EmptySeries,
    /// `start` was called on a sampler that already ran.
    #[error("sampler already started")]
    AlreadyStarted,
    /// The sampling interval must be non-zero.
    #[error("sampling interval must be non-zero")]
    ZeroInterval,
}

/// One successful telemetry reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Real wall-clock time of the reading.
    pub timestamp: DateTime<Utc>,
    /// CPU utilisation in percent.
    pub cpu_percent: f64,
    /// Resident memory in bytes.
    pub resident_bytes: u64,
    /// Disk I/O in bytes per second.
    pub io_bytes_per_sec: f64,
    /// Open handle count.
    pub open_handles: u64,
}

impl TelemetrySample {
    fn from_reading(timestamp: DateTime<Utc>, reading: ResourceReading) -> Self {
        Self {
            timestamp,
            cpu_percent: reading.cpu_percent,
            resident_bytes: reading.resident_bytes,
            io_bytes_per_sec: reading.io_bytes_per_sec,
            open_handles: reading.open_handles,
        }
    }
}

/// Sampler health derived from the ratio of gaps to attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerHealth {
    /// Gap ratio within policy.
    Healthy,
    /// Gap ratio above policy; the series is unreliable but still reported.
    Degraded,
}

impl SamplerHealth {
    /// Static label for logs and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplerHealth::Healthy => "healthy",
            SamplerHealth::Degraded => "degraded",
        }
    }
}

impl fmt::Display for SamplerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds deciding when the sampler is degraded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerPolicy {
    /// Gap ratio above which the sampler degrades.
    pub max_gap_ratio: f64,
    /// Attempts required before the ratio is evaluated.
    pub min_attempts: u64,
}

impl SamplerPolicy {
    fn determine(&self, attempts: u64, gaps: u64) -> SamplerHealth {
        if attempts < self.min_attempts.max(1) {
            return SamplerHealth::Healthy;
        }
        if gaps as f64 / attempts as f64 > self.max_gap_ratio {
            SamplerHealth::Degraded
        } else {
            SamplerHealth::Healthy
        }
    }
}

impl Default for SamplerPolicy {
    fn default() -> Self {
        Self {
            max_gap_ratio: 0.25,
            min_attempts: 4,
        }
    }
}

impl From<&TelemetryConfig> for SamplerPolicy {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            max_gap_ratio: config.max_gap_ratio,
            min_attempts: u64::from(config.min_attempts_for_degradation),
        }
    }
}

struct HealthTracker {
    policy: SamplerPolicy,
    current: SamplerHealth,
    transitions: u64,
}

impl HealthTracker {
    fn evaluate(&mut self, probe: &str, attempts: u64, gaps: u64) -> SamplerHealth {
        let level = self.policy.determine(attempts, gaps);
        if level != self.current {
            self.transitions += 1;
            match level {
                SamplerHealth::Degraded => warn!(
                    target: "tach::telemetry::sampler",
                    probe,
                    attempts,
                    gaps,
                    max_gap_ratio = self.policy.max_gap_ratio,
                    "sampler health transition to degraded",
                ),
                SamplerHealth::Healthy => info!(
                    target: "tach::telemetry::sampler",
                    probe,
                    attempts,
                    gaps,
                    "sampler health recovered",
                ),
            }
            self.current = level;
        }
        level
    }
}

struct SamplerShared {
    samples: Mutex<Vec<TelemetrySample>>,
    attempts: AtomicU64,
    gaps: AtomicU64,
    skipped_ticks: AtomicU64,
    health: Mutex<HealthTracker>,
}

struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Samples a [`ResourceProbe`] on a fixed real-time interval in its own task.
///
/// The task is the only writer of the sample log; readers see it through
/// [`summary`](Self::summary) and [`samples`](Self::samples).
pub struct TelemetrySampler {
    shared: Arc<SamplerShared>,
    running: Mutex<Option<Running>>,
    started: AtomicBool,
}

impl TelemetrySampler {
    /// Create an idle sampler governed by `policy`.
    pub fn new(policy: SamplerPolicy) -> Self {
        Self {
            shared: Arc::new(SamplerShared {
                samples: Mutex::new(Vec::new()),
                attempts: AtomicU64::new(0),
                gaps: AtomicU64::new(0),
                skipped_ticks: AtomicU64::new(0),
                health: Mutex::new(HealthTracker {
                    policy,
                    current: SamplerHealth::Healthy,
                    transitions: 0,
                }),
            }),
            running: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the sampling task. The first reading is taken one `interval` after the call.
    pub fn start(
        &self,
        mut probe: Box<dyn ResourceProbe>,
        interval: Duration,
    ) -> Result<(), SamplerError> {
        if interval.is_zero() {
            return Err(SamplerError::ZeroInterval);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SamplerError::AlreadyStarted);
        }
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let mut ticker = SampleTicker::new(interval);
            debug!(
                target: "tach::telemetry::sampler",
                probe = probe.name(),
                interval_ms = interval.as_millis() as u64,
                "sampler started"
            );
            loop {
                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    tick = ticker.tick() => {
                        if tick.skipped > 0 {
                            shared.skipped_ticks.fetch_add(tick.skipped, Ordering::Relaxed);
                        }
                        shared.record(probe.as_mut()).await;
                    }
                }
            }
            debug!(target: "tach::telemetry::sampler", probe = probe.name(), "sampler stopped");
        });
        *self.running.lock() = Some(Running {
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    /// Halt sampling and wait for the task to exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(Running { stop, task }) = running {
            let _ = stop.send(true);
            if let Err(err) = task.await {
                warn!(target: "tach::telemetry::sampler", error = %err, "sampler task ended abnormally");
            }
        }
    }

    /// Whether the sampling task is currently running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Current health.
    pub fn health(&self) -> SamplerHealth {
        self.shared.health.lock().current
    }

    /// Copy of the sample log.
    pub fn samples(&self) -> Vec<TelemetrySample> {
        self.shared.samples.lock().clone()
    }

    /// Summarise the series collected so far.
    pub fn summary(&self) -> Result<TelemetrySummary, SamplerError> {
        let samples = self.shared.samples.lock();
        let (health, health_transitions) = {
            let tracker = self.shared.health.lock();
            (tracker.current, tracker.transitions)
        };
        summarize(
            &samples,
            SeriesCounters {
                attempts: self.shared.attempts.load(Ordering::Relaxed),
                gaps: self.shared.gaps.load(Ordering::Relaxed),
                skipped_ticks: self.shared.skipped_ticks.load(Ordering::Relaxed),
                health,
                health_transitions,
            },
        )
        .ok_or(SamplerError::EmptySeries)
    }
}

impl Default for TelemetrySampler {
    fn default() -> Self {
        Self::new(SamplerPolicy::default())
    }
}

impl fmt::Debug for TelemetrySampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetrySampler")
            .field("samples", &self.shared.samples.lock().len())
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}

impl SamplerShared {
    async fn record(&self, probe: &mut dyn ResourceProbe) {
        let attempts = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let gaps = match probe.probe().await {
            Ok(reading) => {
                self.samples
                    .lock()
                    .push(TelemetrySample::from_reading(Utc::now(), reading));
                self.gaps.load(Ordering::Relaxed)
            }
            Err(err) => {
                debug!(
                    target: "tach::telemetry::sampler",
                    probe = probe.name(),
                    error = %err,
                    "probe failed; recording gap"
                );
                self.gaps.fetch_add(1, Ordering::Relaxed) + 1
            }
        };
        self.health.lock().evaluate(probe.name(), attempts, gaps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Replays scripted outcomes, then repeats the fallback.
    struct ScriptedProbe {
        script: VecDeque<Result<ResourceReading, ()>>,
        fallback: Result<ResourceReading, ()>,
        delay: Duration,
    }

    impl ScriptedProbe {
        fn healthy(cpu: &[f64]) -> Self {
            Self {
                script: cpu.iter().map(|value| Ok(reading(*value))).collect(),
                fallback: Ok(reading(1.0)),
                delay: Duration::ZERO,
            }
        }
    }

    fn reading(cpu: f64) -> ResourceReading {
        ResourceReading {
            cpu_percent: cpu,
            resident_bytes: 64 * 1024 * 1024,
            io_bytes_per_sec: cpu * 10.0,
            open_handles: 12,
        }
    }

    #[async_trait]
    impl ResourceProbe for ScriptedProbe {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn probe(&mut self) -> Result<ResourceReading, ProbeError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.pop_front().unwrap_or(self.fallback);
            next.map_err(|()| ProbeError::Unsupported)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_first_tick_yields_empty_series() {
        let sampler = TelemetrySampler::default();
        sampler
            .start(Box::new(ScriptedProbe::healthy(&[])), Duration::from_secs(1))
            .unwrap();
        sampler.stop().await;
        assert_eq!(sampler.summary().unwrap_err(), SamplerError::EmptySeries);
    }

    #[tokio::test(start_paused = true)]
    async fn summary_orders_min_mean_max() {
        let sampler = TelemetrySampler::default();
        let probe = ScriptedProbe::healthy(&[5.0, 80.0, 12.5, 33.0, 0.0]);
        sampler.start(Box::new(probe), Duration::from_millis(100)).unwrap();
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        sampler.stop().await;
        sampler.stop().await;
        assert!(!sampler.is_running());

        let summary = sampler.summary().unwrap();
        assert_eq!(summary.samples, 10);
        assert_eq!(summary.gaps, 0);
        assert_eq!(summary.health, SamplerHealth::Healthy);
        for metric in [
            summary.cpu_percent,
            summary.resident_bytes,
            summary.io_bytes_per_sec,
            summary.open_handles,
        ] {
            assert!(metric.min <= metric.mean && metric.mean <= metric.max);
        }
        assert_eq!(summary.cpu_percent.max, 80.0);
        assert_eq!(summary.cpu_percent.min, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_gaps_degrade_and_recovery_restores() {
        let sampler = TelemetrySampler::new(SamplerPolicy {
            max_gap_ratio: 0.25,
            min_attempts: 4,
        });
        let probe = ScriptedProbe {
            script: [Ok(reading(1.0)), Err(()), Err(()), Err(())].into_iter().collect(),
            fallback: Ok(reading(2.0)),
            delay: Duration::ZERO,
        };
        sampler.start(Box::new(probe), Duration::from_millis(100)).unwrap();

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(sampler.health(), SamplerHealth::Degraded);

        // 3 gaps need 12 attempts to fall back under a 0.25 ratio
        tokio::time::sleep(Duration::from_millis(800)).await;
        sampler.stop().await;
        let summary = sampler.summary().unwrap();
        assert_eq!(summary.gaps, 3);
        assert_eq!(summary.health, SamplerHealth::Healthy);
        assert_eq!(summary.health_transitions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_skips_ticks() {
        let sampler = TelemetrySampler::default();
        let probe = ScriptedProbe {
            script: VecDeque::new(),
            fallback: Ok(reading(3.0)),
            delay: Duration::from_millis(250),
        };
        sampler.start(Box::new(probe), Duration::from_millis(100)).unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        sampler.stop().await;
        let summary = sampler.summary().unwrap();
        assert!(summary.skipped_ticks > 0);
        assert!(summary.samples < 10);
    }

    #[tokio::test]
    async fn start_rejects_bad_arguments() {
        let sampler = TelemetrySampler::default();
        assert_eq!(
            sampler
                .start(Box::new(ScriptedProbe::healthy(&[])), Duration::ZERO)
                .unwrap_err(),
            SamplerError::ZeroInterval
        );
        sampler
            .start(Box::new(ScriptedProbe::healthy(&[])), Duration::from_secs(60))
            .unwrap();
        assert_eq!(
            sampler
                .start(Box::new(ScriptedProbe::healthy(&[])), Duration::from_secs(60))
                .unwrap_err(),
            SamplerError::AlreadyStarted
        );
        sampler.stop().await;
    }
}
