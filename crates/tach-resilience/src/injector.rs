//! ---
//! tach_section: "07-resilience-fault-tolerance"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Network fault profiles, injection, and retry policies."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
//! Interception of collaborator calls under the active fault profile.
//!
//! The profile is swapped as a whole `Arc` snapshot: an operation samples the
//! snapshot once when issued and keeps it for its whole lifetime, so a
//! concurrent `set_profile` never yields a half-updated profile.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Bernoulli, Distribution, Uniform};
use serde::{Deserialize, Serialize};
use tach_rt::{AbortSignal, ClockError, VirtualClock};
use thiserror::Error;
use tracing::{debug, info};

use crate::metrics::FaultMetrics;
use crate::profile::{DelayMode, FaultProfile};

/// Whether an operation is subject to impairment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    /// Harness control traffic (health, catalog, dataset, signals); never impaired.
    Control,
    /// Application traffic governed by the active profile.
    Data,
}

/// Outcome of an intercepted operation that did not reach the collaborator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FaultError {
    /// The active profile has the link down.
    #[error("link '{link}' is disconnected under profile '{profile}'")]
    Connectivity {
        /// Link name.
        link: String,
        /// Profile in effect when the operation was issued.
        profile: String,
    },
    /// The operation was dropped; the caller gave up after the loss timeout.
    #[error("operation on link '{link}' was dropped and timed out after {timeout:?}")]
    Timeout {
        /// Link name.
        link: String,
        /// Loss timeout in the profile's time base.
        timeout: Duration,
    },
    /// The injector itself malfunctioned. Fatal to the run.
    #[error("fault injector malfunction: {0}")]
    Injection(String),
    /// The run was aborted while the operation was delayed.
    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl FaultError {
    /// Network-shaped failures a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FaultError::Connectivity { .. } | FaultError::Timeout { .. })
    }

    /// Failures that must end the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FaultError::Injection(_))
    }
}

/// Counters reported in the scenario result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultStats {
    /// Data-plane operations seen while engaged.
    pub intercepted: u64,
    /// Data-plane operations forwarded to the collaborator.
    pub passed: u64,
    /// Operations dropped under the loss rate.
    pub dropped: u64,
    /// Operations refused while disconnected.
    pub refused: u64,
    /// Control-plane or post-disengage operations forwarded untouched.
    pub bypassed: u64,
    /// Number of profile replacements.
    pub profile_switches: u64,
    /// Sum of injected delays in milliseconds, in each profile's time base.
    pub injected_delay_ms: u64,
    /// Profile active when the stats were taken.
    pub active_profile: String,
}

#[derive(Debug, Default)]
struct Counters {
    intercepted: AtomicU64,
    passed: AtomicU64,
    dropped: AtomicU64,
    refused: AtomicU64,
    bypassed: AtomicU64,
    profile_switches: AtomicU64,
    injected_delay_ms: AtomicU64,
}

enum Verdict {
    Refuse,
    Drop,
    Delay(Duration),
}

/// Applies the active [`FaultProfile`] to operations issued against one link.
pub struct FaultInjector {
    link: String,
    active: RwLock<Arc<FaultProfile>>,
    engaged: AtomicBool,
    rng: Mutex<StdRng>,
    loss_timeout: Duration,
    clock: Option<Arc<VirtualClock>>,
    abort: AbortSignal,
    counters: Counters,
    metrics: Option<FaultMetrics>,
}

impl FaultInjector {
    /// Create an engaged injector running the baseline profile.
    pub fn new(link: impl Into<String>, seed: u64, loss_timeout: Duration) -> Self {
        Self {
            link: link.into(),
            active: RwLock::new(Arc::new(FaultProfile::baseline())),
            engaged: AtomicBool::new(true),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            loss_timeout,
            clock: None,
            abort: AbortSignal::never(),
            counters: Counters::default(),
            metrics: None,
        }
    }

    /// Attach the run clock used for virtual-time delays; its abort signal is adopted too.
    pub fn with_clock(mut self, clock: Arc<VirtualClock>) -> Self {
        self.abort = clock.abort_signal().clone();
        self.clock = Some(clock);
        self
    }

    /// Interrupt real-time delays when `abort` fires.
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Publish counters to Prometheus.
    pub fn with_metrics(mut self, metrics: FaultMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Link name used in logs and metrics.
    pub fn link(&self) -> &str {
        &self.link
    }

    /// Atomically replace the active profile. In-flight operations keep their snapshot.
    pub fn set_profile(&self, profile: impl Into<Arc<FaultProfile>>) {
        let profile = profile.into();
        let previous = std::mem::replace(&mut *self.active.write(), profile.clone());
        self.counters.profile_switches.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_switch(&self.link, &profile.name);
        }
        info!(
            target: "tach::resilience::injector",
            link = %self.link,
            from = %previous.name,
            to = %profile.name,
            latency_ms = profile.latency_ms,
            jitter_ms = profile.jitter_ms,
            loss_rate = profile.loss_rate,
            disconnected = profile.disconnected,
            delay_mode = %profile.delay_mode,
            "fault profile switched",
        );
    }

    /// Restore the baseline profile.
    pub fn clear(&self) {
        self.set_profile(FaultProfile::baseline());
    }

    /// Snapshot of the active profile.
    pub fn active_profile(&self) -> Arc<FaultProfile> {
        self.active.read().clone()
    }

    /// Stop injecting. Every later operation passes through. Returns whether this call disengaged.
    pub fn disengage(&self) -> bool {
        let was_engaged = self.engaged.swap(false, Ordering::SeqCst);
        if was_engaged {
            debug!(target: "tach::resilience::injector", link = %self.link, "fault injection disengaged");
        }
        was_engaged
    }

    /// Whether injection is active.
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    /// Run `operation` under the profile active at issue time.
    pub async fn intercept<F, T>(&self, class: OperationClass, operation: F) -> Result<T, FaultError>
    where
        F: Future<Output = T>,
    {
        if class == OperationClass::Control || !self.is_engaged() {
            self.count(&self.counters.bypassed, "bypassed");
            return Ok(operation.await);
        }

        let profile = self.active_profile();
        self.counters.intercepted.fetch_add(1, Ordering::Relaxed);
        if profile.is_zero_impairment() {
            self.count(&self.counters.passed, "passed");
            return Ok(operation.await);
        }

        match self.judge(&profile)? {
            Verdict::Refuse => {
                self.count(&self.counters.refused, "refused");
                Err(FaultError::Connectivity {
                    link: self.link.clone(),
                    profile: profile.name.clone(),
                })
            }
            Verdict::Drop => {
                self.count(&self.counters.dropped, "dropped");
                self.pause(self.loss_timeout, profile.delay_mode).await?;
                Err(FaultError::Timeout {
                    link: self.link.clone(),
                    timeout: self.loss_timeout,
                })
            }
            Verdict::Delay(delay) => {
                if !delay.is_zero() {
                    self.counters
                        .injected_delay_ms
                        .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_delay(&self.link, delay);
                    }
                    self.pause(delay, profile.delay_mode).await?;
                }
                self.count(&self.counters.passed, "passed");
                Ok(operation.await)
            }
        }
    }

    /// Counters plus the active profile name.
    pub fn stats(&self) -> FaultStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        FaultStats {
            intercepted: load(&self.counters.intercepted),
            passed: load(&self.counters.passed),
            dropped: load(&self.counters.dropped),
            refused: load(&self.counters.refused),
            bypassed: load(&self.counters.bypassed),
            profile_switches: load(&self.counters.profile_switches),
            injected_delay_ms: load(&self.counters.injected_delay_ms),
            active_profile: self.active_profile().name.clone(),
        }
    }

    fn judge(&self, profile: &FaultProfile) -> Result<Verdict, FaultError> {
        if profile.disconnected {
            return Ok(Verdict::Refuse);
        }
        let mut rng = self.rng.lock();
        if profile.loss_rate > 0.0 {
            let loss = Bernoulli::new(profile.loss_rate).map_err(|err| {
                FaultError::Injection(format!(
                    "profile '{}' loss rate {}: {err}",
                    profile.name, profile.loss_rate
                ))
            })?;
            if loss.sample(&mut *rng) {
                return Ok(Verdict::Drop);
            }
        }
        if profile.jitter_ms == 0 {
            return Ok(Verdict::Delay(profile.latency()));
        }
        let latency = profile.latency_ms as i64;
        let jitter = profile.jitter_ms as i64;
        let sampled = Uniform::new_inclusive(latency - jitter, latency + jitter).sample(&mut *rng);
        Ok(Verdict::Delay(Duration::from_millis(sampled.max(0) as u64)))
    }

    async fn pause(&self, span: Duration, mode: DelayMode) -> Result<(), FaultError> {
        if span.is_zero() {
            return Ok(());
        }
        match mode {
            DelayMode::VirtualTime => {
                let clock = self.clock.as_ref().ok_or_else(|| {
                    FaultError::Injection(format!(
                        "link '{}' needs a virtual clock for virtual-time delays",
                        self.link
                    ))
                })?;
                clock.advance(span).await.map(|_| ()).map_err(|err| match err {
                    ClockError::Cancelled { reason } => FaultError::Cancelled(reason),
                    other => FaultError::Injection(other.to_string()),
                })
            }
            DelayMode::RealTime => {
                tokio::select! {
                    biased;
                    _ = self.abort.cancelled() => Err(FaultError::Cancelled(
                        self.abort.reason().unwrap_or_else(|| "aborted".to_string()),
                    )),
                    _ = tokio::time::sleep(span) => Ok(()),
                }
            }
        }
    }

    fn count(&self, counter: &AtomicU64, outcome: &str) {
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_operation(&self.link, outcome);
        }
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("link", &self.link)
            .field("active", &self.active_profile().name)
            .field("engaged", &self.is_engaged())
            .finish_non_exhaustive()
    }
}
