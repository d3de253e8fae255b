//! ---
//! tach_section: "01-core-functionality"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Accelerated virtual clock mapping real elapsed time onto scenario time."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
//! Virtual time is derived, never stored: `now = epoch + elapsed_real * factor`.
//! Advancing the clock means sleeping for the scaled real span, so every caller
//! sharing a clock observes the same monotonic virtual timeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tach_common::metrics::{DriftHistogram, DriftSummary};
use tach_common::time::{duration_to_micros, real_to_virtual, to_chrono, virtual_to_real};
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::abort::AbortSignal;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClockError {
    #[error("acceleration factor must be finite and at least 1, got {0}")]
    InvalidFactor(f64),
    #[error("clock advance cancelled: {reason}")]
    Cancelled { reason: String },
}

#[derive(Debug)]
pub struct VirtualClock {
    factor: f64,
    epoch: DateTime<Utc>,
    origin: Instant,
    advanced_micros: AtomicU64,
    advances: AtomicU64,
    drift: DriftHistogram,
    abort: AbortSignal,
}

impl VirtualClock {
    pub fn new(factor: f64, epoch: DateTime<Utc>, abort: AbortSignal) -> Result<Self, ClockError> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(ClockError::InvalidFactor(factor));
        }
        Ok(Self {
            factor,
            epoch,
            origin: Instant::now(),
            advanced_micros: AtomicU64::new(0),
            advances: AtomicU64::new(0),
            drift: DriftHistogram::default(),
            abort,
        })
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn elapsed_real(&self) -> Duration {
        self.origin.elapsed()
    }

    pub fn elapsed_virtual(&self) -> Duration {
        real_to_virtual(self.elapsed_real(), self.factor)
    }

    /// Current virtual instant.
    pub fn now(&self) -> DateTime<Utc> {
        self.epoch + to_chrono(self.elapsed_virtual())
    }

    /// Virtual instant at `offset` past the epoch.
    pub fn at_offset(&self, offset: Duration) -> DateTime<Utc> {
        self.epoch + to_chrono(offset)
    }

    pub fn to_real(&self, virtual_span: Duration) -> Duration {
        virtual_to_real(virtual_span, self.factor)
    }

    pub fn to_virtual(&self, real_span: Duration) -> Duration {
        real_to_virtual(real_span, self.factor)
    }

    /// Sleep until `duration` of virtual time has passed and return the new virtual instant.
    ///
    /// Returns [`ClockError::Cancelled`] as soon as the run abort signal fires.
    pub async fn advance(&self, duration: Duration) -> Result<DateTime<Utc>, ClockError> {
        self.ensure_live()?;
        let real = self.to_real(duration);
        if !real.is_zero() {
            let started = Instant::now();
            let deadline = started.checked_add(real).unwrap_or_else(far_future);
            tokio::select! {
                biased;
                _ = self.abort.cancelled() => {
                    debug!(
                        target: "tach::rt::clock",
                        requested_ms = duration.as_millis() as u64,
                        "advance interrupted by abort"
                    );
                    return Err(self.cancelled());
                }
                _ = sleep_until(deadline) => {}
            }
            self.drift.record(started.elapsed(), real);
        }
        self.advanced_micros
            .fetch_add(duration_to_micros(duration), Ordering::Relaxed);
        self.advances.fetch_add(1, Ordering::Relaxed);
        Ok(self.now())
    }

    /// Advance until at least `offset` of virtual time has elapsed since the epoch.
    pub async fn advance_to(&self, offset: Duration) -> Result<DateTime<Utc>, ClockError> {
        self.ensure_live()?;
        let elapsed = self.elapsed_virtual();
        if elapsed >= offset {
            return Ok(self.now());
        }
        self.advance(offset - elapsed).await
    }

    /// Total virtual time requested through [`advance`](Self::advance). Reporting only.
    pub fn advanced_total(&self) -> Duration {
        Duration::from_micros(self.advanced_micros.load(Ordering::Relaxed))
    }

    pub fn drift_summary(&self) -> Option<DriftSummary> {
        self.drift.summary()
    }

    pub fn report(&self) -> ClockReport {
        ClockReport {
            acceleration_factor: self.factor,
            epoch: self.epoch,
            elapsed_virtual: self.elapsed_virtual(),
            elapsed_real: self.elapsed_real(),
            advanced_total: self.advanced_total(),
            advances: self.advances.load(Ordering::Relaxed),
            drift: self.drift_summary(),
        }
    }

    fn ensure_live(&self) -> Result<(), ClockError> {
        if self.abort.is_aborted() {
            return Err(self.cancelled());
        }
        Ok(())
    }

    fn cancelled(&self) -> ClockError {
        ClockError::Cancelled {
            reason: self.abort.reason().unwrap_or_else(|| "aborted".to_string()),
        }
    }
}

fn far_future() -> Instant {
    // roughly 30 years, the same horizon tokio uses internally
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}

/// Snapshot of clock bookkeeping attached to run results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClockReport {
    pub acceleration_factor: f64,
    pub epoch: DateTime<Utc>,
    pub elapsed_virtual: Duration,
    pub elapsed_real: Duration,
    pub advanced_total: Duration,
    pub advances: u64,
    pub drift: Option<DriftSummary>,
}
