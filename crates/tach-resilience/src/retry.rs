//! ---
//! tach_section: "07-resilience-fault-tolerance"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Network fault profiles, injection, and retry policies."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::injector::FaultError;

/// Exponential backoff with jitter for upstream calls that cross the fault layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the second attempt; doubles for every further attempt.
    pub base_delay: Duration,
    /// Maximum jitter added to each delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Build a policy; at least one attempt is always made.
    pub fn new(max_attempts: usize, base_delay: Duration, jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter,
        }
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn backoff_delay(&self, attempt: usize, rng: &mut StdRng) -> Duration {
        let exponent = (attempt.saturating_sub(1) as u32).min(8);
        let base = self.base_delay.mul_f64(2u32.pow(exponent) as f64);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. `pause` waits out each backoff, typically on the run clock.
    pub async fn run<T, F, Fut, P, PFut>(
        &self,
        label: &str,
        seed: u64,
        mut operation: F,
        mut pause: P,
    ) -> Result<T, FaultError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, FaultError>>,
        P: FnMut(Duration) -> PFut,
        PFut: Future<Output = Result<(), FaultError>>,
    {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(target: "tach::resilience::retry", label, attempt, "call recovered after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() || attempt >= self.max_attempts => {
                    warn!(
                        target: "tach::resilience::retry",
                        label,
                        attempt,
                        error = %err,
                        "giving up on call",
                    );
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.backoff_delay(attempt, &mut rng);
                    debug!(
                        target: "tach::resilience::retry",
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "call failed; backing off",
                    );
                    pause(delay).await?;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(250), Duration::from_millis(50))
    }
}
