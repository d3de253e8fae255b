//! ---
//! tach_section: "01-core-functionality"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Runtime helpers supporting the scenario runner."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

/// One firing of a [`SampleTicker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub at: Instant,
    /// Ticks dropped since the previous firing because the loop ran late.
    pub skipped: u64,
}

/// Fixed real-time ticker for sampling loops. The first tick fires one period
/// after construction; late ticks are skipped, never queued.
#[derive(Debug)]
pub struct SampleTicker {
    interval: tokio::time::Interval,
    period: Duration,
}

impl SampleTicker {
    /// # Panics
    ///
    /// Panics if `period` is zero.
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval,
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn tick(&mut self) -> Tick {
        let at = self.interval.tick().await;
        // a late firing reports the missed deadline; every period since then was dropped
        let lag = Instant::now().saturating_duration_since(at).as_nanos();
        let skipped = (lag / self.period.as_nanos()) as u64;
        Tick { at, skipped }
    }
}

/// Tracks spawned worker tasks and joins them in submission order.
#[derive(Debug)]
pub struct WorkerGroup<T> {
    tasks: Vec<JoinHandle<T>>,
}

impl<T> Default for WorkerGroup<T> {
    fn default() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl<T: Send + 'static> WorkerGroup<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.tasks.push(handle);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Await every task; a panicked or cancelled task surfaces as its `JoinError`.
    pub async fn join(self) -> Vec<Result<T, JoinError>> {
        let mut results = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            results.push(task.await);
        }
        results
    }
}
