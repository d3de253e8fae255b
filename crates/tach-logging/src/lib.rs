//! ---
//! tach_section: "03-persistence-logging"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Structured logging adapters and sinks."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
#![warn(missing_docs)]

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

#[doc(hidden)]
pub use tracing;

/// Initialize a baseline tracing subscriber suitable for development and tests.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer())
        .try_init();
}

/// Structured logging context propagated by the convenience macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Scenario name associated with the log event.
    pub scenario: Option<&'a str>,
    /// Run identifier, unique per scenario execution.
    pub run_id: Option<&'a str>,
    /// Checkpoint label currently executing.
    pub checkpoint: Option<&'a str>,
    /// Pool worker slot running the scenario.
    pub worker: Option<u64>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a scenario name.
    pub fn with_scenario(mut self, scenario: &'a str) -> Self {
        self.scenario = Some(scenario);
        self
    }

    /// Attach a run identifier.
    pub fn with_run_id(mut self, run_id: &'a str) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Attach a checkpoint label.
    pub fn with_checkpoint(mut self, checkpoint: &'a str) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Attach a worker slot.
    pub fn with_worker(mut self, worker: u64) -> Self {
        self.worker = Some(worker);
        self
    }
}

/// High-level outcome used when emitting run lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEventOutcome {
    /// The lifecycle step completed as expected.
    Success,
    /// The lifecycle step failed, timed out, or was aborted.
    Fault,
}

impl RunEventOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RunEventOutcome::Success => "success",
            RunEventOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized run lifecycle event with a success/fault outcome.
pub fn log_run_event(
    context: Option<&LogContext>,
    event: &str,
    message: &str,
    outcome: RunEventOutcome,
) {
    let fallback = LogContext::default();
    let ctx = context.unwrap_or(&fallback);
    match outcome {
        RunEventOutcome::Fault => tracing::warn!(
            event,
            outcome = outcome.as_str(),
            scenario = ctx.scenario.unwrap_or(""),
            run_id = ctx.run_id.unwrap_or(""),
            checkpoint = ctx.checkpoint.unwrap_or(""),
            worker = ctx.worker.unwrap_or_default(),
            message = %message
        ),
        RunEventOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            scenario = ctx.scenario.unwrap_or(""),
            run_id = ctx.run_id.unwrap_or(""),
            checkpoint = ctx.checkpoint.unwrap_or(""),
            worker = ctx.worker.unwrap_or_default(),
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new()
            .with_scenario("recording-soak")
            .with_checkpoint("warmup");
        tach_info!(context = ctx.clone(), "checkpoint reached");
        tach_debug!("debug message");
        tach_warn!(context = ctx.clone(), "soft timeout after {} ms", 250);
        tach_error!(context = ctx, "error code: {}", 42);
    }

    #[test]
    fn run_event_helper_emits() {
        init();
        let ctx = LogContext::new().with_run_id("run-1").with_worker(3);
        log_run_event(
            Some(&ctx),
            "run.completed",
            "run finished",
            RunEventOutcome::Success,
        );
        log_run_event(None, "run.aborted", "run aborted", RunEventOutcome::Fault);
    }
}
