//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Scenario state machine composing clock, sampler, injector, and collaborator."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
//! Drives one scenario through `Idle → Preparing → Running → terminal`.
//!
//! Configuration and dataset problems are returned as [`RunError`] before any
//! resource is acquired. Once the sampler is running, every exit path stops
//! it, disengages the injector, and yields a [`ScenarioResult`] carrying the
//! outcomes recorded so far.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tach_common::{ConfigError, RunConfig, TelemetryConfig};
use tach_logging::{
    log_run_event, tach_debug, tach_error, tach_info, tach_warn, LogContext, RunEventOutcome,
};
use tach_metrics::HarnessMetrics;
use tach_resilience::{
    FaultError, FaultInjector, FaultMetrics, FaultProfile, FaultProfileCatalog, ProfileError,
};
use tach_rt::{AbortSignal, ClockError, VirtualClock};
use tach_sim::{Dataset, DatasetGenerator, GenerationError};
use tach_telemetry::{ProcfsProbe, ResourceProbe, SamplerHealth, SamplerPolicy, TelemetrySampler};
use thiserror::Error;
use tokio::time::{sleep_until, timeout, Instant};
use uuid::Uuid;

use crate::collaborator::{
    Collaborator, CollaboratorBackend, CollaboratorError, JobId, JobStatus, RecordingRequest,
    RunEnvironment,
};
use crate::result::{AssertionOutcome, DatasetInfo, RunStatus, ScenarioResult};
use crate::scenario::{Checkpoint, Scenario, ScenarioError, Step};

/// Builds the resource probe for a run's sampler.
pub type ProbeFactory = Arc<dyn Fn(&TelemetryConfig) -> Box<dyn ResourceProbe> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Preparing,
    Running,
    Finished(RunStatus),
}

/// Failures that prevent a run from reaching `Running`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("dataset generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("runner is busy with another scenario")]
    Busy,
    #[error("scenario worker failed: {0}")]
    Worker(String),
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        RunError::Configuration(err.to_string())
    }
}

impl From<ScenarioError> for RunError {
    fn from(err: ScenarioError) -> Self {
        RunError::Configuration(err.to_string())
    }
}

impl From<ProfileError> for RunError {
    fn from(err: ProfileError) -> Self {
        RunError::Configuration(err.to_string())
    }
}

impl From<ClockError> for RunError {
    fn from(err: ClockError) -> Self {
        RunError::Configuration(err.to_string())
    }
}

struct Verdict {
    passed: bool,
    message: String,
}

impl Verdict {
    fn new(passed: bool, message: impl Into<String>) -> Self {
        Self {
            passed,
            message: message.into(),
        }
    }

    fn pass(message: impl Into<String>) -> Self {
        Self::new(true, message)
    }

    fn fail(message: impl Into<String>) -> Self {
        Self::new(false, message)
    }
}

/// Conditions that stop the checkpoint loop from inside a step.
enum Interrupt {
    Aborted(String),
    Fatal(String),
}

enum Flow {
    Continue,
    Aborted,
    Fatal(String),
}

fn interrupt(err: &CollaboratorError) -> Option<Interrupt> {
    match err.fault() {
        Some(FaultError::Cancelled(reason)) => Some(Interrupt::Aborted(reason.clone())),
        Some(fault) if fault.is_fatal() => Some(Interrupt::Fatal(format!("fault injection failed: {fault}"))),
        _ => None,
    }
}

fn collaborator_failure(err: CollaboratorError) -> Result<Verdict, Interrupt> {
    match interrupt(&err) {
        Some(stop) => Err(stop),
        None => Ok(Verdict::fail(err.to_string())),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct Prepared {
    dataset: Arc<Dataset>,
    fingerprint: String,
    initial_profile: Option<FaultProfile>,
}

#[derive(Default)]
struct Ledger {
    outcomes: Vec<AssertionOutcome>,
    jobs: Vec<JobId>,
    /// Position in `RunContext::upcoming` of the next program eligible for ad-hoc recording.
    cursor: usize,
    error: Option<String>,
}

/// Per-run state shared by the checkpoint loop and its steps.
struct RunContext<'a> {
    scenario: &'a Scenario,
    run_id: String,
    worker: Option<u64>,
    clock: Arc<VirtualClock>,
    injector: Arc<FaultInjector>,
    dataset: Arc<Dataset>,
    fingerprint: &'a str,
    collaborator: Arc<dyn Collaborator>,
    upcoming: Vec<usize>,
    ledger: Mutex<Ledger>,
}

impl RunContext<'_> {
    fn log_context<'c>(&'c self, checkpoint: Option<&'c str>) -> LogContext<'c> {
        let mut ctx = LogContext::new()
            .with_scenario(&self.scenario.name)
            .with_run_id(&self.run_id);
        if let Some(label) = checkpoint {
            ctx = ctx.with_checkpoint(label);
        }
        if let Some(worker) = self.worker {
            ctx = ctx.with_worker(worker);
        }
        ctx
    }

    fn record(&self, checkpoint: &Checkpoint, assertion: &str, verdict: Verdict) {
        let ctx = self.log_context(Some(&checkpoint.label));
        if verdict.passed {
            tach_info!(context = ctx, "{assertion} passed: {}", verdict.message);
        } else {
            tach_warn!(context = ctx, "{assertion} failed: {}", verdict.message);
        }
        let outcome = AssertionOutcome {
            checkpoint: checkpoint.label.clone(),
            assertion: assertion.to_string(),
            passed: verdict.passed,
            message: verdict.message,
            virtual_at: self.clock.now(),
        };
        self.ledger.lock().outcomes.push(outcome);
    }

    fn has_failures(&self) -> bool {
        self.ledger.lock().outcomes.iter().any(|outcome| !outcome.passed)
    }

    fn tracked_jobs(&self) -> Vec<JobId> {
        self.ledger.lock().jobs.clone()
    }

    /// Next `count` programs starting at or after the current virtual instant.
    fn claim_upcoming(&self, count: usize) -> Vec<RecordingRequest> {
        let now = self.clock.elapsed_virtual();
        let mut ledger = self.ledger.lock();
        let mut cursor = ledger.cursor;
        while cursor < self.upcoming.len()
            && self.dataset.programs[self.upcoming[cursor]].start_offset < now
        {
            cursor += 1;
        }
        let end = (cursor + count).min(self.upcoming.len());
        let requests = self.upcoming[cursor..end]
            .iter()
            .map(|&idx| RecordingRequest::for_program(&self.dataset.programs[idx], self.dataset.epoch, None))
            .collect();
        ledger.cursor = end;
        requests
    }
}

/// Runs scenarios under one [`RunConfig`].
pub struct ScenarioRunner {
    config: RunConfig,
    catalog: Arc<FaultProfileCatalog>,
    backend: CollaboratorBackend,
    abort: AbortSignal,
    metrics: Option<HarnessMetrics>,
    fault_metrics: Option<FaultMetrics>,
    probe_factory: ProbeFactory,
    worker: Option<u64>,
    state: Mutex<RunnerState>,
}

impl ScenarioRunner {
    pub fn new(config: RunConfig) -> Self {
        let backend = CollaboratorBackend::from_config(&config.backend);
        Self {
            config,
            catalog: Arc::new(FaultProfileCatalog::builtin()),
            backend,
            abort: AbortSignal::never(),
            metrics: None,
            fault_metrics: None,
            probe_factory: Arc::new(|telemetry: &TelemetryConfig| {
                Box::new(ProcfsProbe::from_config(telemetry)) as Box<dyn ResourceProbe>
            }),
            worker: None,
            state: Mutex::new(RunnerState::Idle),
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<FaultProfileCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_backend(mut self, backend: CollaboratorBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Abort signal observed at checkpoint boundaries and by in-flight clock advances.
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_metrics(mut self, metrics: HarnessMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_fault_metrics(mut self, metrics: FaultMetrics) -> Self {
        self.fault_metrics = Some(metrics);
        self
    }

    pub fn with_probe_factory(mut self, factory: ProbeFactory) -> Self {
        self.probe_factory = factory;
        self
    }

    pub fn with_worker(mut self, worker: u64) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock()
    }

    fn set_state(&self, state: RunnerState) {
        *self.state.lock() = state;
    }

    fn begin(&self) -> Result<(), RunError> {
        let mut state = self.state.lock();
        if matches!(*state, RunnerState::Preparing | RunnerState::Running) {
            return Err(RunError::Busy);
        }
        *state = RunnerState::Preparing;
        Ok(())
    }

    /// Execute `scenario` to a terminal status.
    pub async fn run(&self, scenario: &Scenario) -> Result<ScenarioResult, RunError> {
        self.begin()?;
        let prepared = match self.prepare(scenario) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.set_state(RunnerState::Idle);
                log_run_event(None, "run.rejected", &format!("{}: {err}", scenario.name), RunEventOutcome::Fault);
                return Err(err);
            }
        };
        match VirtualClock::new(
            self.config.acceleration_factor,
            self.config.virtual_epoch,
            self.abort.clone(),
        ) {
            Ok(clock) => Ok(self.execute(scenario, prepared, Arc::new(clock)).await),
            Err(err) => {
                self.set_state(RunnerState::Idle);
                Err(err.into())
            }
        }
    }

    /// Validation and dataset generation; nothing is started here.
    fn prepare(&self, scenario: &Scenario) -> Result<Prepared, RunError> {
        self.config.validate()?;
        scenario.validate()?;
        let initial_profile = self
            .config
            .fault_profile
            .as_deref()
            .map(|name| self.catalog.resolve(name))
            .transpose()?;
        for name in scenario.fault_profiles() {
            self.catalog.resolve(name)?;
        }

        let scale = &self.config.dataset;
        let dataset = DatasetGenerator::from_scale(scale, self.config.virtual_epoch).generate(
            scale.stations,
            scale.program_days,
            scale.schedules,
        )?;
        let fingerprint = dataset
            .fingerprint()
            .map_err(|err| RunError::Configuration(format!("dataset cannot be encoded: {err}")))?;
        Ok(Prepared {
            dataset: Arc::new(dataset),
            fingerprint,
            initial_profile,
        })
    }

    async fn execute(&self, scenario: &Scenario, prepared: Prepared, clock: Arc<VirtualClock>) -> ScenarioResult {
        let run_id = Uuid::new_v4();
        let run_label = run_id.to_string();
        let mut log_ctx = LogContext::new()
            .with_scenario(&scenario.name)
            .with_run_id(&run_label);
        if let Some(worker) = self.worker {
            log_ctx = log_ctx.with_worker(worker);
        }

        let mut injector = FaultInjector::new(
            format!("{}/upstream", scenario.name),
            self.config.fault_seed,
            self.config.loss_timeout,
        )
        .with_clock(clock.clone());
        if let Some(metrics) = &self.fault_metrics {
            injector = injector.with_metrics(metrics.clone());
        }
        let injector = Arc::new(injector);

        let sampler = TelemetrySampler::new(SamplerPolicy::from(&self.config.telemetry));
        let mut setup_error = sampler
            .start((self.probe_factory)(&self.config.telemetry), self.config.telemetry.interval)
            .err()
            .map(|err| format!("telemetry sampler failed to start: {err}"));
        if let Some(metrics) = &self.metrics {
            metrics.run_started();
        }
        log_run_event(
            Some(&log_ctx),
            "run.preparing",
            &format!(
                "dataset {} stations / {} programs / {} schedules at factor {}",
                prepared.dataset.stations.len(),
                prepared.dataset.programs.len(),
                prepared.dataset.schedules.len(),
                clock.factor()
            ),
            RunEventOutcome::Success,
        );

        let env = RunEnvironment {
            clock: clock.clone(),
            injector: injector.clone(),
            dataset: prepared.dataset.clone(),
            seed: self.config.fault_seed,
        };
        let collaborator = if setup_error.is_some() {
            None
        } else {
            match self.attach(&env, prepared.initial_profile.clone()).await {
                Ok(collaborator) => Some(collaborator),
                Err(message) => {
                    setup_error = Some(message);
                    None
                }
            }
        };

        let running_since = Instant::now();
        let started_virtual = clock.now();
        let (status, ledger) = match collaborator {
            None => {
                let ledger = Ledger {
                    error: setup_error,
                    ..Ledger::default()
                };
                (RunStatus::Failed, ledger)
            }
            Some(collaborator) => {
                self.set_state(RunnerState::Running);
                log_run_event(Some(&log_ctx), "run.running", "entering checkpoint loop", RunEventOutcome::Success);
                let run = RunContext {
                    scenario,
                    run_id: run_label.clone(),
                    worker: self.worker,
                    clock: clock.clone(),
                    injector: injector.clone(),
                    dataset: prepared.dataset.clone(),
                    fingerprint: &prepared.fingerprint,
                    collaborator,
                    upcoming: upcoming_order(&prepared.dataset),
                    ledger: Mutex::new(Ledger::default()),
                };
                let deadline = running_since + self.config.hard_timeout;
                let status = tokio::select! {
                    biased;
                    outcome = AssertUnwindSafe(self.drive(&run)).catch_unwind() => match outcome {
                        Ok(status) => status,
                        Err(panic) => {
                            let message = format!("checkpoint loop panicked: {}", panic_message(panic.as_ref()));
                            tach_error!(context = log_ctx.clone(), "{message}");
                            run.ledger.lock().error = Some(message);
                            RunStatus::Failed
                        }
                    },
                    _ = sleep_until(deadline) => {
                        tach_warn!(
                            context = log_ctx.clone(),
                            "hard timeout of {:?} exceeded; run superseded",
                            self.config.hard_timeout
                        );
                        RunStatus::TimedOut
                    }
                };
                (status, run.ledger.into_inner())
            }
        };

        // teardown runs on every terminal path
        injector.disengage();
        sampler.stop().await;
        let (telemetry, telemetry_error) = match sampler.summary() {
            Ok(summary) => {
                if summary.health == SamplerHealth::Degraded {
                    tach_warn!(
                        context = log_ctx.clone(),
                        "telemetry degraded: {} gaps in {} attempts",
                        summary.gaps,
                        summary.attempts
                    );
                }
                (Some(summary), None)
            }
            Err(err) => (None, Some(err.to_string())),
        };

        let real_elapsed = running_since.elapsed();
        let result = ScenarioResult {
            run_id,
            scenario: scenario.name.clone(),
            category: scenario.category,
            status,
            started_virtual,
            ended_virtual: clock.now(),
            real_elapsed,
            acceleration_factor: clock.factor(),
            outcomes: ledger.outcomes,
            telemetry,
            telemetry_error,
            fault_stats: injector.stats(),
            clock_drift: clock.drift_summary(),
            dataset: DatasetInfo {
                seed: prepared.dataset.seed,
                counts: prepared.dataset.counts(),
                fingerprint: prepared.fingerprint.clone(),
            },
            error: ledger.error,
        };

        if let Some(metrics) = &self.metrics {
            for outcome in &result.outcomes {
                metrics.record_assertion(&result.scenario, outcome.passed);
            }
            metrics.run_finished(&result.scenario, &status.to_string(), real_elapsed);
        }
        let event_outcome = if result.is_success() {
            RunEventOutcome::Success
        } else {
            RunEventOutcome::Fault
        };
        log_run_event(Some(&log_ctx), "run.finished", &result.summary_line(), event_outcome);
        self.set_state(RunnerState::Finished(status));
        result
    }

    /// Build the collaborator, hand it the dataset, and apply the initial fault profile.
    async fn attach(
        &self,
        env: &RunEnvironment,
        initial_profile: Option<FaultProfile>,
    ) -> Result<Arc<dyn Collaborator>, String> {
        let collaborator = self
            .backend
            .attach(env)
            .map_err(|err| format!("failed to attach {} collaborator: {err}", self.backend.label()))?;
        collaborator
            .load_dataset(env.dataset.clone())
            .await
            .map_err(|err| format!("{} rejected the dataset: {err}", collaborator.name()))?;
        if let Some(profile) = initial_profile {
            collaborator.apply_fault_profile(&profile).await.map_err(|err| {
                format!("{} refused fault profile '{}': {err}", collaborator.name(), profile.name)
            })?;
            env.injector.set_profile(profile);
        }
        Ok(collaborator)
    }

    async fn drive(&self, run: &RunContext<'_>) -> RunStatus {
        for checkpoint in &run.scenario.checkpoints {
            if let Some(reason) = self.abort.reason() {
                tach_warn!(context = run.log_context(Some(&checkpoint.label)), "aborted before checkpoint: {reason}");
                return RunStatus::Aborted;
            }
            match run.clock.advance_to(checkpoint.offset).await {
                Ok(_) => {}
                Err(ClockError::Cancelled { reason }) => {
                    tach_warn!(context = run.log_context(Some(&checkpoint.label)), "aborted while advancing: {reason}");
                    return RunStatus::Aborted;
                }
                Err(err) => {
                    run.ledger.lock().error = Some(err.to_string());
                    return RunStatus::Failed;
                }
            }
            if self.abort.is_aborted() {
                return RunStatus::Aborted;
            }
            tach_debug!(
                context = run.log_context(Some(&checkpoint.label)),
                "checkpoint reached with {} steps",
                checkpoint.steps.len()
            );

            let soft_timeout = checkpoint.soft_timeout.or(self.config.checkpoint_soft_timeout);
            let flow = match soft_timeout {
                Some(limit) => match timeout(limit, self.run_checkpoint(run, checkpoint)).await {
                    Ok(flow) => flow,
                    Err(_) => {
                        run.record(
                            checkpoint,
                            "soft_timeout",
                            Verdict::fail(format!("steps exceeded the {limit:?} soft timeout")),
                        );
                        Flow::Continue
                    }
                },
                None => self.run_checkpoint(run, checkpoint).await,
            };
            match flow {
                Flow::Continue => {}
                Flow::Aborted => return RunStatus::Aborted,
                Flow::Fatal(message) => {
                    run.ledger.lock().error = Some(message);
                    return RunStatus::Failed;
                }
            }
            if run.scenario.fail_fast && run.has_failures() {
                tach_warn!(context = run.log_context(Some(&checkpoint.label)), "fail-fast: stopping after failed assertion");
                return RunStatus::Failed;
            }
        }
        if run.has_failures() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        }
    }

    async fn run_checkpoint(&self, run: &RunContext<'_>, checkpoint: &Checkpoint) -> Flow {
        for step in &checkpoint.steps {
            let label = step.label();
            match AssertUnwindSafe(self.step(run, step)).catch_unwind().await {
                Ok(Ok(verdict)) => run.record(checkpoint, &label, verdict),
                Ok(Err(Interrupt::Aborted(reason))) => {
                    tach_warn!(context = run.log_context(Some(&checkpoint.label)), "{label} interrupted by abort: {reason}");
                    return Flow::Aborted;
                }
                Ok(Err(Interrupt::Fatal(message))) => {
                    tach_error!(context = run.log_context(Some(&checkpoint.label)), "{label} ended the run: {message}");
                    run.record(checkpoint, &label, Verdict::fail(message.clone()));
                    return Flow::Fatal(message);
                }
                Err(panic) => run.record(
                    checkpoint,
                    &label,
                    Verdict::fail(format!("step panicked: {}", panic_message(panic.as_ref()))),
                ),
            }
            if run.scenario.fail_fast && run.has_failures() {
                break;
            }
        }
        Flow::Continue
    }

    async fn step(&self, run: &RunContext<'_>, step: &Step) -> Result<Verdict, Interrupt> {
        let collaborator = &run.collaborator;
        match step {
            Step::SetFaultProfile { profile } => {
                let resolved = self
                    .catalog
                    .resolve(profile)
                    .map_err(|err| Interrupt::Fatal(err.to_string()))?;
                run.injector.set_profile(resolved.clone());
                match collaborator.apply_fault_profile(&resolved).await {
                    Ok(()) => Ok(Verdict::pass(format!("profile '{profile}' active"))),
                    Err(err) => collaborator_failure(err),
                }
            }
            Step::ClearFaults => {
                run.injector.clear();
                match collaborator.apply_fault_profile(&FaultProfile::baseline()).await {
                    Ok(()) => Ok(Verdict::pass("baseline profile restored")),
                    Err(err) => collaborator_failure(err),
                }
            }
            Step::StartRecordings { count } => {
                let requests = run.claim_upcoming(*count);
                let claimed = requests.len();
                let mut failures = Vec::new();
                for request in requests {
                    match collaborator.start_recording(request).await {
                        Ok(job) => {
                            run.ledger.lock().jobs.push(job);
                        }
                        Err(err) => match interrupt(&err) {
                            Some(stop) => return Err(stop),
                            None => failures.push(err.to_string()),
                        },
                    }
                }
                let message = format!(
                    "{} of {claimed} recordings accepted ({count} requested)",
                    claimed - failures.len()
                );
                Ok(match failures.first() {
                    None => Verdict::pass(message),
                    Some(first) => Verdict::fail(format!("{message}; first error: {first}")),
                })
            }
            Step::StopRecordings => {
                let jobs = run.tracked_jobs();
                let mut cancelled = 0;
                let mut failures = 0;
                for job in &jobs {
                    match collaborator.stop_recording(job).await {
                        Ok(report) if report.status == JobStatus::Cancelled => cancelled += 1,
                        Ok(_) => {}
                        Err(err) => match interrupt(&err) {
                            Some(stop) => return Err(stop),
                            None => failures += 1,
                        },
                    }
                }
                Ok(Verdict::new(
                    failures == 0,
                    format!("{cancelled} of {} jobs cancelled, {failures} stop requests failed", jobs.len()),
                ))
            }
            Step::TriggerScheduler => match collaborator.trigger_scheduled(run.clock.now()).await {
                Ok(report) => {
                    let message = format!(
                        "{} due, {} started, {} failed, {} missed",
                        report.due,
                        report.started.len(),
                        report.failed,
                        report.missed
                    );
                    run.ledger.lock().jobs.extend(report.started);
                    Ok(Verdict::new(report.failed == 0, message))
                }
                Err(err) => collaborator_failure(err),
            },
            Step::Signal { signal } => match collaborator.signal(*signal).await {
                Ok(()) => Ok(Verdict::pass(format!("signal {signal} delivered"))),
                Err(err) => collaborator_failure(err),
            },
            Step::ExpectHealthy { healthy } => match collaborator.health_check().await {
                Ok(report) => Ok(Verdict::new(
                    report.healthy == *healthy,
                    format!("reported healthy={} with {} active jobs", report.healthy, report.active_jobs),
                )),
                Err(err) => match interrupt(&err) {
                    Some(stop) => Err(stop),
                    None if !*healthy => Ok(Verdict::pass(format!("unreachable as expected: {err}"))),
                    None => Ok(Verdict::fail(err.to_string())),
                },
            },
            Step::ExpectCatalogMatches => match collaborator.list_catalog().await {
                Ok(catalog) => {
                    let expected = run.dataset.counts();
                    let counts_match = catalog.stations == expected.stations
                        && catalog.programs == expected.programs
                        && catalog.schedules == expected.schedules;
                    let fingerprint_matches = catalog
                        .fingerprint
                        .as_deref()
                        .map_or(true, |fingerprint| fingerprint == run.fingerprint);
                    Ok(Verdict::new(
                        counts_match && fingerprint_matches,
                        format!(
                            "catalog {}/{}/{} vs dataset {}/{}/{}, fingerprint {}",
                            catalog.stations,
                            catalog.programs,
                            catalog.schedules,
                            expected.stations,
                            expected.programs,
                            expected.schedules,
                            if fingerprint_matches { "matches" } else { "differs" }
                        ),
                    ))
                }
                Err(err) => collaborator_failure(err),
            },
            Step::ExpectJobs { status, min_ratio } => {
                let jobs = run.tracked_jobs();
                if jobs.is_empty() {
                    return Ok(Verdict::new(*min_ratio <= 0.0, "no jobs have been started"));
                }
                let mut matching = 0usize;
                let mut lookup_failures = 0usize;
                for job in &jobs {
                    match collaborator.job_status(job).await {
                        Ok(report) if report.status == *status => matching += 1,
                        Ok(_) => {}
                        Err(err) => match interrupt(&err) {
                            Some(stop) => return Err(stop),
                            None => lookup_failures += 1,
                        },
                    }
                }
                let ratio = matching as f64 / jobs.len() as f64;
                Ok(Verdict::new(
                    ratio >= *min_ratio,
                    format!(
                        "{matching}/{} jobs {status} (ratio {ratio:.3}, required {min_ratio}), {lookup_failures} lookups failed",
                        jobs.len()
                    ),
                ))
            }
        }
    }
}

impl std::fmt::Debug for ScenarioRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioRunner")
            .field("acceleration_factor", &self.config.acceleration_factor)
            .field("backend", &self.backend)
            .field("worker", &self.worker)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Program indices ordered by virtual start time.
fn upcoming_order(dataset: &Dataset) -> Vec<usize> {
    let mut order: Vec<usize> = (0..dataset.programs.len()).collect();
    order.sort_by_key(|&idx| (dataset.programs[idx].start_offset, dataset.programs[idx].id));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{
        CatalogSnapshot, CollaboratorSignal, HealthReport, JobReport, TriggerReport,
    };
    use crate::scenario::ScenarioCategory;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::time::Duration;
    use tach_rt::AbortHandle;
    use tach_telemetry::{ProbeError, ResourceReading};

    const HOUR: Duration = Duration::from_secs(3_600);

    struct SteadyProbe;

    #[async_trait]
    impl ResourceProbe for SteadyProbe {
        fn name(&self) -> &str {
            "steady"
        }

        async fn probe(&mut self) -> Result<ResourceReading, ProbeError> {
            Ok(ResourceReading {
                cpu_percent: 12.5,
                resident_bytes: 64 << 20,
                io_bytes_per_sec: 1_024.0,
                open_handles: 32,
            })
        }
    }

    fn config() -> RunConfig {
        let mut config = RunConfig::default();
        config.acceleration_factor = 600.0;
        config.hard_timeout = Duration::from_secs(3_600);
        config.dataset.stations = 4;
        config.dataset.program_days = 2;
        config.dataset.schedules = 40;
        config.telemetry.interval = Duration::from_secs(1);
        config
    }

    fn runner(config: RunConfig) -> ScenarioRunner {
        ScenarioRunner::new(config)
            .with_probe_factory(Arc::new(|_: &TelemetryConfig| Box::new(SteadyProbe) as Box<dyn ResourceProbe>))
    }

    fn burst() -> Scenario {
        Scenario::new("burst", ScenarioCategory::ScheduleBurst)
            .checkpoint(
                Checkpoint::new("ready", Duration::ZERO)
                    .step(Step::ExpectHealthy { healthy: true })
                    .step(Step::ExpectCatalogMatches)
                    .step(Step::StartRecordings { count: 5 }),
            )
            .checkpoint(Checkpoint::new("trigger", 2 * HOUR).step(Step::TriggerScheduler))
            .checkpoint(Checkpoint::new("day", 24 * HOUR).step(Step::ExpectJobs {
                status: JobStatus::Completed,
                min_ratio: 1.0,
            }))
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_completes_with_telemetry() {
        let runner = runner(config());
        assert_eq!(runner.state(), RunnerState::Idle);
        let result = runner.run(&burst()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed, "{:?}", result.outcomes);
        assert_eq!(runner.state(), RunnerState::Finished(RunStatus::Completed));
        assert_eq!(result.outcomes.len(), 5);
        assert!(result.outcomes.iter().all(|outcome| outcome.passed));
        assert!(result.virtual_elapsed() >= chrono::Duration::hours(24));
        let telemetry = result.telemetry.expect("telemetry summary");
        assert!(telemetry.samples > 0);
        assert_eq!(telemetry.cpu_percent.mean, 12.5);
        assert_eq!(result.dataset.counts.stations, 4);
        assert!(!result.dataset.fingerprint.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_forces_timed_out_without_failures() {
        let mut config = config();
        config.acceleration_factor = 1.0;
        config.hard_timeout = Duration::from_secs(5);
        let scenario = Scenario::new("slow", ScenarioCategory::Soak)
            .checkpoint(Checkpoint::new("start", Duration::ZERO).step(Step::ExpectHealthy { healthy: true }))
            .checkpoint(Checkpoint::new("late", HOUR).step(Step::ExpectHealthy { healthy: true }));

        let result = runner(config).run(&scenario).await.unwrap();
        assert_eq!(result.status, RunStatus::TimedOut);
        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.failed_assertions().count(), 0);
        assert!(result.real_elapsed >= Duration::from_secs(5));
        assert!(result.real_elapsed < Duration::from_secs(6));
        assert!(result.telemetry.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_the_run_at_the_next_boundary() {
        let (handle, signal) = AbortHandle::new();
        let runner = runner(config()).with_abort(signal);
        let scenario = burst();
        let aborter = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            handle.abort("operator interrupt");
        };
        let (result, ()) = tokio::join!(runner.run(&scenario), aborter);
        let result = result.unwrap();
        assert_eq!(result.status, RunStatus::Aborted);
        // the 24 h checkpoint is never reached at factor 600 within 30 s
        assert!(result.outcomes.iter().all(|outcome| outcome.checkpoint != "day"));
        assert_eq!(result.outcomes.len(), 4);
        assert!(result.telemetry.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_errors_fail_before_running() {
        let mut config = config();
        config.acceleration_factor = 0.5;
        let runner = runner(config);
        assert!(matches!(runner.run(&burst()).await, Err(RunError::Configuration(_))));
        assert_eq!(runner.state(), RunnerState::Idle);

        let mut config = self::config();
        config.fault_profile = Some("solar-flare".into());
        assert!(matches!(
            self::runner(config).run(&burst()).await,
            Err(RunError::Configuration(message)) if message.contains("solar-flare")
        ));

        let mut config = self::config();
        config.dataset.stations = 0;
        assert!(matches!(
            self::runner(config).run(&burst()).await,
            Err(RunError::Generation(GenerationError::InsufficientCapacity(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn assertion_failures_continue_unless_fail_fast() {
        let scenario = Scenario::new("strict", ScenarioCategory::Recovery)
            .checkpoint(
                Checkpoint::new("down", Duration::ZERO)
                    .step(Step::Signal {
                        signal: CollaboratorSignal::Shutdown,
                    })
                    .step(Step::ExpectHealthy { healthy: true }),
            )
            .checkpoint(
                Checkpoint::new("up", HOUR)
                    .step(Step::Signal {
                        signal: CollaboratorSignal::Restart,
                    })
                    .step(Step::ExpectHealthy { healthy: true }),
            );

        let lenient = runner(config()).run(&scenario).await.unwrap();
        assert_eq!(lenient.status, RunStatus::Failed);
        assert_eq!(lenient.outcomes.len(), 4);
        assert_eq!(lenient.failed_assertions().count(), 1);

        let strict = runner(config()).run(&scenario.clone().fail_fast(true)).await.unwrap();
        assert_eq!(strict.status, RunStatus::Failed);
        assert_eq!(strict.outcomes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_profile_fails_new_jobs() {
        let scenario = Scenario::new("flap", ScenarioCategory::NetworkDegradation).checkpoint(
            Checkpoint::new("down", Duration::ZERO)
                .step(Step::SetFaultProfile {
                    profile: "disconnect".into(),
                })
                .step(Step::StartRecordings { count: 3 })
                .step(Step::ExpectJobs {
                    status: JobStatus::Failed,
                    min_ratio: 1.0,
                }),
        );
        let result = runner(config()).run(&scenario).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed, "{:?}", result.outcomes);
        assert!(result.fault_stats.refused >= 3);
        assert_eq!(result.fault_stats.active_profile, "disconnect");
    }

    /// Collaborator whose health check panics.
    struct Fragile;

    #[async_trait]
    impl Collaborator for Fragile {
        fn name(&self) -> &str {
            "fragile"
        }

        async fn health_check(&self) -> Result<HealthReport, CollaboratorError> {
            panic!("health probe exploded");
        }

        async fn load_dataset(&self, _: Arc<Dataset>) -> Result<(), CollaboratorError> {
            Ok(())
        }

        async fn list_catalog(&self) -> Result<CatalogSnapshot, CollaboratorError> {
            Err(CollaboratorError::NoDataset)
        }

        async fn start_recording(&self, _: RecordingRequest) -> Result<JobId, CollaboratorError> {
            Err(CollaboratorError::Rejected("read-only".into()))
        }

        async fn stop_recording(&self, job: &str) -> Result<JobReport, CollaboratorError> {
            Err(CollaboratorError::UnknownJob(job.into()))
        }

        async fn job_status(&self, job: &str) -> Result<JobReport, CollaboratorError> {
            Err(CollaboratorError::UnknownJob(job.into()))
        }

        async fn trigger_scheduled(&self, _: DateTime<Utc>) -> Result<TriggerReport, CollaboratorError> {
            Err(CollaboratorError::Fault(FaultError::Injection("broken shaper".into())))
        }

        async fn signal(&self, _: CollaboratorSignal) -> Result<(), CollaboratorError> {
            Ok(())
        }
    }

    /// Simulated recorder that remembers every profile pushed to it.
    struct ProfileTracking {
        inner: crate::collaborator::SimulatedRecorder,
        pushed: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Collaborator for ProfileTracking {
        fn name(&self) -> &str {
            "profile-tracking"
        }

        async fn health_check(&self) -> Result<HealthReport, CollaboratorError> {
            self.inner.health_check().await
        }

        async fn load_dataset(&self, dataset: Arc<Dataset>) -> Result<(), CollaboratorError> {
            self.inner.load_dataset(dataset).await
        }

        async fn list_catalog(&self) -> Result<CatalogSnapshot, CollaboratorError> {
            self.inner.list_catalog().await
        }

        async fn start_recording(&self, request: RecordingRequest) -> Result<JobId, CollaboratorError> {
            self.inner.start_recording(request).await
        }

        async fn stop_recording(&self, job: &str) -> Result<JobReport, CollaboratorError> {
            self.inner.stop_recording(job).await
        }

        async fn job_status(&self, job: &str) -> Result<JobReport, CollaboratorError> {
            self.inner.job_status(job).await
        }

        async fn trigger_scheduled(&self, now: DateTime<Utc>) -> Result<TriggerReport, CollaboratorError> {
            self.inner.trigger_scheduled(now).await
        }

        async fn signal(&self, signal: CollaboratorSignal) -> Result<(), CollaboratorError> {
            self.inner.signal(signal).await
        }

        async fn apply_fault_profile(&self, profile: &FaultProfile) -> Result<(), CollaboratorError> {
            if profile.name == "unstable" && self.pushed.lock().contains(&profile.name) {
                return Err(CollaboratorError::Rejected("profile already applied once".into()));
            }
            self.pushed.lock().push(profile.name.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fault_profile_changes_are_pushed_to_the_collaborator() {
        let pushed = Arc::new(Mutex::new(Vec::new()));
        let tracked = pushed.clone();
        let mut config = config();
        config.fault_profile = Some("unstable".into());
        let runner = runner(config).with_backend(CollaboratorBackend::custom(move |env| {
            Ok(Arc::new(ProfileTracking {
                inner: crate::collaborator::SimulatedRecorder::new(env, tach_resilience::RetryPolicy::default()),
                pushed: tracked.clone(),
            }) as Arc<dyn Collaborator>)
        }));
        let scenario = Scenario::new("profiles", ScenarioCategory::NetworkDegradation)
            .checkpoint(
                Checkpoint::new("switch", Duration::ZERO)
                    .step(Step::SetFaultProfile {
                        profile: "disconnect".into(),
                    })
                    .step(Step::ClearFaults),
            )
            .checkpoint(Checkpoint::new("again", HOUR).step(Step::SetFaultProfile {
                profile: "unstable".into(),
            }));

        let result = runner.run(&scenario).await.unwrap();
        assert_eq!(*pushed.lock(), vec!["unstable", "disconnect", "baseline"]);
        assert_eq!(result.status, RunStatus::Failed);
        let refused = result.outcomes.last().unwrap();
        assert_eq!(refused.assertion, "set_fault_profile(unstable)");
        assert!(!refused.passed);
        assert!(refused.message.contains("already applied"));
    }

    #[tokio::test(start_paused = true)]
    async fn panics_are_recorded_and_injection_errors_are_fatal() {
        let runner = runner(config())
            .with_backend(CollaboratorBackend::custom(|_| Ok(Arc::new(Fragile) as Arc<dyn Collaborator>)));
        let scenario = Scenario::new("fragile", ScenarioCategory::Recovery)
            .checkpoint(
                Checkpoint::new("probe", Duration::ZERO)
                    .step(Step::ExpectHealthy { healthy: true })
                    .step(Step::ExpectCatalogMatches),
            )
            .checkpoint(Checkpoint::new("trigger", HOUR).step(Step::TriggerScheduler))
            .checkpoint(Checkpoint::new("never", 2 * HOUR).step(Step::ExpectCatalogMatches));

        let result = runner.run(&scenario).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.outcomes[0].message.contains("health probe exploded"));
        assert!(result.error.as_deref().unwrap().contains("broken shaper"));
        assert!(result.outcomes.iter().all(|outcome| outcome.checkpoint != "never"));
        assert!(!result.fault_stats.active_profile.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn soft_timeout_is_recorded_and_run_continues() {
        let mut config = config();
        config.acceleration_factor = 1.0;
        config.checkpoint_soft_timeout = Some(Duration::from_millis(500));
        let scenario = Scenario::new("sluggish", ScenarioCategory::NetworkDegradation)
            .checkpoint(
                Checkpoint::new("slow", Duration::ZERO)
                    .step(Step::SetFaultProfile {
                        profile: "poor-connection".into(),
                    })
                    .step(Step::StartRecordings { count: 20 }),
            )
            .checkpoint(
                Checkpoint::new("after", Duration::from_secs(60))
                    .step(Step::ClearFaults)
                    .step(Step::ExpectHealthy { healthy: true }),
            );

        let result = runner(config).run(&scenario).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result
            .outcomes
            .iter()
            .any(|outcome| outcome.assertion == "soft_timeout" && outcome.checkpoint == "slow"));
        assert!(result
            .outcomes
            .iter()
            .any(|outcome| outcome.checkpoint == "after" && outcome.passed));
    }
}
