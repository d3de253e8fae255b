//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "In-process recorder standing in for the application under test."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tach_common::time::to_chrono;
use tach_resilience::{FaultError, FaultInjector, OperationClass, RetryPolicy};
use tach_rt::{ClockError, VirtualClock};
use tach_sim::Dataset;
use tracing::{debug, info};

use super::{
    CatalogSnapshot, Collaborator, CollaboratorError, CollaboratorSignal, HealthReport, JobId,
    JobReport, JobStatus, RecordingRequest, RunEnvironment, TriggerReport,
};

/// Schedules whose program starts within this window of the trigger instant are started.
const TRIGGER_LOOKAHEAD: Duration = Duration::from_secs(3_600);
const TRIGGER_CONCURRENCY: usize = 16;

enum Outcome {
    OnAir,
    Failed(String),
    Cancelled,
}

struct Job {
    request: RecordingRequest,
    outcome: Outcome,
}

impl Job {
    fn status(&self, now: DateTime<Utc>) -> JobStatus {
        match self.outcome {
            Outcome::Failed(_) => JobStatus::Failed,
            Outcome::Cancelled => JobStatus::Cancelled,
            Outcome::OnAir if now < self.request.starts_at => JobStatus::Pending,
            Outcome::OnAir if now < self.request.ends_at => JobStatus::Recording,
            Outcome::OnAir => JobStatus::Completed,
        }
    }

    fn report(&self, id: &str, now: DateTime<Utc>) -> JobReport {
        JobReport {
            id: id.to_string(),
            program_id: self.request.program_id,
            status: self.status(now),
            detail: match &self.outcome {
                Outcome::Failed(reason) => Some(reason.clone()),
                _ => None,
            },
        }
    }
}

struct RecorderState {
    available: bool,
    dataset: Option<Arc<Dataset>>,
    jobs: IndexMap<JobId, Job>,
    triggered: HashSet<u32>,
}

impl RecorderState {
    fn ensure_available(&self) -> Result<(), CollaboratorError> {
        if self.available {
            Ok(())
        } else {
            Err(CollaboratorError::Unavailable(
                "simulated recorder is down".into(),
            ))
        }
    }
}

/// In-memory recorder whose job lifecycle follows the run's virtual clock.
///
/// Tuning a stream is the recorder's only outbound network call. It is routed
/// through the run's [`FaultInjector`] as data-plane traffic and retried with
/// a [`RetryPolicy`] whose backoff is paced on the virtual clock.
pub struct SimulatedRecorder {
    clock: Arc<VirtualClock>,
    injector: Arc<FaultInjector>,
    retry: RetryPolicy,
    seed: u64,
    next_job: AtomicU64,
    state: Mutex<RecorderState>,
}

impl SimulatedRecorder {
    pub fn new(env: &RunEnvironment, retry: RetryPolicy) -> Self {
        Self {
            clock: env.clock.clone(),
            injector: env.injector.clone(),
            retry,
            seed: env.seed,
            next_job: AtomicU64::new(0),
            state: Mutex::new(RecorderState {
                available: true,
                dataset: None,
                jobs: IndexMap::new(),
                triggered: HashSet::new(),
            }),
        }
    }

    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    async fn tune(&self, job: &str, number: u64) -> Result<(), FaultError> {
        let injector = &self.injector;
        let clock = &self.clock;
        self.retry
            .run(
                job,
                self.seed ^ number,
                |_attempt| injector.intercept(OperationClass::Data, async {}),
                |delay| async move { clock.advance(delay).await.map(|_| ()).map_err(clock_fault) },
            )
            .await
    }
}

fn clock_fault(err: ClockError) -> FaultError {
    match err {
        ClockError::Cancelled { reason } => FaultError::Cancelled(reason),
        other => FaultError::Injection(other.to_string()),
    }
}

#[async_trait]
impl Collaborator for SimulatedRecorder {
    fn name(&self) -> &str {
        "simulated-recorder"
    }

    async fn health_check(&self) -> Result<HealthReport, CollaboratorError> {
        let now = self.clock.now();
        let state = self.state.lock();
        state.ensure_available()?;
        Ok(HealthReport {
            healthy: true,
            active_jobs: state
                .jobs
                .values()
                .filter(|job| job.status(now).is_active())
                .count(),
        })
    }

    async fn load_dataset(&self, dataset: Arc<Dataset>) -> Result<(), CollaboratorError> {
        let mut state = self.state.lock();
        state.ensure_available()?;
        debug!(
            target: "tach::testharness::simulated",
            programs = dataset.programs.len(),
            schedules = dataset.schedules.len(),
            "dataset loaded"
        );
        state.dataset = Some(dataset);
        state.triggered.clear();
        Ok(())
    }

    async fn list_catalog(&self) -> Result<CatalogSnapshot, CollaboratorError> {
        let state = self.state.lock();
        state.ensure_available()?;
        let dataset = state.dataset.as_ref().ok_or(CollaboratorError::NoDataset)?;
        let counts = dataset.counts();
        Ok(CatalogSnapshot {
            stations: counts.stations,
            programs: counts.programs,
            schedules: counts.schedules,
            fingerprint: dataset.fingerprint().ok(),
        })
    }

    async fn start_recording(&self, request: RecordingRequest) -> Result<JobId, CollaboratorError> {
        {
            let state = self.state.lock();
            state.ensure_available()?;
            if let Some(dataset) = &state.dataset {
                if dataset.program(request.program_id).is_none() {
                    return Err(CollaboratorError::Rejected(format!(
                        "unknown program {}",
                        request.program_id
                    )));
                }
            }
        }

        let number = self.next_job.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("job-{number:06}");
        let outcome = match self.tune(&id, number).await {
            Ok(()) => Outcome::OnAir,
            Err(err) if err.is_retryable() => Outcome::Failed(format!("upstream tune failed: {err}")),
            Err(err) => return Err(err.into()),
        };

        let mut state = self.state.lock();
        // killed while tuning
        state.ensure_available()?;
        state.jobs.insert(id.clone(), Job { request, outcome });
        Ok(id)
    }

    async fn stop_recording(&self, job: &str) -> Result<JobReport, CollaboratorError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.ensure_available()?;
        let entry = state
            .jobs
            .get_mut(job)
            .ok_or_else(|| CollaboratorError::UnknownJob(job.to_string()))?;
        if entry.status(now).is_active() {
            entry.outcome = Outcome::Cancelled;
        }
        Ok(entry.report(job, now))
    }

    async fn job_status(&self, job: &str) -> Result<JobReport, CollaboratorError> {
        let now = self.clock.now();
        let state = self.state.lock();
        state.ensure_available()?;
        state
            .jobs
            .get(job)
            .map(|entry| entry.report(job, now))
            .ok_or_else(|| CollaboratorError::UnknownJob(job.to_string()))
    }

    async fn trigger_scheduled(&self, now: DateTime<Utc>) -> Result<TriggerReport, CollaboratorError> {
        let (due, missed) = {
            let mut state = self.state.lock();
            state.ensure_available()?;
            let dataset = state.dataset.clone().ok_or(CollaboratorError::NoDataset)?;
            let horizon = now + to_chrono(TRIGGER_LOOKAHEAD);
            let mut due = Vec::new();
            let mut missed = 0;
            for schedule in &dataset.schedules {
                if state.triggered.contains(&schedule.id) {
                    continue;
                }
                let Some(program) = dataset.program(schedule.program_id) else {
                    continue;
                };
                if program.ends_at(dataset.epoch) <= now {
                    state.triggered.insert(schedule.id);
                    missed += 1;
                } else if program.starts_at(dataset.epoch) <= horizon {
                    state.triggered.insert(schedule.id);
                    due.push(RecordingRequest::for_program(
                        program,
                        dataset.epoch,
                        Some(schedule.id),
                    ));
                }
            }
            (due, missed)
        };

        let mut report = TriggerReport {
            due: due.len(),
            missed,
            ..TriggerReport::default()
        };
        let results: Vec<_> = stream::iter(due.into_iter().map(|request| self.start_recording(request)))
            .buffer_unordered(TRIGGER_CONCURRENCY)
            .collect()
            .await;
        for result in results {
            match result {
                Ok(id) => report.started.push(id),
                Err(err) if err.fault().is_some() => return Err(err),
                Err(_) => report.failed += 1,
            }
        }
        debug!(
            target: "tach::testharness::simulated",
            %now,
            due = report.due,
            started = report.started.len(),
            missed = report.missed,
            "scheduler triggered"
        );
        Ok(report)
    }

    async fn signal(&self, signal: CollaboratorSignal) -> Result<(), CollaboratorError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut failed = 0usize;
        match signal {
            CollaboratorSignal::Shutdown => state.available = false,
            CollaboratorSignal::Kill => {
                state.available = false;
                for job in state.jobs.values_mut() {
                    if job.status(now).is_active() {
                        job.outcome = Outcome::Failed("recorder killed".into());
                        failed += 1;
                    }
                }
            }
            CollaboratorSignal::Restart => state.available = true,
        }
        info!(
            target: "tach::testharness::simulated",
            %signal,
            failed_jobs = failed,
            "recorder signalled"
        );
        Ok(())
    }
}
