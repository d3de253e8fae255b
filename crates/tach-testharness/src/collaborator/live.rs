//! ---
//! tach_section: "11-simulation-test-harness"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "HTTP adapter driving a running application under test."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tach_resilience::{FaultInjector, FaultProfile, OperationClass};
use tach_sim::Dataset;
use tracing::debug;

use super::{
    CatalogSnapshot, Collaborator, CollaboratorError, CollaboratorSignal, HealthReport, JobId,
    JobReport, RecordingRequest, TriggerReport,
};

#[derive(Debug, Deserialize)]
struct JobAccepted {
    id: JobId,
}

#[derive(Debug, Serialize)]
struct TriggerBody {
    now: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SignalBody {
    signal: CollaboratorSignal,
}

/// Drives a running application over HTTP/JSON.
///
/// Every request the harness sends is control traffic and bypasses the run's
/// [`FaultInjector`]. Impairment belongs to the application's own upstream
/// links, so the active profile is pushed to it over `PUT /harness/fault-profile`.
#[derive(Debug)]
pub struct LiveRecorder {
    base_url: String,
    client: Client,
    injector: Arc<FaultInjector>,
}

impl LiveRecorder {
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        injector: Arc<FaultInjector>,
    ) -> Result<Self, CollaboratorError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(CollaboratorError::Rejected("live backend needs a base url".into()));
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| CollaboratorError::Transport(format!("failed to build client: {err}")))?;
        Ok(Self {
            base_url,
            client,
            injector,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn call<T>(&self, request: RequestBuilder) -> Result<T, CollaboratorError>
    where
        T: DeserializeOwned,
    {
        self.injector
            .intercept(OperationClass::Control, async move {
                let response = check(request.send().await.map_err(transport)?).await?;
                response.json::<T>().await.map_err(transport)
            })
            .await?
    }

    async fn call_unit(&self, request: RequestBuilder) -> Result<(), CollaboratorError> {
        self.injector
            .intercept(OperationClass::Control, async move {
                check(request.send().await.map_err(transport)?).await.map(|_| ())
            })
            .await?
    }
}

fn transport(err: reqwest::Error) -> CollaboratorError {
    if err.is_timeout() {
        CollaboratorError::Transport(format!("request timed out: {err}"))
    } else {
        CollaboratorError::Transport(err.to_string())
    }
}

async fn check(response: Response) -> Result<Response, CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, body))
}

fn status_error(status: StatusCode, body: String) -> CollaboratorError {
    match status {
        StatusCode::SERVICE_UNAVAILABLE => CollaboratorError::Unavailable(body),
        StatusCode::NOT_FOUND => CollaboratorError::UnknownJob(body),
        StatusCode::PRECONDITION_FAILED => CollaboratorError::NoDataset,
        other => CollaboratorError::Rejected(format!("{other}: {body}")),
    }
}

fn unknown_job(job: &str) -> impl FnOnce(CollaboratorError) -> CollaboratorError + '_ {
    move |err| match err {
        CollaboratorError::UnknownJob(_) => CollaboratorError::UnknownJob(job.to_string()),
        other => other,
    }
}

#[async_trait]
impl Collaborator for LiveRecorder {
    fn name(&self) -> &str {
        "live-recorder"
    }

    async fn health_check(&self) -> Result<HealthReport, CollaboratorError> {
        self.call(self.client.get(self.url("/health"))).await
    }

    async fn load_dataset(&self, dataset: Arc<Dataset>) -> Result<(), CollaboratorError> {
        debug!(
            target: "tach::testharness::live",
            base_url = %self.base_url,
            programs = dataset.programs.len(),
            "pushing dataset"
        );
        let request = self.client.put(self.url("/harness/dataset")).json(dataset.as_ref());
        self.call_unit(request).await
    }

    async fn list_catalog(&self) -> Result<CatalogSnapshot, CollaboratorError> {
        self.call(self.client.get(self.url("/catalog"))).await
    }

    async fn start_recording(&self, request: RecordingRequest) -> Result<JobId, CollaboratorError> {
        let accepted: JobAccepted = self
            .call(self.client.post(self.url("/recordings")).json(&request))
            .await?;
        Ok(accepted.id)
    }

    async fn stop_recording(&self, job: &str) -> Result<JobReport, CollaboratorError> {
        let path = format!("/recordings/{job}");
        self.call(self.client.delete(self.url(&path)))
            .await
            .map_err(unknown_job(job))
    }

    async fn job_status(&self, job: &str) -> Result<JobReport, CollaboratorError> {
        let path = format!("/recordings/{job}");
        self.call(self.client.get(self.url(&path)))
            .await
            .map_err(unknown_job(job))
    }

    async fn trigger_scheduled(&self, now: DateTime<Utc>) -> Result<TriggerReport, CollaboratorError> {
        let request = self
            .client
            .post(self.url("/scheduler/trigger"))
            .json(&TriggerBody { now });
        self.call(request).await
    }

    async fn signal(&self, signal: CollaboratorSignal) -> Result<(), CollaboratorError> {
        let request = self
            .client
            .post(self.url("/harness/signal"))
            .json(&SignalBody { signal });
        self.call_unit(request).await
    }

    async fn apply_fault_profile(&self, profile: &FaultProfile) -> Result<(), CollaboratorError> {
        debug!(
            target: "tach::testharness::live",
            base_url = %self.base_url,
            profile = %profile.name,
            "pushing fault profile"
        );
        let request = self.client.put(self.url("/harness/fault-profile")).json(profile);
        self.call_unit(request).await
    }
}
