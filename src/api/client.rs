use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::http::{ErrorBody, SubmitJobResponse};
use super::{
    AckResponse, Assignment, ProgressReport, ReportAck, ResultReport, SchedulerApi, StartReport,
};
use crate::error::{RenderqError, Result};
use crate::scheduler::job::{Job, JobSubmission};
use crate::scheduler::worker::{Worker, WorkerRegistration};

/// [`SchedulerApi`] over the scheduler's HTTP API.
#[derive(Clone)]
pub struct HttpSchedulerClient {
    client: Client,
    base_url: String,
}

impl HttpSchedulerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn submit_job(&self, submission: &JobSubmission) -> Result<Uuid> {
        let response = self
            .client
            .post(self.url("/api/jobs"))
            .json(submission)
            .send()
            .await?;
        let body: SubmitJobResponse = decode(response, NotFound::None).await?;
        Ok(body.job_id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        let response = self
            .client
            .get(self.url(&format!("/api/jobs/{job_id}")))
            .send()
            .await?;
        decode(response, NotFound::Job(job_id)).await
    }

    async fn post_ack<B: serde::Serialize + ?Sized>(
        &self,
        task_id: Uuid,
        action: &str,
        body: &B,
    ) -> Result<ReportAck> {
        let response = self
            .client
            .post(self.url(&format!("/api/tasks/{task_id}/{action}")))
            .json(body)
            .send()
            .await?;
        let body: AckResponse = decode(response, NotFound::Task(task_id)).await?;
        Ok(body.ack)
    }
}

/// Which entity a 404 refers to.
enum NotFound<'a> {
    None,
    Job(Uuid),
    Task(Uuid),
    Worker(&'a str),
}

/// Turn a non-success response into the matching [`RenderqError`].
async fn error_from(response: Response, not_found: NotFound<'_>) -> RenderqError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let parsed: Option<ErrorBody> = serde_json::from_str(&body).ok();
    let kind = parsed.as_ref().map(|b| b.kind.as_str()).unwrap_or_default();
    let message = parsed
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| body.clone());

    match (status, kind, not_found) {
        (StatusCode::NOT_FOUND, "worker_not_found", NotFound::Worker(id)) => {
            RenderqError::WorkerNotFound(id.to_string())
        }
        (StatusCode::NOT_FOUND, "task_not_found", NotFound::Task(id)) => {
            RenderqError::TaskNotFound(id)
        }
        (StatusCode::NOT_FOUND, "job_not_found", NotFound::Job(id)) => {
            RenderqError::JobNotFound(id)
        }
        (StatusCode::BAD_REQUEST, "validation", _) => RenderqError::Validation(message),
        (StatusCode::SERVICE_UNAVAILABLE, "queue_full", _) => RenderqError::QueueFull,
        _ => RenderqError::Remote {
            status: status.as_u16(),
            message,
        },
    }
}

async fn decode<T: DeserializeOwned>(response: Response, not_found: NotFound<'_>) -> Result<T> {
    if !response.status().is_success() {
        return Err(error_from(response, not_found).await);
    }
    Ok(response.json::<T>().await?)
}

async fn expect_empty(response: Response, not_found: NotFound<'_>) -> Result<()> {
    if !response.status().is_success() {
        return Err(error_from(response, not_found).await);
    }
    Ok(())
}

#[async_trait]
impl SchedulerApi for HttpSchedulerClient {
    async fn register_worker(&self, registration: WorkerRegistration) -> Result<Worker> {
        let response = self
            .client
            .post(self.url("/api/workers/register"))
            .json(&registration)
            .send()
            .await?;
        decode(response, NotFound::None).await
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/api/workers/{worker_id}/heartbeat")))
            .send()
            .await?;
        expect_empty(response, NotFound::Worker(worker_id)).await
    }

    async fn request_task(&self, worker_id: &str) -> Result<Option<Assignment>> {
        let response = self
            .client
            .post(self.url(&format!("/api/workers/{worker_id}/request-task")))
            .send()
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        decode(response, NotFound::Worker(worker_id)).await.map(Some)
    }

    async fn report_started(&self, task_id: Uuid, worker_id: &str) -> Result<ReportAck> {
        let body = StartReport {
            worker_id: worker_id.to_string(),
        };
        self.post_ack(task_id, "start", &body).await
    }

    async fn report_progress(&self, task_id: Uuid, report: ProgressReport) -> Result<ReportAck> {
        self.post_ack(task_id, "progress", &report).await
    }

    async fn report_result(&self, task_id: Uuid, report: ResultReport) -> Result<ReportAck> {
        self.post_ack(task_id, "result", &report).await
    }
}
