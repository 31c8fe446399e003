//! Worker-facing operations and their wire types.
//!
//! [`SchedulerApi`] is the seam between a worker agent and the scheduler. The
//! scheduler implements it directly for in-process use, and
//! [`client::HttpSchedulerClient`] implements it over the HTTP transport in
//! [`http`].

pub mod client;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::job::Job;
use crate::scheduler::service::Scheduler;
use crate::scheduler::task::Task;
use crate::scheduler::worker::{Worker, WorkerRegistration};

/// A task handed to a worker, together with the job it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub task: Task,
    pub job: Job,
}

/// The scheduler's answer to a worker report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportAck {
    /// The report was applied.
    Accepted,
    /// The reporting worker no longer holds the task; nothing changed.
    Stale,
    /// The task or its job was cancelled; the worker should stop.
    Cancelled,
}

impl ReportAck {
    /// Whether the worker should keep working on the task.
    pub fn should_continue(self) -> bool {
        self == ReportAck::Accepted
    }
}

/// How a task execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartReport {
    pub worker_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub worker_id: String,
    /// Fraction in `0.0..=1.0`; out of range values are clamped.
    pub progress: f64,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultReport {
    pub worker_id: String,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub ack: ReportAck,
}

/// Operations a worker agent performs against the scheduler.
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    async fn register_worker(&self, registration: WorkerRegistration) -> Result<Worker>;

    async fn heartbeat(&self, worker_id: &str) -> Result<()>;

    /// `Ok(None)` means no eligible task right now.
    async fn request_task(&self, worker_id: &str) -> Result<Option<Assignment>>;

    async fn report_started(&self, task_id: Uuid, worker_id: &str) -> Result<ReportAck>;

    async fn report_progress(&self, task_id: Uuid, report: ProgressReport) -> Result<ReportAck>;

    async fn report_result(&self, task_id: Uuid, report: ResultReport) -> Result<ReportAck>;
}

#[async_trait]
impl SchedulerApi for Scheduler {
    async fn register_worker(&self, registration: WorkerRegistration) -> Result<Worker> {
        Scheduler::register_worker(self, registration).await
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        Scheduler::heartbeat(self, worker_id).await
    }

    async fn request_task(&self, worker_id: &str) -> Result<Option<Assignment>> {
        Scheduler::request_task(self, worker_id).await
    }

    async fn report_started(&self, task_id: Uuid, worker_id: &str) -> Result<ReportAck> {
        Scheduler::report_started(self, task_id, worker_id).await
    }

    async fn report_progress(&self, task_id: Uuid, report: ProgressReport) -> Result<ReportAck> {
        Scheduler::report_progress(self, task_id, report).await
    }

    async fn report_result(&self, task_id: Uuid, report: ResultReport) -> Result<ReportAck> {
        Scheduler::report_result(self, task_id, report).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_report_wire_format() {
        let report = ResultReport {
            worker_id: "w1".to_string(),
            outcome: TaskOutcome::Failure("exit code 1".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"worker_id": "w1", "outcome": "failure", "reason": "exit code 1"})
        );

        let parsed: ResultReport =
            serde_json::from_value(json!({"worker_id": "w1", "outcome": "success"})).unwrap();
        assert_eq!(parsed.outcome, TaskOutcome::Success);
    }

    #[test]
    fn only_accepted_continues() {
        assert!(ReportAck::Accepted.should_continue());
        assert!(!ReportAck::Stale.should_continue());
        assert!(!ReportAck::Cancelled.should_continue());
    }
}
