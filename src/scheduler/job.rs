use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RenderqError, Result};

pub const DEFAULT_PRIORITY: i32 = 50;
pub const MAX_PRIORITY: i32 = 100;
pub const DEFAULT_POOL: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Active,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Active,
        JobStatus::Suspended,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Jobs in these states own tasks that may still be handed out to workers.
    pub fn is_schedulable(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Active)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued | Failed | Cancelled)
                | (Queued, Active | Suspended | Failed | Cancelled)
                | (Active, Completed | Failed | Suspended | Cancelled)
                | (Suspended, Queued | Active | Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Active => write!(f, "active"),
            JobStatus::Suspended => write!(f, "suspended"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = RenderqError;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| RenderqError::Validation(format!("unknown job status: {s}")))
    }
}

/// Why a job ended up FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    /// The plugin rejected the job parameters (or the plugin type is unknown).
    Validation { reason: String },
    /// The plugin errored or panicked while expanding the job.
    Plugin { reason: String },
    /// A job this one depends on can never complete.
    Dependency { job_id: Uuid, reason: String },
    /// A task used up its retry budget.
    RetryExhausted {
        task_id: Uuid,
        task_index: u32,
        attempts: u32,
        error: String,
    },
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFailure::Validation { reason } => write!(f, "validation failed: {reason}"),
            JobFailure::Plugin { reason } => write!(f, "plugin error: {reason}"),
            JobFailure::Dependency { job_id, reason } => {
                write!(f, "dependency {job_id} {reason}")
            }
            JobFailure::RetryExhausted {
                task_index,
                attempts,
                error,
                ..
            } => write!(
                f,
                "task {task_index} failed after {attempts} attempts: {error}"
            ),
        }
    }
}

/// Client request to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub name: String,
    pub plugin_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_pool")]
    pub pool: String,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_pool() -> String {
    DEFAULT_POOL.to_string()
}

impl JobSubmission {
    pub fn new(
        name: impl Into<String>,
        plugin_type: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            plugin_type: plugin_type.into(),
            params,
            priority: DEFAULT_PRIORITY,
            pool: default_pool(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn with_dependency(mut self, job_id: Uuid) -> Self {
        self.depends_on.push(job_id);
        self
    }

    /// Checks the request shape only. Whether the parameters make sense is up
    /// to the plugin and is decided asynchronously when the job is expanded.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RenderqError::Validation("job name is required".to_string()));
        }
        if self.plugin_type.trim().is_empty() {
            return Err(RenderqError::Validation(
                "plugin type is required".to_string(),
            ));
        }
        if self.pool.trim().is_empty() {
            return Err(RenderqError::Validation("pool is required".to_string()));
        }
        validate_priority(self.priority)?;
        if !(self.params.is_object() || self.params.is_null()) {
            return Err(RenderqError::Validation(
                "params must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn validate_priority(priority: i32) -> Result<()> {
    if !(0..=MAX_PRIORITY).contains(&priority) {
        return Err(RenderqError::Validation(format!(
            "priority must be between 0 and {MAX_PRIORITY}, got {priority}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub plugin_type: String,
    pub params: serde_json::Value,
    pub priority: i32,
    pub pool: String,
    pub depends_on: Vec<Uuid>,
    pub status: JobStatus,
    /// Mean of the owned tasks' progress fractions.
    pub progress: f64,
    pub task_total: usize,
    pub task_completed: usize,
    pub task_failed: usize,
    pub failure: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(submission: JobSubmission) -> Self {
        Self::with_id(Uuid::new_v4(), submission, Utc::now())
    }

    pub fn with_id(id: Uuid, submission: JobSubmission, created_at: DateTime<Utc>) -> Self {
        let params = if submission.params.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            submission.params
        };
        Self {
            id,
            name: submission.name,
            plugin_type: submission.plugin_type,
            params,
            priority: submission.priority,
            pool: submission.pool,
            depends_on: submission.depends_on,
            status: JobStatus::Pending,
            progress: 0.0,
            task_total: 0,
            task_completed: 0,
            task_failed: 0,
            failure: None,
            created_at,
            updated_at: created_at,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move the job to `next`, rejecting anything the state machine does not allow.
    pub fn transition_to(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RenderqError::invalid_transition("job", self.status, next));
        }
        self.status = next;
        self.updated_at = now;
        match next {
            JobStatus::Active if self.started_at.is_none() => self.started_at = Some(now),
            JobStatus::Completed => {
                self.progress = 1.0;
                self.finished_at = Some(now);
            }
            JobStatus::Failed | JobStatus::Cancelled => self.finished_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    pub fn fail(&mut self, failure: JobFailure, now: DateTime<Utc>) -> Result<()> {
        self.transition_to(JobStatus::Failed, now)?;
        self.failure = Some(failure);
        Ok(())
    }

    /// The state a suspended job returns to: ACTIVE once any task was ever
    /// handed out, QUEUED otherwise.
    pub fn resume_target(&self) -> JobStatus {
        if self.started_at.is_some() {
            JobStatus::Active
        } else {
            JobStatus::Queued
        }
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.failure.as_ref().map(|f| f.to_string())
    }
}

/// Query parameters for listing jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub pool: Option<String>,
    pub plugin_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.pool.as_deref().is_none_or(|p| job.pool == p)
            && self
                .plugin_type
                .as_deref()
                .is_none_or(|p| job.plugin_type == p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission() -> JobSubmission {
        JobSubmission::new("shot_010", "aftereffects", json!({"mode": "custom"}))
    }

    #[test]
    fn new_job_is_pending() {
        let job = Job::new(submission());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.pool, "default");
        assert_eq!(job.progress, 0.0);
        assert!(job.failure.is_none());
    }

    #[test]
    fn null_params_become_empty_object() {
        let job = Job::new(JobSubmission::new("a", "ffmpeg", serde_json::Value::Null));
        assert!(job.params.is_object());
    }

    #[test]
    fn happy_path_transitions() {
        let mut job = Job::new(submission());
        let now = Utc::now();
        job.transition_to(JobStatus::Queued, now).unwrap();
        job.transition_to(JobStatus::Active, now).unwrap();
        assert_eq!(job.started_at, Some(now));
        job.transition_to(JobStatus::Completed, now).unwrap();
        assert_eq!(job.progress, 1.0);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn terminal_states_reject_everything() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn pending_cannot_skip_to_active() {
        let mut job = Job::new(submission());
        let err = job.transition_to(JobStatus::Active, Utc::now()).unwrap_err();
        assert!(matches!(err, RenderqError::InvalidTransition { .. }));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn suspend_is_only_reachable_from_queued_or_active() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Suspended));
        assert!(JobStatus::Active.can_transition_to(JobStatus::Suspended));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Suspended));
        assert!(JobStatus::Suspended.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Suspended.can_transition_to(JobStatus::Active));
    }

    #[test]
    fn cancel_is_reachable_from_every_non_terminal_state() {
        for status in JobStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(status.can_transition_to(JobStatus::Cancelled), "{status}");
        }
    }

    #[test]
    fn resume_target_depends_on_whether_job_started() {
        let mut job = Job::new(submission());
        assert_eq!(job.resume_target(), JobStatus::Queued);
        job.started_at = Some(Utc::now());
        assert_eq!(job.resume_target(), JobStatus::Active);
    }

    #[test]
    fn submission_shape_validation() {
        assert!(submission().validate().is_ok());
        assert!(JobSubmission::new("", "ffmpeg", json!({})).validate().is_err());
        assert!(JobSubmission::new("a", " ", json!({})).validate().is_err());
        assert!(submission().with_priority(101).validate().is_err());
        assert!(submission().with_priority(-1).validate().is_err());
        assert!(submission().with_pool("").validate().is_err());
        assert!(JobSubmission::new("a", "ffmpeg", json!([1, 2]))
            .validate()
            .is_err());
    }

    #[test]
    fn submission_defaults_from_json() {
        let sub: JobSubmission =
            serde_json::from_value(json!({"name": "a", "plugin_type": "ffmpeg"})).unwrap();
        assert_eq!(sub.priority, DEFAULT_PRIORITY);
        assert_eq!(sub.pool, "default");
        assert!(sub.depends_on.is_empty());
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("QUEUED".parse::<JobStatus>().unwrap(), JobStatus::Queued);
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn failure_reason_carries_task_error() {
        let mut job = Job::new(submission());
        let now = Utc::now();
        job.transition_to(JobStatus::Queued, now).unwrap();
        job.transition_to(JobStatus::Active, now).unwrap();
        job.fail(
            JobFailure::RetryExhausted {
                task_id: Uuid::new_v4(),
                task_index: 2,
                attempts: 3,
                error: "exit code 1".to_string(),
            },
            now,
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason().unwrap().contains("exit code 1"));
    }

    #[test]
    fn filter_matches_on_all_fields() {
        let job = Job::new(submission().with_pool("gpu"));
        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::with_status(JobStatus::Pending).matches(&job));
        assert!(!JobFilter::with_status(JobStatus::Queued).matches(&job));
        let filter = JobFilter {
            pool: Some("cpu".to_string()),
            ..Default::default()
        };
        assert!(!filter.matches(&job));
    }
}
