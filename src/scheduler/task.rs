use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RenderqError, Result};
use crate::plugin::TaskSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Assigned,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Held by a worker right now.
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned | Cancelled)
                | (Assigned, Running | Pending | Completed | Failed | Cancelled)
                | (Running, Pending | Completed | Failed | Cancelled)
                | (Failed, Pending | Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One independently assignable unit of a job.
///
/// `assigned_worker` is `Some` exactly while the task is ASSIGNED or RUNNING;
/// every method that changes `status` maintains that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub index: u32,
    pub frame_start: Option<i64>,
    pub frame_end: Option<i64>,
    /// Plugin-private data attached at expansion time.
    pub metadata: serde_json::Value,
    /// Command line built once at expansion time.
    pub command: Vec<String>,
    pub status: TaskStatus,
    pub assigned_worker: Option<String>,
    pub progress: f64,
    /// Attempts that ended in a failure reported by a worker.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_spec(job_id: Uuid, index: u32, spec: TaskSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            index,
            frame_start: spec.frame_start,
            frame_end: spec.frame_end,
            metadata: spec.metadata,
            command: Vec::new(),
            status: TaskStatus::Pending,
            assigned_worker: None,
            progress: 0.0,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RenderqError::invalid_transition("task", self.status, next));
        }
        self.status = next;
        self.updated_at = now;
        if !next.is_active() {
            self.assigned_worker = None;
        }
        Ok(())
    }

    /// PENDING -> ASSIGNED to `worker_id`.
    pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Assigned, now)?;
        self.assigned_worker = Some(worker_id.to_string());
        Ok(())
    }

    /// ASSIGNED -> RUNNING once the worker launched the process.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Running, now)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn record_progress(&mut self, fraction: f64, now: DateTime<Utc>) -> Result<()> {
        if !self.status.is_active() {
            return Err(RenderqError::invalid_transition(
                "task",
                self.status,
                "progress update",
            ));
        }
        self.progress = fraction.clamp(0.0, 1.0);
        self.updated_at = now;
        Ok(())
    }

    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Completed, now)?;
        self.progress = 1.0;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Worker-reported failure. Consumes one attempt of the retry budget.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Failed, now)?;
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.finished_at = Some(now);
        Ok(())
    }

    /// The holder went silent: back to PENDING without touching `attempts`.
    pub fn release(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.status.is_active() {
            return Err(RenderqError::invalid_transition(
                "task",
                self.status,
                TaskStatus::Pending,
            ));
        }
        self.transition(TaskStatus::Pending, now)?;
        self.progress = 0.0;
        self.started_at = None;
        Ok(())
    }

    /// FAILED -> PENDING while the retry budget allows another attempt.
    pub fn retry(&mut self, max_retries: u32, now: DateTime<Utc>) -> Result<()> {
        if self.status != TaskStatus::Failed || self.attempts >= max_retries {
            return Err(RenderqError::invalid_transition(
                "task",
                self.status,
                "pending (retry)",
            ));
        }
        self.transition(TaskStatus::Pending, now)?;
        self.progress = 0.0;
        self.started_at = None;
        self.finished_at = None;
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(TaskStatus::Cancelled, now)?;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.status == TaskStatus::Failed && self.attempts >= max_retries
    }

    /// No further state change can happen to this task.
    pub fn is_terminal(&self, max_retries: u32) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Cancelled => true,
            TaskStatus::Failed => self.is_exhausted(max_retries),
            _ => false,
        }
    }

    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.status.is_active() && self.assigned_worker.as_deref() == Some(worker_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::from_spec(Uuid::new_v4(), 0, TaskSpec::frames(1, 50), Utc::now())
    }

    fn assert_worker_invariant(task: &Task) {
        assert_eq!(
            task.assigned_worker.is_some(),
            task.status.is_active(),
            "status {} with worker {:?}",
            task.status,
            task.assigned_worker
        );
    }

    #[test]
    fn claim_start_complete() {
        let mut t = task();
        let now = Utc::now();
        t.claim("w1", now).unwrap();
        assert_eq!(t.status, TaskStatus::Assigned);
        assert_eq!(t.assigned_worker.as_deref(), Some("w1"));
        assert_worker_invariant(&t);

        t.start(now).unwrap();
        t.record_progress(0.4, now).unwrap();
        assert_eq!(t.progress, 0.4);
        assert_worker_invariant(&t);

        t.complete(now).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.progress, 1.0);
        assert_worker_invariant(&t);
    }

    #[test]
    fn claiming_twice_is_rejected() {
        let mut t = task();
        let now = Utc::now();
        t.claim("w1", now).unwrap();
        assert!(t.claim("w2", now).is_err());
        assert_eq!(t.assigned_worker.as_deref(), Some("w1"));
    }

    #[test]
    fn failure_consumes_budget_and_release_does_not() {
        let mut t = task();
        let now = Utc::now();

        t.claim("w1", now).unwrap();
        t.start(now).unwrap();
        t.release(now).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.attempts, 0);
        assert_worker_invariant(&t);

        t.claim("w2", now).unwrap();
        t.fail("exit code 2", now).unwrap();
        assert_eq!(t.attempts, 1);
        assert_eq!(t.last_error.as_deref(), Some("exit code 2"));
        assert_worker_invariant(&t);
    }

    #[test]
    fn retry_stops_at_budget() {
        let mut t = task();
        let now = Utc::now();
        for attempt in 1..=3 {
            t.claim("w1", now).unwrap();
            t.fail(format!("boom {attempt}"), now).unwrap();
            if attempt < 3 {
                t.retry(3, now).unwrap();
                assert_eq!(t.status, TaskStatus::Pending);
            }
        }
        assert!(t.is_exhausted(3));
        assert!(t.is_terminal(3));
        assert!(t.retry(3, now).is_err());
        assert_eq!(t.status, TaskStatus::Failed);
    }

    #[test]
    fn progress_requires_active_task() {
        let mut t = task();
        assert!(t.record_progress(0.5, Utc::now()).is_err());
        assert_eq!(t.progress, 0.0);
    }

    #[test]
    fn progress_is_clamped() {
        let mut t = task();
        let now = Utc::now();
        t.claim("w1", now).unwrap();
        t.record_progress(7.0, now).unwrap();
        assert_eq!(t.progress, 1.0);
        t.record_progress(-1.0, now).unwrap();
        assert_eq!(t.progress, 0.0);
    }

    #[test]
    fn release_requires_active_task() {
        let mut t = task();
        assert!(t.release(Utc::now()).is_err());
    }

    #[test]
    fn completed_task_cannot_complete_again() {
        let mut t = task();
        let now = Utc::now();
        t.claim("w1", now).unwrap();
        t.complete(now).unwrap();
        assert!(t.complete(now).is_err());
        assert!(t.fail("late", now).is_err());
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[test]
    fn cancel_clears_assignment() {
        let mut t = task();
        let now = Utc::now();
        t.claim("w1", now).unwrap();
        t.cancel(now).unwrap();
        assert_eq!(t.status, TaskStatus::Cancelled);
        assert_worker_invariant(&t);
        assert!(t.is_terminal(3));
    }

    #[test]
    fn is_held_by_checks_status_and_worker() {
        let mut t = task();
        let now = Utc::now();
        assert!(!t.is_held_by("w1"));
        t.claim("w1", now).unwrap();
        assert!(t.is_held_by("w1"));
        assert!(!t.is_held_by("w2"));
    }
}
