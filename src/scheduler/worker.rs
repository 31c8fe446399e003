use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RenderqError, Result};
use crate::scheduler::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Online => write!(f, "online"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// What a worker agent announces about itself when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub pools: Vec<String>,
    /// Plugin types the worker can execute.
    pub capabilities: Vec<String>,
}

impl WorkerRegistration {
    pub fn new(worker_id: impl Into<String>, pools: Vec<String>, capabilities: Vec<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            name: None,
            pools,
            capabilities,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(RenderqError::Validation("worker id is required".to_string()));
        }
        if self.pools.is_empty() {
            return Err(RenderqError::Validation(
                "worker must declare at least one pool".to_string(),
            ));
        }
        Ok(())
    }
}

fn enabled_by_default() -> bool {
    true
}

/// Scheduler-side record of a worker. Never deleted; absence is OFFLINE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub pools: Vec<String>,
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    /// Operator switch, independent of liveness. A disabled worker keeps
    /// heartbeating but is handed no new tasks.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub current_task: Option<Uuid>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(registration: WorkerRegistration, now: DateTime<Utc>) -> Self {
        Self {
            name: registration
                .name
                .unwrap_or_else(|| registration.worker_id.clone()),
            id: registration.worker_id,
            pools: registration.pools,
            capabilities: registration.capabilities,
            status: WorkerStatus::Online,
            enabled: true,
            last_heartbeat: now,
            current_task: None,
            registered_at: now,
        }
    }

    /// Apply a repeated registration: new pools/capabilities, fresh heartbeat.
    pub fn update_registration(&mut self, registration: WorkerRegistration, now: DateTime<Utc>) {
        if let Some(name) = registration.name {
            self.name = name;
        }
        self.pools = registration.pools;
        self.capabilities = registration.capabilities;
        self.heartbeat(now);
    }

    /// Record a heartbeat. Returns true if the worker came back from OFFLINE.
    pub fn heartbeat(&mut self, now: DateTime<Utc>) -> bool {
        self.last_heartbeat = now;
        let revived = self.status == WorkerStatus::Offline;
        self.status = WorkerStatus::Online;
        revived
    }

    pub fn is_online(&self) -> bool {
        self.status == WorkerStatus::Online
    }

    /// `now - last_heartbeat` exceeds `timeout`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let silence = now.signed_duration_since(self.last_heartbeat);
        silence.to_std().is_ok_and(|silence| silence > timeout)
    }

    pub fn mark_offline(&mut self) {
        self.status = WorkerStatus::Offline;
        self.current_task = None;
    }

    /// Online and not disabled by an operator.
    pub fn accepts_work(&self) -> bool {
        self.is_online() && self.enabled
    }

    /// The job's pool and plugin type are both among what this worker declared.
    pub fn can_run(&self, job: &Job) -> bool {
        self.pools.iter().any(|p| *p == job.pool)
            && self.capabilities.iter().any(|c| *c == job.plugin_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobSubmission;

    fn registration() -> WorkerRegistration {
        WorkerRegistration::new(
            "w1",
            vec!["default".to_string()],
            vec!["ffmpeg".to_string()],
        )
    }

    #[test]
    fn new_worker_is_online() {
        let worker = Worker::new(registration(), Utc::now());
        assert!(worker.is_online());
        assert_eq!(worker.name, "w1");
        assert!(worker.current_task.is_none());
    }

    #[test]
    fn staleness_uses_strict_comparison() {
        let start = Utc::now();
        let worker = Worker::new(registration(), start);
        let timeout = Duration::from_secs(60);
        assert!(!worker.is_stale(start + chrono::Duration::seconds(60), timeout));
        assert!(worker.is_stale(start + chrono::Duration::seconds(61), timeout));
        // Clock skew backwards never counts as silence.
        assert!(!worker.is_stale(start - chrono::Duration::seconds(5), timeout));
    }

    #[test]
    fn heartbeat_revives_offline_worker() {
        let now = Utc::now();
        let mut worker = Worker::new(registration(), now);
        assert!(!worker.heartbeat(now));
        worker.mark_offline();
        assert!(worker.heartbeat(now));
        assert!(worker.is_online());
    }

    #[test]
    fn eligibility_requires_pool_and_capability() {
        let worker = Worker::new(registration(), Utc::now());
        let ok = Job::new(JobSubmission::new("a", "ffmpeg", serde_json::json!({})));
        let wrong_plugin = Job::new(JobSubmission::new("b", "aftereffects", serde_json::json!({})));
        let wrong_pool =
            Job::new(JobSubmission::new("c", "ffmpeg", serde_json::json!({})).with_pool("gpu"));
        assert!(worker.can_run(&ok));
        assert!(!worker.can_run(&wrong_plugin));
        assert!(!worker.can_run(&wrong_pool));
    }

    #[test]
    fn re_registration_updates_capabilities() {
        let now = Utc::now();
        let mut worker = Worker::new(registration(), now);
        worker.mark_offline();
        let mut update = registration();
        update.capabilities = vec!["aftereffects".to_string()];
        update.name = Some("render-01".to_string());
        worker.update_registration(update, now);
        assert_eq!(worker.capabilities, vec!["aftereffects".to_string()]);
        assert_eq!(worker.name, "render-01");
        assert!(worker.is_online());
    }

    #[test]
    fn disabled_worker_stays_online_but_takes_no_work() {
        let now = Utc::now();
        let mut worker = Worker::new(registration(), now);
        assert!(worker.accepts_work());

        worker.enabled = false;
        assert!(worker.is_online());
        assert!(!worker.accepts_work());

        // An agent restart does not undo the operator's decision.
        worker.update_registration(registration(), now);
        assert!(!worker.enabled);
    }

    #[test]
    fn registration_validation() {
        assert!(registration().validate().is_ok());
        let mut r = registration();
        r.worker_id = "".to_string();
        assert!(r.validate().is_err());
        let mut r = registration();
        r.pools.clear();
        assert!(r.validate().is_err());
    }
}
