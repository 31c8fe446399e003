use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::scheduler::job::{Job, JobFilter, JobStatus};
use crate::scheduler::task::{Task, TaskStatus};
use crate::scheduler::worker::{Worker, WorkerStatus};

const DEFAULT_MAX_JOBS: usize = 10_000;
const DEFAULT_LIST_LIMIT: usize = 100;

/// Counts per state, as reported by the stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub jobs: BTreeMap<String, usize>,
    pub tasks: BTreeMap<String, usize>,
    pub workers_online: usize,
    pub workers_offline: usize,
}

/// Authoritative record of jobs, tasks and workers.
///
/// The store itself is not synchronized; callers share it behind an
/// `RwLock` and perform every read-modify-write under one write guard.
#[derive(Debug)]
pub struct StateStore {
    jobs: HashMap<Uuid, Job>,
    tasks: HashMap<Uuid, Task>,
    /// Task ids per job, in task index order.
    job_tasks: HashMap<Uuid, Vec<Uuid>>,
    workers: HashMap<String, Worker>,
    max_jobs: usize,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            tasks: HashMap::new(),
            job_tasks: HashMap::new(),
            workers: HashMap::new(),
            max_jobs,
        }
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Add a new job. Returns false if the store is at capacity.
    pub fn add_job(&mut self, job: Job) -> bool {
        if self.jobs.len() >= self.max_jobs {
            return false;
        }
        self.jobs.insert(job.id, job);
        true
    }

    pub fn job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn job_mut(&mut self, id: &Uuid) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Ids of jobs in any of `statuses`, oldest first.
    pub fn job_ids_with_status(&self, statuses: &[JobStatus]) -> Vec<Uuid> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| statuses.contains(&j.status))
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs.into_iter().map(|j| j.id).collect()
    }

    /// Jobs matching `filter`, oldest first, paginated.
    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().filter(|j| filter.matches(j)).collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs.into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .collect()
    }

    /// Remove a job together with every task it owns.
    pub fn remove_job(&mut self, id: &Uuid) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        for task_id in self.job_tasks.remove(id).unwrap_or_default() {
            self.tasks.remove(&task_id);
        }
        Some(job)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Attach the expanded task set to its job. Tasks are only ever added once per job.
    pub fn add_tasks(&mut self, job_id: Uuid, tasks: Vec<Task>) {
        let ids = self.job_tasks.entry(job_id).or_default();
        for task in tasks {
            ids.push(task.id);
            self.tasks.insert(task.id, task);
        }
    }

    pub fn task(&self, id: &Uuid) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &Uuid) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn task_ids_for_job(&self, job_id: &Uuid) -> Vec<Uuid> {
        self.job_tasks.get(job_id).cloned().unwrap_or_default()
    }

    /// Tasks of a job in index order.
    pub fn tasks_for_job(&self, job_id: &Uuid) -> Vec<&Task> {
        self.job_tasks
            .get(job_id)
            .map(|ids| ids.iter().filter_map(|id| self.tasks.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn task_ids_with_status(&self, status: TaskStatus) -> Vec<Uuid> {
        self.tasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.id)
            .collect()
    }

    /// Tasks currently ASSIGNED/RUNNING on `worker_id`.
    pub fn task_ids_held_by(&self, worker_id: &str) -> Vec<Uuid> {
        self.tasks
            .values()
            .filter(|t| t.is_held_by(worker_id))
            .map(|t| t.id)
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Conditional claim: succeeds only if the task is still PENDING and the
    /// worker is known. Marks the task ASSIGNED and records it as the worker's
    /// current task in the same step.
    pub fn try_claim(&mut self, task_id: &Uuid, worker_id: &str, now: DateTime<Utc>) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };
        let Some(task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        if task.status != TaskStatus::Pending || task.claim(worker_id, now).is_err() {
            return false;
        }
        worker.current_task = Some(*task_id);
        true
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    pub fn upsert_worker(&mut self, worker: Worker) {
        self.workers.insert(worker.id.clone(), worker);
    }

    pub fn worker(&self, id: &str) -> Option<&Worker> {
        self.workers.get(id)
    }

    pub fn worker_mut(&mut self, id: &str) -> Option<&mut Worker> {
        self.workers.get_mut(id)
    }

    /// All workers sorted by id.
    pub fn workers(&self) -> Vec<&Worker> {
        let mut workers: Vec<&Worker> = self.workers.values().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub fn online_worker_ids(&self) -> Vec<String> {
        self.workers
            .values()
            .filter(|w| w.is_online())
            .map(|w| w.id.clone())
            .collect()
    }

    /// Forget `task_id` as the current task of whichever worker holds it.
    pub fn clear_current_task(&mut self, worker_id: &str, task_id: &Uuid) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            if worker.current_task == Some(*task_id) {
                worker.current_task = None;
            }
        }
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for status in JobStatus::ALL {
            stats.jobs.insert(status.to_string(), 0);
        }
        for status in TaskStatus::ALL {
            stats.tasks.insert(status.to_string(), 0);
        }
        for job in self.jobs.values() {
            *stats.jobs.entry(job.status.to_string()).or_default() += 1;
        }
        for task in self.tasks.values() {
            *stats.tasks.entry(task.status.to_string()).or_default() += 1;
        }
        for worker in self.workers.values() {
            match worker.status {
                WorkerStatus::Online => stats.workers_online += 1,
                WorkerStatus::Offline => stats.workers_offline += 1,
            }
        }
        stats
    }
}
