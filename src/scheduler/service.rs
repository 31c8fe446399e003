use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{Assignment, ProgressReport, ReportAck, ResultReport, TaskOutcome};
use crate::config::SchedulerConfig;
use crate::error::{RenderqError, Result};
use crate::events::{EntityType, Event, EventBus};
use crate::plugin::{PluginInfo, PluginRegistry};
use crate::scheduler::assigner;
use crate::scheduler::job::{validate_priority, Job, JobFilter, JobStatus, JobSubmission};
use crate::scheduler::store::{StateStore, StoreStats};
use crate::scheduler::sweep::{CycleReport, Sweep};
use crate::scheduler::task::{Task, TaskStatus};
use crate::scheduler::worker::{Worker, WorkerRegistration};

/// Where a worker report stands before it is applied.
enum ReportGate {
    Live,
    Stale,
    Cancelled,
}

/// The scheduling core.
///
/// Cheap to clone; every clone shares the same store, plugin registry and
/// event bus. Client and worker operations may be called concurrently from
/// any number of tasks. Each one runs under a single store write guard, so a
/// claim is never observed half-done.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<RwLock<StateStore>>,
    plugins: Arc<PluginRegistry>,
    events: EventBus,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, plugins: PluginRegistry, events: EventBus) -> Self {
        let store = StateStore::with_capacity(config.max_jobs);
        Self {
            store: Arc::new(RwLock::new(store)),
            plugins: Arc::new(plugins),
            events,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    pub fn store(&self) -> Arc<RwLock<StateStore>> {
        self.store.clone()
    }

    // ==================================================================
    // Jobs
    // ==================================================================

    /// Record a new PENDING job.
    ///
    /// Only the request shape is checked here. Whether the plugin accepts the
    /// parameters is decided by the next scheduler cycle, which fails the job
    /// if they are rejected.
    pub async fn submit_job(&self, submission: JobSubmission) -> Result<Uuid> {
        submission.validate()?;
        let job = Job::new(submission);
        let job_id = job.id;
        let (name, plugin) = (job.name.clone(), job.plugin_type.clone());

        let mut store = self.store.write().await;
        if !store.add_job(job) {
            warn!(job_id = %job_id, "Job queue at capacity, rejecting submission");
            return Err(RenderqError::QueueFull);
        }
        self.events
            .publish(Event::new(EntityType::Job, job_id, JobStatus::Pending));
        info!(job_id = %job_id, name = %name, plugin = %plugin, "Job submitted");
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        let store = self.store.read().await;
        store
            .job(&job_id)
            .cloned()
            .ok_or(RenderqError::JobNotFound(job_id))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        let store = self.store.read().await;
        store.list_jobs(filter).into_iter().cloned().collect()
    }

    /// Tasks of a job in index order.
    pub async fn get_job_tasks(&self, job_id: Uuid) -> Result<Vec<Task>> {
        let store = self.store.read().await;
        if store.job(&job_id).is_none() {
            return Err(RenderqError::JobNotFound(job_id));
        }
        Ok(store.tasks_for_job(&job_id).into_iter().cloned().collect())
    }

    /// Mark a job CANCELLED. Its tasks are cancelled by the next cycle; until
    /// then, workers reporting on them are told to stop.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job> {
        self.set_job_status(job_id, |_| JobStatus::Cancelled).await
    }

    /// Stop handing out tasks of a QUEUED or ACTIVE job. Tasks already
    /// running keep running and may still complete.
    pub async fn suspend_job(&self, job_id: Uuid) -> Result<Job> {
        self.set_job_status(job_id, |_| JobStatus::Suspended).await
    }

    pub async fn resume_job(&self, job_id: Uuid) -> Result<Job> {
        self.set_job_status(job_id, |job| {
            if job.status == JobStatus::Suspended {
                job.resume_target()
            } else {
                // Let the state machine reject it.
                JobStatus::Queued
            }
        })
        .await
    }

    async fn set_job_status(
        &self,
        job_id: Uuid,
        target: impl FnOnce(&Job) -> JobStatus,
    ) -> Result<Job> {
        let now = Utc::now();
        let mut store = self.store.write().await;
        let job = store
            .job_mut(&job_id)
            .ok_or(RenderqError::JobNotFound(job_id))?;
        let next = target(job);
        job.transition_to(next, now)?;
        info!(job_id = %job_id, status = %next, "Job status changed");
        self.events.publish(Event::new(EntityType::Job, job_id, next));
        Ok(job.clone())
    }

    pub async fn update_job_priority(&self, job_id: Uuid, priority: i32) -> Result<Job> {
        validate_priority(priority)?;
        let mut store = self.store.write().await;
        let job = store
            .job_mut(&job_id)
            .ok_or(RenderqError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Err(RenderqError::invalid_transition(
                "job",
                job.status,
                "priority change",
            ));
        }
        job.priority = priority;
        job.updated_at = Utc::now();
        info!(job_id = %job_id, priority, "Job priority updated");
        Ok(job.clone())
    }

    /// Remove a finished job and all of its tasks.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        let mut store = self.store.write().await;
        let job = store.job(&job_id).ok_or(RenderqError::JobNotFound(job_id))?;
        if !job.status.is_terminal() {
            return Err(RenderqError::invalid_transition("job", job.status, "deleted"));
        }
        let holders: Vec<(String, Uuid)> = store
            .tasks_for_job(&job_id)
            .into_iter()
            .filter_map(|t| t.assigned_worker.clone().map(|w| (w, t.id)))
            .collect();
        for (worker_id, task_id) in holders {
            store.clear_current_task(&worker_id, &task_id);
        }
        store.remove_job(&job_id);
        info!(job_id = %job_id, "Job deleted");
        Ok(())
    }

    // ==================================================================
    // Workers
    // ==================================================================

    /// Register a worker, or refresh an existing one.
    ///
    /// A worker that registers again has restarted, so whatever it held is
    /// returned to PENDING without touching the retry budget.
    pub async fn register_worker(&self, registration: WorkerRegistration) -> Result<Worker> {
        registration.validate()?;
        let now = Utc::now();
        let worker_id = registration.worker_id.clone();
        let mut store = self.store.write().await;

        let worker = match store.worker_mut(&worker_id) {
            Some(existing) => {
                existing.update_registration(registration, now);
                existing.current_task = None;
                let worker = existing.clone();
                for task_id in store.task_ids_held_by(&worker_id) {
                    if let Some(task) = store.task_mut(&task_id) {
                        if task.release(now).is_ok() {
                            info!(task_id = %task_id, worker_id = %worker_id, "Task re-queued after worker re-registration");
                            self.events.publish(Event::new(
                                EntityType::Task,
                                task_id,
                                TaskStatus::Pending,
                            ));
                        }
                    }
                }
                info!(worker_id = %worker_id, "Worker re-registered");
                worker
            }
            None => {
                let worker = Worker::new(registration, now);
                store.upsert_worker(worker.clone());
                info!(
                    worker_id = %worker_id,
                    pools = ?worker.pools,
                    capabilities = ?worker.capabilities,
                    "Worker registered"
                );
                worker
            }
        };
        self.events
            .publish(Event::new(EntityType::Worker, &worker_id, worker.status));
        Ok(worker)
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let mut store = self.store.write().await;
        let worker = store
            .worker_mut(worker_id)
            .ok_or_else(|| RenderqError::WorkerNotFound(worker_id.to_string()))?;
        if worker.heartbeat(Utc::now()) {
            info!(worker_id = %worker_id, "Worker back online");
            self.events
                .publish(Event::new(EntityType::Worker, worker_id, worker.status));
        }
        Ok(())
    }

    /// Stop handing new tasks to a worker. A task it already holds runs on.
    pub async fn disable_worker(&self, worker_id: &str) -> Result<Worker> {
        self.set_worker_enabled(worker_id, false).await
    }

    pub async fn enable_worker(&self, worker_id: &str) -> Result<Worker> {
        self.set_worker_enabled(worker_id, true).await
    }

    async fn set_worker_enabled(&self, worker_id: &str, enabled: bool) -> Result<Worker> {
        let mut store = self.store.write().await;
        let worker = store
            .worker_mut(worker_id)
            .ok_or_else(|| RenderqError::WorkerNotFound(worker_id.to_string()))?;
        if worker.enabled != enabled {
            worker.enabled = enabled;
            let state = if enabled { "enabled" } else { "disabled" };
            info!(worker_id = %worker_id, state, "Worker availability changed by operator");
            self.events
                .publish(Event::new(EntityType::Worker, worker_id, state));
        }
        Ok(worker.clone())
    }

    pub async fn list_workers(&self) -> Vec<Worker> {
        let store = self.store.read().await;
        store.workers().into_iter().cloned().collect()
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Worker> {
        let store = self.store.read().await;
        store
            .worker(worker_id)
            .cloned()
            .ok_or_else(|| RenderqError::WorkerNotFound(worker_id.to_string()))
    }

    // ==================================================================
    // Assignment
    // ==================================================================

    /// Hand `worker_id` at most one task.
    ///
    /// Selection and claim happen under one write guard, so two concurrent
    /// requests can never receive the same task. A worker that still holds a
    /// task (its previous response was lost) gets that same task again.
    /// Returns `Ok(None)` when nothing is eligible, which is the normal idle
    /// case.
    pub async fn request_task(&self, worker_id: &str) -> Result<Option<Assignment>> {
        let now = Utc::now();
        let mut store = self.store.write().await;
        let worker = store
            .worker(worker_id)
            .ok_or_else(|| RenderqError::WorkerNotFound(worker_id.to_string()))?
            .clone();

        if !worker.is_online() {
            debug!(worker_id = %worker_id, "Offline worker asked for work");
            return Ok(None);
        }

        if let Some(task_id) = worker.current_task {
            if let Some(task) = store.task(&task_id).filter(|t| t.is_held_by(worker_id)) {
                debug!(worker_id = %worker_id, task_id = %task_id, "Re-delivering held task");
                return Ok(assignment(&store, task));
            }
        }

        if !worker.enabled {
            debug!(worker_id = %worker_id, "Disabled worker asked for work");
            return Ok(None);
        }

        let Some(task_id) = assigner::select_task(&store, &worker) else {
            debug!(worker_id = %worker_id, "No task available");
            return Ok(None);
        };
        if !store.try_claim(&task_id, worker_id, now) {
            debug!(worker_id = %worker_id, task_id = %task_id, "Lost assignment race");
            return Ok(None);
        }

        let Some(job_id) = store.task(&task_id).map(|t| t.job_id) else {
            return Ok(None);
        };
        if let Some(job) = store.job_mut(&job_id) {
            if job.status == JobStatus::Queued {
                job.transition_to(JobStatus::Active, now)?;
                self.events
                    .publish(Event::new(EntityType::Job, job_id, JobStatus::Active));
            }
        }
        self.events.publish(
            Event::new(EntityType::Task, task_id, TaskStatus::Assigned)
                .with_message(format!("assigned to {worker_id}")),
        );
        info!(task_id = %task_id, job_id = %job_id, worker_id = %worker_id, "Task assigned");

        Ok(store.task(&task_id).and_then(|task| assignment(&store, task)))
    }

    // ==================================================================
    // Reports
    // ==================================================================

    /// Decide whether a report from `worker_id` about `task_id` may be applied.
    ///
    /// A task whose job was cancelled or failed is cancelled here, so the
    /// reporting worker learns about it right away instead of at the next
    /// cycle.
    fn gate_report(
        &self,
        store: &mut StateStore,
        task_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ReportGate> {
        let task = store
            .task(&task_id)
            .ok_or(RenderqError::TaskNotFound(task_id))?;
        if task.status == TaskStatus::Cancelled {
            return Ok(ReportGate::Cancelled);
        }
        if !task.is_held_by(worker_id) {
            debug!(task_id = %task_id, worker_id = %worker_id, status = %task.status, "Ignoring stale report");
            return Ok(ReportGate::Stale);
        }
        let job_abandoned = store.job(&task.job_id).is_none_or(|job| {
            matches!(job.status, JobStatus::Cancelled | JobStatus::Failed)
        });
        if !job_abandoned {
            return Ok(ReportGate::Live);
        }

        if let Some(task) = store.task_mut(&task_id) {
            task.cancel(now)?;
        }
        store.clear_current_task(worker_id, &task_id);
        info!(task_id = %task_id, worker_id = %worker_id, "Task cancelled, telling worker to stop");
        self.events
            .publish(Event::new(EntityType::Task, task_id, TaskStatus::Cancelled));
        Ok(ReportGate::Cancelled)
    }

    /// The worker launched the task's process: ASSIGNED -> RUNNING.
    pub async fn report_started(&self, task_id: Uuid, worker_id: &str) -> Result<ReportAck> {
        let now = Utc::now();
        let mut store = self.store.write().await;
        match self.gate_report(&mut store, task_id, worker_id, now)? {
            ReportGate::Stale => return Ok(ReportAck::Stale),
            ReportGate::Cancelled => return Ok(ReportAck::Cancelled),
            ReportGate::Live => {}
        }
        let task = store
            .task_mut(&task_id)
            .ok_or(RenderqError::TaskNotFound(task_id))?;
        if task.status == TaskStatus::Assigned {
            task.start(now)?;
            self.events
                .publish(Event::new(EntityType::Task, task_id, TaskStatus::Running));
            debug!(task_id = %task_id, worker_id = %worker_id, "Task started");
        }
        Ok(ReportAck::Accepted)
    }

    /// Record progress for a held task. Never changes the task's state.
    pub async fn report_progress(&self, task_id: Uuid, report: ProgressReport) -> Result<ReportAck> {
        if report.progress.is_nan() {
            return Err(RenderqError::Validation("progress must be a number".to_string()));
        }
        let now = Utc::now();
        let mut store = self.store.write().await;
        match self.gate_report(&mut store, task_id, &report.worker_id, now)? {
            ReportGate::Stale => return Ok(ReportAck::Stale),
            ReportGate::Cancelled => return Ok(ReportAck::Cancelled),
            ReportGate::Live => {}
        }
        let task = store
            .task_mut(&task_id)
            .ok_or(RenderqError::TaskNotFound(task_id))?;
        task.record_progress(report.progress, now)?;

        let mut event =
            Event::new(EntityType::Task, task_id, task.status).with_progress(task.progress);
        if let Some(message) = report.message {
            event = event.with_message(message);
        }
        self.events.publish(event);
        Ok(ReportAck::Accepted)
    }

    /// Apply the terminal outcome of one attempt.
    ///
    /// Reports for tasks the worker no longer holds are acknowledged as
    /// [`ReportAck::Stale`] and change nothing, which makes duplicates and
    /// late reports after a liveness timeout harmless.
    pub async fn report_result(&self, task_id: Uuid, report: ResultReport) -> Result<ReportAck> {
        let now = Utc::now();
        let worker_id = report.worker_id;
        let mut store = self.store.write().await;
        match self.gate_report(&mut store, task_id, &worker_id, now)? {
            ReportGate::Stale => {
                info!(task_id = %task_id, worker_id = %worker_id, "Late result ignored");
                return Ok(ReportAck::Stale);
            }
            ReportGate::Cancelled => return Ok(ReportAck::Cancelled),
            ReportGate::Live => {}
        }
        let task = store
            .task_mut(&task_id)
            .ok_or(RenderqError::TaskNotFound(task_id))?;

        let event = match report.outcome {
            TaskOutcome::Success => {
                task.complete(now)?;
                info!(task_id = %task_id, worker_id = %worker_id, "Task completed");
                Event::new(EntityType::Task, task_id, TaskStatus::Completed).with_progress(1.0)
            }
            TaskOutcome::Failure(reason) => {
                task.fail(reason.clone(), now)?;
                warn!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    attempts = task.attempts,
                    error = %reason,
                    "Task failed"
                );
                Event::new(EntityType::Task, task_id, TaskStatus::Failed).with_message(reason)
            }
        };
        store.clear_current_task(&worker_id, &task_id);
        self.events.publish(event);
        Ok(ReportAck::Accepted)
    }

    // ==================================================================
    // Catalogue
    // ==================================================================

    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        self.plugins.list()
    }

    pub async fn stats(&self) -> StoreStats {
        self.store.read().await.stats()
    }

    // ==================================================================
    // Scheduler loop
    // ==================================================================

    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one sweep as if the current time were `now`.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        let mut store = self.store.write().await;
        let report = Sweep::new(&mut store, &self.plugins, &self.events, &self.config, now).run();
        if !report.is_idle() {
            debug!(?report, "Scheduler cycle");
        }
        report
    }

    /// Run sweeps every `poll_interval` until `shutdown` fires.
    ///
    /// Ticks that fall behind are delayed rather than bunched up, so two
    /// sweeps never overlap and never run back to back.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            worker_timeout_ms = self.config.worker_timeout_ms,
            max_task_retries = self.config.max_task_retries,
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
            }
        }
        info!("Scheduler loop stopped");
    }
}

fn assignment(store: &StateStore, task: &Task) -> Option<Assignment> {
    let job = store.job(&task.job_id)?;
    Some(Assignment {
        task: task.clone(),
        job: job.clone(),
    })
}
