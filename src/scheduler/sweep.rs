//! One pass of the scheduler loop.
//!
//! A sweep runs with exclusive access to the store and, in order:
//! 1. cancels the leftover tasks of CANCELLED and FAILED jobs,
//! 2. expands PENDING jobs into tasks through their plugin,
//! 3. declares silent workers OFFLINE and re-queues what they held,
//! 4. promotes retryable FAILED tasks back to PENDING,
//! 5. folds task states into job progress and terminal job states.
//!
//! Cancelling first means a job that is cancelled while one of its tasks runs
//! out of retries ends up CANCELLED, never FAILED.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::events::{EntityType, Event, EventBus};
use crate::plugin::{call_guarded, FailurePolicy, PluginError, PluginRegistry, RenderPlugin};
use crate::scheduler::job::{Job, JobFailure, JobStatus};
use crate::scheduler::store::StateStore;
use crate::scheduler::task::{Task, TaskStatus};

/// What a single sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub jobs_expanded: usize,
    pub jobs_rejected: usize,
    pub workers_offline: usize,
    pub tasks_released: usize,
    pub tasks_retried: usize,
    pub tasks_cancelled: usize,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    pub follow_up_jobs: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        *self == CycleReport::default()
    }
}

enum Dependencies {
    Ready,
    Waiting,
    Broken(JobFailure),
}

pub struct Sweep<'a> {
    store: &'a mut StateStore,
    plugins: &'a PluginRegistry,
    events: &'a EventBus,
    config: &'a SchedulerConfig,
    now: DateTime<Utc>,
    report: CycleReport,
}

impl<'a> Sweep<'a> {
    pub fn new(
        store: &'a mut StateStore,
        plugins: &'a PluginRegistry,
        events: &'a EventBus,
        config: &'a SchedulerConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            plugins,
            events,
            config,
            now,
            report: CycleReport::default(),
        }
    }

    pub fn run(mut self) -> CycleReport {
        self.cancel_abandoned_tasks();
        self.expand_pending_jobs();
        self.release_stale_workers();
        self.promote_retries();
        self.aggregate_jobs();
        self.report
    }

    // ------------------------------------------------------------------
    // Cancellation cascade
    // ------------------------------------------------------------------

    fn cancel_abandoned_tasks(&mut self) {
        let job_ids = self
            .store
            .job_ids_with_status(&[JobStatus::Cancelled, JobStatus::Failed]);
        for job_id in job_ids {
            self.cancel_tasks_of(&job_id);
        }
    }

    /// Move every task of `job_id` that could still change state to CANCELLED.
    fn cancel_tasks_of(&mut self, job_id: &Uuid) {
        let max_retries = self.config.max_task_retries;
        for task_id in self.store.task_ids_for_job(job_id) {
            let Some(task) = self.store.task_mut(&task_id) else {
                continue;
            };
            if task.is_terminal(max_retries) {
                continue;
            }
            let holder = task.assigned_worker.clone();
            if task.cancel(self.now).is_err() {
                continue;
            }
            if let Some(worker_id) = holder {
                self.store.clear_current_task(&worker_id, &task_id);
            }
            self.report.tasks_cancelled += 1;
            self.events
                .publish(Event::new(EntityType::Task, task_id, TaskStatus::Cancelled));
        }
    }

    // ------------------------------------------------------------------
    // Expansion
    // ------------------------------------------------------------------

    fn expand_pending_jobs(&mut self) {
        for job_id in self.store.job_ids_with_status(&[JobStatus::Pending]) {
            let Some(job) = self.store.job(&job_id).cloned() else {
                continue;
            };
            match self.check_dependencies(&job) {
                Dependencies::Waiting => continue,
                Dependencies::Broken(failure) => {
                    self.reject_job(&job_id, failure);
                    continue;
                }
                Dependencies::Ready => {}
            }

            let Some(plugin) = self.plugins.get(&job.plugin_type) else {
                self.reject_job(
                    &job_id,
                    JobFailure::Validation {
                        reason: format!("unknown plugin type '{}'", job.plugin_type),
                    },
                );
                continue;
            };

            match expand(plugin.as_ref(), &job, self.now) {
                Ok(tasks) => {
                    let count = tasks.len();
                    let task_ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
                    self.store.add_tasks(job_id, tasks);
                    if let Some(job) = self.store.job_mut(&job_id) {
                        job.task_total = count;
                        if let Err(e) = job.transition_to(JobStatus::Queued, self.now) {
                            warn!(job_id = %job_id, error = %e, "Expanded job could not be queued");
                            continue;
                        }
                    }
                    for task_id in task_ids {
                        self.events
                            .publish(Event::new(EntityType::Task, task_id, TaskStatus::Pending));
                    }
                    self.events
                        .publish(Event::new(EntityType::Job, job_id, JobStatus::Queued));
                    self.report.jobs_expanded += 1;
                    info!(job_id = %job_id, plugin = %job.plugin_type, tasks = count, "Job expanded");
                }
                Err(failure) => self.reject_job(&job_id, failure),
            }
        }
    }

    fn check_dependencies(&self, job: &Job) -> Dependencies {
        let mut waiting = false;
        for dep_id in &job.depends_on {
            match self.store.job(dep_id).map(|d| d.status) {
                None => {
                    return Dependencies::Broken(JobFailure::Dependency {
                        job_id: *dep_id,
                        reason: "dependency does not exist".to_string(),
                    })
                }
                Some(JobStatus::Completed) => {}
                Some(status @ (JobStatus::Failed | JobStatus::Cancelled)) => {
                    return Dependencies::Broken(JobFailure::Dependency {
                        job_id: *dep_id,
                        reason: format!("dependency is {status}"),
                    })
                }
                Some(_) => waiting = true,
            }
        }
        if waiting {
            Dependencies::Waiting
        } else {
            Dependencies::Ready
        }
    }

    fn reject_job(&mut self, job_id: &Uuid, failure: JobFailure) {
        warn!(job_id = %job_id, reason = %failure, "Job rejected at expansion");
        if self.terminate_job(job_id, failure) {
            self.report.jobs_rejected += 1;
        }
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    fn release_stale_workers(&mut self) {
        let timeout = self.config.worker_timeout();
        for worker_id in self.store.online_worker_ids() {
            let Some(worker) = self.store.worker_mut(&worker_id) else {
                continue;
            };
            if !worker.is_stale(self.now, timeout) {
                continue;
            }
            let last_heartbeat = worker.last_heartbeat;
            worker.mark_offline();
            self.report.workers_offline += 1;
            warn!(worker_id = %worker_id, last_heartbeat = %last_heartbeat, "Worker timed out, marking offline");
            self.events
                .publish(Event::new(EntityType::Worker, &worker_id, "offline"));

            for task_id in self.store.task_ids_held_by(&worker_id) {
                let Some(task) = self.store.task_mut(&task_id) else {
                    continue;
                };
                if task.release(self.now).is_ok() {
                    self.report.tasks_released += 1;
                    info!(task_id = %task_id, worker_id = %worker_id, "Task re-queued after worker timeout");
                    self.events
                        .publish(Event::new(EntityType::Task, task_id, TaskStatus::Pending));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Retries
    // ------------------------------------------------------------------

    fn promote_retries(&mut self) {
        let max_retries = self.config.max_task_retries;
        for task_id in self.store.task_ids_with_status(TaskStatus::Failed) {
            let Some(job_id) = self.store.task(&task_id).map(|t| t.job_id) else {
                continue;
            };
            let job_live = self.store.job(&job_id).is_some_and(|j| {
                matches!(
                    j.status,
                    JobStatus::Queued | JobStatus::Active | JobStatus::Suspended
                )
            });
            if !job_live {
                continue;
            }
            let Some(task) = self.store.task_mut(&task_id) else {
                continue;
            };
            if task.retry(max_retries, self.now).is_ok() {
                self.report.tasks_retried += 1;
                debug!(task_id = %task_id, attempts = task.attempts, "Task scheduled for retry");
                self.events
                    .publish(Event::new(EntityType::Task, task_id, TaskStatus::Pending));
            }
        }
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    fn aggregate_jobs(&mut self) {
        let max_retries = self.config.max_task_retries;
        for job_id in self
            .store
            .job_ids_with_status(&[JobStatus::Queued, JobStatus::Active])
        {
            let tasks = self.store.tasks_for_job(&job_id);
            if tasks.is_empty() {
                continue;
            }
            let total = tasks.len();
            let progress = tasks.iter().map(|t| t.progress).sum::<f64>() / total as f64;
            let completed = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .count();
            let exhausted: Vec<&Task> = tasks
                .iter()
                .copied()
                .filter(|t| t.is_exhausted(max_retries))
                .collect();
            let all_terminal = tasks.iter().all(|t| t.is_terminal(max_retries));
            let last_exhausted = exhausted
                .iter()
                .max_by_key(|t| (t.updated_at, t.index))
                .map(|t| JobFailure::RetryExhausted {
                    task_id: t.id,
                    task_index: t.index,
                    attempts: t.attempts,
                    error: t.last_error.clone().unwrap_or_default(),
                });
            let exhausted_count = exhausted.len();

            let policy = self
                .store
                .job(&job_id)
                .and_then(|j| self.plugins.get(&j.plugin_type))
                .map(|p| p.failure_policy())
                .unwrap_or_default();

            let Some(job) = self.store.job_mut(&job_id) else {
                continue;
            };
            job.task_completed = completed;
            job.task_failed = exhausted_count;
            let progress_changed = (job.progress - progress).abs() > f64::EPSILON;
            if progress_changed {
                job.progress = progress;
                job.updated_at = self.now;
            }

            if completed == total {
                self.complete_job(&job_id);
                continue;
            }
            let fail_now = match policy {
                FailurePolicy::FailJob => last_exhausted.is_some(),
                FailurePolicy::ContinueJob => all_terminal && last_exhausted.is_some(),
            };
            if let (true, Some(failure)) = (fail_now, last_exhausted) {
                warn!(job_id = %job_id, reason = %failure, "Job failed");
                self.fail_job(&job_id, failure);
                continue;
            }
            if progress_changed {
                let status = self
                    .store
                    .job(&job_id)
                    .map(|j| j.status)
                    .unwrap_or(JobStatus::Active);
                self.events
                    .publish(Event::new(EntityType::Job, job_id, status).with_progress(progress));
            }
        }
    }

    fn complete_job(&mut self, job_id: &Uuid) {
        let Some(job) = self.store.job_mut(job_id) else {
            return;
        };
        if let Err(e) = job.transition_to(JobStatus::Completed, self.now) {
            warn!(job_id = %job_id, error = %e, "Cannot complete job");
            return;
        }
        let job = job.clone();
        self.report.jobs_completed += 1;
        info!(job_id = %job_id, name = %job.name, "Job completed");
        self.events
            .publish(Event::new(EntityType::Job, job_id, JobStatus::Completed).with_progress(1.0));
        self.submit_follow_ups(&job);
    }

    fn submit_follow_ups(&mut self, job: &Job) {
        let Some(plugin) = self.plugins.get(&job.plugin_type) else {
            return;
        };
        let follow_ups = match call_guarded(|| Ok(plugin.follow_up_jobs(job))) {
            Ok(follow_ups) => follow_ups,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Follow-up job creation failed");
                return;
            }
        };
        for submission in follow_ups {
            if let Err(e) = submission.validate() {
                warn!(job_id = %job.id, error = %e, "Skipping invalid follow-up job");
                continue;
            }
            let follow_up = Job::with_id(Uuid::new_v4(), submission, self.now);
            let follow_up_id = follow_up.id;
            if !self.store.add_job(follow_up) {
                warn!(job_id = %job.id, "Job store full, dropping follow-up job");
                break;
            }
            self.report.follow_up_jobs += 1;
            info!(job_id = %follow_up_id, parent = %job.id, "Follow-up job submitted");
            self.events
                .publish(Event::new(EntityType::Job, follow_up_id, JobStatus::Pending));
        }
    }

    /// A job that ran and failed.
    fn fail_job(&mut self, job_id: &Uuid, failure: JobFailure) {
        if self.terminate_job(job_id, failure) {
            self.report.jobs_failed += 1;
        }
    }

    /// Move a job to FAILED and cancel whatever of its work is still
    /// outstanding. Returns false if the job could not be failed.
    fn terminate_job(&mut self, job_id: &Uuid, failure: JobFailure) -> bool {
        let Some(job) = self.store.job_mut(job_id) else {
            return false;
        };
        let message = failure.to_string();
        if let Err(e) = job.fail(failure, self.now) {
            warn!(job_id = %job_id, error = %e, "Cannot fail job");
            return false;
        }
        self.events
            .publish(Event::new(EntityType::Job, job_id, JobStatus::Failed).with_message(message));
        self.cancel_tasks_of(job_id);
        true
    }
}

/// Validate a job and build its tasks, isolating the plugin's failures.
fn expand(
    plugin: &dyn RenderPlugin,
    job: &Job,
    now: DateTime<Utc>,
) -> Result<Vec<Task>, JobFailure> {
    let failure = |e: PluginError| match e {
        PluginError::InvalidParams(reason) => JobFailure::Validation { reason },
        other => JobFailure::Plugin {
            reason: other.to_string(),
        },
    };

    call_guarded(|| plugin.validate(&job.params)).map_err(failure)?;
    let specs = call_guarded(|| plugin.create_tasks(job)).map_err(failure)?;
    if specs.is_empty() {
        return Err(JobFailure::Validation {
            reason: "plugin produced no tasks".to_string(),
        });
    }

    let mut tasks = Vec::with_capacity(specs.len());
    for (index, spec) in specs.into_iter().enumerate() {
        let mut task = Task::from_spec(job.id, index as u32, spec, now);
        task.command = call_guarded(|| plugin.build_command(&task, job)).map_err(failure)?;
        tasks.push(task);
    }
    Ok(tasks)
}
