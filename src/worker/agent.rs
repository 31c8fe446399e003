use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::{ExecutionStatus, TaskExecutor};
use super::heartbeat::HeartbeatSender;
use crate::api::{Assignment, ProgressReport, ReportAck, ResultReport, SchedulerApi, TaskOutcome};
use crate::config::WorkerConfig;
use crate::error::{RenderqError, Result};
use crate::plugin::{call_guarded, PluginRegistry, RenderPlugin};
use crate::scheduler::worker::WorkerRegistration;

/// How handling one assignment ended, from the worker's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRun {
    /// The outcome was reported and accepted.
    Reported(TaskOutcome),
    /// The scheduler no longer wanted the task, or the worker shut down.
    Abandoned,
}

/// Pull-based worker: registers, heartbeats, and runs one task at a time.
pub struct WorkerAgent<C: SchedulerApi + ?Sized> {
    client: Arc<C>,
    config: WorkerConfig,
    plugins: Arc<PluginRegistry>,
    executor: TaskExecutor,
}

impl<C: SchedulerApi + ?Sized + 'static> WorkerAgent<C> {
    pub fn new(client: Arc<C>, config: WorkerConfig, plugins: PluginRegistry) -> Self {
        Self {
            client,
            config,
            plugins: Arc::new(plugins),
            executor: TaskExecutor::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn registration(&self) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: self.config.worker_id.clone(),
            name: Some(self.config.name.clone()),
            pools: self.config.pools.clone(),
            capabilities: self.config.capabilities.clone(),
        }
    }

    /// Register, retrying every poll interval until it succeeds or `shutdown` fires.
    async fn register(&self, shutdown: &CancellationToken) -> Result<()> {
        loop {
            match self.client.register_worker(self.registration()).await {
                Ok(worker) => {
                    info!(
                        worker_id = %worker.id,
                        pools = ?worker.pools,
                        capabilities = ?worker.capabilities,
                        "Registered with scheduler"
                    );
                    return Ok(());
                }
                Err(e @ RenderqError::Validation(_)) => return Err(e),
                Err(e) => warn!(worker_id = %self.worker_id(), error = %e, "Registration failed, retrying"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return Err(RenderqError::Internal("shutdown before registration".to_string()))
                }
                _ = tokio::time::sleep(self.config.task_poll_interval()) => {}
            }
        }
    }

    /// Main loop: heartbeat in the background, poll for work while idle.
    ///
    /// Returns once `shutdown` fires. A task running at that moment is killed
    /// and not reported; the scheduler re-queues it when this worker registers
    /// again or times out.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.register(&shutdown).await?;

        let heartbeat = HeartbeatSender::new(self.config.heartbeat_interval());
        let hb_client = self.client.clone();
        let hb_registration = self.registration();
        let hb_shutdown = shutdown.child_token();
        let heartbeat_handle = tokio::spawn(async move {
            heartbeat.run(hb_client, hb_registration, hb_shutdown).await;
        });

        let mut poll = tokio::time::interval(self.config.task_poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {}
            }

            match self.client.request_task(self.worker_id()).await {
                Ok(Some(assignment)) => {
                    self.run_assignment(assignment, &shutdown).await;
                    // Ask again right away; a busy queue should not wait a full interval.
                    poll.reset_immediately();
                }
                Ok(None) => debug!(worker_id = %self.worker_id(), "No work available"),
                Err(RenderqError::WorkerNotFound(_)) => {
                    info!(worker_id = %self.worker_id(), "Scheduler does not know this worker, registering again");
                    self.register(&shutdown).await?;
                }
                Err(e) => warn!(worker_id = %self.worker_id(), error = %e, "Task request failed"),
            }
        }

        let _ = heartbeat_handle.await;
        info!(worker_id = %self.worker_id(), "Worker stopped");
        Ok(())
    }

    /// The argv to run: built by the local plugin if there is one, otherwise
    /// the command the scheduler built at expansion time.
    fn resolve_command(
        &self,
        plugin: Option<&Arc<dyn RenderPlugin>>,
        assignment: &Assignment,
    ) -> std::result::Result<Vec<String>, String> {
        if let Some(plugin) = plugin {
            match call_guarded(|| plugin.build_command(&assignment.task, &assignment.job)) {
                Ok(argv) if !argv.is_empty() => return Ok(argv),
                Ok(_) => {}
                Err(e) if assignment.task.command.is_empty() => return Err(e.to_string()),
                Err(e) => {
                    warn!(task_id = %assignment.task.id, error = %e, "Local command build failed, using scheduler command")
                }
            }
        }
        if assignment.task.command.is_empty() {
            Err(format!(
                "no command for plugin '{}' on this worker",
                assignment.job.plugin_type
            ))
        } else {
            Ok(assignment.task.command.clone())
        }
    }

    /// Execute one assignment and report its outcome.
    ///
    /// Progress is parsed from every output line but reported at most once
    /// per `progress_report_interval`. Any report answered with something
    /// other than [`ReportAck::Accepted`] kills the process and abandons the
    /// task without reporting a result.
    pub async fn run_assignment(
        &self,
        assignment: Assignment,
        shutdown: &CancellationToken,
    ) -> TaskRun {
        let task_id = assignment.task.id;
        let worker_id = self.worker_id().to_string();
        let plugin = self.plugins.get(&assignment.job.plugin_type);

        let argv = match self.resolve_command(plugin.as_ref(), &assignment) {
            Ok(argv) => argv,
            Err(reason) => {
                warn!(task_id = %task_id, reason = %reason, "Cannot run task");
                return self.report(task_id, TaskOutcome::Failure(reason)).await;
            }
        };

        match self.client.report_started(task_id, &worker_id).await {
            Ok(ReportAck::Accepted) => {}
            Ok(ack) => {
                info!(task_id = %task_id, ?ack, "Task withdrawn before start");
                return TaskRun::Abandoned;
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Start report failed");
                return TaskRun::Abandoned;
            }
        }
        info!(task_id = %task_id, job_id = %assignment.job.id, "Task started");

        let cancel = shutdown.child_token();
        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        let executor = self.executor.clone();
        let exec_cancel = cancel.clone();
        let exec_argv = argv.clone();
        let handle = tokio::spawn(async move {
            executor
                .execute(task_id, &exec_argv, line_tx, exec_cancel)
                .await
        });

        let throttle = self.config.progress_report_interval();
        let mut last_report: Option<Instant> = None;
        let mut withdrawn = false;
        while let Some(line) = line_rx.recv().await {
            tracing::trace!(task_id = %task_id, line = %line, "Task output");
            if withdrawn {
                continue;
            }
            let Some(progress) = plugin.as_ref().and_then(|p| {
                call_guarded(|| Ok(p.parse_progress(&line, &assignment.task)))
                    .ok()
                    .flatten()
            }) else {
                continue;
            };
            if last_report.is_some_and(|at| at.elapsed() < throttle) {
                continue;
            }
            last_report = Some(Instant::now());
            let report = ProgressReport {
                worker_id: worker_id.clone(),
                progress,
                message: Some(line),
            };
            match self.client.report_progress(task_id, report).await {
                Ok(ReportAck::Accepted) => {}
                Ok(ack) => {
                    info!(task_id = %task_id, ?ack, "Task withdrawn, stopping process");
                    withdrawn = true;
                    cancel.cancel();
                }
                Err(e) => warn!(task_id = %task_id, error = %e, "Progress report failed"),
            }
        }

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                return self
                    .report(task_id, TaskOutcome::Failure(format!("executor panicked: {e}")))
                    .await
            }
        };
        if withdrawn || result.status == ExecutionStatus::Cancelled {
            return TaskRun::Abandoned;
        }
        match result.outcome() {
            Some(outcome) => self.report(task_id, outcome).await,
            None => TaskRun::Abandoned,
        }
    }

    async fn report(&self, task_id: uuid::Uuid, outcome: TaskOutcome) -> TaskRun {
        let report = ResultReport {
            worker_id: self.worker_id().to_string(),
            outcome: outcome.clone(),
        };
        match self.client.report_result(task_id, report).await {
            Ok(ReportAck::Accepted) => {
                info!(task_id = %task_id, ?outcome, "Task result reported");
                TaskRun::Reported(outcome)
            }
            Ok(ack) => {
                info!(task_id = %task_id, ?ack, "Task result not accepted");
                TaskRun::Abandoned
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Result report failed");
                TaskRun::Abandoned
            }
        }
    }
}
