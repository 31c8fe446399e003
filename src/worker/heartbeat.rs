use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::SchedulerApi;
use crate::error::RenderqError;
use crate::scheduler::worker::WorkerRegistration;

/// Periodically tells the scheduler this worker is alive.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Send heartbeats until `shutdown` fires.
    ///
    /// If the scheduler no longer knows this worker (it restarted and lost its
    /// state) the worker registers again. Transport errors are logged and the
    /// next tick simply tries again.
    pub async fn run<C: SchedulerApi + ?Sized>(
        &self,
        client: Arc<C>,
        registration: WorkerRegistration,
        shutdown: CancellationToken,
    ) {
        let worker_id = registration.worker_id.clone();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match client.heartbeat(&worker_id).await {
                Ok(()) => tracing::trace!(worker_id = %worker_id, "Heartbeat sent"),
                Err(RenderqError::WorkerNotFound(_)) => {
                    tracing::info!(worker_id = %worker_id, "Scheduler lost this worker, registering again");
                    if let Err(e) = client.register_worker(registration.clone()).await {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Re-registration failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(worker_id = %worker_id, error = %e, "Heartbeat failed");
                }
            }
        }
        tracing::debug!(worker_id = %worker_id, "Heartbeat stopped");
    }
}
