use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{RenderqError, Result};

/// Timing and retry settings for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period between two scheduler sweeps.
    pub poll_interval_ms: u64,
    /// A worker whose last heartbeat is older than this is declared offline.
    pub worker_timeout_ms: u64,
    /// Number of attempts a task gets before it is terminally failed.
    pub max_task_retries: u32,
    /// Submissions beyond this many stored jobs are rejected.
    pub max_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            worker_timeout_ms: 60_000,
            max_task_retries: 3,
            max_jobs: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_worker_timeout_ms(mut self, ms: u64) -> Self {
        self.worker_timeout_ms = ms;
        self
    }

    pub fn with_max_task_retries(mut self, retries: u32) -> Self {
        self.max_task_retries = retries;
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(RenderqError::Validation(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.worker_timeout_ms == 0 {
            return Err(RenderqError::Validation(
                "worker timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_task_retries == 0 {
            return Err(RenderqError::Validation(
                "max task retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration of the scheduler server process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub scheduler: SchedulerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Configuration of a worker agent.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the scheduler HTTP API.
    pub server_url: String,
    pub worker_id: String,
    /// Human readable name, defaults to the worker id.
    pub name: String,
    pub pools: Vec<String>,
    /// Plugin types this worker can execute.
    pub capabilities: Vec<String>,
    pub heartbeat_interval_ms: u64,
    pub task_poll_interval_ms: u64,
    /// Minimum spacing between two progress reports for the same task.
    pub progress_report_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let worker_id = uuid::Uuid::new_v4().to_string();
        Self {
            server_url: "http://127.0.0.1:8000".to_string(),
            name: worker_id.clone(),
            worker_id,
            pools: vec!["default".to_string()],
            capabilities: vec!["aftereffects".to_string()],
            heartbeat_interval_ms: 10_000,
            task_poll_interval_ms: 2000,
            progress_report_interval_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        let worker_id = worker_id.into();
        Self {
            name: worker_id.clone(),
            worker_id,
            ..Default::default()
        }
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pools.push(pool.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms)
    }

    pub fn progress_report_interval(&self) -> Duration {
        Duration::from_millis(self.progress_report_interval_ms)
    }

    /// The heartbeat interval must stay strictly below the server's worker timeout,
    /// otherwise a healthy worker flaps to offline between two beats.
    pub fn validate_against(&self, worker_timeout: Duration) -> Result<()> {
        if self.worker_id.is_empty() {
            return Err(RenderqError::Validation(
                "worker id must not be empty".to_string(),
            ));
        }
        if self.pools.is_empty() {
            return Err(RenderqError::Validation(
                "worker must belong to at least one pool".to_string(),
            ));
        }
        if self.heartbeat_interval() >= worker_timeout {
            return Err(RenderqError::Validation(format!(
                "heartbeat interval {}ms must be less than worker timeout {}ms",
                self.heartbeat_interval_ms,
                worker_timeout.as_millis()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.worker_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.max_task_retries, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn scheduler_config_rejects_zero_values() {
        assert!(SchedulerConfig::default()
            .with_poll_interval_ms(0)
            .validate()
            .is_err());
        assert!(SchedulerConfig::default()
            .with_worker_timeout_ms(0)
            .validate()
            .is_err());
        assert!(SchedulerConfig::default()
            .with_max_task_retries(0)
            .validate()
            .is_err());
    }

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:8000");
    }

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.pools, vec!["default".to_string()]);
        assert_eq!(cfg.capabilities, vec!["aftereffects".to_string()]);
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(cfg.task_poll_interval(), Duration::from_secs(2));
        assert_eq!(cfg.name, cfg.worker_id);
    }

    #[test]
    fn worker_config_builders() {
        let cfg = WorkerConfig::new("render-01")
            .with_pool("gpu")
            .with_capabilities(vec!["ffmpeg".to_string()]);
        assert_eq!(cfg.worker_id, "render-01");
        assert_eq!(cfg.pools, vec!["default".to_string(), "gpu".to_string()]);
        assert_eq!(cfg.capabilities, vec!["ffmpeg".to_string()]);
    }

    #[test]
    fn heartbeat_must_be_below_worker_timeout() {
        let cfg = WorkerConfig::new("w1");
        assert!(cfg.validate_against(Duration::from_secs(60)).is_ok());
        assert!(cfg.validate_against(Duration::from_secs(10)).is_err());
        assert!(cfg.validate_against(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn worker_without_pool_is_rejected() {
        let mut cfg = WorkerConfig::new("w1");
        cfg.pools.clear();
        assert!(cfg.validate_against(Duration::from_secs(60)).is_err());
    }
}
