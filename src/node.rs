use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::http;
use crate::config::ServerConfig;
use crate::events::EventBus;
use crate::plugin::PluginRegistry;
use crate::scheduler::Scheduler;

/// The scheduler server process: the periodic sweep plus the HTTP API.
pub struct ServerNode {
    pub config: ServerConfig,
    pub scheduler: Scheduler,
}

impl ServerNode {
    /// Server with the built-in plugins and a fresh event bus.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_plugins(config, PluginRegistry::with_builtin())
    }

    pub fn with_plugins(config: ServerConfig, plugins: PluginRegistry) -> Self {
        let scheduler = Scheduler::new(config.scheduler.clone(), plugins, EventBus::new());
        Self { config, scheduler }
    }

    /// Bind `config.listen_addr` and run until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler configuration is invalid, the
    /// listener cannot be bound, or the HTTP server fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Like [`ServerNode::run`] on an already bound listener (port 0 in tests).
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.config.scheduler.validate()?;
        let addr: SocketAddr = listener.local_addr()?;

        tracing::info!(
            addr = %addr,
            poll_interval_ms = self.config.scheduler.poll_interval_ms,
            worker_timeout_ms = self.config.scheduler.worker_timeout_ms,
            max_task_retries = self.config.scheduler.max_task_retries,
            plugins = ?self.scheduler.plugins().names(),
            "Starting renderq server"
        );

        let loop_scheduler = self.scheduler.clone();
        let loop_shutdown = shutdown.clone();
        let loop_handle = tokio::spawn(async move {
            loop_scheduler.run(loop_shutdown).await;
        });

        let served = http::serve(listener, self.scheduler.clone(), shutdown.clone()).await;

        // The HTTP server can also stop on its own error; take the loop down with it.
        shutdown.cancel();
        if let Err(e) = loop_handle.await {
            tracing::error!(error = %e, "Scheduler loop task failed");
        }
        served?;

        tracing::info!("Server stopped");
        Ok(())
    }
}
