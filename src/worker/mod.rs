//! Worker agent: the process that actually runs renders.
//!
//! A worker registers with the scheduler, then runs a few independent
//! activities:
//! - **Heartbeat**: [`HeartbeatSender`] keeps the worker ONLINE and
//!   re-registers if the scheduler forgot it.
//! - **Task polling**: while idle, [`WorkerAgent`] asks for one task per
//!   poll interval.
//! - **Execution**: [`TaskExecutor`] runs the task's command line and streams
//!   its output back over a channel, where the plugin parses progress.
//!
//! # Execution Flow
//!
//! 1. `request_task` returns an [`Assignment`](crate::api::Assignment)
//! 2. The local plugin builds the argv (falling back to the scheduler's copy)
//! 3. `report_started`, then the process is spawned
//! 4. Output lines become throttled `report_progress` calls
//! 5. Exit status (and the last output lines on failure) become `report_result`
//!
//! Any report answered with `stale` or `cancelled` kills the process and the
//! task is dropped without a result.

pub mod agent;
pub mod executor;
pub mod heartbeat;

pub use agent::{TaskRun, WorkerAgent};
pub use executor::{ExecutionResult, ExecutionStatus, TaskExecutor};
pub use heartbeat::HeartbeatSender;
