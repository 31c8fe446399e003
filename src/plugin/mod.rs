//! Renderer integrations.
//!
//! The scheduler only ever talks to [`RenderPlugin`]; concrete renderers are
//! looked up by the job's `plugin_type` in a [`PluginRegistry`] that is built
//! once at startup and handed to the scheduler and to worker agents.

pub mod aftereffects;
pub mod ffmpeg;
mod registry;

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::job::{Job, JobSubmission};
use crate::scheduler::task::Task;

pub use aftereffects::AfterEffectsPlugin;
pub use ffmpeg::FfmpegPlugin;
pub use registry::PluginRegistry;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("cannot build command: {0}")]
    Command(String),

    #[error("plugin panicked: {0}")]
    Panicked(String),
}

impl PluginError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        PluginError::InvalidParams(reason.into())
    }
}

/// How an exhausted task affects its job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The first task that runs out of retries fails the job.
    #[default]
    FailJob,
    /// Let the remaining tasks finish; the job fails once nothing is left running.
    ContinueJob,
}

/// Blueprint for one task, as produced by [`RenderPlugin::create_tasks`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub frame_start: Option<i64>,
    pub frame_end: Option<i64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TaskSpec {
    /// A task without a frame range.
    pub fn single() -> Self {
        Self {
            metadata: serde_json::Value::Object(Default::default()),
            ..Default::default()
        }
    }

    /// An inclusive frame range.
    pub fn frames(start: i64, end: i64) -> Self {
        Self {
            frame_start: Some(start),
            frame_end: Some(end),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Catalogue entry returned by `GET /api/plugins`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub display_name: String,
    pub description: String,
}

/// A renderer integration.
///
/// Implementations must be pure: `validate` may not touch the filesystem,
/// `create_tasks` must return the same partition for the same job, and
/// `build_command` must depend on nothing but `(task, job)`.
pub trait RenderPlugin: Send + Sync {
    /// Registry key, matched against `Job::plugin_type`.
    fn name(&self) -> &str;

    fn display_name(&self) -> &str {
        self.name()
    }

    fn description(&self) -> &str {
        ""
    }

    fn validate(&self, params: &serde_json::Value) -> Result<(), PluginError>;

    /// Partition a validated job into independently retryable tasks.
    fn create_tasks(&self, job: &Job) -> Result<Vec<TaskSpec>, PluginError>;

    fn build_command(&self, task: &Task, job: &Job) -> Result<Vec<String>, PluginError>;

    /// Best-effort progress fraction (0.0 to 1.0) parsed from one output line.
    fn parse_progress(&self, _line: &str, _task: &Task) -> Option<f64> {
        None
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::FailJob
    }

    /// Jobs to submit once `job` has completed.
    fn follow_up_jobs(&self, _job: &Job) -> Vec<JobSubmission> {
        Vec::new()
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name().to_string(),
            display_name: self.display_name().to_string(),
            description: self.description().to_string(),
        }
    }
}

/// Run a plugin callback, turning a panic into [`PluginError::Panicked`].
pub(crate) fn call_guarded<T>(
    f: impl FnOnce() -> Result<T, PluginError>,
) -> Result<T, PluginError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            };
            Err(PluginError::Panicked(message))
        }
    }
}

/// Read typed parameters out of a job's opaque payload.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(
    params: &serde_json::Value,
) -> Result<T, PluginError> {
    serde_json::from_value(params.clone()).map_err(|e| PluginError::invalid(e.to_string()))
}
