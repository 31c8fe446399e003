#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;

use renderq::config::SchedulerConfig;
use renderq::events::EventBus;
use renderq::plugin::{FailurePolicy, PluginError, PluginRegistry, RenderPlugin, TaskSpec};
use renderq::scheduler::job::{Job, JobSubmission};
use renderq::scheduler::task::Task;
use renderq::scheduler::worker::WorkerRegistration;
use renderq::scheduler::Scheduler;

pub const SHELL: &str = "shell";
pub const SHELL_CONTINUE: &str = "shell-continue";
pub const PANICKY: &str = "panicky";

/// Runs `params.script` through `sh -c`, split into `params.tasks` tasks.
///
/// Lines of the form `PROGRESS <fraction>` are progress reports.
pub struct ShellPlugin {
    name: &'static str,
    policy: FailurePolicy,
}

impl ShellPlugin {
    pub fn new() -> Self {
        Self {
            name: SHELL,
            policy: FailurePolicy::FailJob,
        }
    }

    pub fn continuing() -> Self {
        Self {
            name: SHELL_CONTINUE,
            policy: FailurePolicy::ContinueJob,
        }
    }
}

impl RenderPlugin for ShellPlugin {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Runs a shell script"
    }

    fn validate(&self, params: &serde_json::Value) -> Result<(), PluginError> {
        params
            .get("script")
            .and_then(|s| s.as_str())
            .ok_or_else(|| PluginError::invalid("script is required"))?;
        Ok(())
    }

    fn create_tasks(&self, job: &Job) -> Result<Vec<TaskSpec>, PluginError> {
        let count = job.params.get("tasks").and_then(|n| n.as_i64()).unwrap_or(1);
        Ok((0..count).map(|i| TaskSpec::frames(i, i)).collect())
    }

    fn build_command(&self, _task: &Task, job: &Job) -> Result<Vec<String>, PluginError> {
        let script = job
            .params
            .get("script")
            .and_then(|s| s.as_str())
            .ok_or_else(|| PluginError::invalid("script is required"))?;
        Ok(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    fn parse_progress(&self, line: &str, _task: &Task) -> Option<f64> {
        line.strip_prefix("PROGRESS ")?.trim().parse().ok()
    }

    fn failure_policy(&self) -> FailurePolicy {
        self.policy
    }
}

/// Accepts everything, then blows up while expanding.
pub struct PanickyPlugin;

impl RenderPlugin for PanickyPlugin {
    fn name(&self) -> &str {
        PANICKY
    }

    fn validate(&self, _params: &serde_json::Value) -> Result<(), PluginError> {
        Ok(())
    }

    fn create_tasks(&self, _job: &Job) -> Result<Vec<TaskSpec>, PluginError> {
        panic!("segment table corrupted")
    }

    fn build_command(&self, _task: &Task, _job: &Job) -> Result<Vec<String>, PluginError> {
        Ok(Vec::new())
    }
}

pub fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtin();
    registry.register(Arc::new(ShellPlugin::new()));
    registry.register(Arc::new(ShellPlugin::continuing()));
    registry.register(Arc::new(PanickyPlugin));
    registry
}

pub fn scheduler() -> Scheduler {
    scheduler_with(SchedulerConfig::default())
}

pub fn scheduler_with(config: SchedulerConfig) -> Scheduler {
    Scheduler::new(config, registry(), EventBus::new())
}

pub fn shell_job(name: &str, script: &str, tasks: i64) -> JobSubmission {
    JobSubmission::new(name, SHELL, json!({ "script": script, "tasks": tasks }))
}

pub fn registration(worker_id: &str) -> WorkerRegistration {
    WorkerRegistration::new(
        worker_id,
        vec!["default".to_string()],
        vec![
            SHELL.to_string(),
            SHELL_CONTINUE.to_string(),
            PANICKY.to_string(),
            "aftereffects".to_string(),
            "ffmpeg".to_string(),
        ],
    )
}
