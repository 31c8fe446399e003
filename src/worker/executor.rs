use std::collections::VecDeque;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::TaskOutcome;

/// Output lines kept for the failure diagnostic.
pub const DEFAULT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    /// Killed because the task was abandoned; nothing should be reported.
    Cancelled,
}

/// Result of running one task's command.
#[derive(Debug)]
pub struct ExecutionResult {
    pub task_id: Uuid,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    /// Last lines of combined stdout/stderr.
    pub tail: Vec<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    fn failed(task_id: Uuid, error: String) -> Self {
        Self {
            task_id,
            status: ExecutionStatus::Failed,
            exit_code: None,
            tail: Vec::new(),
            error: Some(error),
        }
    }

    fn cancelled(task_id: Uuid, tail: VecDeque<String>) -> Self {
        Self {
            task_id,
            status: ExecutionStatus::Cancelled,
            exit_code: None,
            tail: tail.into(),
            error: None,
        }
    }

    /// What to report to the scheduler, or `None` for an abandoned task.
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self.status {
            ExecutionStatus::Succeeded => Some(TaskOutcome::Success),
            ExecutionStatus::Failed => Some(TaskOutcome::Failure(
                self.error.clone().unwrap_or_else(|| "task failed".to_string()),
            )),
            ExecutionStatus::Cancelled => None,
        }
    }
}

/// Runs a task's argv as a subprocess.
///
/// Output is streamed line by line (stdout and stderr interleaved) to the
/// caller while the process runs, so progress can be parsed on the fly.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    tail_lines: usize,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecutor {
    pub fn new() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    pub fn with_tail_lines(tail_lines: usize) -> Self {
        Self {
            tail_lines: tail_lines.max(1),
        }
    }

    /// Run `argv` to completion, or until `cancel` fires.
    ///
    /// Every output line is sent to `output`; a closed receiver does not stop
    /// the process. On cancellation the child is killed.
    pub async fn execute(
        &self,
        task_id: Uuid,
        argv: &[String],
        output: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let Some((program, args)) = argv.split_first() else {
            return ExecutionResult::failed(task_id, "empty command line".to_string());
        };
        tracing::info!(task_id = %task_id, program = %program, args = args.len(), "Executing task");

        let mut child = match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(task_id = %task_id, program = %program, error = %e, "Failed to start task process");
                return ExecutionResult::failed(task_id, format!("failed to start {program}: {e}"));
            }
        };

        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let mut tail: VecDeque<String> = VecDeque::with_capacity(self.tail_lines);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    tracing::info!(task_id = %task_id, "Task process killed");
                    return ExecutionResult::cancelled(task_id, tail);
                }
                line = line_rx.recv() => match line {
                    Some(line) => {
                        if tail.len() == self.tail_lines {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                        let _ = output.send(line).await;
                    }
                    None => break,
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return ExecutionResult::cancelled(task_id, tail);
            }
            status = child.wait() => status,
        };

        let tail: Vec<String> = tail.into();
        match status {
            Ok(status) if status.success() => {
                tracing::info!(task_id = %task_id, "Task process succeeded");
                ExecutionResult {
                    task_id,
                    status: ExecutionStatus::Succeeded,
                    exit_code: status.code(),
                    tail,
                    error: None,
                }
            }
            Ok(status) => {
                let exit_code = status.code();
                let headline = match exit_code {
                    Some(code) => format!("exit code {code}"),
                    None => "terminated by signal".to_string(),
                };
                let error = if tail.is_empty() {
                    headline
                } else {
                    format!("{headline}\n{}", tail.join("\n"))
                };
                tracing::warn!(task_id = %task_id, exit_code = ?exit_code, "Task process failed");
                ExecutionResult {
                    task_id,
                    status: ExecutionStatus::Failed,
                    exit_code,
                    tail,
                    error: Some(error),
                }
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Waiting for task process failed");
                ExecutionResult {
                    tail,
                    ..ExecutionResult::failed(task_id, e.to_string())
                }
            }
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}
