use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use renderq::api::TaskOutcome;
use renderq::worker::{ExecutionStatus, TaskExecutor};

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Run `argv` and collect every streamed line.
async fn run(executor: &TaskExecutor, argv: Vec<String>) -> (renderq::worker::ExecutionResult, Vec<String>) {
    let (tx, mut rx) = mpsc::channel(64);
    let collector = tokio::spawn(async move {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines
    });
    let result = executor
        .execute(Uuid::new_v4(), &argv, tx, CancellationToken::new())
        .await;
    (result, collector.await.unwrap())
}

#[tokio::test]
async fn test_execute_simple_command() {
    let executor = TaskExecutor::new();
    let task_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(8);

    let result = executor
        .execute(task_id, &sh("echo hello"), tx, CancellationToken::new())
        .await;

    assert_eq!(result.task_id, task_id);
    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.error.is_none());
    assert_eq!(result.outcome(), Some(TaskOutcome::Success));
    assert_eq!(rx.recv().await.as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_stdout_and_stderr_are_streamed() {
    let (result, lines) = run(&TaskExecutor::new(), sh("echo out; echo err 1>&2")).await;

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(lines.len(), 2);
    assert!(lines.contains(&"out".to_string()));
    assert!(lines.contains(&"err".to_string()));
}

#[tokio::test]
async fn test_failure_carries_exit_code_and_output_tail() {
    let executor = TaskExecutor::with_tail_lines(3);
    let (result, lines) = run(&executor, sh("seq 1 10; exit 3")).await;

    assert_eq!(lines.len(), 10);
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.tail, vec!["8", "9", "10"]);
    assert_eq!(result.error.as_deref(), Some("exit code 3\n8\n9\n10"));
    assert_eq!(
        result.outcome(),
        Some(TaskOutcome::Failure("exit code 3\n8\n9\n10".to_string()))
    );
}

#[tokio::test]
async fn test_failure_without_output() {
    let (result, _) = run(&TaskExecutor::new(), sh("exit 1")).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("exit code 1"));
}

#[tokio::test]
async fn test_missing_binary_fails_to_start() {
    let argv = vec!["/nonexistent/aerender".to_string(), "-project".to_string()];
    let (result, lines) = run(&TaskExecutor::new(), argv).await;

    assert!(lines.is_empty());
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.exit_code.is_none());
    assert!(result
        .error
        .unwrap()
        .contains("failed to start /nonexistent/aerender"));
}

#[tokio::test]
async fn test_empty_command_line() {
    let (result, _) = run(&TaskExecutor::new(), Vec::new()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("empty command line"));
}

#[tokio::test]
async fn test_cancellation_kills_process() {
    let executor = TaskExecutor::new();
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(8);

    let trigger = cancel.clone();
    let handle = tokio::spawn(async move {
        executor
            .execute(Uuid::new_v4(), &sh("echo started; sleep 30"), tx, cancel)
            .await
    });

    assert_eq!(rx.recv().await.as_deref(), Some("started"));
    trigger.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("cancelled task should stop promptly")
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(result.outcome().is_none());
    assert_eq!(result.tail, vec!["started"]);
}

#[tokio::test]
async fn test_large_output() {
    let (result, lines) = run(&TaskExecutor::new(), sh("seq 1 1000")).await;

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(lines.len(), 1000);
    assert_eq!(lines.last().map(String::as_str), Some("1000"));
    assert_eq!(result.tail.len(), 20);
}

#[tokio::test]
async fn test_process_writes_its_output_files() {
    let dir = tempfile::tempdir().unwrap();
    let frame = dir.path().join("shot_00001.png");
    let script = format!("printf png > '{}'", frame.display());

    let (result, _) = run(&TaskExecutor::new(), sh(&script)).await;

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(std::fs::read_to_string(&frame).unwrap(), "png");
}
