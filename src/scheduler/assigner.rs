use std::cmp::Reverse;

use uuid::Uuid;

use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::store::StateStore;
use crate::scheduler::task::TaskStatus;
use crate::scheduler::worker::Worker;

/// Whether `worker` may be handed tasks of `job` at all.
pub fn is_eligible(worker: &Worker, job: &Job) -> bool {
    worker.accepts_work() && job.status.is_schedulable() && worker.can_run(job)
}

/// Pick the PENDING task `worker` should receive next, without claiming it.
///
/// Jobs are ranked by priority (highest first), then creation time (oldest
/// first), then id so the order is total. Within the chosen job the task with
/// the lowest index wins. Jobs whose tasks are all taken are skipped.
pub fn select_task(store: &StateStore, worker: &Worker) -> Option<Uuid> {
    let mut candidates: Vec<&Job> = store
        .job_ids_with_status(&[JobStatus::Queued, JobStatus::Active])
        .iter()
        .filter_map(|id| store.job(id))
        .filter(|job| is_eligible(worker, job))
        .collect();
    candidates.sort_by_key(|job| (Reverse(job.priority), job.created_at, job.id));

    candidates.into_iter().find_map(|job| {
        store
            .tasks_for_job(&job.id)
            .into_iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .min_by_key(|task| task.index)
            .map(|task| task.id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::TaskSpec;
    use crate::scheduler::job::JobSubmission;
    use crate::scheduler::task::Task;
    use crate::scheduler::worker::WorkerRegistration;
    use chrono::{Duration, Utc};

    fn worker(pools: &[&str], caps: &[&str]) -> Worker {
        Worker::new(
            WorkerRegistration::new(
                "w1",
                pools.iter().map(|s| s.to_string()).collect(),
                caps.iter().map(|s| s.to_string()).collect(),
            ),
            Utc::now(),
        )
    }

    fn queued_job(store: &mut StateStore, sub: JobSubmission, age_secs: i64, tasks: u32) -> Uuid {
        let now = Utc::now();
        let mut job = Job::with_id(Uuid::new_v4(), sub, now - Duration::seconds(age_secs));
        job.transition_to(JobStatus::Queued, now).unwrap();
        let id = job.id;
        store.add_job(job);
        let tasks = (0..tasks)
            .map(|i| Task::from_spec(id, i, TaskSpec::single(), now))
            .collect();
        store.add_tasks(id, tasks);
        id
    }

    fn sub(name: &str) -> JobSubmission {
        JobSubmission::new(name, "ffmpeg", serde_json::json!({}))
    }

    #[test]
    fn higher_priority_wins() {
        let mut store = StateStore::new();
        let w = worker(&["default"], &["ffmpeg"]);
        let _low = queued_job(&mut store, sub("low").with_priority(10), 100, 1);
        let high = queued_job(&mut store, sub("high").with_priority(90), 1, 1);

        let task_id = select_task(&store, &w).unwrap();
        assert_eq!(store.task(&task_id).unwrap().job_id, high);
    }

    #[test]
    fn older_job_wins_on_equal_priority() {
        let mut store = StateStore::new();
        let w = worker(&["default"], &["ffmpeg"]);
        let old = queued_job(&mut store, sub("old"), 100, 1);
        let _new = queued_job(&mut store, sub("new"), 1, 1);

        let task_id = select_task(&store, &w).unwrap();
        assert_eq!(store.task(&task_id).unwrap().job_id, old);
    }

    #[test]
    fn lowest_index_first_and_skips_claimed() {
        let mut store = StateStore::new();
        let w = worker(&["default"], &["ffmpeg"]);
        store.upsert_worker(w.clone());
        let job = queued_job(&mut store, sub("j"), 1, 3);

        let first = select_task(&store, &w).unwrap();
        assert_eq!(store.task(&first).unwrap().index, 0);
        assert!(store.try_claim(&first, "w1", Utc::now()));

        let second = select_task(&store, &w).unwrap();
        assert_eq!(store.task(&second).unwrap().index, 1);
        assert_eq!(store.task(&second).unwrap().job_id, job);
    }

    #[test]
    fn respects_pool_and_capability() {
        let mut store = StateStore::new();
        queued_job(&mut store, sub("gpu").with_pool("gpu"), 1, 1);
        queued_job(
            &mut store,
            JobSubmission::new("ae", "aftereffects", serde_json::json!({})),
            1,
            1,
        );

        assert!(select_task(&store, &worker(&["default"], &["ffmpeg"])).is_none());
        assert!(select_task(&store, &worker(&["gpu"], &["ffmpeg"])).is_some());
        assert!(select_task(&store, &worker(&["default"], &["aftereffects"])).is_some());
    }

    #[test]
    fn suspended_and_pending_jobs_are_skipped() {
        let mut store = StateStore::new();
        let w = worker(&["default"], &["ffmpeg"]);
        let id = queued_job(&mut store, sub("j"), 1, 1);
        store
            .job_mut(&id)
            .unwrap()
            .transition_to(JobStatus::Suspended, Utc::now())
            .unwrap();
        assert!(select_task(&store, &w).is_none());

        store.add_job(Job::new(sub("pending")));
        assert!(select_task(&store, &w).is_none());
    }

    #[test]
    fn offline_worker_gets_nothing() {
        let mut store = StateStore::new();
        let mut w = worker(&["default"], &["ffmpeg"]);
        queued_job(&mut store, sub("j"), 1, 1);
        w.mark_offline();
        assert!(select_task(&store, &w).is_none());
    }
}
