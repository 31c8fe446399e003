//! The scheduling core: data model, state store, assignment and the
//! periodic sweep that drives job and task state machines.

pub mod assigner;
pub mod job;
pub mod service;
pub mod store;
pub mod sweep;
pub mod task;
pub mod worker;

pub use job::{Job, JobFailure, JobFilter, JobStatus, JobSubmission};
pub use service::Scheduler;
pub use store::{StateStore, StoreStats};
pub use sweep::CycleReport;
pub use task::{Task, TaskStatus};
pub use worker::{Worker, WorkerRegistration, WorkerStatus};
