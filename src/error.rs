use thiserror::Error;
use uuid::Uuid;

use crate::plugin::PluginError;

#[derive(Error, Debug)]
pub enum RenderqError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Job queue is at capacity")]
    QueueFull,

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RenderqError {
    pub fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        RenderqError::InvalidTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Stable machine-readable name, carried in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderqError::Validation(_) => "validation",
            RenderqError::JobNotFound(_) => "job_not_found",
            RenderqError::TaskNotFound(_) => "task_not_found",
            RenderqError::WorkerNotFound(_) => "worker_not_found",
            RenderqError::InvalidTransition { .. } => "invalid_transition",
            RenderqError::QueueFull => "queue_full",
            RenderqError::Plugin(_) => "plugin",
            RenderqError::Http(_) => "http",
            RenderqError::Remote { .. } => "remote",
            RenderqError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, RenderqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_names_both_states() {
        let err = RenderqError::invalid_transition("job", "COMPLETED", "ACTIVE");
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(err.to_string(), "Invalid job transition: COMPLETED -> ACTIVE");
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(RenderqError::QueueFull.kind(), "queue_full");
        assert_eq!(
            RenderqError::WorkerNotFound("w1".to_string()).kind(),
            "worker_not_found"
        );
        assert_eq!(RenderqError::Validation("bad".to_string()).kind(), "validation");
    }
}
