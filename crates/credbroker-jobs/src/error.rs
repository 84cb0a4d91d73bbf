//! Scheduler error types.
//!
//! Every public API in this crate returns [`JobError`]. Variants carry the
//! job name so callers can react without inspecting strings.

/// Unified error type for the credbroker job scheduler.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// A job with this name is already registered.
    #[error("job already registered: {name}")]
    DuplicateJob { name: String },

    /// No job with this name is registered.
    #[error("job not found: {name}")]
    JobNotFound { name: String },

    /// The job definition cannot be scheduled (empty name, zero interval).
    #[error("invalid job {name:?}: {reason}")]
    InvalidJob { name: String, reason: String },

    /// The scheduler has been shut down and will not accept new work.
    #[error("scheduler is shut down")]
    SchedulerShutdown,

    /// Catch-all for unexpected internal errors.
    #[error("internal scheduler error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the jobs crate.
pub type Result<T> = std::result::Result<T, JobError>;
