//! Core types and error definitions for the Labflow queue engine.
//!
//! This crate provides the foundational types shared across the Labflow
//! crates: the unified error enum, the result alias, and time-range
//! primitives used by the metrics queries.
//!
//! # Main types
//!
//! - [`LabflowError`] — Unified error enum for all queue subsystems.
//! - [`LabflowResult`] — Convenience alias for `Result<T, LabflowError>`.
//! - [`TimeRange`] — Named or explicit time windows for metrics queries.

/// Time-range primitives for metrics queries.
pub mod time;

pub use time::TimeRange;

/// Top-level error type for the Labflow queue engine.
///
/// Validation variants (`InvalidRequest`, `UnknownAgentType`, `QueueDraining`)
/// are reported synchronously at submission and never enter a queue. The
/// remaining variants are recorded as terminal reasons on job and workflow
/// records and surface through the query interface.
#[derive(Debug, thiserror::Error)]
pub enum LabflowError {
    /// A malformed request value (priority, resources, timeout, steps)
    /// rejected before a job is created.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A submission refused because the target queue is draining.
    #[error("Queue draining: {0}")]
    QueueDraining(String),

    /// A job cancelled because a declared dependency failed, not because of
    /// its own execution.
    #[error("Dependency failed: {0}")]
    DependencyFailed(String),

    /// A job cancelled before or during execution because its deadline passed.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The agent executor returned failure or exceeded the attempt timeout.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// No executor is registered for the agent type and no fallback exists.
    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    /// An internal queue bookkeeping error (missing job, missing queue).
    #[error("Queue error: {0}")]
    Queue(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`LabflowError`].
pub type LabflowResult<T> = Result<T, LabflowError>;
