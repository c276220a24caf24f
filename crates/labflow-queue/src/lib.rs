//! Agent job queue engine with workflows, queue control, and health scoring.
//!
//! Labflow routes agent invocations into per-category priority queues,
//! dispatches them under per-queue concurrency limits, coordinates multi-step
//! workflows (sequential chains or parallel fan-out), and aggregates health
//! and performance metrics across every queue for the dashboard.
//!
//! # Main types
//!
//! - [`QueueEngine`] — Top-level engine: admission, dispatch, workflows, control, health.
//! - [`AgentRegistry`] — Executor registry; the seam to external agent runtimes.
//! - [`AgentQueueRequest`] — A validated single-job submission.
//! - [`WorkflowRequest`] — A multi-step workflow submission.
//! - [`SystemHealth`] — Weighted health evaluation across all queues.

/// Queue pause/resume/drain control.
mod control;
/// Engine facade wiring schedulers, workflows, and health together.
pub mod engine;
/// The agent executor seam and registry.
pub mod executor;
/// Health scoring, windowed metrics, and derived alerts.
pub mod health;
/// Cross-queue dependency tracking.
mod resolver;
/// Per-queue admission, selection, and slot accounting.
mod scheduler;
/// Shared queue types (Job, Workflow, QueueStats, etc.).
pub mod types;
/// Workflow expansion and aggregate state tracking.
pub mod workflow;

pub use engine::{EngineConfig, JobReceipt, QueueEngine, WorkflowReceipt};
pub use executor::{AgentExecutor, AgentRegistry};
pub use health::{
    Alert, AlertSeverity, HealthStatus, HealthThresholds, JobSample, QueueHealth, QueueMetrics,
    SampleOutcome, SystemHealth,
};
pub use types::{
    AgentQueueRequest, Job, JobMetadata, JobPriority, JobState, QueueStats, QueueType,
    ResourceRequest, RetryPolicy, SystemStatus, Workflow, WorkflowOptions, WorkflowRequest,
    WorkflowState, WorkflowStep,
};
pub use workflow::{WorkflowJobSnapshot, WorkflowSnapshot};
