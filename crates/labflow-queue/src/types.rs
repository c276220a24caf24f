use chrono::{DateTime, Utc};
use labflow_core::{LabflowError, LabflowResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lower bound for a single execution attempt timeout.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound for a single execution attempt timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Scheduling priority of a job.
///
/// The derived ordering is the strict total order used by the schedulers:
/// `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Background work.
    Low,
    /// The default priority.
    #[default]
    Normal,
    /// User-facing work.
    High,
    /// Operator-escalated work.
    Critical,
}

/// The logical queue a job is dispatched from.
///
/// One queue exists per work category; queues are created once at engine
/// startup and never destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Content-producing agents (posts, briefs, summaries).
    ContentGeneration,
    /// Analysis and reporting agents.
    Analytics,
    /// Outbound notification agents.
    Notifications,
    /// Generic fallback queue for agent types with no dedicated category.
    AgentExecution,
}

impl QueueType {
    /// Every queue the engine creates at startup.
    pub const ALL: [QueueType; 4] = [
        QueueType::ContentGeneration,
        QueueType::Analytics,
        QueueType::Notifications,
        QueueType::AgentExecution,
    ];

    /// Static mapping from agent type to queue category.
    ///
    /// Unrecognized agent types fall back to [`QueueType::AgentExecution`].
    pub fn for_agent(agent_type: &str) -> QueueType {
        match agent_type {
            "content-generator" | "blog-writer" | "social-post-writer" | "summary-writer" => {
                QueueType::ContentGeneration
            }
            "seo-analyzer" | "keyword-research" | "report-builder" | "competitor-scan" => {
                QueueType::Analytics
            }
            "email-notifier" | "digest-sender" | "onboarding-reminder" => QueueType::Notifications,
            _ => QueueType::AgentExecution,
        }
    }
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueType::ContentGeneration => write!(f, "content_generation"),
            QueueType::Analytics => write!(f, "analytics"),
            QueueType::Notifications => write!(f, "notifications"),
            QueueType::AgentExecution => write!(f, "agent_execution"),
        }
    }
}

/// Lifecycle state of a job.
///
/// Transitions: `Pending → Eligible → Running → {Succeeded | Failed |
/// Cancelled}`. A job whose deadline expires while still Pending or Eligible
/// moves directly to `Cancelled` without running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Admitted, waiting on dependencies or a retry backoff.
    Pending,
    /// Dependencies satisfied, ready for dispatch.
    Eligible,
    /// An execution attempt is in flight.
    Running,
    /// The executor returned success.
    Succeeded,
    /// All retry attempts exhausted.
    Failed {
        /// The last attempt's error.
        reason: String,
    },
    /// Cancelled before completion (deadline, failed dependency, fail-fast).
    Cancelled {
        /// Why the job was cancelled.
        reason: String,
    },
}

impl JobState {
    /// Whether the job can never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed { .. } | JobState::Cancelled { .. }
        )
    }
}

/// Retry policy for failed execution attempts.
///
/// The backoff between attempts grows exponentially:
/// `initial_backoff_ms * backoff_multiplier^(attempt - 1)`, capped at
/// `max_backoff_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of execution attempts (including the first).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Multiplier applied per subsequent attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Ceiling on the computed backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after the given failed attempt (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let raw = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis((raw as u64).min(self.max_backoff_ms))
    }
}

/// Optional CPU/memory request attached to a job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Requested CPU cores, in `[0.1, 16]`.
    pub cpu: f64,
    /// Requested memory in MB, in `[64, 32768]`.
    pub memory_mb: u64,
}

impl ResourceRequest {
    /// Validate the request against the admission bounds.
    pub fn validate(&self) -> LabflowResult<()> {
        if !(0.1..=16.0).contains(&self.cpu) {
            return Err(LabflowError::InvalidRequest(format!(
                "cpu request {} outside [0.1, 16]",
                self.cpu
            )));
        }
        if !(64..=32_768).contains(&self.memory_mb) {
            return Err(LabflowError::InvalidRequest(format!(
                "memory request {} MB outside [64, 32768]",
                self.memory_mb
            )));
        }
        Ok(())
    }
}

/// Validate a per-attempt timeout against the admission bounds.
pub fn validate_timeout(timeout: Duration) -> LabflowResult<()> {
    if timeout < MIN_TIMEOUT || timeout > MAX_TIMEOUT {
        return Err(LabflowError::InvalidRequest(format!(
            "timeout {}ms outside [1s, 1h]",
            timeout.as_millis()
        )));
    }
    Ok(())
}

/// Free-form audit fields carried with a job, opaque to scheduling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Who asked for this job.
    #[serde(default)]
    pub requested_by: Option<String>,
    /// Source IP of the originating request.
    #[serde(default)]
    pub source_ip: Option<String>,
    /// User agent of the originating request.
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// One scheduled agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, generated at admission.
    pub id: Uuid,
    /// Which external executor handles this job.
    pub agent_type: String,
    /// Queue category, derived from `agent_type`.
    pub queue_type: QueueType,
    /// Scheduling priority.
    pub priority: JobPriority,
    /// Opaque payload passed to the executor.
    pub payload: serde_json::Value,
    /// Optional resource request.
    pub resources: Option<ResourceRequest>,
    /// Absolute deadline after which the job is cancelled instead of run.
    pub deadline: Option<DateTime<Utc>>,
    /// Job ids that must succeed before this job becomes eligible.
    pub dependencies: Vec<Uuid>,
    /// Wall-clock limit per execution attempt.
    pub timeout: Duration,
    /// Retry policy for failed attempts.
    pub retry: RetryPolicy,
    /// Current lifecycle state.
    pub state: JobState,
    /// Execution attempts so far.
    pub attempts: u32,
    /// Audit metadata, opaque to scheduling.
    pub metadata: JobMetadata,
    /// Owning workflow, if this job is a workflow step.
    pub workflow_id: Option<Uuid>,
    /// Admission timestamp.
    pub submitted_at: DateTime<Utc>,
    /// Per-queue admission sequence number; FIFO tie-break within a priority.
    #[serde(default)]
    pub seq: u64,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Result value from a successful attempt.
    pub result: Option<serde_json::Value>,
}

/// A validated single-agent submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentQueueRequest {
    /// Which external executor handles the job.
    pub agent_type: String,
    /// Opaque payload passed to the executor.
    pub payload: serde_json::Value,
    /// Scheduling priority.
    #[serde(default)]
    pub priority: JobPriority,
    /// Optional resource request.
    #[serde(default)]
    pub resources: Option<ResourceRequest>,
    /// Absolute deadline.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Ids of jobs that must succeed first.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Per-attempt timeout; engine default when absent.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Retry policy; engine default when absent.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Audit metadata.
    #[serde(default)]
    pub metadata: JobMetadata,
}

impl AgentQueueRequest {
    /// Create a request with default priority, timeout, and retry policy.
    pub fn new(agent_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            agent_type: agent_type.into(),
            payload,
            priority: JobPriority::default(),
            resources: None,
            deadline: None,
            dependencies: Vec::new(),
            timeout: None,
            retry: None,
            metadata: JobMetadata::default(),
        }
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the resource request.
    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Set the absolute deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the dependency job ids.
    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the audit metadata.
    pub fn with_metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl Job {
    /// Build a job from a validated request, rejecting malformed values
    /// before anything enters a queue.
    pub fn from_request(
        request: AgentQueueRequest,
        default_timeout: Duration,
        default_retry: &RetryPolicy,
    ) -> LabflowResult<Job> {
        if request.agent_type.trim().is_empty() {
            return Err(LabflowError::InvalidRequest(
                "agent type must not be empty".to_string(),
            ));
        }
        if let Some(resources) = &request.resources {
            resources.validate()?;
        }
        let timeout = request.timeout.unwrap_or(default_timeout);
        validate_timeout(timeout)?;
        let retry = request.retry.unwrap_or_else(|| default_retry.clone());
        if retry.max_attempts == 0 {
            return Err(LabflowError::InvalidRequest(
                "retry policy must allow at least one attempt".to_string(),
            ));
        }

        let queue_type = QueueType::for_agent(&request.agent_type);
        Ok(Job {
            id: Uuid::new_v4(),
            agent_type: request.agent_type,
            queue_type,
            priority: request.priority,
            payload: request.payload,
            resources: request.resources,
            deadline: request.deadline,
            dependencies: request.dependencies,
            timeout,
            retry,
            state: JobState::Pending,
            attempts: 0,
            metadata: request.metadata,
            workflow_id: None,
            submitted_at: Utc::now(),
            seq: 0,
            started_at: None,
            finished_at: None,
            result: None,
        })
    }

    /// Whether the deadline has passed as of `now`.
    pub fn deadline_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// One step of a workflow request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Which external executor handles this step.
    pub agent_type: String,
    /// Opaque payload passed to the executor.
    pub payload: serde_json::Value,
    /// Priority override; inherits the workflow priority when absent.
    #[serde(default)]
    pub priority: Option<JobPriority>,
    /// Deadline override; inherits the workflow deadline when absent.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    /// Create a step inheriting the workflow's priority and deadline.
    pub fn new(agent_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            agent_type: agent_type.into(),
            payload,
            priority: None,
            deadline: None,
        }
    }

    /// Override the workflow priority for this step.
    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Override the workflow deadline for this step.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Execution options applying to a whole workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOptions {
    /// When true, all steps are mutually independent jobs; when false
    /// (default), each step depends on the previous one.
    #[serde(default)]
    pub parallel_execution: bool,
    /// When true, a single failed step cancels all not-yet-started siblings.
    #[serde(default)]
    pub fail_fast: bool,
    /// Per-step retry policy; engine default when absent.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Workflow-wide deadline, propagated to each step unless overridden.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

/// A multi-step workflow submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Business this workflow belongs to.
    pub business_id: String,
    /// User who submitted the workflow.
    pub user_id: String,
    /// Priority propagated to every step unless overridden.
    #[serde(default)]
    pub priority: JobPriority,
    /// Ordered step specifications; at least one is required.
    pub steps: Vec<WorkflowStep>,
    /// Execution options.
    #[serde(default)]
    pub options: WorkflowOptions,
}

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// At least one constituent job is not yet terminal.
    Running,
    /// Every constituent job succeeded.
    Completed,
    /// A job failed under fail-fast, or all jobs are terminal with at least
    /// one failure.
    Failed {
        /// The triggering failure.
        reason: String,
    },
    /// All jobs terminal, none failed, at least one cancelled.
    Cancelled {
        /// Why the workflow was cancelled.
        reason: String,
    },
}

impl WorkflowState {
    /// Whether the workflow can no longer change state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowState::Running)
    }
}

/// A workflow record: the jobs created from a request plus aggregate state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier.
    pub id: Uuid,
    /// Business this workflow belongs to.
    pub business_id: String,
    /// User who submitted the workflow.
    pub user_id: String,
    /// Priority propagated to the steps.
    pub priority: JobPriority,
    /// Jobs created from the steps, in step order.
    pub job_ids: Vec<Uuid>,
    /// Execution options.
    pub options: WorkflowOptions,
    /// Aggregate state.
    pub state: WorkflowState,
    /// Submission timestamp.
    pub created_at: DateTime<Utc>,
    /// When the workflow reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Point-in-time statistics for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// The queue these statistics describe.
    pub queue_type: QueueType,
    /// Whether dispatch is paused.
    pub paused: bool,
    /// Whether new submissions are refused.
    pub draining: bool,
    /// Maximum concurrent dispatches.
    pub concurrency_limit: usize,
    /// Currently dispatched jobs.
    pub in_flight: usize,
    /// Jobs waiting on dependencies or backoff.
    pub pending: usize,
    /// Jobs ready for dispatch.
    pub eligible: usize,
    /// Jobs currently running.
    pub running: usize,
    /// Jobs that succeeded.
    pub succeeded: usize,
    /// Jobs that exhausted retries.
    pub failed: usize,
    /// Jobs cancelled before completion.
    pub cancelled: usize,
}

impl QueueStats {
    /// Jobs not yet dispatched (pending + eligible).
    pub fn backlog(&self) -> usize {
        self.pending + self.eligible
    }
}

/// Point-in-time status of the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Per-queue statistics.
    pub queues: Vec<QueueStats>,
    /// Workflows not yet in a terminal state.
    pub active_workflows: usize,
    /// Agent types with a dedicated executor.
    pub registered_agents: Vec<String>,
    /// When this snapshot was taken.
    pub generated_at: DateTime<Utc>,
}
