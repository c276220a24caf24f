use crate::control::QueueControl;
use crate::executor::AgentRegistry;
use crate::health::{HealthAggregator, HealthThresholds, QueueMetrics, SystemHealth};
use crate::resolver::{has_cycle, DependencyResolver, RegisterOutcome};
use crate::scheduler::{
    Admission, AttemptOutcome, CancelledJob, CompletionAction, DispatchTicket, QueueScheduler,
};
use crate::types::{
    AgentQueueRequest, Job, JobState, QueueStats, QueueType, RetryPolicy, SystemStatus,
    WorkflowRequest, WorkflowState,
};
use crate::workflow::{WorkflowAction, WorkflowCoordinator, WorkflowSnapshot};
use chrono::Utc;
use labflow_core::{LabflowError, LabflowResult, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Engine configuration, loadable from JSON with per-field defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrency limit applied to queues without an override.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
    /// Per-queue concurrency overrides.
    #[serde(default)]
    pub concurrency_overrides: HashMap<QueueType, usize>,
    /// Per-attempt timeout applied when a request does not set one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Retry policy applied when a request does not set one.
    #[serde(default)]
    pub default_retry: RetryPolicy,
    /// Whether operators may clear a queue's draining flag. Off by default:
    /// drain is normally a one-way ramp toward shutdown.
    #[serde(default)]
    pub allow_drain_reset: bool,
    /// Health scoring thresholds.
    #[serde(default)]
    pub health: HealthThresholds,
}

/// How long a terminal job stays queryable in its scheduler.
const TERMINAL_RETENTION_DAYS: i64 = 7;
/// Hard cap on retained terminal jobs per queue.
const TERMINAL_JOB_CAP: usize = 10_000;
/// How often the background sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

fn default_concurrency() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_concurrency: default_concurrency(),
            concurrency_overrides: HashMap::new(),
            default_timeout_secs: default_timeout_secs(),
            default_retry: RetryPolicy::default(),
            allow_drain_reset: false,
            health: HealthThresholds::default(),
        }
    }
}

impl EngineConfig {
    /// The default per-attempt timeout as a [`Duration`].
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Override one queue's concurrency limit.
    pub fn with_concurrency(mut self, queue: QueueType, limit: usize) -> Self {
        self.concurrency_overrides.insert(queue, limit);
        self
    }

    /// Set the retry policy applied when a request does not set one.
    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    /// Allow operators to clear a queue's draining flag.
    pub fn with_drain_reset(mut self) -> Self {
        self.allow_drain_reset = true;
        self
    }

    /// Set the health scoring thresholds.
    pub fn with_health_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.health = thresholds;
        self
    }
}

/// What the caller gets back from a single-job submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReceipt {
    /// The admitted job's id.
    pub job_id: Uuid,
    /// The queue the job was routed to.
    pub queue_type: QueueType,
    /// The job's state right after admission.
    pub state: JobState,
}

/// What the caller gets back from a workflow submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReceipt {
    /// The workflow's id.
    pub workflow_id: Uuid,
    /// Constituent job ids, in step order.
    pub job_ids: Vec<Uuid>,
    /// The workflow's state right after submission.
    pub state: WorkflowState,
}

struct EngineInner {
    config: EngineConfig,
    registry: Arc<AgentRegistry>,
    schedulers: HashMap<QueueType, Arc<QueueScheduler>>,
    control: QueueControl,
    resolver: DependencyResolver,
    coordinator: WorkflowCoordinator,
    health: HealthAggregator,
    /// Job id → queue routing, for lookups and dependency validation.
    job_index: RwLock<HashMap<Uuid, QueueType>>,
    /// Whether the background sweep task has been spawned.
    sweeper_started: AtomicBool,
}

/// The queue engine: admission, dispatch, workflows, control, and health.
///
/// Dispatch is event-driven rather than polled: the engine pumps a queue
/// whenever something could have made a job dispatchable (a submission, a
/// completion, a resume, an expired retry backoff). Each pump drains the
/// queue's eligible jobs into spawned attempts until a concurrency slot or
/// eligible job runs out.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct QueueEngine {
    inner: Arc<EngineInner>,
}

impl QueueEngine {
    /// Create an engine with default configuration.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    /// Create an engine with explicit configuration.
    pub fn with_config(registry: Arc<AgentRegistry>, config: EngineConfig) -> Self {
        let mut schedulers = HashMap::new();
        for queue in QueueType::ALL {
            let limit = config
                .concurrency_overrides
                .get(&queue)
                .copied()
                .unwrap_or(config.default_concurrency);
            schedulers.insert(queue, Arc::new(QueueScheduler::new(queue, limit)));
        }
        let control = QueueControl::new(schedulers.clone(), config.allow_drain_reset);
        let health = HealthAggregator::new(config.health.clone());
        Self {
            inner: Arc::new(EngineInner {
                registry,
                schedulers,
                control,
                resolver: DependencyResolver::new(),
                coordinator: WorkflowCoordinator::new(),
                health,
                job_index: RwLock::new(HashMap::new()),
                sweeper_started: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// The executor registry this engine dispatches through.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.inner.registry
    }

    // --- submission ---

    /// Validate and admit a single agent job.
    ///
    /// Dependencies must reference already-admitted jobs. A job whose
    /// deadline has already passed is admitted directly as Cancelled.
    pub async fn execute_agent(&self, request: AgentQueueRequest) -> LabflowResult<JobReceipt> {
        if !self.inner.registry.can_execute(&request.agent_type).await {
            return Err(LabflowError::UnknownAgentType(request.agent_type));
        }
        {
            let index = self.inner.job_index.read().await;
            for dep in &request.dependencies {
                if !index.contains_key(dep) {
                    return Err(LabflowError::InvalidRequest(format!(
                        "unknown dependency job {dep}"
                    )));
                }
            }
        }
        let job = Job::from_request(
            request,
            self.inner.config.default_timeout(),
            &self.inner.config.default_retry,
        )?;
        self.admit(job).await
    }

    /// Validate and admit a multi-step workflow.
    ///
    /// Every step's agent type must be executable and no involved queue may
    /// be draining. Steps become ordinary jobs: a sequential workflow chains
    /// each step onto the previous one, a parallel workflow submits
    /// independent jobs.
    pub async fn execute_workflow(
        &self,
        request: WorkflowRequest,
    ) -> LabflowResult<WorkflowReceipt> {
        for step in &request.steps {
            if !self.inner.registry.can_execute(&step.agent_type).await {
                return Err(LabflowError::UnknownAgentType(step.agent_type.clone()));
            }
        }

        let (workflow, jobs) = WorkflowCoordinator::expand_request(
            request,
            self.inner.config.default_timeout(),
            &self.inner.config.default_retry,
        )?;

        let edges: Vec<(Uuid, Vec<Uuid>)> = jobs
            .iter()
            .map(|job| (job.id, job.dependencies.clone()))
            .collect();
        if has_cycle(&edges) {
            return Err(LabflowError::InvalidRequest(
                "workflow steps form a dependency cycle".to_string(),
            ));
        }

        let involved: HashSet<QueueType> = jobs.iter().map(|job| job.queue_type).collect();
        for queue in involved {
            if let Some(scheduler) = self.inner.schedulers.get(&queue) {
                if scheduler.is_draining().await {
                    return Err(LabflowError::QueueDraining(queue.to_string()));
                }
            }
        }

        let workflow_id = workflow.id;
        let job_ids = workflow.job_ids.clone();
        self.inner.coordinator.register(workflow, &jobs).await;
        info!(workflow_id = %workflow_id, steps = job_ids.len(), "workflow admitted");

        for job in jobs {
            let job_id = job.id;
            if let Err(err) = self.admit(job).await {
                // A queue can start draining between the upfront check and
                // this submission. Record the step as cancelled; later steps
                // depending on it are refused at their own registration.
                warn!(
                    workflow_id = %workflow_id,
                    job_id = %job_id,
                    error = %err,
                    "workflow step refused at submission"
                );
                self.inner.resolver.mark_failed(job_id).await;
                self.note_workflow_state(
                    Some(workflow_id),
                    job_id,
                    JobState::Cancelled {
                        reason: err.to_string(),
                    },
                )
                .await;
            }
        }

        let state = self
            .inner
            .coordinator
            .workflow(workflow_id)
            .await
            .map(|snapshot| snapshot.workflow.state)
            .unwrap_or(WorkflowState::Running);
        Ok(WorkflowReceipt {
            workflow_id,
            job_ids,
            state,
        })
    }

    // --- queries ---

    /// Look up one job by id.
    pub async fn job(&self, job_id: Uuid) -> Option<Job> {
        let queue = *self.inner.job_index.read().await.get(&job_id)?;
        self.inner.schedulers.get(&queue)?.job(job_id).await
    }

    /// Point-in-time statistics for one queue.
    pub async fn queue_stats(&self, queue: QueueType) -> LabflowResult<QueueStats> {
        Ok(self.scheduler(queue)?.stats().await)
    }

    /// Point-in-time status of the whole engine.
    pub async fn system_status(&self) -> SystemStatus {
        SystemStatus {
            queues: self.all_stats().await,
            active_workflows: self.inner.coordinator.active_count().await,
            registered_agents: self.inner.registry.registered_agents().await,
            generated_at: Utc::now(),
        }
    }

    /// Snapshot one workflow and its jobs' last observed states.
    pub async fn workflow(&self, workflow_id: Uuid) -> Option<WorkflowSnapshot> {
        self.inner.coordinator.workflow(workflow_id).await
    }

    /// Snapshot every workflow not yet in a terminal state.
    pub async fn active_workflows(&self) -> Vec<WorkflowSnapshot> {
        self.inner.coordinator.active_workflows().await
    }

    /// Health evaluation across every queue.
    pub async fn system_health(&self) -> SystemHealth {
        let stats = self.all_stats().await;
        self.inner.health.system_health(&stats).await
    }

    /// Windowed performance metrics for one queue.
    pub async fn queue_metrics(&self, queue: QueueType, range: TimeRange) -> QueueMetrics {
        self.inner.health.queue_metrics(queue, range).await
    }

    // --- queue control ---

    /// Stop dispatching from a queue; in-flight jobs finish.
    pub async fn pause_queue(&self, queue: QueueType) -> LabflowResult<()> {
        self.inner.control.pause(queue).await
    }

    /// Allow dispatching from a queue again and dispatch whatever is ready.
    pub async fn resume_queue(&self, queue: QueueType) -> LabflowResult<()> {
        self.inner.control.resume(queue).await?;
        self.pump(queue).await;
        Ok(())
    }

    /// Refuse new submissions to a queue while letting existing work finish.
    pub async fn drain_queue(&self, queue: QueueType) -> LabflowResult<()> {
        self.inner.control.drain(queue).await
    }

    /// Clear a queue's draining flag, if the configuration allows it.
    pub async fn reset_drain(&self, queue: QueueType) -> LabflowResult<()> {
        self.inner.control.reset_drain(queue).await
    }

    // --- internals ---

    fn scheduler(&self, queue: QueueType) -> LabflowResult<Arc<QueueScheduler>> {
        self.inner
            .schedulers
            .get(&queue)
            .cloned()
            .ok_or_else(|| LabflowError::Queue(format!("no scheduler for queue {queue}")))
    }

    async fn all_stats(&self) -> Vec<QueueStats> {
        let mut stats = Vec::with_capacity(QueueType::ALL.len());
        for queue in QueueType::ALL {
            if let Some(scheduler) = self.inner.schedulers.get(&queue) {
                stats.push(scheduler.stats().await);
            }
        }
        stats
    }

    /// Spawn the background sweep task on first use.
    ///
    /// Started lazily from admission rather than construction so the engine
    /// can be built outside a runtime. The task holds a weak reference and
    /// exits once the last engine handle is dropped.
    fn ensure_sweeper(&self) {
        if self.inner.sweeper_started.swap(true, Ordering::Relaxed) {
            return;
        }
        let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                QueueEngine { inner }.sweep().await;
            }
        });
    }

    /// One pass of the background sweep: cancel deadline-expired jobs that
    /// no queue activity has surfaced, then enforce terminal retention.
    async fn sweep(&self) {
        let now = Utc::now();
        for queue in QueueType::ALL {
            let Some(scheduler) = self.inner.schedulers.get(&queue) else {
                continue;
            };
            let expired = scheduler.cancel_expired(now).await;
            if !expired.is_empty() {
                self.propagate_cancellations(
                    expired.into_iter().map(|cancelled| (queue, cancelled)).collect(),
                )
                .await;
            }
            self.evict_terminal(queue).await;
        }
        self.inner.coordinator.prune_terminal().await;
    }

    /// Evict terminal jobs past the retention horizon or beyond the cap,
    /// dropping their index and dependency bookkeeping with them.
    async fn evict_terminal(&self, queue: QueueType) {
        let Some(scheduler) = self.inner.schedulers.get(&queue) else {
            return;
        };
        let horizon = Utc::now() - chrono::Duration::days(TERMINAL_RETENTION_DAYS);
        let evicted = scheduler.evict_terminal(horizon, TERMINAL_JOB_CAP).await;
        if evicted.is_empty() {
            return;
        }
        {
            let mut index = self.inner.job_index.write().await;
            for job_id in &evicted {
                index.remove(job_id);
            }
        }
        self.inner.resolver.forget(&evicted).await;
    }

    async fn admit(&self, job: Job) -> LabflowResult<JobReceipt> {
        self.ensure_sweeper();
        let queue = job.queue_type;
        let job_id = job.id;
        let workflow_id = job.workflow_id;
        let dependencies = job.dependencies.clone();
        let agent_type = job.agent_type.clone();

        let scheduler = self.scheduler(queue)?;
        let admission = scheduler.submit(job).await?;
        self.inner.job_index.write().await.insert(job_id, queue);
        info!(job_id = %job_id, agent = %agent_type, queue = %queue, "job admitted");

        match admission {
            Admission::Cancelled(cancelled) => {
                let state = JobState::Cancelled {
                    reason: cancelled.reason.clone(),
                };
                self.propagate_cancellations(vec![(queue, cancelled)]).await;
                Ok(JobReceipt {
                    job_id,
                    queue_type: queue,
                    state,
                })
            }
            Admission::Pending => {
                let state = match self
                    .inner
                    .resolver
                    .register(job_id, queue, &dependencies)
                    .await
                {
                    RegisterOutcome::Ready => {
                        scheduler.make_eligible(job_id).await;
                        self.note_workflow_state(workflow_id, job_id, JobState::Eligible)
                            .await;
                        JobState::Eligible
                    }
                    RegisterOutcome::Waiting => JobState::Pending,
                    RegisterOutcome::DependencyFailed(dep) => {
                        let reason =
                            LabflowError::DependencyFailed(format!("job {dep} failed")).to_string();
                        if let Some(cancelled) = scheduler.cancel(job_id, reason.clone()).await {
                            self.propagate_cancellations(vec![(queue, cancelled)]).await;
                        }
                        return Ok(JobReceipt {
                            job_id,
                            queue_type: queue,
                            state: JobState::Cancelled { reason },
                        });
                    }
                };
                self.pump(queue).await;
                Ok(JobReceipt {
                    job_id,
                    queue_type: queue,
                    state,
                })
            }
        }
    }

    /// Dispatch eligible jobs from a queue until it runs out of slots or
    /// work. Deadline-expired jobs surfaced by the scheduler are propagated
    /// before anything is dispatched.
    fn pump(
        &self,
        queue: QueueType,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let Some(scheduler) = self.inner.schedulers.get(&queue) else {
            return;
        };
        loop {
            let (expired, ticket) = scheduler.take_next(Utc::now()).await;
            if !expired.is_empty() {
                self.propagate_cancellations(
                    expired.into_iter().map(|cancelled| (queue, cancelled)).collect(),
                )
                .await;
            }
            let Some(ticket) = ticket else { break };
            self.note_workflow_state(ticket.workflow_id, ticket.job_id, JobState::Running)
                .await;
            info!(
                job_id = %ticket.job_id,
                agent = %ticket.agent_type,
                queue = %queue,
                attempt = ticket.attempt,
                "dispatching job"
            );
            let engine = self.clone();
            tokio::spawn(async move {
                engine.run_attempt(queue, ticket).await;
            });
        }
        })
    }

    /// Run one execution attempt under the job's timeout.
    async fn run_attempt(&self, queue: QueueType, ticket: DispatchTicket) {
        let outcome = match self.inner.registry.resolve(&ticket.agent_type).await {
            Some(executor) => {
                match tokio::time::timeout(
                    ticket.timeout,
                    executor.execute(&ticket.agent_type, &ticket.payload),
                )
                .await
                {
                    Ok(Ok(result)) => AttemptOutcome::Success(result),
                    Ok(Err(err)) => AttemptOutcome::Failure(err.to_string()),
                    Err(_) => AttemptOutcome::Failure(format!(
                        "attempt timed out after {}ms",
                        ticket.timeout.as_millis()
                    )),
                }
            }
            None => AttemptOutcome::Failure(format!(
                "no executor registered for agent type '{}'",
                ticket.agent_type
            )),
        };
        self.on_attempt_done(queue, ticket, outcome).await;
    }

    async fn on_attempt_done(
        &self,
        queue: QueueType,
        ticket: DispatchTicket,
        outcome: AttemptOutcome,
    ) {
        let Some(scheduler) = self.inner.schedulers.get(&queue) else {
            return;
        };
        let action = match scheduler.complete(ticket.job_id, outcome).await {
            Ok(action) => action,
            Err(err) => {
                error!(job_id = %ticket.job_id, error = %err, "failed to record attempt outcome");
                return;
            }
        };

        match action {
            CompletionAction::Succeeded { workflow_id, sample } => {
                info!(job_id = %ticket.job_id, queue = %queue, "job succeeded");
                self.inner.health.record(queue, sample).await;
                self.note_workflow_state(workflow_id, ticket.job_id, JobState::Succeeded)
                    .await;

                let mut touched = HashSet::from([queue]);
                for (dependent_id, dependent_queue) in
                    self.inner.resolver.mark_succeeded(ticket.job_id).await
                {
                    let Some(dep_scheduler) = self.inner.schedulers.get(&dependent_queue) else {
                        continue;
                    };
                    if dep_scheduler.make_eligible(dependent_id).await {
                        if let Some(dependent) = dep_scheduler.job(dependent_id).await {
                            self.note_workflow_state(
                                dependent.workflow_id,
                                dependent_id,
                                JobState::Eligible,
                            )
                            .await;
                        }
                        touched.insert(dependent_queue);
                    }
                }
                for touched_queue in touched {
                    self.pump(touched_queue).await;
                }
            }
            CompletionAction::Retry { delay, .. } => {
                self.note_workflow_state(ticket.workflow_id, ticket.job_id, JobState::Pending)
                    .await;
                let engine = self.clone();
                let job_id = ticket.job_id;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(scheduler) = engine.inner.schedulers.get(&queue) else {
                        return;
                    };
                    if scheduler.make_eligible(job_id).await {
                        engine.pump(queue).await;
                    }
                });
                // The freed slot may admit another eligible job right away.
                self.pump(queue).await;
            }
            CompletionAction::Failed {
                workflow_id,
                reason,
                sample,
            } => {
                warn!(
                    job_id = %ticket.job_id,
                    queue = %queue,
                    reason = %reason,
                    "job failed after final attempt"
                );
                self.inner.health.record(queue, sample).await;

                let mut worklist = Vec::new();
                for (dependent_id, dependent_queue) in
                    self.inner.resolver.mark_failed(ticket.job_id).await
                {
                    if let Some(cancelled) = self
                        .cancel_in(
                            dependent_queue,
                            dependent_id,
                            LabflowError::DependencyFailed(format!("job {} failed", ticket.job_id))
                                .to_string(),
                        )
                        .await
                    {
                        worklist.push((dependent_queue, cancelled));
                    }
                }
                let actions = self
                    .note_workflow_state(workflow_id, ticket.job_id, JobState::Failed { reason })
                    .await;
                for WorkflowAction::CancelJobs(siblings) in actions {
                    for (sibling_id, sibling_queue) in siblings {
                        if let Some(cancelled) = self
                            .cancel_in(sibling_queue, sibling_id, "sibling step failed")
                            .await
                        {
                            worklist.push((sibling_queue, cancelled));
                        }
                    }
                }
                self.propagate_cancellations(worklist).await;
                self.pump(queue).await;
            }
        }
    }

    /// Record cancelled jobs and follow every consequence: health samples,
    /// workflow state (including fail-fast sibling cancellation), and
    /// transitive dependent cancellation. Works through an explicit worklist
    /// because each cancellation can produce further ones across queues.
    async fn propagate_cancellations(&self, mut worklist: Vec<(QueueType, CancelledJob)>) {
        while let Some((queue, cancelled)) = worklist.pop() {
            self.inner.health.record(queue, cancelled.sample.clone()).await;

            let state = JobState::Cancelled {
                reason: cancelled.reason.clone(),
            };
            let actions = self
                .note_workflow_state(cancelled.workflow_id, cancelled.job_id, state)
                .await;
            for WorkflowAction::CancelJobs(siblings) in actions {
                for (sibling_id, sibling_queue) in siblings {
                    if let Some(sibling) = self
                        .cancel_in(sibling_queue, sibling_id, "sibling step failed")
                        .await
                    {
                        worklist.push((sibling_queue, sibling));
                    }
                }
            }

            for (dependent_id, dependent_queue) in
                self.inner.resolver.mark_failed(cancelled.job_id).await
            {
                if let Some(dependent) = self
                    .cancel_in(
                        dependent_queue,
                        dependent_id,
                        LabflowError::DependencyFailed(format!("job {} failed", cancelled.job_id))
                            .to_string(),
                    )
                    .await
                {
                    worklist.push((dependent_queue, dependent));
                }
            }
        }
    }

    async fn cancel_in(
        &self,
        queue: QueueType,
        job_id: Uuid,
        reason: impl Into<String>,
    ) -> Option<CancelledJob> {
        match self.inner.schedulers.get(&queue) {
            Some(scheduler) => scheduler.cancel(job_id, reason).await,
            None => None,
        }
    }

    async fn note_workflow_state(
        &self,
        workflow_id: Option<Uuid>,
        job_id: Uuid,
        state: JobState,
    ) -> Vec<WorkflowAction> {
        match workflow_id {
            Some(workflow_id) => {
                self.inner
                    .coordinator
                    .note_job_state(workflow_id, job_id, state)
                    .await
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::executor::AgentExecutor;
    use async_trait::async_trait;

    struct EchoExecutor;

    #[async_trait]
    impl AgentExecutor for EchoExecutor {
        async fn execute(
            &self,
            _agent_type: &str,
            payload: &serde_json::Value,
        ) -> LabflowResult<serde_json::Value> {
            Ok(payload.clone())
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl AgentExecutor for FailingExecutor {
        async fn execute(
            &self,
            _agent_type: &str,
            _payload: &serde_json::Value,
        ) -> LabflowResult<serde_json::Value> {
            Err(LabflowError::ExecutionFailed("agent crashed".to_string()))
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl AgentExecutor for SlowExecutor {
        async fn execute(
            &self,
            _agent_type: &str,
            payload: &serde_json::Value,
        ) -> LabflowResult<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(payload.clone())
        }
    }

    async fn engine_with(agent: &str, executor: Arc<dyn AgentExecutor>) -> QueueEngine {
        let registry = Arc::new(AgentRegistry::new());
        registry.register(agent, executor).await;
        QueueEngine::new(registry)
    }

    async fn wait_for_terminal(engine: &QueueEngine, job_id: Uuid) -> Job {
        for _ in 0..500 {
            if let Some(job) = engine.job(job_id).await {
                if job.state.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not reach a terminal state");
    }

    #[tokio::test]
    async fn test_unknown_agent_type_rejected() {
        let engine = engine_with("seo-analyzer", Arc::new(EchoExecutor)).await;
        let result = engine
            .execute_agent(AgentQueueRequest::new("no-such-agent", serde_json::json!({})))
            .await;
        assert!(matches!(result, Err(LabflowError::UnknownAgentType(_))));
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let engine = engine_with("seo-analyzer", Arc::new(EchoExecutor)).await;
        let request = AgentQueueRequest::new("seo-analyzer", serde_json::json!({}))
            .with_dependencies(vec![Uuid::new_v4()]);
        let result = engine.execute_agent(request).await;
        assert!(matches!(result, Err(LabflowError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_job_runs_to_success() {
        let engine = engine_with("seo-analyzer", Arc::new(EchoExecutor)).await;
        let payload = serde_json::json!({"url": "https://lab.example"});
        let receipt = engine
            .execute_agent(AgentQueueRequest::new("seo-analyzer", payload.clone()))
            .await
            .unwrap();
        assert_eq!(receipt.queue_type, QueueType::Analytics);

        let job = wait_for_terminal(&engine, receipt.job_id).await;
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.result, Some(payload));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_marks_failed() {
        let engine = engine_with("seo-analyzer", Arc::new(FailingExecutor)).await;
        let request = AgentQueueRequest::new("seo-analyzer", serde_json::json!({}));
        let receipt = engine.execute_agent(request).await.unwrap();

        let job = wait_for_terminal(&engine, receipt.job_id).await;
        assert_eq!(job.attempts, 3);
        match job.state {
            JobState::Failed { reason } => assert!(reason.contains("agent crashed")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let engine = engine_with("seo-analyzer", Arc::new(SlowExecutor)).await;
        let request = AgentQueueRequest::new("seo-analyzer", serde_json::json!({}))
            .with_timeout(Duration::from_secs(1))
            .with_retry(RetryPolicy {
                max_attempts: 1,
                ..Default::default()
            });
        let receipt = engine.execute_agent(request).await.unwrap();

        let job = wait_for_terminal(&engine, receipt.job_id).await;
        match job.state {
            JobState::Failed { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drain_refuses_new_submissions() {
        let engine = engine_with("seo-analyzer", Arc::new(EchoExecutor)).await;
        engine.drain_queue(QueueType::Analytics).await.unwrap();

        let result = engine
            .execute_agent(AgentQueueRequest::new("seo-analyzer", serde_json::json!({})))
            .await;
        assert!(matches!(result, Err(LabflowError::QueueDraining(_))));
    }

    #[tokio::test]
    async fn test_dependency_chain_runs_in_order() {
        let engine = engine_with("seo-analyzer", Arc::new(EchoExecutor)).await;
        let first = engine
            .execute_agent(AgentQueueRequest::new("seo-analyzer", serde_json::json!({"n": 1})))
            .await
            .unwrap();
        let second = engine
            .execute_agent(
                AgentQueueRequest::new("seo-analyzer", serde_json::json!({"n": 2}))
                    .with_dependencies(vec![first.job_id]),
            )
            .await
            .unwrap();

        let first_done = wait_for_terminal(&engine, first.job_id).await;
        let second_done = wait_for_terminal(&engine, second.job_id).await;
        assert_eq!(first_done.state, JobState::Succeeded);
        assert_eq!(second_done.state, JobState::Succeeded);
        assert!(second_done.started_at.unwrap() >= first_done.finished_at.unwrap());
    }

    #[tokio::test]
    async fn test_failed_dependency_cancels_dependent() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register("seo-analyzer", Arc::new(FailingExecutor)).await;
        registry.register("report-builder", Arc::new(EchoExecutor)).await;
        let config = EngineConfig::default().with_default_retry(RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        });
        let engine = QueueEngine::with_config(registry, config);

        let first = engine
            .execute_agent(AgentQueueRequest::new("seo-analyzer", serde_json::json!({})))
            .await
            .unwrap();
        let second = engine
            .execute_agent(
                AgentQueueRequest::new("report-builder", serde_json::json!({}))
                    .with_dependencies(vec![first.job_id]),
            )
            .await
            .unwrap();

        let dependent = wait_for_terminal(&engine, second.job_id).await;
        match dependent.state {
            JobState::Cancelled { reason } => assert!(reason.contains("Dependency failed")),
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(dependent.attempts, 0);
    }

    #[tokio::test]
    async fn test_deadline_enforced_without_queue_activity() {
        let engine = engine_with("seo-analyzer", Arc::new(EchoExecutor)).await;
        engine.pause_queue(QueueType::Analytics).await.unwrap();

        let request = AgentQueueRequest::new("seo-analyzer", serde_json::json!({}))
            .with_deadline(Utc::now() + chrono::Duration::milliseconds(500));
        let receipt = engine.execute_agent(request).await.unwrap();

        // Nothing touches the queue after admission; the background sweep
        // alone must notice the expired deadline.
        let job = wait_for_terminal(&engine, receipt.job_id).await;
        match job.state {
            JobState::Cancelled { reason } => assert!(reason.contains("Deadline exceeded")),
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_system_status_shape() {
        let engine = engine_with("seo-analyzer", Arc::new(EchoExecutor)).await;
        let status = engine.system_status().await;
        assert_eq!(status.queues.len(), QueueType::ALL.len());
        assert_eq!(status.active_workflows, 0);
        assert_eq!(status.registered_agents, vec!["seo-analyzer".to_string()]);
    }

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.default_concurrency, 4);
        assert_eq!(config.default_timeout_secs, 300);
        assert!(!config.allow_drain_reset);
        assert!(config.concurrency_overrides.is_empty());
    }
}
