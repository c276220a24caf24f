use crate::types::{
    Job, JobState, QueueType, RetryPolicy, Workflow, WorkflowRequest, WorkflowState,
};
use chrono::Utc;
use labflow_core::{LabflowError, LabflowResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// How long a terminal workflow record stays queryable.
const WORKFLOW_RETENTION_DAYS: i64 = 7;
/// Hard cap on retained terminal workflow records.
const WORKFLOW_CAP: usize = 1_000;

/// Follow-up work the engine must perform after a job transition.
#[derive(Debug, Clone)]
pub(crate) enum WorkflowAction {
    /// Cancel these not-yet-started sibling jobs (fail-fast).
    CancelJobs(Vec<(Uuid, QueueType)>),
}

/// One constituent job's identity and last observed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJobSnapshot {
    /// The job's id.
    pub job_id: Uuid,
    /// The agent type the job runs.
    pub agent_type: String,
    /// The queue the job was admitted to.
    pub queue_type: QueueType,
    /// Last observed lifecycle state.
    pub state: JobState,
}

/// A consistent snapshot of one workflow and its jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// The workflow record, including aggregate state.
    pub workflow: Workflow,
    /// Constituent jobs in step order.
    pub jobs: Vec<WorkflowJobSnapshot>,
}

struct JobRef {
    id: Uuid,
    agent_type: String,
    queue_type: QueueType,
}

struct WorkflowRecord {
    workflow: Workflow,
    jobs: Vec<JobRef>,
    states: HashMap<Uuid, JobState>,
}

/// Tracks workflows and their constituent jobs' states, and decides the
/// aggregate terminal state.
///
/// All records live behind one lock, so `active_workflows` returns a
/// point-in-time consistent view: a caller never observes a workflow's job
/// list mid-transition.
pub(crate) struct WorkflowCoordinator {
    records: RwLock<HashMap<Uuid, WorkflowRecord>>,
}

impl WorkflowCoordinator {
    pub(crate) fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Expand a workflow request into a workflow record and its jobs.
    ///
    /// Sequential workflows chain each step's job onto the previous step's;
    /// parallel workflows create mutually independent jobs.
    pub(crate) fn expand_request(
        request: WorkflowRequest,
        default_timeout: Duration,
        default_retry: &RetryPolicy,
    ) -> LabflowResult<(Workflow, Vec<Job>)> {
        if request.steps.is_empty() {
            return Err(LabflowError::InvalidRequest(
                "workflow must contain at least one step".to_string(),
            ));
        }

        let workflow_id = Uuid::new_v4();
        let retry = request
            .options
            .retry
            .clone()
            .unwrap_or_else(|| default_retry.clone());

        let mut jobs: Vec<Job> = Vec::with_capacity(request.steps.len());
        for step in &request.steps {
            let dependencies = if request.options.parallel_execution {
                Vec::new()
            } else {
                jobs.last().map(|prev| vec![prev.id]).unwrap_or_default()
            };

            let step_request = crate::types::AgentQueueRequest {
                agent_type: step.agent_type.clone(),
                payload: step.payload.clone(),
                priority: step.priority.unwrap_or(request.priority),
                resources: None,
                deadline: step.deadline.or(request.options.deadline),
                dependencies,
                timeout: None,
                retry: Some(retry.clone()),
                metadata: Default::default(),
            };
            let mut job = Job::from_request(step_request, default_timeout, default_retry)?;
            job.workflow_id = Some(workflow_id);
            jobs.push(job);
        }

        let workflow = Workflow {
            id: workflow_id,
            business_id: request.business_id,
            user_id: request.user_id,
            priority: request.priority,
            job_ids: jobs.iter().map(|job| job.id).collect(),
            options: request.options,
            state: WorkflowState::Running,
            created_at: Utc::now(),
            finished_at: None,
        };

        Ok((workflow, jobs))
    }

    /// Register a freshly expanded workflow before its jobs are submitted.
    pub(crate) async fn register(&self, workflow: Workflow, jobs: &[Job]) {
        let record = WorkflowRecord {
            jobs: jobs
                .iter()
                .map(|job| JobRef {
                    id: job.id,
                    agent_type: job.agent_type.clone(),
                    queue_type: job.queue_type,
                })
                .collect(),
            states: jobs
                .iter()
                .map(|job| (job.id, JobState::Pending))
                .collect(),
            workflow,
        };
        let mut records = self.records.write().await;
        records.insert(record.workflow.id, record);
    }

    /// Record a job state change and, on terminal transitions, re-evaluate
    /// the workflow's aggregate state.
    pub(crate) async fn note_job_state(
        &self,
        workflow_id: Uuid,
        job_id: Uuid,
        state: JobState,
    ) -> Vec<WorkflowAction> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&workflow_id) else {
            return Vec::new();
        };

        let terminal = state.is_terminal();
        record.states.insert(job_id, state.clone());

        if record.workflow.state.is_terminal() || !terminal {
            return Vec::new();
        }

        if let JobState::Failed { reason } = &state {
            if record.workflow.options.fail_fast {
                let agent = record
                    .jobs
                    .iter()
                    .find(|j| j.id == job_id)
                    .map(|j| j.agent_type.as_str())
                    .unwrap_or("unknown");
                record.workflow.state = WorkflowState::Failed {
                    reason: format!("step '{agent}' failed: {reason}"),
                };
                record.workflow.finished_at = Some(Utc::now());
                info!(workflow_id = %workflow_id, "workflow failed fast, cancelling remaining steps");

                let to_cancel: Vec<(Uuid, QueueType)> = record
                    .jobs
                    .iter()
                    .filter(|j| {
                        j.id != job_id
                            && record
                                .states
                                .get(&j.id)
                                .map(|s| !s.is_terminal())
                                .unwrap_or(false)
                    })
                    .map(|j| (j.id, j.queue_type))
                    .collect();
                return vec![WorkflowAction::CancelJobs(to_cancel)];
            }
        }

        let all_terminal = record
            .jobs
            .iter()
            .all(|j| record.states.get(&j.id).is_some_and(JobState::is_terminal));
        if !all_terminal {
            return Vec::new();
        }

        let first_failed = record.jobs.iter().find_map(|j| {
            match record.states.get(&j.id) {
                Some(JobState::Failed { reason }) => {
                    Some(format!("step '{}' failed: {reason}", j.agent_type))
                }
                _ => None,
            }
        });
        let first_cancelled = record.jobs.iter().find_map(|j| {
            match record.states.get(&j.id) {
                Some(JobState::Cancelled { reason }) => {
                    Some(format!("step '{}' cancelled: {reason}", j.agent_type))
                }
                _ => None,
            }
        });

        record.workflow.state = if let Some(reason) = first_failed {
            WorkflowState::Failed { reason }
        } else if let Some(reason) = first_cancelled {
            WorkflowState::Cancelled { reason }
        } else {
            WorkflowState::Completed
        };
        record.workflow.finished_at = Some(Utc::now());
        info!(
            workflow_id = %workflow_id,
            state = ?record.workflow.state,
            "workflow reached terminal state"
        );

        Vec::new()
    }

    /// Snapshot every workflow not yet in a terminal state.
    pub(crate) async fn active_workflows(&self) -> Vec<WorkflowSnapshot> {
        let records = self.records.read().await;
        let mut active: Vec<WorkflowSnapshot> = records
            .values()
            .filter(|record| !record.workflow.state.is_terminal())
            .map(snapshot_of)
            .collect();
        active.sort_by_key(|snapshot| snapshot.workflow.created_at);
        active
    }

    /// Number of workflows not yet terminal.
    pub(crate) async fn active_count(&self) -> usize {
        let records = self.records.read().await;
        records
            .values()
            .filter(|record| !record.workflow.state.is_terminal())
            .count()
    }

    /// Snapshot one workflow by id, terminal or not.
    pub(crate) async fn workflow(&self, workflow_id: Uuid) -> Option<WorkflowSnapshot> {
        let records = self.records.read().await;
        records.get(&workflow_id).map(snapshot_of)
    }

    /// Drop terminal workflow records past the retention horizon or beyond
    /// the retained cap.
    pub(crate) async fn prune_terminal(&self) -> usize {
        let horizon = Utc::now() - chrono::Duration::days(WORKFLOW_RETENTION_DAYS);
        self.prune_terminal_with(horizon, WORKFLOW_CAP).await
    }

    /// Retention mechanism: remove terminal records finished before
    /// `horizon`, then the oldest terminal records beyond `cap`. Running
    /// workflows are never touched.
    pub(crate) async fn prune_terminal_with(
        &self,
        horizon: chrono::DateTime<Utc>,
        cap: usize,
    ) -> usize {
        let mut records = self.records.write().await;
        let mut terminal: Vec<(chrono::DateTime<Utc>, Uuid)> = records
            .values()
            .filter(|record| record.workflow.state.is_terminal())
            .map(|record| {
                let finished = record
                    .workflow
                    .finished_at
                    .unwrap_or(record.workflow.created_at);
                (finished, record.workflow.id)
            })
            .collect();
        terminal.sort_unstable();

        let mut remaining = terminal.len();
        let mut pruned = 0;
        for (finished_at, workflow_id) in terminal {
            if finished_at < horizon || remaining > cap {
                records.remove(&workflow_id);
                remaining -= 1;
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, "pruned terminal workflow records");
        }
        pruned
    }
}

fn snapshot_of(record: &WorkflowRecord) -> WorkflowSnapshot {
    WorkflowSnapshot {
        workflow: record.workflow.clone(),
        jobs: record
            .jobs
            .iter()
            .map(|j| WorkflowJobSnapshot {
                job_id: j.id,
                agent_type: j.agent_type.clone(),
                queue_type: j.queue_type,
                state: record
                    .states
                    .get(&j.id)
                    .cloned()
                    .unwrap_or(JobState::Pending),
            })
            .collect(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{JobPriority, WorkflowOptions, WorkflowStep};

    fn request(steps: Vec<WorkflowStep>, options: WorkflowOptions) -> WorkflowRequest {
        WorkflowRequest {
            business_id: "biz-1".to_string(),
            user_id: "user-1".to_string(),
            priority: JobPriority::Normal,
            steps,
            options,
        }
    }

    fn two_step_request(options: WorkflowOptions) -> WorkflowRequest {
        request(
            vec![
                WorkflowStep::new("content-generator", serde_json::json!({"n": 1})),
                WorkflowStep::new("seo-analyzer", serde_json::json!({"n": 2})),
            ],
            options,
        )
    }

    fn expand(request: WorkflowRequest) -> (Workflow, Vec<Job>) {
        WorkflowCoordinator::expand_request(
            request,
            Duration::from_secs(60),
            &RetryPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let result = WorkflowCoordinator::expand_request(
            request(vec![], WorkflowOptions::default()),
            Duration::from_secs(60),
            &RetryPolicy::default(),
        );
        assert!(matches!(result, Err(LabflowError::InvalidRequest(_))));
    }

    #[test]
    fn test_sequential_expansion_chains_steps() {
        let (workflow, jobs) = expand(two_step_request(WorkflowOptions::default()));
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].dependencies.is_empty());
        assert_eq!(jobs[1].dependencies, vec![jobs[0].id]);
        assert_eq!(workflow.job_ids, vec![jobs[0].id, jobs[1].id]);
        assert!(jobs.iter().all(|j| j.workflow_id == Some(workflow.id)));
    }

    #[test]
    fn test_parallel_expansion_has_no_chains() {
        let options = WorkflowOptions {
            parallel_execution: true,
            ..Default::default()
        };
        let (_, jobs) = expand(two_step_request(options));
        assert!(jobs.iter().all(|j| j.dependencies.is_empty()));
    }

    #[test]
    fn test_step_priority_and_deadline_overrides() {
        let deadline = Utc::now() + chrono::Duration::hours(1);
        let step_deadline = Utc::now() + chrono::Duration::minutes(5);
        let options = WorkflowOptions {
            deadline: Some(deadline),
            ..Default::default()
        };
        let steps = vec![
            WorkflowStep::new("a", serde_json::json!({})),
            WorkflowStep::new("b", serde_json::json!({}))
                .with_priority(JobPriority::Critical)
                .with_deadline(step_deadline),
        ];
        let (_, jobs) = expand(request(steps, options));

        assert_eq!(jobs[0].priority, JobPriority::Normal);
        assert_eq!(jobs[0].deadline, Some(deadline));
        assert_eq!(jobs[1].priority, JobPriority::Critical);
        assert_eq!(jobs[1].deadline, Some(step_deadline));
    }

    #[tokio::test]
    async fn test_completion_requires_all_succeeded() {
        let coordinator = WorkflowCoordinator::new();
        let (workflow, jobs) = expand(two_step_request(WorkflowOptions::default()));
        let workflow_id = workflow.id;
        coordinator.register(workflow, &jobs).await;

        coordinator
            .note_job_state(workflow_id, jobs[0].id, JobState::Succeeded)
            .await;
        let snapshot = coordinator.workflow(workflow_id).await.unwrap();
        assert_eq!(snapshot.workflow.state, WorkflowState::Running);

        coordinator
            .note_job_state(workflow_id, jobs[1].id, JobState::Succeeded)
            .await;
        let snapshot = coordinator.workflow(workflow_id).await.unwrap();
        assert_eq!(snapshot.workflow.state, WorkflowState::Completed);
        assert!(snapshot.workflow.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_unstarted_siblings() {
        let coordinator = WorkflowCoordinator::new();
        let options = WorkflowOptions {
            fail_fast: true,
            ..Default::default()
        };
        let steps = vec![
            WorkflowStep::new("a", serde_json::json!({})),
            WorkflowStep::new("b", serde_json::json!({})),
            WorkflowStep::new("c", serde_json::json!({})),
        ];
        let (workflow, jobs) = expand(request(steps, options));
        let workflow_id = workflow.id;
        coordinator.register(workflow, &jobs).await;

        coordinator
            .note_job_state(workflow_id, jobs[0].id, JobState::Succeeded)
            .await;
        let actions = coordinator
            .note_job_state(
                workflow_id,
                jobs[1].id,
                JobState::Failed { reason: "boom".to_string() },
            )
            .await;

        let WorkflowAction::CancelJobs(to_cancel) = &actions[0];
        assert_eq!(to_cancel.len(), 1);
        assert_eq!(to_cancel[0].0, jobs[2].id);

        let snapshot = coordinator.workflow(workflow_id).await.unwrap();
        assert!(matches!(snapshot.workflow.state, WorkflowState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_tolerant_workflow_waits_for_all_terminal() {
        let coordinator = WorkflowCoordinator::new();
        let options = WorkflowOptions {
            parallel_execution: true,
            fail_fast: false,
            ..Default::default()
        };
        let steps = vec![
            WorkflowStep::new("a", serde_json::json!({})),
            WorkflowStep::new("b", serde_json::json!({})),
            WorkflowStep::new("c", serde_json::json!({})),
        ];
        let (workflow, jobs) = expand(request(steps, options));
        let workflow_id = workflow.id;
        coordinator.register(workflow, &jobs).await;

        let actions = coordinator
            .note_job_state(
                workflow_id,
                jobs[0].id,
                JobState::Failed { reason: "boom".to_string() },
            )
            .await;
        assert!(actions.is_empty());
        let snapshot = coordinator.workflow(workflow_id).await.unwrap();
        assert_eq!(snapshot.workflow.state, WorkflowState::Running);

        coordinator
            .note_job_state(workflow_id, jobs[1].id, JobState::Succeeded)
            .await;
        coordinator
            .note_job_state(workflow_id, jobs[2].id, JobState::Succeeded)
            .await;

        let snapshot = coordinator.workflow(workflow_id).await.unwrap();
        assert!(matches!(snapshot.workflow.state, WorkflowState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_all_cancelled_yields_cancelled_workflow() {
        let coordinator = WorkflowCoordinator::new();
        let (workflow, jobs) = expand(two_step_request(WorkflowOptions::default()));
        let workflow_id = workflow.id;
        coordinator.register(workflow, &jobs).await;

        for job in &jobs {
            coordinator
                .note_job_state(
                    workflow_id,
                    job.id,
                    JobState::Cancelled { reason: "deadline".to_string() },
                )
                .await;
        }

        let snapshot = coordinator.workflow(workflow_id).await.unwrap();
        assert!(matches!(
            snapshot.workflow.state,
            WorkflowState::Cancelled { .. }
        ));
    }

    #[tokio::test]
    async fn test_active_workflows_excludes_terminal() {
        let coordinator = WorkflowCoordinator::new();
        let (workflow, jobs) = expand(two_step_request(WorkflowOptions::default()));
        let workflow_id = workflow.id;
        coordinator.register(workflow, &jobs).await;

        assert_eq!(coordinator.active_count().await, 1);
        let active = coordinator.active_workflows().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].jobs.len(), 2);

        for job in &jobs {
            coordinator
                .note_job_state(workflow_id, job.id, JobState::Succeeded)
                .await;
        }
        assert_eq!(coordinator.active_count().await, 0);
        assert!(coordinator.active_workflows().await.is_empty());
    }

    #[tokio::test]
    async fn test_prune_terminal_keeps_running_workflows() {
        let coordinator = WorkflowCoordinator::new();

        let (finished, finished_jobs) = expand(two_step_request(WorkflowOptions::default()));
        let finished_id = finished.id;
        coordinator.register(finished, &finished_jobs).await;
        for job in &finished_jobs {
            coordinator
                .note_job_state(finished_id, job.id, JobState::Succeeded)
                .await;
        }

        let (running, running_jobs) = expand(two_step_request(WorkflowOptions::default()));
        let running_id = running.id;
        coordinator.register(running, &running_jobs).await;

        // Horizon in the past, generous cap: nothing is old enough yet.
        let pruned = coordinator
            .prune_terminal_with(Utc::now() - chrono::Duration::days(7), 100)
            .await;
        assert_eq!(pruned, 0);

        // Horizon in the future prunes the completed record only.
        let pruned = coordinator
            .prune_terminal_with(Utc::now() + chrono::Duration::seconds(1), 100)
            .await;
        assert_eq!(pruned, 1);
        assert!(coordinator.workflow(finished_id).await.is_none());
        assert!(coordinator.workflow(running_id).await.is_some());
    }

    #[tokio::test]
    async fn test_prune_terminal_enforces_cap() {
        let coordinator = WorkflowCoordinator::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (workflow, jobs) = expand(two_step_request(WorkflowOptions::default()));
            let workflow_id = workflow.id;
            coordinator.register(workflow, &jobs).await;
            for job in &jobs {
                coordinator
                    .note_job_state(workflow_id, job.id, JobState::Succeeded)
                    .await;
            }
            ids.push(workflow_id);
        }

        let pruned = coordinator
            .prune_terminal_with(Utc::now() - chrono::Duration::days(7), 1)
            .await;
        assert_eq!(pruned, 2);
        let surviving = {
            let mut count = 0;
            for id in &ids {
                if coordinator.workflow(*id).await.is_some() {
                    count += 1;
                }
            }
            count
        };
        assert_eq!(surviving, 1);
    }

    #[tokio::test]
    async fn test_terminal_workflow_state_is_sticky() {
        let coordinator = WorkflowCoordinator::new();
        let options = WorkflowOptions {
            fail_fast: true,
            parallel_execution: true,
            ..Default::default()
        };
        let steps = vec![
            WorkflowStep::new("a", serde_json::json!({})),
            WorkflowStep::new("b", serde_json::json!({})),
        ];
        let (workflow, jobs) = expand(request(steps, options));
        let workflow_id = workflow.id;
        coordinator.register(workflow, &jobs).await;

        coordinator
            .note_job_state(
                workflow_id,
                jobs[0].id,
                JobState::Failed { reason: "boom".to_string() },
            )
            .await;
        // A running sibling finishing afterwards must not flip the state.
        coordinator
            .note_job_state(workflow_id, jobs[1].id, JobState::Succeeded)
            .await;

        let snapshot = coordinator.workflow(workflow_id).await.unwrap();
        assert!(matches!(snapshot.workflow.state, WorkflowState::Failed { .. }));
    }
}
