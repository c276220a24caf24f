use crate::health::{JobSample, SampleOutcome};
use crate::types::{Job, JobState, QueueStats, QueueType};
use chrono::{DateTime, Utc};
use labflow_core::{LabflowError, LabflowResult};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Everything the engine needs to run one execution attempt.
#[derive(Debug, Clone)]
pub(crate) struct DispatchTicket {
    pub job_id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub agent_type: String,
    pub payload: serde_json::Value,
    pub timeout: Duration,
    pub attempt: u32,
}

/// A job that reached Cancelled, with the context needed for propagation.
#[derive(Debug, Clone)]
pub(crate) struct CancelledJob {
    pub job_id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub reason: String,
    pub sample: JobSample,
}

/// How a submission was admitted.
#[derive(Debug, Clone)]
pub(crate) enum Admission {
    /// Admitted in Pending state, awaiting eligibility.
    Pending,
    /// Deadline had already passed; admitted directly as Cancelled.
    Cancelled(CancelledJob),
}

/// Result of an execution attempt, as observed by the engine.
#[derive(Debug, Clone)]
pub(crate) enum AttemptOutcome {
    Success(serde_json::Value),
    Failure(String),
}

/// What the scheduler decided after an attempt finished.
#[derive(Debug, Clone)]
pub(crate) enum CompletionAction {
    Succeeded {
        workflow_id: Option<Uuid>,
        sample: JobSample,
    },
    Retry {
        delay: Duration,
        attempt: u32,
    },
    Failed {
        workflow_id: Option<Uuid>,
        reason: String,
        sample: JobSample,
    },
}

struct QueueState {
    jobs: HashMap<Uuid, Job>,
    paused: bool,
    draining: bool,
    concurrency_limit: usize,
    in_flight: usize,
    next_seq: u64,
}

/// Admission and dispatch state for one queue category.
///
/// The mutex below is the queue's single serialization point: job selection,
/// slot accounting, and the pause/drain flags are only ever touched under it.
/// It is never held across an executor await.
pub(crate) struct QueueScheduler {
    queue_type: QueueType,
    state: Mutex<QueueState>,
}

impl QueueScheduler {
    pub(crate) fn new(queue_type: QueueType, concurrency_limit: usize) -> Self {
        Self {
            queue_type,
            state: Mutex::new(QueueState {
                jobs: HashMap::new(),
                paused: false,
                draining: false,
                concurrency_limit: concurrency_limit.max(1),
                in_flight: 0,
                next_seq: 0,
            }),
        }
    }

    /// Admit a job in Pending state, or Cancelled if its deadline has already
    /// passed. Rejects while the queue is draining.
    pub(crate) async fn submit(&self, mut job: Job) -> LabflowResult<Admission> {
        let mut state = self.state.lock().await;
        if state.draining {
            warn!(queue = %self.queue_type, agent = %job.agent_type, "submission refused: queue draining");
            return Err(LabflowError::QueueDraining(self.queue_type.to_string()));
        }

        job.seq = state.next_seq;
        state.next_seq += 1;

        let now = Utc::now();
        let admission = if job.deadline_expired(now) {
            let reason =
                LabflowError::DeadlineExceeded("deadline passed before admission".to_string())
                    .to_string();
            job.state = JobState::Cancelled {
                reason: reason.clone(),
            };
            job.finished_at = Some(now);
            info!(queue = %self.queue_type, job_id = %job.id, "job cancelled: deadline already passed");
            Admission::Cancelled(CancelledJob {
                job_id: job.id,
                workflow_id: job.workflow_id,
                reason,
                sample: sample_of(&job, SampleOutcome::Cancelled, now),
            })
        } else {
            Admission::Pending
        };

        state.jobs.insert(job.id, job);
        Ok(admission)
    }

    /// Move a Pending job to Eligible. Returns false if the job is not
    /// Pending (already cancelled, already eligible, or unknown).
    pub(crate) async fn make_eligible(&self, job_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.state == JobState::Pending => {
                job.state = JobState::Eligible;
                true
            }
            _ => false,
        }
    }

    /// Cancel any Pending/Eligible job whose deadline has expired, then pick
    /// the next dispatchable job: highest priority first, earliest admission
    /// (seq) among ties. Reserves a concurrency slot for the returned ticket.
    pub(crate) async fn take_next(
        &self,
        now: DateTime<Utc>,
    ) -> (Vec<CancelledJob>, Option<DispatchTicket>) {
        let mut state = self.state.lock().await;
        let cancelled = cancel_expired_locked(&mut state, self.queue_type, now);

        if state.paused || state.in_flight >= state.concurrency_limit {
            return (cancelled, None);
        }

        let next = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Eligible)
            .max_by_key(|job| (job.priority, std::cmp::Reverse(job.seq)))
            .map(|job| job.id);

        let ticket = next.and_then(|job_id| {
            let in_flight = state.in_flight + 1;
            state.in_flight = in_flight;
            state.jobs.get_mut(&job_id).map(|job| {
                job.state = JobState::Running;
                job.attempts += 1;
                if job.started_at.is_none() {
                    job.started_at = Some(now);
                }
                DispatchTicket {
                    job_id,
                    workflow_id: job.workflow_id,
                    agent_type: job.agent_type.clone(),
                    payload: job.payload.clone(),
                    timeout: job.timeout,
                    attempt: job.attempts,
                }
            })
        });

        (cancelled, ticket)
    }

    /// Record the outcome of an attempt and release its concurrency slot.
    pub(crate) async fn complete(
        &self,
        job_id: Uuid,
        outcome: AttemptOutcome,
    ) -> LabflowResult<CompletionAction> {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);

        let job = state.jobs.get_mut(&job_id).ok_or_else(|| {
            LabflowError::Queue(format!("completed job {job_id} not found in queue"))
        })?;

        let now = Utc::now();
        match outcome {
            AttemptOutcome::Success(result) => {
                job.state = JobState::Succeeded;
                job.finished_at = Some(now);
                job.result = Some(result);
                Ok(CompletionAction::Succeeded {
                    workflow_id: job.workflow_id,
                    sample: sample_of(job, SampleOutcome::Succeeded, now),
                })
            }
            AttemptOutcome::Failure(reason) => {
                if job.attempts < job.retry.max_attempts {
                    job.state = JobState::Pending;
                    let delay = job.retry.backoff_delay(job.attempts);
                    warn!(
                        queue = %self.queue_type,
                        job_id = %job_id,
                        attempt = job.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying after backoff"
                    );
                    Ok(CompletionAction::Retry {
                        delay,
                        attempt: job.attempts,
                    })
                } else {
                    job.state = JobState::Failed {
                        reason: reason.clone(),
                    };
                    job.finished_at = Some(now);
                    Ok(CompletionAction::Failed {
                        workflow_id: job.workflow_id,
                        reason,
                        sample: sample_of(job, SampleOutcome::Failed, now),
                    })
                }
            }
        }
    }

    /// Cancel any Pending/Eligible job whose deadline has expired, without
    /// dispatching anything. Used by the engine's periodic sweep so deadline
    /// cancellations do not wait for the next queue event.
    pub(crate) async fn cancel_expired(&self, now: DateTime<Utc>) -> Vec<CancelledJob> {
        let mut state = self.state.lock().await;
        cancel_expired_locked(&mut state, self.queue_type, now)
    }

    /// Evict terminal jobs finished before `horizon`, then the oldest
    /// terminal jobs beyond `cap`. Pending, eligible, and running jobs are
    /// never evicted. Returns the evicted ids so the engine can drop its own
    /// bookkeeping for them.
    pub(crate) async fn evict_terminal(
        &self,
        horizon: DateTime<Utc>,
        cap: usize,
    ) -> Vec<Uuid> {
        let mut state = self.state.lock().await;

        let mut terminal: Vec<(DateTime<Utc>, Uuid)> = state
            .jobs
            .values()
            .filter(|job| job.state.is_terminal())
            .map(|job| (job.finished_at.unwrap_or(job.submitted_at), job.id))
            .collect();
        terminal.sort_unstable();

        let mut remaining = terminal.len();
        let mut evicted = Vec::new();
        for (finished_at, job_id) in terminal {
            if finished_at < horizon || remaining > cap {
                state.jobs.remove(&job_id);
                evicted.push(job_id);
                remaining -= 1;
            }
        }
        if !evicted.is_empty() {
            info!(queue = %self.queue_type, evicted = evicted.len(), "evicted terminal jobs");
        }
        evicted
    }

    /// Cancel a not-yet-running job. Running and terminal jobs are left
    /// untouched (a running sibling finishes naturally).
    pub(crate) async fn cancel(
        &self,
        job_id: Uuid,
        reason: impl Into<String>,
    ) -> Option<CancelledJob> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&job_id)?;
        if !matches!(job.state, JobState::Pending | JobState::Eligible) {
            return None;
        }
        let reason = reason.into();
        let now = Utc::now();
        job.state = JobState::Cancelled {
            reason: reason.clone(),
        };
        job.finished_at = Some(now);
        info!(queue = %self.queue_type, job_id = %job_id, reason = %reason, "job cancelled");
        Some(CancelledJob {
            job_id,
            workflow_id: job.workflow_id,
            reason,
            sample: sample_of(job, SampleOutcome::Cancelled, now),
        })
    }

    /// Stop dispatching; in-flight jobs finish. Idempotent.
    pub(crate) async fn pause(&self) {
        let mut state = self.state.lock().await;
        state.paused = true;
    }

    /// Allow dispatching again. Idempotent.
    pub(crate) async fn resume(&self) {
        let mut state = self.state.lock().await;
        state.paused = false;
    }

    /// Refuse new submissions; queued and in-flight jobs finish naturally.
    pub(crate) async fn drain(&self) {
        let mut state = self.state.lock().await;
        state.draining = true;
    }

    /// Clear the draining flag (only reachable when the engine allows it).
    pub(crate) async fn reset_drain(&self) {
        let mut state = self.state.lock().await;
        state.draining = false;
    }

    pub(crate) async fn is_draining(&self) -> bool {
        self.state.lock().await.draining
    }

    /// Point-in-time statistics for this queue.
    pub(crate) async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            queue_type: self.queue_type,
            paused: state.paused,
            draining: state.draining,
            concurrency_limit: state.concurrency_limit,
            in_flight: state.in_flight,
            pending: 0,
            eligible: 0,
            running: 0,
            succeeded: 0,
            failed: 0,
            cancelled: 0,
        };
        for job in state.jobs.values() {
            match job.state {
                JobState::Pending => stats.pending += 1,
                JobState::Eligible => stats.eligible += 1,
                JobState::Running => stats.running += 1,
                JobState::Succeeded => stats.succeeded += 1,
                JobState::Failed { .. } => stats.failed += 1,
                JobState::Cancelled { .. } => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Clone of a job record.
    pub(crate) async fn job(&self, job_id: Uuid) -> Option<Job> {
        self.state.lock().await.jobs.get(&job_id).cloned()
    }

    /// Clones of several job records, taken under one lock acquisition.
    pub(crate) async fn jobs_snapshot(&self, job_ids: &[Uuid]) -> Vec<Option<Job>> {
        let state = self.state.lock().await;
        job_ids.iter().map(|id| state.jobs.get(id).cloned()).collect()
    }
}

fn cancel_expired_locked(
    state: &mut QueueState,
    queue_type: QueueType,
    now: DateTime<Utc>,
) -> Vec<CancelledJob> {
    let expired: Vec<Uuid> = state
        .jobs
        .values()
        .filter(|job| {
            matches!(job.state, JobState::Pending | JobState::Eligible)
                && job.deadline_expired(now)
        })
        .map(|job| job.id)
        .collect();

    let mut cancelled = Vec::new();
    for job_id in expired {
        if let Some(job) = state.jobs.get_mut(&job_id) {
            let reason = LabflowError::DeadlineExceeded("expired before dispatch".to_string())
                .to_string();
            job.state = JobState::Cancelled {
                reason: reason.clone(),
            };
            job.finished_at = Some(now);
            info!(queue = %queue_type, job_id = %job_id, "job cancelled: deadline expired");
            cancelled.push(CancelledJob {
                job_id,
                workflow_id: job.workflow_id,
                reason,
                sample: sample_of(job, SampleOutcome::Cancelled, now),
            });
        }
    }
    cancelled
}

fn sample_of(job: &Job, outcome: SampleOutcome, now: DateTime<Utc>) -> JobSample {
    let started = job.started_at.unwrap_or(now);
    let wait_ms = (started - job.submitted_at).num_milliseconds().max(0) as u64;
    let run_ms = job
        .started_at
        .map(|s| (now - s).num_milliseconds().max(0) as u64)
        .unwrap_or(0);
    JobSample {
        finished_at: now,
        wait_ms,
        run_ms,
        outcome,
    }
}
