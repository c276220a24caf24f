use crate::types::QueueType;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Outcome of registering a job's dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RegisterOutcome {
    /// Every dependency has already succeeded.
    Ready,
    /// At least one dependency is still outstanding.
    Waiting,
    /// A dependency already failed or was cancelled; the job can never run.
    DependencyFailed(Uuid),
}

#[derive(Default)]
struct ResolverState {
    /// Job id → unmet dependency ids.
    waiting: HashMap<Uuid, HashSet<Uuid>>,
    /// Dependency id → jobs waiting on it.
    dependents: HashMap<Uuid, Vec<Uuid>>,
    /// Jobs that reached Succeeded.
    succeeded: HashSet<Uuid>,
    /// Jobs that reached Failed or Cancelled.
    failed: HashSet<Uuid>,
    /// Queue routing for waiting jobs.
    queue_of: HashMap<Uuid, QueueType>,
}

/// Tracks dependency edges across all queues and answers which jobs become
/// eligible (or must be cancelled) when another job reaches a terminal state.
///
/// Dependencies may cross queues, so this is the one piece of shared
/// bookkeeping outside the per-queue schedulers. Its lock is held only for
/// short map updates, never across a dispatch.
pub(crate) struct DependencyResolver {
    state: Mutex<ResolverState>,
}

impl DependencyResolver {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ResolverState::default()),
        }
    }

    /// Register a job and its dependencies.
    pub(crate) async fn register(
        &self,
        job_id: Uuid,
        queue: QueueType,
        dependencies: &[Uuid],
    ) -> RegisterOutcome {
        let mut state = self.state.lock().await;

        if let Some(&failed) = dependencies.iter().find(|dep| state.failed.contains(dep)) {
            return RegisterOutcome::DependencyFailed(failed);
        }

        let unmet: HashSet<Uuid> = dependencies
            .iter()
            .filter(|dep| !state.succeeded.contains(dep))
            .copied()
            .collect();

        if unmet.is_empty() {
            return RegisterOutcome::Ready;
        }

        for &dep in &unmet {
            state.dependents.entry(dep).or_default().push(job_id);
        }
        state.waiting.insert(job_id, unmet);
        state.queue_of.insert(job_id, queue);
        RegisterOutcome::Waiting
    }

    /// Record a success; returns jobs whose dependencies are now all met.
    pub(crate) async fn mark_succeeded(&self, job_id: Uuid) -> Vec<(Uuid, QueueType)> {
        let mut state = self.state.lock().await;
        state.succeeded.insert(job_id);

        let mut ready = Vec::new();
        for dependent in state.dependents.remove(&job_id).unwrap_or_default() {
            let satisfied = match state.waiting.get_mut(&dependent) {
                Some(unmet) => {
                    unmet.remove(&job_id);
                    unmet.is_empty()
                }
                None => false,
            };
            if satisfied {
                state.waiting.remove(&dependent);
                if let Some(queue) = state.queue_of.remove(&dependent) {
                    ready.push((dependent, queue));
                }
            }
        }
        ready
    }

    /// Record a failure or cancellation; returns the transitive set of
    /// waiting dependents that must be cancelled.
    pub(crate) async fn mark_failed(&self, job_id: Uuid) -> Vec<(Uuid, QueueType)> {
        let mut state = self.state.lock().await;

        let mut cancelled = Vec::new();
        let mut frontier = vec![job_id];
        while let Some(current) = frontier.pop() {
            state.failed.insert(current);
            for dependent in state.dependents.remove(&current).unwrap_or_default() {
                if state.waiting.remove(&dependent).is_some() {
                    if let Some(queue) = state.queue_of.remove(&dependent) {
                        cancelled.push((dependent, queue));
                    }
                    frontier.push(dependent);
                }
            }
        }
        cancelled
    }

    /// Drop bookkeeping for evicted terminal jobs.
    ///
    /// Callers validate dependency ids against live jobs before registering,
    /// so a forgotten id can never be referenced again.
    pub(crate) async fn forget(&self, job_ids: &[Uuid]) {
        let mut state = self.state.lock().await;
        for job_id in job_ids {
            state.succeeded.remove(job_id);
            state.failed.remove(job_id);
            state.dependents.remove(job_id);
        }
    }
}

/// Detect a dependency cycle within a batch of jobs about to be admitted.
///
/// Edges pointing at jobs outside the batch cannot form a cycle with it and
/// are ignored.
pub(crate) fn has_cycle(jobs: &[(Uuid, Vec<Uuid>)]) -> bool {
    let edges: HashMap<Uuid, &Vec<Uuid>> = jobs.iter().map(|(id, deps)| (*id, deps)).collect();
    let mut visited: HashMap<Uuid, u8> = HashMap::new();
    for &id in edges.keys() {
        if dfs_cycle(id, &edges, &mut visited) {
            return true;
        }
    }
    false
}

fn dfs_cycle(id: Uuid, edges: &HashMap<Uuid, &Vec<Uuid>>, visited: &mut HashMap<Uuid, u8>) -> bool {
    match visited.get(&id) {
        Some(1) => return true,  // back edge = cycle
        Some(2) => return false, // already processed
        _ => {}
    }
    visited.insert(id, 1); // mark as in progress
    if let Some(deps) = edges.get(&id) {
        for dep in deps.iter() {
            if edges.contains_key(dep) && dfs_cycle(*dep, edges, visited) {
                return true;
            }
        }
    }
    visited.insert(id, 2); // mark as done
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_no_deps_is_ready() {
        let resolver = DependencyResolver::new();
        let outcome = resolver
            .register(Uuid::new_v4(), QueueType::Analytics, &[])
            .await;
        assert_eq!(outcome, RegisterOutcome::Ready);
    }

    #[tokio::test]
    async fn test_success_releases_dependent() {
        let resolver = DependencyResolver::new();
        let dep = Uuid::new_v4();
        let job = Uuid::new_v4();

        let outcome = resolver
            .register(job, QueueType::ContentGeneration, &[dep])
            .await;
        assert_eq!(outcome, RegisterOutcome::Waiting);

        let ready = resolver.mark_succeeded(dep).await;
        assert_eq!(ready, vec![(job, QueueType::ContentGeneration)]);
    }

    #[tokio::test]
    async fn test_multiple_deps_all_required() {
        let resolver = DependencyResolver::new();
        let dep_a = Uuid::new_v4();
        let dep_b = Uuid::new_v4();
        let job = Uuid::new_v4();

        resolver
            .register(job, QueueType::Analytics, &[dep_a, dep_b])
            .await;

        assert!(resolver.mark_succeeded(dep_a).await.is_empty());
        let ready = resolver.mark_succeeded(dep_b).await;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, job);
    }

    #[tokio::test]
    async fn test_already_succeeded_dep_counts() {
        let resolver = DependencyResolver::new();
        let dep = Uuid::new_v4();
        resolver.mark_succeeded(dep).await;

        let outcome = resolver
            .register(Uuid::new_v4(), QueueType::Analytics, &[dep])
            .await;
        assert_eq!(outcome, RegisterOutcome::Ready);
    }

    #[tokio::test]
    async fn test_failed_dep_rejects_registration() {
        let resolver = DependencyResolver::new();
        let dep = Uuid::new_v4();
        resolver.mark_failed(dep).await;

        let outcome = resolver
            .register(Uuid::new_v4(), QueueType::Analytics, &[dep])
            .await;
        assert_eq!(outcome, RegisterOutcome::DependencyFailed(dep));
    }

    #[tokio::test]
    async fn test_failure_cascades_transitively() {
        let resolver = DependencyResolver::new();
        let root = Uuid::new_v4();
        let mid = Uuid::new_v4();
        let leaf = Uuid::new_v4();

        resolver.register(mid, QueueType::Analytics, &[root]).await;
        resolver
            .register(leaf, QueueType::Notifications, &[mid])
            .await;

        let cancelled = resolver.mark_failed(root).await;
        let ids: Vec<Uuid> = cancelled.iter().map(|(id, _)| *id).collect();
        assert_eq!(cancelled.len(), 2);
        assert!(ids.contains(&mid));
        assert!(ids.contains(&leaf));
    }

    #[tokio::test]
    async fn test_forget_drops_terminal_bookkeeping() {
        let resolver = DependencyResolver::new();
        let succeeded = Uuid::new_v4();
        let failed = Uuid::new_v4();
        resolver.mark_succeeded(succeeded).await;
        resolver.mark_failed(failed).await;

        resolver.forget(&[succeeded, failed]).await;

        // Neither id is known any more: a registration naming them waits
        // rather than resolving against the old terminal outcome.
        let outcome = resolver
            .register(Uuid::new_v4(), QueueType::Analytics, &[succeeded])
            .await;
        assert_eq!(outcome, RegisterOutcome::Waiting);
        let outcome = resolver
            .register(Uuid::new_v4(), QueueType::Analytics, &[failed])
            .await;
        assert_eq!(outcome, RegisterOutcome::Waiting);
    }

    #[test]
    fn test_no_cycle_in_chain() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let jobs = vec![(a, vec![]), (b, vec![a]), (c, vec![b])];
        assert!(!has_cycle(&jobs));
    }

    #[test]
    fn test_cycle_detected() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let jobs = vec![(a, vec![b]), (b, vec![a])];
        assert!(has_cycle(&jobs));
    }

    #[test]
    fn test_edge_outside_batch_ignored() {
        let a = Uuid::new_v4();
        let external = Uuid::new_v4();
        let jobs = vec![(a, vec![external])];
        assert!(!has_cycle(&jobs));
    }
}
