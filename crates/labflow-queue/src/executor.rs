use async_trait::async_trait;
use labflow_core::LabflowResult;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The external agent executor seam.
///
/// The queue core treats agents as opaque callables: given an agent type and
/// a payload, the executor either returns a result value or an error. The
/// per-attempt timeout is enforced by the engine around this call, so
/// implementations may block or suspend freely.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Execute one attempt of the given agent with the given payload.
    async fn execute(
        &self,
        agent_type: &str,
        payload: &serde_json::Value,
    ) -> LabflowResult<serde_json::Value>;
}

/// Registry of agent executors keyed by agent type, with an optional
/// fallback executor for types without a dedicated entry.
///
/// Registration happens at startup; lookups happen on every dispatch.
pub struct AgentRegistry {
    executors: RwLock<HashMap<String, Arc<dyn AgentExecutor>>>,
    fallback: RwLock<Option<Arc<dyn AgentExecutor>>>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
            fallback: RwLock::new(None),
        }
    }

    /// Register an executor for a specific agent type.
    ///
    /// Re-registering the same type replaces the previous executor.
    pub async fn register(&self, agent_type: impl Into<String>, executor: Arc<dyn AgentExecutor>) {
        let mut executors = self.executors.write().await;
        executors.insert(agent_type.into(), executor);
    }

    /// Set the fallback executor used for agent types with no dedicated entry.
    pub async fn set_fallback(&self, executor: Arc<dyn AgentExecutor>) {
        let mut fallback = self.fallback.write().await;
        *fallback = Some(executor);
    }

    /// Resolve the executor for an agent type, falling back if configured.
    pub async fn resolve(&self, agent_type: &str) -> Option<Arc<dyn AgentExecutor>> {
        if let Some(executor) = self.executors.read().await.get(agent_type) {
            return Some(Arc::clone(executor));
        }
        self.fallback.read().await.clone()
    }

    /// Whether a submission for this agent type can be executed at all.
    pub async fn can_execute(&self, agent_type: &str) -> bool {
        self.executors.read().await.contains_key(agent_type)
            || self.fallback.read().await.is_some()
    }

    /// The sorted list of agent types with a dedicated executor.
    pub async fn registered_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.executors.read().await.keys().cloned().collect();
        agents.sort();
        agents
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

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

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = AgentRegistry::new();
        registry
            .register("content-generator", Arc::new(EchoExecutor))
            .await;

        assert!(registry.resolve("content-generator").await.is_some());
        assert!(registry.resolve("unknown-agent").await.is_none());
        assert!(registry.can_execute("content-generator").await);
        assert!(!registry.can_execute("unknown-agent").await);
    }

    #[tokio::test]
    async fn test_fallback_covers_unknown_types() {
        let registry = AgentRegistry::new();
        registry.set_fallback(Arc::new(EchoExecutor)).await;

        assert!(registry.resolve("anything-at-all").await.is_some());
        assert!(registry.can_execute("anything-at-all").await);
        // Fallback does not appear in the registered list.
        assert!(registry.registered_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_registered_agents_sorted() {
        let registry = AgentRegistry::new();
        registry.register("seo-analyzer", Arc::new(EchoExecutor)).await;
        registry
            .register("content-generator", Arc::new(EchoExecutor))
            .await;

        assert_eq!(
            registry.registered_agents().await,
            vec!["content-generator".to_string(), "seo-analyzer".to_string()]
        );
    }

    #[tokio::test]
    async fn test_executor_runs() {
        let registry = AgentRegistry::new();
        registry.register("echo", Arc::new(EchoExecutor)).await;
        let executor = registry.resolve("echo").await.unwrap();
        let payload = serde_json::json!({ "topic": "onboarding" });
        let result = executor.execute("echo", &payload).await.unwrap();
        assert_eq!(result, payload);
    }
}
