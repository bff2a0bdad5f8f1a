use crate::config::RouteConfig;
use crate::types::{Task, Teammate, TokenUsage};
use agentor_core::{AgentorError, AgentorResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A provider/model pair chosen for a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSelection {
    pub provider: String,
    pub model: String,
}

impl ProviderSelection {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl From<&RouteConfig> for ProviderSelection {
    fn from(route: &RouteConfig) -> Self {
        Self::new(route.provider.clone(), route.model.clone())
    }
}

/// Chooses providers for tasks and alternatives after a failure.
pub trait ProviderRouter: Send + Sync {
    /// Provider for a task about to be assigned to `teammate`.
    fn select_provider(&self, task: &Task, teammate: &Teammate) -> AgentorResult<ProviderSelection>;

    /// An alternative to `exclude`, or `None` when nothing else is available.
    fn failover(&self, task: &Task, exclude: &str) -> Option<ProviderSelection>;
}

/// Router over a fixed, ordered list of routes.
///
/// Selection prefers a provider pinned on the task, then the teammate's own binding, then
/// the first route. Failover walks the routes in order and skips the excluded provider.
#[derive(Debug, Clone, Default)]
pub struct StaticRouter {
    routes: Vec<ProviderSelection>,
}

impl StaticRouter {
    pub fn new(routes: Vec<ProviderSelection>) -> Self {
        Self { routes }
    }

    pub fn from_config(routes: &[RouteConfig]) -> Self {
        Self::new(routes.iter().map(ProviderSelection::from).collect())
    }

    fn model_for(&self, provider: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|r| r.provider == provider)
            .map(|r| r.model.as_str())
    }
}

impl ProviderRouter for StaticRouter {
    fn select_provider(&self, task: &Task, teammate: &Teammate) -> AgentorResult<ProviderSelection> {
        if let Some(provider) = task.provider.as_deref().filter(|p| !p.is_empty()) {
            let model = task
                .model
                .clone()
                .or_else(|| (teammate.provider == provider).then(|| teammate.model.clone()))
                .or_else(|| self.model_for(provider).map(str::to_string))
                .unwrap_or_default();
            return Ok(ProviderSelection::new(provider, model));
        }
        if !teammate.provider.is_empty() {
            return Ok(ProviderSelection::new(
                teammate.provider.clone(),
                teammate.model.clone(),
            ));
        }
        self.routes.first().cloned().ok_or_else(|| {
            AgentorError::Config(format!("no provider route available for task {}", task.id))
        })
    }

    fn failover(&self, _task: &Task, exclude: &str) -> Option<ProviderSelection> {
        self.routes.iter().find(|r| r.provider != exclude).cloned()
    }
}

/// Input handed to a provider for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub prompt: String,
    pub model: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// What a provider reports back for one attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub raw: Option<serde_json::Value>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProviderResponse {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64, cost_usd: f64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self.cost_usd = cost_usd;
        self
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cost_usd: self.cost_usd,
        }
    }

    /// The failure message if this response does not count as a success.
    pub fn failure(&self) -> Option<String> {
        match (&self.error, self.success) {
            (Some(error), _) => Some(error.clone()),
            (None, false) => Some("provider reported failure without an error message".into()),
            (None, true) => None,
        }
    }

    /// Value stored as the task result: `raw` when present, otherwise the output text.
    pub fn result_value(&self) -> serde_json::Value {
        self.raw
            .clone()
            .unwrap_or_else(|| serde_json::Value::String(self.output.clone()))
    }
}

/// Client for one LLM provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn name(&self) -> &str;

    async fn health_check(&self) -> bool;

    async fn run(&self, request: ProviderRequest) -> AgentorResult<ProviderResponse>;
}

/// Provider clients by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.name().to_string(), client);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.clients.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{NewTask, NewTeammate};
    use uuid::Uuid;

    fn router() -> StaticRouter {
        StaticRouter::new(vec![
            ProviderSelection::new("claude", "sonnet"),
            ProviderSelection::new("openai", "gpt-4o"),
            ProviderSelection::new("gemini", "flash"),
        ])
    }

    fn teammate(provider: &str, model: &str) -> Teammate {
        Teammate::new(NewTeammate::new(Uuid::new_v4(), "ada", provider, model))
    }

    #[test]
    fn test_selection_prefers_pinned_then_teammate_then_route() {
        let router = router();
        let mut task = Task::new(NewTask::new(Uuid::new_v4(), "t"));

        let from_mate = router.select_provider(&task, &teammate("openai", "gpt-4o-mini")).unwrap();
        assert_eq!(from_mate, ProviderSelection::new("openai", "gpt-4o-mini"));

        let from_route = router.select_provider(&task, &teammate("", "")).unwrap();
        assert_eq!(from_route, ProviderSelection::new("claude", "sonnet"));

        task.provider = Some("gemini".into());
        let pinned = router.select_provider(&task, &teammate("openai", "gpt-4o")).unwrap();
        assert_eq!(pinned, ProviderSelection::new("gemini", "flash"));
    }

    #[test]
    fn test_selection_without_routes_fails() {
        let task = Task::new(NewTask::new(Uuid::new_v4(), "t"));
        let err = StaticRouter::default()
            .select_provider(&task, &teammate("", ""))
            .unwrap_err();
        assert!(matches!(err, AgentorError::Config(_)));
    }

    #[test]
    fn test_failover_skips_excluded() {
        let router = router();
        let task = Task::new(NewTask::new(Uuid::new_v4(), "t"));
        assert_eq!(router.failover(&task, "claude").unwrap().provider, "openai");
        assert_eq!(router.failover(&task, "openai").unwrap().provider, "claude");

        let single = StaticRouter::new(vec![ProviderSelection::new("claude", "sonnet")]);
        assert!(single.failover(&task, "claude").is_none());
    }

    #[test]
    fn test_response_failure_detection() {
        assert!(ProviderResponse::ok("done").failure().is_none());
        assert_eq!(ProviderResponse::failed("boom").failure().unwrap(), "boom");
        let silent = ProviderResponse {
            success: false,
            ..ProviderResponse::default()
        };
        assert!(silent.failure().is_some());
        let contradictory = ProviderResponse {
            success: true,
            error: Some("partial".into()),
            ..ProviderResponse::default()
        };
        assert_eq!(contradictory.failure().unwrap(), "partial");
    }

    #[test]
    fn test_result_value_prefers_raw() {
        let plain = ProviderResponse::ok("text");
        assert_eq!(plain.result_value(), serde_json::json!("text"));
        let mut raw = ProviderResponse::ok("text");
        raw.raw = Some(serde_json::json!({ "answer": 42 }));
        assert_eq!(raw.result_value()["answer"], 42);
    }
}
