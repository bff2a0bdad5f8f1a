use agentor_core::{AgentorError, AgentorResult};
use agentor_teams::{RouteConfig, TeamsConfig};
use serde::Deserialize;
use std::path::Path;

/// Contents of `agentor.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub teams: TeamsConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// A provider backed by a local command. The task prompt is written to its stdin and
/// stdout is taken as the answer.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub command: String,
    /// `{model}` is replaced with the model selected for the attempt.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Arguments for a liveness check. Without them the provider is always considered healthy.
    #[serde(default)]
    pub health_args: Option<Vec<String>>,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_model() -> String {
    "default".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl CliConfig {
    pub fn from_toml(source: &str) -> AgentorResult<Self> {
        let mut config: CliConfig =
            toml::from_str(source).map_err(|e| AgentorError::Config(e.to_string()))?;
        config.teams.validate()?;

        for (i, provider) in config.providers.iter().enumerate() {
            if provider.name.is_empty() || provider.command.is_empty() {
                return Err(AgentorError::Config(format!(
                    "provider #{i} needs both a name and a command"
                )));
            }
            if config.providers[..i].iter().any(|p| p.name == provider.name) {
                return Err(AgentorError::Config(format!(
                    "provider '{}' is declared twice",
                    provider.name
                )));
            }
        }

        // Providers double as the failover order when no routes are given.
        if config.teams.routes.is_empty() {
            config.teams.routes = config
                .providers
                .iter()
                .map(|p| RouteConfig {
                    provider: p.name.clone(),
                    model: p.model.clone(),
                })
                .collect();
        }
        Ok(config)
    }

    pub async fn load(path: &Path) -> AgentorResult<Self> {
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            AgentorError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml(&source)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_default_to_provider_order() {
        let config = CliConfig::from_toml(
            r#"
            [[providers]]
            name = "claude"
            command = "claude"
            args = ["-p", "--model", "{model}"]
            model = "sonnet"

            [[providers]]
            name = "echo"
            command = "cat"
            "#,
        )
        .unwrap();

        let routes: Vec<_> = config
            .teams
            .routes
            .iter()
            .map(|r| (r.provider.as_str(), r.model.as_str()))
            .collect();
        assert_eq!(routes, vec![("claude", "sonnet"), ("echo", "default")]);
        assert_eq!(config.providers[1].timeout_secs, 300);
    }

    #[test]
    fn test_explicit_routes_are_kept() {
        let config = CliConfig::from_toml(
            r#"
            [teams]
            [[teams.routes]]
            provider = "echo"
            model = "small"

            [[providers]]
            name = "echo"
            command = "cat"
            "#,
        )
        .unwrap();
        assert_eq!(config.teams.routes.len(), 1);
        assert_eq!(config.teams.routes[0].model, "small");
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let err = CliConfig::from_toml(
            r#"
            [[providers]]
            name = "echo"
            command = "cat"

            [[providers]]
            name = "echo"
            command = "tee"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentor.toml");
        std::fs::write(
            &path,
            "[teams.retry]\ndefault_max_retries = 2\n\n[[providers]]\nname = \"echo\"\ncommand = \"cat\"\n",
        )
        .unwrap();

        let config = CliConfig::load(&path).await.unwrap();
        assert_eq!(config.teams.retry.default_max_retries, 2);
        assert_eq!(config.providers.len(), 1);

        let missing = CliConfig::load(&dir.path().join("nope.toml")).await;
        assert!(matches!(missing, Err(AgentorError::Config(_))));
    }
}
