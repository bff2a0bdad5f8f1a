use crate::config::ProviderConfig;
use agentor_core::{AgentorError, AgentorResult};
use agentor_teams::{ProviderClient, ProviderRequest, ProviderResponse};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Runs a local command per attempt.
///
/// The prompt goes to stdin. When the last JSON line of stdout carries a `result` field
/// (the headless `claude -p --output-format json` shape) its usage figures are used;
/// otherwise stdout is the answer and tokens are estimated at four bytes each.
pub struct CommandProvider {
    config: ProviderConfig,
}

impl CommandProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    fn command(&self, args: &[String], model: &str) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(args.iter().map(|a| a.replace("{model}", model)));
        cmd.kill_on_drop(true);
        cmd
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn cost_for(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.config.cost_per_1k_tokens
    }

    fn parse_output(&self, prompt: &str, stdout: &str) -> ProviderResponse {
        let structured = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter(|v| v.get("result").is_some());

        match structured {
            Some(json) => {
                let result = json["result"].as_str().unwrap_or_default().to_string();
                if json["is_error"].as_bool().unwrap_or(false) {
                    return ProviderResponse::failed(result);
                }
                let input = json["usage"]["input_tokens"].as_u64().unwrap_or(0);
                let output = json["usage"]["output_tokens"].as_u64().unwrap_or(0);
                let cost = json["total_cost_usd"]
                    .as_f64()
                    .unwrap_or_else(|| self.cost_for(input + output));
                ProviderResponse {
                    raw: Some(json),
                    ..ProviderResponse::ok(result).with_usage(input, output, cost)
                }
            }
            None => {
                let input = estimate_tokens(prompt);
                let output = estimate_tokens(stdout);
                ProviderResponse::ok(stdout.trim_end()).with_usage(
                    input,
                    output,
                    self.cost_for(input + output),
                )
            }
        }
    }
}

fn estimate_tokens(text: &str) -> u64 {
    text.len() as u64 / 4
}

#[async_trait]
impl ProviderClient for CommandProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn health_check(&self) -> bool {
        let Some(args) = &self.config.health_args else {
            return true;
        };
        let mut cmd = self.command(args, &self.config.model);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        match tokio::time::timeout(self.timeout(), cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::warn!(provider = %self.config.name, error = %e, "Health check could not start");
                false
            }
            Err(_) => {
                tracing::warn!(provider = %self.config.name, "Health check timed out");
                false
            }
        }
    }

    async fn run(&self, request: ProviderRequest) -> AgentorResult<ProviderResponse> {
        let mut cmd = self.command(&self.config.args, &request.model);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::info!(
            provider = %self.config.name,
            model = %request.model,
            prompt_len = request.prompt.len(),
            "Spawning provider command"
        );

        let mut child = cmd.spawn().map_err(|e| AgentorError::ProviderExecution {
            provider: self.config.name.clone(),
            message: format!("failed to run '{}': {e}", self.config.command),
        })?;

        // The prompt is fed while stdout and stderr drain, so neither pipe can fill up and
        // stall the other side. Commands that ignore stdin may exit before it is written.
        let stdin = child.stdin.take();
        let feed = async {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                    tracing::debug!(provider = %self.config.name, error = %e, "Prompt not fully written");
                }
            }
        };
        let exchange = async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = match tokio::time::timeout(self.timeout(), exchange).await {
            Ok(output) => output?,
            Err(_) => {
                return Ok(ProviderResponse::failed(format!(
                    "'{}' timed out after {}s",
                    self.config.command, self.config.timeout_secs
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(ProviderResponse::failed(format!(
                "'{}' failed (exit {}): {}",
                self.config.command,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(self.parse_output(&request.prompt, &stdout))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn provider(command: &str, args: &[&str]) -> CommandProvider {
        CommandProvider::new(ProviderConfig {
            name: "local".into(),
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            model: "default".into(),
            health_args: None,
            cost_per_1k_tokens: 2.0,
            timeout_secs: 10,
        })
    }

    fn request(prompt: &str) -> ProviderRequest {
        ProviderRequest {
            prompt: prompt.into(),
            model: "tiny".into(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_plain_output_estimates_tokens() {
        let p = provider("cat", &[]);
        let response = p.parse_output("12345678", "abcdefghijkl\n");
        assert!(response.success);
        assert_eq!(response.output, "abcdefghijkl");
        assert_eq!(response.input_tokens, 2);
        assert_eq!(response.output_tokens, 3);
        assert!((response.cost_usd - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_structured_output_uses_reported_usage() {
        let p = provider("claude", &[]);
        let stdout = "progress...\n{\"result\":\"done\",\"is_error\":false,\"total_cost_usd\":0.02,\"usage\":{\"input_tokens\":120,\"output_tokens\":30}}\n";
        let response = p.parse_output("prompt", stdout);
        assert!(response.success);
        assert_eq!(response.output, "done");
        assert_eq!(response.input_tokens, 120);
        assert_eq!(response.output_tokens, 30);
        assert!((response.cost_usd - 0.02).abs() < 1e-9);
        assert!(response.raw.is_some());
    }

    #[test]
    fn test_structured_error_is_a_failure() {
        let p = provider("claude", &[]);
        let response = p.parse_output("prompt", "{\"result\":\"quota\",\"is_error\":true}");
        assert_eq!(response.failure().as_deref(), Some("quota"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prompt_goes_through_stdin() {
        let p = provider("cat", &[]);
        let response = p.run(request("# Task: echo me\n")).await.unwrap();
        assert!(response.success);
        assert_eq!(response.output, "# Task: echo me");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_model_placeholder_is_substituted() {
        let p = provider("echo", &["model={model}"]);
        let response = p.run(request("ignored")).await.unwrap();
        assert_eq!(response.output, "model=tiny");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prompt_larger_than_pipe_buffer_round_trips() {
        let p = provider("cat", &[]);
        let prompt = "x".repeat(1 << 20);
        let response = tokio::time::timeout(Duration::from_secs(30), p.run(request(&prompt)))
            .await
            .expect("large prompt exchange did not finish")
            .unwrap();
        assert!(response.success, "{response:?}");
        assert_eq!(response.output.len(), prompt.len());
        assert_eq!(response.input_tokens, 1 << 18);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_covers_unread_stdin() {
        let mut p = provider("sleep", &["5"]);
        p.config.timeout_secs = 1;
        let prompt = "y".repeat(1 << 20);
        let response = p.run(request(&prompt)).await.unwrap();
        assert!(!response.success);
        assert!(response.failure().unwrap().contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_a_failed_response() {
        let p = provider("false", &[]);
        let response = p.run(request("x")).await.unwrap();
        assert!(!response.success);
        assert!(response.failure().unwrap().contains("exit 1"));
    }

    #[tokio::test]
    async fn test_missing_command_is_an_error() {
        let p = provider("agentor-no-such-binary", &[]);
        let err = p.run(request("x")).await.unwrap_err();
        assert!(matches!(err, AgentorError::ProviderExecution { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_health_check() {
        assert!(provider("cat", &[]).health_check().await);

        let mut healthy = provider("true", &[]);
        healthy.config.health_args = Some(vec![]);
        assert!(healthy.health_check().await);

        let mut unhealthy = provider("false", &[]);
        unhealthy.config.health_args = Some(vec![]);
        assert!(!unhealthy.health_check().await);
    }
}
