use agentor_core::{AgentorError, AgentorResult};
use serde::{Deserialize, Serialize};

/// Engine configuration, usually read from the `[teams]` table of a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamsConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Page size used when a message query does not set a limit.
    #[serde(default = "default_message_page_size")]
    pub message_page_size: usize,
    /// Ordered provider/model routes; the first is the default, the rest are failover targets.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Default for TeamsConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            event_capacity: default_event_capacity(),
            message_page_size: default_message_page_size(),
            routes: Vec::new(),
        }
    }
}

impl TeamsConfig {
    pub fn from_toml(source: &str) -> AgentorResult<Self> {
        let config: TeamsConfig =
            toml::from_str(source).map_err(|e| AgentorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AgentorResult<()> {
        self.retry.validate()?;
        if self.message_page_size == 0 {
            return Err(AgentorError::Config(
                "message_page_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Bounds and defaults applied to per-task retry overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_min_max_retries")]
    pub min_max_retries: u32,
    #[serde(default = "default_max_max_retries")]
    pub max_max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub default_backoff_ms: u64,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            min_max_retries: default_min_max_retries(),
            max_max_retries: default_max_max_retries(),
            default_backoff_ms: default_backoff_ms(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> AgentorResult<()> {
        if self.min_max_retries == 0 || self.min_max_retries > self.max_max_retries {
            return Err(AgentorError::Config(format!(
                "retry bounds must satisfy 1 <= min ({}) <= max ({})",
                self.min_max_retries, self.max_max_retries
            )));
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(AgentorError::Config(format!(
                "backoff bounds must satisfy min ({}) <= max ({})",
                self.min_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub provider: String,
    pub model: String,
}

fn default_event_capacity() -> usize {
    256
}

fn default_message_page_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_min_max_retries() -> u32 {
    1
}

fn default_max_max_retries() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    600
}

fn default_min_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5000
}
