use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type AgentorResult<T> = Result<T, AgentorError>;

/// Entity families that can be looked up by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Team,
    Teammate,
    Task,
    Dependency,
    Session,
    Provider,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Team => write!(f, "team"),
            Entity::Teammate => write!(f, "teammate"),
            Entity::Task => write!(f, "task"),
            Entity::Dependency => write!(f, "dependency"),
            Entity::Session => write!(f, "session"),
            Entity::Provider => write!(f, "provider"),
        }
    }
}

/// Top-level error type for the Agentor teams engine.
#[derive(Error, Debug)]
pub enum AgentorError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },

    #[error("Task {task_id} has unfinished dependencies: {pending:?}")]
    DependencyNotSatisfied { task_id: Uuid, pending: Vec<Uuid> },

    #[error("Circular dependency among tasks: {0:?}")]
    CircularDependency(Vec<Uuid>),

    #[error("Provider '{0}' failed its health check")]
    ProviderUnhealthy(String),

    #[error("Provider '{provider}' execution failed: {message}")]
    ProviderExecution { provider: String, message: String },

    #[error("Task {0} is already executing")]
    AlreadyExecuting(Uuid),

    #[error("Task {0} was cancelled")]
    Cancelled(Uuid),

    #[error("Task {0} is not assigned to a teammate")]
    Unassigned(Uuid),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable, serializable classification of an [`AgentorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    DependencyNotSatisfied,
    CircularDependency,
    ProviderUnhealthy,
    ProviderExecutionFailed,
    AlreadyExecuting,
    Cancelled,
    Unassigned,
    InvalidState,
    Config,
    Storage,
    Serialization,
    Io,
}

impl AgentorError {
    pub fn not_found(entity: Entity, id: impl std::fmt::Display) -> Self {
        AgentorError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentorError::NotFound { .. } => ErrorKind::NotFound,
            AgentorError::DependencyNotSatisfied { .. } => ErrorKind::DependencyNotSatisfied,
            AgentorError::CircularDependency(_) => ErrorKind::CircularDependency,
            AgentorError::ProviderUnhealthy(_) => ErrorKind::ProviderUnhealthy,
            AgentorError::ProviderExecution { .. } => ErrorKind::ProviderExecutionFailed,
            AgentorError::AlreadyExecuting(_) => ErrorKind::AlreadyExecuting,
            AgentorError::Cancelled(_) => ErrorKind::Cancelled,
            AgentorError::Unassigned(_) => ErrorKind::Unassigned,
            AgentorError::InvalidState(_) => ErrorKind::InvalidState,
            AgentorError::Config(_) => ErrorKind::Config,
            AgentorError::Storage(_) => ErrorKind::Storage,
            AgentorError::Json(_) => ErrorKind::Serialization,
            AgentorError::Io(_) => ErrorKind::Io,
        }
    }

    /// Provider-level failures are retried with failover; everything else is structural
    /// and goes straight back to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentorError::ProviderUnhealthy(_) | AgentorError::ProviderExecution { .. }
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let id = Uuid::new_v4();
        let err = AgentorError::not_found(Entity::Teammate, id);
        assert_eq!(err.to_string(), format!("teammate not found: {id}"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_only_provider_errors_are_recoverable() {
        assert!(AgentorError::ProviderUnhealthy("openai".into()).is_recoverable());
        assert!(AgentorError::ProviderExecution {
            provider: "claude".into(),
            message: "503".into(),
        }
        .is_recoverable());
        assert!(!AgentorError::Cancelled(Uuid::new_v4()).is_recoverable());
        assert!(!AgentorError::CircularDependency(vec![]).is_recoverable());
        assert!(!AgentorError::InvalidState("paused".into()).is_recoverable());
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::ProviderExecutionFailed).unwrap();
        assert_eq!(json, "\"provider_execution_failed\"");
    }

    #[test]
    fn test_json_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err: AgentorError = parse.unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }
}
