use crate::events::{EventBus, TeamEvent};
use crate::store::{SessionPatch, TeamsDatabase};
use crate::types::{ExecutionSession, SessionStatus, TokenUsage};
use agentor_core::{AgentorError, AgentorResult, Entity};
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Opens and closes one [`ExecutionSession`] per execution attempt.
pub struct SessionManager {
    db: Arc<dyn TeamsDatabase>,
    events: EventBus,
}

/// Identifies who runs which task where, for a new session.
#[derive(Debug, Clone)]
pub struct SessionStart {
    pub team_id: Uuid,
    pub teammate_id: Uuid,
    pub task_id: Uuid,
    pub provider: String,
    pub model: String,
    pub attempt: u32,
}

impl SessionManager {
    pub fn new(db: Arc<dyn TeamsDatabase>, events: EventBus) -> Self {
        Self { db, events }
    }

    pub async fn create_session(&self, start: SessionStart) -> AgentorResult<ExecutionSession> {
        let session = ExecutionSession {
            id: Uuid::new_v4(),
            team_id: start.team_id,
            teammate_id: start.teammate_id,
            task_id: start.task_id,
            attempt: start.attempt,
            status: SessionStatus::Running,
            provider: start.provider,
            model: start.model,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            result: None,
            error: None,
        };
        self.db.create_session(&session).await?;
        debug!(
            session_id = %session.id,
            task_id = %session.task_id,
            attempt = session.attempt,
            provider = %session.provider,
            "Session opened"
        );
        self.events.publish(TeamEvent::SessionUpdated(session.clone()));
        Ok(session)
    }

    pub async fn complete_session(
        &self,
        id: Uuid,
        usage: TokenUsage,
        result: Option<serde_json::Value>,
    ) -> AgentorResult<ExecutionSession> {
        self.close(
            id,
            SessionPatch {
                status: Some(SessionStatus::Completed),
                usage: Some(usage),
                result,
                ..SessionPatch::default()
            },
        )
        .await
    }

    pub async fn fail_session(
        &self,
        id: Uuid,
        error: impl Into<String>,
        usage: Option<TokenUsage>,
    ) -> AgentorResult<ExecutionSession> {
        self.close(
            id,
            SessionPatch {
                status: Some(SessionStatus::Failed),
                usage,
                error: Some(error.into()),
                ..SessionPatch::default()
            },
        )
        .await
    }

    pub async fn cancel_session(&self, id: Uuid) -> AgentorResult<ExecutionSession> {
        self.close(
            id,
            SessionPatch {
                status: Some(SessionStatus::Cancelled),
                ..SessionPatch::default()
            },
        )
        .await
    }

    /// Stamps `completed_at` and `duration_ms` along with the given outcome.
    async fn close(&self, id: Uuid, mut patch: SessionPatch) -> AgentorResult<ExecutionSession> {
        let session = self
            .db
            .get_session(id)
            .await?
            .ok_or_else(|| AgentorError::not_found(Entity::Session, id))?;
        let now = Utc::now();
        let elapsed = (now - session.started_at).num_milliseconds().max(0);
        patch.completed_at = Some(now);
        patch.duration_ms = Some(u64::try_from(elapsed).unwrap_or_default());

        let session = self.db.update_session(id, patch).await?;
        debug!(
            session_id = %session.id,
            status = ?session.status,
            duration_ms = session.duration_ms,
            "Session closed"
        );
        self.events.publish(TeamEvent::SessionUpdated(session.clone()));
        Ok(session)
    }

    pub async fn get_active_sessions(&self, team_id: Uuid) -> AgentorResult<Vec<ExecutionSession>> {
        let sessions = self.db.list_sessions(team_id).await?;
        Ok(sessions
            .into_iter()
            .filter(|s| s.status == SessionStatus::Running)
            .collect())
    }

    pub async fn list_task_sessions(&self, task_id: Uuid) -> AgentorResult<Vec<ExecutionSession>> {
        self.db.list_task_sessions(task_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryTeamsDatabase;

    fn start(team_id: Uuid, task_id: Uuid, attempt: u32) -> SessionStart {
        SessionStart {
            team_id,
            teammate_id: Uuid::new_v4(),
            task_id,
            provider: "claude".into(),
            model: "sonnet".into(),
            attempt,
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let db = Arc::new(InMemoryTeamsDatabase::new());
        let sessions = SessionManager::new(db, EventBus::default());
        let team_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();

        let first = sessions.create_session(start(team_id, task_id, 1)).await.unwrap();
        let second = sessions.create_session(start(team_id, task_id, 2)).await.unwrap();
        assert_eq!(first.status, SessionStatus::Running);
        assert_eq!(sessions.get_active_sessions(team_id).await.unwrap().len(), 2);

        let failed = sessions
            .fail_session(first.id, "timeout", None)
            .await
            .unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("timeout"));
        assert!(failed.completed_at.is_some());
        assert!(failed.duration_ms.is_some());

        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            cost_usd: 0.01,
        };
        let done = sessions
            .complete_session(second.id, usage, Some(serde_json::json!("ok")))
            .await
            .unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.output_tokens, 20);

        assert!(sessions.get_active_sessions(team_id).await.unwrap().is_empty());
        let attempts: Vec<u32> = sessions
            .list_task_sessions(task_id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_cancel_and_missing_session() {
        let db = Arc::new(InMemoryTeamsDatabase::new());
        let sessions = SessionManager::new(db, EventBus::default());
        let s = sessions
            .create_session(start(Uuid::new_v4(), Uuid::new_v4(), 1))
            .await
            .unwrap();
        let cancelled = sessions.cancel_session(s.id).await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);

        let err = sessions.cancel_session(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AgentorError::NotFound { entity: Entity::Session, .. }));
    }
}
