use crate::allocation::Allocation;
use crate::broker::MessageBroker;
use crate::events::{EventBus, TeamEvent};
use crate::store::{TeamPatch, TeammatePatch, TeamsDatabase};
use crate::task_manager::TaskManager;
use crate::types::{
    MessageType, NewMessage, NewTeam, NewTeammate, Task, Team, TeamStatus, Teammate,
    TeammateStatus,
};
use agentor_core::{AgentorError, AgentorResult, Entity};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Team lifecycle and the greedy scheduling loop.
pub struct TeamCoordinator {
    db: Arc<dyn TeamsDatabase>,
    tasks: Arc<TaskManager>,
    broker: Arc<MessageBroker>,
    events: EventBus,
}

impl TeamCoordinator {
    pub fn new(
        db: Arc<dyn TeamsDatabase>,
        tasks: Arc<TaskManager>,
        broker: Arc<MessageBroker>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            tasks,
            broker,
            events,
        }
    }

    pub async fn get_team(&self, team_id: Uuid) -> AgentorResult<Team> {
        self.db
            .get_team(team_id)
            .await?
            .ok_or_else(|| AgentorError::not_found(Entity::Team, team_id))
    }

    pub async fn create_team(&self, params: NewTeam) -> AgentorResult<Team> {
        let team = Team::new(params);
        self.db.create_team(&team).await?;
        self.events.publish(TeamEvent::TeamUpdated(team.clone()));
        info!(team_id = %team.id, name = %team.name, strategy = %team.allocation_strategy, "Team created");
        Ok(team)
    }

    pub async fn add_teammate(&self, params: NewTeammate) -> AgentorResult<Teammate> {
        let team = self.get_team(params.team_id).await?;
        if team.status.is_terminal() {
            return Err(AgentorError::InvalidState(format!(
                "team {} is {} and cannot take new teammates",
                team.id, team.status
            )));
        }
        let members = self.db.list_teammates(team.id).await?.len();
        if members >= team.max_teammates as usize {
            return Err(AgentorError::InvalidState(format!(
                "team {} already has {members} of {} teammates",
                team.id, team.max_teammates
            )));
        }

        let mate = Teammate::new(params);
        self.db.create_teammate(&mate).await?;
        self.events.publish(TeamEvent::TeammateUpdated(mate.clone()));
        debug!(team_id = %team.id, teammate_id = %mate.id, name = %mate.name, "Teammate added");
        Ok(mate)
    }

    /// Activate the team, announce it, then schedule every ready task.
    pub async fn start_team(&self, team_id: Uuid) -> AgentorResult<Team> {
        let team = self
            .transition(team_id, TeamStatus::Active, TeamPatch {
                started_at: Some(Utc::now()),
                ..TeamPatch::default()
            })
            .await?;
        self.broker
            .send_message(
                NewMessage::new(team_id, MessageType::System, "team_started")
                    .with_content(format!("Team '{}' started", team.name)),
            )
            .await?;

        let scheduled = self.schedule_all_ready_tasks(team_id).await?;
        info!(team_id = %team_id, scheduled, "Team started");
        self.get_team(team_id).await
    }

    /// In-flight executions keep running; only new scheduling stops.
    pub async fn pause_team(&self, team_id: Uuid) -> AgentorResult<Team> {
        let team = self
            .transition(team_id, TeamStatus::Paused, TeamPatch::default())
            .await?;
        self.broadcast_status(&team, "team_paused").await?;
        Ok(team)
    }

    pub async fn complete_team(&self, team_id: Uuid) -> AgentorResult<Team> {
        let team = self
            .transition(team_id, TeamStatus::Completed, TeamPatch {
                completed_at: Some(Utc::now()),
                ..TeamPatch::default()
            })
            .await?;
        self.broadcast_status(&team, "team_completed").await?;
        Ok(team)
    }

    async fn transition(
        &self,
        team_id: Uuid,
        next: TeamStatus,
        mut patch: TeamPatch,
    ) -> AgentorResult<Team> {
        let team = self.get_team(team_id).await?;
        if !team.status.can_transition_to(next) {
            return Err(AgentorError::InvalidState(format!(
                "team {team_id} cannot move from {} to {next}",
                team.status
            )));
        }
        patch.status = Some(next);
        let team = self.db.update_team(team_id, patch).await?;
        self.events.publish(TeamEvent::TeamUpdated(team.clone()));
        Ok(team)
    }

    async fn broadcast_status(&self, team: &Team, subject: &str) -> AgentorResult<()> {
        self.broker
            .send_message(
                NewMessage::new(team.id, MessageType::System, subject)
                    .with_content(format!("Team '{}' is now {}", team.name, team.status)),
            )
            .await?;
        info!(team_id = %team.id, status = %team.status, "Team status changed");
        Ok(())
    }

    /// Bring a teammate in `error` or `offline` back to `idle`.
    pub async fn recover_teammate(&self, teammate_id: Uuid) -> AgentorResult<Teammate> {
        let mate = self
            .db
            .get_teammate(teammate_id)
            .await?
            .ok_or_else(|| AgentorError::not_found(Entity::Teammate, teammate_id))?;
        if !matches!(mate.status, TeammateStatus::Error | TeammateStatus::Offline) {
            return Err(AgentorError::InvalidState(format!(
                "teammate {teammate_id} is {} and needs no recovery",
                mate.status
            )));
        }
        let mate = self
            .db
            .update_teammate(teammate_id, TeammatePatch {
                status: Some(TeammateStatus::Idle),
                current_task_id: Some(None),
                ..TeammatePatch::default()
            })
            .await?;
        self.events.publish(TeamEvent::TeammateUpdated(mate.clone()));
        self.broker
            .send_message(
                NewMessage::new(mate.team_id, MessageType::StatusUpdate, "teammate_recovered")
                    .from_teammate(Some(mate.id))
                    .with_content(format!("{} is available again", mate.name)),
            )
            .await?;
        Ok(mate)
    }

    /// Assign one ready task to one idle teammate. `None` when the team is not active or
    /// nothing can be paired.
    pub async fn schedule_next_task(&self, team_id: Uuid) -> AgentorResult<Option<Allocation>> {
        let team = self.get_team(team_id).await?;
        if team.status != TeamStatus::Active {
            debug!(team_id = %team_id, status = %team.status, "Scheduling skipped, team not active");
            return Ok(None);
        }
        let Some(allocation) = self
            .tasks
            .get_next_task(team_id, team.allocation_strategy)
            .await?
        else {
            return Ok(None);
        };

        let task = self
            .tasks
            .assign_task(allocation.task_id, allocation.teammate_id)
            .await?;
        self.broker
            .send_message(
                NewMessage::new(team_id, MessageType::TaskAssigned, "task_assigned")
                    .to_teammate(allocation.teammate_id)
                    .for_task(task.id)
                    .with_content(task.subject.clone())
                    .with_metadata(serde_json::json!({
                        "provider": task.provider,
                        "model": task.model,
                    })),
            )
            .await?;
        Ok(Some(allocation))
    }

    /// Schedule until no pair is left. Returns how many tasks were assigned.
    pub async fn schedule_all_ready_tasks(&self, team_id: Uuid) -> AgentorResult<usize> {
        let mut scheduled = 0;
        while self.schedule_next_task(team_id).await?.is_some() {
            scheduled += 1;
        }
        if scheduled > 0 {
            debug!(team_id = %team_id, scheduled, "Scheduled ready tasks");
        }
        Ok(scheduled)
    }

    /// Complete the task, announce it, and schedule whatever it unblocked.
    pub async fn handle_task_completion(
        &self,
        task_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> AgentorResult<Task> {
        let before = self.tasks.get_task(task_id).await?;
        if before.status.is_terminal() {
            return Ok(before);
        }
        let task = self.tasks.complete_task(task_id, result).await?;
        if let Err(e) = self
            .broker
            .send_message(
                NewMessage::new(task.team_id, MessageType::TaskCompleted, "task_completed")
                    .from_teammate(task.assigned_to)
                    .for_task(task.id)
                    .with_content(task.subject.clone()),
            )
            .await
        {
            warn!(task_id = %task.id, error = %e, "Completion notice not delivered");
        }
        self.schedule_all_ready_tasks(task.team_id).await?;
        Ok(task)
    }

    pub async fn handle_task_failure(
        &self,
        task_id: Uuid,
        error: impl Into<String>,
    ) -> AgentorResult<Task> {
        let before = self.tasks.get_task(task_id).await?;
        if before.status.is_terminal() {
            return Ok(before);
        }
        let error = error.into();
        let task = self.tasks.fail_task(task_id, error.clone()).await?;
        if let Err(e) = self
            .broker
            .send_message(
                NewMessage::new(task.team_id, MessageType::TaskFailed, "task_failed")
                    .from_teammate(task.assigned_to)
                    .for_task(task.id)
                    .with_content(error),
            )
            .await
        {
            warn!(task_id = %task.id, error = %e, "Failure notice not delivered");
        }
        self.schedule_all_ready_tasks(task.team_id).await?;
        Ok(task)
    }
}
