use crate::allocation::{Allocation, AllocationPolicies};
use crate::dependency::{detect_cycles, DependencyResolver, TaskGraph};
use crate::events::{EventBus, TeamEvent};
use crate::provider::{ProviderRouter, ProviderSelection};
use crate::store::{TaskPatch, TeamPatch, TeammatePatch, TeamsDatabase};
use crate::types::{
    AllocationStrategy, DependencyType, NewTask, Task, TaskDependency, TaskStatus, Teammate,
    TeammateStatus, TokenUsage,
};
use agentor_core::{AgentorError, AgentorResult, Entity};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const OPEN: &[TaskStatus] = &[TaskStatus::Pending, TaskStatus::InProgress];

/// Task lifecycle and allocation.
///
/// Task and teammate records are updated in separate calls; a crash between them can leave
/// a teammate `busy` on a task that already finished. Nothing here reconciles that.
pub struct TaskManager {
    db: Arc<dyn TeamsDatabase>,
    resolver: DependencyResolver,
    router: Arc<dyn ProviderRouter>,
    policies: AllocationPolicies,
    events: EventBus,
}

impl TaskManager {
    pub fn new(
        db: Arc<dyn TeamsDatabase>,
        router: Arc<dyn ProviderRouter>,
        policies: AllocationPolicies,
        events: EventBus,
    ) -> Self {
        Self {
            resolver: DependencyResolver::new(Arc::clone(&db)),
            db,
            router,
            policies,
            events,
        }
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.resolver
    }

    pub fn router(&self) -> &Arc<dyn ProviderRouter> {
        &self.router
    }

    pub async fn get_task(&self, task_id: Uuid) -> AgentorResult<Task> {
        self.db
            .get_task(task_id)
            .await?
            .ok_or_else(|| AgentorError::not_found(Entity::Task, task_id))
    }

    async fn get_teammate(&self, teammate_id: Uuid) -> AgentorResult<Teammate> {
        self.db
            .get_teammate(teammate_id)
            .await?
            .ok_or_else(|| AgentorError::not_found(Entity::Teammate, teammate_id))
    }

    /// Persist a new `pending` task and mirror its edges onto the tasks it references.
    pub async fn create_task(&self, mut params: NewTask) -> AgentorResult<Task> {
        if self.db.get_team(params.team_id).await?.is_none() {
            return Err(AgentorError::not_found(Entity::Team, params.team_id));
        }
        dedup(&mut params.blocked_by);
        dedup(&mut params.blocks);

        let existing = self.db.list_tasks(params.team_id).await?;
        for id in params.blocked_by.iter().chain(params.blocks.iter()) {
            if !existing.iter().any(|t| t.id == *id) {
                return Err(AgentorError::not_found(Entity::Task, id));
            }
        }

        let task = Task::new(params);
        let mut graph = TaskGraph::from_tasks(&existing);
        graph.add_node(task.id, task.blocked_by.clone());
        for blocked in &task.blocks {
            graph.add_edge(*blocked, task.id);
        }
        if let Some(cycles) = detect_cycles(&graph) {
            let cycle = cycles.into_iter().next().unwrap_or_default();
            warn!(team_id = %task.team_id, subject = %task.subject, "Rejected task that closes a cycle");
            return Err(AgentorError::CircularDependency(cycle));
        }

        self.db.create_task(&task).await?;
        for dep in &task.blocked_by {
            self.db
                .create_dependency(&TaskDependency::new(task.id, *dep, DependencyType::FinishToStart))
                .await?;
            let updated = self
                .db
                .update_task(*dep, TaskPatch {
                    add_blocks: vec![task.id],
                    ..TaskPatch::default()
                })
                .await?;
            self.events.publish(TeamEvent::TaskUpdated(updated));
        }
        for blocked in &task.blocks {
            self.db
                .create_dependency(&TaskDependency::new(
                    *blocked,
                    task.id,
                    DependencyType::FinishToStart,
                ))
                .await?;
            let updated = self
                .db
                .update_task(*blocked, TaskPatch {
                    add_blocked_by: vec![task.id],
                    ..TaskPatch::default()
                })
                .await?;
            self.events.publish(TeamEvent::TaskUpdated(updated));
        }

        let team = self
            .db
            .update_team(task.team_id, TeamPatch {
                total_tasks_delta: 1,
                ..TeamPatch::default()
            })
            .await?;
        self.events.publish(TeamEvent::TeamUpdated(team));
        self.events.publish(TeamEvent::TaskUpdated(task.clone()));

        debug!(task_id = %task.id, team_id = %task.team_id, subject = %task.subject, "Task created");
        Ok(task)
    }

    /// Record `task_id` depending on `depends_on`. Only `finish_to_start` edges gate
    /// readiness; the other types are stored as records only.
    pub async fn add_dependency(
        &self,
        task_id: Uuid,
        depends_on: Uuid,
        dependency_type: DependencyType,
    ) -> AgentorResult<TaskDependency> {
        if task_id == depends_on {
            return Err(AgentorError::InvalidState(format!(
                "task {task_id} cannot depend on itself"
            )));
        }
        let task = self.get_task(task_id).await?;
        let upstream = self.get_task(depends_on).await?;
        if task.team_id != upstream.team_id {
            return Err(AgentorError::InvalidState(format!(
                "tasks {task_id} and {depends_on} belong to different teams"
            )));
        }

        let mut graph = self.resolver.build_dag(task.team_id).await?;
        graph.add_edge(task_id, depends_on);
        if let Some(cycles) = detect_cycles(&graph) {
            return Err(AgentorError::CircularDependency(
                cycles.into_iter().next().unwrap_or_default(),
            ));
        }

        let dependency = TaskDependency::new(task_id, depends_on, dependency_type);
        self.db.create_dependency(&dependency).await?;
        if dependency_type == DependencyType::FinishToStart {
            let downstream = self
                .db
                .update_task(task_id, TaskPatch {
                    add_blocked_by: vec![depends_on],
                    ..TaskPatch::default()
                })
                .await?;
            let upstream = self
                .db
                .update_task(depends_on, TaskPatch {
                    add_blocks: vec![task_id],
                    ..TaskPatch::default()
                })
                .await?;
            self.events.publish(TeamEvent::TaskUpdated(downstream));
            self.events.publish(TeamEvent::TaskUpdated(upstream));
        }
        Ok(dependency)
    }

    /// Reserve a task for a teammate and pick its provider.
    ///
    /// A `pending` task moves to `in_progress` only when its dependencies are complete;
    /// otherwise it stays `pending`, reserved for the teammate.
    pub async fn assign_task(&self, task_id: Uuid, teammate_id: Uuid) -> AgentorResult<Task> {
        let task = self.get_task(task_id).await?;
        let mate = self.get_teammate(teammate_id).await?;
        if task.status.is_terminal() {
            return Err(AgentorError::InvalidState(format!(
                "task {task_id} is {} and cannot be assigned",
                task.status
            )));
        }
        if mate.team_id != task.team_id {
            return Err(AgentorError::InvalidState(format!(
                "teammate {teammate_id} is not a member of team {}",
                task.team_id
            )));
        }
        match (mate.status, mate.current_task_id) {
            (TeammateStatus::Idle, _) => {}
            (TeammateStatus::Busy, Some(current)) if current == task_id => {}
            (status, _) => {
                return Err(AgentorError::InvalidState(format!(
                    "teammate {teammate_id} is {status} and cannot take task {task_id}"
                )));
            }
        }

        let selection = self.router.select_provider(&task, &mate)?;

        if let Some(previous) = task.assigned_to.filter(|id| *id != teammate_id) {
            self.release_teammate(previous, task_id, TeammateStatus::Idle, TeammatePatch::default())
                .await?;
        }

        let mate = self
            .db
            .update_teammate(teammate_id, TeammatePatch {
                status: Some(TeammateStatus::Busy),
                current_task_id: Some(Some(task_id)),
                ..TeammatePatch::default()
            })
            .await?;
        self.events.publish(TeamEvent::TeammateUpdated(mate));

        let mut patch = TaskPatch {
            assigned_to: Some(Some(teammate_id)),
            provider: Some(selection.provider.clone()),
            model: Some(selection.model.clone()),
            ..TaskPatch::default()
        }
        .only_from(OPEN);
        if task.status == TaskStatus::Pending
            && self.resolver.unmet_dependencies(&task).await?.is_empty()
        {
            patch.status = Some(TaskStatus::InProgress);
            patch.started_at = Some(Utc::now());
        }
        let task = self.db.update_task(task_id, patch).await?;
        self.events.publish(TeamEvent::TaskUpdated(task.clone()));

        info!(
            task_id = %task_id,
            teammate_id = %teammate_id,
            provider = %selection.provider,
            model = %selection.model,
            status = %task.status,
            "Task assigned"
        );
        Ok(task)
    }

    pub async fn start_task(&self, task_id: Uuid) -> AgentorResult<Task> {
        let task = self.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(AgentorError::InvalidState(format!(
                "task {task_id} is {} and cannot be started",
                task.status
            )));
        }
        let pending = self.resolver.unmet_dependencies(&task).await?;
        if !pending.is_empty() {
            return Err(AgentorError::DependencyNotSatisfied { task_id, pending });
        }

        let task = self
            .db
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    error: Some(None),
                    started_at: Some(Utc::now()),
                    ..TaskPatch::default()
                }
                .only_from(OPEN),
            )
            .await?;
        self.events.publish(TeamEvent::TaskUpdated(task.clone()));
        debug!(task_id = %task_id, "Task started");
        Ok(task)
    }

    /// Mark a task completed. On a task that already finished this returns the stored
    /// record and changes nothing.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> AgentorResult<Task> {
        let patch = TaskPatch {
            status: Some(TaskStatus::Completed),
            result,
            error: Some(None),
            completed_at: Some(Utc::now()),
            ..TaskPatch::default()
        };
        let Some(task) = self.finish(task_id, patch).await? else {
            return self.get_task(task_id).await;
        };

        if let Some(mate_id) = task.assigned_to {
            self.release_teammate(mate_id, task_id, TeammateStatus::Idle, TeammatePatch {
                completed_delta: 1,
                tokens_delta: task.total_tokens(),
                cost_delta: task.cost_usd,
                task_duration_ms: Some(elapsed_ms(&task)),
                ..TeammatePatch::default()
            })
            .await?;
        }
        let team = self
            .db
            .update_team(task.team_id, TeamPatch {
                completed_tasks_delta: 1,
                cost_delta: task.cost_usd,
                ..TeamPatch::default()
            })
            .await?;
        self.events.publish(TeamEvent::TeamUpdated(team));

        info!(task_id = %task_id, cost_usd = task.cost_usd, "Task completed");
        Ok(task)
    }

    /// Mark a task failed and put its teammate in `error`. No-op on finished tasks.
    pub async fn fail_task(&self, task_id: Uuid, error: impl Into<String>) -> AgentorResult<Task> {
        let error = error.into();
        let patch = TaskPatch {
            status: Some(TaskStatus::Failed),
            error: Some(Some(error.clone())),
            completed_at: Some(Utc::now()),
            ..TaskPatch::default()
        };
        let Some(task) = self.finish(task_id, patch).await? else {
            return self.get_task(task_id).await;
        };

        if let Some(mate_id) = task.assigned_to {
            self.release_teammate(mate_id, task_id, TeammateStatus::Error, TeammatePatch {
                failed_delta: 1,
                tokens_delta: task.total_tokens(),
                cost_delta: task.cost_usd,
                task_duration_ms: Some(elapsed_ms(&task)),
                ..TeammatePatch::default()
            })
            .await?;
        }
        let team = self
            .db
            .update_team(task.team_id, TeamPatch {
                failed_tasks_delta: 1,
                cost_delta: task.cost_usd,
                ..TeamPatch::default()
            })
            .await?;
        self.events.publish(TeamEvent::TeamUpdated(team));

        warn!(task_id = %task_id, error = %error, "Task failed");
        Ok(task)
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> AgentorResult<Task> {
        let task = self.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(AgentorError::InvalidState(format!(
                "task {task_id} is already {}",
                task.status
            )));
        }
        let task = self
            .db
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Cancelled),
                    completed_at: Some(Utc::now()),
                    ..TaskPatch::default()
                }
                .only_from(OPEN),
            )
            .await?;
        self.events.publish(TeamEvent::TaskUpdated(task.clone()));

        if let Some(mate_id) = task.assigned_to {
            self.release_teammate(mate_id, task_id, TeammateStatus::Idle, TeammatePatch::default())
                .await?;
        }
        info!(task_id = %task_id, "Task cancelled");
        Ok(task)
    }

    /// Add one attempt's usage to the task's running totals.
    pub async fn record_attempt(&self, task_id: Uuid, usage: TokenUsage) -> AgentorResult<Task> {
        if usage.is_empty() {
            return self.get_task(task_id).await;
        }
        let task = self
            .db
            .update_task(task_id, TaskPatch {
                usage_delta: usage,
                ..TaskPatch::default()
            })
            .await?;
        self.events.publish(TeamEvent::TaskUpdated(task.clone()));
        Ok(task)
    }

    /// Persist a failover choice along with the error that caused it.
    pub async fn switch_provider(
        &self,
        task_id: Uuid,
        selection: &ProviderSelection,
        error: impl Into<String>,
    ) -> AgentorResult<Task> {
        let task = self
            .db
            .update_task(task_id, TaskPatch {
                provider: Some(selection.provider.clone()),
                model: Some(selection.model.clone()),
                error: Some(Some(error.into())),
                ..TaskPatch::default()
            })
            .await?;
        self.events.publish(TeamEvent::TaskUpdated(task.clone()));
        Ok(task)
    }

    /// Store the latest attempt error without touching status.
    pub async fn note_error(&self, task_id: Uuid, error: impl Into<String>) -> AgentorResult<Task> {
        let task = self
            .db
            .update_task(task_id, TaskPatch {
                error: Some(Some(error.into())),
                ..TaskPatch::default()
            })
            .await?;
        self.events.publish(TeamEvent::TaskUpdated(task.clone()));
        Ok(task)
    }

    /// One allocation for the team under `strategy`, or `None` when no unassigned ready
    /// task or no idle teammate is left.
    pub async fn get_next_task(
        &self,
        team_id: Uuid,
        strategy: AllocationStrategy,
    ) -> AgentorResult<Option<Allocation>> {
        self.allocate(team_id, strategy, true).await
    }

    /// The allocation `get_next_task` would make, leaving policy state untouched.
    pub async fn peek_next_task(
        &self,
        team_id: Uuid,
        strategy: AllocationStrategy,
    ) -> AgentorResult<Option<Allocation>> {
        self.allocate(team_id, strategy, false).await
    }

    async fn allocate(
        &self,
        team_id: Uuid,
        strategy: AllocationStrategy,
        commit: bool,
    ) -> AgentorResult<Option<Allocation>> {
        let ready: Vec<Task> = self
            .resolver
            .get_ready_tasks(team_id)
            .await?
            .into_iter()
            .filter(|t| t.assigned_to.is_none())
            .collect();
        if ready.is_empty() {
            return Ok(None);
        }
        let teammates = self.db.list_teammates(team_id).await?;
        let Some(policy) = self.policies.get(strategy) else {
            return Err(AgentorError::Config(format!(
                "no allocation policy registered for {strategy}"
            )));
        };
        let allocation = if commit {
            policy.select_next(team_id, &ready, &teammates)
        } else {
            policy.peek_next(team_id, &ready, &teammates)
        };
        debug!(
            team_id = %team_id,
            strategy = %strategy,
            ready = ready.len(),
            allocated = allocation.is_some(),
            commit,
            "Allocation pass"
        );
        Ok(allocation)
    }

    /// Apply a terminal patch unless the task already finished. `None` means it had.
    async fn finish(&self, task_id: Uuid, patch: TaskPatch) -> AgentorResult<Option<Task>> {
        let current = self.get_task(task_id).await?;
        if current.status.is_terminal() {
            debug!(task_id = %task_id, status = %current.status, "Task already finished");
            return Ok(None);
        }
        match self.db.update_task(task_id, patch.only_from(OPEN)).await {
            Ok(task) => {
                self.events.publish(TeamEvent::TaskUpdated(task.clone()));
                Ok(Some(task))
            }
            // Lost a race with another terminal transition.
            Err(AgentorError::InvalidState(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Apply counters to a teammate and free it when it still holds `task_id`.
    async fn release_teammate(
        &self,
        teammate_id: Uuid,
        task_id: Uuid,
        status: TeammateStatus,
        mut patch: TeammatePatch,
    ) -> AgentorResult<()> {
        let Some(mate) = self.db.get_teammate(teammate_id).await? else {
            warn!(teammate_id = %teammate_id, task_id = %task_id, "Assigned teammate no longer exists");
            return Ok(());
        };
        if mate.current_task_id == Some(task_id) {
            patch.status = Some(status);
            patch.current_task_id = Some(None);
        }
        let mate = self.db.update_teammate(teammate_id, patch).await?;
        self.events.publish(TeamEvent::TeammateUpdated(mate));
        Ok(())
    }
}

fn dedup(ids: &mut Vec<Uuid>) {
    let mut seen = HashSet::new();
    ids.retain(|id| seen.insert(*id));
}

fn elapsed_ms(task: &Task) -> u64 {
    let end = task.completed_at.unwrap_or_else(Utc::now);
    task.started_at
        .map(|start| (end - start).num_milliseconds().max(0))
        .and_then(|ms| u64::try_from(ms).ok())
        .unwrap_or(0)
}
