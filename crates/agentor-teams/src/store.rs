use crate::types::{
    CostAnalysis, ExecutionSession, MessageQuery, ProviderCost, SessionStatus, Task,
    TaskDependency, TaskStatus, Team, TeamMessage, TeamStats, TeamStatus, Teammate,
    TeammateCost, TeammateStatus, TokenUsage,
};
use agentor_core::{AgentorError, AgentorResult, Entity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Patches
// ---------------------------------------------------------------------------

/// Partial update of a [`Team`], applied atomically by the store.
/// `*_delta` fields are added to the stored counters.
#[derive(Debug, Clone, Default)]
pub struct TeamPatch {
    pub status: Option<TeamStatus>,
    /// Only written when the team has never been started.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_tasks_delta: u32,
    pub completed_tasks_delta: u32,
    pub failed_tasks_delta: u32,
    pub cost_delta: f64,
}

impl TeamPatch {
    pub fn status(status: TeamStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(&self, team: &mut Team) {
        if let Some(status) = self.status {
            team.status = status;
        }
        if team.started_at.is_none() {
            team.started_at = self.started_at;
        }
        if self.completed_at.is_some() {
            team.completed_at = self.completed_at;
        }
        team.total_tasks += self.total_tasks_delta;
        team.completed_tasks += self.completed_tasks_delta;
        team.failed_tasks += self.failed_tasks_delta;
        team.total_cost_usd += self.cost_delta;
    }
}

/// Partial update of a [`Teammate`].
#[derive(Debug, Clone, Default)]
pub struct TeammatePatch {
    pub status: Option<TeammateStatus>,
    pub current_task_id: Option<Option<Uuid>>,
    pub completed_delta: u32,
    pub failed_delta: u32,
    pub tokens_delta: u64,
    pub cost_delta: f64,
    /// Duration of a task that just finished; folded into the running average.
    pub task_duration_ms: Option<u64>,
}

impl TeammatePatch {
    pub fn status(status: TeammateStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn apply(&self, mate: &mut Teammate) {
        if let Some(status) = self.status {
            mate.status = status;
        }
        if let Some(current) = self.current_task_id {
            mate.current_task_id = current;
        }
        if let Some(duration) = self.task_duration_ms {
            let finished = f64::from(mate.finished_tasks());
            mate.avg_task_duration_ms =
                (mate.avg_task_duration_ms * finished + duration as f64) / (finished + 1.0);
        }
        mate.tasks_completed += self.completed_delta;
        mate.tasks_failed += self.failed_delta;
        mate.total_tokens += self.tokens_delta;
        mate.total_cost_usd += self.cost_delta;
    }
}

/// Partial update of a [`Task`].
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    /// When set, the update is rejected with `InvalidState` unless the task is currently
    /// in one of these states.
    pub only_from: Option<Vec<TaskStatus>>,
    pub status: Option<TaskStatus>,
    pub assigned_to: Option<Option<Uuid>>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub usage_delta: TokenUsage,
    pub add_blocks: Vec<Uuid>,
    pub add_blocked_by: Vec<Uuid>,
    pub remove_blocks: Vec<Uuid>,
    pub remove_blocked_by: Vec<Uuid>,
    pub result: Option<serde_json::Value>,
    pub error: Option<Option<String>>,
    /// Only written when the task has never been started.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn only_from(mut self, statuses: &[TaskStatus]) -> Self {
        self.only_from = Some(statuses.to_vec());
        self
    }

    pub fn check(&self, task: &Task) -> AgentorResult<()> {
        match &self.only_from {
            Some(allowed) if !allowed.contains(&task.status) => {
                Err(AgentorError::InvalidState(format!(
                    "task {} is {}, expected one of {:?}",
                    task.id, task.status, allowed
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(assignee) = self.assigned_to {
            task.assigned_to = assignee;
        }
        if let Some(provider) = &self.provider {
            task.provider = Some(provider.clone());
        }
        if let Some(model) = &self.model {
            task.model = Some(model.clone());
        }
        task.input_tokens += self.usage_delta.input_tokens;
        task.output_tokens += self.usage_delta.output_tokens;
        task.cost_usd += self.usage_delta.cost_usd;
        for id in &self.add_blocks {
            if !task.blocks.contains(id) {
                task.blocks.push(*id);
            }
        }
        for id in &self.add_blocked_by {
            if !task.blocked_by.contains(id) {
                task.blocked_by.push(*id);
            }
        }
        task.blocks.retain(|id| !self.remove_blocks.contains(id));
        task.blocked_by.retain(|id| !self.remove_blocked_by.contains(id));
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            task.error = error.clone();
        }
        if task.started_at.is_none() {
            task.started_at = self.started_at;
        }
        if self.completed_at.is_some() {
            task.completed_at = self.completed_at;
        }
    }
}

/// Partial update of an [`ExecutionSession`].
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub usage: Option<TokenUsage>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl SessionPatch {
    pub fn apply(&self, session: &mut ExecutionSession) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(usage) = self.usage {
            session.input_tokens = usage.input_tokens;
            session.output_tokens = usage.output_tokens;
            session.cost_usd = usage.cost_usd;
        }
        if self.completed_at.is_some() {
            session.completed_at = self.completed_at;
        }
        if self.duration_ms.is_some() {
            session.duration_ms = self.duration_ms;
        }
        if let Some(result) = &self.result {
            session.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            session.error = Some(error.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// TeamsDatabase trait
// ---------------------------------------------------------------------------

/// Persistence contract for teams, teammates, tasks, dependencies, messages and sessions.
///
/// Every `update_*` call is atomic for the one record it touches; nothing spans records.
/// The ready-task query and the two reports have default implementations built on the
/// list queries, so a backend only has to provide plain CRUD.
#[async_trait]
pub trait TeamsDatabase: Send + Sync {
    async fn create_team(&self, team: &Team) -> AgentorResult<()>;
    async fn get_team(&self, id: Uuid) -> AgentorResult<Option<Team>>;
    async fn update_team(&self, id: Uuid, patch: TeamPatch) -> AgentorResult<Team>;
    async fn delete_team(&self, id: Uuid) -> AgentorResult<bool>;
    async fn list_teams(&self) -> AgentorResult<Vec<Team>>;

    async fn create_teammate(&self, teammate: &Teammate) -> AgentorResult<()>;
    async fn get_teammate(&self, id: Uuid) -> AgentorResult<Option<Teammate>>;
    async fn update_teammate(&self, id: Uuid, patch: TeammatePatch) -> AgentorResult<Teammate>;
    async fn delete_teammate(&self, id: Uuid) -> AgentorResult<bool>;
    async fn list_teammates(&self, team_id: Uuid) -> AgentorResult<Vec<Teammate>>;

    async fn create_task(&self, task: &Task) -> AgentorResult<()>;
    async fn get_task(&self, id: Uuid) -> AgentorResult<Option<Task>>;
    async fn update_task(&self, id: Uuid, patch: TaskPatch) -> AgentorResult<Task>;
    async fn delete_task(&self, id: Uuid) -> AgentorResult<bool>;
    /// Tasks of a team in creation order.
    async fn list_tasks(&self, team_id: Uuid) -> AgentorResult<Vec<Task>>;

    async fn create_dependency(&self, dependency: &TaskDependency) -> AgentorResult<()>;
    async fn list_dependencies(&self, task_id: Uuid) -> AgentorResult<Vec<TaskDependency>>;
    async fn delete_dependency(&self, task_id: Uuid, depends_on: Uuid) -> AgentorResult<bool>;

    async fn create_message(&self, message: &TeamMessage) -> AgentorResult<()>;
    async fn list_messages(&self, query: &MessageQuery) -> AgentorResult<Vec<TeamMessage>>;

    async fn create_session(&self, session: &ExecutionSession) -> AgentorResult<()>;
    async fn get_session(&self, id: Uuid) -> AgentorResult<Option<ExecutionSession>>;
    async fn update_session(
        &self,
        id: Uuid,
        patch: SessionPatch,
    ) -> AgentorResult<ExecutionSession>;
    async fn list_sessions(&self, team_id: Uuid) -> AgentorResult<Vec<ExecutionSession>>;
    async fn list_task_sessions(&self, task_id: Uuid) -> AgentorResult<Vec<ExecutionSession>>;

    /// Pending tasks whose `blocked_by` entries all exist and are completed, highest
    /// priority first, then in creation order.
    async fn get_ready_tasks(&self, team_id: Uuid) -> AgentorResult<Vec<Task>> {
        let tasks = self.list_tasks(team_id).await?;
        let completed: HashSet<Uuid> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect();

        let mut ready: Vec<Task> = tasks
            .into_iter()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.blocked_by.iter().all(|dep| completed.contains(dep))
            })
            .collect();
        // Stable sort keeps creation order among equal priorities.
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(ready)
    }

    async fn get_team_stats(&self, team_id: Uuid) -> AgentorResult<TeamStats> {
        if self.get_team(team_id).await?.is_none() {
            return Err(AgentorError::not_found(Entity::Team, team_id));
        }
        let tasks = self.list_tasks(team_id).await?;
        let teammates = self.list_teammates(team_id).await?;

        let mut stats = TeamStats {
            total_tasks: tasks.len(),
            total_teammates: teammates.len(),
            ..TeamStats::default()
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Pending => stats.pending_tasks += 1,
                TaskStatus::InProgress => stats.in_progress_tasks += 1,
                TaskStatus::Completed => stats.completed_tasks += 1,
                TaskStatus::Failed => stats.failed_tasks += 1,
                TaskStatus::Cancelled => stats.cancelled_tasks += 1,
            }
            stats.total_tokens += task.total_tokens();
            stats.total_cost_usd += task.cost_usd;
        }
        for mate in &teammates {
            match mate.status {
                TeammateStatus::Idle => stats.idle_teammates += 1,
                TeammateStatus::Busy => stats.busy_teammates += 1,
                TeammateStatus::Offline => stats.offline_teammates += 1,
                TeammateStatus::Error => stats.error_teammates += 1,
            }
        }
        Ok(stats)
    }

    async fn get_cost_analysis(&self, team_id: Uuid) -> AgentorResult<CostAnalysis> {
        if self.get_team(team_id).await?.is_none() {
            return Err(AgentorError::not_found(Entity::Team, team_id));
        }
        let teammates = self.list_teammates(team_id).await?;
        let sessions = self.list_sessions(team_id).await?;

        let mut analysis = CostAnalysis {
            team_id: Some(team_id),
            ..CostAnalysis::default()
        };

        let mut by_teammate: HashMap<Uuid, (u64, f64)> = HashMap::new();
        let mut by_provider: Vec<ProviderCost> = Vec::new();
        for session in &sessions {
            let tokens = session.input_tokens + session.output_tokens;
            analysis.total_tokens += tokens;
            analysis.total_cost_usd += session.cost_usd;

            let entry = by_teammate.entry(session.teammate_id).or_default();
            entry.0 += tokens;
            entry.1 += session.cost_usd;

            let row = match by_provider
                .iter()
                .position(|p| p.provider == session.provider && p.model == session.model)
            {
                Some(idx) => &mut by_provider[idx],
                None => {
                    by_provider.push(ProviderCost {
                        provider: session.provider.clone(),
                        model: session.model.clone(),
                        sessions: 0,
                        failed_sessions: 0,
                        total_tokens: 0,
                        total_cost_usd: 0.0,
                    });
                    let last = by_provider.len() - 1;
                    &mut by_provider[last]
                }
            };
            row.sessions += 1;
            if session.status == SessionStatus::Failed {
                row.failed_sessions += 1;
            }
            row.total_tokens += tokens;
            row.total_cost_usd += session.cost_usd;
        }

        analysis.by_teammate = teammates
            .iter()
            .map(|mate| {
                let (tokens, cost) = by_teammate.get(&mate.id).copied().unwrap_or_default();
                TeammateCost {
                    teammate_id: mate.id,
                    name: mate.name.clone(),
                    tasks_completed: mate.tasks_completed,
                    tasks_failed: mate.tasks_failed,
                    total_tokens: tokens,
                    total_cost_usd: cost,
                }
            })
            .collect();
        analysis.by_provider = by_provider;
        Ok(analysis)
    }
}

// ---------------------------------------------------------------------------
// InMemoryTeamsDatabase
// ---------------------------------------------------------------------------

/// Rows keyed by id, iterated in insertion order.
struct Table<T> {
    order: Vec<Uuid>,
    rows: HashMap<Uuid, T>,
}

impl<T: Clone> Table<T> {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            rows: HashMap::new(),
        }
    }

    fn insert(&mut self, id: Uuid, row: T) -> AgentorResult<()> {
        if self.rows.contains_key(&id) {
            return Err(AgentorError::Storage(format!("duplicate id {id}")));
        }
        self.order.push(id);
        self.rows.insert(id, row);
        Ok(())
    }

    fn get(&self, id: Uuid) -> Option<T> {
        self.rows.get(&id).cloned()
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut T> {
        self.rows.get_mut(&id)
    }

    fn remove(&mut self, id: Uuid) -> bool {
        if self.rows.remove(&id).is_some() {
            self.order.retain(|o| *o != id);
            true
        } else {
            false
        }
    }

    fn filtered(&self, mut keep: impl FnMut(&T) -> bool) -> Vec<T> {
        self.order
            .iter()
            .filter_map(|id| self.rows.get(id))
            .filter(|row| keep(row))
            .cloned()
            .collect()
    }
}

/// In-process [`TeamsDatabase`]. Each table sits behind its own lock.
pub struct InMemoryTeamsDatabase {
    teams: RwLock<Table<Team>>,
    teammates: RwLock<Table<Teammate>>,
    tasks: RwLock<Table<Task>>,
    dependencies: RwLock<Vec<TaskDependency>>,
    messages: RwLock<Vec<TeamMessage>>,
    sessions: RwLock<Table<ExecutionSession>>,
}

impl InMemoryTeamsDatabase {
    pub fn new() -> Self {
        Self {
            teams: RwLock::new(Table::new()),
            teammates: RwLock::new(Table::new()),
            tasks: RwLock::new(Table::new()),
            dependencies: RwLock::new(Vec::new()),
            messages: RwLock::new(Vec::new()),
            sessions: RwLock::new(Table::new()),
        }
    }
}

impl Default for InMemoryTeamsDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TeamsDatabase for InMemoryTeamsDatabase {
    async fn create_team(&self, team: &Team) -> AgentorResult<()> {
        self.teams.write().await.insert(team.id, team.clone())
    }

    async fn get_team(&self, id: Uuid) -> AgentorResult<Option<Team>> {
        Ok(self.teams.read().await.get(id))
    }

    async fn update_team(&self, id: Uuid, patch: TeamPatch) -> AgentorResult<Team> {
        let mut teams = self.teams.write().await;
        let team = teams
            .get_mut(id)
            .ok_or_else(|| AgentorError::not_found(Entity::Team, id))?;
        patch.apply(team);
        Ok(team.clone())
    }

    async fn delete_team(&self, id: Uuid) -> AgentorResult<bool> {
        let removed = self.teams.write().await.remove(id);
        if removed {
            let task_ids: HashSet<Uuid> = {
                let mut tasks = self.tasks.write().await;
                let ids: Vec<Uuid> =
                    tasks.filtered(|t| t.team_id == id).iter().map(|t| t.id).collect();
                for task_id in &ids {
                    tasks.remove(*task_id);
                }
                ids.into_iter().collect()
            };
            {
                let mut teammates = self.teammates.write().await;
                let ids: Vec<Uuid> =
                    teammates.filtered(|m| m.team_id == id).iter().map(|m| m.id).collect();
                for mate_id in ids {
                    teammates.remove(mate_id);
                }
            }
            {
                let mut sessions = self.sessions.write().await;
                let ids: Vec<Uuid> =
                    sessions.filtered(|s| s.team_id == id).iter().map(|s| s.id).collect();
                for session_id in ids {
                    sessions.remove(session_id);
                }
            }
            self.dependencies
                .write()
                .await
                .retain(|d| !task_ids.contains(&d.task_id));
            self.messages.write().await.retain(|m| m.team_id != id);
        }
        Ok(removed)
    }

    async fn list_teams(&self) -> AgentorResult<Vec<Team>> {
        Ok(self.teams.read().await.filtered(|_| true))
    }

    async fn create_teammate(&self, teammate: &Teammate) -> AgentorResult<()> {
        self.teammates
            .write()
            .await
            .insert(teammate.id, teammate.clone())
    }

    async fn get_teammate(&self, id: Uuid) -> AgentorResult<Option<Teammate>> {
        Ok(self.teammates.read().await.get(id))
    }

    async fn update_teammate(&self, id: Uuid, patch: TeammatePatch) -> AgentorResult<Teammate> {
        let mut teammates = self.teammates.write().await;
        let mate = teammates
            .get_mut(id)
            .ok_or_else(|| AgentorError::not_found(Entity::Teammate, id))?;
        patch.apply(mate);
        Ok(mate.clone())
    }

    async fn delete_teammate(&self, id: Uuid) -> AgentorResult<bool> {
        Ok(self.teammates.write().await.remove(id))
    }

    async fn list_teammates(&self, team_id: Uuid) -> AgentorResult<Vec<Teammate>> {
        Ok(self
            .teammates
            .read()
            .await
            .filtered(|m| m.team_id == team_id))
    }

    async fn create_task(&self, task: &Task) -> AgentorResult<()> {
        self.tasks.write().await.insert(task.id, task.clone())
    }

    async fn get_task(&self, id: Uuid) -> AgentorResult<Option<Task>> {
        Ok(self.tasks.read().await.get(id))
    }

    async fn update_task(&self, id: Uuid, patch: TaskPatch) -> AgentorResult<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| AgentorError::not_found(Entity::Task, id))?;
        patch.check(task)?;
        patch.apply(task);
        Ok(task.clone())
    }

    async fn delete_task(&self, id: Uuid) -> AgentorResult<bool> {
        let removed = self.tasks.write().await.remove(id);
        if removed {
            self.dependencies
                .write()
                .await
                .retain(|d| d.task_id != id && d.depends_on_task_id != id);
        }
        Ok(removed)
    }

    async fn list_tasks(&self, team_id: Uuid) -> AgentorResult<Vec<Task>> {
        Ok(self.tasks.read().await.filtered(|t| t.team_id == team_id))
    }

    async fn create_dependency(&self, dependency: &TaskDependency) -> AgentorResult<()> {
        let mut deps = self.dependencies.write().await;
        let exists = deps.iter().any(|d| {
            d.task_id == dependency.task_id
                && d.depends_on_task_id == dependency.depends_on_task_id
        });
        if !exists {
            deps.push(dependency.clone());
        }
        Ok(())
    }

    async fn list_dependencies(&self, task_id: Uuid) -> AgentorResult<Vec<TaskDependency>> {
        Ok(self
            .dependencies
            .read()
            .await
            .iter()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn delete_dependency(&self, task_id: Uuid, depends_on: Uuid) -> AgentorResult<bool> {
        let mut deps = self.dependencies.write().await;
        let before = deps.len();
        deps.retain(|d| !(d.task_id == task_id && d.depends_on_task_id == depends_on));
        Ok(deps.len() != before)
    }

    async fn create_message(&self, message: &TeamMessage) -> AgentorResult<()> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }

    async fn list_messages(&self, query: &MessageQuery) -> AgentorResult<Vec<TeamMessage>> {
        let messages = self.messages.read().await;
        let matching = messages
            .iter()
            .filter(|m| query.matches(m))
            .skip(query.offset)
            .cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn create_session(&self, session: &ExecutionSession) -> AgentorResult<()> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone())
    }

    async fn get_session(&self, id: Uuid) -> AgentorResult<Option<ExecutionSession>> {
        Ok(self.sessions.read().await.get(id))
    }

    async fn update_session(
        &self,
        id: Uuid,
        patch: SessionPatch,
    ) -> AgentorResult<ExecutionSession> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| AgentorError::not_found(Entity::Session, id))?;
        patch.apply(session);
        Ok(session.clone())
    }

    async fn list_sessions(&self, team_id: Uuid) -> AgentorResult<Vec<ExecutionSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .filtered(|s| s.team_id == team_id))
    }

    async fn list_task_sessions(&self, task_id: Uuid) -> AgentorResult<Vec<ExecutionSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .filtered(|s| s.task_id == task_id))
    }
}
