use crate::allocation::{Allocation, AllocationPolicies};
use crate::broker::{MessageBroker, Subscription};
use crate::config::TeamsConfig;
use crate::coordinator::TeamCoordinator;
use crate::dependency::{critical_path, detect_cycles, topological_sort};
use crate::events::{EventBus, TeamEvent};
use crate::provider::{ProviderRegistry, ProviderRouter, StaticRouter};
use crate::retry::SleepFn;
use crate::runtime::{ExecutionOutcome, TaskExecutionRuntime, TeamExecutionSummary};
use crate::session::SessionManager;
use crate::store::{InMemoryTeamsDatabase, TeamsDatabase};
use crate::task_manager::TaskManager;
use crate::types::{
    CostAnalysis, DependencyType, ExecutionSession, MessageQuery, NewMessage, NewTask, NewTeam,
    NewTeammate, Task, TaskDependency, Team, TeamMessage, TeamStats, Teammate,
};
use agentor_core::AgentorResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Dependency-graph diagnostics for a team.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamValidation {
    /// Topological order, `None` when the graph has a cycle.
    pub order: Option<Vec<Uuid>>,
    pub cycles: Vec<Vec<Uuid>>,
    /// Empty when the graph has a cycle.
    pub critical_path: Vec<Uuid>,
}

impl TeamValidation {
    pub fn is_valid(&self) -> bool {
        self.cycles.is_empty() && self.order.is_some()
    }
}

/// Top-level entry point that wires the store, broker, managers and runtime together.
///
/// Structural problems come back as `AgentorError`; execution problems come back inside
/// [`ExecutionOutcome`].
pub struct TeamOrchestrator {
    db: Arc<dyn TeamsDatabase>,
    events: EventBus,
    broker: Arc<MessageBroker>,
    sessions: Arc<SessionManager>,
    tasks: Arc<TaskManager>,
    coordinator: Arc<TeamCoordinator>,
    runtime: TaskExecutionRuntime,
}

impl TeamOrchestrator {
    pub fn new(
        config: &TeamsConfig,
        db: Arc<dyn TeamsDatabase>,
        router: Arc<dyn ProviderRouter>,
        providers: ProviderRegistry,
    ) -> Self {
        let events = EventBus::new(config.event_capacity);
        let broker = Arc::new(MessageBroker::new(
            Arc::clone(&db),
            events.clone(),
            config.message_page_size,
        ));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&db), events.clone()));
        let tasks = Arc::new(TaskManager::new(
            Arc::clone(&db),
            router,
            AllocationPolicies::new(),
            events.clone(),
        ));
        let coordinator = Arc::new(TeamCoordinator::new(
            Arc::clone(&db),
            Arc::clone(&tasks),
            Arc::clone(&broker),
            events.clone(),
        ));
        let runtime = TaskExecutionRuntime::new(
            Arc::clone(&db),
            Arc::clone(&tasks),
            Arc::clone(&coordinator),
            Arc::clone(&sessions),
            Arc::clone(&broker),
            providers,
            config.retry.clone(),
        );
        Self {
            db,
            events,
            broker,
            sessions,
            tasks,
            coordinator,
            runtime,
        }
    }

    /// In-memory store with a [`StaticRouter`] built from `config.routes`.
    pub fn in_memory(config: &TeamsConfig, providers: ProviderRegistry) -> Self {
        Self::new(
            config,
            Arc::new(InMemoryTeamsDatabase::new()),
            Arc::new(StaticRouter::from_config(&config.routes)),
            providers,
        )
    }

    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.runtime = self.runtime.with_sleep(sleep);
        self
    }

    pub fn database(&self) -> &Arc<dyn TeamsDatabase> {
        &self.db
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TeamEvent> {
        self.events.subscribe()
    }

    // --- Teams ---

    pub async fn create_team(&self, params: NewTeam) -> AgentorResult<Team> {
        self.coordinator.create_team(params).await
    }

    pub async fn get_team(&self, team_id: Uuid) -> AgentorResult<Team> {
        self.coordinator.get_team(team_id).await
    }

    pub async fn add_teammate(&self, params: NewTeammate) -> AgentorResult<Teammate> {
        self.coordinator.add_teammate(params).await
    }

    pub async fn list_teammates(&self, team_id: Uuid) -> AgentorResult<Vec<Teammate>> {
        self.db.list_teammates(team_id).await
    }

    pub async fn recover_teammate(&self, teammate_id: Uuid) -> AgentorResult<Teammate> {
        self.coordinator.recover_teammate(teammate_id).await
    }

    pub async fn start_team(&self, team_id: Uuid) -> AgentorResult<Team> {
        self.coordinator.start_team(team_id).await
    }

    pub async fn pause_team(&self, team_id: Uuid) -> AgentorResult<Team> {
        self.coordinator.pause_team(team_id).await
    }

    pub async fn complete_team(&self, team_id: Uuid) -> AgentorResult<Team> {
        self.coordinator.complete_team(team_id).await
    }

    pub async fn schedule_next_task(&self, team_id: Uuid) -> AgentorResult<Option<Allocation>> {
        self.coordinator.schedule_next_task(team_id).await
    }

    // --- Tasks ---

    pub async fn create_task(&self, params: NewTask) -> AgentorResult<Task> {
        self.tasks.create_task(params).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> AgentorResult<Task> {
        self.tasks.get_task(task_id).await
    }

    pub async fn list_tasks(&self, team_id: Uuid) -> AgentorResult<Vec<Task>> {
        self.db.list_tasks(team_id).await
    }

    pub async fn add_dependency(
        &self,
        task_id: Uuid,
        depends_on: Uuid,
        dependency_type: DependencyType,
    ) -> AgentorResult<TaskDependency> {
        self.tasks
            .add_dependency(task_id, depends_on, dependency_type)
            .await
    }

    pub async fn assign_task(&self, task_id: Uuid, teammate_id: Uuid) -> AgentorResult<Task> {
        self.tasks.assign_task(task_id, teammate_id).await
    }

    pub async fn start_task(&self, task_id: Uuid) -> AgentorResult<Task> {
        self.tasks.start_task(task_id).await
    }

    /// Completes through the coordinator so dependents get scheduled.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> AgentorResult<Task> {
        self.coordinator.handle_task_completion(task_id, result).await
    }

    pub async fn fail_task(&self, task_id: Uuid, error: impl Into<String>) -> AgentorResult<Task> {
        self.coordinator.handle_task_failure(task_id, error).await
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> AgentorResult<Task> {
        self.tasks.cancel_task(task_id).await
    }

    // --- Messages ---

    pub async fn send_message(&self, message: NewMessage) -> AgentorResult<TeamMessage> {
        self.broker.send_message(message).await
    }

    pub async fn get_messages(&self, query: &MessageQuery) -> AgentorResult<Vec<TeamMessage>> {
        self.broker.get_messages(query).await
    }

    pub fn subscribe_to_messages<F>(&self, team_id: Uuid, callback: F) -> Subscription
    where
        F: Fn(&TeamMessage) + Send + Sync + 'static,
    {
        self.broker.subscribe_to_messages(team_id, callback)
    }

    pub fn subscribe_to_teammate_messages<F>(&self, teammate_id: Uuid, callback: F) -> Subscription
    where
        F: Fn(&TeamMessage) + Send + Sync + 'static,
    {
        self.broker.subscribe_to_teammate_messages(teammate_id, callback)
    }

    // --- Execution ---

    pub async fn run_task(&self, task_id: Uuid) -> ExecutionOutcome {
        self.runtime.execute_task(task_id).await
    }

    pub async fn run_team(&self, team_id: Uuid) -> AgentorResult<TeamExecutionSummary> {
        self.runtime.execute_team(team_id).await
    }

    pub async fn drive_team(&self, team_id: Uuid) -> AgentorResult<TeamExecutionSummary> {
        self.runtime.drive_team(team_id).await
    }

    pub async fn get_active_sessions(&self, team_id: Uuid) -> AgentorResult<Vec<ExecutionSession>> {
        self.sessions.get_active_sessions(team_id).await
    }

    pub async fn list_task_sessions(&self, task_id: Uuid) -> AgentorResult<Vec<ExecutionSession>> {
        self.sessions.list_task_sessions(task_id).await
    }

    // --- Reports ---

    pub async fn get_team_stats(&self, team_id: Uuid) -> AgentorResult<TeamStats> {
        self.db.get_team_stats(team_id).await
    }

    pub async fn get_cost_analysis(&self, team_id: Uuid) -> AgentorResult<CostAnalysis> {
        self.db.get_cost_analysis(team_id).await
    }

    pub async fn get_critical_path(&self, team_id: Uuid) -> AgentorResult<Vec<Uuid>> {
        self.tasks.resolver().get_critical_path(team_id).await
    }

    pub async fn validate_team(&self, team_id: Uuid) -> AgentorResult<TeamValidation> {
        self.coordinator.get_team(team_id).await?;
        let graph = self.tasks.resolver().build_dag(team_id).await?;
        let cycles = detect_cycles(&graph).unwrap_or_default();
        let order = topological_sort(&graph).ok();
        let critical_path = if order.is_some() {
            critical_path(&graph)?
        } else {
            Vec::new()
        };
        Ok(TeamValidation {
            order,
            cycles,
            critical_path,
        })
    }
}
