use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a team. `Created` is the state a team sits in before its first start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamStatus {
    Created,
    Active,
    Paused,
    Completed,
    Archived,
}

impl TeamStatus {
    /// Whether the coordinator may move a team from `self` to `next`.
    pub fn can_transition_to(self, next: TeamStatus) -> bool {
        use TeamStatus::*;
        matches!(
            (self, next),
            (Created, Active) | (Paused, Active) | (Active, Active) | (Active, Paused)
                | (Active, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TeamStatus::Completed | TeamStatus::Archived)
    }
}

impl std::fmt::Display for TeamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeamStatus::Created => write!(f, "created"),
            TeamStatus::Active => write!(f, "active"),
            TeamStatus::Paused => write!(f, "paused"),
            TeamStatus::Completed => write!(f, "completed"),
            TeamStatus::Archived => write!(f, "archived"),
        }
    }
}

/// Policy used to pair ready tasks with idle teammates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    #[default]
    RoundRobin,
    LoadBalance,
    SkillBased,
}

impl std::fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationStrategy::RoundRobin => write!(f, "round_robin"),
            AllocationStrategy::LoadBalance => write!(f, "load_balance"),
            AllocationStrategy::SkillBased => write!(f, "skill_based"),
        }
    }
}

/// A team of AI-backed teammates working through a task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: TeamStatus,
    pub max_teammates: u32,
    pub allocation_strategy: AllocationStrategy,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub total_cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Team {
    pub fn new(params: NewTeam) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: params.name,
            description: params.description,
            status: TeamStatus::Created,
            max_teammates: params.max_teammates,
            allocation_strategy: params.allocation_strategy,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            total_cost_usd: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeammateStatus {
    Idle,
    Busy,
    Offline,
    Error,
}

impl std::fmt::Display for TeammateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeammateStatus::Idle => write!(f, "idle"),
            TeammateStatus::Busy => write!(f, "busy"),
            TeammateStatus::Offline => write!(f, "offline"),
            TeammateStatus::Error => write!(f, "error"),
        }
    }
}

/// A worker agent bound to a provider/model, holding at most one task at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Teammate {
    pub id: Uuid,
    pub team_id: Uuid,
    pub name: String,
    pub role: String,
    pub provider: String,
    pub model: String,
    pub status: TeammateStatus,
    pub current_task_id: Option<Uuid>,
    #[serde(default)]
    pub skills: Vec<String>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub avg_task_duration_ms: f64,
    pub created_at: DateTime<Utc>,
}

impl Teammate {
    pub fn new(params: NewTeammate) -> Self {
        Self {
            id: Uuid::new_v4(),
            team_id: params.team_id,
            name: params.name,
            role: params.role,
            provider: params.provider,
            model: params.model,
            status: TeammateStatus::Idle,
            current_task_id: None,
            skills: params.skills,
            tasks_completed: 0,
            tasks_failed: 0,
            total_tokens: 0,
            total_cost_usd: 0.0,
            avg_task_duration_ms: 0.0,
            created_at: Utc::now(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == TeammateStatus::Idle
    }

    /// Number of tasks that reached a terminal outcome on this teammate.
    pub fn finished_tasks(&self) -> u32 {
        self.tasks_completed + self.tasks_failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A unit of work. `blocked_by` lists the tasks that must complete before this one starts;
/// `blocks` is the mirrored edge set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub team_id: Uuid,
    pub subject: String,
    pub description: String,
    pub status: TaskStatus,
    /// Higher values are scheduled first.
    pub priority: i32,
    pub assigned_to: Option<Uuid>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    #[serde(default)]
    pub blocks: Vec<Uuid>,
    #[serde(default)]
    pub blocked_by: Vec<Uuid>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Free-form metadata. Recognised keys: `skills`, `max_retries`, `retry_backoff_ms`.
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(params: NewTask) -> Self {
        Self {
            id: Uuid::new_v4(),
            team_id: params.team_id,
            subject: params.subject,
            description: params.description,
            status: TaskStatus::Pending,
            priority: params.priority,
            assigned_to: None,
            provider: params.provider,
            model: params.model,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            blocks: params.blocks,
            blocked_by: params.blocked_by,
            result: None,
            error: None,
            metadata: params.metadata,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Skills listed under `metadata.skills`, lower-cased.
    pub fn required_skills(&self) -> Vec<String> {
        self.metadata
            .get("skills")
            .and_then(|v| v.as_array())
            .map(|skills| {
                skills
                    .iter()
                    .filter_map(|s| s.as_str())
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    #[default]
    FinishToStart,
    StartToStart,
    FinishToFinish,
}

/// Edge record: `task_id` depends on `depends_on_task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on_task_id: Uuid,
    pub dependency_type: DependencyType,
    pub created_at: DateTime<Utc>,
}

impl TaskDependency {
    pub fn new(task_id: Uuid, depends_on_task_id: Uuid, dependency_type: DependencyType) -> Self {
        Self {
            task_id,
            depends_on_task_id,
            dependency_type,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    Broadcast,
    P2p,
    StatusUpdate,
    Error,
    System,
}

/// An immutable entry of a team's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMessage {
    pub id: Uuid,
    pub team_id: Uuid,
    pub message_type: MessageType,
    pub from_teammate_id: Option<Uuid>,
    pub to_teammate_id: Option<Uuid>,
    pub subject: String,
    pub content: String,
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TeamMessage {
    pub fn new(params: NewMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            team_id: params.team_id,
            message_type: params.message_type,
            from_teammate_id: params.from_teammate_id,
            to_teammate_id: params.to_teammate_id,
            subject: params.subject,
            content: params.content,
            task_id: params.task_id,
            metadata: params.metadata,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One execution attempt of a task on a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSession {
    pub id: Uuid,
    pub team_id: Uuid,
    pub teammate_id: Uuid,
    pub task_id: Uuid,
    pub attempt: u32,
    pub status: SessionStatus,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Token and cost figures reported by a provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cost_usd == 0.0
    }
}

// --- Input records ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTeam {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_max_teammates")]
    pub max_teammates: u32,
    #[serde(default)]
    pub allocation_strategy: AllocationStrategy,
}

fn default_max_teammates() -> u32 {
    5
}

impl NewTeam {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            max_teammates: default_max_teammates(),
            allocation_strategy: AllocationStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.allocation_strategy = strategy;
        self
    }

    pub fn with_max_teammates(mut self, max: u32) -> Self {
        self.max_teammates = max;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTeammate {
    pub team_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub role: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub skills: Vec<String>,
}

impl NewTeammate {
    pub fn new(
        team_id: Uuid,
        name: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            team_id,
            name: name.into(),
            role: String::new(),
            provider: provider.into(),
            model: model.into(),
            skills: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub team_id: Uuid,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub blocks: Vec<Uuid>,
    #[serde(default)]
    pub blocked_by: Vec<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl NewTask {
    pub fn new(team_id: Uuid, subject: impl Into<String>) -> Self {
        Self {
            team_id,
            subject: subject.into(),
            description: String::new(),
            priority: 0,
            provider: None,
            model: None,
            blocks: Vec::new(),
            blocked_by: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        self.blocked_by = deps;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub team_id: Uuid,
    pub message_type: MessageType,
    #[serde(default)]
    pub from_teammate_id: Option<Uuid>,
    #[serde(default)]
    pub to_teammate_id: Option<Uuid>,
    pub subject: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl NewMessage {
    pub fn new(team_id: Uuid, message_type: MessageType, subject: impl Into<String>) -> Self {
        Self {
            team_id,
            message_type,
            from_teammate_id: None,
            to_teammate_id: None,
            subject: subject.into(),
            content: String::new(),
            task_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn from_teammate(mut self, id: Option<Uuid>) -> Self {
        self.from_teammate_id = id;
        self
    }

    pub fn to_teammate(mut self, id: Uuid) -> Self {
        self.to_teammate_id = Some(id);
        self
    }

    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Filter for reading a team's message log. Results are chronological.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQuery {
    pub team_id: Uuid,
    #[serde(default)]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    /// Matches messages sent by or addressed to this teammate.
    #[serde(default)]
    pub teammate_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl MessageQuery {
    pub fn for_team(team_id: Uuid) -> Self {
        Self {
            team_id,
            message_type: None,
            task_id: None,
            teammate_id: None,
            limit: None,
            offset: 0,
        }
    }

    pub fn of_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn for_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn page(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn matches(&self, message: &TeamMessage) -> bool {
        message.team_id == self.team_id
            && self.message_type.map_or(true, |t| message.message_type == t)
            && self.task_id.map_or(true, |id| message.task_id == Some(id))
            && self.teammate_id.map_or(true, |id| {
                message.from_teammate_id == Some(id) || message.to_teammate_id == Some(id)
            })
    }
}

// --- Reports ---

/// Aggregate counters for a team.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamStats {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub in_progress_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    pub total_teammates: usize,
    pub idle_teammates: usize,
    pub busy_teammates: usize,
    pub offline_teammates: usize,
    pub error_teammates: usize,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeammateCost {
    pub teammate_id: Uuid,
    pub name: String,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCost {
    pub provider: String,
    pub model: String,
    pub sessions: usize,
    pub failed_sessions: usize,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Spend broken down by teammate and by provider/model (from execution sessions).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostAnalysis {
    pub team_id: Option<Uuid>,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub by_teammate: Vec<TeammateCost>,
    pub by_provider: Vec<ProviderCost>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_team_creation() {
        let team = Team::new(NewTeam::new("core").with_strategy(AllocationStrategy::SkillBased));
        assert_eq!(team.status, TeamStatus::Created);
        assert_eq!(team.allocation_strategy, AllocationStrategy::SkillBased);
        assert_eq!(team.max_teammates, 5);
        assert!(team.started_at.is_none());
    }

    #[test]
    fn test_team_transitions() {
        assert!(TeamStatus::Created.can_transition_to(TeamStatus::Active));
        assert!(TeamStatus::Active.can_transition_to(TeamStatus::Paused));
        assert!(TeamStatus::Paused.can_transition_to(TeamStatus::Active));
        assert!(TeamStatus::Active.can_transition_to(TeamStatus::Completed));
        assert!(!TeamStatus::Created.can_transition_to(TeamStatus::Completed));
        assert!(!TeamStatus::Paused.can_transition_to(TeamStatus::Completed));
        assert!(!TeamStatus::Completed.can_transition_to(TeamStatus::Active));
    }

    #[test]
    fn test_task_creation() {
        let team_id = Uuid::new_v4();
        let dep = Uuid::new_v4();
        let task = Task::new(NewTask::new(team_id, "Write parser").with_dependencies(vec![dep]));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.blocked_by, vec![dep]);
        assert!(task.assigned_to.is_none());
        assert_eq!(task.total_tokens(), 0);
    }

    #[test]
    fn test_required_skills_are_lowercased() {
        let task = Task::new(
            NewTask::new(Uuid::new_v4(), "Translate")
                .with_metadata(serde_json::json!({ "skills": ["Code", " Chinese ", 3, ""] })),
        );
        assert_eq!(task.required_skills(), vec!["code", "chinese"]);
    }

    #[test]
    fn test_required_skills_missing_metadata() {
        let task = Task::new(NewTask::new(Uuid::new_v4(), "Plain"));
        assert!(task.required_skills().is_empty());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: AllocationStrategy = serde_json::from_str("\"load_balance\"").unwrap();
        assert_eq!(parsed, AllocationStrategy::LoadBalance);
        assert_eq!(MessageType::P2p, serde_json::from_str("\"p2p\"").unwrap());
    }

    #[test]
    fn test_message_query_matches() {
        let team_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let mate = Uuid::new_v4();
        let msg = TeamMessage::new(
            NewMessage::new(team_id, MessageType::TaskAssigned, "assigned")
                .for_task(task_id)
                .to_teammate(mate),
        );

        assert!(MessageQuery::for_team(team_id).matches(&msg));
        assert!(MessageQuery::for_team(team_id).for_task(task_id).matches(&msg));
        assert!(!MessageQuery::for_team(team_id).of_type(MessageType::Error).matches(&msg));
        assert!(!MessageQuery::for_team(Uuid::new_v4()).matches(&msg));

        let mut by_mate = MessageQuery::for_team(team_id);
        by_mate.teammate_id = Some(mate);
        assert!(by_mate.matches(&msg));
    }

    #[test]
    fn test_teammate_finished_tasks() {
        let mut mate = Teammate::new(NewTeammate::new(Uuid::new_v4(), "ada", "claude", "sonnet"));
        assert!(mate.is_idle());
        mate.tasks_completed = 3;
        mate.tasks_failed = 1;
        assert_eq!(mate.finished_tasks(), 4);
    }
}
