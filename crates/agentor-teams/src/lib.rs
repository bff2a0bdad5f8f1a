//! Agent teams orchestration engine.
//!
//! Coordinates a team of AI-backed teammates working through a graph of interdependent
//! tasks. Ready tasks are paired with idle teammates by an allocation strategy, executed
//! against pluggable providers with health checks, bounded retry, exponential backoff and
//! failover, and every state change is announced on a message broker and an event bus.
//!
//! # Main types
//!
//! - [`TeamOrchestrator`] — Facade wiring every component behind one operation surface.
//! - [`TeamCoordinator`] — Team lifecycle and the greedy scheduling loop.
//! - [`TaskManager`] — Task lifecycle and allocation.
//! - [`TaskExecutionRuntime`] — Retry/failover execution of tasks.
//! - [`DependencyResolver`] — Topological order, cycles, readiness and critical path.
//! - [`MessageBroker`] — Persisted team messages with in-process subscribers.
//! - [`SessionManager`] — One record per execution attempt.
//! - [`TeamsDatabase`] — Persistence contract; [`InMemoryTeamsDatabase`] implements it.

/// Allocation strategies pairing ready tasks with idle teammates.
pub mod allocation;
/// Message persistence and pub/sub delivery.
pub mod broker;
/// Engine configuration loaded from TOML.
pub mod config;
/// Team lifecycle and scheduling.
pub mod coordinator;
/// Dependency graph algorithms.
pub mod dependency;
/// Operation facade.
pub mod engine;
/// Broadcast event stream for UI listeners.
pub mod events;
/// Task prompt template.
pub mod prompt;
/// Provider routing and client contracts.
pub mod provider;
/// Per-task retry policy and injectable sleep.
pub mod retry;
/// Task execution with retry and failover.
pub mod runtime;
/// Execution session bookkeeping.
pub mod session;
/// Persistence contract and in-memory store.
pub mod store;
/// Task lifecycle management.
pub mod task_manager;
/// Data model shared by every component.
pub mod types;

pub use allocation::{
    skill_score, Allocation, AllocationPolicies, AllocationPolicy, LoadBalance, RoundRobin,
    SkillMatch,
};
pub use broker::{MessageBroker, Subscription};
pub use config::{RetryConfig, RouteConfig, TeamsConfig};
pub use coordinator::TeamCoordinator;
pub use dependency::{critical_path, detect_cycles, topological_sort, DependencyResolver, TaskGraph};
pub use engine::{TeamOrchestrator, TeamValidation};
pub use events::{EventBus, TeamEvent};
pub use provider::{
    ProviderClient, ProviderRegistry, ProviderRequest, ProviderResponse, ProviderRouter,
    ProviderSelection, StaticRouter,
};
pub use retry::{tokio_sleep, RetryPolicy, SleepFn};
pub use runtime::{ExecutionOutcome, TaskExecutionRuntime, TeamExecutionSummary};
pub use session::{SessionManager, SessionStart};
pub use store::{
    InMemoryTeamsDatabase, SessionPatch, TaskPatch, TeamPatch, TeammatePatch, TeamsDatabase,
};
pub use task_manager::TaskManager;
pub use types::{
    AllocationStrategy, CostAnalysis, DependencyType, ExecutionSession, MessageQuery,
    MessageType, NewMessage, NewTask, NewTeam, NewTeammate, ProviderCost, SessionStatus, Task,
    TaskDependency, TaskStatus, Team, TeamMessage, TeamStats, TeamStatus, Teammate, TeammateCost,
    TeammateStatus, TokenUsage,
};
