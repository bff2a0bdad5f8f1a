use crate::broker::MessageBroker;
use crate::config::RetryConfig;
use crate::coordinator::TeamCoordinator;
use crate::prompt::build_task_prompt;
use crate::provider::{ProviderRegistry, ProviderRequest};
use crate::retry::{tokio_sleep, RetryPolicy, SleepFn};
use crate::session::{SessionManager, SessionStart};
use crate::store::TeamsDatabase;
use crate::task_manager::TaskManager;
use crate::types::{MessageType, NewMessage, Task, TaskStatus, TokenUsage};
use agentor_core::{AgentorError, AgentorResult, ErrorKind};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one `execute_task` call. Failures are reported here, never raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub task_id: Uuid,
    pub success: bool,
    /// Attempts actually made; 0 when the call was refused up front.
    pub attempts: u32,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Usage summed over every attempt of this call.
    pub usage: TokenUsage,
}

impl ExecutionOutcome {
    fn refused(task_id: Uuid, error: &AgentorError) -> Self {
        Self {
            task_id,
            success: false,
            attempts: 0,
            provider: None,
            model: None,
            result: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            usage: TokenUsage::default(),
        }
    }

    pub fn is_refused(&self) -> bool {
        self.attempts == 0 && !self.success
    }

    fn stop_with(&mut self, error: &AgentorError) {
        self.error = Some(error.to_string());
        self.error_kind = Some(error.kind());
    }
}

/// Aggregate counts for one `execute_team` sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamExecutionSummary {
    pub scheduled: usize,
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for TeamExecutionSummary {
    fn add_assign(&mut self, other: Self) {
        self.scheduled += other.scheduled;
        self.started += other.started;
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

/// Removes a task from the running set when dropped.
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<Uuid>>,
    task_id: Uuid,
}

impl<'a> RunningGuard<'a> {
    fn acquire(running: &'a Mutex<HashSet<Uuid>>, task_id: Uuid) -> Option<Self> {
        running
            .lock()
            .insert(task_id)
            .then_some(Self { running, task_id })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.task_id);
    }
}

/// Runs tasks against providers with health checks, bounded retry, exponential backoff
/// and failover.
pub struct TaskExecutionRuntime {
    db: Arc<dyn TeamsDatabase>,
    tasks: Arc<TaskManager>,
    coordinator: Arc<TeamCoordinator>,
    sessions: Arc<SessionManager>,
    broker: Arc<MessageBroker>,
    providers: ProviderRegistry,
    retry: RetryConfig,
    sleep: SleepFn,
    running: Mutex<HashSet<Uuid>>,
}

impl TaskExecutionRuntime {
    pub fn new(
        db: Arc<dyn TeamsDatabase>,
        tasks: Arc<TaskManager>,
        coordinator: Arc<TeamCoordinator>,
        sessions: Arc<SessionManager>,
        broker: Arc<MessageBroker>,
        providers: ProviderRegistry,
        retry: RetryConfig,
    ) -> Self {
        Self {
            db,
            tasks,
            coordinator,
            sessions,
            broker,
            providers,
            retry,
            sleep: tokio_sleep(),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the backoff sleep.
    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.running.lock().contains(&task_id)
    }

    /// Schedule ready tasks, then run every `in_progress` task not already running,
    /// concurrently, and wait for all of them.
    pub async fn execute_team(&self, team_id: Uuid) -> AgentorResult<TeamExecutionSummary> {
        let scheduled = self.coordinator.schedule_all_ready_tasks(team_id).await?;
        let runnable: Vec<Uuid> = self
            .db
            .list_tasks(team_id)
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::InProgress && !self.is_running(t.id))
            .map(|t| t.id)
            .collect();

        let outcomes = join_all(runnable.iter().map(|id| self.execute_task(*id))).await;
        let mut summary = TeamExecutionSummary {
            scheduled,
            started: runnable.len(),
            ..TeamExecutionSummary::default()
        };
        for outcome in &outcomes {
            if outcome.success {
                summary.completed += 1;
            } else if !outcome.is_refused() {
                summary.failed += 1;
            }
        }
        info!(
            team_id = %team_id,
            scheduled = summary.scheduled,
            started = summary.started,
            completed = summary.completed,
            failed = summary.failed,
            "Team sweep finished"
        );
        Ok(summary)
    }

    /// Sweep until a pass starts nothing or finishes nothing.
    pub async fn drive_team(&self, team_id: Uuid) -> AgentorResult<TeamExecutionSummary> {
        let mut total = TeamExecutionSummary::default();
        loop {
            let sweep = self.execute_team(team_id).await?;
            total += sweep;
            if sweep.started == 0 || sweep.completed + sweep.failed == 0 {
                return Ok(total);
            }
        }
    }

    /// Run one task to a terminal outcome.
    ///
    /// Refused without side effects when the task is already executing or does not exist.
    pub async fn execute_task(&self, task_id: Uuid) -> ExecutionOutcome {
        let Some(_guard) = RunningGuard::acquire(&self.running, task_id) else {
            debug!(task_id = %task_id, "Execution refused, already running");
            return ExecutionOutcome::refused(task_id, &AgentorError::AlreadyExecuting(task_id));
        };

        match self.prepare_and_run(task_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Execution aborted");
                ExecutionOutcome::refused(task_id, &e)
            }
        }
    }

    async fn prepare_and_run(&self, task_id: Uuid) -> AgentorResult<ExecutionOutcome> {
        let task = self.tasks.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(AgentorError::InvalidState(format!(
                "task {task_id} is already {}",
                task.status
            )));
        }

        if task.assigned_to.is_none() {
            let team = self.coordinator.get_team(task.team_id).await?;
            let next_in_line = self
                .tasks
                .peek_next_task(team.id, team.allocation_strategy)
                .await?
                .is_some_and(|a| a.task_id == task_id);
            if !next_in_line {
                return Err(AgentorError::Unassigned(task_id));
            }
            match self
                .tasks
                .get_next_task(team.id, team.allocation_strategy)
                .await?
            {
                Some(allocation) if allocation.task_id == task_id => {
                    self.tasks
                        .assign_task(allocation.task_id, allocation.teammate_id)
                        .await?;
                }
                _ => return Err(AgentorError::Unassigned(task_id)),
            }
        }

        if self.tasks.get_task(task_id).await?.status == TaskStatus::Pending {
            self.tasks.start_task(task_id).await?;
        }
        self.run_with_retry(task_id).await
    }

    /// The retry/failover loop. Provider failures are retried; anything structural ends
    /// the run and is reported in the outcome.
    pub async fn run_with_retry(&self, task_id: Uuid) -> AgentorResult<ExecutionOutcome> {
        let task = self.tasks.get_task(task_id).await?;
        let policy = RetryPolicy::from_metadata(&task.metadata, &self.retry);
        let max = policy.max_retries;

        let mut outcome = ExecutionOutcome {
            task_id,
            success: false,
            attempts: 0,
            provider: task.provider.clone(),
            model: task.model.clone(),
            result: None,
            error: None,
            error_kind: None,
            usage: TokenUsage::default(),
        };
        let mut last_error = AgentorError::ProviderExecution {
            provider: task.provider.clone().unwrap_or_default(),
            message: "no attempt was made".into(),
        };

        for attempt in 1..=max {
            let mut open_session = None;
            match self
                .attempt(task_id, attempt, &policy, &mut outcome, &mut open_session)
                .await
            {
                Ok(AttemptEnd::Finished) => return Ok(outcome),
                Ok(AttemptEnd::Failed(error)) => last_error = error,
                Err(e) => return Ok(self.abandon(task_id, open_session, e, outcome).await),
            }
        }

        let message = last_error.to_string();
        if let Err(e) = self
            .coordinator
            .handle_task_failure(task_id, message.clone())
            .await
        {
            warn!(task_id = %task_id, error = %e, "Could not record task failure");
        }
        warn!(task_id = %task_id, attempts = max, error = %message, "Retries exhausted");
        outcome.error = Some(message);
        outcome.error_kind = Some(last_error.kind());
        Ok(outcome)
    }

    /// One attempt, including the failover and backoff that follow a failure.
    ///
    /// `open_session` holds the session id while that session is still running, so the
    /// caller can close it if this returns early with an error.
    async fn attempt(
        &self,
        task_id: Uuid,
        attempt: u32,
        policy: &RetryPolicy,
        outcome: &mut ExecutionOutcome,
        open_session: &mut Option<Uuid>,
    ) -> AgentorResult<AttemptEnd> {
        let max = policy.max_retries;
        let task = self.tasks.get_task(task_id).await?;
        if let Some(stop) = interrupted(&task) {
            info!(task_id = %task_id, attempt, reason = %stop, "Execution stopped");
            outcome.stop_with(&stop);
            return Ok(AttemptEnd::Finished);
        }
        let Some(teammate_id) = task.assigned_to else {
            let stop = AgentorError::Unassigned(task_id);
            info!(task_id = %task_id, attempt, "Assignee released, execution stopped");
            outcome.stop_with(&stop);
            return Ok(AttemptEnd::Finished);
        };
        let provider = task.provider.clone().unwrap_or_default();
        let model = task.model.clone().unwrap_or_default();
        outcome.attempts = attempt;
        outcome.provider = Some(provider.clone());
        outcome.model = Some(model.clone());

        let session = self
            .sessions
            .create_session(SessionStart {
                team_id: task.team_id,
                teammate_id,
                task_id,
                provider: provider.clone(),
                model: model.clone(),
                attempt,
            })
            .await?;
        *open_session = Some(session.id);
        self.notify(
            NewMessage::new(task.team_id, MessageType::TaskStarted, "task_started")
                .from_teammate(Some(teammate_id))
                .for_task(task_id)
                .with_content(format!("attempt {attempt}/{max} on {provider}/{model}")),
        )
        .await;
        info!(task_id = %task_id, attempt, max, provider = %provider, model = %model, "Attempt started");

        let client = self.providers.get(&provider);
        let healthy = match &client {
            Some(client) => client.health_check().await,
            None => false,
        };

        let error = match client.filter(|_| healthy) {
            None => {
                let error = AgentorError::ProviderUnhealthy(provider.clone());
                self.sessions
                    .fail_session(session.id, error.to_string(), None)
                    .await?;
                *open_session = None;
                self.notify(
                    NewMessage::new(task.team_id, MessageType::StatusUpdate, "provider_unhealthy")
                        .for_task(task_id)
                        .with_content(error.to_string()),
                )
                .await;
                warn!(task_id = %task_id, attempt, provider = %provider, "Provider failed health check");
                error
            }
            Some(client) => {
                let request = ProviderRequest {
                    prompt: build_task_prompt(&task),
                    model: model.clone(),
                    metadata: task.metadata.clone(),
                };
                let response = client.run(request).await;

                let current = self.tasks.get_task(task_id).await?;
                if let Some(stop) = interrupted(&current) {
                    self.sessions.cancel_session(session.id).await?;
                    *open_session = None;
                    info!(task_id = %task_id, attempt, reason = %stop, "Result discarded, task stopped during attempt");
                    outcome.stop_with(&stop);
                    return Ok(AttemptEnd::Finished);
                }

                let (usage, failure) = match response {
                    Ok(response) => match response.failure() {
                        None => {
                            let usage = response.usage();
                            let result = response.result_value();
                            self.sessions
                                .complete_session(session.id, usage, Some(result.clone()))
                                .await?;
                            *open_session = None;
                            self.tasks.record_attempt(task_id, usage).await?;
                            outcome.usage = add_usage(outcome.usage, usage);
                            self.coordinator
                                .handle_task_completion(task_id, Some(result.clone()))
                                .await?;
                            info!(task_id = %task_id, attempt, provider = %provider, "Task succeeded");
                            outcome.success = true;
                            outcome.result = Some(result);
                            return Ok(AttemptEnd::Finished);
                        }
                        Some(message) => (
                            Some(response.usage()),
                            AgentorError::ProviderExecution {
                                provider: provider.clone(),
                                message,
                            },
                        ),
                    },
                    Err(e) if e.is_recoverable() => (None, e),
                    Err(e) => (
                        None,
                        AgentorError::ProviderExecution {
                            provider: provider.clone(),
                            message: e.to_string(),
                        },
                    ),
                };

                self.sessions
                    .fail_session(session.id, failure.to_string(), usage)
                    .await?;
                *open_session = None;
                if let Some(usage) = usage {
                    self.tasks.record_attempt(task_id, usage).await?;
                    outcome.usage = add_usage(outcome.usage, usage);
                }
                self.notify(
                    NewMessage::new(task.team_id, MessageType::Error, "attempt_failed")
                        .from_teammate(Some(teammate_id))
                        .for_task(task_id)
                        .with_content(failure.to_string())
                        .with_metadata(serde_json::json!({ "attempt": attempt, "max": max })),
                )
                .await;
                warn!(task_id = %task_id, attempt, max, provider = %provider, error = %failure, "Attempt failed");
                failure
            }
        };

        if attempt < max {
            let annotated = format!("attempt {attempt}/{max} failed: {error}");
            match self.tasks.router().failover(&task, &provider) {
                Some(next) => {
                    self.tasks.switch_provider(task_id, &next, annotated).await?;
                    self.notify(
                        NewMessage::new(task.team_id, MessageType::StatusUpdate, "provider_switched")
                            .for_task(task_id)
                            .with_content(format!(
                                "switching from {provider}/{model} to {}/{}",
                                next.provider, next.model
                            )),
                    )
                    .await;
                    info!(task_id = %task_id, from = %provider, to = %next.provider, "Failing over");
                }
                None => {
                    self.tasks.note_error(task_id, annotated).await?;
                    debug!(task_id = %task_id, provider = %provider, "No failover target, retrying same provider");
                }
            }
            let delay = policy.backoff_for(attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            debug!(task_id = %task_id, attempt, delay_ms, "Backing off");
            (self.sleep)(delay).await;
        }
        Ok(AttemptEnd::Failed(error))
    }

    /// End a run that hit a structural error: close the open session and fail the task
    /// so neither the task nor its teammate stays busy.
    async fn abandon(
        &self,
        task_id: Uuid,
        open_session: Option<Uuid>,
        error: AgentorError,
        mut outcome: ExecutionOutcome,
    ) -> ExecutionOutcome {
        warn!(task_id = %task_id, error = %error, "Execution aborted");
        let message = error.to_string();
        if let Some(session_id) = open_session {
            if let Err(e) = self
                .sessions
                .fail_session(session_id, message.clone(), None)
                .await
            {
                warn!(session_id = %session_id, error = %e, "Could not close session");
            }
        }
        if let Err(e) = self.coordinator.handle_task_failure(task_id, message).await {
            warn!(task_id = %task_id, error = %e, "Could not record task failure");
        }
        outcome.success = false;
        outcome.result = None;
        outcome.stop_with(&error);
        outcome
    }

    /// Deliver a notification. Delivery problems never change the run's result.
    async fn notify(&self, message: NewMessage) {
        let kind = message.message_type;
        if let Err(e) = self.broker.send_message(message).await {
            warn!(message_type = ?kind, error = %e, "Notification not delivered");
        }
    }
}

enum AttemptEnd {
    /// The outcome is final: succeeded, stopped, or released.
    Finished,
    /// The provider failed; another attempt may follow.
    Failed(AgentorError),
}

/// Why a run must stop, if it must.
fn interrupted(task: &Task) -> Option<AgentorError> {
    match task.status {
        TaskStatus::Cancelled => Some(AgentorError::Cancelled(task.id)),
        TaskStatus::Completed | TaskStatus::Failed => Some(AgentorError::InvalidState(format!(
            "task {} finished elsewhere as {}",
            task.id, task.status
        ))),
        TaskStatus::Pending | TaskStatus::InProgress => None,
    }
}

fn add_usage(a: TokenUsage, b: TokenUsage) -> TokenUsage {
    TokenUsage {
        input_tokens: a.input_tokens + b.input_tokens,
        output_tokens: a.output_tokens + b.output_tokens,
        cost_usd: a.cost_usd + b.cost_usd,
    }
}
