#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for agentor-teams.
//!
//! Drives the engine through the public `TeamOrchestrator` surface: dependency ordering,
//! readiness, scheduling, retry with failover, exhaustion, idempotent completion,
//! skill-based allocation and concurrent execution guards.

use agentor_core::{AgentorError, AgentorResult, ErrorKind};
use agentor_teams::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Provider that replays scripted responses, then succeeds.
struct ScriptedProvider {
    name: String,
    script: tokio::sync::Mutex<Vec<AgentorResult<ProviderResponse>>>,
    call_count: AtomicU32,
    delay: Duration,
}

impl ScriptedProvider {
    fn new(name: &str, script: Vec<AgentorResult<ProviderResponse>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            script: tokio::sync::Mutex::new(script),
            call_count: AtomicU32::new(0),
            delay: Duration::ZERO,
        })
    }

    fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            script: tokio::sync::Mutex::new(Vec::new()),
            call_count: AtomicU32::new(0),
            delay,
        })
    }

    fn calls(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn run(&self, request: ProviderRequest) -> AgentorResult<ProviderResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut script = self.script.lock().await;
        if script.is_empty() {
            let tokens = request.prompt.len() as u64 / 4;
            Ok(ProviderResponse::ok(format!("{} done", self.name)).with_usage(tokens, 8, 0.001))
        } else {
            script.remove(0)
        }
    }
}

fn config() -> TeamsConfig {
    TeamsConfig::from_toml(
        r#"
        [[routes]]
        provider = "claude"
        model = "sonnet"

        [[routes]]
        provider = "openai"
        model = "gpt-4o"
        "#,
    )
    .unwrap()
}

fn no_sleep() -> (SleepFn, Arc<Mutex<Vec<Duration>>>) {
    let delays = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&delays);
    let sleep: SleepFn = Arc::new(move |d| {
        recorded.lock().push(d);
        Box::pin(async {}) as Pin<Box<dyn Future<Output = ()> + Send>>
    });
    (sleep, delays)
}

fn orchestrator(clients: Vec<Arc<ScriptedProvider>>) -> (TeamOrchestrator, Arc<Mutex<Vec<Duration>>>) {
    let mut providers = ProviderRegistry::new();
    for client in clients {
        providers.register(client);
    }
    let (sleep, delays) = no_sleep();
    (
        TeamOrchestrator::in_memory(&config(), providers).with_sleep(sleep),
        delays,
    )
}

/// Deterministic pseudo-random DAG: node `i` depends on a subset of nodes `< i`.
fn random_dag(seed: u64, size: usize) -> (TaskGraph, Vec<Uuid>) {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        state >> 33
    };
    let ids: Vec<Uuid> = (0..size).map(|_| Uuid::new_v4()).collect();
    let mut graph = TaskGraph::new();
    for i in 0..size {
        let deps: Vec<Uuid> = (0..i).filter(|_| next() % 4 == 0).map(|j| ids[j]).collect();
        graph.add_node(ids[i], deps);
    }
    (graph, ids)
}

// ---------------------------------------------------------------------------
// 1. Dependency graph
// ---------------------------------------------------------------------------

#[test]
fn topological_sort_orders_every_random_dag() {
    for seed in 1..40u64 {
        let (graph, ids) = random_dag(seed, 25);
        let order = topological_sort(&graph).unwrap();
        assert_eq!(order.len(), ids.len());

        let position: HashMap<Uuid, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        for id in &ids {
            for dep in graph.dependencies(*id) {
                assert!(position[&dep] < position[id], "seed {seed}: dependency after dependent");
            }
        }
        assert!(detect_cycles(&graph).is_none());
    }
}

#[test]
fn cycles_are_reported_by_sort_and_detection() {
    for seed in 1..20u64 {
        let (mut graph, ids) = random_dag(seed, 12);
        // Chain 3 -> 7 -> 10 and close it with 3 depending on 10.
        graph.add_edge(ids[7], ids[3]);
        graph.add_edge(ids[10], ids[7]);
        graph.add_edge(ids[3], ids[10]);

        assert!(matches!(
            topological_sort(&graph),
            Err(AgentorError::CircularDependency(_))
        ));
        let cycles = detect_cycles(&graph).unwrap();
        // Every cycle has to use the back edge from 3 to 10.
        assert!(!cycles.is_empty());
        for cycle in &cycles {
            assert!(cycle.contains(&ids[3]) && cycle.contains(&ids[10]), "seed {seed}: {cycle:?}");
        }
    }
}

#[tokio::test]
async fn ready_tasks_never_have_incomplete_dependencies() {
    let (orch, _) = orchestrator(vec![]);
    let team = orch.create_team(NewTeam::new("ready")).await.unwrap();
    let a = orch.create_task(NewTask::new(team.id, "a")).await.unwrap();
    let b = orch.create_task(NewTask::new(team.id, "b")).await.unwrap();
    let c = orch
        .create_task(NewTask::new(team.id, "c").with_dependencies(vec![a.id, b.id]))
        .await
        .unwrap();
    let d = orch
        .create_task(NewTask::new(team.id, "d").with_dependencies(vec![c.id]))
        .await
        .unwrap();

    let db = orch.database();
    let ready_ids = |tasks: Vec<Task>| tasks.into_iter().map(|t| t.id).collect::<Vec<_>>();
    assert_eq!(ready_ids(db.get_ready_tasks(team.id).await.unwrap()), vec![a.id, b.id]);

    db.update_task(a.id, TaskPatch::status(TaskStatus::Completed)).await.unwrap();
    assert_eq!(ready_ids(db.get_ready_tasks(team.id).await.unwrap()), vec![b.id]);

    db.update_task(b.id, TaskPatch::status(TaskStatus::Completed)).await.unwrap();
    assert_eq!(ready_ids(db.get_ready_tasks(team.id).await.unwrap()), vec![c.id]);

    for task in db.get_ready_tasks(team.id).await.unwrap() {
        for dep in &task.blocked_by {
            assert_eq!(db.get_task(*dep).await.unwrap().unwrap().status, TaskStatus::Completed);
        }
    }
    assert!(!orch.get_task(d.id).await.unwrap().blocked_by.is_empty());
}

// ---------------------------------------------------------------------------
// 2. Scheduling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_idle_teammate_takes_one_task() {
    let (orch, _) = orchestrator(vec![]);
    let team = orch.create_team(NewTeam::new("solo")).await.unwrap();
    let mate = orch
        .add_teammate(NewTeammate::new(team.id, "ada", "claude", "sonnet"))
        .await
        .unwrap();
    let task = orch.create_task(NewTask::new(team.id, "only")).await.unwrap();

    orch.start_team(team.id).await.unwrap();
    assert_eq!(orch.get_task(task.id).await.unwrap().assigned_to, Some(mate.id));
    let mates = orch.list_teammates(team.id).await.unwrap();
    assert_eq!(mates[0].status, TeammateStatus::Busy);
    assert!(orch.schedule_next_task(team.id).await.unwrap().is_none());

    let second = orch.create_task(NewTask::new(team.id, "later")).await.unwrap();
    assert!(orch.schedule_next_task(team.id).await.unwrap().is_none());
    assert!(orch.get_task(second.id).await.unwrap().assigned_to.is_none());
}

#[tokio::test]
async fn skill_based_team_routes_tasks_by_skill() {
    let (orch, _) = orchestrator(vec![]);
    let team = orch
        .create_team(NewTeam::new("skills").with_strategy(AllocationStrategy::SkillBased))
        .await
        .unwrap();
    orch.add_teammate(
        NewTeammate::new(team.id, "mathematician", "claude", "sonnet").with_skills(["math"]),
    )
    .await
    .unwrap();
    let polyglot = orch
        .add_teammate(
            NewTeammate::new(team.id, "polyglot", "claude", "sonnet")
                .with_skills(["code", "chinese"]),
        )
        .await
        .unwrap();
    let task = orch
        .create_task(
            NewTask::new(team.id, "translate code comments")
                .with_metadata(serde_json::json!({ "skills": ["Code", "Chinese"] })),
        )
        .await
        .unwrap();

    orch.start_team(team.id).await.unwrap();
    assert_eq!(orch.get_task(task.id).await.unwrap().assigned_to, Some(polyglot.id));

    let skills = vec!["code".to_string(), "chinese".to_string()];
    assert!((skill_score(&["code".into()], &skills) - 1.0).abs() < f64::EPSILON);
    assert!((skill_score(&["code".into(), "math".into()], &skills) - 0.5).abs() < f64::EPSILON);
}

// ---------------------------------------------------------------------------
// 3. Execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fail_twice_then_succeed_creates_three_sessions() {
    // claude fails, failover to openai errors, failover back to claude succeeds.
    let claude = ScriptedProvider::new(
        "claude",
        vec![
            Ok(ProviderResponse::failed("overloaded").with_usage(5, 0, 0.0005)),
            Ok(ProviderResponse::ok("translated").with_usage(40, 20, 0.004)),
        ],
    );
    let openai = ScriptedProvider::new(
        "openai",
        vec![Err(AgentorError::ProviderExecution {
            provider: "openai".into(),
            message: "timeout".into(),
        })],
    );
    let (orch, delays) = orchestrator(vec![claude.clone(), openai.clone()]);
    let team = orch.create_team(NewTeam::new("retry")).await.unwrap();
    orch.add_teammate(NewTeammate::new(team.id, "ada", "claude", "sonnet"))
        .await
        .unwrap();
    let task = orch
        .create_task(
            NewTask::new(team.id, "translate")
                .with_metadata(serde_json::json!({ "max_retries": 3, "retry_backoff_ms": 200 })),
        )
        .await
        .unwrap();

    let outcome = orch.run_task(task.id).await;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.attempts, 3);

    let sessions = orch.list_task_sessions(task.id).await.unwrap();
    assert_eq!(sessions.len(), 3);
    assert_eq!(
        sessions.iter().filter(|s| s.status == SessionStatus::Failed).count(),
        2
    );
    let last = sessions.last().unwrap();
    assert_eq!(last.status, SessionStatus::Completed);

    let task = orch.get_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(last.provider, "claude");
    assert_eq!(task.provider.as_deref(), Some(last.provider.as_str()));
    assert_eq!(outcome.provider.as_deref(), Some(last.provider.as_str()));
    assert_eq!(task.input_tokens, 45);
    assert_eq!(claude.calls() + openai.calls(), 3);
    assert_eq!(
        *delays.lock(),
        vec![Duration::from_millis(200), Duration::from_millis(400)]
    );
    assert!(orch.get_active_sessions(team.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_retries_fail_the_task_once() {
    let failing = |msg: &str| Ok(ProviderResponse::failed(msg));
    let claude = ScriptedProvider::new("claude", vec![failing("a"), failing("b"), failing("c")]);
    let openai = ScriptedProvider::new("openai", vec![failing("d"), failing("e")]);
    let (orch, _) = orchestrator(vec![claude, openai]);
    let team = orch.create_team(NewTeam::new("doomed")).await.unwrap();
    let mate = orch
        .add_teammate(NewTeammate::new(team.id, "ada", "claude", "sonnet"))
        .await
        .unwrap();
    let task = orch
        .create_task(NewTask::new(team.id, "impossible").with_metadata(serde_json::json!({ "max_retries": 4 })))
        .await
        .unwrap();

    let outcome = orch.run_task(task.id).await;
    assert!(!outcome.success);
    assert_eq!(outcome.attempts, 4);
    assert_eq!(outcome.error_kind, Some(ErrorKind::ProviderExecutionFailed));
    assert!(outcome.provider.is_some());

    let task = orch.get_task(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let failures = orch
        .get_messages(&MessageQuery::for_team(team.id).of_type(MessageType::TaskFailed))
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);

    let mate = orch
        .list_teammates(team.id)
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.id == mate.id)
        .unwrap();
    assert_eq!(mate.tasks_failed, 1);
    assert_eq!(orch.get_team(team.id).await.unwrap().failed_tasks, 1);
}

#[tokio::test]
async fn completing_twice_does_not_double_count() {
    let (orch, _) = orchestrator(vec![]);
    let team = orch.create_team(NewTeam::new("idempotent")).await.unwrap();
    let mate = orch
        .add_teammate(NewTeammate::new(team.id, "ada", "claude", "sonnet"))
        .await
        .unwrap();
    let task = orch.create_task(NewTask::new(team.id, "once")).await.unwrap();
    orch.assign_task(task.id, mate.id).await.unwrap();

    orch.complete_task(task.id, None).await.unwrap();
    orch.complete_task(task.id, None).await.unwrap();

    let mates = orch.list_teammates(team.id).await.unwrap();
    assert_eq!(mates[0].tasks_completed, 1);
    assert_eq!(orch.get_team(team.id).await.unwrap().completed_tasks, 1);
}

#[tokio::test]
async fn concurrent_execution_of_one_task_runs_once() {
    let slow = ScriptedProvider::slow("claude", Duration::from_millis(50));
    let (orch, _) = orchestrator(vec![slow.clone()]);
    let team = orch.create_team(NewTeam::new("race")).await.unwrap();
    orch.add_teammate(NewTeammate::new(team.id, "ada", "claude", "sonnet"))
        .await
        .unwrap();
    let task = orch.create_task(NewTask::new(team.id, "contended")).await.unwrap();

    let (a, b) = tokio::join!(orch.run_task(task.id), orch.run_task(task.id));
    let refused = [&a, &b]
        .into_iter()
        .filter(|o| o.error_kind == Some(ErrorKind::AlreadyExecuting))
        .count();
    assert_eq!(refused, 1);
    assert!(a.success || b.success);
    assert!([&a, &b].iter().any(|o| o.attempts == 0));
    assert_eq!(slow.calls(), 1);
}

// ---------------------------------------------------------------------------
// 4. End to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn diamond_plan_runs_to_completion() {
    let (orch, _) = orchestrator(vec![
        ScriptedProvider::new("claude", vec![]),
        ScriptedProvider::new("openai", vec![]),
    ]);
    let team = orch
        .create_team(NewTeam::new("diamond").with_strategy(AllocationStrategy::LoadBalance))
        .await
        .unwrap();
    for name in ["ada", "bob"] {
        orch.add_teammate(NewTeammate::new(team.id, name, "claude", "sonnet"))
            .await
            .unwrap();
    }
    let root = orch.create_task(NewTask::new(team.id, "outline")).await.unwrap();
    let left = orch
        .create_task(NewTask::new(team.id, "draft intro").with_dependencies(vec![root.id]))
        .await
        .unwrap();
    let right = orch
        .create_task(NewTask::new(team.id, "draft body").with_dependencies(vec![root.id]))
        .await
        .unwrap();
    let join = orch
        .create_task(NewTask::new(team.id, "edit").with_dependencies(vec![left.id, right.id]))
        .await
        .unwrap();

    let path = orch.get_critical_path(team.id).await.unwrap();
    assert_eq!(path.len(), 3);
    assert_eq!(path[0], root.id);
    assert_eq!(path[2], join.id);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = orch.subscribe_to_messages(team.id, move |m| {
        sink.lock().push(m.message_type);
    });

    orch.start_team(team.id).await.unwrap();
    let summary = orch.drive_team(team.id).await.unwrap();
    assert_eq!(summary.completed, 4);
    assert_eq!(summary.failed, 0);

    let stats = orch.get_team_stats(team.id).await.unwrap();
    assert_eq!(stats.completed_tasks, 4);
    assert_eq!(stats.idle_teammates, 2);

    let costs = orch.get_cost_analysis(team.id).await.unwrap();
    assert_eq!(costs.by_provider.len(), 1);
    assert_eq!(costs.by_provider[0].sessions, 4);
    assert!((costs.total_cost_usd - 0.004).abs() < 1e-9);

    let done = orch.complete_team(team.id).await.unwrap();
    assert_eq!(done.status, TeamStatus::Completed);

    let seen = seen.lock();
    assert_eq!(seen.first(), Some(&MessageType::System));
    assert_eq!(seen.iter().filter(|t| **t == MessageType::TaskCompleted).count(), 4);
}
