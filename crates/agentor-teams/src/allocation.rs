use crate::types::{AllocationStrategy, Task, Teammate, TeammateStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A ready task paired with the teammate chosen to run it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub task_id: Uuid,
    pub teammate_id: Uuid,
    /// Skill match score, only set by skill-based allocation.
    pub score: Option<f64>,
}

/// Picks at most one (task, teammate) pair per call.
///
/// `ready` is already ordered by scheduling preference and `teammates` in creation order.
/// Implementations return `None` when there is no ready task or no idle teammate.
pub trait AllocationPolicy: Send + Sync {
    fn strategy(&self) -> AllocationStrategy;

    fn select_next(&self, team_id: Uuid, ready: &[Task], teammates: &[Teammate])
        -> Option<Allocation>;

    /// What `select_next` would return, without advancing any policy state.
    fn peek_next(&self, team_id: Uuid, ready: &[Task], teammates: &[Teammate])
        -> Option<Allocation> {
        self.select_next(team_id, ready, teammates)
    }
}

/// Rotates a per-team cursor over the idle teammates.
#[derive(Default)]
pub struct RoundRobin {
    cursors: Mutex<HashMap<Uuid, usize>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn pick(
        &self,
        team_id: Uuid,
        ready: &[Task],
        teammates: &[Teammate],
        advance: bool,
    ) -> Option<Allocation> {
        let task = ready.first()?;
        let idle: Vec<&Teammate> = teammates.iter().filter(|m| m.is_idle()).collect();
        if idle.is_empty() {
            return None;
        }

        let mut cursors = self.cursors.lock();
        let cursor = cursors.get(&team_id).copied().unwrap_or(0) % idle.len();
        if advance {
            cursors.insert(team_id, cursor + 1);
        }

        Some(Allocation {
            task_id: task.id,
            teammate_id: idle[cursor].id,
            score: None,
        })
    }
}

impl AllocationPolicy for RoundRobin {
    fn strategy(&self) -> AllocationStrategy {
        AllocationStrategy::RoundRobin
    }

    fn select_next(
        &self,
        team_id: Uuid,
        ready: &[Task],
        teammates: &[Teammate],
    ) -> Option<Allocation> {
        self.pick(team_id, ready, teammates, true)
    }

    fn peek_next(
        &self,
        team_id: Uuid,
        ready: &[Task],
        teammates: &[Teammate],
    ) -> Option<Allocation> {
        self.pick(team_id, ready, teammates, false)
    }
}

/// Prefers the teammate with the fewest finished tasks among idle and busy ones.
#[derive(Debug, Default)]
pub struct LoadBalance;

impl AllocationPolicy for LoadBalance {
    fn strategy(&self) -> AllocationStrategy {
        AllocationStrategy::LoadBalance
    }

    fn select_next(
        &self,
        _team_id: Uuid,
        ready: &[Task],
        teammates: &[Teammate],
    ) -> Option<Allocation> {
        let task = ready.first()?;
        let mut candidates: Vec<&Teammate> = teammates
            .iter()
            .filter(|m| matches!(m.status, TeammateStatus::Idle | TeammateStatus::Busy))
            .collect();
        candidates.sort_by_key(|m| m.finished_tasks());
        let pick = candidates.into_iter().find(|m| m.is_idle())?;

        Some(Allocation {
            task_id: task.id,
            teammate_id: pick.id,
            score: None,
        })
    }
}

/// Matches the first ready task's `metadata.skills` against teammate skills.
#[derive(Debug, Default)]
pub struct SkillMatch;

impl AllocationPolicy for SkillMatch {
    fn strategy(&self) -> AllocationStrategy {
        AllocationStrategy::SkillBased
    }

    fn select_next(
        &self,
        _team_id: Uuid,
        ready: &[Task],
        teammates: &[Teammate],
    ) -> Option<Allocation> {
        let task = ready.first()?;
        let required = task.required_skills();
        let mut idle = teammates.iter().filter(|m| m.is_idle());

        if required.is_empty() {
            let pick = idle.next()?;
            return Some(Allocation {
                task_id: task.id,
                teammate_id: pick.id,
                score: None,
            });
        }

        let mut best: Option<(&Teammate, f64)> = None;
        for mate in idle {
            let score = skill_score(&required, &mate.skills);
            // Strictly greater keeps the first-seen teammate on ties.
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((mate, score));
            }
        }
        let (pick, score) = best?;

        Some(Allocation {
            task_id: task.id,
            teammate_id: pick.id,
            score: Some(score),
        })
    }
}

/// Fraction of `required` skills the teammate has, compared case-insensitively.
/// An empty requirement scores 1.0.
pub fn skill_score(required: &[String], skills: &[String]) -> f64 {
    let required: HashSet<String> = required.iter().map(|s| s.trim().to_lowercase()).collect();
    if required.is_empty() {
        return 1.0;
    }
    let owned: HashSet<String> = skills.iter().map(|s| s.trim().to_lowercase()).collect();
    let matched = required.iter().filter(|s| owned.contains(*s)).count();
    matched as f64 / required.len() as f64
}

/// One policy instance per strategy, so stateful policies keep their cursors.
pub struct AllocationPolicies {
    policies: HashMap<AllocationStrategy, Box<dyn AllocationPolicy>>,
}

impl AllocationPolicies {
    pub fn new() -> Self {
        let mut policies: HashMap<AllocationStrategy, Box<dyn AllocationPolicy>> = HashMap::new();
        for policy in [
            Box::new(RoundRobin::new()) as Box<dyn AllocationPolicy>,
            Box::new(LoadBalance),
            Box::new(SkillMatch),
        ] {
            policies.insert(policy.strategy(), policy);
        }
        Self { policies }
    }

    /// Replace the policy registered for its strategy.
    pub fn register(&mut self, policy: Box<dyn AllocationPolicy>) {
        self.policies.insert(policy.strategy(), policy);
    }

    pub fn get(&self, strategy: AllocationStrategy) -> Option<&dyn AllocationPolicy> {
        self.policies.get(&strategy).map(AsRef::as_ref)
    }
}

impl Default for AllocationPolicies {
    fn default() -> Self {
        Self::new()
    }
}
