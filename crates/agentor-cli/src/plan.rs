//! Team plans: a team, its teammates and a keyed task graph, read from TOML.
//!
//! ```toml
//! [team]
//! name = "docs"
//! allocation_strategy = "skill_based"
//!
//! [[teammates]]
//! name = "writer"
//! provider = "claude"
//! model = "sonnet"
//! skills = ["writing"]
//!
//! [[tasks]]
//! key = "outline"
//! subject = "Outline the guide"
//!
//! [[tasks]]
//! key = "draft"
//! subject = "Draft the guide"
//! depends_on = ["outline"]
//! skills = ["writing"]
//! max_retries = 2
//! ```

use agentor_core::{AgentorError, AgentorResult};
use agentor_teams::{
    critical_path, detect_cycles, topological_sort, AllocationStrategy, NewTask, NewTeam,
    NewTeammate, TaskGraph, TeamOrchestrator,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct TeamPlan {
    pub team: PlanTeam,
    #[serde(default)]
    pub teammates: Vec<PlanTeammate>,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanTeam {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub max_teammates: Option<u32>,
    #[serde(default)]
    pub allocation_strategy: AllocationStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanTeammate {
    pub name: String,
    #[serde(default)]
    pub role: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub skills: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanTask {
    pub key: String,
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
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
}

impl PlanTask {
    fn metadata(&self) -> serde_json::Value {
        let mut metadata = serde_json::Map::new();
        if !self.skills.is_empty() {
            metadata.insert("skills".into(), serde_json::json!(self.skills));
        }
        if let Some(max) = self.max_retries {
            metadata.insert("max_retries".into(), max.into());
        }
        if let Some(backoff) = self.retry_backoff_ms {
            metadata.insert("retry_backoff_ms".into(), backoff.into());
        }
        serde_json::Value::Object(metadata)
    }
}

/// Result of checking a plan's task graph, reported by task key.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanReport {
    pub order: Vec<String>,
    pub cycles: Vec<Vec<String>>,
    pub critical_path: Vec<String>,
}

impl PlanReport {
    pub fn is_valid(&self) -> bool {
        self.cycles.is_empty()
    }
}

/// Task keys mapped to the ids of the tasks created for them.
#[derive(Debug, Clone)]
pub struct AppliedPlan {
    pub team_id: Uuid,
    pub tasks: HashMap<String, Uuid>,
}

impl AppliedPlan {
    pub fn key_of(&self, task_id: Uuid) -> Option<&str> {
        self.tasks
            .iter()
            .find(|(_, id)| **id == task_id)
            .map(|(key, _)| key.as_str())
    }
}

impl TeamPlan {
    pub fn from_toml(source: &str) -> AgentorResult<Self> {
        let plan: TeamPlan =
            toml::from_str(source).map_err(|e| AgentorError::Config(e.to_string()))?;
        plan.check_keys()?;
        Ok(plan)
    }

    pub async fn load(path: &Path) -> AgentorResult<Self> {
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            AgentorError::Config(format!("Failed to read plan '{}': {e}", path.display()))
        })?;
        Self::from_toml(&source)
    }

    fn check_keys(&self) -> AgentorResult<()> {
        let mut seen = HashMap::new();
        for task in &self.tasks {
            if seen.insert(task.key.as_str(), ()).is_some() {
                return Err(AgentorError::Config(format!(
                    "task key '{}' is used twice",
                    task.key
                )));
            }
        }
        for task in &self.tasks {
            if let Some(missing) = task
                .depends_on
                .iter()
                .find(|dep| !seen.contains_key(dep.as_str()))
            {
                return Err(AgentorError::Config(format!(
                    "task '{}' depends on unknown task '{missing}'",
                    task.key
                )));
            }
        }
        Ok(())
    }

    /// Graph over freshly minted ids, plus the id of every key.
    fn graph(&self) -> (TaskGraph, HashMap<String, Uuid>) {
        let ids: HashMap<String, Uuid> = self
            .tasks
            .iter()
            .map(|t| (t.key.clone(), Uuid::new_v4()))
            .collect();
        let mut graph = TaskGraph::new();
        for task in &self.tasks {
            let deps = task
                .depends_on
                .iter()
                .filter_map(|dep| ids.get(dep).copied())
                .collect();
            if let Some(id) = ids.get(&task.key) {
                graph.add_node(*id, deps);
            }
        }
        (graph, ids)
    }

    pub fn validate(&self) -> AgentorResult<PlanReport> {
        let (graph, ids) = self.graph();
        let keys: HashMap<Uuid, &str> = ids.iter().map(|(k, id)| (*id, k.as_str())).collect();
        let named = |path: Vec<Uuid>| -> Vec<String> {
            path.iter()
                .filter_map(|id| keys.get(id).map(|k| k.to_string()))
                .collect()
        };

        if let Some(cycles) = detect_cycles(&graph) {
            return Ok(PlanReport {
                cycles: cycles.into_iter().map(named).collect(),
                ..PlanReport::default()
            });
        }
        Ok(PlanReport {
            order: named(topological_sort(&graph)?),
            cycles: Vec::new(),
            critical_path: named(critical_path(&graph)?),
        })
    }

    /// Create the team, its teammates and every task, dependencies first.
    pub async fn apply(&self, orch: &TeamOrchestrator) -> AgentorResult<AppliedPlan> {
        let (graph, ids) = self.graph();
        let order = topological_sort(&graph)?;
        let by_id: HashMap<Uuid, &PlanTask> = self
            .tasks
            .iter()
            .filter_map(|t| ids.get(&t.key).map(|id| (*id, t)))
            .collect();

        let mut new_team = NewTeam::new(&self.team.name).with_strategy(self.team.allocation_strategy);
        new_team.description = self.team.description.clone();
        if let Some(max) = self.team.max_teammates {
            new_team = new_team.with_max_teammates(max);
        }
        let team = orch.create_team(new_team).await?;

        for mate in &self.teammates {
            orch.add_teammate(
                NewTeammate::new(team.id, &mate.name, &mate.provider, &mate.model)
                    .with_role(&mate.role)
                    .with_skills(mate.skills.iter().cloned()),
            )
            .await?;
        }

        let mut created: HashMap<String, Uuid> = HashMap::new();
        for planned_id in order {
            let Some(task) = by_id.get(&planned_id) else {
                continue;
            };
            let deps = task
                .depends_on
                .iter()
                .filter_map(|dep| created.get(dep).copied())
                .collect();
            let mut params = NewTask::new(team.id, &task.subject)
                .with_description(&task.description)
                .with_priority(task.priority)
                .with_dependencies(deps)
                .with_metadata(task.metadata());
            params.provider = task.provider.clone();
            params.model = task.model.clone();
            let record = orch.create_task(params).await?;
            created.insert(task.key.clone(), record.id);
        }

        tracing::info!(
            team_id = %team.id,
            teammates = self.teammates.len(),
            tasks = created.len(),
            "Plan applied"
        );
        Ok(AppliedPlan {
            team_id: team.id,
            tasks: created,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use agentor_teams::{ProviderRegistry, TaskStatus, TeamsConfig};

    const PLAN: &str = r#"
        [team]
        name = "docs"
        allocation_strategy = "skill_based"

        [[teammates]]
        name = "writer"
        provider = "claude"
        model = "sonnet"
        skills = ["writing"]

        [[tasks]]
        key = "review"
        subject = "Review the guide"
        depends_on = ["draft", "examples"]

        [[tasks]]
        key = "outline"
        subject = "Outline the guide"

        [[tasks]]
        key = "draft"
        subject = "Draft the guide"
        depends_on = ["outline"]
        skills = ["writing"]
        max_retries = 2
        retry_backoff_ms = 250

        [[tasks]]
        key = "examples"
        subject = "Write examples"
    "#;

    fn position(order: &[String], key: &str) -> usize {
        order.iter().position(|k| k == key).unwrap()
    }

    #[test]
    fn test_validate_orders_by_key() {
        let report = TeamPlan::from_toml(PLAN).unwrap().validate().unwrap();
        assert!(report.is_valid());
        assert_eq!(report.order.len(), 4);
        assert!(position(&report.order, "outline") < position(&report.order, "draft"));
        assert!(position(&report.order, "draft") < position(&report.order, "review"));
        assert_eq!(report.critical_path, vec!["outline", "draft", "review"]);
    }

    #[test]
    fn test_validate_reports_cycles_by_key() {
        let plan = TeamPlan::from_toml(
            r#"
            [team]
            name = "loop"

            [[tasks]]
            key = "a"
            subject = "A"
            depends_on = ["b"]

            [[tasks]]
            key = "b"
            subject = "B"
            depends_on = ["a"]
            "#,
        )
        .unwrap();
        let report = plan.validate().unwrap();
        assert!(!report.is_valid());
        assert_eq!(report.cycles.len(), 1);
        let mut cycle = report.cycles[0].clone();
        cycle.sort();
        assert_eq!(cycle, vec!["a", "b"]);
        assert!(report.order.is_empty());
    }

    #[test]
    fn test_unknown_and_duplicate_keys_rejected() {
        let unknown = TeamPlan::from_toml(
            "[team]\nname = \"t\"\n[[tasks]]\nkey = \"a\"\nsubject = \"A\"\ndepends_on = [\"ghost\"]\n",
        )
        .unwrap_err();
        assert!(unknown.to_string().contains("ghost"));

        let duplicate = TeamPlan::from_toml(
            "[team]\nname = \"t\"\n[[tasks]]\nkey = \"a\"\nsubject = \"A\"\n[[tasks]]\nkey = \"a\"\nsubject = \"B\"\n",
        )
        .unwrap_err();
        assert!(duplicate.to_string().contains("used twice"));
    }

    #[tokio::test]
    async fn test_apply_creates_tasks_with_edges_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.toml");
        std::fs::write(&path, PLAN).unwrap();
        let plan = TeamPlan::load(&path).await.unwrap();

        let orch = TeamOrchestrator::in_memory(&TeamsConfig::default(), ProviderRegistry::new());
        let applied = plan.apply(&orch).await.unwrap();
        assert_eq!(applied.tasks.len(), 4);

        let draft = orch.get_task(applied.tasks["draft"]).await.unwrap();
        assert_eq!(draft.blocked_by, vec![applied.tasks["outline"]]);
        assert_eq!(draft.metadata["max_retries"], 2);
        assert_eq!(draft.metadata["retry_backoff_ms"], 250);
        assert_eq!(draft.required_skills(), vec!["writing"]);
        assert_eq!(draft.status, TaskStatus::Pending);
        assert_eq!(applied.key_of(draft.id), Some("draft"));

        let review = orch.get_task(applied.tasks["review"]).await.unwrap();
        assert_eq!(review.blocked_by.len(), 2);

        let team = orch.get_team(applied.team_id).await.unwrap();
        assert_eq!(team.total_tasks, 4);
        assert_eq!(orch.list_teammates(team.id).await.unwrap().len(), 1);
    }
}
