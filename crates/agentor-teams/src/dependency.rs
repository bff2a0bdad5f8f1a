use crate::store::TeamsDatabase;
use crate::types::{Task, TaskStatus};
use agentor_core::{AgentorError, AgentorResult};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Dependency graph of a team: each node maps to the tasks it is blocked by.
/// Nodes keep creation order so every traversal is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskGraph {
    nodes: Vec<Uuid>,
    edges: HashMap<Uuid, Vec<Uuid>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut graph = Self::new();
        for task in tasks {
            graph.add_node(task.id, task.blocked_by.clone());
        }
        graph
    }

    /// Insert or replace a node and its `blocked_by` list.
    pub fn add_node(&mut self, id: Uuid, blocked_by: Vec<Uuid>) {
        if !self.edges.contains_key(&id) {
            self.nodes.push(id);
        }
        self.edges.insert(id, blocked_by);
    }

    pub fn add_edge(&mut self, task_id: Uuid, depends_on: Uuid) {
        if !self.edges.contains_key(&task_id) {
            self.nodes.push(task_id);
        }
        let deps = self.edges.entry(task_id).or_default();
        if !deps.contains(&depends_on) {
            deps.push(depends_on);
        }
    }

    pub fn nodes(&self) -> &[Uuid] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.edges.contains_key(&id)
    }

    /// Dependencies of `id` that are themselves nodes of this graph.
    pub fn dependencies(&self, id: Uuid) -> impl Iterator<Item = Uuid> + '_ {
        self.edges
            .get(&id)
            .into_iter()
            .flatten()
            .copied()
            .filter(|dep| self.edges.contains_key(dep))
    }
}

/// Kahn's algorithm. Dependencies come before their dependents; ties keep creation order.
///
/// Fails with [`AgentorError::CircularDependency`] (carrying the nodes that could not be
/// ordered) when the sort does not consume every node.
pub fn topological_sort(graph: &TaskGraph) -> AgentorResult<Vec<Uuid>> {
    let mut in_degree: HashMap<Uuid, usize> = HashMap::with_capacity(graph.len());
    let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

    for &node in graph.nodes() {
        in_degree.entry(node).or_insert(0);
        for dep in graph.dependencies(node) {
            *in_degree.entry(node).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(node);
        }
    }

    let mut queue: VecDeque<Uuid> = graph
        .nodes()
        .iter()
        .copied()
        .filter(|n| in_degree.get(n) == Some(&0))
        .collect();

    let mut order = Vec::with_capacity(graph.len());
    while let Some(node) = queue.pop_front() {
        order.push(node);
        for &next in dependents.get(&node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if order.len() < graph.len() {
        let unresolved: Vec<Uuid> = graph
            .nodes()
            .iter()
            .copied()
            .filter(|n| in_degree.get(n).is_some_and(|d| *d > 0))
            .collect();
        return Err(AgentorError::CircularDependency(unresolved));
    }
    Ok(order)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    Visiting,
    Visited,
}

/// Every distinct cycle reachable in the graph, or `None` when it is acyclic.
///
/// Each cycle is listed along dependency edges (`a` is blocked by `b` is blocked by ...),
/// rotated so its smallest id comes first. Uses an explicit stack instead of recursion.
pub fn detect_cycles(graph: &TaskGraph) -> Option<Vec<Vec<Uuid>>> {
    let mut color: HashMap<Uuid, Color> =
        graph.nodes().iter().map(|n| (*n, Color::Unvisited)).collect();
    let mut seen: HashSet<Vec<Uuid>> = HashSet::new();
    let mut cycles = Vec::new();

    for &root in graph.nodes() {
        if color.get(&root) != Some(&Color::Unvisited) {
            continue;
        }

        // (node, dependencies, next index into dependencies)
        let mut stack: Vec<(Uuid, Vec<Uuid>, usize)> = Vec::new();
        let mut path: Vec<Uuid> = Vec::new();
        color.insert(root, Color::Visiting);
        stack.push((root, graph.dependencies(root).collect(), 0));
        path.push(root);

        while let Some((node, deps, idx)) = stack.last_mut() {
            if *idx >= deps.len() {
                color.insert(*node, Color::Visited);
                stack.pop();
                path.pop();
                continue;
            }
            let next = deps[*idx];
            *idx += 1;

            match color.get(&next).copied().unwrap_or(Color::Visited) {
                Color::Unvisited => {
                    color.insert(next, Color::Visiting);
                    path.push(next);
                    stack.push((next, graph.dependencies(next).collect(), 0));
                }
                Color::Visiting => {
                    if let Some(start) = path.iter().position(|n| *n == next) {
                        let cycle = canonical_cycle(&path[start..]);
                        if seen.insert(cycle.clone()) {
                            cycles.push(cycle);
                        }
                    }
                }
                Color::Visited => {}
            }
        }
    }

    if cycles.is_empty() {
        None
    } else {
        Some(cycles)
    }
}

fn canonical_cycle(cycle: &[Uuid]) -> Vec<Uuid> {
    let min_pos = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(pos, _)| pos)
        .unwrap_or(0);
    cycle[min_pos..]
        .iter()
        .chain(cycle[..min_pos].iter())
        .copied()
        .collect()
}

/// Longest dependency chain, listed from the first task to run to the last.
pub fn critical_path(graph: &TaskGraph) -> AgentorResult<Vec<Uuid>> {
    let order = topological_sort(graph)?;

    let mut distance: HashMap<Uuid, usize> = HashMap::with_capacity(order.len());
    let mut previous: HashMap<Uuid, Uuid> = HashMap::new();
    for &node in &order {
        let mut best = 0;
        for dep in graph.dependencies(node) {
            let candidate = distance.get(&dep).copied().unwrap_or(0) + 1;
            if candidate > best {
                best = candidate;
                previous.insert(node, dep);
            }
        }
        distance.insert(node, best);
    }

    let mut end: Option<(Uuid, usize)> = None;
    for &node in &order {
        let d = distance.get(&node).copied().unwrap_or(0);
        if end.map_or(true, |(_, best)| d > best) {
            end = Some((node, d));
        }
    }

    let mut path = Vec::new();
    let mut cursor = end.map(|(node, _)| node);
    while let Some(node) = cursor {
        path.push(node);
        cursor = previous.get(&node).copied();
    }
    path.reverse();
    Ok(path)
}

/// Builds and queries a team's task dependency graph.
pub struct DependencyResolver {
    db: Arc<dyn TeamsDatabase>,
}

impl DependencyResolver {
    pub fn new(db: Arc<dyn TeamsDatabase>) -> Self {
        Self { db }
    }

    pub async fn build_dag(&self, team_id: Uuid) -> AgentorResult<TaskGraph> {
        let tasks = self.db.list_tasks(team_id).await?;
        Ok(TaskGraph::from_tasks(&tasks))
    }

    /// Topological order of a team's tasks.
    pub async fn sorted_tasks(&self, team_id: Uuid) -> AgentorResult<Vec<Uuid>> {
        let graph = self.build_dag(team_id).await?;
        topological_sort(&graph).inspect_err(|e| {
            warn!(team_id = %team_id, error = %e, "Dependency cycle in team task graph");
        })
    }

    pub async fn find_cycles(&self, team_id: Uuid) -> AgentorResult<Option<Vec<Vec<Uuid>>>> {
        let graph = self.build_dag(team_id).await?;
        Ok(detect_cycles(&graph))
    }

    /// Pending tasks whose finish-to-start dependencies are all completed.
    pub async fn get_ready_tasks(&self, team_id: Uuid) -> AgentorResult<Vec<Task>> {
        self.db.get_ready_tasks(team_id).await
    }

    /// Dependencies of a task that are missing or not yet completed.
    pub async fn unmet_dependencies(&self, task: &Task) -> AgentorResult<Vec<Uuid>> {
        let mut unmet = Vec::new();
        for dep in &task.blocked_by {
            match self.db.get_task(*dep).await? {
                Some(t) if t.status == TaskStatus::Completed => {}
                _ => unmet.push(*dep),
            }
        }
        Ok(unmet)
    }

    /// False when the task is missing or any dependency is not completed.
    pub async fn is_task_ready(&self, task_id: Uuid) -> AgentorResult<bool> {
        let Some(task) = self.db.get_task(task_id).await? else {
            debug!(task_id = %task_id, "Readiness check on unknown task");
            return Ok(false);
        };
        Ok(self.unmet_dependencies(&task).await?.is_empty())
    }

    pub async fn get_critical_path(&self, team_id: Uuid) -> AgentorResult<Vec<Uuid>> {
        let graph = self.build_dag(team_id).await?;
        critical_path(&graph)
    }
}
