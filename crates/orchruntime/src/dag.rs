use chrono::Utc;
use orchcore::{
    OrchestrationError, Result, Task, TaskId, TaskStatus, Workflow, WorkflowId, WorkflowStatus,
};
use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

/// Dependency graph with edges pointing from a dependency to its dependent
type TaskGraph = DiGraphMap<TaskId, ()>;

/// Check that a task set forms a valid DAG without registering it
pub fn validate_tasks(tasks: &[Task]) -> Result<()> {
    let graph = build_graph(tasks)?;
    check_acyclic(&graph, tasks)
}

/// Topological generations of a task set, insertion order within a level
pub fn execution_levels(tasks: &[Task]) -> Result<Vec<Vec<TaskId>>> {
    let graph = build_graph(tasks)?;
    check_acyclic(&graph, tasks)?;
    layer(&graph, tasks)
}

/// Build the id graph, rejecting duplicate ids, self-loops and dangling references
fn build_graph(tasks: &[Task]) -> Result<TaskGraph> {
    let mut graph = TaskGraph::with_capacity(tasks.len(), tasks.len());

    for task in tasks {
        if graph.contains_node(task.id) {
            return Err(OrchestrationError::DuplicateTask(task.id));
        }
        graph.add_node(task.id);
    }

    for task in tasks {
        for dep in &task.dependencies {
            if *dep == task.id {
                return Err(OrchestrationError::CyclicGraph(format!(
                    "task {} depends on itself",
                    task.id
                )));
            }
            if !graph.contains_node(*dep) {
                return Err(OrchestrationError::CyclicGraph(format!(
                    "task {} depends on unknown task {}",
                    task.id, dep
                )));
            }
            graph.add_edge(*dep, task.id, ());
        }
    }

    Ok(graph)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

/// Depth-first search over dependency edges using an explicit stack of
/// (node, next dependency position). Every task is used as a root so
/// disconnected components are covered.
fn check_acyclic(graph: &TaskGraph, tasks: &[Task]) -> Result<()> {
    let mut marks: HashMap<TaskId, Mark> = HashMap::with_capacity(tasks.len());
    let dependencies_of = |node: TaskId| -> Vec<TaskId> {
        graph.neighbors_directed(node, Direction::Incoming).collect()
    };

    for root in tasks.iter().map(|t| t.id) {
        if marks.contains_key(&root) {
            continue;
        }

        marks.insert(root, Mark::OnPath);
        let mut stack: Vec<(TaskId, Vec<TaskId>, usize)> = vec![(root, dependencies_of(root), 0)];

        while let Some(frame) = stack.last_mut() {
            let (node, next) = (frame.0, frame.1.get(frame.2).copied());
            frame.2 += 1;

            match next {
                Some(dep) => match marks.get(&dep) {
                    Some(Mark::OnPath) => {
                        return Err(OrchestrationError::CyclicGraph(format!(
                            "cycle through tasks {} and {}",
                            node, dep
                        )));
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(dep, Mark::OnPath);
                        stack.push((dep, dependencies_of(dep), 0));
                    }
                },
                None => {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                }
            }
        }
    }

    Ok(())
}

/// Kahn layering. Level 0 holds tasks without dependencies; each later level
/// holds the tasks whose last dependency was placed in the level before it.
fn layer(graph: &TaskGraph, tasks: &[Task]) -> Result<Vec<Vec<TaskId>>> {
    let position: HashMap<TaskId, usize> =
        tasks.iter().enumerate().map(|(i, t)| (t.id, i)).collect();
    let mut remaining: HashMap<TaskId, usize> = tasks
        .iter()
        .map(|t| (t.id, graph.neighbors_directed(t.id, Direction::Incoming).count()))
        .collect();

    let mut levels = Vec::new();
    let mut placed = 0;
    let mut current: Vec<TaskId> = tasks
        .iter()
        .filter(|t| remaining[&t.id] == 0)
        .map(|t| t.id)
        .collect();

    while !current.is_empty() {
        let mut next = Vec::new();
        for id in &current {
            for dependent in graph.neighbors_directed(*id, Direction::Outgoing) {
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        next.push(dependent);
                    }
                }
            }
        }
        next.sort_by_key(|id| position[id]);

        placed += current.len();
        levels.push(current);
        current = next;
    }

    if placed != tasks.len() {
        return Err(OrchestrationError::CyclicGraph(format!(
            "{} tasks are part of a cycle",
            tasks.len() - placed
        )));
    }

    Ok(levels)
}

/// Drop repeated dependency ids, keeping first occurrence
fn normalize(task: &mut Task) {
    let mut seen = HashSet::new();
    task.dependencies.retain(|dep| seen.insert(*dep));
}

/// Held by whoever drives an execution. The store treats an ACTIVE workflow
/// whose lease is gone as abandoned.
#[derive(Debug)]
pub struct ExecutionLease {
    _alive: Arc<()>,
}

struct DagEntry {
    workflow: Workflow,
    graph: TaskGraph,
    execution: Weak<()>,
}

impl DagEntry {
    fn new(mut workflow: Workflow) -> Result<Self> {
        workflow.tasks.iter_mut().for_each(normalize);
        let graph = build_graph(&workflow.tasks)?;
        check_acyclic(&graph, &workflow.tasks)?;
        Ok(Self {
            workflow,
            graph,
            execution: Weak::new(),
        })
    }

    /// Swap in a new task list, leaving the entry untouched if it is invalid
    fn commit_tasks(&mut self, mut tasks: Vec<Task>) -> Result<()> {
        tasks.iter_mut().for_each(normalize);
        let graph = build_graph(&tasks)?;
        check_acyclic(&graph, &tasks)?;
        self.workflow.tasks = tasks;
        self.graph = graph;
        self.workflow.updated_at = Utc::now();
        Ok(())
    }

    /// Fail an ACTIVE workflow nobody is executing any more, along with the
    /// tasks it left RUNNING. Returns whether anything changed.
    fn recover_abandoned(&mut self) -> bool {
        if self.workflow.status != WorkflowStatus::Active || self.execution.strong_count() > 0 {
            return false;
        }

        let now = Utc::now();
        for task in self
            .workflow
            .tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::Running)
        {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            task.error_message = Some(ABANDONED.to_string());
        }
        self.workflow.status = WorkflowStatus::Failed;
        self.workflow.error_message = Some(ABANDONED.to_string());
        self.workflow.completed_at = Some(now);
        self.workflow.updated_at = now;

        tracing::warn!(workflow_id = %self.workflow.id, "Recovered abandoned execution");
        true
    }

    fn ensure_mutable(&mut self) -> Result<()> {
        self.recover_abandoned();
        if self.workflow.status == WorkflowStatus::Active {
            return Err(OrchestrationError::WorkflowActive(self.workflow.id));
        }
        Ok(())
    }

    fn task_mut(&mut self, task_id: TaskId) -> Result<&mut Task> {
        let workflow_id = self.workflow.id;
        self.workflow
            .find_task_mut(task_id)
            .ok_or(OrchestrationError::UnknownTask {
                workflow_id,
                task_id,
            })
    }

    fn task(&self, task_id: TaskId) -> Result<&Task> {
        self.workflow
            .find_task(task_id)
            .ok_or(OrchestrationError::UnknownTask {
                workflow_id: self.workflow.id,
                task_id,
            })
    }
}

const ABANDONED: &str = "Execution abandoned before completion";

/// In-memory registry of workflows and their dependency graphs.
///
/// Every operation takes the store lock for its whole duration, so no caller
/// can observe a partially mutated graph.
pub struct DagStore {
    dags: RwLock<HashMap<WorkflowId, DagEntry>>,
}

impl DagStore {
    pub fn new() -> Self {
        Self {
            dags: RwLock::new(HashMap::new()),
        }
    }

    /// Register a workflow. Nothing is stored unless its tasks form a DAG.
    pub async fn register(&self, workflow: Workflow) -> Result<()> {
        let mut dags = self.dags.write().await;
        if dags.contains_key(&workflow.id) {
            return Err(OrchestrationError::DuplicateWorkflow(workflow.id));
        }

        let id = workflow.id;
        let entry = DagEntry::new(workflow)?;
        tracing::debug!(workflow_id = %id, tasks = entry.workflow.tasks.len(), "Registered workflow");
        dags.insert(id, entry);
        Ok(())
    }

    pub async fn validate(&self, workflow_id: WorkflowId) -> Result<()> {
        let dags = self.dags.read().await;
        let entry = dags
            .get(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;
        check_acyclic(&entry.graph, &entry.workflow.tasks)
    }

    /// Append a task; rejected without side effects if it breaks the DAG
    pub async fn add_task(&self, workflow_id: WorkflowId, mut task: Task) -> Result<()> {
        let mut dags = self.dags.write().await;
        let entry = dags
            .get_mut(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;
        entry.ensure_mutable()?;

        task.owner = entry.workflow.owner.clone();
        let mut tasks = entry.workflow.tasks.clone();
        tasks.push(task);
        entry.commit_tasks(tasks)
    }

    /// Remove a task and strip it from every other task's dependencies
    pub async fn remove_task(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<()> {
        let mut dags = self.dags.write().await;
        let entry = dags
            .get_mut(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;
        entry.ensure_mutable()?;
        entry.task(task_id)?;

        let tasks = entry
            .workflow
            .tasks
            .iter()
            .filter(|t| t.id != task_id)
            .cloned()
            .map(|mut t| {
                t.dependencies.retain(|dep| *dep != task_id);
                t
            })
            .collect();
        entry.commit_tasks(tasks)
    }

    /// Replace the whole task list, stamping the workflow owner on each task
    pub async fn replace_tasks(&self, workflow_id: WorkflowId, tasks: Vec<Task>) -> Result<()> {
        let mut dags = self.dags.write().await;
        let entry = dags
            .get_mut(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;
        entry.ensure_mutable()?;

        let owner = entry.workflow.owner.clone();
        let tasks = tasks
            .into_iter()
            .map(|mut t| {
                t.owner = owner.clone();
                t
            })
            .collect();
        entry.commit_tasks(tasks)
    }

    /// Returns whether the workflow existed
    pub async fn remove(&self, workflow_id: WorkflowId) -> bool {
        self.dags.write().await.remove(&workflow_id).is_some()
    }

    pub async fn contains(&self, workflow_id: WorkflowId) -> bool {
        self.dags.read().await.contains_key(&workflow_id)
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowId> {
        self.dags.read().await.keys().copied().collect()
    }

    /// Levels of task ids; an invalid stored graph yields an empty order
    pub async fn execution_order(&self, workflow_id: WorkflowId) -> Result<Vec<Vec<TaskId>>> {
        let dags = self.dags.read().await;
        let entry = dags
            .get(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;

        match check_acyclic(&entry.graph, &entry.workflow.tasks)
            .and_then(|_| layer(&entry.graph, &entry.workflow.tasks))
        {
            Ok(levels) => Ok(levels),
            Err(e) => {
                tracing::warn!(workflow_id = %workflow_id, "Graph is not a DAG, no execution order: {}", e);
                Ok(Vec::new())
            }
        }
    }

    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        let dags = self.dags.read().await;
        dags.get(&workflow_id)
            .map(|entry| entry.workflow.clone())
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))
    }

    pub async fn get_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<Task>> {
        let dags = self.dags.read().await;
        dags.get(&workflow_id)
            .map(|entry| entry.workflow.tasks.clone())
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))
    }

    pub async fn task_dependencies(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
    ) -> Result<Vec<TaskId>> {
        let dags = self.dags.read().await;
        let entry = dags
            .get(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;
        Ok(entry.task(task_id)?.dependencies.clone())
    }

    /// Tasks that list `task_id` as a dependency, in task-list order
    pub async fn dependents(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<Vec<TaskId>> {
        let dags = self.dags.read().await;
        let entry = dags
            .get(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;
        entry.task(task_id)?;

        Ok(entry
            .workflow
            .tasks
            .iter()
            .filter(|t| t.dependencies.contains(&task_id))
            .map(|t| t.id)
            .collect())
    }

    pub async fn task_status(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<TaskStatus> {
        let dags = self.dags.read().await;
        let entry = dags
            .get(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;
        Ok(entry.task(task_id)?.status)
    }

    pub async fn update_task_status(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
        status: TaskStatus,
    ) -> Result<()> {
        self.with_task(workflow_id, task_id, |task| task.status = status)
            .await
    }

    pub async fn mark_task_running(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<()> {
        self.with_task(workflow_id, task_id, |task| {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.completed_at = None;
            task.error_message = None;
        })
        .await
    }

    pub async fn mark_task_completed(&self, workflow_id: WorkflowId, task_id: TaskId) -> Result<()> {
        self.with_task(workflow_id, task_id, |task| {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.error_message = None;
        })
        .await
    }

    pub async fn mark_task_failed(
        &self,
        workflow_id: WorkflowId,
        task_id: TaskId,
        error: impl Into<String>,
    ) -> Result<()> {
        let error = error.into();
        self.with_task(workflow_id, task_id, move |task| {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            task.error_message = Some(error);
        })
        .await
    }

    /// Move a workflow to ACTIVE with every task back at PENDING.
    /// Fails with `WorkflowActive` if it is already executing.
    ///
    /// The workflow counts as executing only while the returned lease is
    /// alive; once it is dropped, the next mutation or
    /// [`recover_abandoned`](Self::recover_abandoned) marks the run FAILED.
    pub async fn begin_execution(&self, workflow_id: WorkflowId) -> Result<(Workflow, ExecutionLease)> {
        let mut dags = self.dags.write().await;
        let entry = dags
            .get_mut(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;
        entry.ensure_mutable()?;

        let lease = ExecutionLease {
            _alive: Arc::new(()),
        };
        entry.execution = Arc::downgrade(&lease._alive);

        let now = Utc::now();
        let workflow = &mut entry.workflow;
        workflow.tasks.iter_mut().for_each(Task::reset);
        workflow.status = WorkflowStatus::Active;
        workflow.error_message = None;
        workflow.started_at = Some(now);
        workflow.completed_at = None;
        workflow.updated_at = now;
        Ok((workflow.clone(), lease))
    }

    /// Fail the workflow if it is ACTIVE without a live execution lease.
    /// Returns whether it was recovered.
    pub async fn recover_abandoned(&self, workflow_id: WorkflowId) -> Result<bool> {
        let mut dags = self.dags.write().await;
        let entry = dags
            .get_mut(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;
        Ok(entry.recover_abandoned())
    }

    pub async fn set_workflow_status(
        &self,
        workflow_id: WorkflowId,
        status: WorkflowStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut dags = self.dags.write().await;
        let entry = dags
            .get_mut(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;

        let now = Utc::now();
        let workflow = &mut entry.workflow;
        workflow.status = status;
        workflow.error_message = error;
        workflow.updated_at = now;
        if matches!(status, WorkflowStatus::Completed | WorkflowStatus::Failed) {
            workflow.completed_at = Some(now);
        }
        Ok(())
    }

    /// Graphviz DOT rendering of the dependency graph, nodes labelled by task name
    pub async fn to_dot(&self, workflow_id: WorkflowId) -> Result<String> {
        let dags = self.dags.read().await;
        let entry = dags
            .get(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;

        let mut graph = DiGraph::<String, &str>::new();
        let indices: HashMap<TaskId, _> = entry
            .workflow
            .tasks
            .iter()
            .map(|t| (t.id, graph.add_node(t.name.clone())))
            .collect();
        for (from, to, _) in entry.graph.all_edges() {
            graph.add_edge(indices[&from], indices[&to], "");
        }

        Ok(format!("{}", Dot::with_config(&graph, &[Config::EdgeNoLabel])))
    }

    async fn with_task<F>(&self, workflow_id: WorkflowId, task_id: TaskId, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Task),
    {
        let mut dags = self.dags.write().await;
        let entry = dags
            .get_mut(&workflow_id)
            .ok_or(OrchestrationError::UnknownWorkflow(workflow_id))?;
        apply(entry.task_mut(task_id)?);
        entry.workflow.updated_at = Utc::now();
        Ok(())
    }
}

impl Default for DagStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchcore::{TaskType, WorkflowDraft};
    use uuid::Uuid;

    fn task(name: &str) -> Task {
        Task::new(name, TaskType::DataProcessing)
    }

    fn workflow(tasks: Vec<Task>) -> Workflow {
        Workflow::from_draft(Uuid::new_v4(), WorkflowDraft::from_tasks(tasks), "tester")
    }

    /// A -> {B, C} -> D
    fn diamond() -> Vec<Task> {
        let a = task("A");
        let b = task("B").depends_on(a.id);
        let c = task("C").depends_on(a.id);
        let d = task("D").depends_on(b.id).depends_on(c.id);
        vec![a, b, c, d]
    }

    #[test]
    fn test_diamond_levels() {
        let tasks = diamond();
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();

        let levels = execution_levels(&tasks).unwrap();

        assert_eq!(levels, vec![vec![ids[0]], vec![ids[1], ids[2]], vec![ids[3]]]);
    }

    #[test]
    fn test_levels_keep_insertion_order() {
        let root = task("root");
        let z = task("z").depends_on(root.id);
        let y = task("y").depends_on(root.id);
        let x = task("x").depends_on(root.id);
        let expected = vec![z.id, y.id, x.id];

        let levels = execution_levels(&[root, z, y, x]).unwrap();

        assert_eq!(levels[1], expected);
    }

    #[test]
    fn test_levels_are_minimal() {
        // c depends on a (level 0) and b (level 1), so it must land on level 2,
        // while d only depends on a and must land on level 1.
        let a = task("a");
        let b = task("b").depends_on(a.id);
        let c = task("c").depends_on(a.id).depends_on(b.id);
        let d = task("d").depends_on(a.id);
        let tasks = vec![a.clone(), b.clone(), c.clone(), d.clone()];

        let levels = execution_levels(&tasks).unwrap();
        let level_of = |id: TaskId| levels.iter().position(|l| l.contains(&id)).unwrap();

        assert_eq!(level_of(a.id), 0);
        assert_eq!(level_of(b.id), 1);
        assert_eq!(level_of(d.id), 1);
        assert_eq!(level_of(c.id), 2);
    }

    #[test]
    fn test_every_task_in_exactly_one_level_above_its_dependencies() {
        let mut tasks: Vec<Task> = Vec::new();
        for i in 0..30 {
            let mut t = task(&format!("t{}", i));
            // deterministic pseudo-random back edges
            for j in 0..i {
                if (i * 7 + j * 3) % 5 == 0 {
                    t = t.depends_on(tasks[j].id);
                }
            }
            tasks.push(t);
        }

        let levels = execution_levels(&tasks).unwrap();
        let mut level_of = HashMap::new();
        for (index, level) in levels.iter().enumerate() {
            for id in level {
                assert!(level_of.insert(*id, index).is_none(), "task placed twice");
            }
        }
        assert_eq!(level_of.len(), tasks.len());

        for t in &tasks {
            let own = level_of[&t.id];
            for dep in &t.dependencies {
                assert!(level_of[dep] < own);
            }
            if own > 0 {
                assert!(t.dependencies.iter().any(|dep| level_of[dep] == own - 1));
            }
        }
    }

    #[test]
    fn test_two_cycle_rejected() {
        let mut a = task("a");
        let b = task("b").depends_on(a.id);
        a = a.depends_on(b.id);

        let err = validate_tasks(&[a, b]).unwrap_err();
        assert_eq!(err.kind(), "cyclic_graph");
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut a = task("a");
        a.dependencies.push(a.id);

        assert_eq!(validate_tasks(&[a]).unwrap_err().kind(), "cyclic_graph");
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let a = task("a").depends_on(Uuid::new_v4());
        assert_eq!(validate_tasks(&[a]).unwrap_err().kind(), "cyclic_graph");
    }

    #[test]
    fn test_cycle_in_disconnected_component_found() {
        let lone = task("lone");
        let mut x = task("x");
        let y = task("y").depends_on(x.id);
        let z = task("z").depends_on(y.id);
        x = x.depends_on(z.id);

        assert!(validate_tasks(&[lone, x, y, z]).is_err());
    }

    #[test]
    fn test_long_chain_does_not_recurse() {
        let mut tasks: Vec<Task> = vec![task("0")];
        for i in 1..20_000 {
            let prev = tasks[i - 1].id;
            tasks.push(task(&i.to_string()).depends_on(prev));
        }
        // deepest task first so the first traversal walks the whole chain
        tasks.reverse();
        assert!(validate_tasks(&tasks).is_ok());
    }

    #[tokio::test]
    async fn test_register_cycle_leaves_store_unchanged() {
        let store = DagStore::new();
        let mut a = task("a");
        let b = task("b").depends_on(a.id);
        a = a.depends_on(b.id);
        let wf = workflow(vec![a, b]);
        let id = wf.id;

        assert!(matches!(
            store.register(wf).await,
            Err(OrchestrationError::CyclicGraph(_))
        ));
        assert!(!store.contains(id).await);
        assert!(matches!(
            store.get_tasks(id).await,
            Err(OrchestrationError::UnknownWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn test_register_twice_is_duplicate() {
        let store = DagStore::new();
        let wf = workflow(diamond());

        store.register(wf.clone()).await.unwrap();
        assert!(matches!(
            store.register(wf).await,
            Err(OrchestrationError::DuplicateWorkflow(_))
        ));
    }

    fn edges(tasks: &[Task]) -> Vec<(TaskId, Vec<TaskId>)> {
        tasks.iter().map(|t| (t.id, t.dependencies.clone())).collect()
    }

    #[tokio::test]
    async fn test_add_task_rejection_restores_previous_state() {
        let store = DagStore::new();
        let tasks = diamond();
        let d_id = tasks[3].id;
        let wf = workflow(tasks);
        let id = wf.id;
        store.register(wf).await.unwrap();
        store.add_task(id, task("E").depends_on(d_id)).await.unwrap();
        let before = store.get_tasks(id).await.unwrap();

        // a new task can only close a cycle through itself
        let mut looping = task("F").depends_on(d_id);
        looping.dependencies.push(looping.id);
        assert_eq!(store.add_task(id, looping).await.unwrap_err().kind(), "cyclic_graph");

        let dangling = task("G").depends_on(Uuid::new_v4());
        assert_eq!(store.add_task(id, dangling).await.unwrap_err().kind(), "cyclic_graph");

        let mut duplicate = task("H");
        duplicate.id = d_id;
        assert!(matches!(
            store.add_task(id, duplicate).await,
            Err(OrchestrationError::DuplicateTask(_))
        ));

        assert_eq!(edges(&before), edges(&store.get_tasks(id).await.unwrap()));
        store.validate(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_tasks_cycle_restores_previous_state() {
        let store = DagStore::new();
        let wf = workflow(diamond());
        let id = wf.id;
        store.register(wf).await.unwrap();
        let before = store.get_tasks(id).await.unwrap();

        // A now also waits for D, which transitively waits for A
        let mut cyclic = before.clone();
        let d_id = cyclic[3].id;
        cyclic[0].dependencies.push(d_id);
        let err = store.replace_tasks(id, cyclic).await.unwrap_err();

        assert_eq!(err.kind(), "cyclic_graph");
        assert_eq!(edges(&before), edges(&store.get_tasks(id).await.unwrap()));
        assert_eq!(store.execution_order(id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_remove_task_strips_dependency_edges() {
        let store = DagStore::new();
        let tasks = diamond();
        let (a, b, c, d) = (tasks[0].id, tasks[1].id, tasks[2].id, tasks[3].id);
        let wf = workflow(tasks);
        let id = wf.id;
        store.register(wf).await.unwrap();

        store.remove_task(id, b).await.unwrap();

        assert_eq!(store.task_dependencies(id, d).await.unwrap(), vec![c]);
        assert_eq!(store.dependents(id, a).await.unwrap(), vec![c]);
        assert_eq!(
            store.execution_order(id).await.unwrap(),
            vec![vec![a], vec![c], vec![d]]
        );
        assert!(matches!(
            store.remove_task(id, b).await,
            Err(OrchestrationError::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn test_mutation_rejected_while_active() {
        let store = DagStore::new();
        let wf = workflow(diamond());
        let id = wf.id;
        store.register(wf).await.unwrap();

        let (_, lease) = store.begin_execution(id).await.unwrap();

        assert!(matches!(
            store.add_task(id, task("late")).await,
            Err(OrchestrationError::WorkflowActive(_))
        ));
        assert!(matches!(
            store.begin_execution(id).await,
            Err(OrchestrationError::WorkflowActive(_))
        ));
        assert!(!store.recover_abandoned(id).await.unwrap());
        drop(lease);
    }

    #[tokio::test]
    async fn test_dropped_lease_fails_the_run() {
        let store = DagStore::new();
        let tasks = diamond();
        let (a, b) = (tasks[0].id, tasks[1].id);
        let wf = workflow(tasks);
        let id = wf.id;
        store.register(wf).await.unwrap();

        let (_, lease) = store.begin_execution(id).await.unwrap();
        store.mark_task_completed(id, a).await.unwrap();
        store.mark_task_running(id, b).await.unwrap();
        drop(lease);

        assert!(store.recover_abandoned(id).await.unwrap());
        let wf = store.get_workflow(id).await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert!(wf.error_message.is_some() && wf.completed_at.is_some());
        assert_eq!(wf.find_task(a).unwrap().status, TaskStatus::Completed);
        assert_eq!(wf.find_task(b).unwrap().status, TaskStatus::Failed);
        assert!(!store.recover_abandoned(id).await.unwrap());

        // a fresh run starts cleanly
        let (_, _lease) = store.begin_execution(id).await.unwrap();
        assert_eq!(store.task_status(id, b).await.unwrap(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_mutation_recovers_abandoned_run() {
        let store = DagStore::new();
        let wf = workflow(diamond());
        let id = wf.id;
        store.register(wf).await.unwrap();

        let (_, lease) = store.begin_execution(id).await.unwrap();
        drop(lease);

        store.add_task(id, task("late")).await.unwrap();
        assert_eq!(store.get_workflow(id).await.unwrap().status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_workflow_queries() {
        let store = DagStore::new();
        let id = Uuid::new_v4();

        assert!(matches!(store.validate(id).await, Err(OrchestrationError::UnknownWorkflow(_))));
        assert!(matches!(
            store.execution_order(id).await,
            Err(OrchestrationError::UnknownWorkflow(_))
        ));
        assert!(!store.remove(id).await);
    }

    #[tokio::test]
    async fn test_status_transitions_recorded() {
        let store = DagStore::new();
        let tasks = diamond();
        let a = tasks[0].id;
        let wf = workflow(tasks);
        let id = wf.id;
        store.register(wf).await.unwrap();

        store.mark_task_running(id, a).await.unwrap();
        assert_eq!(store.task_status(id, a).await.unwrap(), TaskStatus::Running);

        store.mark_task_failed(id, a, "boom").await.unwrap();
        let wf = store.get_workflow(id).await.unwrap();
        let a_task = wf.find_task(a).unwrap();
        assert_eq!(a_task.status, TaskStatus::Failed);
        assert_eq!(a_task.error_message.as_deref(), Some("boom"));
        assert!(a_task.started_at.is_some() && a_task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_dot_output_lists_edges() {
        let store = DagStore::new();
        let wf = workflow(diamond());
        let id = wf.id;
        store.register(wf).await.unwrap();

        let dot = store.to_dot(id).await.unwrap();

        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("\"A\""));
        assert_eq!(dot.matches("->").count(), 4);
    }
}
