use chrono::{DateTime, Utc};
use coterie_core::{CoterieError, CoterieResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle state of a single workflow task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its dependencies.
    Pending,
    /// Dispatched to its agent.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed with retries exhausted.
    Failed,
    /// Skipped; dependents are skipped in turn.
    Skipped,
}

impl TaskState {
    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Skipped
        )
    }
}

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Built but not started; tasks may still be added.
    Created,
    /// The driving loop is dispatching ready tasks.
    Running,
    /// Dispatch suspended; state retained.
    Paused,
    /// Every task completed or was skipped.
    Completed,
    /// A task exhausted its retries with no path to completion.
    Failed,
    /// Cancelled by the caller; in-flight results are discarded.
    Cancelled,
}

impl WorkflowStatus {
    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

/// Parameters for adding a task to a workflow.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Human-readable task name.
    pub name: String,
    /// Capability tag of the work.
    pub kind: String,
    /// Name of the agent that will execute the task.
    pub agent: String,
    /// Named inputs handed to the agent.
    pub inputs: HashMap<String, serde_json::Value>,
    /// Ids of tasks in the same workflow that must complete first.
    pub dependencies: Vec<Uuid>,
    /// Retry bound; the engine default applies when `None`.
    pub max_retries: Option<u32>,
    /// Execution timeout; the engine default applies when `None`.
    pub timeout_ms: Option<u64>,
}

impl TaskSpec {
    /// A spec with no inputs or dependencies.
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            agent: agent.into(),
            inputs: HashMap::new(),
            dependencies: Vec::new(),
            max_retries: None,
            timeout_ms: None,
        }
    }

    /// Adds a named input.
    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    /// Replaces the input map.
    pub fn with_inputs(mut self, inputs: HashMap<String, serde_json::Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Sets the dependency list.
    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Sets the retry bound.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the execution timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A single node in a workflow's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    /// Task id, unique within the workflow.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Capability tag of the work.
    pub kind: String,
    /// Name of the agent assigned to execute this task.
    pub assigned_agent: String,
    /// Named inputs; dependency results are injected under `dep_<id>` keys
    /// at dispatch time.
    pub inputs: HashMap<String, serde_json::Value>,
    /// Tasks in the same workflow that must complete first.
    pub dependencies: Vec<Uuid>,
    /// Current lifecycle state.
    pub state: TaskState,
    /// The agent's result, when completed.
    pub result: Option<serde_json::Value>,
    /// Failure or skip detail.
    pub error: Option<String>,
    /// Retries consumed so far.
    pub retries: u32,
    /// Retry bound.
    pub max_retries: u32,
    /// Execution timeout per attempt.
    pub timeout_ms: u64,
    /// When the current or last attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowTask {
    /// Mark the task running.
    pub fn start(&mut self) {
        self.state = TaskState::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task completed with its result.
    pub fn complete(&mut self, result: serde_json::Value) {
        self.state = TaskState::Completed;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
    }

    /// Mark the task failed.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.state = TaskState::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    /// Mark the task skipped.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.state = TaskState::Skipped;
        self.error = Some(format!("skipped: {}", reason.into()));
        self.finished_at = Some(Utc::now());
    }

    /// Whether another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    /// Consume one retry and reset the task to pending.
    pub fn retry(&mut self) {
        self.retries += 1;
        self.state = TaskState::Pending;
        self.error = None;
        self.started_at = None;
        self.finished_at = None;
    }
}

/// A named, directed acyclic graph of tasks executed as a unit.
///
/// Mutated only by the engine once running; other threads read snapshots
/// through the engine's status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow id.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Task id to task. Insertion order is irrelevant.
    pub tasks: HashMap<Uuid, WorkflowTask>,
    /// Current lifecycle state.
    pub status: WorkflowStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the workflow reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-form metadata; the engine stores the failure reason here.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Workflow {
    /// Create an empty workflow in [`WorkflowStatus::Created`].
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            tasks: HashMap::new(),
            status: WorkflowStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: HashMap::new(),
        }
    }

    /// Add a task. Every dependency must already exist in this workflow.
    pub fn add_task(&mut self, task: WorkflowTask) -> CoterieResult<Uuid> {
        for dep in &task.dependencies {
            if !self.tasks.contains_key(dep) {
                return Err(CoterieError::Workflow(format!(
                    "task '{}' depends on unknown task {dep}",
                    task.name
                )));
            }
        }
        let id = task.id;
        self.tasks.insert(id, task);
        Ok(id)
    }

    /// Pending tasks whose dependencies are all completed. A skipped
    /// dependency does not satisfy readiness; see
    /// [`Workflow::cascade_skippable`].
    pub fn ready_tasks(&self) -> Vec<Uuid> {
        self.tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Pending
                    && t.dependencies.iter().all(|dep| {
                        self.tasks
                            .get(dep)
                            .map(|d| d.state == TaskState::Completed)
                            .unwrap_or(false)
                    })
            })
            .map(|t| t.id)
            .collect()
    }

    /// Pending tasks that can never run because a dependency was skipped:
    /// every dependency is terminal, at least one is skipped, and none
    /// failed. The engine skips these in turn, so a skip propagates down
    /// the graph instead of stranding the workflow.
    pub fn cascade_skippable(&self) -> Vec<Uuid> {
        self.tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Pending && {
                    let deps: Vec<&WorkflowTask> = t
                        .dependencies
                        .iter()
                        .filter_map(|dep| self.tasks.get(dep))
                        .collect();
                    deps.iter().all(|d| d.state.is_terminal())
                        && deps.iter().any(|d| d.state == TaskState::Skipped)
                        && !deps.iter().any(|d| d.state == TaskState::Failed)
                }
            })
            .map(|t| t.id)
            .collect()
    }

    /// Number of tasks currently running.
    pub fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .count()
    }

    /// Complete iff every task is completed or skipped.
    pub fn is_complete(&self) -> bool {
        self.tasks
            .values()
            .all(|t| matches!(t.state, TaskState::Completed | TaskState::Skipped))
    }

    /// A task has failed with its retries exhausted.
    pub fn has_unrecoverable_failure(&self) -> bool {
        self.tasks
            .values()
            .any(|t| t.state == TaskState::Failed && !t.can_retry())
    }

    /// The first unrecoverably failed task, for the failure reason.
    pub fn first_failure(&self) -> Option<&WorkflowTask> {
        self.tasks
            .values()
            .find(|t| t.state == TaskState::Failed && !t.can_retry())
    }

    /// Fraction of tasks in {completed, skipped}, in [0, 1]. An empty
    /// workflow reports 1.
    pub fn progress(&self) -> f64 {
        if self.tasks.is_empty() {
            return 1.0;
        }
        let done = self
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Completed | TaskState::Skipped))
            .count();
        done as f64 / self.tasks.len() as f64
    }

    /// Whether the dependency graph contains a cycle.
    pub fn has_cycle(&self) -> bool {
        let mut visited: HashMap<Uuid, u8> = HashMap::new();
        for &id in self.tasks.keys() {
            if self.dfs_cycle(id, &mut visited) {
                return true;
            }
        }
        false
    }

    fn dfs_cycle(&self, id: Uuid, visited: &mut HashMap<Uuid, u8>) -> bool {
        match visited.get(&id) {
            Some(1) => return true,  // back edge = cycle
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(task) = self.tasks.get(&id) {
            for dep in &task.dependencies {
                if self.dfs_cycle(*dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn task(name: &str, deps: Vec<Uuid>) -> WorkflowTask {
        WorkflowTask {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind: "test".to_string(),
            assigned_agent: "agent".to_string(),
            inputs: HashMap::new(),
            dependencies: deps,
            state: TaskState::Pending,
            result: None,
            error: None,
            retries: 0,
            max_retries: 3,
            timeout_ms: 60_000,
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_new_workflow_is_created_and_complete_when_empty() {
        let workflow = Workflow::new("empty", "");
        assert_eq!(workflow.status, WorkflowStatus::Created);
        assert!(workflow.is_complete());
        assert_eq!(workflow.progress(), 1.0);
    }

    #[test]
    fn test_add_task_rejects_unknown_dependency() {
        let mut workflow = Workflow::new("w", "");
        let result = workflow.add_task(task("orphan", vec![Uuid::new_v4()]));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("unknown task"));
    }

    #[test]
    fn test_ready_tasks_respect_dependencies() {
        let mut workflow = Workflow::new("w", "");
        let a = workflow.add_task(task("a", vec![])).unwrap();
        let b = workflow.add_task(task("b", vec![a])).unwrap();

        assert_eq!(workflow.ready_tasks(), vec![a]);

        workflow.tasks.get_mut(&a).unwrap().complete(serde_json::json!("done"));
        assert_eq!(workflow.ready_tasks(), vec![b]);
    }

    #[test]
    fn test_skipped_dependency_blocks_readiness() {
        let mut workflow = Workflow::new("w", "");
        let a = workflow.add_task(task("a", vec![])).unwrap();
        let b = workflow.add_task(task("b", vec![a])).unwrap();

        workflow.tasks.get_mut(&a).unwrap().skip("not needed");
        assert!(workflow.ready_tasks().is_empty());

        // The dependent is skippable in cascade instead.
        assert_eq!(workflow.cascade_skippable(), vec![b]);
    }

    #[test]
    fn test_cascade_not_applied_while_dependency_failed() {
        let mut workflow = Workflow::new("w", "");
        let a = workflow.add_task(task("a", vec![])).unwrap();
        let s = workflow.add_task(task("s", vec![])).unwrap();
        let _b = workflow.add_task(task("b", vec![a, s])).unwrap();

        workflow.tasks.get_mut(&s).unwrap().skip("off");
        let failed = workflow.tasks.get_mut(&a).unwrap();
        failed.retries = failed.max_retries;
        failed.fail("boom");

        // A failed dependency means workflow failure, not a silent skip.
        assert!(workflow.cascade_skippable().is_empty());
        assert!(workflow.has_unrecoverable_failure());
    }

    #[test]
    fn test_completion_and_progress() {
        let mut workflow = Workflow::new("w", "");
        let a = workflow.add_task(task("a", vec![])).unwrap();
        let b = workflow.add_task(task("b", vec![])).unwrap();

        assert_eq!(workflow.progress(), 0.0);
        workflow.tasks.get_mut(&a).unwrap().complete(serde_json::json!(1));
        assert_eq!(workflow.progress(), 0.5);
        assert!(!workflow.is_complete());

        workflow.tasks.get_mut(&b).unwrap().skip("optional");
        assert_eq!(workflow.progress(), 1.0);
        assert!(workflow.is_complete());
    }

    #[test]
    fn test_retry_accounting() {
        let mut t = task("flaky", vec![]);
        t.max_retries = 2;
        t.fail("first");
        assert!(t.can_retry());

        t.retry();
        assert_eq!(t.state, TaskState::Pending);
        assert_eq!(t.retries, 1);
        assert!(t.error.is_none());

        t.fail("second");
        t.retry();
        t.fail("third");
        assert!(!t.can_retry());
        assert_eq!(t.state, TaskState::Failed);
    }

    #[test]
    fn test_unrecoverable_failure_detection() {
        let mut workflow = Workflow::new("w", "");
        let a = workflow.add_task(task("a", vec![])).unwrap();

        let t = workflow.tasks.get_mut(&a).unwrap();
        t.fail("boom");
        // Retries remain: not unrecoverable yet.
        assert!(!workflow.has_unrecoverable_failure());

        let t = workflow.tasks.get_mut(&a).unwrap();
        t.retries = t.max_retries;
        assert!(workflow.has_unrecoverable_failure());
        assert_eq!(workflow.first_failure().unwrap().name, "a");
    }

    #[test]
    fn test_cycle_detection() {
        let mut workflow = Workflow::new("w", "");
        let a = workflow.add_task(task("a", vec![])).unwrap();
        let b = workflow.add_task(task("b", vec![a])).unwrap();
        assert!(!workflow.has_cycle());

        // Manufacture a cycle directly in the map.
        workflow.tasks.get_mut(&a).unwrap().dependencies.push(b);
        assert!(workflow.has_cycle());
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut workflow = Workflow::new("w", "demo");
        workflow.add_task(task("a", vec![])).unwrap();
        let json = serde_json::to_string(&workflow).unwrap();
        let parsed: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "w");
        assert_eq!(parsed.tasks.len(), 1);
        assert_eq!(parsed.status, WorkflowStatus::Created);
    }
}
