use crate::workflow::{TaskSpec, TaskState, Workflow, WorkflowStatus, WorkflowTask};
use chrono::Utc;
use coterie_agent::TaskExecutor;
use coterie_bus::EventBroker;
use coterie_core::{CoterieError, CoterieResult, TaskPayload};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for the [`WorkflowEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrent task executions across all workflows.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Execution timeout applied when a task does not specify one.
    #[serde(default = "default_task_timeout_ms")]
    pub default_task_timeout_ms: u64,
    /// Retry bound applied when a task does not specify one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_task_timeout_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_task_timeout_ms: default_task_timeout_ms(),
            default_max_retries: default_max_retries(),
        }
    }
}

struct WorkflowSlot {
    workflow: RwLock<Workflow>,
    /// Woken on task completion and on every status transition, so the
    /// driving loop and `wait` never poll.
    wake: Notify,
}

struct DispatchItem {
    task_id: Uuid,
    agent: String,
    payload: TaskPayload,
    timeout_ms: u64,
}

enum Step {
    Dispatch(Vec<DispatchItem>),
    Wait,
    Finished,
}

/// Executes workflows as dependency graphs: ready tasks are dispatched
/// concurrently through a [`TaskExecutor`], failed tasks are retried up to
/// their bound, and completion or failure is decided from the graph state.
///
/// Each running workflow gets one driving loop, woken by task completions
/// rather than a poll timer. Lifecycle transitions are published on the
/// injected [`EventBroker`] as `workflow_started`, `task_started`,
/// `task_completed`, `task_failed`, `task_skipped`, `workflow_completed`,
/// `workflow_failed`, and `workflow_cancelled` events.
#[derive(Clone)]
pub struct WorkflowEngine {
    workflows: Arc<RwLock<HashMap<Uuid, Arc<WorkflowSlot>>>>,
    executor: Arc<dyn TaskExecutor>,
    broker: Arc<EventBroker>,
    semaphore: Arc<Semaphore>,
    config: Arc<EngineConfig>,
}

impl WorkflowEngine {
    /// Create an engine dispatching through `executor` and reporting on
    /// `broker`.
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        broker: Arc<EventBroker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            workflows: Arc::new(RwLock::new(HashMap::new())),
            executor,
            broker,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            config: Arc::new(config),
        }
    }

    /// Create an empty workflow.
    pub fn create_workflow(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Uuid {
        let workflow = Workflow::new(name, description);
        let id = workflow.id;
        self.workflows.write().insert(
            id,
            Arc::new(WorkflowSlot {
                workflow: RwLock::new(workflow),
                wake: Notify::new(),
            }),
        );
        debug!(workflow_id = %id, "workflow created");
        id
    }

    /// Add a task to a workflow still in [`WorkflowStatus::Created`].
    /// Dependencies must reference existing tasks of the same workflow.
    pub fn add_task(&self, workflow_id: Uuid, spec: TaskSpec) -> CoterieResult<Uuid> {
        let slot = self.slot(workflow_id)?;
        let mut workflow = slot.workflow.write();
        if workflow.status != WorkflowStatus::Created {
            return Err(CoterieError::Workflow(format!(
                "workflow {workflow_id} is already {:?}; tasks must be added before start",
                workflow.status
            )));
        }
        let task = WorkflowTask {
            id: Uuid::new_v4(),
            name: spec.name,
            kind: spec.kind,
            assigned_agent: spec.agent,
            inputs: spec.inputs,
            dependencies: spec.dependencies,
            state: TaskState::Pending,
            result: None,
            error: None,
            retries: 0,
            max_retries: spec.max_retries.unwrap_or(self.config.default_max_retries),
            timeout_ms: spec.timeout_ms.unwrap_or(self.config.default_task_timeout_ms),
            started_at: None,
            finished_at: None,
        };
        workflow.add_task(task)
    }

    /// Start a created workflow. Fails on an unknown id, a non-created
    /// status, or a cyclic dependency graph.
    pub fn start_workflow(&self, workflow_id: Uuid) -> CoterieResult<()> {
        let slot = self.slot(workflow_id)?;
        {
            let mut workflow = slot.workflow.write();
            if workflow.status != WorkflowStatus::Created {
                return Err(CoterieError::Workflow(format!(
                    "workflow {workflow_id} cannot start from {:?}",
                    workflow.status
                )));
            }
            if workflow.has_cycle() {
                return Err(CoterieError::Workflow(format!(
                    "workflow {workflow_id} has a dependency cycle"
                )));
            }
            workflow.status = WorkflowStatus::Running;
            workflow.started_at = Some(Utc::now());
        }

        info!(workflow_id = %workflow_id, "workflow started");
        self.broker
            .emit("workflow_started", json!({ "workflow_id": workflow_id }));

        let engine = self.clone();
        tokio::spawn(async move { engine.drive(workflow_id, slot).await });
        Ok(())
    }

    /// Suspend dispatch of a running workflow. In-flight tasks finish and
    /// are recorded. Returns false unless the workflow was running.
    pub fn pause_workflow(&self, workflow_id: Uuid) -> bool {
        self.transition(workflow_id, WorkflowStatus::Running, WorkflowStatus::Paused)
    }

    /// Resume a paused workflow. Returns false unless it was paused.
    pub fn resume_workflow(&self, workflow_id: Uuid) -> bool {
        self.transition(workflow_id, WorkflowStatus::Paused, WorkflowStatus::Running)
    }

    fn transition(&self, workflow_id: Uuid, from: WorkflowStatus, to: WorkflowStatus) -> bool {
        let Ok(slot) = self.slot(workflow_id) else {
            return false;
        };
        {
            let mut workflow = slot.workflow.write();
            if workflow.status != from {
                return false;
            }
            workflow.status = to;
        }
        info!(workflow_id = %workflow_id, status = ?to, "workflow transition");
        slot.wake.notify_waiters();
        true
    }

    /// Mark a still-pending task skipped, e.g. a branch the caller opted
    /// out of. Dependents can never become ready and are skipped in
    /// cascade by the driving loop, so the workflow still completes.
    pub fn skip_task(&self, workflow_id: Uuid, task_id: Uuid, reason: &str) -> bool {
        let Ok(slot) = self.slot(workflow_id) else {
            return false;
        };
        let skipped = {
            let mut workflow = slot.workflow.write();
            if workflow.status.is_terminal() {
                return false;
            }
            match workflow.tasks.get_mut(&task_id) {
                Some(task) if task.state == TaskState::Pending => {
                    task.skip(reason);
                    true
                }
                _ => false,
            }
        };
        if skipped {
            info!(workflow_id = %workflow_id, task_id = %task_id, reason = %reason, "task skipped");
            self.broker.emit(
                "task_skipped",
                json!({ "workflow_id": workflow_id, "task_id": task_id }),
            );
            slot.wake.notify_waiters();
        }
        skipped
    }

    /// Cancel a running or paused workflow. Further dispatch stops;
    /// in-flight tasks are not aborted and their late results are
    /// discarded.
    pub fn cancel_workflow(&self, workflow_id: Uuid) -> bool {
        let Ok(slot) = self.slot(workflow_id) else {
            return false;
        };
        {
            let mut workflow = slot.workflow.write();
            if !matches!(
                workflow.status,
                WorkflowStatus::Running | WorkflowStatus::Paused
            ) {
                return false;
            }
            workflow.status = WorkflowStatus::Cancelled;
            workflow.completed_at = Some(Utc::now());
        }
        info!(workflow_id = %workflow_id, "workflow cancelled");
        self.broker
            .emit("workflow_cancelled", json!({ "workflow_id": workflow_id }));
        slot.wake.notify_waiters();
        true
    }

    /// Snapshot of a workflow, or `None` for an unknown id.
    pub fn workflow(&self, workflow_id: Uuid) -> Option<Workflow> {
        let slot = self.workflows.read().get(&workflow_id).cloned()?;
        let snapshot = slot.workflow.read().clone();
        Some(snapshot)
    }

    /// Terminal-task fraction of a workflow, or `None` for an unknown id.
    pub fn progress(&self, workflow_id: Uuid) -> Option<f64> {
        let slot = self.workflows.read().get(&workflow_id).cloned()?;
        let progress = slot.workflow.read().progress();
        Some(progress)
    }

    /// Snapshots of every known workflow.
    pub fn workflows(&self) -> Vec<Workflow> {
        let slots: Vec<Arc<WorkflowSlot>> = self.workflows.read().values().cloned().collect();
        slots.iter().map(|s| s.workflow.read().clone()).collect()
    }

    /// Ids of currently running workflows.
    pub fn running(&self) -> Vec<Uuid> {
        self.workflows()
            .into_iter()
            .filter(|w| w.status == WorkflowStatus::Running)
            .map(|w| w.id)
            .collect()
    }

    /// Wait until the workflow reaches a terminal status, returning it.
    /// `None` for an unknown id. Waits forever on a workflow that is never
    /// started or resumed.
    pub async fn wait(&self, workflow_id: Uuid) -> Option<WorkflowStatus> {
        let slot = self.workflows.read().get(&workflow_id).cloned()?;
        loop {
            let wake = slot.wake.notified();
            let status = slot.workflow.read().status;
            if status.is_terminal() {
                return Some(status);
            }
            wake.await;
        }
    }

    fn slot(&self, workflow_id: Uuid) -> CoterieResult<Arc<WorkflowSlot>> {
        self.workflows
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| CoterieError::Workflow(format!("unknown workflow {workflow_id}")))
    }

    /// The driving loop: one per running workflow. Wakes on completions,
    /// cascades skips, dispatches the ready set, and decides termination.
    async fn drive(&self, workflow_id: Uuid, slot: Arc<WorkflowSlot>) {
        loop {
            // Register interest before inspecting state, so a completion
            // arriving between the check and the await is not lost.
            let wake = slot.wake.notified();
            let mut events: Vec<(&'static str, serde_json::Value)> = Vec::new();

            let step = {
                let mut workflow = slot.workflow.write();
                match workflow.status {
                    WorkflowStatus::Running => Self::plan_step(&mut workflow, &mut events),
                    WorkflowStatus::Paused => Step::Wait,
                    _ => Step::Finished,
                }
            };

            for (event_type, data) in events {
                self.broker.emit(event_type, data);
            }

            match step {
                Step::Dispatch(items) => {
                    for item in items {
                        let engine = self.clone();
                        let slot = Arc::clone(&slot);
                        tokio::spawn(async move {
                            engine.exec_task(workflow_id, slot, item).await;
                        });
                    }
                }
                Step::Wait => wake.await,
                Step::Finished => {
                    slot.wake.notify_waiters();
                    break;
                }
            }
        }
        debug!(workflow_id = %workflow_id, "workflow driving loop finished");
    }

    /// Decide the next step for a running workflow, mutating task states
    /// for cascaded skips and dispatch marking. Termination events are
    /// collected for emission outside the lock.
    fn plan_step(
        workflow: &mut Workflow,
        events: &mut Vec<(&'static str, serde_json::Value)>,
    ) -> Step {
        // Skips propagate: a task behind a skipped dependency can never
        // become ready, so it is skipped in turn.
        loop {
            let skippable = workflow.cascade_skippable();
            if skippable.is_empty() {
                break;
            }
            for task_id in skippable {
                if let Some(task) = workflow.tasks.get_mut(&task_id) {
                    task.skip("dependency skipped");
                    events.push((
                        "task_skipped",
                        json!({ "workflow_id": workflow.id, "task_id": task_id }),
                    ));
                }
            }
        }

        let ready = workflow.ready_tasks();
        if !ready.is_empty() {
            let mut items = Vec::with_capacity(ready.len());
            for task_id in ready {
                let mut inputs = match workflow.tasks.get(&task_id) {
                    Some(task) => task.inputs.clone(),
                    None => continue,
                };
                // Dependency results become named inputs of the dependent.
                let deps = workflow
                    .tasks
                    .get(&task_id)
                    .map(|t| t.dependencies.clone())
                    .unwrap_or_default();
                for dep_id in deps {
                    if let Some(result) = workflow.tasks.get(&dep_id).and_then(|d| d.result.clone())
                    {
                        inputs.insert(format!("dep_{dep_id}"), result);
                    }
                }
                if let Some(task) = workflow.tasks.get_mut(&task_id) {
                    task.start();
                    items.push(DispatchItem {
                        task_id,
                        agent: task.assigned_agent.clone(),
                        payload: TaskPayload {
                            kind: task.kind.clone(),
                            inputs,
                        },
                        timeout_ms: task.timeout_ms,
                    });
                    events.push((
                        "task_started",
                        json!({
                            "workflow_id": workflow.id,
                            "task_id": task_id,
                            "agent": task.assigned_agent,
                        }),
                    ));
                }
            }
            return Step::Dispatch(items);
        }

        if workflow.running_count() > 0 {
            return Step::Wait;
        }

        if workflow.is_complete() {
            workflow.status = WorkflowStatus::Completed;
            workflow.completed_at = Some(Utc::now());
            info!(workflow_id = %workflow.id, "workflow completed");
            events.push((
                "workflow_completed",
                json!({ "workflow_id": workflow.id, "progress": workflow.progress() }),
            ));
            return Step::Finished;
        }

        // Nothing ready, nothing running, not complete: a task exhausted
        // its retries, or the graph is wedged on failed dependencies.
        let reason = match workflow.first_failure() {
            Some(task) => format!(
                "task '{}' failed after {} retries: {}",
                task.name,
                task.retries,
                task.error.as_deref().unwrap_or("unknown error")
            ),
            None => "dependency deadlock: pending tasks with unmet dependencies".to_string(),
        };
        warn!(workflow_id = %workflow.id, reason = %reason, "workflow failed");
        workflow.status = WorkflowStatus::Failed;
        workflow.completed_at = Some(Utc::now());
        workflow
            .metadata
            .insert("failure_reason".to_string(), json!(reason));
        events.push((
            "workflow_failed",
            json!({ "workflow_id": workflow.id, "reason": reason }),
        ));
        Step::Finished
    }

    /// Execute one dispatched task and record its outcome.
    async fn exec_task(&self, workflow_id: Uuid, slot: Arc<WorkflowSlot>, item: DispatchItem) {
        let result = {
            let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                return;
            };
            match tokio::time::timeout(
                Duration::from_millis(item.timeout_ms),
                self.executor.execute(&item.agent, item.payload),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(CoterieError::Timeout(item.timeout_ms)),
            }
        };

        let mut events: Vec<(&'static str, serde_json::Value)> = Vec::new();
        {
            let mut workflow = slot.workflow.write();
            // A cancelled or failed workflow ignores stragglers.
            if !matches!(
                workflow.status,
                WorkflowStatus::Running | WorkflowStatus::Paused
            ) {
                debug!(workflow_id = %workflow_id, task_id = %item.task_id, "late completion ignored");
                return;
            }
            let Some(task) = workflow.tasks.get_mut(&item.task_id) else {
                return;
            };
            match result {
                Ok(value) => {
                    debug!(workflow_id = %workflow_id, task_id = %item.task_id, "task completed");
                    task.complete(value);
                    events.push((
                        "task_completed",
                        json!({ "workflow_id": workflow_id, "task_id": item.task_id }),
                    ));
                }
                Err(e) => {
                    let will_retry = task.can_retry();
                    events.push((
                        "task_failed",
                        json!({
                            "workflow_id": workflow_id,
                            "task_id": item.task_id,
                            "error": e.to_string(),
                            "will_retry": will_retry,
                        }),
                    ));
                    if will_retry {
                        debug!(workflow_id = %workflow_id, task_id = %item.task_id, error = %e, "task failed, retrying");
                        task.retry();
                    } else {
                        warn!(workflow_id = %workflow_id, task_id = %item.task_id, error = %e, "task failed, retries exhausted");
                        task.fail(e.to_string());
                    }
                }
            }
        }

        for (event_type, data) in events {
            self.broker.emit(event_type, data);
        }
        slot.wake.notify_waiters();
    }
}
