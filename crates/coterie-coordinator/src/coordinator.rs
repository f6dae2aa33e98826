use crate::registry::{AgentLoad, AgentPerformance, AgentRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coterie_agent::{Agent, BreakerConfig, CircuitBreaker, TaskExecutor};
use coterie_bus::MessageBus;
use coterie_core::{
    CoterieError, CoterieResult, MessageKind, TaskPayload, TaskPriority, BROADCAST,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for the [`TaskCoordinator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Concurrent task executions.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Retry bound applied when a submission does not specify one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Execution timeout applied when a submission does not specify one.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Trailing window for load accounting.
    #[serde(default = "default_load_window_secs")]
    pub load_window_secs: u64,
    /// Outcome count that maps to a load factor of 1.0.
    #[serde(default = "default_load_normalization")]
    pub load_normalization: u32,
    /// Terminal tasks retained for status queries; oldest evicted first.
    #[serde(default = "default_completed_capacity")]
    pub completed_capacity: usize,
    /// Breaker settings applied to every registered agent.
    #[serde(default)]
    pub breaker: BreakerConfig,
}

fn default_max_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_load_window_secs() -> u64 {
    3_600
}

fn default_load_normalization() -> u32 {
    10
}

fn default_completed_capacity() -> usize {
    1_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            default_max_retries: default_max_retries(),
            default_timeout_ms: default_timeout_ms(),
            load_window_secs: default_load_window_secs(),
            load_normalization: default_load_normalization(),
            completed_capacity: default_completed_capacity(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Lifecycle state of a coordinator-level task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Pending,
    /// Dispatched to an agent.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Exhausted retries or failed fatally.
    Failed,
    /// Cancelled while still pending.
    Cancelled,
}

impl TaskStatus {
    /// Whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Submission parameters for [`TaskCoordinator::submit_task`].
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// The work to perform.
    pub payload: TaskPayload,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Retry bound; the config default applies when `None`.
    pub max_retries: Option<u32>,
    /// Execution timeout; the config default applies when `None`.
    pub timeout_ms: Option<u64>,
}

impl TaskRequest {
    /// A request with default priority, retries, and timeout.
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            payload,
            priority: TaskPriority::default(),
            max_retries: None,
            timeout_ms: None,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
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

/// A coordinator-level unit of work, from submission to archive.
#[derive(Debug, Clone, Serialize)]
pub struct TaskWrapper {
    /// Task id.
    pub id: Uuid,
    /// The submitted payload.
    pub payload: TaskPayload,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// The agent the task is or was assigned to.
    pub assigned_agent: Option<String>,
    /// Retries consumed so far.
    pub retries: u32,
    /// Retry bound.
    pub max_retries: u32,
    /// Execution timeout per attempt.
    pub timeout_ms: u64,
    /// Submission timestamp.
    pub submitted_at: DateTime<Utc>,
    /// Timestamp of reaching a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// The agent's result, when completed.
    pub result: Option<serde_json::Value>,
    /// Failure detail, when failed.
    pub error: Option<String>,
}

/// Aggregate coordinator status report.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    /// Per-agent load snapshots.
    pub agents: Vec<AgentLoad>,
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Tasks currently dispatched.
    pub active: usize,
    /// Terminal tasks processed since construction.
    pub completed: u64,
}

struct TaskTable {
    active: HashMap<Uuid, TaskWrapper>,
    archived: VecDeque<TaskWrapper>,
    terminal_total: u64,
}

impl TaskTable {
    fn archive(&mut self, task: TaskWrapper, capacity: usize) {
        self.terminal_total += 1;
        if self.archived.len() >= capacity {
            self.archived.pop_front();
        }
        self.archived.push_back(task);
    }

    /// Move an active task into the archive with a terminal status applied.
    fn finish(
        &mut self,
        id: Uuid,
        capacity: usize,
        apply: impl FnOnce(&mut TaskWrapper),
    ) -> Option<TaskWrapper> {
        let mut task = self.active.remove(&id)?;
        apply(&mut task);
        task.completed_at = Some(Utc::now());
        self.archive(task.clone(), capacity);
        Some(task)
    }
}

/// Assigns submitted tasks to the least-loaded capable agent, retries
/// transient failures, and tracks lifecycle.
///
/// Every agent call runs under that agent's circuit breaker and the task's
/// execution timeout, on a bounded worker pool. A capability mismatch fails
/// the task immediately without retry; transient failures are retried up to
/// the task's bound. An in-progress task cannot be cancelled — only pending
/// ones — a documented limitation of this model.
///
/// Cloning is cheap and shares all state, so the coordinator can be handed
/// to the workflow engine as its [`TaskExecutor`]. Submission spawns onto
/// the ambient tokio runtime.
#[derive(Clone)]
pub struct TaskCoordinator {
    registry: Arc<Mutex<AgentRegistry>>,
    tasks: Arc<Mutex<TaskTable>>,
    semaphore: Arc<Semaphore>,
    bus: Option<MessageBus>,
    config: Arc<CoordinatorConfig>,
}

impl TaskCoordinator {
    /// Create a coordinator with the given configuration.
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(AgentRegistry::new())),
            tasks: Arc::new(Mutex::new(TaskTable {
                active: HashMap::new(),
                archived: VecDeque::new(),
                terminal_total: 0,
            })),
            semaphore: Arc::new(Semaphore::new(config.max_workers.max(1))),
            bus: None,
            config: Arc::new(config),
        }
    }

    /// Attach a message bus; terminal task transitions publish
    /// [`MessageKind::StatusUpdate`] broadcasts on it.
    pub fn with_bus(mut self, bus: MessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    fn load_window(&self) -> Duration {
        Duration::from_secs(self.config.load_window_secs)
    }

    /// Register an agent, replacing any prior registration with the same
    /// name.
    pub fn register_agent(&self, agent: Arc<dyn Agent>) {
        self.registry
            .lock()
            .register(agent, self.config.breaker.clone());
    }

    /// Flip an agent's availability. Returns false for an unknown agent.
    pub fn set_availability(&self, name: &str, available: bool) -> bool {
        self.registry.lock().set_availability(name, available)
    }

    /// Submit a task. A capability mismatch fails it on the spot; otherwise
    /// it queues for the worker pool. The returned id works with
    /// [`TaskCoordinator::task`] and [`TaskCoordinator::cancel_task`].
    pub fn submit_task(&self, request: TaskRequest) -> Uuid {
        let task = TaskWrapper {
            id: Uuid::new_v4(),
            payload: request.payload,
            priority: request.priority,
            status: TaskStatus::Pending,
            assigned_agent: None,
            retries: 0,
            max_retries: request.max_retries.unwrap_or(self.config.default_max_retries),
            timeout_ms: request.timeout_ms.unwrap_or(self.config.default_timeout_ms),
            submitted_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        };
        let id = task.id;
        debug!(task_id = %id, kind = %task.payload.kind, "task submitted");
        self.tasks.lock().active.insert(id, task);
        self.schedule(id);
        id
    }

    /// Cancel a still-pending task. In-progress tasks are not cancellable
    /// in this model; the call returns false and logs the refusal.
    pub fn cancel_task(&self, id: Uuid) -> bool {
        let cancelled = {
            let mut tasks = self.tasks.lock();
            match tasks.active.get(&id).map(|t| t.status) {
                Some(TaskStatus::Pending) => tasks.finish(id, self.config.completed_capacity, |t| {
                    t.status = TaskStatus::Cancelled;
                }),
                Some(TaskStatus::InProgress) => {
                    warn!(task_id = %id, "cannot cancel a task that is already in progress");
                    None
                }
                _ => None,
            }
        };
        if let Some(task) = cancelled {
            info!(task_id = %id, "task cancelled");
            self.notify_status(&task);
            return true;
        }
        false
    }

    /// Look up a task, active or archived.
    pub fn task(&self, id: Uuid) -> Option<TaskWrapper> {
        let tasks = self.tasks.lock();
        tasks
            .active
            .get(&id)
            .cloned()
            .or_else(|| tasks.archived.iter().find(|t| t.id == id).cloned())
    }

    /// Aggregate status: per-agent load plus queued/active/completed counts.
    pub fn system_status(&self) -> SystemStatus {
        let (queued, active, completed) = {
            let tasks = self.tasks.lock();
            let queued = tasks
                .active
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .count();
            let active = tasks
                .active
                .values()
                .filter(|t| t.status == TaskStatus::InProgress)
                .count();
            (queued, active, tasks.terminal_total)
        };
        let agents = self
            .registry
            .lock()
            .loads(self.load_window(), self.config.load_normalization);
        SystemStatus {
            agents,
            queued,
            active,
            completed,
        }
    }

    /// Performance report for one agent, or `None` if unknown.
    pub fn agent_performance(&self, name: &str) -> Option<AgentPerformance> {
        let window = self.load_window();
        let normalization = self.config.load_normalization;
        let mut registry = self.registry.lock();
        let entry = registry.get_mut(name)?;
        Some(AgentPerformance {
            name: entry.name.clone(),
            tasks_completed: entry.completed_total,
            recent_outcomes: entry.recent_outcomes(window),
            load_factor: entry.load_factor(window, normalization),
            available: entry.available,
        })
    }

    /// Queue one pending task for dispatch, failing it up front when no
    /// registered agent can ever take it.
    fn schedule(&self, id: Uuid) {
        let kind = {
            let tasks = self.tasks.lock();
            match tasks.active.get(&id) {
                Some(task) if task.status == TaskStatus::Pending => task.payload.kind.clone(),
                _ => return,
            }
        };

        // Capability mismatch is not transient: fail without queueing.
        if !self.registry.lock().has_capable(&kind) {
            warn!(task_id = %id, kind = %kind, "no capable agent, task failed");
            self.fail_task(id, &CoterieError::CapabilityMismatch(kind));
            return;
        }

        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.dispatch(id).await });
    }

    /// Worker body: wait for a permit, pick the least-loaded capable agent,
    /// run the task, and record the outcome.
    async fn dispatch(&self, id: Uuid) {
        let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return;
        };

        // The task may have been cancelled while it waited for a worker.
        let Some(kind) = self.kind_of(id) else {
            return;
        };

        let selected = {
            let mut registry = self.registry.lock();
            registry
                .select(&kind, self.load_window(), self.config.load_normalization)
                .map(|entry| {
                    (
                        entry.name.clone(),
                        Arc::clone(&entry.agent),
                        Arc::clone(&entry.breaker),
                    )
                })
        };

        let Some((agent_name, agent, breaker)) = selected else {
            // Availability changed while the task waited for a worker.
            warn!(task_id = %id, kind = %kind, "no capable agent at dispatch, task failed");
            self.fail_task(id, &CoterieError::CapabilityMismatch(kind));
            return;
        };

        let (payload, timeout_ms) = {
            let mut tasks = self.tasks.lock();
            // Re-check: the task may have been cancelled while queued.
            match tasks.active.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    task.status = TaskStatus::InProgress;
                    task.assigned_agent = Some(agent_name.clone());
                    (task.payload.clone(), task.timeout_ms)
                }
                _ => return,
            }
        };

        debug!(task_id = %id, agent = %agent_name, "task dispatched");
        let result = self
            .run_on_agent(&agent_name, agent, breaker, payload, timeout_ms)
            .await;
        self.on_completion(id, result);
    }

    fn kind_of(&self, id: Uuid) -> Option<String> {
        self.tasks
            .lock()
            .active
            .get(&id)
            .map(|t| t.payload.kind.clone())
    }

    fn fail_task(&self, id: Uuid, error: &CoterieError) {
        let failed = {
            let mut tasks = self.tasks.lock();
            tasks.finish(id, self.config.completed_capacity, |t| {
                t.status = TaskStatus::Failed;
                t.error = Some(error.to_string());
            })
        };
        if let Some(task) = failed {
            self.notify_status(&task);
        }
    }

    /// Execute a payload on an agent under its breaker and the given
    /// timeout, recording the outcome for load accounting.
    async fn run_on_agent(
        &self,
        agent_name: &str,
        agent: Arc<dyn Agent>,
        breaker: Arc<CircuitBreaker>,
        payload: TaskPayload,
        timeout_ms: u64,
    ) -> CoterieResult<serde_json::Value> {
        let result = breaker
            .call(|| async {
                match tokio::time::timeout(
                    Duration::from_millis(timeout_ms),
                    agent.process(payload),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(CoterieError::Timeout(timeout_ms)),
                }
            })
            .await;

        // A short-circuited call never reached the agent; it is not an
        // outcome for load purposes.
        let short_circuited = matches!(result, Err(CoterieError::Unavailable(_)));
        if !short_circuited {
            if let Some(entry) = self.registry.lock().get_mut(agent_name) {
                entry.record_outcome(result.is_ok());
            }
        }

        result
    }

    /// Record a finished attempt: archive on success, retry or archive on
    /// failure.
    fn on_completion(&self, id: Uuid, result: CoterieResult<serde_json::Value>) {
        let (terminal, reschedule) = {
            let mut tasks = self.tasks.lock();
            if !tasks.active.contains_key(&id) {
                return;
            }
            match result {
                Ok(value) => {
                    let task = tasks.finish(id, self.config.completed_capacity, |t| {
                        t.status = TaskStatus::Completed;
                        t.result = Some(value);
                    });
                    if let Some(task) = &task {
                        info!(task_id = %id, agent = ?task.assigned_agent, "task completed");
                    }
                    (task, false)
                }
                Err(e) => {
                    let can_retry = tasks
                        .active
                        .get(&id)
                        .map(|t| t.retries < t.max_retries)
                        .unwrap_or(false);
                    if can_retry {
                        if let Some(task) = tasks.active.get_mut(&id) {
                            task.retries += 1;
                            task.status = TaskStatus::Pending;
                            task.assigned_agent = None;
                            debug!(task_id = %id, retry = task.retries, error = %e, "task failed, retrying");
                        }
                        (None, true)
                    } else {
                        warn!(task_id = %id, error = %e, "task failed, retries exhausted");
                        let task = tasks.finish(id, self.config.completed_capacity, |t| {
                            t.status = TaskStatus::Failed;
                            t.error = Some(e.to_string());
                        });
                        (task, false)
                    }
                }
            }
        };

        if let Some(task) = terminal {
            self.notify_status(&task);
        }
        if reschedule {
            self.schedule(id);
        }
    }

    fn notify_status(&self, task: &TaskWrapper) {
        let Some(bus) = &self.bus else { return };
        let content = json!({
            "task_id": task.id,
            "status": task.status,
            "agent": task.assigned_agent,
            "error": task.error,
        });
        if let Err(e) = bus.send("coordinator", BROADCAST, MessageKind::StatusUpdate, content) {
            debug!(error = %e, "status update not published");
        }
    }
}

#[async_trait]
impl TaskExecutor for TaskCoordinator {
    /// Direct, name-addressed execution used by the workflow engine. The
    /// call still runs under the agent's breaker and the default timeout,
    /// and still feeds load accounting.
    async fn execute(
        &self,
        agent_name: &str,
        payload: TaskPayload,
    ) -> CoterieResult<serde_json::Value> {
        let (agent, breaker) = {
            let mut registry = self.registry.lock();
            let entry = registry.get_mut(agent_name).ok_or_else(|| {
                CoterieError::Coordinator(format!("unknown agent '{agent_name}'"))
            })?;
            if !entry.available {
                return Err(CoterieError::Agent(format!(
                    "agent '{agent_name}' is not accepting work"
                )));
            }
            (Arc::clone(&entry.agent), Arc::clone(&entry.breaker))
        };

        let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            return Err(CoterieError::Coordinator("worker pool closed".into()));
        };
        self.run_on_agent(
            agent_name,
            agent,
            breaker,
            payload,
            self.config.default_timeout_ms,
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Configurable test agent: fails the first `fail_first` calls, then
    /// succeeds.
    struct ScriptedAgent {
        name: String,
        capabilities: Vec<String>,
        fail_first: u32,
        calls: AtomicU32,
    }

    impl ScriptedAgent {
        fn new(name: &str, caps: &[&str], fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                capabilities: caps.iter().map(|c| (*c).to_string()).collect(),
                fail_first,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> Vec<String> {
            self.capabilities.clone()
        }

        async fn process(&self, payload: TaskPayload) -> CoterieResult<serde_json::Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(CoterieError::Agent(format!("scripted failure {call}")))
            } else {
                Ok(json!({"agent": self.name, "kind": payload.kind}))
            }
        }
    }

    /// Sleeps before succeeding, to hold a worker busy.
    struct StallingAgent {
        delay_ms: u64,
    }

    #[async_trait]
    impl Agent for StallingAgent {
        fn name(&self) -> &str {
            "slow"
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["slow".to_string()]
        }

        async fn process(&self, _payload: TaskPayload) -> CoterieResult<serde_json::Value> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(json!("done"))
        }
    }

    async fn wait_terminal(coordinator: &TaskCoordinator, id: Uuid) -> TaskWrapper {
        for _ in 0..400 {
            if let Some(task) = coordinator.task(id) {
                if task.status.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} did not reach a terminal state");
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let coordinator = TaskCoordinator::new(CoordinatorConfig::default());
        coordinator.register_agent(ScriptedAgent::new("coder", &["code"], 0));

        let id = coordinator.submit_task(
            TaskRequest::new(TaskPayload::new("code")).with_priority(TaskPriority::High),
        );
        let task = wait_terminal(&coordinator, id).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.assigned_agent.as_deref(), Some("coder"));
        assert_eq!(task.result.unwrap()["agent"], json!("coder"));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_capability_mismatch_fails_immediately_without_retry() {
        let coordinator = TaskCoordinator::new(CoordinatorConfig::default());
        coordinator.register_agent(ScriptedAgent::new("coder", &["code"], 0));

        let id = coordinator.submit_task(TaskRequest::new(TaskPayload::new("astrology")));

        // Failed synchronously, before any worker was involved.
        let task = coordinator.task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retries, 0);
        assert!(task.error.unwrap().contains("No capable agent"));
    }

    #[tokio::test]
    async fn test_unavailable_agent_is_a_capability_mismatch() {
        let coordinator = TaskCoordinator::new(CoordinatorConfig::default());
        coordinator.register_agent(ScriptedAgent::new("coder", &["code"], 0));
        assert!(coordinator.set_availability("coder", false));

        let id = coordinator.submit_task(TaskRequest::new(TaskPayload::new("code")));
        let task = wait_terminal(&coordinator, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let coordinator = TaskCoordinator::new(CoordinatorConfig::default());
        let agent = ScriptedAgent::new("flaky", &["code"], 2);
        coordinator.register_agent(agent.clone());

        let id = coordinator
            .submit_task(TaskRequest::new(TaskPayload::new("code")).with_max_retries(3));
        let task = wait_terminal(&coordinator, id).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retries, 2);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_ends_failed() {
        let coordinator = TaskCoordinator::new(CoordinatorConfig {
            breaker: BreakerConfig {
                failure_threshold: 100,
                recovery_timeout_ms: 60_000,
            },
            ..CoordinatorConfig::default()
        });
        let agent = ScriptedAgent::new("broken", &["code"], u32::MAX);
        coordinator.register_agent(agent.clone());

        let id = coordinator
            .submit_task(TaskRequest::new(TaskPayload::new("code")).with_max_retries(2));
        let task = wait_terminal(&coordinator, id).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retries, 2);
        // Initial attempt plus two retries.
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
        assert!(task.error.unwrap().contains("scripted failure"));
    }

    #[tokio::test]
    async fn test_open_breaker_fails_distinctly() {
        let coordinator = TaskCoordinator::new(CoordinatorConfig {
            breaker: BreakerConfig {
                failure_threshold: 2,
                recovery_timeout_ms: 60_000,
            },
            ..CoordinatorConfig::default()
        });
        let agent = ScriptedAgent::new("down", &["code"], u32::MAX);
        coordinator.register_agent(agent.clone());

        // Two failures open the breaker; remaining retries short-circuit.
        let id = coordinator
            .submit_task(TaskRequest::new(TaskPayload::new("code")).with_max_retries(4));
        let task = wait_terminal(&coordinator, id).await;

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("temporarily unavailable"));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);

        // Direct execution also fails fast with the distinct error.
        let err = coordinator
            .execute("down", TaskPayload::new("code"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoterieError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_load_balanced_assignment() {
        let coordinator = TaskCoordinator::new(CoordinatorConfig::default());
        let first = ScriptedAgent::new("first", &["code"], 0);
        let second = ScriptedAgent::new("second", &["code"], 0);
        coordinator.register_agent(first.clone());
        coordinator.register_agent(second.clone());

        // Sequential submissions alternate between the two agents: each
        // completion raises the assignee's load above the other's.
        for _ in 0..4 {
            let id = coordinator.submit_task(TaskRequest::new(TaskPayload::new("code")));
            wait_terminal(&coordinator, id).await;
        }

        assert_eq!(first.calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let coordinator = TaskCoordinator::new(CoordinatorConfig {
            max_workers: 1,
            ..CoordinatorConfig::default()
        });
        coordinator.register_agent(Arc::new(StallingAgent { delay_ms: 150 }));

        let blocker = coordinator.submit_task(TaskRequest::new(TaskPayload::new("slow")));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The second task waits for the single worker: still pending.
        let queued = coordinator.submit_task(TaskRequest::new(TaskPayload::new("slow")));
        assert_eq!(coordinator.task(queued).unwrap().status, TaskStatus::Pending);

        assert!(coordinator.cancel_task(queued));
        assert_eq!(
            coordinator.task(queued).unwrap().status,
            TaskStatus::Cancelled
        );

        let blocker_task = wait_terminal(&coordinator, blocker).await;
        assert_eq!(blocker_task.status, TaskStatus::Completed);

        // The cancelled task was never dispatched.
        assert_eq!(coordinator.task(queued).unwrap().assigned_agent, None);
    }

    #[tokio::test]
    async fn test_cannot_cancel_in_progress_task() {
        let coordinator = TaskCoordinator::new(CoordinatorConfig::default());
        coordinator.register_agent(Arc::new(StallingAgent { delay_ms: 150 }));

        let id = coordinator.submit_task(TaskRequest::new(TaskPayload::new("slow")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            coordinator.task(id).unwrap().status,
            TaskStatus::InProgress
        );

        assert!(!coordinator.cancel_task(id));
        let task = wait_terminal(&coordinator, id).await;
        assert_eq!(task.status, TaskStatus::Completed);

        // Unknown id.
        assert!(!coordinator.cancel_task(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_system_status_and_performance() {
        let coordinator = TaskCoordinator::new(CoordinatorConfig::default());
        coordinator.register_agent(ScriptedAgent::new("coder", &["code"], 0));

        let id = coordinator.submit_task(TaskRequest::new(TaskPayload::new("code")));
        wait_terminal(&coordinator, id).await;

        let status = coordinator.system_status();
        assert_eq!(status.agents.len(), 1);
        assert_eq!(status.queued, 0);
        assert_eq!(status.active, 0);
        assert_eq!(status.completed, 1);
        assert!(status.agents[0].load_factor > 0.0);

        let perf = coordinator.agent_performance("coder").unwrap();
        assert_eq!(perf.tasks_completed, 1);
        assert_eq!(perf.recent_outcomes, 1);
        assert!(coordinator.agent_performance("nobody").is_none());
    }

    #[tokio::test]
    async fn test_status_updates_published_to_bus() {
        let bus = coterie_bus::MessageBus::start(coterie_bus::BusConfig::default());
        let coordinator =
            TaskCoordinator::new(CoordinatorConfig::default()).with_bus(bus.clone());
        coordinator.register_agent(ScriptedAgent::new("coder", &["code"], 0));

        let id = coordinator.submit_task(TaskRequest::new(TaskPayload::new("code")));
        wait_terminal(&coordinator, id).await;
        bus.flush().await.unwrap();

        let updates = bus.history(
            &coterie_bus::MessageFilter::new()
                .from_sender("coordinator")
                .of_kind(MessageKind::StatusUpdate),
        );
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].content["status"], json!("completed"));
    }

    #[tokio::test]
    async fn test_executor_unknown_agent() {
        let coordinator = TaskCoordinator::new(CoordinatorConfig::default());
        let err = coordinator
            .execute("ghost", TaskPayload::new("code"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoterieError::Coordinator(_)));
    }

    #[tokio::test]
    async fn test_executor_runs_named_agent() {
        let coordinator = TaskCoordinator::new(CoordinatorConfig::default());
        coordinator.register_agent(ScriptedAgent::new("planner", &["planning"], 0));

        let result = coordinator
            .execute("planner", TaskPayload::new("planning"))
            .await
            .unwrap();
        assert_eq!(result["agent"], json!("planner"));

        let perf = coordinator.agent_performance("planner").unwrap();
        assert_eq!(perf.tasks_completed, 1);
    }

    #[test]
    fn test_config_from_toml() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
            max_workers = 8
            default_max_retries = 1

            [breaker]
            failure_threshold = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.default_max_retries, 1);
        assert_eq!(config.breaker.failure_threshold, 5);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.default_timeout_ms, 60_000);
        assert_eq!(config.load_normalization, 10);
    }
}
