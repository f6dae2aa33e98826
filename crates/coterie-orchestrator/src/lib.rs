//! Dependency-graph workflow execution and high-level orchestration.
//!
//! A [`Workflow`] is a named DAG of agent tasks. The [`WorkflowEngine`]
//! runs one event-driven loop per workflow: ready tasks are dispatched
//! concurrently through a [`coterie_agent::TaskExecutor`], failures are
//! retried up to a per-task bound, and lifecycle events are published on
//! an event broker. The [`TaskOrchestrator`] builds workflows from
//! reusable templates and from multi-party collaboration descriptions.
//!
//! # Main types
//!
//! - [`Workflow`] / [`WorkflowTask`] / [`TaskSpec`] — The graph model.
//! - [`WorkflowEngine`] — Concurrent, retrying, event-driven execution.
//! - [`TaskOrchestrator`] — Template and collaboration builders.
//! - [`OrchestrationConfig`] — TOML-loadable aggregate configuration.

/// Aggregate TOML-loadable configuration.
pub mod config;
/// The workflow engine and its driving loop.
pub mod engine;
/// Template and collaboration orchestration.
pub mod templates;
/// Workflow and task graph model.
pub mod workflow;

pub use config::OrchestrationConfig;
pub use engine::{EngineConfig, WorkflowEngine};
pub use templates::{
    CollaborationPhase, OrchestrationStats, TaskOrchestrator, TemplateTask, WorkflowTemplate,
};
pub use workflow::{TaskSpec, TaskState, Workflow, WorkflowStatus, WorkflowTask};
