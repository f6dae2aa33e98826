//! Capability- and load-aware task coordination.
//!
//! The coordinator assigns individually submitted units of work to the
//! least-loaded capable agent, retries transient failures up to a per-task
//! bound, wraps every agent call in that agent's circuit breaker, and
//! archives finished tasks for later status queries.
//!
//! # Main types
//!
//! - [`TaskCoordinator`] — Registration, scheduling, retry, and lifecycle.
//! - [`TaskWrapper`] / [`TaskStatus`] — Coordinator-level unit of work.
//! - [`TaskRequest`] — Submission parameters.
//! - [`CoordinatorConfig`] — Worker pool, retry, and load-window tuning.
//! - [`AgentLoad`] / [`AgentPerformance`] — Per-agent reporting.

/// Coordinator, task lifecycle, and scheduling.
pub mod coordinator;
/// Agent registry and load accounting.
pub mod registry;

pub use coordinator::{
    CoordinatorConfig, SystemStatus, TaskCoordinator, TaskRequest, TaskStatus, TaskWrapper,
};
pub use registry::{AgentLoad, AgentPerformance};
