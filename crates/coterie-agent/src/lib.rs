//! Agent capability interface and failure isolation for Coterie.
//!
//! Concrete agents (external model personas, CLI wrappers, local daemons)
//! live outside the orchestration core; this crate defines the seam they
//! implement and the circuit breaker that guards every outbound call to
//! them.
//!
//! # Main types
//!
//! - [`Agent`] — Trait for anything that can process a task payload.
//! - [`AgentStatus`] — Snapshot returned by an agent's status query.
//! - [`TaskExecutor`] — Name-addressed dispatch seam used by the workflow
//!   engine.
//! - [`CircuitBreaker`] — Guards a failing dependency behind a cooldown.

/// Agent capability trait and status types.
pub mod agent;
/// Circuit breaker guarding unreliable dependencies.
pub mod breaker;
/// Name-addressed task dispatch seam.
pub mod executor;

pub use agent::{Agent, AgentStatus};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use executor::TaskExecutor;
