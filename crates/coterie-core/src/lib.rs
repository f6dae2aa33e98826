//! Core types and error definitions for the Coterie orchestration framework.
//!
//! This crate provides the foundational types shared across all Coterie
//! crates: the unified error enum, the bus message model, and the task
//! payload handed to agents.
//!
//! # Main types
//!
//! - [`CoterieError`] — Unified error enum for all Coterie subsystems.
//! - [`CoterieResult`] — Convenience alias for `Result<T, CoterieError>`.
//! - [`BusMessage`] — A participant-addressed message carried by the bus.
//! - [`MessageKind`] / [`MessagePriority`] — Message classification tags.
//! - [`TaskPayload`] — The unit of work handed to an agent.

/// Bus message model and classification tags.
pub mod message;
/// Task payload and priority types.
pub mod task;

pub use message::{BusMessage, MessageKind, MessagePriority, BROADCAST};
pub use task::{TaskPayload, TaskPriority};

// --- Error types ---

/// Top-level error type for the Coterie framework.
///
/// Each variant corresponds to a subsystem or failure class. The
/// orchestration layers rely on the distinction between
/// [`CoterieError::CapabilityMismatch`] (fatal, never retried),
/// [`CoterieError::Unavailable`] (circuit open, fail fast), and the
/// transient variants that are retried up to a per-task bound.
#[derive(Debug, thiserror::Error)]
pub enum CoterieError {
    /// A transient execution failure raised by an agent call.
    #[error("Agent error: {0}")]
    Agent(String),

    /// No registered agent advertises the requested task kind.
    #[error("No capable agent for task kind '{0}'")]
    CapabilityMismatch(String),

    /// The dependency is behind an open circuit breaker. Distinct from
    /// [`CoterieError::Agent`] so callers can tell an outage from a defect.
    #[error("'{0}' temporarily unavailable (circuit open)")]
    Unavailable(String),

    /// An agent call exceeded its execution timeout.
    #[error("Task timed out after {0}ms")]
    Timeout(u64),

    /// An error from the message bus or event broker.
    #[error("Bus error: {0}")]
    Bus(String),

    /// An error from the task coordinator.
    #[error("Coordinator error: {0}")]
    Coordinator(String),

    /// An error from the workflow engine or orchestrator.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`CoterieError`].
pub type CoterieResult<T> = Result<T, CoterieError>;

impl CoterieError {
    /// Whether this error class is worth retrying.
    ///
    /// Capability mismatches and configuration errors will not succeed on a
    /// second attempt; agent failures and timeouts might.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoterieError::Agent(_) | CoterieError::Timeout(_) | CoterieError::Unavailable(_)
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoterieError::CapabilityMismatch("code_generation".into());
        assert_eq!(
            err.to_string(),
            "No capable agent for task kind 'code_generation'"
        );

        let err = CoterieError::Unavailable("claude".into());
        assert!(err.to_string().contains("circuit open"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(CoterieError::Agent("boom".into()).is_transient());
        assert!(CoterieError::Timeout(500).is_transient());
        assert!(!CoterieError::CapabilityMismatch("x".into()).is_transient());
        assert!(!CoterieError::Config("bad".into()).is_transient());
    }
}
