use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Scheduling priority of a coordinator-level task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Can wait indefinitely.
    Low,
    /// Default priority.
    Medium,
    /// Should jump ahead of routine work.
    High,
    /// Must be handled as soon as a worker is free.
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

/// The unit of work handed to an agent: a capability tag plus named inputs.
///
/// The core never inspects the inputs; agents interpret them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Capability tag identifying the kind of work.
    pub kind: String,
    /// Named inputs, opaque to the orchestration layer.
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
}

impl TaskPayload {
    /// Creates a payload with no inputs.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            inputs: HashMap::new(),
        }
    }

    /// Adds a named input.
    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    /// Replaces the full input map.
    pub fn with_inputs(mut self, inputs: HashMap<String, serde_json::Value>) -> Self {
        self.inputs = inputs;
        self
    }
}
