use crate::engine::WorkflowEngine;
use crate::workflow::{TaskSpec, WorkflowStatus};
use coterie_core::{CoterieError, CoterieResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

/// One task definition inside a [`WorkflowTemplate`]. Dependencies refer
/// to earlier tasks of the same template by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateTask {
    /// Task name; `{param}` placeholders are substituted at instantiation.
    pub name: String,
    /// Capability tag.
    pub kind: String,
    /// Name of the agent to assign.
    pub agent: String,
    /// Input templates; string values get placeholder substitution.
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
    /// Names of earlier template tasks this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// A reusable, parameterized workflow shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Template name, also the registry key.
    pub name: String,
    /// Workflow description template.
    #[serde(default)]
    pub description: String,
    /// Ordered task definitions.
    pub tasks: Vec<TemplateTask>,
}

/// One phase of a multi-party collaboration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationPhase {
    /// Phase name.
    pub name: String,
    /// Free-form description handed to participants.
    #[serde(default)]
    pub description: String,
    /// Capability tag of the phase's tasks.
    #[serde(default = "default_phase_kind")]
    pub task_kind: String,
    /// Restrict the phase to a subset of the collaboration's
    /// participants; `None` means everyone takes part.
    #[serde(default)]
    pub participants: Option<Vec<String>>,
    /// Extra inputs merged into every task of the phase.
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,
}

fn default_phase_kind() -> String {
    "collaboration".to_string()
}

/// Aggregate orchestration report.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationStats {
    /// Workflows known to the engine.
    pub total_workflows: usize,
    /// Workflows that completed.
    pub completed_workflows: usize,
    /// Workflows that failed.
    pub failed_workflows: usize,
    /// Workflows currently running.
    pub running_workflows: usize,
    /// Completed over total, 0 when no workflow exists.
    pub success_rate: f64,
    /// Registered templates.
    pub template_count: usize,
}

/// Builds workflows from registered templates and from multi-party
/// collaboration descriptions, on top of a [`WorkflowEngine`].
pub struct TaskOrchestrator {
    engine: WorkflowEngine,
    templates: RwLock<HashMap<String, WorkflowTemplate>>,
}

impl TaskOrchestrator {
    /// Create an orchestrator over the given engine.
    pub fn new(engine: WorkflowEngine) -> Self {
        Self {
            engine,
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// The underlying engine, for starting and inspecting built workflows.
    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Register a template. Dependencies are validated here: every entry
    /// must name an earlier task in the same template, so instantiation
    /// cannot fail on wiring.
    pub fn register_template(&self, template: WorkflowTemplate) -> CoterieResult<()> {
        let mut seen: Vec<&str> = Vec::with_capacity(template.tasks.len());
        for task in &template.tasks {
            for dep in &task.dependencies {
                if !seen.contains(&dep.as_str()) {
                    return Err(CoterieError::Workflow(format!(
                        "template '{}': task '{}' depends on '{dep}', which is not an earlier task",
                        template.name, task.name
                    )));
                }
            }
            seen.push(&task.name);
        }
        info!(template = %template.name, tasks = template.tasks.len(), "template registered");
        self.templates
            .write()
            .insert(template.name.clone(), template);
        Ok(())
    }

    /// Names of all registered templates.
    pub fn template_names(&self) -> Vec<String> {
        self.templates.read().keys().cloned().collect()
    }

    /// Instantiate a template into a concrete workflow, substituting
    /// `{param}` placeholders into names, descriptions, and string inputs.
    /// Returns `None` for an unknown template name.
    pub fn create_workflow_from_template(
        &self,
        template_name: &str,
        parameters: &HashMap<String, String>,
    ) -> Option<Uuid> {
        let template = self.templates.read().get(template_name).cloned()?;

        let workflow_id = self.engine.create_workflow(
            substitute(&template.name, parameters),
            substitute(&template.description, parameters),
        );

        let mut ids_by_name: HashMap<&str, Uuid> = HashMap::new();
        for task in &template.tasks {
            let inputs = task
                .inputs
                .iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, parameters)))
                .collect();
            let dependencies = task
                .dependencies
                .iter()
                .filter_map(|dep| ids_by_name.get(dep.as_str()).copied())
                .collect();
            let spec = TaskSpec::new(substitute(&task.name, parameters), &task.kind, &task.agent)
                .with_inputs(inputs)
                .with_dependencies(dependencies);
            match self.engine.add_task(workflow_id, spec) {
                Ok(id) => {
                    ids_by_name.insert(&task.name, id);
                }
                Err(e) => {
                    // Unreachable for a validated template.
                    warn!(template = %template_name, task = %task.name, error = %e, "template task rejected");
                    return None;
                }
            }
        }

        info!(template = %template_name, workflow_id = %workflow_id, "workflow instantiated from template");
        Some(workflow_id)
    }

    /// Build a collaboration workflow: each ordered phase fans out one
    /// task per eligible participant, and every task of phase *k+1*
    /// depends on all tasks of phase *k* — strict phase ordering with
    /// intra-phase parallelism.
    pub fn orchestrate_collaboration(
        &self,
        participants: &[String],
        objective: &str,
        phases: &[CollaborationPhase],
    ) -> CoterieResult<Uuid> {
        let workflow_id = self.engine.create_workflow(
            format!("Collaboration: {objective}"),
            format!("Collaborative workflow with {} participants", participants.len()),
        );

        let mut previous_phase: Vec<Uuid> = Vec::new();
        for (index, phase) in phases.iter().enumerate() {
            let eligible: Vec<&String> = participants
                .iter()
                .filter(|p| {
                    phase
                        .participants
                        .as_ref()
                        .map_or(true, |subset| subset.contains(*p))
                })
                .collect();

            let mut phase_tasks = Vec::with_capacity(eligible.len());
            for participant in eligible {
                let mut spec = TaskSpec::new(
                    format!("Phase {}: {} ({participant})", index + 1, phase.name),
                    &phase.task_kind,
                    participant,
                )
                .with_input("phase_name", json!(phase.name))
                .with_input("phase_description", json!(phase.description))
                .with_input("objective", json!(objective))
                .with_input("participants", json!(participants))
                .with_dependencies(previous_phase.clone());
                for (key, value) in &phase.inputs {
                    spec = spec.with_input(key.clone(), value.clone());
                }
                phase_tasks.push(self.engine.add_task(workflow_id, spec)?);
            }
            if !phase_tasks.is_empty() {
                previous_phase = phase_tasks;
            }
        }

        info!(workflow_id = %workflow_id, phases = phases.len(), "collaboration workflow built");
        Ok(workflow_id)
    }

    /// Aggregate workflow and template counts.
    pub fn statistics(&self) -> OrchestrationStats {
        let workflows = self.engine.workflows();
        let total = workflows.len();
        let completed = workflows
            .iter()
            .filter(|w| w.status == WorkflowStatus::Completed)
            .count();
        let failed = workflows
            .iter()
            .filter(|w| w.status == WorkflowStatus::Failed)
            .count();
        let running = workflows
            .iter()
            .filter(|w| w.status == WorkflowStatus::Running)
            .count();
        OrchestrationStats {
            total_workflows: total,
            completed_workflows: completed,
            failed_workflows: failed,
            running_workflows: running,
            success_rate: if total == 0 {
                0.0
            } else {
                completed as f64 / total as f64
            },
            template_count: self.templates.read().len(),
        }
    }
}

/// Replace `{key}` placeholders with parameter values.
fn substitute(text: &str, parameters: &HashMap<String, String>) -> String {
    let mut out = text.to_string();
    for (key, value) in parameters {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Substitute placeholders in string values; other JSON shapes pass
/// through untouched.
fn substitute_value(
    value: &serde_json::Value,
    parameters: &HashMap<String, String>,
) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(substitute(s, parameters)),
        other => other.clone(),
    }
}
