//! Two mock personas collaborate through the full orchestration stack.
//!
//! Run with: `cargo run --example collaboration`

use async_trait::async_trait;
use coterie_agent::Agent;
use coterie_bus::{EventBroker, MessageBus, MessageFilter};
use coterie_coordinator::TaskCoordinator;
use coterie_core::{CoterieResult, MessageKind, TaskPayload};
use coterie_orchestrator::{
    CollaborationPhase, OrchestrationConfig, TaskOrchestrator, WorkflowEngine,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// A stand-in for an externally hosted model persona.
struct Persona {
    name: String,
    flavor: String,
}

#[async_trait]
impl Agent for Persona {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["collaboration".to_string()]
    }

    async fn process(&self, payload: TaskPayload) -> CoterieResult<serde_json::Value> {
        let phase = payload.inputs.get("phase_name").cloned().unwrap_or_default();
        Ok(json!({
            "from": self.name,
            "phase": phase,
            "take": format!("{} perspective on the objective", self.flavor),
        }))
    }
}

#[tokio::main]
async fn main() -> CoterieResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = OrchestrationConfig::default();

    let bus = MessageBus::start(config.bus);
    let broker = Arc::new(EventBroker::new());
    let coordinator = TaskCoordinator::new(config.coordinator).with_bus(bus.clone());
    coordinator.register_agent(Arc::new(Persona {
        name: "claude".to_string(),
        flavor: "implementation-first".to_string(),
    }));
    coordinator.register_agent(Arc::new(Persona {
        name: "qwen".to_string(),
        flavor: "strategy-first".to_string(),
    }));

    broker.subscribe("task_completed", |event| {
        println!("event: task completed: {}", event.data);
    });

    let engine = WorkflowEngine::new(
        Arc::new(coordinator.clone()),
        Arc::clone(&broker),
        config.engine,
    );
    let orchestrator = TaskOrchestrator::new(engine);

    let participants = vec!["claude".to_string(), "qwen".to_string()];
    let phases = vec![
        CollaborationPhase {
            name: "analyze".to_string(),
            description: "each participant analyzes independently".to_string(),
            task_kind: "collaboration".to_string(),
            participants: None,
            inputs: HashMap::new(),
        },
        CollaborationPhase {
            name: "synthesize".to_string(),
            description: "combine both analyses".to_string(),
            task_kind: "collaboration".to_string(),
            participants: Some(vec!["claude".to_string()]),
            inputs: HashMap::new(),
        },
    ];

    let workflow_id =
        orchestrator.orchestrate_collaboration(&participants, "plan a knowledge store", &phases)?;
    orchestrator.engine().start_workflow(workflow_id)?;

    let status = orchestrator.engine().wait(workflow_id).await;
    println!("workflow finished: {status:?}");

    let workflow = orchestrator
        .engine()
        .workflow(workflow_id)
        .expect("workflow exists");
    for task in workflow.tasks.values() {
        println!("  {} [{}] -> {:?}", task.name, task.assigned_agent, task.state);
    }

    // A directly submitted task, load-balanced by the coordinator; its
    // terminal transition lands on the bus as a status update.
    let task_id = coordinator.submit_task(coterie_coordinator::TaskRequest::new(
        TaskPayload::new("collaboration").with_input("note", json!("direct submission")),
    ));
    loop {
        match coordinator.task(task_id) {
            Some(task) if task.status.is_terminal() => {
                println!("direct task finished as {:?}", task.status);
                break;
            }
            _ => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
        }
    }

    bus.flush().await?;
    let updates = bus.history(&MessageFilter::new().of_kind(MessageKind::StatusUpdate));
    println!("status updates on the bus: {}", updates.len());
    println!("system status: {}", json!(coordinator.system_status()));

    Ok(())
}
