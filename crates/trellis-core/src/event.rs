/// Lifecycle events published by workflows and networks.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A workflow run started.
    RunStarted { workflow_id: String, run_id: String },
    /// A step is about to execute.
    StepStarted { run_id: String, step_id: String },
    /// A step finished successfully.
    StepCompleted {
        run_id: String,
        step_id: String,
        elapsed_ms: u64,
    },
    /// A branch stage evaluated its predicates.
    BranchEvaluated {
        run_id: String,
        stage: usize,
        matched: Vec<String>,
    },
    /// A workflow run completed.
    RunCompleted {
        workflow_id: String,
        run_id: String,
        elapsed_ms: u64,
    },
    /// A workflow run failed.
    RunFailed {
        workflow_id: String,
        run_id: String,
        error: String,
    },
    /// A network picked a target for a task.
    RouteSelected { network_id: String, target: String },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
