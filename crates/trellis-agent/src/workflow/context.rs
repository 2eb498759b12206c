use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EventBus, WorkflowEvent};
use trellis_core::traits::MemoryStore;
use trellis_core::types::SessionId;

use crate::agent::Agent;

/// Per-run state handed to every step.
///
/// Cloning is cheap; clones share the agent registry, memory handle,
/// cancellation token and event bus.
#[derive(Clone)]
pub struct RunContext {
    run_id: String,
    workflow_id: String,
    thread_id: SessionId,
    agents: Arc<HashMap<String, Arc<dyn Agent>>>,
    memory: Option<Arc<dyn MemoryStore>>,
    cancel: CancellationToken,
    events: Option<Arc<EventBus>>,
}

impl RunContext {
    /// A fresh context with a new run id and thread id.
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            thread_id: SessionId::new(),
            agents: Arc::new(HashMap::new()),
            memory: None,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        Arc::make_mut(&mut self.agents).insert(agent.id().to_string(), agent);
        self
    }

    pub(crate) fn with_agents(mut self, agents: Arc<HashMap<String, Arc<dyn Agent>>>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_thread(mut self, thread_id: SessionId) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn thread_id(&self) -> &SessionId {
        &self.thread_id
    }

    /// Look up an agent attached to the owning workflow.
    pub fn agent(&self, id: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .get(id)
            .cloned()
            .ok_or_else(|| TrellisError::AgentNotFound(id.to_string()))
    }

    pub fn memory(&self) -> Option<&Arc<dyn MemoryStore>> {
        self.memory.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn publish(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut agents: Vec<&String> = self.agents.keys().collect();
        agents.sort();
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("workflow_id", &self.workflow_id)
            .field("thread_id", &self.thread_id)
            .field("agents", &agents)
            .field("has_memory", &self.memory.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
