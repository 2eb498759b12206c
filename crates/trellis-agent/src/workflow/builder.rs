use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::info;

use trellis_core::error::{FieldIssue, Result, TrellisError};
use trellis_core::event::EventBus;
use trellis_core::schema::{FieldType, Schema};
use trellis_core::traits::MemoryStore;

use super::branch::{BranchArm, Predicate};
use super::step::StepDefinition;
use crate::agent::Agent;

/// One stage of a workflow.
#[derive(Debug, Clone)]
pub(crate) enum Stage {
    Step(Arc<StepDefinition>),
    Branch(Vec<BranchArm>),
}

impl Stage {
    pub(crate) fn steps(&self) -> Vec<&Arc<StepDefinition>> {
        match self {
            Self::Step(step) => vec![step],
            Self::Branch(arms) => arms.iter().map(|a| &a.step).collect(),
        }
    }
}

/// Mutable workflow under construction. Consumed by [`WorkflowBuilder::commit`].
pub struct WorkflowBuilder {
    id: String,
    description: String,
    input_schema: Schema,
    output_schema: Schema,
    stages: Vec<Stage>,
    agents: HashMap<String, Arc<dyn Agent>>,
    memory: Option<Arc<dyn MemoryStore>>,
    events: Option<Arc<EventBus>>,
}

impl WorkflowBuilder {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        input_schema: Schema,
        output_schema: Schema,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            input_schema,
            output_schema,
            stages: Vec::new(),
            agents: HashMap::new(),
            memory: None,
            events: None,
        }
    }

    /// Append a linear stage.
    pub fn then(mut self, step: impl Into<Arc<StepDefinition>>) -> Self {
        self.stages.push(Stage::Step(step.into()));
        self
    }

    /// Append a branch stage of (predicate, step) arms.
    pub fn branch<S>(mut self, arms: Vec<(Predicate, S)>) -> Self
    where
        S: Into<Arc<StepDefinition>>,
    {
        let arms = arms
            .into_iter()
            .map(|(predicate, step)| BranchArm {
                predicate,
                step: step.into(),
            })
            .collect();
        self.stages.push(Stage::Branch(arms));
        self
    }

    /// Make an agent resolvable from steps via `RunContext::agent`.
    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.insert(agent.id().to_string(), agent);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Freeze the workflow, checking its structure and schema chain.
    pub fn commit(self) -> Result<Workflow> {
        if self.stages.is_empty() {
            return Err(TrellisError::Composition(format!(
                "workflow '{}' has no stages",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if let Stage::Branch(arms) = stage {
                if arms.is_empty() {
                    return Err(TrellisError::Composition(format!(
                        "workflow '{}': branch at stage {} has no arms",
                        self.id, index
                    )));
                }
            }
            for step in stage.steps() {
                if !seen.insert(step.id.as_str()) {
                    return Err(TrellisError::Composition(format!(
                        "workflow '{}': duplicate step id '{}'",
                        self.id, step.id
                    )));
                }
            }
        }

        // Each stage's steps must accept everything the previous stage can
        // produce. The workflow input feeds the first stage.
        let last = self.stages.len() - 1;
        let mut producers: Vec<(String, Schema)> =
            vec![(format!("workflow '{}' input", self.id), self.input_schema.clone())];
        for (index, stage) in self.stages.iter().enumerate() {
            for step in stage.steps() {
                for (source, schema) in &producers {
                    step.input_schema.accepts(schema).map_err(|issues| {
                        incompatible(&format!("step '{}' input", step.id), source, &issues)
                    })?;
                }
            }
            producers = stage
                .steps()
                .into_iter()
                .map(|s| (format!("step '{}' output", s.id), s.output_schema.clone()))
                .collect();
            // A mid-workflow fan-out hands the next stage an object keyed by step id.
            if let Stage::Branch(arms) = stage {
                if arms.len() > 1 && index != last {
                    producers.push((
                        format!("fan-out of branch at stage {}", index),
                        fan_out_schema(arms),
                    ));
                }
            }
        }
        for (source, schema) in &producers {
            self.output_schema.accepts(schema).map_err(|issues| {
                incompatible(&format!("workflow '{}' output", self.id), source, &issues)
            })?;
        }

        info!(
            workflow_id = %self.id,
            stages = self.stages.len(),
            steps = seen.len(),
            "Workflow committed"
        );

        Ok(Workflow {
            id: self.id,
            description: self.description,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            stages: self.stages,
            agents: Arc::new(self.agents),
            memory: self.memory,
            events: self.events,
        })
    }
}

/// Shape of a multi-match branch result: any subset of the arms, keyed by step id.
fn fan_out_schema(arms: &[BranchArm]) -> Schema {
    arms.iter().fold(Schema::object(), |schema, arm| {
        schema.optional(arm.step.id.clone(), FieldType::Object(arm.step.output_schema.clone()))
    })
}

fn incompatible(consumer: &str, producer: &str, issues: &[FieldIssue]) -> TrellisError {
    TrellisError::Composition(format!(
        "{} is incompatible with {}: {}",
        consumer,
        producer,
        issues
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    ))
}

/// A committed, immutable workflow. Only runs are possible from here.
pub struct Workflow {
    pub(crate) id: String,
    pub(crate) description: String,
    pub(crate) input_schema: Schema,
    pub(crate) output_schema: Schema,
    pub(crate) stages: Vec<Stage>,
    pub(crate) agents: Arc<HashMap<String, Arc<dyn Agent>>>,
    pub(crate) memory: Option<Arc<dyn MemoryStore>>,
    pub(crate) events: Option<Arc<EventBus>>,
}

impl Workflow {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    pub fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    /// Step ids in stage order (branch arms in registration order).
    pub fn step_ids(&self) -> Vec<&str> {
        self.stages
            .iter()
            .flat_map(|s| s.steps())
            .map(|s| s.id.as_str())
            .collect()
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("steps", &self.step_ids())
            .finish_non_exhaustive()
    }
}
