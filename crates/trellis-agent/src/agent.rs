use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, warn};

use trellis_core::config::ModelConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::schema::Schema;
use trellis_core::traits::{LlmClient, MemoryStore};
use trellis_core::types::{ChatMessage, Role, SessionId};

use crate::metrics::{Metric, MetricScore};
use crate::output::{complete, extract_json};

/// What an agent is asked to respond to.
#[derive(Debug, Clone)]
pub enum AgentInput {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl AgentInput {
    /// Flatten to plain text (user turns joined by newlines).
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Messages(msgs) => msgs
                .iter()
                .filter(|m| m.role == Role::User)
                .map(|m| m.text())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            Self::Text(t) => vec![ChatMessage::user(t)],
            Self::Messages(msgs) => msgs,
        }
    }
}

impl From<String> for AgentInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for AgentInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Vec<ChatMessage>> for AgentInput {
    fn from(msgs: Vec<ChatMessage>) -> Self {
        Self::Messages(msgs)
    }
}

/// Per-call options for [`Agent::generate`].
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Ask for a structured object matching this schema.
    pub output_schema: Option<Schema>,
    /// Scope memory reads and writes to this thread.
    pub thread_id: Option<SessionId>,
}

impl GenerateOptions {
    pub fn structured(schema: Schema) -> Self {
        Self {
            output_schema: Some(schema),
            thread_id: None,
        }
    }

    pub fn in_thread(mut self, thread: SessionId) -> Self {
        self.thread_id = Some(thread);
        self
    }
}

/// Result of one generation.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    /// Present only when an output schema was requested.
    pub object: Option<Value>,
    pub scores: Vec<MetricScore>,
}

impl Generation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// A single opaque generation capability.
pub trait Agent: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Natural-language capability description, also used for routing.
    fn description(&self) -> &str;

    fn generate(&self, input: AgentInput, options: GenerateOptions)
        -> BoxFuture<'_, Result<Generation>>;

    /// True when the agent records its own turns in thread memory.
    fn keeps_history(&self) -> bool {
        false
    }
}

/// Model-backed agent.
pub struct LlmAgent {
    id: String,
    description: String,
    instructions: String,
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    memory: Option<Arc<dyn MemoryStore>>,
    history_limit: usize,
    metrics: Vec<(String, Arc<dyn Metric>)>,
}

impl LlmAgent {
    pub fn new(
        id: impl Into<String>,
        instructions: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
    ) -> Self {
        let instructions = instructions.into();
        Self {
            id: id.into(),
            description: instructions.clone(),
            instructions,
            llm,
            model,
            memory: None,
            history_limit: 40,
            metrics: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, metric: Arc<dyn Metric>) -> Self {
        self.metrics.push((name.into(), metric));
        self
    }

    fn system_prompt(&self, schema: Option<&Schema>) -> String {
        match schema {
            None => self.instructions.clone(),
            Some(schema) => format!(
                "{}\n\nRespond with ONLY a JSON object matching this JSON Schema, no prose:\n{}",
                self.instructions,
                serde_json::to_string_pretty(&schema.to_json_schema()).unwrap_or_default()
            ),
        }
    }

    async fn score(&self, input: &str, output: &str) -> Vec<MetricScore> {
        let mut scores = Vec::new();
        for (name, metric) in &self.metrics {
            match metric.measure(input, output).await {
                Ok(m) => scores.push(MetricScore {
                    metric: name.clone(),
                    score: m.score,
                    reason: m.reason,
                }),
                Err(e) => warn!(agent = %self.id, metric = %name, error = %e, "Metric failed"),
            }
        }
        scores
    }

    async fn run(&self, input: AgentInput, options: GenerateOptions) -> Result<Generation> {
        let input_text = input.as_text();
        let turn = input.into_messages();

        let memory = match (&self.memory, &options.thread_id) {
            (Some(store), Some(thread)) => Some((store, thread)),
            _ => None,
        };

        let mut messages = vec![ChatMessage::system(
            self.system_prompt(options.output_schema.as_ref()),
        )];
        if let Some((store, thread)) = memory {
            let history = store.load_history(thread, self.history_limit).await?;
            debug!(agent = %self.id, thread_id = %thread, messages = history.len(), "Loaded history");
            messages.extend(history);
        }
        messages.extend(turn.iter().cloned());

        let text = complete(self.llm.as_ref(), &self.model, messages)
            .await
            .map_err(|e| match e {
                TrellisError::Generation(_) | TrellisError::Cancelled => e,
                other => TrellisError::Generation(other.to_string()),
            })?;

        let object = match &options.output_schema {
            None => None,
            Some(schema) => {
                let value = extract_json(&text).map_err(|e| {
                    TrellisError::Generation(format!("agent '{}' returned malformed JSON: {}", self.id, e))
                })?;
                schema.validate(&value).map_err(|issues| {
                    TrellisError::Generation(
                        TrellisError::schema(format!("agent '{}' output", self.id), issues).to_string(),
                    )
                })?;
                Some(value)
            }
        };

        if let Some((store, thread)) = memory {
            let mut exchange: Vec<ChatMessage> = turn
                .into_iter()
                .filter(|m| m.role != Role::System)
                .collect();
            exchange.push(ChatMessage::assistant_text(text.clone()));
            store.append_messages(thread, &exchange).await?;
        }

        let scores = self.score(&input_text, &text).await;
        info!(agent = %self.id, chars = text.len(), structured = object.is_some(), "Generation complete");

        Ok(Generation {
            text,
            object,
            scores,
        })
    }
}

impl Agent for LlmAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn generate(
        &self,
        input: AgentInput,
        options: GenerateOptions,
    ) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(self.run(input, options))
    }

    fn keeps_history(&self) -> bool {
        self.memory.is_some()
    }
}

type GenerateFn =
    dyn Fn(AgentInput, GenerateOptions) -> BoxFuture<'static, Result<Generation>> + Send + Sync;

/// Agent backed by a closure. Deterministic stand-in for model agents.
pub struct FnAgent {
    id: String,
    description: String,
    f: Box<GenerateFn>,
}

impl FnAgent {
    pub fn new<F, Fut>(id: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(AgentInput, GenerateOptions) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Generation>> + Send + 'static,
    {
        Self {
            id: id.into(),
            description: description.into(),
            f: Box::new(move |input, options| Box::pin(f(input, options))),
        }
    }

    /// An agent that always answers with the same text (and, when a schema
    /// is requested, `{"text": <text>}`).
    pub fn fixed(id: impl Into<String>, description: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(id, description, move |_input, options: GenerateOptions| {
            let text = text.clone();
            async move {
                let object = options
                    .output_schema
                    .map(|_| serde_json::json!({ "text": text.clone() }));
                Ok(Generation {
                    text,
                    object,
                    scores: Vec::new(),
                })
            }
        })
    }
}

impl Agent for FnAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn generate(
        &self,
        input: AgentInput,
        options: GenerateOptions,
    ) -> BoxFuture<'_, Result<Generation>> {
        (self.f)(input, options)
    }
}
