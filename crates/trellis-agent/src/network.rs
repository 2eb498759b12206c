//! Network router: picks one registered agent or workflow for a task.
//!
//! A `Network` holds its targets in registration order and delegates the
//! choice to a `Router`. `LlmRouter` asks a model (non-deterministic);
//! `KeywordRouter` scores capability descriptions against the task text.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_core::config::ModelConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EventBus, WorkflowEvent};
use trellis_core::traits::{LlmClient, MemoryStore};
use trellis_core::types::{ChatMessage, SessionId};

use crate::agent::{Agent, AgentInput, GenerateOptions};
use crate::output::{complete, extract_json};
use crate::workflow::{RunOptions, Workflow};

/// Something a network can dispatch a task to.
#[derive(Clone)]
pub enum RoutableTarget {
    Agent(Arc<dyn Agent>),
    Workflow(Arc<Workflow>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Agent,
    Workflow,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Workflow => "workflow",
        }
    }
}

impl RoutableTarget {
    pub fn id(&self) -> &str {
        match self {
            Self::Agent(a) => a.id(),
            Self::Workflow(w) => w.id(),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Agent(a) => a.description(),
            Self::Workflow(w) => w.description(),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Self::Agent(_) => TargetKind::Agent,
            Self::Workflow(_) => TargetKind::Workflow,
        }
    }

    /// An agent with its own memory already stored the exchange.
    fn keeps_history(&self) -> bool {
        match self {
            Self::Agent(agent) => agent.keeps_history(),
            Self::Workflow(_) => false,
        }
    }

    fn candidate(&self) -> RouteCandidate {
        RouteCandidate {
            id: self.id().to_string(),
            kind: self.kind(),
            description: self.description().to_string(),
            input_schema: match self {
                Self::Agent(_) => None,
                Self::Workflow(w) => Some(w.input_schema().to_json_schema()),
            },
        }
    }

    /// Run the target on a task and return its answer as text.
    pub async fn invoke(
        &self,
        task: &str,
        shaped_input: Option<Value>,
        thread: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<String> {
        match self {
            Self::Agent(agent) => {
                let options = GenerateOptions {
                    output_schema: None,
                    thread_id: Some(thread.clone()),
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(TrellisError::Cancelled),
                    generation = agent.generate(AgentInput::Text(task.to_string()), options) => {
                        Ok(generation?.text)
                    }
                }
            }
            Self::Workflow(workflow) => {
                let input = workflow_input(workflow, task, shaped_input);
                let options = RunOptions {
                    thread_id: Some(thread.clone()),
                    cancel: Some(cancel.clone()),
                };
                let output = workflow.run_with(input, options).await?;
                Ok(output_text(output))
            }
        }
    }
}

/// Prefer the router's input when it fits; otherwise fill a lone required
/// string field with the task text.
fn workflow_input(workflow: &Workflow, task: &str, shaped: Option<Value>) -> Value {
    if let Some(input) = &shaped {
        if workflow.input_schema().validate(input).is_ok() {
            return input.clone();
        }
    }
    if let [field] = workflow.input_schema().required_string_fields().as_slice() {
        debug!(workflow_id = %workflow.id(), field = %field, "Filling workflow input from task text");
        let mut input = serde_json::Map::new();
        input.insert(field.to_string(), Value::String(task.to_string()));
        return Value::Object(input);
    }
    shaped.unwrap_or_else(|| json!({}))
}

/// Unify a workflow result into text.
fn output_text(output: Value) -> String {
    match output {
        Value::String(s) => s,
        Value::Object(map) if map.len() == 1 && map.values().all(Value::is_string) => map
            .into_iter()
            .next()
            .and_then(|(_, v)| v.as_str().map(str::to_string))
            .unwrap_or_default(),
        other => serde_json::to_string_pretty(&other).unwrap_or_default(),
    }
}

/// What a router sees about each target.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
    pub id: String,
    pub kind: TargetKind,
    pub description: String,
    /// JSON Schema of a workflow's input.
    pub input_schema: Option<Value>,
}

pub struct RouteRequest<'a> {
    pub task: &'a str,
    pub instructions: &'a str,
    pub candidates: &'a [RouteCandidate],
    /// Earlier turns in this thread, oldest first.
    pub history: &'a [ChatMessage],
}

/// The router's choice.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RouteDecision {
    pub target: String,
    /// Task reshaped into a workflow's input.
    #[serde(default)]
    pub input: Option<Value>,
}

/// Chooses a target for a task. `Ok(None)` means nothing fits.
pub trait Router: Send + Sync + 'static {
    fn select<'a>(&'a self, request: RouteRequest<'a>) -> BoxFuture<'a, Result<Option<RouteDecision>>>;
}

// ── LlmRouter ───────────────────────────────────────────────────

/// Lets a model pick the target and shape workflow input.
pub struct LlmRouter {
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl LlmRouter {
    pub fn new(llm: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self { llm, model }
    }

    fn prompt(request: &RouteRequest<'_>) -> String {
        let mut catalog = String::new();
        for c in request.candidates {
            catalog.push_str(&format!("- id: {}\n  kind: {}\n  description: {}\n", c.id, c.kind.as_str(), c.description));
            if let Some(schema) = &c.input_schema {
                catalog.push_str(&format!("  input_schema: {}\n", schema));
            }
        }

        let mut prompt = format!("{}\n\n## Available targets\n{}\n", request.instructions, catalog);
        if !request.history.is_empty() {
            prompt.push_str("## Conversation so far\n");
            for msg in request.history {
                prompt.push_str(&format!("{}: {}\n", msg.role.as_str(), msg.text()));
            }
            prompt.push('\n');
        }
        prompt.push_str(&format!(
            r#"## Task
{}

Choose the single most relevant target. For a workflow, shape the task into its input_schema.
Respond with ONLY valid JSON:
{{"target": "<id or null>", "input": {{...}} }}"#,
            request.task
        ));
        prompt
    }
}

impl Router for LlmRouter {
    fn select<'a>(&'a self, request: RouteRequest<'a>) -> BoxFuture<'a, Result<Option<RouteDecision>>> {
        Box::pin(async move {
            let messages = vec![ChatMessage::user(Self::prompt(&request))];
            let text = complete(self.llm.as_ref(), &self.model, messages)
                .await
                .map_err(|e| TrellisError::Generation(format!("routing model failed: {}", e)))?;

            let value = extract_json(&text)
                .map_err(|e| TrellisError::Generation(format!("unparseable routing decision: {}", e)))?;
            let target = value.get("target").and_then(Value::as_str).unwrap_or_default();
            if target.is_empty() || target.eq_ignore_ascii_case("none") {
                return Ok(None);
            }
            Ok(Some(serde_json::from_value(value)?))
        })
    }
}

// ── KeywordRouter ───────────────────────────────────────────────

const STOPWORDS: &[&str] = &[
    "about", "from", "have", "into", "please", "that", "them", "then", "there", "they", "this",
    "what", "when", "where", "which", "with", "will", "your",
];

fn tokens(text: &str) -> Vec<String> {
    static WORD: OnceLock<Regex> = OnceLock::new();
    let word = WORD.get_or_init(|| Regex::new(r"[a-z0-9]+").expect("word pattern is a valid regex"));
    let lower = text.to_lowercase();
    word.find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|w| w.len() >= 4 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Deterministic router: explicit keywords score 10, words shared with a
/// target's description score 1. Highest score wins, the earlier
/// registration wins a tie, and zero means no route.
#[derive(Debug, Default)]
pub struct KeywordRouter {
    keywords: HashMap<String, Vec<String>>,
}

impl KeywordRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keywords(mut self, target: impl Into<String>, keywords: &[&str]) -> Self {
        self.keywords
            .entry(target.into())
            .or_default()
            .extend(keywords.iter().map(|k| k.to_lowercase()));
        self
    }

    pub fn score(&self, task: &str, candidate: &RouteCandidate) -> u32 {
        let task_lower = task.to_lowercase();
        let task_tokens = tokens(task);

        let explicit = self
            .keywords
            .get(&candidate.id)
            .map(|kws| kws.iter().filter(|k| task_lower.contains(k.as_str())).count())
            .unwrap_or(0);

        let mut described = tokens(&candidate.description);
        described.sort();
        described.dedup();
        let shared = described.iter().filter(|d| task_tokens.contains(d)).count();

        (explicit * 10 + shared) as u32
    }
}

impl Router for KeywordRouter {
    fn select<'a>(&'a self, request: RouteRequest<'a>) -> BoxFuture<'a, Result<Option<RouteDecision>>> {
        Box::pin(async move {
            let mut best: Option<(&RouteCandidate, u32)> = None;
            for candidate in request.candidates {
                let score = self.score(request.task, candidate);
                debug!(target_id = %candidate.id, score, "Scored route candidate");
                if score > 0 && best.map_or(true, |(_, s)| score > s) {
                    best = Some((candidate, score));
                }
            }
            Ok(best.map(|(c, _)| RouteDecision {
                target: c.id.clone(),
                input: None,
            }))
        })
    }
}

// ── Network ─────────────────────────────────────────────────────

/// A named set of routable targets behind one `route` call.
pub struct Network {
    id: String,
    name: String,
    instructions: String,
    router: Arc<dyn Router>,
    targets: Vec<RoutableTarget>,
    memory: Option<Arc<dyn MemoryStore>>,
    history_limit: usize,
    events: Option<Arc<EventBus>>,
}

impl Network {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        instructions: impl Into<String>,
        router: Arc<dyn Router>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            instructions: instructions.into(),
            router,
            targets: Vec::new(),
            memory: None,
            history_limit: 20,
            events: None,
        }
    }

    /// Register an agent. A target with the same id is replaced.
    pub fn agent(self, agent: Arc<dyn Agent>) -> Self {
        self.register(RoutableTarget::Agent(agent))
    }

    /// Register a workflow. A target with the same id is replaced.
    pub fn workflow(self, workflow: Arc<Workflow>) -> Self {
        self.register(RoutableTarget::Workflow(workflow))
    }

    fn register(mut self, target: RoutableTarget) -> Self {
        match self.targets.iter().position(|t| t.id() == target.id()) {
            Some(i) => self.targets[i] = target,
            None => self.targets.push(target),
        }
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

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn targets(&self) -> &[RoutableTarget] {
        &self.targets
    }

    pub fn candidates(&self) -> Vec<RouteCandidate> {
        self.targets.iter().map(RoutableTarget::candidate).collect()
    }

    /// Route a one-off task on a fresh thread.
    pub async fn route(&self, task: &str) -> Result<String> {
        self.route_in_thread(&SessionId::new(), task, &CancellationToken::new())
            .await
    }

    /// Route a task within a conversation thread.
    pub async fn route_in_thread(
        &self,
        thread: &SessionId,
        task: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let history = match &self.memory {
            Some(store) => store.load_history(thread, self.history_limit).await?,
            None => Vec::new(),
        };

        let candidates = self.candidates();
        let request = RouteRequest {
            task,
            instructions: &self.instructions,
            candidates: &candidates,
            history: &history,
        };
        let decision = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TrellisError::Cancelled),
            decision = self.router.select(request) => decision?,
        };

        let decision = decision.ok_or_else(|| {
            warn!(network_id = %self.id, "No target selected");
            TrellisError::NoRouteFound(format!("network '{}' has no target for this task", self.id))
        })?;
        let target = self
            .targets
            .iter()
            .find(|t| t.id() == decision.target)
            .ok_or_else(|| {
                TrellisError::NoRouteFound(format!(
                    "network '{}' chose unknown target '{}'",
                    self.id, decision.target
                ))
            })?;

        info!(
            network_id = %self.id,
            thread_id = %thread,
            target = %target.id(),
            kind = target.kind().as_str(),
            "Routing task"
        );
        if let Some(bus) = &self.events {
            bus.publish(WorkflowEvent::RouteSelected {
                network_id: self.id.clone(),
                target: target.id().to_string(),
            });
        }

        let answer = target.invoke(task, decision.input, thread, cancel).await?;

        match &self.memory {
            Some(_) if target.keeps_history() => {
                debug!(network_id = %self.id, target = %target.id(), "Target recorded the exchange itself");
            }
            Some(store) => {
                store
                    .append_messages(
                        thread,
                        &[ChatMessage::user(task), ChatMessage::assistant_text(answer.clone())],
                    )
                    .await?;
            }
            None => {}
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use trellis_core::schema::{FieldType, Schema};
    use trellis_memory::InMemoryStore;
    use trellis_test_utils::{MockLlmClient, PendingLlmClient};

    use super::*;
    use crate::agent::{FnAgent, Generation, LlmAgent};
    use crate::workflow::{RunContext, StepDefinition, WorkflowBuilder};

    fn weather_workflow(runs: Arc<AtomicUsize>) -> Arc<Workflow> {
        let city = Schema::object().field("city", FieldType::String);
        let report = Schema::object().field("report", FieldType::String);
        let step = StepDefinition::new("lookup", "", city.clone(), report.clone(), move |input: Value, _ctx: RunContext| {
            runs.fetch_add(1, Ordering::SeqCst);
            async move {
                let city = input["city"].as_str().unwrap_or_default().to_string();
                Ok::<_, TrellisError>(json!({ "report": format!("sunny in {}", city) }))
            }
        });
        Arc::new(
            WorkflowBuilder::new("weather-flow", "weather lookup", city, report)
                .then(step)
                .commit()
                .unwrap(),
        )
    }

    fn math_agent(calls: Arc<AtomicUsize>) -> Arc<dyn Agent> {
        Arc::new(FnAgent::new("calculator", "math", move |_input: AgentInput, _o: GenerateOptions| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Generation::text("4")) }
        }))
    }

    fn keyword_network(agent_calls: Arc<AtomicUsize>, workflow_runs: Arc<AtomicUsize>) -> Network {
        Network::new("net", "Test Network", "route tasks", Arc::new(KeywordRouter::new()))
            .agent(math_agent(agent_calls))
            .workflow(weather_workflow(workflow_runs))
    }

    #[tokio::test]
    async fn test_keyword_routing_dispatch() {
        let agent_calls = Arc::new(AtomicUsize::new(0));
        let workflow_runs = Arc::new(AtomicUsize::new(0));
        let network = keyword_network(agent_calls.clone(), workflow_runs.clone());

        let weather = network.route("weather").await.unwrap();
        assert_eq!(weather, "sunny in weather");
        assert_eq!(workflow_runs.load(Ordering::SeqCst), 1);
        assert_eq!(agent_calls.load(Ordering::SeqCst), 0);

        let math = network.route("help me with math homework").await.unwrap();
        assert_eq!(math, "4");
        assert_eq!(agent_calls.load(Ordering::SeqCst), 1);
        assert_eq!(workflow_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unmatched_task_has_no_route() {
        let network = keyword_network(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let err = network.route("tell me a joke").await.unwrap_err();
        assert!(matches!(err, TrellisError::NoRouteFound(_)));
    }

    #[test]
    fn test_tokens() {
        assert_eq!(
            tokens("What is the WEATHER in Lisbon, 2024?"),
            vec!["weather", "lisbon", "2024"]
        );
        assert!(tokens("tell me a joke").is_empty());
    }

    #[test]
    fn test_keyword_scores() {
        let router = KeywordRouter::new().with_keywords("calculator", &["sum", "multiply"]);
        let candidate = RouteCandidate {
            id: "calculator".into(),
            kind: TargetKind::Agent,
            description: "Solves arithmetic and math questions".into(),
            input_schema: None,
        };
        assert_eq!(router.score("multiply these", &candidate), 10);
        assert_eq!(router.score("arithmetic questions", &candidate), 2);
        assert_eq!(router.score("paint a picture", &candidate), 0);
    }

    #[tokio::test]
    async fn test_llm_router_shapes_workflow_input() {
        let runs = Arc::new(AtomicUsize::new(0));
        let llm = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"target": "weather-flow", "input": {"city": "Lisbon"}}"#,
        ]));
        let network = Network::new(
            "net",
            "Test Network",
            "Pick the right specialist.",
            Arc::new(LlmRouter::new(llm.clone(), ModelConfig::new("router"))),
        )
        .agent(math_agent(Arc::new(AtomicUsize::new(0))))
        .workflow(weather_workflow(runs.clone()));

        let answer = network.route("Is it nice out in Lisbon today?").await.unwrap();
        assert_eq!(answer, "sunny in Lisbon");

        let prompt = llm.recorded()[0][0].text();
        assert!(prompt.contains("Pick the right specialist."));
        assert!(prompt.contains("id: calculator"));
        assert!(prompt.contains("kind: workflow"));
        assert!(prompt.contains("Is it nice out in Lisbon today?"));
    }

    #[tokio::test]
    async fn test_llm_router_null_target() {
        let llm = Arc::new(MockLlmClient::with_responses(vec![r#"{"target": null}"#]));
        let network = Network::new("net", "n", "", Arc::new(LlmRouter::new(llm, ModelConfig::new("r"))))
            .agent(math_agent(Arc::new(AtomicUsize::new(0))));
        assert!(matches!(network.route("anything").await, Err(TrellisError::NoRouteFound(_))));
    }

    #[tokio::test]
    async fn test_unknown_target_is_no_route() {
        let llm = Arc::new(MockLlmClient::with_responses(vec![r#"{"target": "ghost"}"#]));
        let network = Network::new("net", "n", "", Arc::new(LlmRouter::new(llm, ModelConfig::new("r"))))
            .agent(math_agent(Arc::new(AtomicUsize::new(0))));
        match network.route("anything").await.unwrap_err() {
            TrellisError::NoRouteFound(msg) => assert!(msg.contains("ghost")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_memory_appended_per_thread() {
        let store = Arc::new(InMemoryStore::new());
        let network = keyword_network(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
            .with_memory(store.clone());
        let thread = SessionId::from_str("conversation-1");
        network
            .route_in_thread(&thread, "math please", &CancellationToken::new())
            .await
            .unwrap();

        let history = store.load_history(&thread, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "math please");
        assert_eq!(history[1].text(), "4");
        assert!(store.load_history(&SessionId::from_str("other"), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_agent_with_memory_is_recorded_once() {
        let store = Arc::new(InMemoryStore::new());
        let llm = Arc::new(MockLlmClient::with_responses(vec!["four", "eight"]));
        let tutor = LlmAgent::new("tutor", "Answers arithmetic", llm.clone(), ModelConfig::new("m"))
            .with_memory(store.clone());
        let router = KeywordRouter::new().with_keywords("tutor", &["math"]);
        let network = Network::new("net", "Tutor Network", "route tasks", Arc::new(router))
            .agent(Arc::new(tutor))
            .with_memory(store.clone());

        let thread = SessionId::from_str("lesson");
        let cancel = CancellationToken::new();
        network.route_in_thread(&thread, "math question", &cancel).await.unwrap();

        let history: Vec<String> = store
            .load_history(&thread, 10)
            .await
            .unwrap()
            .iter()
            .map(ChatMessage::text)
            .collect();
        assert_eq!(history, vec!["math question", "four"]);

        // The second turn sees the first exactly once.
        network.route_in_thread(&thread, "more math", &cancel).await.unwrap();
        let sent = &llm.recorded()[1];
        let replayed: Vec<String> = sent.iter().skip(1).map(ChatMessage::text).collect();
        assert_eq!(replayed, vec!["math question", "four", "more math"]);
        assert_eq!(store.load_history(&thread, 10).await.unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_agent_call() {
        let agent = Arc::new(LlmAgent::new(
            "slow",
            "math",
            Arc::new(PendingLlmClient),
            ModelConfig::new("m"),
        ));
        let network = Network::new("net", "n", "", Arc::new(KeywordRouter::new())).agent(agent);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            trigger.cancel();
        });
        let err = network
            .route_in_thread(&SessionId::new(), "math", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TrellisError::Cancelled));
    }

    #[test]
    fn test_output_text() {
        assert_eq!(output_text(json!("plain")), "plain");
        assert_eq!(output_text(json!({"text": "single"})), "single");
        assert!(output_text(json!({"a": 1, "b": 2})).contains("\"a\": 1"));
    }

    #[test]
    fn test_replacing_target_keeps_position() {
        let network = Network::new("net", "n", "", Arc::new(KeywordRouter::new()))
            .agent(Arc::new(FnAgent::fixed("a", "first", "1")))
            .agent(Arc::new(FnAgent::fixed("b", "second", "2")))
            .agent(Arc::new(FnAgent::fixed("a", "replaced", "3")));
        let ids: Vec<_> = network.targets().iter().map(|t| t.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(network.targets()[0].description(), "replaced");
    }
}
