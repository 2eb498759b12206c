use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_agent::{
    Agent, AgentInput, AnswerRelevancyMetric, GenerateOptions, LlmAgent, Network, RunContext,
    Router, StepDefinition, ToneConsistencyMetric, Workflow, WorkflowBuilder,
};
use trellis_core::config::ModelConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::schema::{FieldType, Schema};
use trellis_core::traits::{LlmClient, MemoryStore};

pub const NETWORK_ID: &str = "test-network";
pub const NETWORK_NAME: &str = "Research Network";
pub const NETWORK_INSTRUCTIONS: &str = "You are a network of writers and researchers. The user will ask you to research a topic. \
You always need to answer with a full report. Bullet points are NOT a full report. \
WRITE FULL PARAGRAPHS like this is a blog post or something similar. You should not rely on partial information.";

pub const RESEARCHER_ID: &str = "agent1";
pub const RESEARCHER_INSTRUCTIONS: &str = "This agent is used to do research, but not create full responses. \
Answer in bullet points only and be concise.";

pub const SYNTHESIZER_ID: &str = "agent2";
pub const SYNTHESIZER_DESCRIPTION: &str = "This agent is used to do text synthesis on researched material. \
Write a full report based on the researched material. Writes reports in full paragraphs. \
Should be used to synthesize text from different sources together as a final report.";
pub const SYNTHESIZER_INSTRUCTIONS: &str = "This agent is used to do text synthesis on researched material. \
Write a full report based on the researched material. Do not use bullet points. Write full paragraphs. \
There should not be a single bullet point in the final report.";

pub const WORKFLOW_ID: &str = "workflow1";
pub const WORKFLOW_DESCRIPTION: &str = "This workflow is perfect for researching a specific city. \
It should be used when you have a city in mind to research.";

#[derive(Debug, Deserialize)]
struct CityInput {
    city: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct Text {
    text: String,
}

pub fn text_schema() -> Schema {
    Schema::object().field("text", FieldType::String)
}

pub fn researcher_agent(llm: Arc<dyn LlmClient>, model: ModelConfig) -> LlmAgent {
    LlmAgent::new(RESEARCHER_ID, RESEARCHER_INSTRUCTIONS, llm, model)
}

/// The synthesizer is scored for tone and (by `judge`) answer relevancy.
pub fn synthesizer_agent(
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    judge: ModelConfig,
) -> LlmAgent {
    let relevancy = AnswerRelevancyMetric::new(llm.clone(), judge)
        .with_uncertainty_weight(0.3)
        .with_scale(1.0);
    LlmAgent::new(SYNTHESIZER_ID, SYNTHESIZER_INSTRUCTIONS, llm, model)
        .with_description(SYNTHESIZER_DESCRIPTION)
        .with_metric("tone", Arc::new(ToneConsistencyMetric::new()))
        .with_metric("relevance", Arc::new(relevancy))
}

/// Ask `agent_id` for a `{text}` object.
async fn structured_text(ctx: &RunContext, agent_id: &str, prompt: String) -> Result<Text> {
    let agent = ctx.agent(agent_id)?;
    let options = GenerateOptions::structured(text_schema()).in_thread(ctx.thread_id().clone());
    let generation = agent.generate(AgentInput::Text(prompt), options).await?;
    let object = generation.object.unwrap_or(Value::Null);
    serde_json::from_value(object).map_err(|e| {
        TrellisError::Generation(format!("agent '{}' returned no usable text object: {}", agent_id, e))
    })
}

pub fn research_step() -> StepDefinition {
    StepDefinition::typed(
        "agent-step",
        "This step is used to do research and text synthesis.",
        Schema::object()
            .field("city", FieldType::String)
            .describe("city", "The city to research"),
        text_schema(),
        |input: CityInput, ctx: RunContext| async move {
            structured_text(&ctx, RESEARCHER_ID, input.city).await
        },
    )
}

pub fn synthesis_step() -> StepDefinition {
    StepDefinition::typed(
        "agent-step-two",
        "This step is used to do research and text synthesis.",
        text_schema().describe("text", "The researched material to synthesize"),
        text_schema(),
        |input: Text, ctx: RunContext| async move {
            structured_text(&ctx, SYNTHESIZER_ID, input.text).await
        },
    )
}

/// City research: bullet-point research followed by a written report.
pub fn research_workflow(researcher: Arc<dyn Agent>, synthesizer: Arc<dyn Agent>) -> WorkflowBuilder {
    WorkflowBuilder::new(
        WORKFLOW_ID,
        WORKFLOW_DESCRIPTION,
        Schema::object().field("city", FieldType::String),
        text_schema(),
    )
    .then(research_step())
    .then(synthesis_step())
    .with_agent(researcher)
    .with_agent(synthesizer)
}

/// The research network over both agents and the research workflow.
pub fn research_network(
    router: Arc<dyn Router>,
    researcher: Arc<dyn Agent>,
    synthesizer: Arc<dyn Agent>,
    workflow: Arc<Workflow>,
    memory: Option<Arc<dyn MemoryStore>>,
) -> Network {
    let network = Network::new(NETWORK_ID, NETWORK_NAME, NETWORK_INSTRUCTIONS, router)
        .agent(researcher)
        .agent(synthesizer)
        .workflow(workflow);
    match memory {
        Some(store) => network.with_memory(store),
        None => network,
    }
}
