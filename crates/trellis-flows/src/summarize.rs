use std::sync::Arc;

use trellis_agent::{AnswerRelevancyMetric, LlmAgent, SummarizationMetric, ToneConsistencyMetric};
use trellis_core::config::ModelConfig;
use trellis_core::traits::{LlmClient, MemoryStore};

pub const SUMMARIZE_AGENT_ID: &str = "summarize-agent";

pub const SUMMARIZE_INSTRUCTIONS: &str = "You are a helpful assistant that summarizes text.

Ensure that the summary is concise and to the point.

The summary should be in the same language as the text.";

/// Summarizer scored for summary quality, relevancy and tone. With memory
/// attached it remembers earlier turns per thread.
pub fn summarize_agent(
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    judge: ModelConfig,
    memory: Option<Arc<dyn MemoryStore>>,
) -> LlmAgent {
    let summarization = SummarizationMetric::new(llm.clone(), judge.clone()).with_scale(1.0);
    let relevancy = AnswerRelevancyMetric::new(llm.clone(), judge)
        .with_uncertainty_weight(0.3)
        .with_scale(1.0);
    let agent = LlmAgent::new(SUMMARIZE_AGENT_ID, SUMMARIZE_INSTRUCTIONS, llm, model)
        .with_description("This agent is used to summarize text.")
        .with_metric("summarization", Arc::new(summarization))
        .with_metric("relevance", Arc::new(relevancy))
        .with_metric("tone", Arc::new(ToneConsistencyMetric::new()));
    match memory {
        Some(store) => agent.with_memory(store),
        None => agent,
    }
}
