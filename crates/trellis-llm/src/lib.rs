pub mod openai;
pub mod retry;
pub mod streaming;

use std::sync::Arc;

use tracing::debug;
use trellis_core::config::ModelConfig;
use trellis_core::traits::LlmClient;

pub use openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client for the provider, wrapped in retry/fallback handling.
///
/// Every provider currently speaks the OpenAI-compatible protocol; set
/// `base_url` for Ollama, Groq, OpenRouter and friends.
pub fn create_client(config: &ModelConfig, fallbacks: &[ModelConfig]) -> Arc<dyn LlmClient> {
    debug!(
        provider = %config.provider,
        model = %config.model_id,
        fallbacks = fallbacks.len(),
        "Creating LLM client"
    );
    let fallback_clients = fallbacks
        .iter()
        .map(|fb| (fb.clone(), Box::new(OpenAiClient::new()) as Box<dyn LlmClient>))
        .collect();
    Arc::new(RetryingClient::new(
        Box::new(OpenAiClient::new()),
        fallback_clients,
        config.retry.clone().unwrap_or_default(),
    ))
}
