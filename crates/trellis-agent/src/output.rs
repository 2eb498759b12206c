use futures::StreamExt;
use serde_json::Value;

use trellis_core::config::ModelConfig;
use trellis_core::error::Result;
use trellis_core::traits::LlmClient;
use trellis_core::types::{ChatMessage, StreamDelta};

/// Run one chat completion to the end and return the concatenated text.
pub async fn complete(
    llm: &dyn LlmClient,
    config: &ModelConfig,
    messages: Vec<ChatMessage>,
) -> Result<String> {
    let mut stream = llm.chat_stream(config, messages).await?;
    let mut text = String::new();
    while let Some(delta) = stream.next().await {
        if let StreamDelta::TextDelta(chunk) = delta? {
            text.push_str(&chunk);
        }
    }
    Ok(text)
}

/// Pull a JSON value out of model output.
///
/// Accepts bare JSON, JSON inside a markdown code fence, or JSON embedded
/// in surrounding prose (first `{` to last `}`).
pub fn extract_json(text: &str) -> std::result::Result<Value, String> {
    let cleaned = strip_code_fences(text);
    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return Ok(value);
    }

    match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str(&cleaned[start..=end]).map_err(|e| e.to_string())
        }
        _ => Err("no JSON object found in model output".to_string()),
    }
}

/// Strip markdown code fences from text.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip optional language tag on the fence line
        let body_start = after.find('\n').map_or(0, |p| p + 1);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim().to_string();
        }
    }

    trimmed.to_string()
}
