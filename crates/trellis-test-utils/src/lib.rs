//! Mocks and fixtures shared by the Trellis crate tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};

use trellis_core::config::{AppConfig, ModelConfig};
use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::LlmClient;
use trellis_core::types::{ChatMessage, StopReason, StreamDelta};

/// Scripted LLM: answers each call with the next queued response and
/// records every message list it was sent.
#[derive(Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<String>>,
    recorded: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses<S: Into<String>>(responses: Vec<S>) -> Self {
        let mock = Self::new();
        for r in responses {
            mock.push_response(r);
        }
        mock
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push_back(response.into());
    }

    /// Message lists received so far, one entry per call.
    pub fn recorded(&self) -> Vec<Vec<ChatMessage>> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.recorded.lock().unwrap().len()
    }
}

impl LlmClient for MockLlmClient {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        Box::pin(async move {
            self.recorded.lock().unwrap().push(messages);
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TrellisError::LlmRequest("no scripted response left".into()))?;

            // Split in two so consumers must accumulate deltas.
            let mid = response
                .char_indices()
                .nth(response.chars().count() / 2)
                .map_or(response.len(), |(i, _)| i);
            let deltas = vec![
                Ok(StreamDelta::TextDelta(response[..mid].to_string())),
                Ok(StreamDelta::TextDelta(response[mid..].to_string())),
                Ok(StreamDelta::Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                Ok(StreamDelta::Stop(StopReason::EndTurn)),
            ];
            Ok(Box::pin(stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

/// LLM whose every request fails with `LlmRequest`.
pub struct FailingLlmClient {
    message: String,
}

impl FailingLlmClient {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl LlmClient for FailingLlmClient {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        _messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let message = self.message.clone();
        Box::pin(async move { Err(TrellisError::LlmRequest(message)) })
    }
}

/// LLM that never answers. Used to exercise cancellation.
pub struct PendingLlmClient;

impl LlmClient for PendingLlmClient {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        _messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        Box::pin(futures::future::pending())
    }
}

/// Minimal config text with an in-memory store.
pub const SAMPLE_CONFIG: &str = r#"
[model]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "test-key"

[memory]
backend = "memory"

[log]
filter = "trellis=debug"
"#;

/// Parse [`SAMPLE_CONFIG`].
pub fn sample_config() -> AppConfig {
    toml::from_str(SAMPLE_CONFIG).unwrap()
}

/// Write config text into a fresh temp dir. Keep the dir alive while the
/// path is in use.
pub fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trellis.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}
