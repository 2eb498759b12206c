use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// LLM client: streaming chat completion against a hosted model.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Memory store: durable conversation history keyed by thread.
///
/// Implementations serialize writes for a given thread; no ordering is
/// promised across different threads.
pub trait MemoryStore: Send + Sync + 'static {
    /// Append messages to a thread.
    fn append_messages(&self, thread: &SessionId, msgs: &[ChatMessage])
        -> BoxFuture<'_, Result<()>>;

    /// Load the most recent `limit` messages of a thread, oldest first.
    fn load_history(
        &self,
        thread: &SessionId,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>>;
}
