use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::MemoryStore;
use trellis_core::types::{ChatMessage, SessionId};

/// Process-local conversation store. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryStore {
    threads: Mutex<HashMap<SessionId, Vec<ChatMessage>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread ids that have at least one message.
    pub fn threads(&self) -> Vec<SessionId> {
        match self.threads.lock() {
            Ok(map) => map.keys().cloned().collect(),
            Err(_) => vec![],
        }
    }
}

impl MemoryStore for InMemoryStore {
    fn append_messages(
        &self,
        thread: &SessionId,
        msgs: &[ChatMessage],
    ) -> BoxFuture<'_, Result<()>> {
        let thread = thread.clone();
        let msgs = msgs.to_vec();
        Box::pin(async move {
            let mut map = self
                .threads
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            map.entry(thread).or_default().extend(msgs);
            Ok(())
        })
    }

    fn load_history(
        &self,
        thread: &SessionId,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        let thread = thread.clone();
        Box::pin(async move {
            let map = self
                .threads
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            let history = map.get(&thread).map(Vec::as_slice).unwrap_or_default();
            let start = history.len().saturating_sub(limit);
            Ok(history[start..].to_vec())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_append_and_limit() {
        let store = InMemoryStore::new();
        let sid = SessionId::from_str("t");
        store
            .append_messages(&sid, &[ChatMessage::user("a"), ChatMessage::user("b")])
            .await
            .unwrap();
        store.append_messages(&sid, &[ChatMessage::user("c")]).await.unwrap();

        let last_two = store.load_history(&sid, 2).await.unwrap();
        let texts: Vec<_> = last_two.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert!(store
            .load_history(&SessionId::from_str("other"), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_per_thread() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let sid = SessionId::from_str(&format!("thread-{}", t));
                for i in 0..25 {
                    store
                        .append_messages(&sid, &[ChatMessage::user(format!("{}-{}", t, i))])
                        .await
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.threads().len(), 4);
        for t in 0..4 {
            let sid = SessionId::from_str(&format!("thread-{}", t));
            let history = store.load_history(&sid, 100).await.unwrap();
            assert_eq!(history.len(), 25);
            assert!(history.iter().all(|m| m.text().starts_with(&format!("{}-", t))));
            assert_eq!(history[24].text(), format!("{}-24", t));
        }
    }
}
