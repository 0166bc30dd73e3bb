//! Per-connection memory registry
//!
//! Conversation memory outlives the transport by a grace period so a client
//! reconnecting with the same connection id resumes its logical session.
//! Claims within the window cancel the pending expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::memory::ConversationMemory;

struct Entry {
    memory: Arc<ConversationMemory>,
    /// Bumped on every claim/release; an expiry only fires if no claim
    /// happened after the release that scheduled it.
    generation: u64,
}

pub struct MemoryRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    grace: Duration,
}

impl MemoryRegistry {
    pub fn new(grace: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), grace }
    }

    /// Fetch the retained memory for `connection_id`, or create a fresh one.
    pub fn claim(
        &self,
        connection_id: &str,
        make: impl FnOnce() -> ConversationMemory,
    ) -> Arc<ConversationMemory> {
        let mut entries = self.entries.lock().expect("registry poisoned");
        match entries.get_mut(connection_id) {
            Some(entry) => {
                entry.generation += 1;
                debug!("{connection_id}: reclaimed memory within grace period");
                entry.memory.clone()
            }
            None => {
                let memory = Arc::new(make());
                entries.insert(
                    connection_id.to_string(),
                    Entry { memory: memory.clone(), generation: 0 },
                );
                memory
            }
        }
    }

    /// Mark the connection gone; its memory is freed after the grace period
    /// unless the id is claimed again first.
    pub fn release(self: &Arc<Self>, connection_id: String) {
        let generation = {
            let mut entries = self.entries.lock().expect("registry poisoned");
            match entries.get_mut(&connection_id) {
                Some(entry) => {
                    entry.generation += 1;
                    entry.generation
                }
                None => return,
            }
        };

        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(registry.grace).await;
            let mut entries = registry.entries.lock().expect("registry poisoned");
            if entries.get(&connection_id).is_some_and(|e| e.generation == generation) {
                entries.remove(&connection_id);
                debug!("{connection_id}: memory freed after grace period");
            }
        });
    }

    pub fn retained(&self) -> usize {
        self.entries.lock().expect("registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::models::{LanguageModel, LlmReply, ModelError, RespondRequest};
    use crate::types::ConversationTurn;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NoopLlm;

    #[async_trait]
    impl LanguageModel for NoopLlm {
        async fn respond(
            &self,
            _request: RespondRequest,
            _cancel: CancellationToken,
        ) -> Result<LlmReply, ModelError> {
            unimplemented!("registry tests never call the model")
        }

        async fn summarise(
            &self,
            _turns: Vec<ConversationTurn>,
            _existing_summary: String,
            _cancel: CancellationToken,
        ) -> Result<String, ModelError> {
            unimplemented!("registry tests never call the model")
        }
    }

    fn make_memory() -> ConversationMemory {
        ConversationMemory::new(Arc::new(NoopLlm), MemoryConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_survives_grace_reconnect() {
        let registry = Arc::new(MemoryRegistry::new(Duration::from_secs(30)));

        let memory = registry.claim("conn-1", make_memory);
        memory.append("hello", "hi", None);
        registry.release("conn-1".to_string());

        // Reconnect inside the grace window.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let memory = registry.claim("conn-1", make_memory);
        assert_eq!(memory.turn_count(), 1);

        // The stale expiry from the first release must not fire now.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(registry.retained(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_freed_after_grace() {
        let registry = Arc::new(MemoryRegistry::new(Duration::from_secs(30)));
        registry.claim("conn-1", make_memory);
        registry.release("conn-1".to_string());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.retained(), 0);
    }

    #[tokio::test]
    async fn test_distinct_ids_get_distinct_memory() {
        let registry = Arc::new(MemoryRegistry::new(Duration::from_secs(30)));
        let a = registry.claim("conn-a", make_memory);
        let b = registry.claim("conn-b", make_memory);
        a.append("only a", "ack", None);
        assert_eq!(a.turn_count(), 1);
        assert_eq!(b.turn_count(), 0);
    }
}
