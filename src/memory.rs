//! Conversation memory store
//!
//! Per-connection bounded-token history: recent turns verbatim plus one
//! rolling summary of everything older. When the estimated footprint
//! exceeds the budget, the oldest verbatim turns are folded into the
//! summary through the LLM adapter. Appends are never lossy: a turn is
//! only dropped from verbatim storage after its summary replacement has
//! been committed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::models::LanguageModel;
use crate::types::ConversationTurn;

/// The bounded, possibly summarised conversation state handed to the LLM
/// for one call. Estimated token count never exceeds the configured budget.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    pub summary: String,
    pub turns: Vec<ConversationTurn>,
}

impl MemorySnapshot {
    pub fn estimated_tokens(&self) -> usize {
        self.summary.len().div_ceil(4)
            + self.turns.iter().map(ConversationTurn::estimated_tokens).sum::<usize>()
    }
}

struct MemoryState {
    summary: String,
    turns: VecDeque<ConversationTurn>,
}

impl MemoryState {
    fn estimated_tokens(&self) -> usize {
        self.summary.len().div_ceil(4)
            + self.turns.iter().map(ConversationTurn::estimated_tokens).sum::<usize>()
    }
}

/// Per-connection conversation memory. Created with the connection, retained
/// for the reconnect grace period, freed after.
pub struct ConversationMemory {
    state: Arc<Mutex<MemoryState>>,
    llm: Arc<dyn LanguageModel>,
    config: MemoryConfig,
    /// Held for the duration of an in-flight summarisation; `snapshot`
    /// waits on it (bounded) so fresh summaries win when they are quick.
    summarise_gate: Arc<tokio::sync::Mutex<()>>,
    next_seq: AtomicU64,
}

impl ConversationMemory {
    pub fn new(llm: Arc<dyn LanguageModel>, config: MemoryConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                summary: String::new(),
                turns: VecDeque::new(),
            })),
            llm,
            config,
            summarise_gate: Arc::new(tokio::sync::Mutex::new(())),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Record a completed exchange. Triggers background summarisation when
    /// the stored estimate exceeds the budget.
    pub fn append(
        &self,
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
        screen_summary: Option<String>,
    ) {
        let turn = ConversationTurn {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
            screen_summary,
            created_at: Utc::now(),
        };

        let over_budget = {
            let mut state = self.state.lock().expect("memory state poisoned");
            state.turns.push_back(turn);
            state.estimated_tokens() > self.config.max_tokens
                && state.turns.len() > self.config.keep_recent_turns
        };

        if over_budget {
            self.spawn_summarise();
        }
    }

    /// Current memory state for one LLM call. Waits (bounded) for an
    /// in-flight summarisation, then enforces the token budget strictly:
    /// oldest verbatim turns are truncated out of the snapshot if the
    /// stored state still exceeds it.
    pub async fn snapshot(&self) -> MemorySnapshot {
        let wait = Duration::from_secs(self.config.summarise_wait_s);
        if tokio::time::timeout(wait, self.summarise_gate.lock()).await.is_err() {
            debug!("summarisation still in flight, snapshotting pre-summary state");
        }

        let state = self.state.lock().expect("memory state poisoned");

        let mut summary = state.summary.clone();
        // A runaway summary alone must not bust the budget.
        let summary_budget = self.config.max_tokens * 4;
        if summary.len() > summary_budget {
            let mut cut = summary_budget;
            while !summary.is_char_boundary(cut) {
                cut -= 1;
            }
            summary.truncate(cut);
        }

        let mut budget = self.config.max_tokens.saturating_sub(summary.len().div_ceil(4));
        let mut turns: Vec<ConversationTurn> = Vec::with_capacity(state.turns.len());
        for turn in state.turns.iter().rev() {
            let cost = turn.estimated_tokens();
            if cost > budget {
                break;
            }
            budget -= cost;
            turns.push(turn.clone());
        }
        turns.reverse();

        MemorySnapshot { summary, turns }
    }

    /// Drop all stored conversation state.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("memory state poisoned");
        state.summary.clear();
        state.turns.clear();
    }

    pub fn turn_count(&self) -> usize {
        self.state.lock().expect("memory state poisoned").turns.len()
    }

    /// Fold the oldest verbatim turns into the rolling summary. Runs off the
    /// hot path; failure leaves the stored state untouched for a later
    /// attempt (snapshots still honour the budget by truncation).
    fn spawn_summarise(&self) {
        let state = self.state.clone();
        let llm = self.llm.clone();
        let gate = self.summarise_gate.clone();
        let keep_recent = self.config.keep_recent_turns;

        tokio::spawn(async move {
            let _guard = gate.lock().await;

            let (to_compress, existing_summary) = {
                let state = state.lock().expect("memory state poisoned");
                let n = state.turns.len().saturating_sub(keep_recent);
                if n == 0 {
                    return;
                }
                let to_compress: Vec<ConversationTurn> =
                    state.turns.iter().take(n).cloned().collect();
                (to_compress, state.summary.clone())
            };

            let last_seq = to_compress.last().map(|t| t.seq).unwrap_or(0);
            debug!("summarising {} oldest turns (through seq {last_seq})", to_compress.len());

            match llm
                .summarise(to_compress, existing_summary, CancellationToken::new())
                .await
            {
                Ok(new_summary) => {
                    let mut state = state.lock().expect("memory state poisoned");
                    state.turns.retain(|t| t.seq > last_seq);
                    state.summary = new_summary;
                    debug!(
                        "summary committed, {} verbatim turns remain (~{} tokens)",
                        state.turns.len(),
                        state.estimated_tokens()
                    );
                }
                Err(e) => {
                    warn!("memory summarisation failed, keeping verbatim turns: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        LlmReply, ModelError, RespondRequest,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Scripted summariser: counts calls, returns a fixed summary after an
    /// optional delay, or fails.
    struct FakeSummariser {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl FakeSummariser {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), delay: Duration::ZERO, fail: false })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), delay, fail: false })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), delay: Duration::ZERO, fail: true })
        }
    }

    #[async_trait]
    impl LanguageModel for FakeSummariser {
        async fn respond(
            &self,
            _request: RespondRequest,
            _cancel: CancellationToken,
        ) -> Result<LlmReply, ModelError> {
            unimplemented!("summariser fake")
        }

        async fn summarise(
            &self,
            turns: Vec<ConversationTurn>,
            _existing_summary: String,
            _cancel: CancellationToken,
        ) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(ModelError::Unavailable("summariser down".into()));
            }
            Ok(format!("summary of {} turns", turns.len()))
        }
    }

    fn small_config() -> MemoryConfig {
        MemoryConfig { max_tokens: 100, keep_recent_turns: 2, summarise_wait_s: 5 }
    }

    #[tokio::test]
    async fn test_append_then_snapshot() {
        let memory = ConversationMemory::new(FakeSummariser::new(), MemoryConfig::default());
        memory.append("hello", "hi there", None);

        let snapshot = memory.snapshot().await;
        assert_eq!(snapshot.turns.len(), 1);
        assert_eq!(snapshot.turns[0].user_text, "hello");
        assert!(snapshot.summary.is_empty());
    }

    #[tokio::test]
    async fn test_over_budget_triggers_summarisation() {
        let llm = FakeSummariser::new();
        let memory = ConversationMemory::new(llm.clone(), small_config());

        let filler = "x".repeat(120); // ~30 tokens per side
        for i in 0..6 {
            memory.append(format!("q{i} {filler}"), format!("a{i} {filler}"), None);
        }

        // Let the background summarisation land.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if llm.calls.load(Ordering::SeqCst) > 0 && memory.turn_count() <= 2 {
                break;
            }
        }

        assert!(llm.calls.load(Ordering::SeqCst) >= 1);
        assert!(memory.turn_count() <= 2, "oldest turns should be absorbed");
        let snapshot = memory.snapshot().await;
        assert!(snapshot.summary.contains("summary of"));
    }

    #[tokio::test]
    async fn test_snapshot_budget_is_strict_even_without_summary() {
        // Summariser never succeeds, so the stored state stays over budget;
        // the snapshot must truncate to honour the bound regardless.
        let memory = ConversationMemory::new(FakeSummariser::failing(), small_config());
        let filler = "y".repeat(200);
        for i in 0..8 {
            memory.append(format!("q{i} {filler}"), format!("a{i} {filler}"), None);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = memory.snapshot().await;
        assert!(
            snapshot.estimated_tokens() <= 100,
            "snapshot estimate {} exceeds budget",
            snapshot.estimated_tokens()
        );
        // Newest turns are the ones kept.
        if let Some(last) = snapshot.turns.last() {
            assert!(last.user_text.starts_with("q7"));
        }
        // Stored state is still lossless.
        assert_eq!(memory.turn_count(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_falls_back_when_summarisation_is_slow() {
        let llm = FakeSummariser::slow(Duration::from_secs(60));
        let config = MemoryConfig { summarise_wait_s: 1, ..small_config() };
        let memory = ConversationMemory::new(llm, config);

        let filler = "z".repeat(120);
        for i in 0..6 {
            memory.append(format!("q{i} {filler}"), format!("a{i} {filler}"), None);
        }
        tokio::task::yield_now().await;

        // The summariser holds the gate for 60s; snapshot must return after
        // its 1s bound with the pre-summary state.
        let snapshot = memory.snapshot().await;
        assert!(snapshot.summary.is_empty());
        assert!(!snapshot.turns.is_empty());
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let memory = ConversationMemory::new(FakeSummariser::new(), MemoryConfig::default());
        memory.append("a", "b", None);
        memory.clear();
        let snapshot = memory.snapshot().await;
        assert!(snapshot.summary.is_empty());
        assert!(snapshot.turns.is_empty());
        assert_eq!(memory.turn_count(), 0);
    }

    #[tokio::test]
    async fn test_turn_order_preserved() {
        let memory = ConversationMemory::new(FakeSummariser::new(), MemoryConfig::default());
        memory.append("first", "1", None);
        memory.append("second", "2", None);
        let snapshot = memory.snapshot().await;
        assert_eq!(snapshot.turns[0].user_text, "first");
        assert_eq!(snapshot.turns[1].user_text, "second");
        assert!(snapshot.turns[0].seq < snapshot.turns[1].seq);
    }
}
