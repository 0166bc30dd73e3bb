//! Voicebridge - Real-time Multimodal Conversation Server
//!
//! Server core for browser voice assistants:
//! - WebSocket transport with VAD-annotated audio frames and screen captures
//! - Speech-session aggregation with natural utterance boundaries
//! - STT -> LLM -> TTS inference pipeline with preemption and backpressure
//! - Per-connection conversation memory with LLM-backed summarisation
//!
//! # Example
//!
//! ```ignore
//! use voicebridge::config::Config;
//! use voicebridge::models::ModelClients;
//! use voicebridge::server::{self, ServerState};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::load()?);
//!     let clients = ModelClients::from_config(&config)?;
//!     server::start(ServerState::new(config, clients)).await
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod config;
pub mod protocol;
pub mod models;
pub mod memory;
pub mod session;
pub mod pipeline;
pub mod server;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;
pub use memory::{ConversationMemory, MemorySnapshot};
pub use models::{ModelClients, ModelError};
pub use protocol::{ClientMessage, ServerMessage};
pub use server::{start as start_server, ServerState};
pub use session::SpeechAggregator;
pub use types::{ConversationTurn, ErrorKind, SpeechSession, VadVerdict};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
