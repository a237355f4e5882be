//! Recall - conversation context manager for LLM chat front-ends
//!
//! Keeps per-conversation history durable, decides which slice of it fits
//! the model's context window next to a fixed profile preamble, and streams
//! replies back while recording each completed exchange.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        CLI  (chat, send, list, preview)       │
//! └──────────────────────┬───────────────────────┘
//!                        │
//! ┌──────────────────────▼───────────────────────┐
//! │            ConversationManager                │
//! │   BuildingContext → AwaitingModel → Stream    │
//! └──────┬──────────────┬───────────────┬────────┘
//!        │              │               │
//! ┌──────▼─────┐ ┌──────▼──────┐ ┌──────▼───────┐
//! │HistoryStore│ │ContextBuilder│ │InferenceClient│
//! │  (JSON)    │ │ + Tokenizer  │ │  (SSE)        │
//! └────────────┘ └─────────────┘ └──────────────┘
//! ```

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod inference;
pub mod tokens;

pub use agent::{
    ConversationManager, TurnConfig, TurnEvent, TurnOutcome, TurnRequest, TurnState, TurnWarning,
};
pub use config::Config;
pub use context::{ContextBuilder, ContextConfig, ContextWindow, Profile, ProfileReader};
pub use error::{Error, Result};
pub use history::{Conversation, FileHistoryStore, HistoryStore, MemoryHistoryStore, Role, Turn};
pub use inference::{InferenceClient, OpenAiCompatibleClient};
pub use tokens::TokenEstimator;
