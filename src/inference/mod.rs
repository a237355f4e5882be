//! Inference collaborator interface
//!
//! The model call is external: a client takes an assembled request and hands
//! back a lazy, finite, non-restartable stream of reply fragments that ends
//! with [`Fragment::Done`] or an error.

mod openai;
mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

use crate::Result;
use crate::history::Role;

pub use openai::OpenAiCompatibleClient;
pub use sse::{SseEvent, SseLineBuffer};

/// One message of an assembled prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub const fn new(role: Role, content: String) -> Self {
        Self { role, content }
    }
}

/// A request handed to the inference collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// A piece of the streamed reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Reply text to append
    Delta(String),
    /// The reply is complete
    Done,
}

/// Reply stream; an `Err` item terminates it
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<Fragment>> + Send>>;

/// External model inference
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Submit a request and start streaming the reply
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be issued or is rejected
    async fn submit(&self, request: &ChatRequest) -> Result<FragmentStream>;
}
