//! Turn orchestration: context, inference, streaming, persistence

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::context::{ContextBuilder, ContextConfig, ContextWindow, Profile, TurnTooLarge};
use crate::history::{
    Conversation, ConversationSummary, HistoryStore, Role, Turn, carryover_turns,
    validate_conversation_id,
};
use crate::inference::{ChatRequest, Fragment, InferenceClient};
use crate::tokens::TokenEstimator;
use crate::{Error, Result};

/// Settings for every turn a manager runs
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub context: ContextConfig,
    /// LLM model identifier
    pub model: String,
    /// Max tokens per completion
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Keep only this many stored turns per conversation after each turn
    pub retain_turns: Option<usize>,
    /// Turns recalled from earlier conversations ahead of this one's history
    pub carryover_turns: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            context: ContextConfig::default(),
            model: "deepseek-chat".to_string(),
            max_output_tokens: Some(2000),
            temperature: None,
            retain_turns: None,
            carryover_turns: 30,
        }
    }
}

/// Where a turn is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    BuildingContext,
    AwaitingModel,
    Streaming,
    Persisting,
    Failed,
}

/// Non-fatal conditions reported alongside a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnWarning {
    /// The newest turn was sent alone and still exceeds the budget
    TurnTooLarge(TurnTooLarge),
    /// A token count came from the length heuristic
    TokenizationFallback { role: Role, tokens: usize },
    /// The reply was shown but may not survive a restart
    Durability(String),
}

impl std::fmt::Display for TurnWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TurnTooLarge(t) => write!(
                f,
                "latest turn needs {} tokens but only {} are available; sent anyway",
                t.turn_tokens, t.available_tokens
            ),
            Self::TokenizationFallback { role, tokens } => {
                write!(f, "{role} token count estimated from length ({tokens})")
            }
            Self::Durability(reason) => write!(f, "reply not saved: {reason}"),
        }
    }
}

/// Events emitted to the caller while a turn runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    State(TurnState),
    Delta(String),
    Warning(TurnWarning),
}

/// A single user message to process
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub message: String,
    /// Optional channel for streamed events; pass `None` for headless callers.
    /// Dropping the receiver abandons the turn.
    pub notify: Option<mpsc::Sender<TurnEvent>>,
}

impl TurnRequest {
    #[must_use]
    pub fn new(conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message: message.into(),
            notify: None,
        }
    }

    #[must_use]
    pub fn with_notify(mut self, notify: mpsc::Sender<TurnEvent>) -> Self {
        self.notify = Some(notify);
        self
    }
}

/// Result of a completed turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub included_turns: usize,
    pub excluded_turns: usize,
    pub prompt_tokens: usize,
    /// Whether both turns reached durable storage
    pub persisted: bool,
    pub warnings: Vec<TurnWarning>,
}

/// Drives turns for any number of conversations
///
/// At most one turn per conversation id runs at a time; different ids
/// proceed independently. Turn locks exist only while a turn for that id is
/// running or queued.
pub struct ConversationManager {
    store: Arc<dyn HistoryStore>,
    inference: Arc<dyn InferenceClient>,
    estimator: TokenEstimator,
    profile: Profile,
    builder: ContextBuilder,
    config: TurnConfig,
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationManager {
    /// Create a manager; `profile` is frozen into each new conversation
    #[must_use]
    pub fn new(
        store: Arc<dyn HistoryStore>,
        inference: Arc<dyn InferenceClient>,
        estimator: TokenEstimator,
        profile: Profile,
        config: TurnConfig,
    ) -> Self {
        Self {
            store,
            inference,
            estimator,
            profile,
            builder: ContextBuilder::new(config.context),
            config,
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    fn turn_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.turn_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Drop locks for conversations with no turn running or waiting
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(conversation_id.to_string()).or_default())
    }

    /// Full stored history of a conversation
    ///
    /// # Errors
    ///
    /// Returns error if the history cannot be read
    pub fn history(&self, conversation_id: &str) -> Result<Conversation> {
        self.store.load(conversation_id)
    }

    /// Stored conversations, most recent first
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be listed
    pub fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.store.list()
    }

    /// Drop stored turns from the head so at most `keep` remain
    ///
    /// # Errors
    ///
    /// Returns error if the trimmed history cannot be rewritten
    pub fn trim(&self, conversation_id: &str, keep: usize) -> Result<usize> {
        let removed = self.store.trim_to(conversation_id, keep)?;
        tracing::info!(conversation = conversation_id, removed, keep, "trimmed history");
        Ok(removed)
    }

    /// Compute the window the next turn would send, without calling the model
    ///
    /// # Errors
    ///
    /// Returns error if history cannot be read or the preamble exceeds the budget
    pub fn preview(&self, conversation_id: &str, message: &str) -> Result<ContextWindow> {
        let mut warnings = Vec::new();
        let (_, _, window) = self.build_context(conversation_id, message, &mut warnings)?;
        Ok(window)
    }

    fn carryover(&self, conversation: &Conversation) -> Vec<Turn> {
        match carryover_turns(self.store.as_ref(), conversation, self.config.carryover_turns) {
            Ok(turns) => {
                if !turns.is_empty() {
                    tracing::debug!(
                        conversation = conversation.id(),
                        turns = turns.len(),
                        "recalled turns from earlier conversations"
                    );
                }
                turns
            }
            Err(e) => {
                tracing::warn!(
                    conversation = conversation.id(),
                    error = %e,
                    "earlier conversations unavailable, continuing without them"
                );
                Vec::new()
            }
        }
    }

    /// Load history, create the user turn, and select the context window
    fn build_context(
        &self,
        conversation_id: &str,
        message: &str,
        warnings: &mut Vec<TurnWarning>,
    ) -> Result<(Turn, Profile, ContextWindow)> {
        validate_conversation_id(conversation_id)?;
        if message.trim().is_empty() {
            return Err(Error::EmptyMessage);
        }

        let mut conversation = self.store.load(conversation_id)?;
        let profile = conversation
            .profile_snapshot()
            .cloned()
            .unwrap_or_else(|| self.profile.clone());

        let (user_turn, estimate) =
            Turn::estimated(Role::User, message, Utc::now(), &self.estimator);
        if estimate.fallback {
            warnings.push(TurnWarning::TokenizationFallback {
                role: Role::User,
                tokens: estimate.tokens,
            });
        }
        // Carried-over turns sit before the conversation's own, so they are evicted first
        let mut history = self.carryover(&conversation);
        conversation.push(user_turn.clone());
        history.extend_from_slice(conversation.turns());

        let window = self
            .builder
            .build(&history, &profile.preamble(), &self.estimator)?;

        if window.preamble_fallback {
            warnings.push(TurnWarning::TokenizationFallback {
                role: Role::System,
                tokens: window.preamble_tokens,
            });
        }
        if let Some(oversized) = window.oversized {
            warnings.push(TurnWarning::TurnTooLarge(oversized));
        }

        Ok((user_turn, profile, window))
    }

    /// Run one turn: build context, stream the reply, persist both turns
    ///
    /// Nothing is appended unless the reply stream completes. Dropping the
    /// returned future, or the notify receiver, abandons the turn.
    ///
    /// # Errors
    ///
    /// Returns `BudgetExceeded` without contacting the model if the preamble
    /// does not fit, `Inference` if the model call fails or ends early, and
    /// `Cancelled` if the caller stops listening. Storage failures after the
    /// reply are reported as [`TurnWarning::Durability`] instead.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let TurnRequest {
            conversation_id,
            message,
            notify,
        } = request;
        let notify = notify.as_ref();

        let lock = self.turn_lock(&conversation_id);
        let _turn = lock.lock().await;

        let result = self.drive(&conversation_id, &message, notify).await;

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    conversation = %conversation_id,
                    reply_chars = outcome.reply.len(),
                    persisted = outcome.persisted,
                    warnings = outcome.warnings.len(),
                    "turn complete"
                );
            }
            Err(e) => {
                tracing::warn!(conversation = %conversation_id, error = %e, "turn failed");
                emit_quiet(notify, TurnEvent::State(TurnState::Failed)).await;
            }
        }
        emit_quiet(notify, TurnEvent::State(TurnState::Idle)).await;

        result
    }

    async fn drive(
        &self,
        conversation_id: &str,
        message: &str,
        notify: Option<&mpsc::Sender<TurnEvent>>,
    ) -> Result<TurnOutcome> {
        let mut warnings = Vec::new();

        emit(notify, TurnEvent::State(TurnState::BuildingContext)).await?;
        let (user_turn, profile, window) =
            self.build_context(conversation_id, message, &mut warnings)?;
        for warning in &warnings {
            emit(notify, TurnEvent::Warning(warning.clone())).await?;
        }

        tracing::debug!(
            conversation = conversation_id,
            included = window.included_turns.len(),
            excluded = window.excluded_turns,
            tokens = window.total_tokens,
            budget = window.budget,
            "context window built"
        );

        emit(notify, TurnEvent::State(TurnState::AwaitingModel)).await?;
        let chat_request = ChatRequest {
            model: self.config.model.clone(),
            messages: window.to_messages(),
            max_tokens: self.config.max_output_tokens,
            temperature: self.config.temperature,
        };
        let mut stream = self.inference.submit(&chat_request).await?;

        emit(notify, TurnEvent::State(TurnState::Streaming)).await?;
        let mut reply = String::new();
        loop {
            match stream.next().await {
                Some(Ok(Fragment::Delta(text))) => {
                    reply.push_str(&text);
                    emit(notify, TurnEvent::Delta(text)).await?;
                }
                Some(Ok(Fragment::Done)) => break,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(Error::Inference(
                        "reply stream ended without completion".to_string(),
                    ));
                }
            }
        }
        drop(stream);

        emit(notify, TurnEvent::State(TurnState::Persisting)).await?;
        let (persisted, late_warnings) = self.persist(conversation_id, user_turn, &reply, &profile);

        // The reply already reached the caller; a vanished listener no longer matters
        for warning in late_warnings {
            emit_quiet(notify, TurnEvent::Warning(warning.clone())).await;
            warnings.push(warning);
        }

        Ok(TurnOutcome {
            reply,
            included_turns: window.included_turns.len(),
            excluded_turns: window.excluded_turns,
            prompt_tokens: window.total_tokens,
            persisted,
            warnings,
        })
    }

    /// Append the completed exchange, then apply retention
    ///
    /// Failures here never fail the turn: the caller already has the reply.
    fn persist(
        &self,
        conversation_id: &str,
        user_turn: Turn,
        reply: &str,
        profile: &Profile,
    ) -> (bool, Vec<TurnWarning>) {
        let mut warnings = Vec::new();
        let (assistant_turn, estimate) =
            Turn::estimated(Role::Assistant, reply, Utc::now(), &self.estimator);
        if estimate.fallback {
            warnings.push(TurnWarning::TokenizationFallback {
                role: Role::Assistant,
                tokens: estimate.tokens,
            });
        }

        let persisted = match self.store.append_batch(
            conversation_id,
            vec![user_turn, assistant_turn],
            Some(profile),
        ) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    conversation = conversation_id,
                    error = %e,
                    "reply shown but not saved"
                );
                warnings.push(TurnWarning::Durability(e.to_string()));
                false
            }
        };

        if persisted
            && let Some(keep) = self.config.retain_turns
            && let Err(e) = self.trim(conversation_id, keep)
        {
            warnings.push(TurnWarning::Durability(format!("retention trim failed: {e}")));
        }

        (persisted, warnings)
    }
}

/// Send an event; a closed channel means the caller abandoned the turn
async fn emit(notify: Option<&mpsc::Sender<TurnEvent>>, event: TurnEvent) -> Result<()> {
    if let Some(tx) = notify {
        tx.send(event).await.map_err(|_| Error::Cancelled)?;
    }
    Ok(())
}

async fn emit_quiet(notify: Option<&mpsc::Sender<TurnEvent>>, event: TurnEvent) {
    if let Some(tx) = notify {
        let _ = tx.send(event).await;
    }
}
