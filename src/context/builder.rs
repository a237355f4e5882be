//! Context window selection under a token budget

use crate::history::{Role, Turn};
use crate::inference::ChatMessage;
use crate::tokens::TokenEstimator;
use crate::{Error, Result};

/// Configuration for context building
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfig {
    /// Maximum tokens allowed in the assembled prompt (preamble + history)
    pub budget: usize,
    /// Optional cap on the number of included turns
    pub max_turns: Option<usize>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget: 2000,
            max_turns: None,
        }
    }
}

/// The newest turn alone exceeds what the budget leaves after the preamble
///
/// It is still sent; the remote model may summarize or reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnTooLarge {
    pub turn_tokens: usize,
    pub available_tokens: usize,
}

/// Turns selected for one request, with token accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindow {
    pub preamble: String,
    pub included_turns: Vec<Turn>,
    /// Older turns left out of this request (still in storage)
    pub excluded_turns: usize,
    pub preamble_tokens: usize,
    pub history_tokens: usize,
    pub total_tokens: usize,
    pub budget: usize,
    /// Set when the preamble estimate used the length fallback
    pub preamble_fallback: bool,
    pub oversized: Option<TurnTooLarge>,
}

impl ContextWindow {
    /// Whether the window stays within its budget
    #[must_use]
    pub const fn within_budget(&self) -> bool {
        self.total_tokens <= self.budget
    }

    /// Request messages: the preamble as a system message, then the included turns
    #[must_use]
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.included_turns.len() + 1);
        if !self.preamble.is_empty() {
            messages.push(ChatMessage::new(Role::System, self.preamble.clone()));
        }
        messages.extend(
            self.included_turns
                .iter()
                .map(|t| ChatMessage::new(t.role(), t.content().to_string())),
        );
        messages
    }
}

/// Selects the longest recent suffix of history that fits the budget
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    config: ContextConfig,
}

impl ContextBuilder {
    /// Create a new context builder
    #[must_use]
    pub const fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build a window for `history` (oldest first) behind `preamble`
    ///
    /// # Errors
    ///
    /// Returns `BudgetExceeded` if the preamble alone does not fit the budget
    pub fn build(
        &self,
        history: &[Turn],
        preamble: &str,
        estimator: &TokenEstimator,
    ) -> Result<ContextWindow> {
        let estimate = estimator.estimate(preamble);
        let mut window = self.select(history, estimate.tokens)?;
        window.preamble = preamble.to_string();
        window.preamble_fallback = estimate.fallback;
        Ok(window)
    }

    /// Select turns given an already-estimated preamble size
    ///
    /// # Errors
    ///
    /// Returns `BudgetExceeded` if `preamble_tokens` does not leave room under the budget
    pub fn select(&self, history: &[Turn], preamble_tokens: usize) -> Result<ContextWindow> {
        let budget = self.config.budget;
        if preamble_tokens >= budget {
            return Err(Error::BudgetExceeded {
                preamble_tokens,
                budget,
            });
        }

        let available = budget - preamble_tokens;
        let max_turns = self.config.max_turns.unwrap_or(usize::MAX);

        let mut history_tokens = 0;
        let mut count = 0;
        for turn in history.iter().rev() {
            if count >= max_turns {
                break;
            }
            let next = history_tokens + turn.token_count();
            if next > available {
                break;
            }
            history_tokens = next;
            count += 1;
        }

        // Never send an empty window when there is history: keep the newest turn alone
        let mut oversized = None;
        if count == 0
            && let Some(newest) = history.last()
        {
            count = 1;
            history_tokens = newest.token_count();
            oversized = Some(TurnTooLarge {
                turn_tokens: newest.token_count(),
                available_tokens: available,
            });
            tracing::warn!(
                turn_tokens = newest.token_count(),
                available,
                "newest turn exceeds remaining budget, sending it alone"
            );
        }

        let excluded_turns = history.len() - count;
        if excluded_turns > 0 {
            tracing::debug!(
                included = count,
                excluded = excluded_turns,
                history_tokens,
                budget,
                "evicted older turns from context window"
            );
        }

        Ok(ContextWindow {
            preamble: String::new(),
            included_turns: history[excluded_turns..].to_vec(),
            excluded_turns,
            preamble_tokens,
            history_tokens,
            total_tokens: preamble_tokens + history_tokens,
            budget,
            preamble_fallback: false,
            oversized,
        })
    }
}
