//! Conversation and turn types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::Profile;
use crate::tokens::{TokenEstimate, TokenEstimator};
use crate::{Error, Result};

/// Longest accepted conversation id
const MAX_ID_LEN: usize = 128;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One utterance in a conversation
///
/// `token_count` is fixed when the turn is created and never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    content: String,
    timestamp: DateTime<Utc>,
    token_count: usize,
}

impl Turn {
    /// Create a turn, estimating its token count once
    #[must_use]
    pub fn estimated(
        role: Role,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        estimator: &TokenEstimator,
    ) -> (Self, TokenEstimate) {
        let content = content.into();
        let estimate = estimator.estimate(&content);
        let turn = Self {
            role,
            content,
            timestamp,
            token_count: estimate.tokens,
        };
        (turn, estimate)
    }

    /// Create a turn with a token count computed elsewhere
    #[must_use]
    pub fn with_token_count(
        role: Role,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        token_count: usize,
    ) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
            token_count,
        }
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[must_use]
    pub const fn token_count(&self) -> usize {
        self.token_count
    }
}

/// An ordered sequence of turns plus the profile frozen at creation
///
/// Turns are only ever appended at the tail or removed from the head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    id: String,
    #[serde(default)]
    profile_snapshot: Option<Profile>,
    #[serde(default)]
    turns: Vec<Turn>,
}

impl Conversation {
    /// Create an empty conversation
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            profile_snapshot: None,
            turns: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    #[must_use]
    pub const fn profile_snapshot(&self) -> Option<&Profile> {
        self.profile_snapshot.as_ref()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Sum of cached token counts across all turns
    #[must_use]
    pub fn total_tokens(&self) -> usize {
        self.turns.iter().map(Turn::token_count).sum()
    }

    /// Timestamp of the newest turn
    #[must_use]
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.turns.last().map(Turn::timestamp)
    }

    /// Freeze `profile` into the conversation unless one is already frozen
    pub fn freeze_profile(&mut self, profile: Profile) {
        if self.profile_snapshot.is_none() {
            self.profile_snapshot = Some(profile);
        }
    }

    /// Append a turn at the tail
    ///
    /// A timestamp older than the current tail is raised to the tail's so
    /// timestamps never decrease.
    pub fn push(&mut self, mut turn: Turn) {
        if let Some(last) = self.turns.last()
            && turn.timestamp < last.timestamp
        {
            turn.timestamp = last.timestamp;
        }
        self.turns.push(turn);
    }

    /// Drop turns from the head so at most `keep` remain; returns how many were removed
    pub fn trim_to(&mut self, keep: usize) -> usize {
        let removed = self.turns.len().saturating_sub(keep);
        if removed > 0 {
            self.turns.drain(..removed);
        }
        removed
    }
}

/// Check that `id` is usable as a storage key
///
/// # Errors
///
/// Returns `InvalidConversationId` unless the id is 1 to 128 characters of
/// ASCII letters, digits, `_` or `-`
pub fn validate_conversation_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidConversationId(id.to_string()))
    }
}

/// Generate a conversation id from the current time
#[must_use]
pub fn generate_conversation_id() -> String {
    format!("conversation_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Disambiguate an id that is already taken
#[must_use]
pub fn with_unique_suffix(id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{id}_{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn turn(content: &str, at: DateTime<Utc>) -> Turn {
        Turn::with_token_count(Role::User, content, at, 1)
    }

    #[test]
    fn estimated_turn_caches_count() {
        let estimator = TokenEstimator::default();
        let (turn, estimate) = Turn::estimated(Role::User, "Hello, world!", Utc::now(), &estimator);
        assert_eq!(turn.token_count(), estimate.tokens);
        assert_eq!(turn.token_count(), estimator.count("Hello, world!"));
    }

    #[test]
    fn push_keeps_timestamps_non_decreasing() {
        let now = Utc::now();
        let mut conversation = Conversation::new("c1");
        conversation.push(turn("first", now));
        conversation.push(turn("second", now - Duration::seconds(30)));

        let turns = conversation.turns();
        assert_eq!(turns[1].timestamp(), turns[0].timestamp());
        assert_eq!(turns[1].content(), "second");
    }

    #[test]
    fn trim_removes_from_head() {
        let now = Utc::now();
        let mut conversation = Conversation::new("c1");
        for i in 0..5 {
            conversation.push(turn(&format!("t{i}"), now));
        }

        assert_eq!(conversation.trim_to(2), 3);
        let contents: Vec<&str> = conversation.turns().iter().map(Turn::content).collect();
        assert_eq!(contents, vec!["t3", "t4"]);
        assert_eq!(conversation.trim_to(10), 0);
    }

    #[test]
    fn profile_is_frozen_once() {
        let mut conversation = Conversation::new("c1");
        conversation.freeze_profile(Profile {
            name: "First".to_string(),
            ..Profile::default()
        });
        conversation.freeze_profile(Profile {
            name: "Second".to_string(),
            ..Profile::default()
        });
        assert_eq!(conversation.profile_snapshot().unwrap().name, "First");
    }

    #[test]
    fn conversation_id_validation() {
        assert!(validate_conversation_id("conversation_20240101_120000").is_ok());
        assert!(validate_conversation_id("abc-DEF_123").is_ok());
        assert!(validate_conversation_id("").is_err());
        assert!(validate_conversation_id("../etc/passwd").is_err());
        assert!(validate_conversation_id("has space").is_err());
        assert!(validate_conversation_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn generated_id_is_valid() {
        let id = generate_conversation_id();
        assert!(id.starts_with("conversation_"));
        assert!(validate_conversation_id(&id).is_ok());
        assert!(validate_conversation_id(&with_unique_suffix(&id)).is_ok());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
    }
}
