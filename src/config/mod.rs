//! Configuration management for Recall
//!
//! Every setting resolves as environment variable, then TOML file, then
//! built-in default.

pub mod file;

use std::path::PathBuf;

use crate::agent::TurnConfig;
use crate::context::ContextConfig;
use crate::{Error, Result};

use file::RecallConfigFile;

const DEFAULT_CONTEXT_WINDOW: usize = 4000;
const DEFAULT_RESERVED_OUTPUT: usize = 2000;
const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/v1";
const DEFAULT_MODEL: &str = "deepseek-chat";
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 2000;
const DEFAULT_CARRYOVER_TURNS: usize = 30;

/// Recall configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Total model context window in tokens
    pub context_window_tokens: usize,

    /// Tokens kept free for the reply
    pub reserved_output_tokens: usize,

    /// Cap on turns included per request
    pub max_history_turns: Option<usize>,

    /// Stored turns kept per conversation after each turn
    pub retain_turns: Option<usize>,

    /// Turns recalled from earlier conversations (0 disables)
    pub carryover_turns: usize,

    /// Path to data directory (conversations live under `conversations/`)
    pub data_dir: PathBuf,

    /// Path to the user profile JSON
    pub profile_path: PathBuf,

    /// Model endpoint settings
    pub llm: LlmConfig,
}

/// OpenAI-compatible endpoint configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if a value fails to parse or the token budget is empty
    pub fn load() -> Result<Self> {
        Self::from_sources(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value fails to parse or the token budget is empty
    pub fn from_sources(
        fc: RecallConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let context_window_tokens = parse_env(&env, "RECALL_CONTEXT_WINDOW")?
            .or(fc.context.window_tokens)
            .unwrap_or(DEFAULT_CONTEXT_WINDOW);
        let reserved_output_tokens = parse_env(&env, "RECALL_RESERVED_OUTPUT")?
            .or(fc.context.reserved_output_tokens)
            .unwrap_or(DEFAULT_RESERVED_OUTPUT);
        let max_history_turns =
            parse_env(&env, "RECALL_MAX_HISTORY_TURNS")?.or(fc.context.max_history_turns);
        let retain_turns = parse_env(&env, "RECALL_RETAIN_TURNS")?.or(fc.storage.retain_turns);
        let carryover_turns = parse_env(&env, "RECALL_CARRYOVER_TURNS")?
            .or(fc.context.carryover_turns)
            .unwrap_or(DEFAULT_CARRYOVER_TURNS);

        // Data directory (~/.local/share/recall on Linux)
        let data_dir = env("RECALL_DATA_DIR")
            .or(fc.storage.data_dir)
            .map_or_else(default_data_dir, PathBuf::from);

        let profile_path = env("RECALL_PROFILE")
            .or(fc.storage.profile_path)
            .map_or_else(|| PathBuf::from("profile.json"), PathBuf::from);

        let llm = LlmConfig {
            base_url: env("RECALL_BASE_URL")
                .or(fc.llm.base_url)
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: env("RECALL_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key: env("DEEPSEEK_API_KEY").or(fc.llm.api_key),
            max_output_tokens: parse_env(&env, "RECALL_MAX_OUTPUT_TOKENS")?
                .or(fc.llm.max_output_tokens)
                .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
            temperature: parse_env(&env, "RECALL_TEMPERATURE")?.or(fc.llm.temperature),
        };

        let config = Self {
            context_window_tokens,
            reserved_output_tokens,
            max_history_turns,
            retain_turns,
            carryover_turns,
            data_dir,
            profile_path,
            llm,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns error if the prompt budget is empty or a turn cap is zero
    pub fn validate(&self) -> Result<()> {
        if self.budget() == 0 {
            return Err(Error::Config(format!(
                "context window ({}) must exceed reserved output tokens ({})",
                self.context_window_tokens, self.reserved_output_tokens
            )));
        }
        if self.max_history_turns == Some(0) {
            return Err(Error::Config(
                "max_history_turns must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Tokens available for preamble plus history
    #[must_use]
    pub const fn budget(&self) -> usize {
        self.context_window_tokens
            .saturating_sub(self.reserved_output_tokens)
    }

    /// Directory holding one JSON file per conversation
    #[must_use]
    pub fn conversations_dir(&self) -> PathBuf {
        self.data_dir.join("conversations")
    }

    #[must_use]
    pub const fn context_config(&self) -> ContextConfig {
        ContextConfig {
            budget: self.budget(),
            max_turns: self.max_history_turns,
        }
    }

    /// Per-turn settings for a [`crate::agent::ConversationManager`]
    #[must_use]
    pub fn turn_config(&self) -> TurnConfig {
        TurnConfig {
            context: self.context_config(),
            model: self.llm.model.clone(),
            max_output_tokens: Some(self.llm.max_output_tokens),
            temperature: self.llm.temperature,
            retain_turns: self.retain_turns,
            carryover_turns: self.carryover_turns,
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/recall"),
        |d| d.data_dir().join("recall"),
    )
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let config = Config::from_sources(RecallConfigFile::default(), env_from(&[])).unwrap();
        assert_eq!(config.budget(), 2000);
        assert_eq!(config.llm.model, "deepseek-chat");
        assert_eq!(config.llm.base_url, "https://api.deepseek.com/v1");
        assert_eq!(config.profile_path, PathBuf::from("profile.json"));
        assert!(config.max_history_turns.is_none());
        assert_eq!(config.carryover_turns, 30);
        assert!(config.conversations_dir().ends_with("conversations"));
    }

    #[test]
    fn env_overrides_file() {
        let mut fc = RecallConfigFile::default();
        fc.context.window_tokens = Some(8000);
        fc.llm.model = Some("from-file".to_string());
        fc.storage.retain_turns = Some(40);

        let config = Config::from_sources(
            fc,
            env_from(&[
                ("RECALL_CONTEXT_WINDOW", "6000"),
                ("DEEPSEEK_API_KEY", "sk-test"),
                ("RECALL_CARRYOVER_TURNS", "0"),
            ]),
        )
        .unwrap();

        assert_eq!(config.context_window_tokens, 6000);
        assert_eq!(config.llm.model, "from-file");
        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.turn_config().retain_turns, Some(40));
        assert_eq!(config.turn_config().carryover_turns, 0);
    }

    #[test]
    fn empty_budget_is_config_error() {
        let err = Config::from_sources(
            RecallConfigFile::default(),
            env_from(&[("RECALL_CONTEXT_WINDOW", "2000")]),
        )
        .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn zero_turn_cap_is_config_error() {
        let err = Config::from_sources(
            RecallConfigFile::default(),
            env_from(&[("RECALL_MAX_HISTORY_TURNS", "0")]),
        )
        .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn unparseable_number_is_config_error() {
        let err = Config::from_sources(
            RecallConfigFile::default(),
            env_from(&[("RECALL_RESERVED_OUTPUT", "lots")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(m) if m.contains("RECALL_RESERVED_OUTPUT")));
    }
}
