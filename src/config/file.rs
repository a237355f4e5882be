//! TOML configuration file loading
//!
//! Supports `~/.config/recall/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct RecallConfigFile {
    /// Context window sizing
    #[serde(default)]
    pub context: ContextFileConfig,

    /// LLM configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Where conversations and the profile live
    #[serde(default)]
    pub storage: StorageFileConfig,
}

/// Context window configuration
#[derive(Debug, Default, Deserialize)]
pub struct ContextFileConfig {
    /// Total model context window in tokens
    pub window_tokens: Option<usize>,
    /// Tokens kept free for the reply
    pub reserved_output_tokens: Option<usize>,
    /// Cap on turns included per request
    pub max_history_turns: Option<usize>,
    /// Turns recalled from earlier conversations
    pub carryover_turns: Option<usize>,
}

/// LLM-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible base URL (e.g. `https://api.deepseek.com/v1`)
    pub base_url: Option<String>,
    /// Model identifier (e.g. "deepseek-chat")
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Storage configuration
#[derive(Debug, Default, Deserialize)]
pub struct StorageFileConfig {
    pub data_dir: Option<String>,
    pub profile_path: Option<String>,
    /// Keep only this many turns per stored conversation
    pub retain_turns: Option<usize>,
}

/// Load the TOML config file from the standard path
///
/// Returns `RecallConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> RecallConfigFile {
    config_file_path().map_or_else(RecallConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from `path`, falling back to defaults
pub fn load_config_file_from(path: &Path) -> RecallConfigFile {
    if !path.exists() {
        return RecallConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                RecallConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            RecallConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/recall/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("recall").join("config.toml"))
}
