//! Token estimation for prompt budgeting
//!
//! Estimates are computed once per turn and cached on the turn, so every
//! estimator here must return the same count for the same text.

use std::sync::{Arc, LazyLock};

use regex::Regex;

/// Pre-tokenization pattern: contractions, letter runs with one leading
/// non-letter, digit groups, punctuation runs and whitespace
static PIECE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+",
    )
    .expect("valid regex")
});

/// Markers a BPE encoder refuses to encode from plain text
const SPECIAL_TOKENS: &[&str] = &[
    "<|endoftext|>",
    "<|fim_prefix|>",
    "<|fim_middle|>",
    "<|fim_suffix|>",
    "<|endofprompt|>",
];

/// Latin-script characters per token within one letter run
const CHARS_PER_TOKEN: usize = 5;

/// Characters per token for the fallback heuristic
const FALLBACK_CHARS_PER_TOKEN: usize = 3;

/// Reasons a tokenizer refuses text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizeError {
    #[error("text contains reserved special token {0}")]
    SpecialToken(&'static str),
}

/// A tokenizer that counts how many tokens a text encodes to
pub trait Tokenizer: Send + Sync {
    /// Number of tokens `text` encodes to
    ///
    /// # Errors
    ///
    /// Returns error if the text contains content the tokenizer cannot encode
    fn encode_len(&self, text: &str) -> std::result::Result<usize, TokenizeError>;
}

/// Regex pre-tokenizer approximating a byte-pair encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct PieceTokenizer;

impl Tokenizer for PieceTokenizer {
    fn encode_len(&self, text: &str) -> std::result::Result<usize, TokenizeError> {
        if let Some(special) = SPECIAL_TOKENS.iter().find(|s| text.contains(**s)) {
            return Err(TokenizeError::SpecialToken(*special));
        }

        Ok(PIECE_REGEX
            .find_iter(text)
            .map(|m| piece_cost(m.as_str()))
            .sum())
    }
}

/// Tokens charged for one pre-tokenized piece
fn piece_cost(piece: &str) -> usize {
    let mut wide: usize = 0;
    let mut narrow: usize = 0;
    for c in piece.chars() {
        if c.is_whitespace() {
            continue;
        }
        // Non-Latin scripts (CJK in particular) encode to roughly one token per char
        if c.is_alphabetic() && !c.is_ascii() && !is_latin_extended(c) {
            wide += 1;
        } else {
            narrow += 1;
        }
    }

    if wide == 0 && narrow == 0 {
        return 1;
    }

    wide + narrow.div_ceil(CHARS_PER_TOKEN)
}

const fn is_latin_extended(c: char) -> bool {
    matches!(c, '\u{00C0}'..='\u{024F}')
}

/// Length-based approximation used when the tokenizer refuses the text
#[must_use]
pub fn approximate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(FALLBACK_CHARS_PER_TOKEN)
}

/// Result of estimating one text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimate {
    pub tokens: usize,
    /// Set when the length heuristic stood in for the tokenizer
    pub fallback: bool,
}

/// Token estimator with a conservative fallback
#[derive(Clone)]
pub struct TokenEstimator {
    tokenizer: Arc<dyn Tokenizer>,
}

impl std::fmt::Debug for TokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEstimator").finish_non_exhaustive()
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(Arc::new(PieceTokenizer))
    }
}

impl TokenEstimator {
    /// Create an estimator backed by `tokenizer`
    #[must_use]
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer }
    }

    /// Estimate tokens for `text`, never failing
    #[must_use]
    pub fn estimate(&self, text: &str) -> TokenEstimate {
        match self.tokenizer.encode_len(text) {
            Ok(tokens) => TokenEstimate {
                tokens,
                fallback: false,
            },
            Err(e) => {
                let tokens = approximate_tokens(text);
                tracing::warn!(error = %e, tokens, "tokenizer refused text, using length estimate");
                TokenEstimate {
                    tokens,
                    fallback: true,
                }
            }
        }
    }

    /// Estimated token count for `text`
    #[must_use]
    pub fn count(&self, text: &str) -> usize {
        self.estimate(text).tokens
    }
}
