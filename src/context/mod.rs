//! Context building for assistant requests
//!
//! Combines:
//! - The profile preamble (frozen per conversation)
//! - The most recent turns that fit the token budget

mod builder;
mod profile;

pub use builder::{ContextBuilder, ContextConfig, ContextWindow, TurnTooLarge};
pub use profile::{Profile, ProfileReader};
