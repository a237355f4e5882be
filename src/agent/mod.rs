//! Turn orchestration
//!
//! A [`ConversationManager`] runs one turn at a time per conversation:
//! build the context window, stream the model's reply to the caller, and
//! append the exchange to history once the reply completes.

mod runner;

pub use runner::{
    ConversationManager, TurnConfig, TurnEvent, TurnOutcome, TurnRequest, TurnState, TurnWarning,
};
