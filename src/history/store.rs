//! Durable conversation history

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;

use super::conversation::{Conversation, Turn, validate_conversation_id};
use super::lock::KeyedLocks;
use crate::context::Profile;
use crate::{Error, Result};

/// Listing entry for a stored conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: String,
    pub turns: usize,
    pub total_tokens: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&Conversation> for ConversationSummary {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id().to_string(),
            turns: conversation.len(),
            total_tokens: conversation.total_tokens(),
            updated_at: conversation.updated_at(),
        }
    }
}

/// Durable mapping from conversation id to its ordered turns
///
/// All operations on one id are mutually exclusive. `load` of an unknown id
/// returns an empty conversation.
pub trait HistoryStore: Send + Sync {
    /// Full persisted history, or an empty conversation if none exists
    ///
    /// # Errors
    ///
    /// Returns error if stored data exists but cannot be read
    fn load(&self, conversation_id: &str) -> Result<Conversation>;

    /// Atomically replace everything stored for `conversation.id()`
    ///
    /// # Errors
    ///
    /// Returns error if the medium is unwritable; the previous content is kept
    fn persist_full(&self, conversation: &Conversation) -> Result<()>;

    /// Load and mutate one conversation under its lock, rewriting it only
    /// when `f` reports a change
    ///
    /// # Errors
    ///
    /// Returns error if the read or the rewrite fails
    fn modify(
        &self,
        conversation_id: &str,
        f: &mut dyn FnMut(&mut Conversation) -> bool,
    ) -> Result<Conversation>;

    /// Summaries of every stored conversation, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be enumerated
    fn list(&self) -> Result<Vec<ConversationSummary>>;

    /// Append one turn at the tail
    ///
    /// # Errors
    ///
    /// Returns error if the turn could not be durably saved
    fn append(&self, conversation_id: &str, turn: Turn) -> Result<()> {
        self.append_batch(conversation_id, vec![turn], None)
    }

    /// Append several turns in one write, freezing `profile` if the
    /// conversation has no snapshot yet
    ///
    /// # Errors
    ///
    /// Returns error if the turns could not be durably saved
    fn append_batch(
        &self,
        conversation_id: &str,
        turns: Vec<Turn>,
        profile: Option<&Profile>,
    ) -> Result<()> {
        let mut turns = Some(turns);
        self.modify(conversation_id, &mut |conversation| {
            if let Some(profile) = profile {
                conversation.freeze_profile(profile.clone());
            }
            for turn in turns.take().into_iter().flatten() {
                conversation.push(turn);
            }
            true
        })
        .map(|_| ())
    }

    /// Remove turns from the head so at most `keep` remain
    ///
    /// # Errors
    ///
    /// Returns error if the trimmed history could not be rewritten
    fn trim_to(&self, conversation_id: &str, keep: usize) -> Result<usize> {
        let mut removed = 0;
        self.modify(conversation_id, &mut |conversation| {
            removed = conversation.trim_to(keep);
            removed > 0
        })?;
        Ok(removed)
    }

    /// Whether any turns are stored for `conversation_id`
    ///
    /// # Errors
    ///
    /// Returns error if stored data cannot be read
    fn exists(&self, conversation_id: &str) -> Result<bool> {
        Ok(!self.load(conversation_id)?.is_empty())
    }
}

fn storage_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Storage(format!("{context}: {e}"))
}

fn sort_summaries(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
}

/// One JSON file per conversation under a directory
///
/// Writes go to a temp file in the same directory and are renamed over the
/// target, so a crash leaves either the old or the new file.
#[derive(Debug)]
pub struct FileHistoryStore {
    dir: PathBuf,
    locks: KeyedLocks,
}

impl FileHistoryStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| storage_error(&format!("failed to create {}", dir.display()), e))?;
        Ok(Self {
            dir,
            locks: KeyedLocks::new(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, conversation_id: &str) -> Result<PathBuf> {
        validate_conversation_id(conversation_id)?;
        Ok(self.dir.join(format!("{conversation_id}.json")))
    }

    fn read(&self, conversation_id: &str) -> Result<Conversation> {
        let path = self.path_for(conversation_id)?;

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Conversation::new(conversation_id));
            }
            Err(e) => return Err(storage_error(&format!("failed to read {}", path.display()), e)),
        };

        let conversation: Conversation = serde_json::from_str(&content)
            .map_err(|e| storage_error(&format!("corrupt conversation file {}", path.display()), e))?;

        if conversation.id() != conversation_id {
            return Err(Error::Storage(format!(
                "{} holds conversation {}",
                path.display(),
                conversation.id()
            )));
        }

        Ok(conversation)
    }

    fn write(&self, conversation: &Conversation) -> Result<()> {
        let path = self.path_for(conversation.id())?;
        let data = serde_json::to_vec_pretty(conversation)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| storage_error("failed to create temp file", e))?;
        tmp.write_all(&data)
            .map_err(|e| storage_error("failed to write temp file", e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| storage_error("failed to sync temp file", e))?;
        tmp.persist(&path)
            .map_err(|e| storage_error(&format!("failed to replace {}", path.display()), e.error))?;

        tracing::debug!(
            conversation = conversation.id(),
            turns = conversation.len(),
            "persisted conversation"
        );
        Ok(())
    }
}

impl HistoryStore for FileHistoryStore {
    fn load(&self, conversation_id: &str) -> Result<Conversation> {
        validate_conversation_id(conversation_id)?;
        self.locks.with(conversation_id, || self.read(conversation_id))
    }

    fn persist_full(&self, conversation: &Conversation) -> Result<()> {
        validate_conversation_id(conversation.id())?;
        self.locks.with(conversation.id(), || self.write(conversation))
    }

    fn modify(
        &self,
        conversation_id: &str,
        f: &mut dyn FnMut(&mut Conversation) -> bool,
    ) -> Result<Conversation> {
        validate_conversation_id(conversation_id)?;
        self.locks.with(conversation_id, || {
            let mut conversation = self.read(conversation_id)?;
            if f(&mut conversation) {
                self.write(&conversation)?;
            }
            Ok(conversation)
        })
    }

    fn list(&self) -> Result<Vec<ConversationSummary>> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| storage_error(&format!("failed to list {}", self.dir.display()), e))?;

        let mut summaries = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_conversation_id(id).is_err() {
                continue;
            }

            match self.load(id) {
                Ok(conversation) => summaries.push(ConversationSummary::from(&conversation)),
                Err(e) => {
                    tracing::warn!(conversation = id, error = %e, "skipping unreadable conversation");
                }
            }
        }

        sort_summaries(&mut summaries);
        Ok(summaries)
    }
}

/// In-process store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    conversations: Mutex<HashMap<String, Conversation>>,
    fail_writes: AtomicBool,
}

impl MemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail as if the medium were unwritable
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage("medium is not writable".to_string()));
        }
        Ok(())
    }

    fn map(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Conversation>>> {
        self.conversations
            .lock()
            .map_err(|_| Error::Storage("memory store poisoned".to_string()))
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn load(&self, conversation_id: &str) -> Result<Conversation> {
        validate_conversation_id(conversation_id)?;
        Ok(self
            .map()?
            .get(conversation_id)
            .cloned()
            .unwrap_or_else(|| Conversation::new(conversation_id)))
    }

    fn persist_full(&self, conversation: &Conversation) -> Result<()> {
        validate_conversation_id(conversation.id())?;
        let mut map = self.map()?;
        self.check_writable()?;
        map.insert(conversation.id().to_string(), conversation.clone());
        Ok(())
    }

    fn modify(
        &self,
        conversation_id: &str,
        f: &mut dyn FnMut(&mut Conversation) -> bool,
    ) -> Result<Conversation> {
        validate_conversation_id(conversation_id)?;
        let mut map = self.map()?;
        let mut conversation = map
            .get(conversation_id)
            .cloned()
            .unwrap_or_else(|| Conversation::new(conversation_id));
        if f(&mut conversation) {
            self.check_writable()?;
            map.insert(conversation_id.to_string(), conversation.clone());
        }
        Ok(conversation)
    }

    fn list(&self) -> Result<Vec<ConversationSummary>> {
        let mut summaries: Vec<ConversationSummary> =
            self.map()?.values().map(ConversationSummary::from).collect();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }
}
