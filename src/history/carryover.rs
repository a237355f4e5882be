//! Memory carried over from earlier conversations

use super::conversation::{Conversation, Turn};
use super::store::HistoryStore;
use crate::Result;

/// Recent turns from other conversations that precede `current`
///
/// Conversations are visited most recently updated first until `max_turns`
/// turns are collected. Only turns older than the first turn of `current`
/// count, so a resumed conversation never sees what happened after it began.
/// Each conversation contributes a contiguous tail; tails are ordered by
/// their newest turn, oldest tail first.
///
/// # Errors
///
/// Returns error if the store cannot be listed; unreadable conversations
/// are skipped with a warning
pub fn carryover_turns(
    store: &dyn HistoryStore,
    current: &Conversation,
    max_turns: usize,
) -> Result<Vec<Turn>> {
    if max_turns == 0 {
        return Ok(Vec::new());
    }

    let cutoff = current.turns().first().map(Turn::timestamp);
    let mut tails: Vec<Vec<Turn>> = Vec::new();
    let mut collected = 0;

    for summary in store.list()? {
        if collected >= max_turns {
            break;
        }
        if summary.id == current.id() {
            continue;
        }

        let conversation = match store.load(&summary.id) {
            Ok(conversation) => conversation,
            Err(e) => {
                tracing::warn!(
                    conversation = %summary.id,
                    error = %e,
                    "skipping conversation for carry-over"
                );
                continue;
            }
        };

        let earlier: Vec<&Turn> = conversation
            .turns()
            .iter()
            .filter(|t| cutoff.is_none_or(|c| t.timestamp() < c))
            .collect();
        let take = earlier.len().min(max_turns - collected);
        if take == 0 {
            continue;
        }

        tails.push(earlier[earlier.len() - take..].iter().map(|t| (*t).clone()).collect());
        collected += take;
    }

    tails.sort_by_key(|tail| tail.last().map(Turn::timestamp));
    Ok(tails.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::history::{MemoryHistoryStore, Role};

    fn seed(store: &MemoryHistoryStore, id: &str, contents: &[&str], minutes_ago: i64) {
        let start = Utc::now() - Duration::minutes(minutes_ago);
        for (i, content) in contents.iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            let offset = Duration::seconds(i64::try_from(i).unwrap());
            store
                .append(id, Turn::with_token_count(role, *content, start + offset, 1))
                .unwrap();
        }
    }

    fn contents(turns: &[Turn]) -> Vec<&str> {
        turns.iter().map(Turn::content).collect()
    }

    #[test]
    fn new_conversation_recalls_recent_tails_in_time_order() {
        let store = MemoryHistoryStore::new();
        seed(&store, "monday", &["m1", "m2", "m3", "m4"], 120);
        seed(&store, "tuesday", &["t1", "t2"], 60);

        let turns = carryover_turns(&store, &Conversation::new("today"), 3).unwrap();

        // Newest conversation is visited first, then the older one fills the rest
        assert_eq!(contents(&turns), vec!["m4", "t1", "t2"]);
    }

    #[test]
    fn resumed_conversation_only_recalls_what_came_before_it() {
        let store = MemoryHistoryStore::new();
        seed(&store, "before", &["b1", "b2"], 120);
        seed(&store, "current", &["c1", "c2"], 60);
        seed(&store, "after", &["a1", "a2"], 30);

        let current = store.load("current").unwrap();
        let turns = carryover_turns(&store, &current, 10).unwrap();

        assert_eq!(contents(&turns), vec!["b1", "b2"]);
    }

    #[test]
    fn zero_limit_recalls_nothing() {
        let store = MemoryHistoryStore::new();
        seed(&store, "monday", &["m1", "m2"], 60);

        assert!(carryover_turns(&store, &Conversation::new("today"), 0).unwrap().is_empty());
    }
}
