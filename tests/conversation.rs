//! End-to-end turns over file-backed history

mod common;

use std::sync::Arc;
use std::time::Duration;

use recall::{FileHistoryStore, HistoryStore, Role, TurnRequest};

use common::{EchoClient, manager, temp_store};

#[tokio::test]
async fn history_survives_restart() {
    let (dir, store) = temp_store();
    let first = manager(store, Arc::new(EchoClient::default()), 2000);
    first
        .run_turn(TurnRequest::new("trip", "Plan a weekend in Kyoto"))
        .await
        .expect("first turn");
    drop(first);

    let reopened = Arc::new(
        FileHistoryStore::open(dir.path().join("conversations")).expect("reopen store"),
    );
    let client = Arc::new(EchoClient::default());
    let second = manager(reopened, Arc::clone(&client), 2000);
    second
        .run_turn(TurnRequest::new("trip", "Add a day trip"))
        .await
        .expect("second turn");

    assert_eq!(
        client.history_sent()[0],
        vec![
            "Plan a weekend in Kyoto",
            "re: Plan a weekend in Kyoto",
            "Add a day trip"
        ]
    );
}

#[tokio::test]
async fn eviction_only_affects_the_request() {
    let (_dir, store) = temp_store();
    let client = Arc::new(EchoClient::default());
    let estimator = recall::TokenEstimator::default();
    let preamble = estimator.count(&recall::Profile::default().preamble());
    // Room for roughly one exchange beyond the preamble
    let manager = manager(Arc::clone(&store), Arc::clone(&client), preamble + 30);

    for message in [
        "first question about something rather long and wordy",
        "second question about something rather long and wordy",
        "third question about something rather long and wordy",
    ] {
        let outcome = manager
            .run_turn(TurnRequest::new("long", message))
            .await
            .expect("turn");
        assert!(outcome.prompt_tokens <= preamble + 30 || outcome.included_turns == 1);
    }

    let sent = client.history_sent();
    let last = sent.last().expect("requests recorded");
    assert_eq!(
        last.last().map(String::as_str),
        Some("third question about something rather long and wordy")
    );
    assert!(!last.iter().any(|m| m.starts_with("first question")));

    // Everything is still on disk
    assert_eq!(store.load("long").expect("load").len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_turns_on_one_conversation_are_serialized() {
    let (_dir, store) = temp_store();
    let client = Arc::new(EchoClient::slow(Duration::from_millis(20)));
    let manager = manager(Arc::clone(&store), Arc::clone(&client), 2000);

    let (a, b) = tokio::join!(
        manager.run_turn(TurnRequest::new("shared", "alpha")),
        manager.run_turn(TurnRequest::new("shared", "beta")),
    );
    a.expect("alpha turn");
    b.expect("beta turn");

    let conversation = store.load("shared").expect("load");
    let turns = conversation.turns();
    assert_eq!(turns.len(), 4);
    for pair in turns.chunks(2) {
        assert_eq!(pair[0].role(), Role::User);
        assert_eq!(pair[1].role(), Role::Assistant);
        assert_eq!(pair[1].content(), format!("re: {}", pair[0].content()));
    }

    // The second turn saw the first exchange
    let mut sizes: Vec<usize> = client.history_sent().iter().map(Vec::len).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 3]);
}

#[tokio::test]
async fn conversations_are_independent() {
    let (_dir, store) = temp_store();
    let manager = manager(Arc::clone(&store), Arc::new(EchoClient::default()), 2000);

    let (a, b) = tokio::join!(
        manager.run_turn(TurnRequest::new("left", "one")),
        manager.run_turn(TurnRequest::new("right", "two")),
    );
    a.expect("left turn");
    b.expect("right turn");

    let ids: Vec<String> = store
        .list()
        .expect("list")
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"left".to_string()));
    assert_eq!(store.load("right").expect("load").turns()[0].content(), "two");
}

#[test]
fn turns_run_from_synchronous_callers() {
    let (_dir, store) = temp_store();
    let manager = manager(Arc::clone(&store), Arc::new(EchoClient::default()), 2000);

    let outcome = tokio_test::block_on(manager.run_turn(TurnRequest::new("sync", "ping")))
        .expect("turn");

    assert_eq!(outcome.reply, "re: ping");
    assert!(outcome.persisted);
    assert!(outcome.warnings.is_empty());
}

#[tokio::test]
async fn invalid_conversation_id_is_rejected() {
    let (_dir, store) = temp_store();
    let manager = manager(store, Arc::new(EchoClient::default()), 2000);

    let err = manager
        .run_turn(TurnRequest::new("../escape", "hi"))
        .await
        .expect_err("path-like id");
    assert!(matches!(err, recall::Error::InvalidConversationId(_)));
}

#[tokio::test]
async fn new_session_remembers_earlier_conversations() {
    let (dir, store) = temp_store();
    let first = manager(store, Arc::new(EchoClient::default()), 2000);
    first
        .run_turn(TurnRequest::new("conversation_20250101_090000", "I live in Lisbon"))
        .await
        .expect("earlier session");
    drop(first);

    // A later process starts a brand-new conversation
    let reopened = Arc::new(
        FileHistoryStore::open(dir.path().join("conversations")).expect("reopen store"),
    );
    let client = Arc::new(EchoClient::default());
    let second = manager(Arc::clone(&reopened), Arc::clone(&client), 2000);
    second
        .run_turn(TurnRequest::new("conversation_20250102_090000", "Where do I live?"))
        .await
        .expect("new session");

    assert_eq!(
        client.history_sent()[0],
        vec!["I live in Lisbon", "re: I live in Lisbon", "Where do I live?"]
    );
    assert_eq!(
        reopened
            .load("conversation_20250102_090000")
            .expect("load")
            .len(),
        2
    );
}
