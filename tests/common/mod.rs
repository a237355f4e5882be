//! Shared test utilities

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use recall::inference::{ChatRequest, Fragment, FragmentStream};
use recall::{
    ContextConfig, ConversationManager, FileHistoryStore, InferenceClient, Profile, Role,
    TokenEstimator, TurnConfig,
};

/// Replies `re: <latest user message>` in two fragments
#[derive(Default)]
pub struct EchoClient {
    pub requests: Mutex<Vec<ChatRequest>>,
    pub delay: Option<Duration>,
}

impl EchoClient {
    #[must_use]
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Non-system messages of every request received, oldest request first
    pub fn history_sent(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .map(|r| {
                r.messages
                    .iter()
                    .filter(|m| m.role != Role::System)
                    .map(|m| m.content.clone())
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
impl InferenceClient for EchoClient {
    async fn submit(&self, request: &ChatRequest) -> recall::Result<FragmentStream> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());

        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let fragments = vec![
            Ok(Fragment::Delta("re: ".to_string())),
            Ok(Fragment::Delta(last)),
            Ok(Fragment::Done),
        ];
        let delay = self.delay;
        Ok(Box::pin(futures::stream::iter(fragments).then(move |f| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            f
        })))
    }
}

/// Open a file-backed store in a fresh temp directory
#[must_use]
pub fn temp_store() -> (tempfile::TempDir, Arc<FileHistoryStore>) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let store = FileHistoryStore::open(dir.path().join("conversations"))
        .expect("failed to open history store");
    (dir, Arc::new(store))
}

/// Build a manager with the default profile and the given budget
pub fn manager(
    store: Arc<FileHistoryStore>,
    client: Arc<EchoClient>,
    budget: usize,
) -> ConversationManager {
    let config = TurnConfig {
        context: ContextConfig {
            budget,
            max_turns: None,
        },
        ..TurnConfig::default()
    };
    ConversationManager::new(
        store,
        client,
        TokenEstimator::default(),
        Profile::default(),
        config,
    )
}
