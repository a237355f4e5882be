//! OpenAI-compatible chat completions client (DeepSeek by default)

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::sse::{SseEvent, SseLineBuffer};
use super::{ChatMessage, ChatRequest, Fragment, FragmentStream, InferenceClient};
use crate::{Error, Result};

/// Streaming client for `/chat/completions` endpoints
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl OpenAiCompatibleClient {
    /// Create a client for `base_url` (e.g. `https://api.deepseek.com/v1`)
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChunk {
    #[serde(default)]
    choices: Vec<ApiStreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChoice {
    #[serde(default)]
    delta: ApiDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ApiDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[async_trait]
impl InferenceClient for OpenAiCompatibleClient {
    async fn submit(&self, request: &ChatRequest) -> Result<FragmentStream> {
        let Some(api_key) = &self.api_key else {
            return Err(Error::Inference(
                "no API key configured (set DEEPSEEK_API_KEY)".to_string(),
            ));
        };

        let body = ApiRequest {
            model: &request.model,
            messages: &request.messages,
            stream: true,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            "submitting chat completion"
        );

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Inference(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Inference(format!("API status {status}: {text}")));
        }

        Ok(fragment_stream(response.bytes_stream()))
    }
}

struct SseState<S> {
    bytes: Pin<Box<S>>,
    parser: SseLineBuffer,
    pending: VecDeque<Result<Fragment>>,
    ended: bool,
}

impl<S> SseState<S> {
    fn push(&mut self, event: SseEvent) {
        if self.ended {
            return;
        }
        match event {
            SseEvent::Done => {
                self.pending.push_back(Ok(Fragment::Done));
                self.ended = true;
            }
            SseEvent::Data(json) => match parse_chunk(&json) {
                Ok(Some(text)) => self.pending.push_back(Ok(Fragment::Delta(text))),
                Ok(None) => {}
                Err(e @ Error::Inference(_)) => {
                    self.pending.push_back(Err(e));
                    self.ended = true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed stream chunk");
                }
            },
        }
    }
}

/// Text carried by one completion chunk
fn parse_chunk(json: &str) -> Result<Option<String>> {
    let chunk: ApiStreamChunk = serde_json::from_str(json)?;
    if let Some(error) = chunk.error {
        return Err(Error::Inference(error.message));
    }
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|text| !text.is_empty()))
}

/// Turn an SSE byte stream into reply fragments
pub(crate) fn fragment_stream<S, B, E>(bytes: S) -> FragmentStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        parser: SseLineBuffer::new(),
        pending: VecDeque::new(),
        ended: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.ended {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for event in state.parser.feed(chunk.as_ref()) {
                        state.push(event);
                    }
                }
                Some(Err(e)) => {
                    state
                        .pending
                        .push_back(Err(Error::Inference(format!("stream interrupted: {e}"))));
                    state.ended = true;
                }
                None => {
                    for event in state.parser.flush() {
                        state.push(event);
                    }
                    state.ended = true;
                }
            }
        }
    }))
}
