use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use serde_json::Value;
use tokio::time::{Instant, Sleep};
use tracing::{debug, instrument, warn};

use parley_core::errors::UpstreamError;
use parley_core::messages::Turn;
use parley_core::provider::{FragmentStream, ModelClient};
use parley_core::security::ApiKey;
use parley_core::stream::StreamEvent;

use crate::converter;
use crate::sse::{self, LineBuffer, SseLine};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection parameters for an OpenAI-compatible chat-completions API.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: ApiKey,
    pub system_prompt: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: ApiKey) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            system_prompt: parley_settings::DEFAULT_SYSTEM_PROMPT.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn from_settings(llm: &parley_settings::LlmSettings, api_key: ApiKey) -> Self {
        Self {
            base_url: llm.base_url.clone(),
            model: llm.model.clone(),
            api_key,
            system_prompt: llm.system_prompt.clone(),
            request_timeout: llm.request_timeout(),
            connect_timeout: llm.connect_timeout(),
        }
    }
}

/// [`ModelClient`] over an OpenAI-compatible HTTP API.
pub struct OpenAiCompatClient {
    client: Client,
    endpoint: String,
    config: ClientConfig,
}

impl OpenAiCompatClient {
    pub fn new(config: ClientConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| UpstreamError::NetworkError(format!("build http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: converter::chat_completions_url(&config.base_url),
            config,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request(&self, turns: &[Turn], stream: bool) -> reqwest::RequestBuilder {
        let body =
            converter::build_request_body(&self.config.model, &self.config.system_prompt, turns, stream);

        self.client
            .post(&self.endpoint)
            .header("Authorization", self.config.api_key.bearer())
            .header("accept", if stream { "text/event-stream" } else { "application/json" })
            .json(&body)
    }

    async fn send(&self, turns: &[Turn], stream: bool) -> Result<reqwest::Response, UpstreamError> {
        let resp = self
            .build_request(turns, stream)
            .send()
            .await
            .map_err(|e| UpstreamError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            warn!(status, "upstream returned non-success status");
            return Err(UpstreamError::from_status(status, body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, turns), fields(model = %self.config.model, turns = turns.len()))]
    async fn complete(&self, turns: &[Turn]) -> Result<String, UpstreamError> {
        let timeout = self.config.request_timeout;
        let call = async {
            let resp = self.send(turns, false).await?;
            let body: Value = resp
                .json()
                .await
                .map_err(|e| UpstreamError::MalformedResponse(e.to_string()))?;
            converter::extract_reply(&body)
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(timeout)),
        }
    }

    #[instrument(skip(self, turns), fields(model = %self.config.model, turns = turns.len()))]
    async fn stream(&self, turns: &[Turn]) -> Result<FragmentStream, UpstreamError> {
        let timeout = self.config.request_timeout;
        let deadline = Instant::now() + timeout;

        let resp = match tokio::time::timeout_at(deadline, self.send(turns, true)).await {
            Ok(result) => result?,
            Err(_) => return Err(UpstreamError::Timeout(timeout)),
        };
        debug!("upstream stream opened");

        Ok(Box::pin(DeltaStream::new(resp.bytes_stream(), deadline, timeout)))
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Turns an upstream byte body into [`StreamEvent`]s.
///
/// The deadline is absolute and is not extended by arriving data. After the
/// first terminal event the stream yields nothing more; dropping it closes
/// the upstream connection.
struct DeltaStream {
    inner: ByteStream,
    lines: LineBuffer,
    pending: VecDeque<StreamEvent>,
    deadline: Pin<Box<Sleep>>,
    timeout: Duration,
    finished: bool,
}

impl DeltaStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        deadline: Instant,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            lines: LineBuffer::new(),
            pending: VecDeque::new(),
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            timeout,
            finished: false,
        }
    }

    /// Queue the events carried by `lines`, stopping at the sentinel.
    fn absorb(&mut self, lines: impl IntoIterator<Item = String>) {
        for line in lines {
            match sse::parse_line(&line) {
                Some(SseLine::Delta(text)) => self.pending.push_back(StreamEvent::text(text)),
                Some(SseLine::Done) => {
                    self.pending.push_back(StreamEvent::Done);
                    return;
                }
                None => {}
            }
        }
    }

    fn has_terminal(&self) -> bool {
        self.pending.back().is_some_and(StreamEvent::is_terminal)
    }

    fn next_pending(&mut self) -> Option<StreamEvent> {
        let event = self.pending.pop_front()?;
        if event.is_terminal() {
            self.finished = true;
            self.pending.clear();
        }
        Some(event)
    }

    fn fail(&mut self, error: UpstreamError) -> Poll<Option<StreamEvent>> {
        self.finished = true;
        self.pending.clear();
        Poll::Ready(Some(StreamEvent::Error { error }))
    }
}

impl Stream for DeltaStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if let Some(event) = self.next_pending() {
            return Poll::Ready(Some(event));
        }
        if self.deadline.as_mut().poll(cx).is_ready() {
            let timeout = self.timeout;
            return self.fail(UpstreamError::Timeout(timeout));
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let lines = self.lines.push(&bytes);
                    self.absorb(lines);
                    if let Some(event) = self.next_pending() {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    return self.fail(UpstreamError::StreamInterrupted(e.to_string()));
                }
                Poll::Ready(None) => {
                    let tail = self.lines.finish();
                    self.absorb(tail);
                    if !self.has_terminal() {
                        // A body that ends without the sentinel still completes normally.
                        self.pending.push_back(StreamEvent::Done);
                    }
                    return Poll::Ready(self.next_pending());
                }
                Poll::Pending => {
                    if self.deadline.as_mut().poll(cx).is_ready() {
                        let timeout = self.timeout;
                        return self.fail(UpstreamError::Timeout(timeout));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
