use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;

use parley_core::errors::UpstreamError;
use parley_core::messages::Turn;
use parley_core::provider::{FragmentStream, ModelClient};
use parley_core::stream::StreamEvent;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield these events, then end.
    Stream(Vec<StreamEvent>),
    /// Yield these events, then stay silent forever.
    Hang(Vec<StreamEvent>),
    /// Yield these events with a pause before each one.
    Trickle(Vec<StreamEvent>, Duration),
    /// Fail the call itself.
    Error(UpstreamError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Fragments followed by a normal end.
    pub fn fragments(parts: &[&str]) -> Self {
        let mut events: Vec<_> = parts.iter().map(|p| StreamEvent::text(*p)).collect();
        events.push(StreamEvent::Done);
        Self::Stream(events)
    }

    /// A whole reply as one fragment.
    pub fn text(text: &str) -> Self {
        Self::fragments(&[text])
    }

    /// Fragments followed by an in-stream error.
    pub fn stream_error(parts: &[&str], error: UpstreamError) -> Self {
        let mut events: Vec<_> = parts.iter().map(|p| StreamEvent::text(*p)).collect();
        events.push(StreamEvent::Error { error });
        Self::Stream(events)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock client that answers calls with pre-programmed responses in order.
///
/// Records the turns of every call and counts how many upstream streams
/// have been dropped, so tests can assert on teardown.
pub struct MockModelClient {
    responses: Mutex<VecDeque<MockResponse>>,
    calls: Mutex<Vec<Vec<Turn>>>,
    call_count: AtomicUsize,
    dropped_streams: Arc<AtomicUsize>,
}

impl MockModelClient {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            dropped_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Turns received by each call, in call order.
    pub fn calls(&self) -> Vec<Vec<Turn>> {
        self.calls.lock().clone()
    }

    pub fn dropped_streams(&self) -> usize {
        self.dropped_streams.load(Ordering::SeqCst)
    }

    async fn next_response(&self, turns: &[Turn]) -> Result<Scripted, UpstreamError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.calls.lock().push(turns.to_vec());

        let next = self.responses.lock().pop_front();
        let Some(mut current) = next else {
            return Err(UpstreamError::InvalidRequest(format!(
                "MockModelClient: no response configured for call {idx}"
            )));
        };
        loop {
            match current {
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
                MockResponse::Error(e) => return Err(e),
                MockResponse::Stream(events) => return Ok(Scripted::Finite(events)),
                MockResponse::Hang(events) => return Ok(Scripted::Hang(events)),
                MockResponse::Trickle(events, pause) => return Ok(Scripted::Trickle(events, pause)),
            }
        }
    }
}

/// A response with its delays and call errors already applied.
enum Scripted {
    Finite(Vec<StreamEvent>),
    Hang(Vec<StreamEvent>),
    Trickle(Vec<StreamEvent>, Duration),
}

#[async_trait]
impl ModelClient for MockModelClient {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, turns: &[Turn]) -> Result<String, UpstreamError> {
        let events = match self.next_response(turns).await? {
            Scripted::Finite(events) | Scripted::Trickle(events, _) => events,
            Scripted::Hang(_) => return futures::future::pending().await,
        };

        let mut reply = String::new();
        for event in events {
            match event {
                StreamEvent::TextDelta { delta } => reply.push_str(&delta),
                StreamEvent::Done => break,
                StreamEvent::Error { error } => return Err(error),
            }
        }
        Ok(reply)
    }

    async fn stream(&self, turns: &[Turn]) -> Result<FragmentStream, UpstreamError> {
        let inner: FragmentStream = match self.next_response(turns).await? {
            Scripted::Finite(events) => Box::pin(stream::iter(events)),
            Scripted::Hang(events) => Box::pin(stream::iter(events).chain(stream::pending())),
            Scripted::Trickle(events, pause) => Box::pin(stream::iter(events).then(move |e| async move {
                tokio::time::sleep(pause).await;
                e
            })),
        };

        Ok(Box::pin(DropCounted {
            inner,
            dropped: Arc::clone(&self.dropped_streams),
        }))
    }
}

struct DropCounted {
    inner: FragmentStream,
    dropped: Arc<AtomicUsize>,
}

impl Stream for DropCounted {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for DropCounted {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}
