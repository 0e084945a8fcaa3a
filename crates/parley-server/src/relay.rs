//! Streaming chat relay.
//!
//! A relay owns one streaming turn end to end: it forwards upstream
//! fragments to the caller as they arrive, accumulates them, and persists
//! the assembled reply only when the upstream finishes normally.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use parley_core::errors::UpstreamError;
use parley_core::ids::{MessageId, SessionId};
use parley_core::messages::{Role, Turn};
use parley_core::provider::{FragmentStream, ModelClient};
use parley_core::stream::StreamEvent;
use parley_store::SessionStore;

use crate::error::ChatError;
use crate::orchestrator::{self, TurnRequest};
use crate::wire::{ErrorKind, RelayEvent};

/// How long a terminal error event may wait for room in a full channel.
const TERMINAL_SEND_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    Init,
    SessionResolved,
    Streaming,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RelayState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::SessionResolved => "session_resolved",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished relay.
#[derive(Clone, Debug)]
pub struct RelayOutcome {
    pub session_id: SessionId,
    pub state: RelayState,
    pub fragments: usize,
    /// The stored assistant message, when the turn completed and was saved.
    pub persisted: Option<MessageId>,
}

enum Step {
    Fragment(String),
    Finished,
    Failed(UpstreamError),
    TimedOut,
    Cancelled,
}

pub struct StreamRelay {
    store: SessionStore,
    client: Arc<dyn ModelClient>,
    deadline: Instant,
    timeout: Duration,
    state: RelayState,
    session_id: SessionId,
    history: Vec<Turn>,
    accumulator: String,
    fragments: usize,
}

impl StreamRelay {
    /// Validate the request and prepare its session: `Init` to
    /// `SessionResolved`. The deadline runs from `accepted_at`.
    #[instrument(skip_all, fields(owner_id = %request.owner))]
    pub fn prepare(
        store: SessionStore,
        client: Arc<dyn ModelClient>,
        request: &TurnRequest,
        accepted_at: Instant,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        let mut state = RelayState::Init;
        let prepared = orchestrator::prepare_turn(&store, request)?;
        Self::transition(&mut state, RelayState::SessionResolved);
        debug!(session_id = %prepared.session.id, first_turn = prepared.is_first, "relay session resolved");

        Ok(Self {
            store,
            client,
            deadline: accepted_at + timeout,
            timeout,
            state,
            session_id: prepared.session.id,
            history: prepared.history,
            accumulator: String::new(),
            fragments: 0,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    fn transition(state: &mut RelayState, next: RelayState) {
        debug!(from = %state, to = %next, "relay transition");
        *state = next;
    }

    /// Drive the relay to a terminal state, sending events to `tx`.
    ///
    /// The first event is always the session identity. Dropping the receiver
    /// cancels the relay; the upstream stream is dropped on every exit path.
    #[instrument(skip_all, fields(session_id = %self.session_id, model = %self.client.model()))]
    pub async fn run(mut self, tx: mpsc::Sender<RelayEvent>) -> RelayOutcome {
        let started = Instant::now();

        if tx
            .send(RelayEvent::Session {
                session_id: self.session_id,
            })
            .await
            .is_err()
        {
            return self.finish(Step::Cancelled, &tx, started).await;
        }
        Self::transition(&mut self.state, RelayState::Streaming);

        let step = match self.open(&tx).await {
            Ok(upstream) => self.pump(upstream, &tx).await,
            Err(step) => step,
        };
        self.finish(step, &tx, started).await
    }

    async fn open(&self, tx: &mpsc::Sender<RelayEvent>) -> Result<FragmentStream, Step> {
        tokio::select! {
            biased;
            _ = tx.closed() => Err(Step::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(Step::TimedOut),
            opened = self.client.stream(&self.history) => opened.map_err(Step::Failed),
        }
    }

    /// Forward fragments until a terminal condition. `upstream` is dropped on
    /// return, which releases its connection.
    async fn pump(&mut self, mut upstream: FragmentStream, tx: &mpsc::Sender<RelayEvent>) -> Step {
        loop {
            let step = tokio::select! {
                biased;
                _ = tx.closed() => Step::Cancelled,
                _ = tokio::time::sleep_until(self.deadline) => Step::TimedOut,
                item = upstream.next() => match item {
                    Some(StreamEvent::TextDelta { delta }) => Step::Fragment(delta),
                    Some(StreamEvent::Done) | None => Step::Finished,
                    Some(StreamEvent::Error { error }) => Step::Failed(error),
                },
            };

            let Step::Fragment(delta) = step else {
                return step;
            };
            self.accumulator.push_str(&delta);
            self.fragments += 1;

            tokio::select! {
                biased;
                sent = tx.send(RelayEvent::Delta(delta)) => {
                    if sent.is_err() {
                        return Step::Cancelled;
                    }
                }
                _ = tokio::time::sleep_until(self.deadline) => return Step::TimedOut,
            }
        }
    }

    async fn finish(mut self, step: Step, tx: &mpsc::Sender<RelayEvent>, started: Instant) -> RelayOutcome {
        let mut persisted = None;

        match step {
            Step::Finished => {
                Self::transition(&mut self.state, RelayState::Completed);
                match self
                    .store
                    .append_message(self.session_id, Role::Assistant, &self.accumulator)
                {
                    Ok(message) => persisted = Some(message.id),
                    Err(e) => error!(error = %e, "failed to persist streamed reply"),
                }
            }
            Step::Failed(error) if error.is_timeout() => {
                Self::transition(&mut self.state, RelayState::TimedOut);
                warn!(error = %error, "upstream timed out");
                send_terminal(tx, ErrorKind::Timeout, error.user_message()).await;
            }
            Step::Failed(error) => {
                Self::transition(&mut self.state, RelayState::Failed);
                warn!(error_kind = error.error_kind(), error = %error, "upstream stream failed");
                send_terminal(tx, ErrorKind::Upstream, error.user_message()).await;
            }
            Step::TimedOut => {
                Self::transition(&mut self.state, RelayState::TimedOut);
                let error = UpstreamError::Timeout(self.timeout);
                warn!(timeout_secs = self.timeout.as_secs(), "relay deadline reached before upstream finished");
                send_terminal(tx, ErrorKind::Timeout, error.user_message()).await;
            }
            Step::Cancelled => {
                Self::transition(&mut self.state, RelayState::Cancelled);
                debug!("caller disconnected");
            }
            Step::Fragment(_) => {
                Self::transition(&mut self.state, RelayState::Failed);
                error!("relay finished on a non-terminal step");
            }
        }

        info!(
            state = %self.state,
            fragments = self.fragments,
            reply_chars = self.accumulator.chars().count(),
            persisted = persisted.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "relay finished"
        );

        RelayOutcome {
            session_id: self.session_id,
            state: self.state,
            fragments: self.fragments,
            persisted,
        }
    }
}

/// Best effort: a caller that is gone or not reading must not stall bookkeeping.
async fn send_terminal(tx: &mpsc::Sender<RelayEvent>, kind: ErrorKind, message: &str) {
    let event = RelayEvent::Error {
        kind,
        message: message.to_string(),
    };
    match tokio::time::timeout(TERMINAL_SEND_GRACE, tx.send(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => debug!("caller gone before terminal event"),
        Err(_) => debug!("terminal event dropped, channel full"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::OwnerId;
    use parley_core::stream::StreamEvent;
    use parley_llm::{MockModelClient, MockResponse};
    use parley_store::Database;

    const OWNER: OwnerId = OwnerId::from_raw(1);
    const TIMEOUT: Duration = Duration::from_secs(90);

    fn request(message: &str) -> TurnRequest {
        TurnRequest {
            owner: OWNER,
            message: message.into(),
            session_id: None,
            topic: None,
        }
    }

    fn setup(responses: Vec<MockResponse>) -> (SessionStore, Arc<MockModelClient>) {
        (
            SessionStore::new(Database::in_memory().unwrap()),
            Arc::new(MockModelClient::new(responses)),
        )
    }

    fn relay(store: &SessionStore, client: &Arc<MockModelClient>, message: &str) -> StreamRelay {
        StreamRelay::prepare(store.clone(), client.clone(), &request(message), Instant::now(), TIMEOUT).unwrap()
    }

    async fn drain(mut rx: mpsc::Receiver<RelayEvent>) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    }

    fn assistant_messages(store: &SessionStore, session_id: SessionId) -> Vec<String> {
        store
            .history(session_id, OWNER)
            .unwrap()
            .into_iter()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content)
            .collect()
    }

    #[tokio::test]
    async fn streams_fragments_and_persists_concatenation() {
        let (store, client) = setup(vec![MockResponse::fragments(&["A", "B", "C"])]);
        let relay = relay(&store, &client, "Hello");
        assert_eq!(relay.state(), RelayState::SessionResolved);
        let session_id = relay.session_id();

        let (tx, rx) = mpsc::channel(32);
        let outcome = relay.run(tx).await;
        let events = drain(rx).await;

        assert_eq!(events[0], RelayEvent::Session { session_id });
        assert_eq!(
            &events[1..],
            &[
                RelayEvent::Delta("A".into()),
                RelayEvent::Delta("B".into()),
                RelayEvent::Delta("C".into()),
            ]
        );
        assert_eq!(outcome.state, RelayState::Completed);
        assert_eq!(outcome.fragments, 3);
        assert!(outcome.persisted.is_some());
        assert_eq!(assistant_messages(&store, session_id), ["ABC"]);
        assert_eq!(client.dropped_streams(), 1);
    }

    fn reject_assistant_inserts(store: &SessionStore) {
        store
            .database()
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_assistant BEFORE INSERT ON chat_messages
                     WHEN NEW.role = 'assistant'
                     BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END;",
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn persist_failure_still_closes_stream_cleanly() {
        let (store, client) = setup(vec![MockResponse::fragments(&["A", "B"])]);
        let relay = relay(&store, &client, "Hello");
        let session_id = relay.session_id();
        reject_assistant_inserts(&store);

        let (tx, rx) = mpsc::channel(32);
        let outcome = relay.run(tx).await;
        let events = drain(rx).await;

        assert_eq!(outcome.state, RelayState::Completed);
        assert!(outcome.persisted.is_none());
        assert_eq!(
            events,
            [
                RelayEvent::Session { session_id },
                RelayEvent::Delta("A".into()),
                RelayEvent::Delta("B".into()),
            ]
        );
        assert!(assistant_messages(&store, session_id).is_empty());
    }

    #[tokio::test]
    async fn blank_message_is_rejected_before_side_effects() {
        let (store, client) = setup(vec![]);
        let result = StreamRelay::prepare(store.clone(), client.clone(), &request(" \t"), Instant::now(), TIMEOUT);
        assert!(matches!(result, Err(ChatError::Validation(_))));
        assert_eq!(store.list(OWNER, 0, 10).unwrap().total, 0);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn first_message_titles_session_before_streaming() {
        let (store, client) = setup(vec![MockResponse::text("ok")]);
        let relay = relay(&store, &client, "Plan a spring art lesson for four year olds");
        let session = store.get(relay.session_id(), OWNER).unwrap().unwrap();
        assert_eq!(session.title, "Plan a spring art le…");
    }

    #[tokio::test]
    async fn upstream_error_sends_error_event_and_persists_nothing() {
        let (store, client) = setup(vec![MockResponse::stream_error(
            &["partial "],
            UpstreamError::StreamInterrupted("connection reset".into()),
        )]);
        let relay = relay(&store, &client, "Hello");
        let session_id = relay.session_id();

        let (tx, rx) = mpsc::channel(32);
        let outcome = relay.run(tx).await;
        let events = drain(rx).await;

        assert_eq!(outcome.state, RelayState::Failed);
        assert!(outcome.persisted.is_none());
        match events.last() {
            Some(RelayEvent::Error { kind, message }) => {
                assert_eq!(*kind, ErrorKind::Upstream);
                assert!(!message.contains("connection reset"));
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(assistant_messages(&store, session_id).is_empty());
    }

    #[tokio::test]
    async fn open_failure_is_reported_as_upstream_error() {
        let (store, client) = setup(vec![MockResponse::Error(UpstreamError::RateLimited)]);
        let relay = relay(&store, &client, "Hello");
        let (tx, rx) = mpsc::channel(32);
        let outcome = relay.run(tx).await;
        let events = drain(rx).await;

        assert_eq!(outcome.state, RelayState::Failed);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], RelayEvent::Error { kind: ErrorKind::Upstream, .. }));
    }

    #[tokio::test]
    async fn silent_upstream_times_out_at_deadline() {
        tokio::time::pause();
        let (store, client) = setup(vec![MockResponse::Hang(vec![StreamEvent::text("so far")])]);
        let relay = relay(&store, &client, "Hello");
        let session_id = relay.session_id();

        let (tx, rx) = mpsc::channel(32);
        let started = Instant::now();
        let outcome = relay.run(tx).await;

        assert!(started.elapsed() >= TIMEOUT);
        assert_eq!(outcome.state, RelayState::TimedOut);
        let events = drain(rx).await;
        assert!(matches!(events.last(), Some(RelayEvent::Error { kind: ErrorKind::Timeout, .. })));
        assert!(assistant_messages(&store, session_id).is_empty());
        assert_eq!(client.dropped_streams(), 1);
    }

    #[tokio::test]
    async fn deadline_counts_from_acceptance() {
        tokio::time::pause();
        let (store, client) = setup(vec![MockResponse::Hang(vec![])]);
        let accepted_at = Instant::now();
        let relay = StreamRelay::prepare(store, client, &request("Hello"), accepted_at, TIMEOUT).unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        let (tx, _rx) = mpsc::channel(32);
        let outcome = relay.run(tx).await;

        assert_eq!(outcome.state, RelayState::TimedOut);
        assert!(accepted_at.elapsed() < TIMEOUT + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn upstream_timeout_error_maps_to_timed_out() {
        let (store, client) = setup(vec![MockResponse::stream_error(&[], UpstreamError::Timeout(TIMEOUT))]);
        let relay = relay(&store, &client, "Hello");
        let (tx, rx) = mpsc::channel(32);
        let outcome = relay.run(tx).await;
        assert_eq!(outcome.state, RelayState::TimedOut);
        let events = drain(rx).await;
        assert!(matches!(events.last(), Some(RelayEvent::Error { kind: ErrorKind::Timeout, .. })));
    }

    #[tokio::test]
    async fn caller_disconnect_cancels_and_drops_upstream() {
        tokio::time::pause();
        let (store, client) = setup(vec![MockResponse::Trickle(
            vec![
                StreamEvent::text("one"),
                StreamEvent::text("two"),
                StreamEvent::text("three"),
                StreamEvent::Done,
            ],
            Duration::from_secs(1),
        )]);
        let relay = relay(&store, &client, "Hello");
        let session_id = relay.session_id();

        let (tx, mut rx) = mpsc::channel(32);
        let task = tokio::spawn(relay.run(tx));

        assert!(matches!(rx.recv().await, Some(RelayEvent::Session { .. })));
        assert_eq!(rx.recv().await, Some(RelayEvent::Delta("one".into())));
        drop(rx);

        let outcome = task.await.unwrap();
        assert_eq!(outcome.state, RelayState::Cancelled);
        assert!(outcome.persisted.is_none());
        assert_eq!(client.dropped_streams(), 1);
        assert!(assistant_messages(&store, session_id).is_empty());
    }

    #[tokio::test]
    async fn fragments_with_newlines_are_forwarded_verbatim() {
        let (store, client) = setup(vec![MockResponse::fragments(&["line 1\n", "\nline 2"])]);
        let relay = relay(&store, &client, "Hello");
        let session_id = relay.session_id();
        let (tx, rx) = mpsc::channel(32);
        relay.run(tx).await;

        let events = drain(rx).await;
        assert_eq!(events[1], RelayEvent::Delta("line 1\n".into()));
        assert_eq!(assistant_messages(&store, session_id), ["line 1\n\nline 2"]);
    }

    #[test]
    fn terminal_states() {
        assert!(RelayState::Completed.is_terminal());
        assert!(RelayState::Cancelled.is_terminal());
        assert!(!RelayState::Streaming.is_terminal());
        assert_eq!(RelayState::TimedOut.to_string(), "timed_out");
    }
}
