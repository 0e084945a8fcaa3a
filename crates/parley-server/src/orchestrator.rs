//! Blocking chat path and the session preparation shared with the relay.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use parley_core::ids::{OwnerId, SessionId};
use parley_core::messages::{Role, Turn};
use parley_core::provider::ModelClient;
use parley_core::text::is_blank;
use parley_store::{SessionRow, SessionStore};

use crate::error::ChatError;

/// One inbound user turn, already attributed to a caller.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub owner: OwnerId,
    pub message: String,
    pub session_id: Option<SessionId>,
    pub topic: Option<String>,
}

/// A session ready for an upstream call: the user message is stored and
/// `history` holds every turn in order, ending with it.
#[derive(Clone, Debug)]
pub struct PreparedTurn {
    pub session: SessionRow,
    pub history: Vec<Turn>,
    pub is_first: bool,
}

/// Reject blank input before any side effect.
pub fn validate(request: &TurnRequest) -> Result<(), ChatError> {
    if is_blank(&request.message) {
        return Err(ChatError::Validation("message must not be blank".into()));
    }
    Ok(())
}

/// Resolve the session, store the user message (titling the session if it is
/// the first) and load the full history.
#[instrument(skip_all, fields(owner_id = %request.owner))]
pub fn prepare_turn(store: &SessionStore, request: &TurnRequest) -> Result<PreparedTurn, ChatError> {
    validate(request)?;

    let session = store.resolve_or_create(request.session_id, request.owner, request.topic.as_deref())?;
    let recorded = store.record_user_turn(session.id, &request.message)?;
    let history = store
        .history(session.id, request.owner)?
        .iter()
        .map(|m| m.to_turn())
        .collect();

    Ok(PreparedTurn {
        session,
        history,
        is_first: recorded.is_first,
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub reply: String,
    pub session_id: SessionId,
}

/// Runs a whole turn and returns the complete reply.
pub struct ChatOrchestrator {
    store: SessionStore,
    client: Arc<dyn ModelClient>,
}

impl ChatOrchestrator {
    pub fn new(store: SessionStore, client: Arc<dyn ModelClient>) -> Self {
        Self { store, client }
    }

    #[instrument(skip_all, fields(owner_id = %request.owner, model = %self.client.model()))]
    pub async fn handle(&self, request: TurnRequest) -> Result<ChatReply, ChatError> {
        let started = Instant::now();
        let prepared = prepare_turn(&self.store, &request)?;
        let session_id = prepared.session.id;

        let reply = match self.client.complete(&prepared.history).await {
            Ok(reply) => reply,
            Err(error) => {
                warn!(
                    session_id = %session_id,
                    error_kind = error.error_kind(),
                    error = %error,
                    "completion failed"
                );
                return Err(ChatError::Upstream { session_id, error });
            }
        };

        if let Err(e) = self.store.append_message(session_id, Role::Assistant, &reply) {
            error!(session_id = %session_id, error = %e, "failed to persist assistant reply");
        }

        info!(
            session_id = %session_id,
            first_turn = prepared.is_first,
            reply_chars = reply.chars().count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chat turn completed"
        );

        Ok(ChatReply { reply, session_id })
    }
}
