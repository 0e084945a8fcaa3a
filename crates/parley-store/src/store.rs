use serde::Serialize;
use tracing::{debug, info, instrument};

use parley_core::ids::{OwnerId, SessionId};
use parley_core::messages::Role;
use parley_core::text::is_blank;

use crate::database::Database;
use crate::error::StoreError;
use crate::messages::{self, MessageRow};
use crate::row_helpers;
use crate::sessions::{self, SessionRow};
use crate::title::{normalize_topic, title_from_first_message, DEFAULT_TITLE};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// One page of an owner's sessions, most recently updated first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionPage {
    pub items: Vec<SessionRow>,
    pub page: u32,
    pub size: u32,
    pub total: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: SessionRow,
    pub messages: Vec<MessageRow>,
}

/// Result of recording a user message.
#[derive(Clone, Debug)]
pub struct RecordedTurn {
    pub message: MessageRow,
    /// True when this was the first message of the session; the session has
    /// then been retitled from it.
    pub is_first: bool,
}

/// Owner-scoped session and message persistence.
///
/// Every read and write that takes an `owner` treats a session belonging to
/// someone else exactly like a missing one.
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Return the caller's session `session_id`, or create a fresh one when
    /// it is absent, missing or owned by someone else.
    #[instrument(skip(self), fields(owner_id = %owner))]
    pub fn resolve_or_create(
        &self,
        session_id: Option<SessionId>,
        owner: OwnerId,
        topic_hint: Option<&str>,
    ) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            if let Some(id) = session_id {
                if let Some(existing) = sessions::find_owned(conn, id, owner)? {
                    return Ok(existing);
                }
                debug!(session_id = %id, "requested session unavailable, creating a new one");
            }
            let topic = normalize_topic(topic_hint);
            let created = sessions::insert(conn, owner, DEFAULT_TITLE, &topic)?;
            info!(session_id = %created.id, topic = %created.topic, "session created");
            Ok(created)
        })
    }

    #[instrument(skip(self), fields(owner_id = %owner))]
    pub fn create(
        &self,
        owner: OwnerId,
        title: Option<&str>,
        topic: Option<&str>,
    ) -> Result<SessionRow, StoreError> {
        let title = match title.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => DEFAULT_TITLE,
        };
        let topic = normalize_topic(topic);
        self.db.with_conn(|conn| sessions::insert(conn, owner, title, &topic))
    }

    pub fn get(&self, id: SessionId, owner: OwnerId) -> Result<Option<SessionRow>, StoreError> {
        self.db.with_conn(|conn| sessions::find_owned(conn, id, owner))
    }

    #[instrument(skip(self), fields(session_id = %id, owner_id = %owner))]
    pub fn get_with_messages(
        &self,
        id: SessionId,
        owner: OwnerId,
    ) -> Result<Option<SessionDetail>, StoreError> {
        self.db.with_conn(|conn| {
            let Some(session) = sessions::find_owned(conn, id, owner)? else {
                return Ok(None);
            };
            let messages = messages::list_for_session(conn, id)?;
            Ok(Some(SessionDetail { session, messages }))
        })
    }

    /// `page` is 0-based; `size` is clamped to `1..=MAX_PAGE_SIZE`.
    #[instrument(skip(self), fields(owner_id = %owner))]
    pub fn list(&self, owner: OwnerId, page: u32, size: u32) -> Result<SessionPage, StoreError> {
        let size = size.clamp(1, MAX_PAGE_SIZE);
        let offset = page.saturating_mul(size);
        self.db.with_conn(|conn| {
            let items = sessions::list_for_owner(conn, owner, size, offset)?;
            let total = sessions::count_for_owner(conn, owner)?;
            Ok(SessionPage {
                items,
                page,
                size,
                total,
            })
        })
    }

    /// Rename a session. A blank title leaves it unchanged; the session is
    /// returned either way. `None` when not found for this owner.
    #[instrument(skip(self, title), fields(session_id = %id, owner_id = %owner))]
    pub fn update_title(
        &self,
        id: SessionId,
        owner: OwnerId,
        title: &str,
    ) -> Result<Option<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            if sessions::find_owned(conn, id, owner)?.is_none() {
                return Ok(None);
            }
            if !is_blank(title) {
                sessions::set_title(conn, id, title.trim())?;
                sessions::touch(conn, id, &row_helpers::now_rfc3339())?;
            }
            sessions::find(conn, id)
        })
    }

    /// Delete a session and its messages. Returns whether anything was deleted.
    #[instrument(skip(self), fields(session_id = %id, owner_id = %owner))]
    pub fn delete(&self, id: SessionId, owner: OwnerId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            if sessions::find_owned(conn, id, owner)?.is_none() {
                return Ok(false);
            }
            sessions::remove(conn, id)
        })
    }

    #[instrument(skip(self, content), fields(session_id = %session_id, role = %role, len = content.len()))]
    pub fn append_message(
        &self,
        session_id: SessionId,
        role: Role,
        content: &str,
    ) -> Result<MessageRow, StoreError> {
        self.db
            .with_conn(|conn| messages::append(conn, session_id, role, content))
    }

    /// Append a user message; if it is the session's first, derive and store
    /// the title from it. Both steps share one lock.
    #[instrument(skip(self, content), fields(session_id = %session_id))]
    pub fn record_user_turn(
        &self,
        session_id: SessionId,
        content: &str,
    ) -> Result<RecordedTurn, StoreError> {
        self.db.with_conn(|conn| {
            let is_first = messages::count_for_session(conn, session_id)? == 0;
            let message = messages::append(conn, session_id, Role::User, content)?;
            if is_first {
                let title = title_from_first_message(content);
                sessions::set_title(conn, session_id, &title)?;
                debug!(title = %title, "session titled from first message");
            }
            Ok(RecordedTurn { message, is_first })
        })
    }

    /// Ordered history of an owned session.
    #[instrument(skip(self), fields(session_id = %session_id, owner_id = %owner))]
    pub fn history(&self, session_id: SessionId, owner: OwnerId) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            if sessions::find_owned(conn, session_id, owner)?.is_none() {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }
            messages::list_for_session(conn, session_id)
        })
    }
}
