use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use parley_core::ids::{MessageId, SessionId};
use parley_core::messages::{Role, Turn};

use crate::error::StoreError;
use crate::row_helpers;
use crate::sessions;

/// One persisted, immutable conversation turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRow {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

impl MessageRow {
    pub fn to_turn(&self) -> Turn {
        Turn {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Append a message and bump the parent session's `updated_at`.
///
/// The timestamp is clamped to the latest one already stored for the
/// session, so creation order never goes backwards even if the wall clock
/// does. Must run inside a single `with_conn` closure with the session
/// existence check to be atomic.
pub(crate) fn append(
    conn: &Connection,
    session_id: SessionId,
    role: Role,
    content: &str,
) -> Result<MessageRow, StoreError> {
    if !sessions::exists(conn, session_id)? {
        return Err(StoreError::NotFound(format!("session {session_id}")));
    }

    let latest: Option<String> = conn.query_row(
        "SELECT MAX(created_at) FROM chat_messages WHERE session_id = ?1",
        [session_id.get()],
        |row| row.get(0),
    )?;
    let now = row_helpers::now_rfc3339();
    let created_at = match latest {
        Some(latest) if latest > now => latest,
        _ => now,
    };

    conn.execute(
        "INSERT INTO chat_messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![session_id.get(), role.as_str(), content, created_at],
    )?;
    let id = MessageId::from_raw(conn.last_insert_rowid());
    sessions::touch(conn, session_id, &created_at)?;

    Ok(MessageRow {
        id,
        session_id,
        role,
        content: content.to_string(),
        created_at,
    })
}

/// All messages of a session in creation order (insertion order breaks ties).
pub(crate) fn list_for_session(conn: &Connection, session_id: SessionId) -> Result<Vec<MessageRow>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, role, content, created_at FROM chat_messages
         WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
    )?;
    let mut rows = stmt.query([session_id.get()])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_message(row)?);
    }
    Ok(results)
}

pub(crate) fn count_for_session(conn: &Connection, session_id: SessionId) -> Result<u64, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM chat_messages WHERE session_id = ?1",
        [session_id.get()],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let role: String = row_helpers::get(row, 2, "chat_messages", "role")?;
    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get(row, 0, "chat_messages", "id")?),
        session_id: SessionId::from_raw(row_helpers::get(row, 1, "chat_messages", "session_id")?),
        role: row_helpers::parse_enum(&role, "chat_messages", "role")?,
        content: row_helpers::get(row, 3, "chat_messages", "content")?,
        created_at: row_helpers::get(row, 4, "chat_messages", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use parley_core::ids::OwnerId;

    fn setup() -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let session = db
            .with_conn(|conn| sessions::insert(conn, OwnerId::from_raw(1), "t", "general"))
            .unwrap();
        (db, session.id)
    }

    #[test]
    fn append_and_list_in_order() {
        let (db, sid) = setup();
        db.with_conn(|conn| {
            append(conn, sid, Role::User, "one")?;
            append(conn, sid, Role::Assistant, "two")?;
            append(conn, sid, Role::User, "three")?;
            let listed = list_for_session(conn, sid)?;
            let contents: Vec<_> = listed.iter().map(|m| m.content.as_str()).collect();
            assert_eq!(contents, ["one", "two", "three"]);
            assert!(listed.windows(2).all(|w| w[0].created_at <= w[1].created_at));
            assert!(listed.windows(2).all(|w| w[0].id < w[1].id));
            assert_eq!(count_for_session(conn, sid)?, 3);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn append_to_missing_session_fails() {
        let (db, _) = setup();
        let result = db.with_conn(|conn| append(conn, SessionId::from_raw(404), Role::User, "hi"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn timestamp_never_goes_backwards() {
        let (db, sid) = setup();
        db.with_conn(|conn| {
            // A message stamped far in the future, as if the clock had jumped back since.
            conn.execute(
                "INSERT INTO chat_messages (session_id, role, content, created_at)
                 VALUES (?1, 'user', 'future', '2999-01-01T00:00:00.000000Z')",
                [sid.get()],
            )?;
            let next = append(conn, sid, Role::Assistant, "after")?;
            assert_eq!(next.created_at, "2999-01-01T00:00:00.000000Z");
            let listed = list_for_session(conn, sid)?;
            assert_eq!(listed.last().unwrap().content, "after");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn append_touches_session() {
        let (db, sid) = setup();
        let before = db.with_conn(|conn| sessions::find(conn, sid)).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let msg = db.with_conn(|conn| append(conn, sid, Role::User, "hi")).unwrap();
        let after = db.with_conn(|conn| sessions::find(conn, sid)).unwrap().unwrap();
        assert!(after.updated_at > before.updated_at);
        assert_eq!(after.updated_at, msg.created_at);
    }

    #[test]
    fn corrupt_role_is_reported() {
        let (db, sid) = setup();
        db.with_conn(|conn| {
            conn.execute_batch("PRAGMA ignore_check_constraints = ON;")?;
            conn.execute(
                "INSERT INTO chat_messages (session_id, role, content, created_at)
                 VALUES (?1, 'system', 'x', '2024-01-01T00:00:00.000000Z')",
                [sid.get()],
            )?;
            Ok(())
        })
        .unwrap();
        let result = db.with_conn(|conn| list_for_session(conn, sid));
        assert!(matches!(result, Err(StoreError::CorruptRow { column: "role", .. })));
    }

    #[test]
    fn to_turn_copies_role_and_content() {
        let (db, sid) = setup();
        let msg = db.with_conn(|conn| append(conn, sid, Role::Assistant, "hello")).unwrap();
        assert_eq!(msg.to_turn(), Turn::assistant("hello"));
    }
}
