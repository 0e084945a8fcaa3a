use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use parley_core::ids::{OwnerId, SessionId};

use crate::error::StoreError;
use crate::row_helpers;

const SESSION_COLUMNS: &str = "id, owner_id, title, topic, created_at, updated_at";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub id: SessionId,
    pub owner_id: OwnerId,
    pub title: String,
    pub topic: String,
    pub created_at: String,
    pub updated_at: String,
}

pub(crate) fn insert(
    conn: &Connection,
    owner_id: OwnerId,
    title: &str,
    topic: &str,
) -> Result<SessionRow, StoreError> {
    let now = row_helpers::now_rfc3339();
    conn.execute(
        "INSERT INTO chat_sessions (owner_id, title, topic, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        rusqlite::params![owner_id.get(), title, topic, now],
    )?;

    Ok(SessionRow {
        id: SessionId::from_raw(conn.last_insert_rowid()),
        owner_id,
        title: title.to_string(),
        topic: topic.to_string(),
        created_at: now.clone(),
        updated_at: now,
    })
}

pub(crate) fn find(conn: &Connection, id: SessionId) -> Result<Option<SessionRow>, StoreError> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([id.get()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_session(row)?)),
        None => Ok(None),
    }
}

/// The session, only if it belongs to `owner_id`.
pub(crate) fn find_owned(
    conn: &Connection,
    id: SessionId,
    owner_id: OwnerId,
) -> Result<Option<SessionRow>, StoreError> {
    Ok(find(conn, id)?.filter(|s| s.owner_id == owner_id))
}

pub(crate) fn touch(conn: &Connection, id: SessionId, at: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE chat_sessions SET updated_at = ?1 WHERE id = ?2",
        rusqlite::params![at, id.get()],
    )?;
    Ok(())
}

pub(crate) fn exists(conn: &Connection, id: SessionId) -> Result<bool, StoreError> {
    Ok(conn
        .query_row("SELECT 1 FROM chat_sessions WHERE id = ?1", [id.get()], |_| Ok(()))
        .optional()?
        .is_some())
}

/// Sessions of one owner, most recently updated first.
pub(crate) fn list_for_owner(
    conn: &Connection,
    owner_id: OwnerId,
    limit: u32,
    offset: u32,
) -> Result<Vec<SessionRow>, StoreError> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE owner_id = ?1
         ORDER BY updated_at DESC, id DESC LIMIT ?2 OFFSET ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params![owner_id.get(), limit, offset])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_session(row)?);
    }
    Ok(results)
}

pub(crate) fn count_for_owner(conn: &Connection, owner_id: OwnerId) -> Result<u64, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM chat_sessions WHERE owner_id = ?1",
        [owner_id.get()],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

/// Overwrite the title only; callers decide whether `updated_at` moves.
pub(crate) fn set_title(conn: &Connection, id: SessionId, title: &str) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE chat_sessions SET title = ?1 WHERE id = ?2",
        rusqlite::params![title, id.get()],
    )?;
    Ok(())
}

/// Hard delete; messages go with it through the foreign-key cascade.
pub(crate) fn remove(conn: &Connection, id: SessionId) -> Result<bool, StoreError> {
    let n = conn.execute("DELETE FROM chat_sessions WHERE id = ?1", [id.get()])?;
    Ok(n > 0)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    Ok(SessionRow {
        id: SessionId::from_raw(row_helpers::get(row, 0, "chat_sessions", "id")?),
        owner_id: OwnerId::from_raw(row_helpers::get(row, 1, "chat_sessions", "owner_id")?),
        title: row_helpers::get(row, 2, "chat_sessions", "title")?,
        topic: row_helpers::get(row, 3, "chat_sessions", "topic")?,
        created_at: row_helpers::get(row, 4, "chat_sessions", "created_at")?,
        updated_at: row_helpers::get(row, 5, "chat_sessions", "updated_at")?,
    })
}
