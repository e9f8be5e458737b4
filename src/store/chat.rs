use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};

use super::{now_text, parse_timestamp};
use crate::{
    error::CoreResult,
    models::{ChatMessage, ChatRole, ChatSession},
};

pub fn create_session(
    conn: &Connection,
    connection_id: i64,
    title: Option<&str>,
) -> CoreResult<ChatSession> {
    let created_at = now_text();
    conn.execute(
        "INSERT INTO chat_sessions(connection_id, title, created_at) VALUES(?1, ?2, ?3)",
        params![connection_id, title, created_at],
    )?;
    Ok(ChatSession {
        id: conn.last_insert_rowid(),
        connection_id,
        title: title.map(str::to_string),
        created_at: parse_timestamp(3, &created_at)?,
        messages: None,
    })
}

pub fn get_session(conn: &Connection, id: i64) -> CoreResult<Option<ChatSession>> {
    let session = conn
        .query_row(
            "SELECT id, connection_id, title, created_at FROM chat_sessions WHERE id = ?1",
            params![id],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

pub fn list_sessions(conn: &Connection, connection_id: Option<i64>) -> CoreResult<Vec<ChatSession>> {
    let mut stmt = conn.prepare(
        "SELECT id, connection_id, title, created_at FROM chat_sessions
         WHERE ?1 IS NULL OR connection_id = ?1
         ORDER BY created_at DESC, id DESC",
    )?;
    let sessions = stmt
        .query_map(params![connection_id], session_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(sessions)
}

pub fn append_message(
    conn: &Connection,
    session_id: i64,
    role: ChatRole,
    content: &str,
    sql_query: Option<&str>,
) -> CoreResult<ChatMessage> {
    let created_at = now_text();
    conn.execute(
        "INSERT INTO chat_messages(session_id, role, content, sql_query, created_at) VALUES(?1, ?2, ?3, ?4, ?5)",
        params![session_id, role.as_str(), content, sql_query, created_at],
    )?;
    Ok(ChatMessage {
        id: conn.last_insert_rowid(),
        session_id,
        role,
        content: content.to_string(),
        sql_query: sql_query.map(str::to_string),
        created_at: parse_timestamp(5, &created_at)?,
    })
}

/// Messages of a session, oldest first.
pub fn messages(conn: &Connection, session_id: i64) -> CoreResult<Vec<ChatMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, role, content, sql_query, created_at FROM chat_messages
         WHERE session_id = ?1 ORDER BY id",
    )?;
    let messages = stmt
        .query_map(params![session_id], message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ChatSession> {
    let created_at: String = row.get(3)?;
    Ok(ChatSession {
        id: row.get(0)?,
        connection_id: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_timestamp(3, &created_at)?,
        messages: None,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    let raw_role: String = row.get(2)?;
    let role = ChatRole::parse(&raw_role).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown chat role {raw_role}").into(),
        )
    })?;
    let created_at: String = row.get(5)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role,
        content: row.get(3)?,
        sql_query: row.get(4)?,
        created_at: parse_timestamp(5, &created_at)?,
    })
}
