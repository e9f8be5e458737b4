use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now_text, parse_timestamp};
use crate::{error::CoreResult, models::ConnectionDescriptor};

/// A connection descriptor before it has been assigned an id.
#[derive(Debug, Clone)]
pub struct ConnectionDraft {
    pub name: String,
    pub engine_kind: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub encrypted_secret: String,
    pub database_name: String,
    pub tenant_id: String,
}

const COLUMNS: &str = "id, name, engine_kind, host, port, username, encrypted_secret, database_name, tenant_id, created_at";

pub fn insert(conn: &Connection, draft: &ConnectionDraft) -> CoreResult<ConnectionDescriptor> {
    let created_at = now_text();
    conn.execute(
        "INSERT INTO connections(name, engine_kind, host, port, username, encrypted_secret, database_name, tenant_id, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            draft.name,
            draft.engine_kind,
            draft.host,
            draft.port,
            draft.username,
            draft.encrypted_secret,
            draft.database_name,
            draft.tenant_id,
            created_at
        ],
    )?;
    let id = conn.last_insert_rowid();
    Ok(ConnectionDescriptor {
        id,
        name: draft.name.clone(),
        engine_kind: draft.engine_kind.clone(),
        host: draft.host.clone(),
        port: draft.port,
        username: draft.username.clone(),
        encrypted_secret: draft.encrypted_secret.clone(),
        database_name: draft.database_name.clone(),
        tenant_id: draft.tenant_id.clone(),
        created_at: parse_timestamp(9, &created_at)?,
    })
}

pub fn get(conn: &Connection, id: i64) -> CoreResult<Option<ConnectionDescriptor>> {
    let descriptor = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM connections WHERE id = ?1"),
            params![id],
            from_row,
        )
        .optional()?;
    Ok(descriptor)
}

pub fn list(conn: &Connection, tenant_id: Option<&str>) -> CoreResult<Vec<ConnectionDescriptor>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM connections WHERE ?1 IS NULL OR tenant_id = ?1 ORDER BY id"
    ))?;
    let descriptors = stmt
        .query_map(params![tenant_id], from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(descriptors)
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<ConnectionDescriptor> {
    let created_at: String = row.get(9)?;
    Ok(ConnectionDescriptor {
        id: row.get(0)?,
        name: row.get(1)?,
        engine_kind: row.get(2)?,
        host: row.get(3)?,
        port: row.get(4)?,
        username: row.get(5)?,
        encrypted_secret: row.get(6)?,
        database_name: row.get(7)?,
        tenant_id: row.get(8)?,
        created_at: parse_timestamp(9, &created_at)?,
    })
}
