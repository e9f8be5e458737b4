//! The service's own persistent store.
//!
//! Every operation opens its own SQLite handle on a blocking task; handles are
//! never shared between concurrent operations. Graph replacement for one
//! connection id is additionally serialized by [`ConnectionLocks`].

pub mod chat;
pub mod connections;
pub mod graph;
mod schema;

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection};
use tokio::{fs, sync::OwnedMutexGuard};

use crate::{
    error::{CoreError, CoreResult},
    models::{
        ChatMessage, ChatRole, ChatSession, ConnectionDescriptor, GraphPrimitives, ReplaceSummary,
        SchemaGraph,
    },
};

pub use connections::ConnectionDraft;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Store {
    path: Arc<PathBuf>,
    replace_locks: Arc<ConnectionLocks>,
}

impl Store {
    pub async fn open(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        ensure_parent_dir(&path).await?;

        let store = Self {
            path: Arc::new(path),
            replace_locks: Arc::new(ConnectionLocks::default()),
        };
        store
            .run(|conn| {
                conn.execute_batch(schema::TABLES)?;
                Ok(())
            })
            .await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens a fresh handle to the store.
    pub fn session(&self) -> CoreResult<Connection> {
        let conn = Connection::open(self.path.as_path())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(schema::PRAGMAS)?;
        Ok(conn)
    }

    /// Runs `op` on a dedicated handle inside a blocking task.
    pub async fn run<T, F>(&self, op: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> CoreResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = store.session()?;
            op(&mut conn)
        })
        .await?
    }

    /// Atomically replaces the whole graph of `connection_id`.
    pub async fn replace_graph(
        &self,
        connection_id: i64,
        graph: GraphPrimitives,
    ) -> CoreResult<ReplaceSummary> {
        let guard = self.replace_locks.acquire(connection_id).await;
        self.run(move |conn| {
            // Held until the transaction ends, even if the caller stops waiting.
            let _guard = guard;
            graph::replace(conn, connection_id, &graph)
        })
        .await
    }

    pub async fn graph(&self, connection_id: i64) -> CoreResult<SchemaGraph> {
        self.run(move |conn| graph::load(conn, connection_id)).await
    }

    pub async fn insert_connection(&self, draft: ConnectionDraft) -> CoreResult<ConnectionDescriptor> {
        self.run(move |conn| connections::insert(conn, &draft)).await
    }

    pub async fn connection(&self, id: i64) -> CoreResult<Option<ConnectionDescriptor>> {
        self.run(move |conn| connections::get(conn, id)).await
    }

    pub async fn require_connection(&self, id: i64) -> CoreResult<ConnectionDescriptor> {
        self.connection(id)
            .await?
            .ok_or(CoreError::ConnectionNotFound(id))
    }

    pub async fn list_connections(
        &self,
        tenant_id: Option<String>,
    ) -> CoreResult<Vec<ConnectionDescriptor>> {
        self.run(move |conn| connections::list(conn, tenant_id.as_deref()))
            .await
    }

    pub async fn create_session(
        &self,
        connection_id: i64,
        title: Option<String>,
    ) -> CoreResult<ChatSession> {
        self.run(move |conn| chat::create_session(conn, connection_id, title.as_deref()))
            .await
    }

    pub async fn require_session(&self, id: i64) -> CoreResult<ChatSession> {
        self.run(move |conn| chat::get_session(conn, id))
            .await?
            .ok_or(CoreError::SessionNotFound(id))
    }

    pub async fn session_with_messages(&self, id: i64) -> CoreResult<ChatSession> {
        self.run(move |conn| {
            let mut session = chat::get_session(conn, id)?.ok_or(CoreError::SessionNotFound(id))?;
            session.messages = Some(chat::messages(conn, id)?);
            Ok(session)
        })
        .await
    }

    pub async fn list_sessions(&self, connection_id: Option<i64>) -> CoreResult<Vec<ChatSession>> {
        self.run(move |conn| chat::list_sessions(conn, connection_id))
            .await
    }

    pub async fn append_message(
        &self,
        session_id: i64,
        role: ChatRole,
        content: String,
        sql_query: Option<String>,
    ) -> CoreResult<ChatMessage> {
        self.run(move |conn| {
            chat::append_message(conn, session_id, role, &content, sql_query.as_deref())
        })
        .await
    }
}

/// Per-connection mutual exclusion for graph replacement.
#[derive(Debug, Default)]
pub struct ConnectionLocks {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionLocks {
    pub async fn acquire(&self, connection_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Entries nobody holds or waits on are dropped.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(connection_id).or_default())
        };
        lock.lock_owned().await
    }
}

async fn ensure_parent_dir(path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(|err| {
            CoreError::PersistenceFailure(format!(
                "Failed to create store directory {}: {err}",
                parent.display()
            ))
        })?;
    }
    Ok(())
}

pub(crate) fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|v| v.with_timezone(&Utc))
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}
