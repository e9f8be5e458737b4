//! Table layout of the service's own database.

pub const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
";

pub const TABLES: &str = "
    CREATE TABLE IF NOT EXISTS connections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        engine_kind TEXT NOT NULL,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        username TEXT NOT NULL,
        encrypted_secret TEXT NOT NULL,
        database_name TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS schema_nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        metadata_json TEXT NOT NULL,
        UNIQUE (connection_id, name)
    );
    CREATE TABLE IF NOT EXISTS schema_edges (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
        source_id INTEGER NOT NULL REFERENCES schema_nodes(id),
        target_id INTEGER NOT NULL REFERENCES schema_nodes(id),
        kind TEXT NOT NULL,
        metadata_json TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS chat_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        connection_id INTEGER NOT NULL REFERENCES connections(id) ON DELETE CASCADE,
        title TEXT,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS chat_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        sql_query TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_connections_tenant ON connections(tenant_id);
    CREATE INDEX IF NOT EXISTS idx_nodes_connection ON schema_nodes(connection_id);
    CREATE INDEX IF NOT EXISTS idx_edges_connection ON schema_edges(connection_id);
    CREATE INDEX IF NOT EXISTS idx_messages_session ON chat_messages(session_id, id);
";
