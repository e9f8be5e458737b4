use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rusqlite::{types::ValueRef, Connection, OpenFlags};
use serde_json::{json, Number, Value};
use tracing::debug;

use super::{DatabaseEngine, IntrospectionStrategy, LiveConnection, LiveConnector};
use crate::{
    error::{CoreError, CoreResult},
    models::{
        ColumnInfo, ColumnPair, EdgeKind, EdgePrimitive, GraphPrimitives, NodeKind, NodePrimitive,
        Row, TargetCredentials,
    },
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// File-backed SQLite targets. `database_name` is the database path; the
/// network fields of the descriptor are ignored.
#[derive(Debug, Default)]
pub struct SqliteEngine {
    open_handles: Arc<AtomicUsize>,
}

impl SqliteEngine {
    pub const KIND: &'static str = "sqlite";

    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handles this engine has opened and not yet released.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }
}

struct SqliteHandle {
    conn: Connection,
    open_handles: Arc<AtomicUsize>,
}

impl Drop for SqliteHandle {
    fn drop(&mut self) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

fn open_handle(
    open_handles: &Arc<AtomicUsize>,
    path: &str,
    flags: OpenFlags,
) -> rusqlite::Result<SqliteHandle> {
    let conn = Connection::open_with_flags(Path::new(path), flags)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    open_handles.fetch_add(1, Ordering::SeqCst);
    Ok(SqliteHandle {
        conn,
        open_handles: Arc::clone(open_handles),
    })
}

impl DatabaseEngine for SqliteEngine {
    fn kind(&self) -> &'static str {
        Self::KIND
    }
}

#[async_trait]
impl IntrospectionStrategy for SqliteEngine {
    async fn introspect(&self, target: &TargetCredentials) -> CoreResult<GraphPrimitives> {
        let path = target.database_name.clone();
        let open_handles = Arc::clone(&self.open_handles);

        let result = tokio::task::spawn_blocking(move || {
            let handle = open_handle(
                &open_handles,
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            read_catalog(&handle.conn)
        })
        .await
        .map_err(|err| CoreError::IntrospectionFailure(format!("catalog task aborted: {err}")))?;

        let graph = result.map_err(|err| CoreError::IntrospectionFailure(err.to_string()))?;
        debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "SQLite catalog read"
        );
        Ok(graph)
    }
}

impl LiveConnector for SqliteEngine {
    fn connect(&self, target: &TargetCredentials) -> anyhow::Result<Box<dyn LiveConnection>> {
        let handle = open_handle(
            &self.open_handles,
            &target.database_name,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open SQLite database {}", target.database_name))?;
        Ok(Box::new(handle))
    }
}

impl LiveConnection for SqliteHandle {
    fn dialect(&self) -> &'static str {
        "SQLite"
    }

    fn schema_context(&mut self, sample_rows: usize) -> anyhow::Result<String> {
        let mut stmt = self.conn.prepare(
            "SELECT name, sql FROM sqlite_master
             WHERE type = 'table' AND sql IS NOT NULL AND substr(name, 1, 7) <> 'sqlite_'",
        )?;
        let tables = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut context = String::new();
        for (name, ddl) in tables {
            context.push_str(ddl.trim());
            context.push_str("\n\n");
            if sample_rows == 0 {
                continue;
            }

            let sample_sql = format!("SELECT * FROM {} LIMIT {sample_rows}", quote_ident(&name));
            let (columns, rows) = query_values(&self.conn, &sample_sql)
                .with_context(|| format!("Failed to sample table {name}"))?;
            context.push_str(&format!("/*\n{} rows from {name} table:\n", rows.len()));
            context.push_str(&columns.join("\t"));
            context.push('\n');
            for row in rows {
                let cells: Vec<String> = row.iter().map(render_cell).collect();
                context.push_str(&cells.join("\t"));
                context.push('\n');
            }
            context.push_str("*/\n\n");
        }

        Ok(context.trim_end().to_string())
    }

    fn execute(&mut self, sql: &str) -> anyhow::Result<Vec<Row>> {
        let (columns, rows) = query_values(&self.conn, sql)?;
        Ok(rows
            .into_iter()
            .map(|values| columns.iter().cloned().zip(values).collect::<Row>())
            .collect())
    }
}

fn read_catalog(conn: &Connection) -> rusqlite::Result<GraphPrimitives> {
    let mut stmt = conn.prepare(
        "SELECT name, type FROM sqlite_master
         WHERE type IN ('table', 'view') AND substr(name, 1, 7) <> 'sqlite_'",
    )?;
    let objects = stmt
        .query_map([], |row| {
            let name: String = row.get(0)?;
            let raw_kind: String = row.get(1)?;
            let kind = if raw_kind == "view" {
                NodeKind::View
            } else {
                NodeKind::Table
            };
            Ok((name, kind))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut nodes = Vec::with_capacity(objects.len());
    for (name, kind) in &objects {
        let columns = read_columns(conn, name)?;
        nodes.push(NodePrimitive {
            name: name.clone(),
            kind: *kind,
            metadata: json!({ "columns": columns }),
        });
    }

    let mut edges = Vec::new();
    for (name, kind) in &objects {
        if *kind == NodeKind::Table {
            edges.extend(read_foreign_keys(conn, name)?);
        }
    }

    Ok(GraphPrimitives { nodes, edges })
}

fn read_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ColumnInfo>> {
    let mut stmt =
        conn.prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map([table], |row| {
            let not_null: i64 = row.get(2)?;
            let pk: i64 = row.get(3)?;
            Ok(ColumnInfo {
                name: row.get(0)?,
                r#type: row.get(1)?,
                nullable: not_null == 0,
                primary_key: pk > 0,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn read_foreign_keys(conn: &Connection, table: &str) -> rusqlite::Result<Vec<EdgePrimitive>> {
    let mut stmt = conn.prepare(
        "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1)",
    )?;
    let rows = stmt
        .query_map([table], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                ColumnPair {
                    source_column: row.get(2)?,
                    target_column: row.get(3)?,
                },
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    // One edge per constraint; a composite key spans several rows with the same id.
    let mut constraints: Vec<(i64, String, Vec<ColumnPair>)> = Vec::new();
    for (id, target, pair) in rows {
        match constraints.iter_mut().find(|(existing, _, _)| *existing == id) {
            Some((_, _, pairs)) => pairs.push(pair),
            None => constraints.push((id, target, vec![pair])),
        }
    }

    Ok(constraints
        .into_iter()
        .map(|(_, target, columns)| EdgePrimitive {
            source: table.to_string(),
            target,
            kind: EdgeKind::ForeignKey,
            metadata: json!({ "columns": columns }),
        })
        .collect())
}

fn query_values(
    conn: &Connection,
    sql: &str,
) -> rusqlite::Result<(Vec<String>, Vec<Vec<Value>>)> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut rows = stmt.query([])?;
    let mut values = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            record.push(json_value(row.get_ref(idx)?));
        }
        values.push(record);
    }
    Ok((columns, values))
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::from(v),
        ValueRef::Real(v) => Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}

fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn target(path: &Path) -> TargetCredentials {
        TargetCredentials {
            host: String::new(),
            port: 0,
            username: String::new(),
            password: "unused".to_string(),
            database_name: path.to_string_lossy().into_owned(),
        }
    }

    fn seed(dir: &tempfile::TempDir, ddl: &str) -> PathBuf {
        let path = dir.path().join("target.db");
        let conn = Connection::open(&path).expect("open seed db");
        conn.execute_batch(ddl).expect("seed ddl");
        path
    }

    const SHOP: &str = "
        CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, region TEXT);
        CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            customer_id INTEGER NOT NULL REFERENCES customers(id),
            total REAL
        );
        CREATE TABLE shipments (
            order_id INTEGER,
            line INTEGER,
            carrier TEXT,
            FOREIGN KEY (order_id, line) REFERENCES order_lines(order_id, line)
        );
        CREATE TABLE order_lines (order_id INTEGER, line INTEGER, PRIMARY KEY (order_id, line));
        CREATE VIEW big_orders AS SELECT * FROM orders WHERE total > 100;
        INSERT INTO customers VALUES (1, 'Ada', 'EU'), (2, 'Lin', NULL);
        INSERT INTO orders VALUES (10, 1, 250.5), (11, 2, 12.0);
    ";

    #[tokio::test]
    async fn introspects_tables_views_columns_and_foreign_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = seed(&dir, SHOP);
        let engine = SqliteEngine::new();

        let graph = engine.introspect(&target(&path)).await.expect("introspect");

        let mut names: Vec<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["big_orders", "customers", "order_lines", "orders", "shipments"]
        );

        let view = graph.nodes.iter().find(|n| n.name == "big_orders").expect("view");
        assert_eq!(view.kind, NodeKind::View);

        let customers = graph.nodes.iter().find(|n| n.name == "customers").expect("customers");
        assert_eq!(customers.kind, NodeKind::Table);
        let columns: Vec<ColumnInfo> =
            serde_json::from_value(customers.metadata["columns"].clone()).expect("columns");
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].name, "id");
        assert!(columns[0].primary_key);
        assert_eq!(columns[1].r#type, "TEXT");
        assert!(!columns[1].nullable);
        assert!(columns[2].nullable);

        assert_eq!(graph.edges.len(), 2);
        let fk = graph.edges.iter().find(|e| e.source == "orders").expect("orders fk");
        assert_eq!(fk.target, "customers");
        assert_eq!(fk.kind, EdgeKind::ForeignKey);
        assert_eq!(fk.metadata["columns"][0]["sourceColumn"], "customer_id");
        assert_eq!(fk.metadata["columns"][0]["targetColumn"], "id");

        let composite = graph.edges.iter().find(|e| e.source == "shipments").expect("composite");
        assert_eq!(composite.target, "order_lines");
        assert_eq!(composite.metadata["columns"].as_array().map(Vec::len), Some(2));

        assert_eq!(engine.open_handles(), 0);
    }

    #[tokio::test]
    async fn catalog_failure_mid_loop_releases_handle_and_returns_no_graph() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = seed(
            &dir,
            "CREATE TABLE a (id INTEGER PRIMARY KEY);
             CREATE TABLE gone (id INTEGER);
             CREATE VIEW broken AS SELECT id FROM gone;
             DROP TABLE gone;",
        );
        let engine = SqliteEngine::new();

        let result = engine.introspect(&target(&path)).await;

        assert!(matches!(result, Err(CoreError::IntrospectionFailure(_))));
        assert_eq!(engine.open_handles(), 0);
    }

    #[tokio::test]
    async fn missing_database_is_an_introspection_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.db");
        let engine = SqliteEngine::new();

        let result = engine.introspect(&target(&path)).await;

        assert!(matches!(result, Err(CoreError::IntrospectionFailure(_))));
        assert!(!path.exists());
        assert_eq!(engine.open_handles(), 0);
    }

    #[test]
    fn live_connection_executes_and_maps_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = seed(&dir, SHOP);
        let engine = SqliteEngine::new();

        let mut conn = engine.connect(&target(&path)).expect("connect");
        assert_eq!(engine.open_handles(), 1);
        assert_eq!(conn.dialect(), "SQLite");

        let rows = conn
            .execute("SELECT name, region FROM customers ORDER BY id")
            .expect("execute");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "Ada");
        assert_eq!(rows[1]["region"], Value::Null);

        let rows = conn.execute("SELECT 1 as x").expect("execute");
        assert_eq!(rows, vec![json!({"x": 1}).as_object().cloned().expect("map")]);

        assert!(conn.execute("SELECT * FROM nowhere").is_err());

        drop(conn);
        assert_eq!(engine.open_handles(), 0);
    }

    #[test]
    fn schema_context_lists_ddl_and_samples() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = seed(&dir, SHOP);
        let engine = SqliteEngine::new();

        let mut conn = engine.connect(&target(&path)).expect("connect");
        let context = conn.schema_context(3).expect("context");

        assert!(context.contains("CREATE TABLE customers"));
        assert!(context.contains("2 rows from customers table:"));
        assert!(context.contains("1\tAda\tEU"));
        assert!(!context.contains("CREATE VIEW"));
    }

    #[test]
    fn connect_does_not_create_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.db");
        let engine = SqliteEngine::new();

        assert!(engine.connect(&target(&path)).is_err());
        assert!(!path.exists());
        assert_eq!(engine.open_handles(), 0);
    }
}
