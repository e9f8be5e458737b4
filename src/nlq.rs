//! Natural-language question answering against a live target database.
//!
//! Each call opens its own transient connection (independent of any stored
//! schema graph), builds schema context from it, asks the generation step for
//! SQL, strips markdown fences, runs the SQL verbatim and returns the rows.
//! The generated SQL runs with whatever privileges the stored credentials
//! grant; nothing here validates or rewrites it.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{
    crypto::CredentialCipher,
    engine::{EngineRegistry, LiveConnection},
    generation::{GenerationRequest, SqlGenerator},
    models::{ConnectionDescriptor, Row},
};

const SCHEMA_SAMPLE_ROWS: usize = 3;
const SQL_FENCE_TAGS: [&str; 5] = ["sql", "sqlite", "postgresql", "postgres", "mysql"];
const SQL_LEADING_KEYWORDS: [&str; 12] = [
    "select", "with", "insert", "update", "delete", "replace", "pragma", "explain", "values",
    "create", "drop", "alter",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryFailureKind {
    Connectivity,
    Translation,
    Execution,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{message}")]
pub struct QueryFailure {
    pub kind: QueryFailureKind,
    pub message: String,
}

impl QueryFailure {
    fn new(kind: QueryFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnswer {
    pub generated_sql: String,
    pub rows: Vec<Row>,
}

pub struct QueryEngine {
    engines: Arc<EngineRegistry>,
    cipher: Arc<CredentialCipher>,
    generator: Arc<dyn SqlGenerator>,
    call_timeout: Duration,
    top_k: usize,
}

impl QueryEngine {
    pub fn new(
        engines: Arc<EngineRegistry>,
        cipher: Arc<CredentialCipher>,
        generator: Arc<dyn SqlGenerator>,
        call_timeout: Duration,
        top_k: usize,
    ) -> Self {
        Self {
            engines,
            cipher,
            generator,
            call_timeout,
            top_k,
        }
    }

    pub async fn answer(
        &self,
        question: &str,
        descriptor: &ConnectionDescriptor,
    ) -> Result<QueryAnswer, QueryFailure> {
        let result = self.run_pipeline(question, descriptor).await;
        match &result {
            Ok(answer) => info!(
                connection_id = descriptor.id,
                rows = answer.rows.len(),
                "Question answered"
            ),
            Err(failure) => warn!(
                connection_id = descriptor.id,
                kind = ?failure.kind,
                "Question failed: {}",
                failure.message
            ),
        }
        result
    }

    async fn run_pipeline(
        &self,
        question: &str,
        descriptor: &ConnectionDescriptor,
    ) -> Result<QueryAnswer, QueryFailure> {
        use QueryFailureKind::{Connectivity, Execution, Translation};

        let conn = self.open(descriptor).await?;

        let (conn, dialect, schema_context) = self
            .blocking(Connectivity, "schema context", move || {
                let mut conn = conn;
                let context = conn.schema_context(SCHEMA_SAMPLE_ROWS)?;
                let dialect = conn.dialect();
                Ok((conn, dialect, context))
            })
            .await?;

        let request = GenerationRequest {
            question,
            dialect,
            schema_context: &schema_context,
            top_k: self.top_k,
        };
        let raw_sql = match timeout(self.call_timeout, self.generator.generate(&request)).await {
            Err(_) => {
                return Err(QueryFailure::new(
                    Translation,
                    format!(
                        "SQL generation timed out after {}s",
                        self.call_timeout.as_secs_f32()
                    ),
                ))
            }
            Ok(Err(err)) => return Err(QueryFailure::new(Translation, format!("{err:#}"))),
            Ok(Ok(raw)) => raw,
        };

        let sql = strip_code_fences(&raw_sql);
        if sql.is_empty() {
            return Err(QueryFailure::new(
                Translation,
                "SQL generation returned an empty query",
            ));
        }

        let statement = sql.clone();
        let rows = self
            .blocking(Execution, "execution", move || {
                let mut conn = conn;
                conn.execute(&statement)
            })
            .await?;

        Ok(QueryAnswer {
            generated_sql: sql,
            rows,
        })
    }

    /// Opens a connection and runs `SELECT 1` on it.
    pub async fn ping(&self, descriptor: &ConnectionDescriptor) -> Result<(), QueryFailure> {
        let conn = self.open(descriptor).await?;
        self.blocking(QueryFailureKind::Execution, "ping", move || {
            let mut conn = conn;
            conn.execute("SELECT 1").map(|_| ())
        })
        .await
    }

    async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn LiveConnection>, QueryFailure> {
        use QueryFailureKind::Connectivity;

        let engine = self
            .engines
            .get(&descriptor.engine_kind)
            .map_err(|err| QueryFailure::new(Connectivity, err.to_string()))?;
        let password = self.cipher.decrypt(&descriptor.encrypted_secret).map_err(|err| {
            QueryFailure::new(Connectivity, format!("Failed to decrypt connection secret: {err}"))
        })?;
        let target = descriptor.target(password);

        self.blocking(Connectivity, "connect", move || engine.connect(&target))
            .await
    }

    /// Runs one blocking step under the call timeout. A step that times out
    /// keeps running on its thread and releases its connection when it ends.
    async fn blocking<T, F>(
        &self,
        kind: QueryFailureKind,
        step: &str,
        op: F,
    ) -> Result<T, QueryFailure>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        match timeout(self.call_timeout, tokio::task::spawn_blocking(op)).await {
            Err(_) => Err(QueryFailure::new(
                kind,
                format!(
                    "{step} timed out after {}s",
                    self.call_timeout.as_secs_f32()
                ),
            )),
            Ok(Err(err)) => Err(QueryFailure::new(kind, format!("{step} task aborted: {err}"))),
            Ok(Ok(Err(err))) => Err(QueryFailure::new(kind, format!("{err:#}"))),
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }
}

/// Extracts SQL from generated text that may be wrapped in markdown fences.
pub fn strip_code_fences(raw: &str) -> String {
    let text = raw.trim();
    let Some(open) = text.find("```") else {
        return text.to_string();
    };

    let mut body = &text[open + 3..];
    if let Some(close) = body.find("```") {
        body = &body[..close];
    }

    let tag_end = body
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(body.len());
    let tag = &body[..tag_end];
    if !tag.is_empty() {
        let rest = &body[tag_end..];
        let known = SQL_FENCE_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag));
        let on_own_line = rest.starts_with('\n') || rest.starts_with("\r\n") || rest.is_empty();
        let statement = SQL_LEADING_KEYWORDS
            .iter()
            .any(|k| k.eq_ignore_ascii_case(tag));
        if known || (on_own_line && !statement) {
            body = rest;
        }
    }

    body.trim().to_string()
}
