//! Chat turns: user message, question answering, assistant message.

use tracing::info;

use crate::{
    error::CoreResult,
    models::{ChatRole, ChatSession, ChatTurn},
    nlq::QueryEngine,
    store::Store,
};

const TITLE_CHARS: usize = 50;

pub fn session_title(message: &str) -> String {
    message.chars().take(TITLE_CHARS).collect()
}

/// Opens a session on `connection_id` and runs the first turn in it.
pub async fn start_session(
    store: &Store,
    engine: &QueryEngine,
    connection_id: i64,
    message: &str,
) -> CoreResult<(ChatSession, ChatTurn)> {
    store.require_connection(connection_id).await?;
    let session = store
        .create_session(connection_id, Some(session_title(message)))
        .await?;
    let turn = run_turn(store, engine, &session, message).await?;
    Ok((session, turn))
}

/// Runs one turn. A failed query still produces an assistant message that
/// explains the failure; only store and lookup errors escape.
pub async fn run_turn(
    store: &Store,
    engine: &QueryEngine,
    session: &ChatSession,
    message: &str,
) -> CoreResult<ChatTurn> {
    let connection = store.require_connection(session.connection_id).await?;

    store
        .append_message(session.id, ChatRole::User, message.to_string(), None)
        .await?;

    let turn = match engine.answer(message, &connection).await {
        Ok(answer) => {
            let content = format!(
                "Here are the results:\n\nQuery: `{}`",
                answer.generated_sql
            );
            let reply = store
                .append_message(
                    session.id,
                    ChatRole::Assistant,
                    content,
                    Some(answer.generated_sql),
                )
                .await?;
            ChatTurn {
                message: reply,
                rows: Some(answer.rows),
                failure: None,
            }
        }
        Err(failure) => {
            let content = format!("Error processing request: {}", failure.message);
            let reply = store
                .append_message(session.id, ChatRole::Assistant, content, None)
                .await?;
            ChatTurn {
                message: reply,
                rows: None,
                failure: Some(failure),
            }
        }
    };

    info!(
        session_id = session.id,
        connection_id = session.connection_id,
        answered = turn.failure.is_none(),
        "Chat turn completed"
    );
    Ok(turn)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use rusqlite::Connection;

    use super::*;
    use crate::{
        crypto::{generate_key, CredentialCipher},
        engine::EngineRegistry,
        error::CoreError,
        generation::{GenerationRequest, SqlGenerator},
        nlq::QueryFailureKind,
        store::{test_support, ConnectionDraft},
    };

    struct FixedGenerator(&'static str);

    #[async_trait]
    impl SqlGenerator for FixedGenerator {
        async fn generate(&self, _request: &GenerationRequest<'_>) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    async fn setup(
        sql: &'static str,
        database_exists: bool,
    ) -> (tempfile::TempDir, Store, QueryEngine, i64) {
        let (dir, store) = test_support::temp_store().await;
        let target = dir.path().join("target.db");
        if database_exists {
            Connection::open(&target)
                .expect("open")
                .execute_batch("CREATE TABLE t (n INTEGER); INSERT INTO t VALUES (1), (2);")
                .expect("seed");
        }

        let cipher = Arc::new(CredentialCipher::new(&generate_key().expect("key")).expect("cipher"));
        let connection = store
            .insert_connection(ConnectionDraft {
                encrypted_secret: cipher.encrypt("pw").expect("encrypt"),
                ..test_support::draft("target", &target.to_string_lossy())
            })
            .await
            .expect("connection");

        let engine = QueryEngine::new(
            Arc::new(EngineRegistry::with_defaults()),
            cipher,
            Arc::new(FixedGenerator(sql)),
            Duration::from_secs(5),
            5,
        );
        (dir, store, engine, connection.id)
    }

    #[tokio::test]
    async fn successful_turn_records_sql_and_returns_rows() {
        let (_dir, store, engine, connection_id) =
            setup("```sql\nSELECT count(*) AS n FROM t\n```", true).await;

        let (session, turn) = start_session(&store, &engine, connection_id, "how many rows?")
            .await
            .expect("turn");

        assert_eq!(session.title.as_deref(), Some("how many rows?"));
        assert_eq!(turn.message.role, ChatRole::Assistant);
        assert_eq!(
            turn.message.sql_query.as_deref(),
            Some("SELECT count(*) AS n FROM t")
        );
        assert!(turn.message.content.starts_with("Here are the results:"));
        assert_eq!(turn.rows.as_ref().map(|rows| rows[0]["n"].clone()), Some(serde_json::Value::from(2)));

        let stored = store.session_with_messages(session.id).await.expect("session");
        let messages = stored.messages.expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[0].content, "how many rows?");
    }

    #[tokio::test]
    async fn failed_query_still_appends_an_assistant_message() {
        let (_dir, store, engine, connection_id) = setup("SELECT 1", false).await;

        let (session, turn) = start_session(&store, &engine, connection_id, "anything")
            .await
            .expect("turn completes");

        assert!(turn.rows.is_none());
        assert_eq!(turn.message.sql_query, None);
        assert!(turn.message.content.starts_with("Error processing request:"));
        assert_eq!(
            turn.failure.as_ref().map(|f| f.kind),
            Some(QueryFailureKind::Connectivity)
        );

        let stored = store.session_with_messages(session.id).await.expect("session");
        assert_eq!(stored.messages.map(|m| m.len()), Some(2));
    }

    #[tokio::test]
    async fn unknown_connection_is_surfaced_before_anything_is_written() {
        let (_dir, store, engine, _connection_id) = setup("SELECT 1", true).await;

        let err = start_session(&store, &engine, 999, "hello")
            .await
            .expect_err("missing connection");

        assert!(matches!(err, CoreError::ConnectionNotFound(999)));
        assert!(store.list_sessions(None).await.expect("list").is_empty());
    }

    #[test]
    fn titles_are_cut_to_fifty_characters() {
        let long = "é".repeat(80);
        assert_eq!(session_title(&long).chars().count(), 50);
        assert_eq!(session_title("short"), "short");
    }
}
