use std::{future::Future, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::{
    auth::verify_bearer,
    chat,
    crypto::CryptoError,
    error::CoreError,
    models::{ChatRequest, ConnectionTestResult, NewConnection},
    rate_limit::RateLimiter,
    store::ConnectionDraft,
    AppState,
};

const DEFAULT_TENANT: &str = "default";

/// An HTTP failure rendered as `{"error":{"code","message"}}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
    }

    fn rate_limited() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "Too many chat requests. Retry after the reset interval.",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "code": self.code,
                    "message": self.message
                }
            })),
        )
            .into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let status = err.http_status();
        if status.is_server_error() {
            error!(code = err.code(), "Request failed: {err}");
        }
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<CryptoError> for ApiError {
    fn from(err: CryptoError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid_request(rejection.body_text())
    }
}

type ApiResult = Result<Response, ApiError>;

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn create_connection(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<NewConnection>, JsonRejection>,
) -> ApiResult {
    verify_bearer(&headers, &state.config.api_key)?;
    let Json(payload) = payload?;

    if payload.name.trim().is_empty() || payload.database_name.trim().is_empty() {
        return Err(ApiError::invalid_request(
            "Connection requires a name and a databaseName.",
        ));
    }

    let engine_kind = payload.engine_kind.trim().to_ascii_lowercase();
    if !state.engines.supports(&engine_kind) {
        return Err(CoreError::UnsupportedEngineKind(engine_kind).into());
    }

    let encrypted_secret = state.cipher.encrypt(&payload.password)?;
    let tenant_id = payload
        .tenant_id
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_TENANT.to_string());

    let descriptor = state
        .store
        .insert_connection(ConnectionDraft {
            name: payload.name.trim().to_string(),
            engine_kind,
            host: payload.host,
            port: payload.port,
            username: payload.username,
            encrypted_secret,
            database_name: payload.database_name,
            tenant_id,
        })
        .await?;

    info!(
        connection_id = descriptor.id,
        engine = %descriptor.engine_kind,
        tenant = %descriptor.tenant_id,
        "Connection created"
    );
    Ok((StatusCode::CREATED, Json(descriptor)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionListQuery {
    pub tenant_id: Option<String>,
}

pub async fn list_connections(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConnectionListQuery>,
) -> ApiResult {
    verify_bearer(&headers, &state.config.api_key)?;
    let connections = state.store.list_connections(query.tenant_id).await?;
    Ok(Json(connections).into_response())
}

pub async fn get_connection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(connection_id): Path<i64>,
) -> ApiResult {
    verify_bearer(&headers, &state.config.api_key)?;
    let descriptor = state.store.require_connection(connection_id).await?;
    Ok(Json(descriptor).into_response())
}

pub async fn test_connection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(connection_id): Path<i64>,
) -> ApiResult {
    verify_bearer(&headers, &state.config.api_key)?;
    let descriptor = state.store.require_connection(connection_id).await?;

    let result = match state.query_engine.ping(&descriptor).await {
        Ok(()) => ConnectionTestResult {
            status: "success",
            message: "Connection successful".to_string(),
        },
        Err(failure) => ConnectionTestResult {
            status: "error",
            message: failure.message,
        },
    };
    Ok(Json(result).into_response())
}

pub async fn trigger_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(connection_id): Path<i64>,
) -> ApiResult {
    verify_bearer(&headers, &state.config.api_key)?;
    let descriptor = state.store.require_connection(connection_id).await?;
    state.engines.get(&descriptor.engine_kind)?;

    let accepted = state.scans.trigger(connection_id).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

pub async fn get_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(scan_id): Path<String>,
) -> ApiResult {
    verify_bearer(&headers, &state.config.api_key)?;
    let Some(record) = state.scans.record(&scan_id).await else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "SCAN_NOT_FOUND",
            "Scan not found.",
        ));
    };
    Ok(Json(record).into_response())
}

pub async fn get_graph(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(connection_id): Path<i64>,
) -> ApiResult {
    verify_bearer(&headers, &state.config.api_key)?;
    state.store.require_connection(connection_id).await?;
    let graph = state.store.graph(connection_id).await?;
    Ok(Json(graph).into_response())
}

pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult {
    let token = verify_bearer(&headers, &state.config.api_key)?;
    let limiter = Arc::clone(&state.rate_limiter);
    rate_limited(&limiter, &token, async move {
        let Json(payload) = payload?;
        let Some(connection_id) = payload.connection_id else {
            return Err(ApiError::invalid_request("connectionId is required."));
        };
        let message = required_message(&payload.message)?;

        let (session, turn) =
            chat::start_session(&state.store, &state.query_engine, connection_id, message).await?;
        Ok((
            StatusCode::CREATED,
            Json(json!({ "session": session, "turn": turn })),
        )
            .into_response())
    })
    .await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListQuery {
    pub connection_id: Option<i64>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionListQuery>,
) -> ApiResult {
    verify_bearer(&headers, &state.config.api_key)?;
    let sessions = state.store.list_sessions(query.connection_id).await?;
    Ok(Json(sessions).into_response())
}

pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<i64>,
) -> ApiResult {
    verify_bearer(&headers, &state.config.api_key)?;
    let session = state.store.session_with_messages(session_id).await?;
    Ok(Json(session).into_response())
}

pub async fn post_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<i64>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult {
    let token = verify_bearer(&headers, &state.config.api_key)?;
    let limiter = Arc::clone(&state.rate_limiter);
    rate_limited(&limiter, &token, async move {
        let Json(payload) = payload?;
        let message = required_message(&payload.message)?;

        let session = state.store.require_session(session_id).await?;
        let turn = chat::run_turn(&state.store, &state.query_engine, &session, message).await?;
        Ok(Json(turn).into_response())
    })
    .await
}

fn required_message(message: &str) -> Result<&str, ApiError> {
    let message = message.trim();
    if message.is_empty() {
        return Err(ApiError::invalid_request("message must not be empty."));
    }
    Ok(message)
}

/// Charges one token for `token` and runs `work` if the bucket allows it.
/// The rate headers are attached to every outcome.
async fn rate_limited(
    limiter: &RateLimiter,
    token: &str,
    work: impl Future<Output = ApiResult>,
) -> ApiResult {
    let decision = limiter.check(token).await;
    let mut response = if decision.allowed {
        work.await.unwrap_or_else(IntoResponse::into_response)
    } else {
        ApiError::rate_limited().into_response()
    };
    decision.write_headers(response.headers_mut());
    Ok(response)
}
