//! Axum HTTP server for the relay
//!
//! Exposes the session, message, marker, setup and payload endpoints.

use super::store::RelayStore;
use super::{RelayError, MESSAGE_ID_HEADER};
use crate::config::RelayConfig;
use crate::types::{ErrorResponse, PartyId, RelayMessage};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
pub struct AppState {
    /// Relay state
    pub store: RelayStore,
}

impl AppState {
    pub fn new(store: RelayStore) -> Self {
        Self { store }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Create the router with all endpoints
pub fn create_router(state: Arc<AppState>, config: &RelayConfig) -> Router {
    // Any origin: browsers on other devices join through this relay
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ping", get(ping_handler))
        // Sessions
        .route(
            "/{session_id}",
            post(start_session_handler)
                .get(get_session_handler)
                .delete(delete_session_handler),
        )
        // Messages
        .route("/message/{session_id}", post(post_message_handler))
        .route("/message/{session_id}/{participant_id}", get(get_messages_handler))
        .route(
            "/message/{session_id}/{participant_id}/{hash}",
            delete(delete_message_handler),
        )
        // Round markers
        .route("/start/{session_id}", post(start_tss_handler).get(get_tss_start_handler))
        .route(
            "/complete/{session_id}",
            post(complete_tss_handler).get(get_tss_complete_handler),
        )
        .route(
            "/complete/{session_id}/keysign",
            post(set_keysign_finished_handler).get(get_keysign_finished_handler),
        )
        // Setup and payloads
        .route(
            "/setup-message/{session_id}",
            post(upload_setup_message_handler).get(get_setup_message_handler),
        )
        .route("/payload/{hash}", post(store_payload_handler).get(get_payload_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.body_limit_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Liveness check
async fn ping_handler() -> &'static str {
    "alive"
}

async fn start_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(parties): Json<Vec<PartyId>>,
) -> StatusCode {
    state.store.start_session(&session_id, &parties).await;
    tracing::debug!(session_id = %session_id, parties = ?parties, "Registered session parties");
    StatusCode::CREATED
}

async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<PartyId>>, ApiError> {
    state
        .store
        .get_session(&session_id)
        .await
        .map(Json)
        .ok_or_else(|| not_found("SESSION_NOT_FOUND", &session_id))
}

async fn delete_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> StatusCode {
    state.store.delete_session(&session_id).await;
    tracing::debug!(session_id = %session_id, "Deleted session");
    StatusCode::OK
}

async fn post_message_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(message): Json<RelayMessage>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .post_message(&session_id, message)
        .await
        .map(|_| StatusCode::ACCEPTED)
        .map_err(relay_error)
}

async fn get_messages_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, participant_id)): Path<(String, String)>,
) -> Json<Vec<RelayMessage>> {
    Json(state.store.get_messages(&session_id, &participant_id).await)
}

async fn delete_message_handler(
    State(state): State<Arc<AppState>>,
    Path((session_id, participant_id, hash)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    if state
        .store
        .delete_message(&session_id, &participant_id, &hash)
        .await
    {
        Ok(StatusCode::OK)
    } else {
        Err(not_found("INBOX_NOT_FOUND", &participant_id))
    }
}

async fn start_tss_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(parties): Json<Vec<PartyId>>,
) -> StatusCode {
    state.store.mark_tss_started(&session_id, &parties).await;
    tracing::debug!(session_id = %session_id, parties = ?parties, "Rounds started");
    StatusCode::OK
}

async fn get_tss_start_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<PartyId>>, ApiError> {
    state
        .store
        .get_tss_start(&session_id)
        .await
        .map(Json)
        .ok_or_else(|| not_found("NOT_STARTED", &session_id))
}

async fn complete_tss_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let parties: Vec<PartyId> = if body.is_empty() {
        Vec::new()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new("INVALID_BODY", format!("Invalid party list: {}", e))),
            )
        })?
    };
    state.store.mark_tss_complete(&session_id, &parties).await;
    Ok(StatusCode::OK)
}

async fn get_tss_complete_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<PartyId>>, ApiError> {
    state
        .store
        .get_tss_complete(&session_id)
        .await
        .map(Json)
        .ok_or_else(|| not_found("NOT_COMPLETE", &session_id))
}

async fn set_keysign_finished_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let message_id = message_id(&headers).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("MISSING_MESSAGE_ID", "message_id header is required")),
        )
    })?;
    state
        .store
        .set_keysign_finished(&session_id, &message_id, body.to_vec())
        .await;
    Ok(StatusCode::OK)
}

async fn get_keysign_finished_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let message_id = message_id(&headers).unwrap_or_default();
    state
        .store
        .get_keysign_finished(&session_id, &message_id)
        .await
        .map(json_bytes)
        .ok_or_else(|| not_found("KEYSIGN_NOT_FINISHED", &session_id))
}

async fn upload_setup_message_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let message_id = message_id(&headers);
    state
        .store
        .set_setup_message(&session_id, message_id.as_deref(), body.to_vec())
        .await;
    StatusCode::CREATED
}

async fn get_setup_message_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let message_id = message_id(&headers);
    state
        .store
        .get_setup_message(&session_id, message_id.as_deref())
        .await
        .map(json_bytes)
        .ok_or_else(|| not_found("SETUP_NOT_FOUND", &session_id))
}

async fn store_payload_handler(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .store_payload(&hash, body.to_vec())
        .await
        .map(|_| StatusCode::OK)
        .map_err(relay_error)
}

async fn get_payload_handler(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<Response, ApiError> {
    let payload = state
        .store
        .get_payload(&hash)
        .await
        .ok_or_else(|| not_found("PAYLOAD_NOT_FOUND", &hash))?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], payload).into_response())
}

fn message_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MESSAGE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Stored records are returned verbatim as JSON
fn json_bytes(body: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn not_found(code: &str, what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(code, format!("not found: {}", what))),
    )
}

/// Convert relay error to HTTP response
fn relay_error(err: RelayError) -> ApiError {
    let status = match &err {
        RelayError::InvalidMessage(_) => StatusCode::PRECONDITION_FAILED,
        RelayError::HashMismatch { .. } | RelayError::Decode(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut response = ErrorResponse::new(err.error_code(), err.to_string());
    if let RelayError::HashMismatch { actual, .. } = &err {
        response = response.with_details(actual.clone());
    }
    (status, Json(response))
}

/// A running relay bound to a local socket
///
/// Dropping the handle stops the server.
pub struct RelayServer {
    addr: SocketAddr,
    store: RelayStore,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<std::io::Result<()>>>,
}

impl RelayServer {
    /// Bind and start serving a fresh, empty relay
    pub async fn start(config: &RelayConfig) -> std::io::Result<Self> {
        Self::start_with_store(config, RelayStore::new()).await
    }

    pub async fn start_with_store(config: &RelayConfig, store: RelayStore) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.bind).await?;
        let addr = listener.local_addr()?;
        let app = create_router(Arc::new(AppState::new(store.clone())), config);
        let (tx, rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
        });

        tracing::info!(addr = %addr, "Relay listening");

        Ok(Self {
            addr,
            store,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL reachable from this host
    pub fn url(&self) -> String {
        let ip = match self.addr.ip() {
            ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ip => ip,
        };
        format!("http://{}", SocketAddr::new(ip, self.addr.port()))
    }

    pub fn store(&self) -> &RelayStore {
        &self.store
    }

    /// Stop accepting requests and wait for in-flight ones to drain
    pub async fn shutdown(mut self) -> std::io::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(result) => result?,
                Err(e) => tracing::warn!(error = %e, "Relay task ended abnormally"),
            }
        }
        tracing::info!(addr = %self.addr, "Relay stopped");
        Ok(())
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256_hex;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn create_test_app() -> Router {
        let state = Arc::new(AppState::new(RelayStore::new()));
        create_router(state, &RelayConfig::default())
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_ping_endpoint() {
        let app = create_test_app();

        let request = Request::builder().uri("/ping").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"alive");
    }

    #[tokio::test]
    async fn test_unknown_session_is_404() {
        let app = create_test_app();

        let request = Request::builder().uri("/nope").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_message_missing_from_is_precondition_failed() {
        let app = create_test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/message/sess1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"to":["B"],"body":"QmFzZTY0","hash":"abc"}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn test_payload_hash_mismatch() {
        let app = create_test_app();
        let payload = b"raw transaction bytes".to_vec();

        let bad = Request::builder()
            .method("POST")
            .uri(format!("/payload/{}", "ab".repeat(32)))
            .body(Body::from(payload.clone()))
            .unwrap();
        let response = app.clone().oneshot(bad).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let hash = sha256_hex(&payload);
        let good = Request::builder()
            .method("POST")
            .uri(format!("/payload/{}", hash))
            .body(Body::from(payload.clone()))
            .unwrap();
        let response = app.clone().oneshot(good).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let fetch = Request::builder()
            .uri(format!("/payload/{}", hash))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(fetch).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, payload);
    }

    #[tokio::test]
    async fn test_keysign_requires_message_id() {
        let app = create_test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/complete/sess1/keysign")
            .body(Body::from("\"sig\""))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .method("POST")
            .uri("/complete/sess1/keysign")
            .header(MESSAGE_ID_HEADER, "m1")
            .body(Body::from("\"sig\""))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .uri("/complete/sess1/keysign")
            .header(MESSAGE_ID_HEADER, "m1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"\"sig\"");
    }

    #[tokio::test]
    async fn test_setup_message_keyed_by_optional_id() {
        let app = create_test_app();

        let request = Request::builder()
            .method("POST")
            .uri("/setup-message/sess1")
            .header(MESSAGE_ID_HEADER, "digest")
            .body(Body::from("\"setup\""))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let without_id = Request::builder()
            .uri("/setup-message/sess1")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(without_id).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let with_id = Request::builder()
            .uri("/setup-message/sess1")
            .header(MESSAGE_ID_HEADER, "digest")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(with_id).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let server = RelayServer::start(&RelayConfig::default()).await.unwrap();
        assert!(server.url().starts_with("http://127.0.0.1:"));
        assert_ne!(server.local_addr().port(), 0);
        server.shutdown().await.unwrap();
    }
}
