//! axum HTTP/WebSocket routes (§6): `/stream`, `/ingest`, `/healthz`. The
//! only bit-exact wire surface this crate owns — everything else (how a
//! session gets prepared or started) belongs to the edge service that
//! embeds this workspace as a library (§1, out of scope).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use agent_session_authority::SessionAuthority;
use agent_session_types::{ExecutionId, SessionId, WrapperEvent};

use crate::session_manager::SessionManager;
use crate::ticket::{TicketError, TicketSigner};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub ticket_signer: Arc<TicketSigner>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stream", get(stream_handler))
        .route("/ingest", get(ingest_handler))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    // §3.31 config note: an empty allow-list means no origin is allowed, not
    // "skip the check" — a misconfigured deployment fails closed.
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    allowed.iter().any(|candidate| candidate == origin)
}

#[derive(Deserialize)]
struct StreamParams {
    #[serde(rename = "cloudAgentSessionId")]
    cloud_agent_session_id: Option<String>,
    ticket: Option<String>,
}

/// `GET /stream?cloudAgentSessionId=<id>&ticket=<token>` (§6): read-only
/// push to clients. Replies `403`/`401`/`400` per the subflow in §6, or
/// upgrades and starts replaying the session's event buffer.
async fn stream_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let Some(session_id) = params.cloud_agent_session_id else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(ticket) = params.ticket else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if !origin_allowed(&headers, &state.manager.config().allowed_origins) {
        return StatusCode::FORBIDDEN.into_response();
    }

    if let Err(err) = state.ticket_signer.verify(&ticket, &session_id, Utc::now()) {
        return match err {
            TicketError::SessionMismatch => StatusCode::BAD_REQUEST.into_response(),
            TicketError::Malformed | TicketError::BadSignature | TicketError::Expired => StatusCode::UNAUTHORIZED.into_response(),
        };
    }

    let session_id = SessionId::from(session_id);
    let authority = match state.manager.get_or_create(&session_id).await {
        Ok(authority) => (*authority).clone(),
        Err(err) => {
            tracing::error!(component = "server", event = "stream.open_failed", session_id = %session_id, error = %err, "failed to open session store");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    ws.on_upgrade(move |socket| stream_session(socket, authority))
}

/// Replays the persisted buffer in `id` order, then forwards newly broadcast
/// events until the client disconnects. Inbound frames are read only to
/// detect disconnects — `/stream` clients are not expected to send anything
/// (§4.7 "Stream connections ignore inbound frames").
async fn stream_session(mut socket: WebSocket, authority: SessionAuthority) {
    let replay = match authority.events().replay_session(0).await {
        Ok(events) => events,
        Err(err) => {
            tracing::error!(component = "server", event = "stream.replay_failed", session_id = %authority.session_id(), error = %err, "failed to replay event buffer");
            Vec::new()
        }
    };
    for event in replay {
        let Ok(json) = serde_json::to_string(&event) else { continue };
        if socket.send(Message::Text(json)).await.is_err() {
            return;
        }
    }

    let mut subscriber = authority.events().subscribe();
    loop {
        tokio::select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => continue,
                }
            }
            broadcast = subscriber.recv() => {
                match broadcast {
                    Ok(event) => {
                        let Ok(json) = serde_json::to_string(&event) else { continue };
                        if socket.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(component = "server", event = "stream.lagged", session_id = %authority.session_id(), missed, "stream client fell behind broadcast buffer");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct IngestParams {
    #[serde(rename = "executionId")]
    execution_id: String,
    token: String,
}

/// `GET /ingest?executionId=<id>&token=<ingestToken>` (§6): wrapper-only.
/// The execution's session is recovered from the dispatch worker's
/// execution→session index since the wire carries no `sessionId` here.
async fn ingest_handler(ws: WebSocketUpgrade, Query(params): Query<IngestParams>, State(state): State<AppState>) -> Response {
    let execution_id = ExecutionId::from(params.execution_id);
    let Some(session_id) = state.manager.session_for_execution(&execution_id).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let authority = match state.manager.get_or_create(&session_id).await {
        Ok(authority) => authority,
        Err(err) => {
            tracing::error!(component = "server", event = "ingest.open_failed", session_id = %session_id, error = %err, "failed to open session store");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let execution = match authority.get_execution(execution_id.clone()).await {
        Ok(Some(execution)) => execution,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            tracing::error!(component = "server", event = "ingest.lookup_failed", execution_id = %execution_id, error = %err, "failed to look up execution");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if execution.ingest_token != params.token {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let authority = (*authority).clone();
    ws.on_upgrade(move |socket| ingest_session(socket, authority, execution_id))
}

/// Single writer: the wrapper process (§4.7). Tags the socket with
/// `ingest:<executionId>` by registering it in the wrapper command channel,
/// relays `Authority -> wrapper` commands out, and applies the side effects
/// of each inbound frame.
async fn ingest_session(socket: WebSocket, authority: SessionAuthority, execution_id: ExecutionId) {
    let (mut sink, mut stream) = socket.split();
    let (command_tx, mut command_rx) = tokio::sync::mpsc::channel(16);
    authority.wrapper_channels().register(execution_id.clone(), command_tx);

    let mut outbound = tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            let Ok(json) = serde_json::to_string(&command) else { continue };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        match serde_json::from_str::<WrapperEvent>(&text) {
            Ok(event) => handle_wrapper_event(&authority, &execution_id, event).await,
            Err(err) => {
                tracing::warn!(component = "server", event = "ingest.malformed_frame", execution_id = %execution_id, error = %err, "dropped malformed ingest frame");
            }
        }
    }

    authority.wrapper_channels().unregister(&execution_id);
    outbound.abort();
}

/// Persists and broadcasts the frame, then applies the side effects §4.7
/// lists: kilo session id capture + backend link, heartbeat refresh, branch
/// updates, and terminal-status completion.
async fn handle_wrapper_event(authority: &SessionAuthority, execution_id: &ExecutionId, event: WrapperEvent) {
    let now = Utc::now();

    if let Err(err) = authority
        .events()
        .append(authority.session_id().clone(), execution_id.clone(), event.stream_event_type.clone(), event.payload.clone(), now)
        .await
    {
        tracing::error!(component = "server", event = "ingest.persist_failed", execution_id = %execution_id, error = %err, "failed to persist wrapper event");
    }

    // Any inbound frame counts as liveness, not only explicit `heartbeat`
    // events — the reaper's staleness check (§4.6) only cares that *something*
    // arrived recently.
    authority.update_heartbeat(execution_id.clone(), now).await.ok();

    if let Some(kilo_session_id) = event.kilocode_session_id() {
        if let Err(err) = authority.update_kilo_session_id(kilo_session_id.to_string(), now).await {
            tracing::error!(component = "server", event = "ingest.kilo_session_update_failed", execution_id = %execution_id, error = %err, "failed to record kilo session id");
        }
        let link_authority = authority.clone();
        let kilo_session_id = kilo_session_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = link_authority.link_cloud_agent(&kilo_session_id).await {
                tracing::warn!(component = "server", event = "ingest.backend_link_failed", kilo_session_id = %kilo_session_id, error = %err, "backend link call failed (non-fatal)");
            }
        });
    }

    if event.stream_event_type == "branch" {
        if let Some(branch) = event.payload.get("branch").and_then(|v| v.as_str()) {
            authority.update_upstream_branch(branch.to_string(), now).await.ok();
        }
    }

    if let Some(status) = event.terminal_status() {
        let error = event.kilocode_error().map(str::to_string);
        if let Err(err) = authority.on_execution_complete(execution_id.clone(), status, error, now).await {
            tracing::error!(component = "server", event = "ingest.completion_failed", execution_id = %execution_id, error = %err, "failed to apply terminal status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app_state() -> AppState {
        let mut config = crate::config::ServerConfig::from_env();
        config.data_dir = std::env::temp_dir().join(format!("agent-session-server-routes-test-{}", uuid::Uuid::new_v4()));
        AppState {
            manager: Arc::new(SessionManager::new(config)),
            ticket_signer: Arc::new(TicketSigner::new(b"test-signing-key".to_vec())),
        }
    }

    #[test]
    fn origin_allowed_fails_closed_on_empty_allow_list() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, "https://example.com".parse().unwrap());
        assert!(!origin_allowed(&headers, &[]));
    }

    #[test]
    fn origin_allowed_matches_configured_origin() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, "https://example.com".parse().unwrap());
        assert!(origin_allowed(&headers, &["https://example.com".to_string()]));
        assert!(!origin_allowed(&headers, &["https://other.com".to_string()]));
    }

    #[test]
    fn origin_allowed_rejects_missing_origin_header() {
        assert!(!origin_allowed(&HeaderMap::new(), &["https://example.com".to_string()]));
    }

    #[tokio::test]
    async fn healthz_reports_ok_and_cargo_version() {
        let app = router(app_state());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn stream_without_websocket_upgrade_headers_is_rejected() {
        let app = router(app_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/stream?cloudAgentSessionId=s1&ticket=bogus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn ingest_for_unknown_execution_is_not_found() {
        let app = router(app_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/ingest?executionId=ghost&token=tok")
                    .header(header::CONNECTION, "upgrade")
                    .header(header::UPGRADE, "websocket")
                    .header("sec-websocket-version", "13")
                    .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
