//! REST endpoints + WebSocket event stream for the flag coordinator.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::BusEvent;
use crate::coordinator::FlagCoordinator;
use crate::error::{BusError, Error, FlagError};
use crate::flags::FlagType;

/// Default `wait` timeout when the query omits one.
const DEFAULT_WAIT_MS: u64 = 30_000;
/// Upper bound on a single `wait` request.
const MAX_WAIT_MS: u64 = 300_000;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<FlagCoordinator>,
}

/// Build the Axum router with flag REST routes and the event WebSocket.
pub fn flag_routes(coordinator: Arc<FlagCoordinator>) -> Router {
    let state = AppState { coordinator };

    Router::new()
        .route("/health", get(health))
        .route("/ws/events", get(ws_handler))
        .route("/api/flags", post(create_flag).get(list_pending))
        .route("/api/flags/{id}", get(get_flag))
        .route("/api/flags/{id}/claim", post(claim_flag))
        .route("/api/flags/{id}/complete", post(complete_flag))
        .route("/api/flags/{id}/fail", post(fail_flag))
        .route("/api/sessions/{id}/flags", get(session_flags))
        .route("/api/sessions/{id}/wait", get(wait_for_completion))
        .route("/api/stats", get(stats))
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

fn error_json(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.to_string() })),
    )
        .into_response()
}

fn error_response(err: &Error) -> Response {
    let status = match err {
        Error::Flag(FlagError::ClaimConflict { .. }) => StatusCode::CONFLICT,
        Error::Flag(FlagError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Flag(FlagError::UnknownType(_) | FlagError::UnknownStatus(_)) => {
            StatusCode::BAD_REQUEST
        }
        Error::Bus(BusError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        warn!(error = %err, "Request failed");
    }
    error_json(status, err)
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| error_json(StatusCode::BAD_REQUEST, "Invalid flag ID"))
}

fn parse_type(raw: &str) -> Result<FlagType, Response> {
    raw.parse::<FlagType>()
        .map_err(|e| error_response(&Error::Flag(e)))
}

/// Empty bodies deserialize to `T::default()`.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| error_json(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {e}")))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Response {
    if state.coordinator.bus().is_shut_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "shutting_down",
                "service": "action-flags"
            })),
        )
            .into_response();
    }

    Json(serde_json::json!({
        "status": "ok",
        "service": "action-flags"
    }))
    .into_response()
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("Event stream client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.coordinator))
}

/// Frames sent on the event stream.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamMessage {
    /// Sent once the stream is attached to the bus.
    Connected,
    Event(BusEvent),
    /// The client fell behind and `missed` events were dropped.
    Lagged { missed: u64 },
}

async fn send_frame(socket: &mut WebSocket, msg: &StreamMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize stream frame");
            true
        }
    }
}

/// Forward every bus event to the client as JSON until either side closes.
async fn handle_socket(mut socket: WebSocket, coordinator: Arc<FlagCoordinator>) {
    let mut rx = coordinator.bus().watch();
    info!("Event stream client connected");

    if !send_frame(&mut socket, &StreamMessage::Connected).await {
        warn!("Failed to send greeting, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_frame(&mut socket, &StreamMessage::Event(event)).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "Event stream client lagged behind bus");
                        if !send_frame(&mut socket, &StreamMessage::Lagged { missed: n }).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event bus closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Event stream client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    // Read-only stream
                    _ => {}
                }
            }
        }
    }

    info!("Event stream connection closed");
}

// ── Flags ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateFlagRequest {
    flag_type: String,
    session_id: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    priority: i64,
    ttl_secs: Option<u64>,
}

async fn create_flag(
    State(state): State<AppState>,
    Json(body): Json<CreateFlagRequest>,
) -> Response {
    let flag_type = match parse_type(&body.flag_type) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    if body.session_id.trim().is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "session_id must not be empty");
    }

    match state
        .coordinator
        .set_flag(
            flag_type,
            &body.session_id,
            body.data,
            body.priority,
            body.ttl_secs.map(Duration::from_secs),
        )
        .await
    {
        Ok(id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "flag_id": id, "status": "pending" })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct PendingQuery {
    flag_type: Option<String>,
}

async fn list_pending(State(state): State<AppState>, Query(query): Query<PendingQuery>) -> Response {
    let flag_type = match query.flag_type.as_deref().map(parse_type).transpose() {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match state.coordinator.pending_flags(flag_type).await {
        Ok(flags) => Json(flags).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn get_flag(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.coordinator.get_flag(id).await {
        Ok(Some(flag)) => Json(flag).into_response(),
        Ok(None) => error_response(&FlagError::NotFound { id }.into()),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct ClaimRequest {
    agent_id: String,
}

async fn claim_flag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ClaimRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match state.coordinator.claim(id, &body.agent_id).await {
        Ok(flag) => Json(flag).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize, Default)]
struct FinishRequest {
    agent_id: Option<String>,
    reason: Option<String>,
}

async fn complete_flag(State(state): State<AppState>, Path(id): Path<String>, body: Bytes) -> Response {
    let (id, body) = match (parse_id(&id), parse_body::<FinishRequest>(&body)) {
        (Ok(id), Ok(body)) => (id, body),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    let result = match body.agent_id.as_deref() {
        Some(agent) => state.coordinator.complete_flag_as(id, agent).await,
        None => state.coordinator.complete_flag(id).await,
    };
    finish_response(&state, id, result, "completed").await
}

async fn fail_flag(State(state): State<AppState>, Path(id): Path<String>, body: Bytes) -> Response {
    let (id, body) = match (parse_id(&id), parse_body::<FinishRequest>(&body)) {
        (Ok(id), Ok(body)) => (id, body),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    let result = match (body.reason.as_deref(), body.agent_id.as_deref()) {
        (Some(reason), agent) => {
            state
                .coordinator
                .fail_flag_with_reason(id, reason, agent)
                .await
        }
        (None, Some(agent)) => state.coordinator.fail_flag_as(id, agent).await,
        (None, None) => state.coordinator.fail_flag(id).await,
    };
    finish_response(&state, id, result, "failed").await
}

/// Turn a boolean finish result into 200, 404 or 409.
async fn finish_response(
    state: &AppState,
    id: Uuid,
    result: crate::error::Result<bool>,
    status: &str,
) -> Response {
    match result {
        Ok(true) => Json(serde_json::json!({ "flag_id": id, "status": status })).into_response(),
        Ok(false) => match state.coordinator.store().get_flag(id).await {
            Ok(Some(flag)) if flag.status.is_terminal() => error_json(
                StatusCode::CONFLICT,
                format!("Flag {id} is already {}", flag.status),
            ),
            Ok(Some(flag)) => error_json(
                StatusCode::CONFLICT,
                format!("Flag {id} is {} and cannot be marked {status}", flag.status),
            ),
            Ok(None) => error_response(&FlagError::NotFound { id }.into()),
            Err(e) => error_response(&e.into()),
        },
        Err(e) => error_response(&e),
    }
}

// ── Sessions ────────────────────────────────────────────────────────────

async fn session_flags(State(state): State<AppState>, Path(session_id): Path<String>) -> Response {
    match state.coordinator.session_flags(&session_id).await {
        Ok(flags) => Json(flags).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct WaitQuery {
    request_type: String,
    timeout_ms: Option<u64>,
}

async fn wait_for_completion(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Response {
    let request_type = match parse_type(&query.request_type) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let timeout_ms = query.timeout_ms.unwrap_or(DEFAULT_WAIT_MS).min(MAX_WAIT_MS);

    let completed = match state
        .coordinator
        .wait_for_completion(&session_id, request_type, Duration::from_millis(timeout_ms))
        .await
    {
        Ok(completed) => completed,
        Err(e) => return error_response(&e),
    };

    // Read the result straight from the store; it may have been written
    // behind the cache.
    let result = match request_type.completion_type() {
        Some(completion_type) if completed => {
            match state
                .coordinator
                .store()
                .list_session_flags(&session_id, Some(completion_type))
                .await
            {
                Ok(mut flags) => flags.pop(),
                Err(e) => return error_response(&e.into()),
            }
        }
        _ => None,
    };

    Json(serde_json::json!({
        "session_id": session_id,
        "completed": completed,
        "result": result,
    }))
    .into_response()
}

// ── Stats ───────────────────────────────────────────────────────────────

async fn stats(State(state): State<AppState>) -> Response {
    match state.coordinator.status_counts().await {
        Ok(counts) => Json(serde_json::json!({
            "total": counts.total(),
            "counts": counts,
            "subscribers": state.coordinator.bus().subscriber_count().await,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::bus::EventBus;
    use crate::config::CoordinatorConfig;
    use crate::store::{FlagStore, LibSqlBackend};

    async fn app() -> (Router, Arc<FlagCoordinator>) {
        let store: Arc<dyn FlagStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let coordinator = Arc::new(FlagCoordinator::new(
            store,
            EventBus::new(64),
            CoordinatorConfig {
                poll_interval: Duration::from_millis(50),
                ..CoordinatorConfig::default()
            },
        ));
        (flag_routes(coordinator.clone()), coordinator)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn create_and_fetch_flag() {
        let (app, _) = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/flags",
            Some(serde_json::json!({
                "flag_type": "request-report",
                "session_id": "s1",
                "data": {"format": "pdf"},
                "priority": 2
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["flag_id"].as_str().unwrap().to_string();

        let (status, flag) = send(&app, "GET", &format!("/api/flags/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(flag["flag_type"], "request-report");
        assert_eq!(flag["status"], "pending");
        assert_eq!(flag["data"]["format"], "pdf");
        assert_eq!(flag["priority"], 2);
    }

    #[tokio::test]
    async fn unknown_type_is_bad_request() {
        let (app, _) = app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/flags",
            Some(serde_json::json!({"flag_type": "make-coffee", "session_id": "s1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("make-coffee"));

        let (status, _) = send(&app, "GET", "/api/flags?flag_type=nope", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_and_malformed_ids() {
        let (app, _) = app().await;
        let (status, _) = send(&app, "GET", &format!("/api/flags/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/api/flags/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/flags/{}/claim", Uuid::new_v4()),
            Some(serde_json::json!({"agent_id": "a"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn claim_conflict_is_409() {
        let (app, coord) = app().await;
        let id = coord
            .set_flag(FlagType::Test, "s1", serde_json::json!({}), 0, None)
            .await
            .unwrap();

        let uri = format!("/api/flags/{id}/claim");
        let (status, flag) = send(&app, "POST", &uri, Some(serde_json::json!({"agent_id": "a"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(flag["status"], "in_progress");
        assert_eq!(flag["agent_assigned"], "a");

        let (status, _) = send(&app, "POST", &uri, Some(serde_json::json!({"agent_id": "b"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn complete_and_fail_endpoints() {
        let (app, coord) = app().await;
        let done = coord
            .set_flag(FlagType::Test, "s1", serde_json::json!({}), 0, None)
            .await
            .unwrap();
        let broken = coord
            .set_flag(FlagType::Test, "s1", serde_json::json!({}), 0, None)
            .await
            .unwrap();

        // Not claimed yet
        let (status, _) = send(&app, "POST", &format!("/api/flags/{done}/complete"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        assert!(coord.claim_flag(done, "a").await.unwrap());
        assert!(coord.claim_flag(broken, "a").await.unwrap());

        let (status, body) = send(&app, "POST", &format!("/api/flags/{done}/complete"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");

        let (status, body) = send(&app, "POST", &format!("/api/flags/{done}/fail"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already completed"));

        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/flags/{broken}/fail"),
            Some(serde_json::json!({"agent_id": "someone-else", "reason": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/flags/{broken}/fail"),
            Some(serde_json::json!({"agent_id": "a", "reason": "timeout talking to model"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, flag) = send(&app, "GET", &format!("/api/flags/{broken}"), None).await;
        assert_eq!(flag["status"], "failed");
        assert_eq!(flag["metadata"]["failure_reason"], "timeout talking to model");

        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/flags/{}/complete", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pending_list_is_filtered_and_ordered() {
        let (app, coord) = app().await;
        coord
            .set_flag(FlagType::RequestReport, "s1", serde_json::json!({}), 1, None)
            .await
            .unwrap();
        let urgent = coord
            .set_flag(FlagType::RequestReport, "s2", serde_json::json!({}), 9, None)
            .await
            .unwrap();
        coord
            .set_flag(FlagType::RequestPrediction, "s3", serde_json::json!({}), 5, None)
            .await
            .unwrap();

        let (status, flags) = send(&app, "GET", "/api/flags?flag_type=request-report", None).await;
        assert_eq!(status, StatusCode::OK);
        let flags = flags.as_array().unwrap();
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[0]["id"], urgent.to_string());

        let (_, all) = send(&app, "GET", "/api/flags", None).await;
        assert_eq!(all.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn wait_endpoint_returns_result() {
        let (app, coord) = app().await;
        coord
            .set_flag(
                FlagType::PredictionComplete,
                "s1",
                serde_json::json!({"prediction": "allergy"}),
                0,
                None,
            )
            .await
            .unwrap();

        let (status, body) = send(
            &app,
            "GET",
            "/api/sessions/s1/wait?request_type=request-prediction&timeout_ms=100",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["completed"], true);
        assert_eq!(body["result"]["data"]["prediction"], "allergy");

        let (_, body) = send(
            &app,
            "GET",
            "/api/sessions/s2/wait?request_type=request-report&timeout_ms=100",
            None,
        )
        .await;
        assert_eq!(body["completed"], false);
        assert!(body["result"].is_null());
    }

    #[tokio::test]
    async fn session_flags_and_stats() {
        let (app, coord) = app().await;
        coord
            .set_flag(FlagType::RequestReport, "s1", serde_json::json!({}), 0, None)
            .await
            .unwrap();
        coord
            .set_flag(FlagType::VoiceOutput, "s1", serde_json::json!({"text": "hi"}), 0, None)
            .await
            .unwrap();

        let (status, flags) = send(&app, "GET", "/api/sessions/s1/flags", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(flags.as_array().unwrap().len(), 2);

        let (status, stats) = send(&app, "GET", "/api/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total"], 2);
        assert_eq!(stats["counts"]["pending"], 2);
    }

    #[tokio::test]
    async fn health_reports_ok_until_bus_shutdown() {
        let (app, coord) = app().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        coord.bus().shutdown().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "shutting_down");
    }
}
