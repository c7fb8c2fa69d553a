//! HTTP and WebSocket surface.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::notify::Notifier;
use crate::registry::{Registry, StartRequest};
use crate::session::Session;
use crate::store::{Project, ProjectStore};
use crate::subscriber::WsSubscriber;

pub struct AppState {
    pub registry: Registry,
    pub notifier: Notifier,
    pub projects: Arc<dyn ProjectStore>,
}

impl AppState {
    pub fn new(registry: Registry, notifier: Notifier, projects: Arc<dyn ProjectStore>) -> Self {
        Self {
            registry,
            notifier,
            projects,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions).post(start_session))
        .route(
            "/sessions/:session_id",
            get(get_session).delete(stop_session),
        )
        .route("/sessions/:session_id/input", post(send_input))
        .route("/sessions/:session_id/resize", post(resize_session))
        .route("/sessions/:session_id/ws", get(attach_session))
        .route("/projects", get(list_projects))
        .route("/notifications", get(list_notifications))
        .route("/focus", put(set_focus))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OkBody {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

impl OkBody {
    fn ok() -> Json<Self> {
        Json(Self {
            ok: true,
            session_id: None,
        })
    }

    fn with_session(session_id: String) -> Json<Self> {
        Json(Self {
            ok: true,
            session_id: Some(session_id),
        })
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.registry.list().len()
    }))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "sessions": state.registry.list()
    }))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> SessionResult<impl IntoResponse> {
    let session = state
        .registry
        .get(&session_id)
        .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
    Ok(Json(session.info()))
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> SessionResult<impl IntoResponse> {
    info!(
        "[http] POST /sessions - id={}, cwd={}, command={}",
        request.session_id,
        request.working_directory.display(),
        request.command
    );

    let project = Project::from_request(&request);
    let session = state.registry.start(request).await?;

    if let Err(e) = state.projects.upsert(project).await {
        warn!("[http] Failed to save project metadata: {:#}", e);
    }

    Ok(OkBody::with_session(session.id().to_string()))
}

async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> SessionResult<impl IntoResponse> {
    info!("[http] DELETE /sessions/{}", session_id);
    state.registry.stop(&session_id).await?;
    Ok(OkBody::ok())
}

#[derive(Debug, Clone, Deserialize)]
struct InputRequest {
    data: String,
}

async fn send_input(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<InputRequest>,
) -> SessionResult<impl IntoResponse> {
    state.registry.input(&session_id, request.data.as_bytes())?;
    Ok(OkBody::ok())
}

#[derive(Debug, Clone, Deserialize)]
struct ResizeRequest {
    cols: u16,
    rows: u16,
}

async fn resize_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<ResizeRequest>,
) -> SessionResult<impl IntoResponse> {
    state
        .registry
        .resize(&session_id, request.cols, request.rows)?;
    Ok(OkBody::ok())
}

async fn list_projects(State(state): State<Arc<AppState>>) -> SessionResult<impl IntoResponse> {
    let projects = state.projects.load().await.map_err(|e| {
        warn!("[http] Failed to load projects: {:#}", e);
        SessionError::Io(std::io::Error::other(e.to_string()))
    })?;
    Ok(Json(serde_json::json!({ "projects": projects })))
}

async fn list_notifications(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "notifications": state.notifier.list().await
    }))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FocusRequest {
    session_id: Option<String>,
}

async fn set_focus(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FocusRequest>,
) -> impl IntoResponse {
    state.notifier.set_focus(request.session_id).await;
    Json(OkBody {
        ok: true,
        session_id: state.notifier.focused().await,
    })
}

// =============================================================================
// WebSocket attach
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct AttachQuery {
    /// Last output seq the client already has.
    since: Option<u64>,
}

/// Control frames a client may send instead of raw input.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlMsg {
    Resize { cols: u16, rows: u16 },
    Input { data: String },
}

async fn attach_session(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<AttachQuery>,
    State(state): State<Arc<AppState>>,
) -> SessionResult<impl IntoResponse> {
    let session = state
        .registry
        .get(&session_id)
        .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
    let capacity = state.registry.config().subscriber.queue_capacity;

    Ok(ws.on_upgrade(move |socket| handle_attach_socket(socket, session, query.since, capacity)))
}

fn write_input(session: &Session, data: &[u8]) {
    if let Err(e) = session.input(data) {
        warn!("[term-ws:{}] Input dropped: {}", session.id(), e);
    }
}

async fn handle_attach_socket(
    socket: WebSocket,
    session: Arc<Session>,
    since: Option<u64>,
    capacity: usize,
) {
    let (sender, mut receiver) = socket.split();
    let session_id = session.id().to_string();

    let (subscriber, mut forwarder) =
        WsSubscriber::spawn(sender, capacity, format!("term-ws:{}", session_id));
    let subscriber_id = session.attach(subscriber, since);
    info!(
        "[term-ws:{}] Attached subscriber {} (since: {:?})",
        session_id, subscriber_id, since
    );

    let mut input_count = 0usize;
    let mut input_bytes = 0usize;

    loop {
        tokio::select! {
            _ = &mut forwarder => {
                debug!("[term-ws:{}] Forwarder ended", session_id);
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Binary(data)) => {
                        input_count += 1;
                        input_bytes += data.len();
                        write_input(&session, &data);
                    }
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ControlMsg>(&text) {
                            Ok(ControlMsg::Resize { cols, rows }) => {
                                info!("[term-ws:{}] Resize: {}x{}", session_id, cols, rows);
                                if let Err(e) = session.resize(cols, rows) {
                                    warn!("[term-ws:{}] Failed to resize: {}", session_id, e);
                                }
                            }
                            Ok(ControlMsg::Input { data }) => {
                                input_count += 1;
                                input_bytes += data.len();
                                write_input(&session, data.as_bytes());
                            }
                            // Raw text input from the terminal
                            Err(_) => {
                                input_count += 1;
                                input_bytes += text.len();
                                write_input(&session, text.as_bytes());
                            }
                        }
                    }
                    Ok(Message::Close(reason)) => {
                        info!("[term-ws:{}] Client sent close frame: {:?}", session_id, reason);
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                    Err(e) => {
                        warn!("[term-ws:{}] WebSocket receive error: {}", session_id, e);
                        break;
                    }
                }
            }
        }
    }

    session.detach(subscriber_id);
    info!(
        "[term-ws:{}] Disconnected. Total input: {} messages, {} bytes",
        session_id, input_count, input_bytes
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryProjectStore;
    use crate::testing::FakeSpawner;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn create_test_app(spawner: &FakeSpawner) -> (Router, Arc<AppState>) {
        let registry = Registry::new(Config::default(), Arc::new(spawner.clone()));
        let state = Arc::new(AppState::new(
            registry,
            Notifier::new(),
            Arc::new(MemoryProjectStore::default()),
        ));
        (build_router(state.clone()), state)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn start_body(id: &str) -> serde_json::Value {
        serde_json::json!({
            "sessionId": id,
            "workingDirectory": std::env::temp_dir(),
            "command": "assistant",
            "displayName": "Project One",
            "bypassPermissions": false
        })
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _) = create_test_app(&FakeSpawner::new());
        let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["sessions"], 0);
    }

    #[tokio::test]
    async fn test_start_input_stop_round() {
        let spawner = FakeSpawner::new();
        let (app, state) = create_test_app(&spawner);

        let response = app
            .clone()
            .oneshot(json_request("POST", "/sessions", start_body("p1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "ok": true, "sessionId": "p1" })
        );

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/sessions/p1/input",
                serde_json::json!({ "data": "hello\n" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(spawner.process("p1#1").written(), b"hello\n");

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", "/sessions/p1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/sessions/p1/input",
                serde_json::json!({ "data": "x" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "ok": false, "error": "not found" })
        );

        let projects = state.projects.load().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].display_name, "Project One");
    }

    #[tokio::test]
    async fn test_stop_unknown_session() {
        let (app, _) = create_test_app(&FakeSpawner::new());
        let response = app
            .oneshot(empty_request("DELETE", "/sessions/nonexistent-id"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "not found");
    }

    #[tokio::test]
    async fn test_spawn_error_surfaces_message() {
        let spawner = FakeSpawner::new();
        spawner.fail_next("working directory does not exist: /nope");
        let (app, state) = create_test_app(&spawner);

        let response = app
            .oneshot(json_request("POST", "/sessions", start_body("p1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("working directory does not exist"));
        assert!(state.registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_resize_validation() {
        let spawner = FakeSpawner::new();
        let (app, _) = create_test_app(&spawner);
        app.clone()
            .oneshot(json_request("POST", "/sessions", start_body("p1")))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/sessions/p1/resize",
                serde_json::json!({ "cols": 0, "rows": 40 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_request(
                "POST",
                "/sessions/p1/resize",
                serde_json::json!({ "cols": 132, "rows": 40 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(spawner.process("p1#1").size(), Some((132, 40)));
    }

    #[tokio::test]
    async fn test_focus_round_trip() {
        let (app, state) = create_test_app(&FakeSpawner::new());
        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/focus",
                serde_json::json!({ "sessionId": "p1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.notifier.focused().await.as_deref(), Some("p1"));

        let response = app
            .oneshot(empty_request("GET", "/notifications"))
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "notifications": [] })
        );
    }

    #[test]
    fn control_messages_parse() {
        let resize: ControlMsg =
            serde_json::from_str(r#"{"type":"resize","cols":100,"rows":30}"#).unwrap();
        assert!(matches!(resize, ControlMsg::Resize { cols: 100, rows: 30 }));
        assert!(serde_json::from_str::<ControlMsg>("ls -la\r").is_err());
    }
}
