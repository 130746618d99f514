//! HTTP host: many browser sessions over one or more corpora.
//!
//! Answers are streamed back as server-sent events, one `partial` event
//! per fragment carrying the running text, followed by exactly one of
//! `done`, `ignored`, `discarded` or `error`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::engine::QueryEngine;
use crate::error::ChatError;
use crate::registry::SessionRegistry;
use crate::session::{ChatSession, Message, SessionState, SubmitOutcome};

/// Engines keyed by corpus name. A corpus whose initialization failed
/// keeps its error so new sessions start out blocked.
pub type EngineTable = HashMap<String, Result<Arc<dyn QueryEngine>, ChatError>>;

#[derive(Clone)]
pub struct AppState {
    sessions: SessionRegistry,
    engines: Arc<EngineTable>,
}

impl AppState {
    pub fn new(engines: EngineTable) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            engines: Arc::new(engines),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    fn session(&self, id: &Uuid) -> Result<Arc<ChatSession>, ApiError> {
        self.sessions
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("session {id}")))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/corpora", get(list_corpora))
        .route("/api/corpora/{corpus}/sessions", post(create_session))
        .route("/api/sessions/{id}", get(session_info).delete(close_session))
        .route("/api/sessions/{id}/messages", get(messages).post(submit))
        .route("/api/sessions/{id}/reset", post(reset))
        .with_state(state)
}

/// Serve until the listener fails. Sessions untouched for `session_ttl`
/// are evicted in the background.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    session_ttl: Duration,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("listening on http://{}", listener.local_addr()?);
    let sweep = state.sessions.spawn_idle_sweep(session_ttl);
    let result = axum::serve(listener, router(state)).await;
    sweep.abort();
    result
}

enum ApiError {
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not_found", "message": format!("{what} not found") })),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub state: SessionState,
    pub messages: usize,
    /// Initialization error of a blocked session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionInfo {
    fn of(session: &ChatSession) -> Self {
        Self {
            id: session.id(),
            state: session.state(),
            messages: session.message_count(),
            error: session.init_error().map(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatEvent {
    Partial { text: String },
    Done { message: Message },
    Ignored,
    Discarded { message: Message },
    Error { kind: &'static str, message: String },
}

impl ChatEvent {
    fn name(&self) -> &'static str {
        match self {
            ChatEvent::Partial { .. } => "partial",
            ChatEvent::Done { .. } => "done",
            ChatEvent::Ignored => "ignored",
            ChatEvent::Discarded { .. } => "discarded",
            ChatEvent::Error { .. } => "error",
        }
    }

    fn into_sse(self) -> Event {
        let data = serde_json::to_string(&self).unwrap_or_else(|_| "{}".to_string());
        Event::default().event(self.name()).data(data)
    }
}

impl From<Result<SubmitOutcome, ChatError>> for ChatEvent {
    fn from(result: Result<SubmitOutcome, ChatError>) -> Self {
        match result {
            Ok(SubmitOutcome::Answered(message)) => ChatEvent::Done { message },
            Ok(SubmitOutcome::Ignored) => ChatEvent::Ignored,
            Ok(SubmitOutcome::Discarded(message)) => ChatEvent::Discarded { message },
            Err(e) => ChatEvent::Error {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

async fn list_corpora(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut corpora: Vec<_> = state
        .engines
        .iter()
        .map(|(name, engine)| {
            json!({
                "name": name,
                "ready": engine.is_ok(),
                "error": engine.as_ref().err().map(ToString::to_string),
            })
        })
        .collect();
    corpora.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Json(json!({ "corpora": corpora }))
}

async fn create_session(
    State(state): State<AppState>,
    Path(corpus): Path<String>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    let engine = state
        .engines
        .get(&corpus)
        .ok_or_else(|| ApiError::NotFound(format!("corpus {corpus}")))?;

    let session = state.sessions.create();
    match engine {
        Ok(engine) => session.bind_engine(Arc::clone(engine)),
        Err(e) => session.block(e.clone()),
    }
    log::info!("session {} opened on corpus {corpus}", session.id());
    Ok((StatusCode::CREATED, Json(SessionInfo::of(&session))))
}

async fn session_info(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionInfo>, ApiError> {
    let session = state.session(&id)?;
    Ok(Json(SessionInfo::of(&session)))
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .sessions
        .remove(&id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))
}

async fn messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, ApiError> {
    Ok(Json(state.session(&id)?.messages()))
}

async fn reset(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.session(&id)?.reset();
    Ok(StatusCode::NO_CONTENT)
}

async fn submit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SubmitRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = state.session(&id)?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let progress = tx.clone();
        let result = session
            .submit_with(&request.text, |p| {
                // A closed receiver means the client went away; generation
                // still runs to completion so the transcript stays whole.
                let _ = progress.send(ChatEvent::Partial {
                    text: p.text.to_string(),
                });
            })
            .await;
        let _ = tx.send(ChatEvent::from(result));
    });

    let events = UnboundedReceiverStream::new(rx).map(|event| Ok(event.into_sse()));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::ScriptedEngine;
    use crate::session::Role;
    use axum_test::TestServer;

    fn test_server() -> TestServer {
        let laboral: Arc<dyn QueryEngine> =
            Arc::new(ScriptedEngine::answering(&["Hola", ", ", "mundo"]));
        let mut engines: EngineTable = HashMap::new();
        engines.insert("laboral".to_string(), Ok(laboral));
        engines.insert(
            "familiar".to_string(),
            Err(ChatError::CorpusLoad("no .pdf files in /data/familiar".into())),
        );
        TestServer::new(router(AppState::new(engines))).unwrap()
    }

    async fn open(server: &TestServer, corpus: &str) -> SessionInfo {
        let response = server.post(&format!("/api/corpora/{corpus}/sessions")).await;
        response.assert_status(StatusCode::CREATED);
        response.json::<SessionInfo>()
    }

    #[tokio::test]
    async fn test_chat_round_trip() {
        let server = test_server();
        let session = open(&server, "laboral").await;
        assert_eq!(session.state, SessionState::Idle);

        let body = server
            .post(&format!("/api/sessions/{}/messages", session.id))
            .json(&json!({ "text": "saludo" }))
            .await
            .text();

        assert!(body.contains("event: partial"));
        assert!(body.contains(r#""text":"Hola, ""#));
        assert!(body.contains("event: done"));

        let transcript = server
            .get(&format!("/api/sessions/{}/messages", session.id))
            .await
            .json::<Vec<Message>>();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role(), Role::User);
        assert_eq!(transcript[1].content(), "Hola, mundo");
    }

    #[tokio::test]
    async fn test_blank_message_is_ignored() {
        let server = test_server();
        let session = open(&server, "laboral").await;

        let body = server
            .post(&format!("/api/sessions/{}/messages", session.id))
            .json(&json!({ "text": "  " }))
            .await
            .text();

        assert!(body.contains("event: ignored"));
        assert!(!body.contains("event: partial"));
    }

    #[tokio::test]
    async fn test_reset_empties_transcript() {
        let server = test_server();
        let session = open(&server, "laboral").await;
        server
            .post(&format!("/api/sessions/{}/messages", session.id))
            .json(&json!({ "text": "saludo" }))
            .await;

        server
            .post(&format!("/api/sessions/{}/reset", session.id))
            .await
            .assert_status(StatusCode::NO_CONTENT);

        let info = server
            .get(&format!("/api/sessions/{}", session.id))
            .await
            .json::<SessionInfo>();
        assert_eq!(info.id, session.id);
        assert_eq!(info.messages, 0);
    }

    #[tokio::test]
    async fn test_blocked_corpus_rejects_input() {
        let server = test_server();
        let session = open(&server, "familiar").await;
        assert_eq!(session.state, SessionState::Blocked);
        assert!(session.error.unwrap().contains("no .pdf files"));

        let info = server
            .get(&format!("/api/sessions/{}", session.id))
            .await
            .json::<SessionInfo>();
        assert_eq!(info.state, SessionState::Blocked);
        assert!(info.error.unwrap().contains("no .pdf files"));

        let body = server
            .post(&format!("/api/sessions/{}/messages", session.id))
            .json(&json!({ "text": "hola" }))
            .await
            .text();

        assert!(body.contains("event: error"));
        assert!(body.contains("corpus_load"));
        let transcript = server
            .get(&format!("/api/sessions/{}/messages", session.id))
            .await
            .json::<Vec<Message>>();
        assert!(transcript.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let server = test_server();

        server
            .post("/api/corpora/penal/sessions")
            .expect_failure()
            .await
            .assert_status_not_found();
        server
            .get(&format!("/api/sessions/{}/messages", Uuid::new_v4()))
            .expect_failure()
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn test_close_session() {
        let server = test_server();
        let session = open(&server, "laboral").await;

        server
            .delete(&format!("/api/sessions/{}", session.id))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server
            .delete(&format!("/api/sessions/{}", session.id))
            .expect_failure()
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn test_list_corpora() {
        let server = test_server();

        let body = server.get("/api/corpora").await.json::<serde_json::Value>();

        assert_eq!(body["corpora"][0]["name"], "familiar");
        assert_eq!(body["corpora"][0]["ready"], false);
        assert_eq!(body["corpora"][1]["name"], "laboral");
        assert_eq!(body["corpora"][1]["ready"], true);
    }
}
