use std::{
    collections::{HashMap, HashSet},
    env,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex};
use tower_http::cors::CorsLayer;

use crate::registry::SessionRegistry;
use crate::store::{ChatStore, PgStore};
use crate::thread::{end_session, send_checked, ThreadNotice};
use crate::types::{ChangeEvent, ChatError, ChatMessage, NewFormSubmission, NewVisit, Sender};
use crate::widget::{SessionContext, VisitorWidget};

#[derive(Default)]
struct RealtimeState {
    clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    agents: HashSet<usize>,
    session_watchers: HashMap<String, HashSet<usize>>,
    watched_session: HashMap<usize, String>,
}

pub struct AppState {
    store: Arc<dyn ChatStore>,
    registry: Mutex<SessionRegistry>,
    realtime: Mutex<RealtimeState>,
    next_client_id: AtomicUsize,
}

impl AppState {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        AppState {
            registry: Mutex::new(SessionRegistry::new(store.clone())),
            store,
            realtime: Mutex::new(RealtimeState::default()),
            next_client_id: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    sender: Option<String>,
    text: String,
}

#[derive(Debug, Deserialize)]
struct EventEnvelopeIn {
    event: String,
    #[serde(default)]
    data: Value,
}

fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

async fn emit_to_client<T: Serialize>(
    state: &Arc<AppState>,
    client_id: usize,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };
    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };
    if let Some(sender) = tx {
        let _ = sender.send(payload);
    }
}

async fn emit_to_clients<T: Serialize>(
    state: &Arc<AppState>,
    client_ids: &[usize],
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };
    let senders = {
        let rt = state.realtime.lock().await;
        client_ids
            .iter()
            .filter_map(|id| rt.clients.get(id).cloned())
            .collect::<Vec<_>>()
    };
    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

async fn session_watcher_ids(state: &Arc<AppState>, session_id: &str) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    rt.session_watchers
        .get(session_id)
        .map(|ids| ids.iter().copied().collect())
        .unwrap_or_default()
}

async fn agent_client_ids(state: &Arc<AppState>) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    rt.agents.iter().copied().collect()
}

/// Single fan-out point for the store's change feed: message inserts go to
/// the session's watchers and every agent console; metadata changes also
/// fold into the shared registry so the session list stays current without
/// a refetch.
async fn route_change_events(state: Arc<AppState>) {
    let mut rx = state.store.subscribe();
    loop {
        match rx.recv().await {
            Ok(ChangeEvent::MessageInserted(message)) => {
                let mut targets = session_watcher_ids(&state, &message.session_id).await;
                for id in agent_client_ids(&state).await {
                    if !targets.contains(&id) {
                        targets.push(id);
                    }
                }
                emit_to_clients(&state, &targets, "message:new", &message).await;
            }
            Ok(ChangeEvent::SessionUpserted(meta)) => {
                {
                    let mut registry = state.registry.lock().await;
                    registry.apply_event(&ChangeEvent::SessionUpserted(meta.clone()));
                }
                let mut targets = session_watcher_ids(&state, &meta.session_id).await;
                for id in agent_client_ids(&state).await {
                    if !targets.contains(&id) {
                        targets.push(id);
                    }
                }
                emit_to_clients(&state, &targets, "session:updated", &meta).await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "change feed lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn get_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut registry = state.registry.lock().await;
    match registry.refresh().await {
        Ok(()) => Json(json!({ "sessions": registry.sessions() })).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "session list refresh failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "unable to load sessions",
                    "sessions": registry.sessions(),
                })),
            )
                .into_response()
        }
    }
}

async fn get_messages(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.store.messages_for_session(&session_id).await {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(err) => {
            tracing::warn!(%session_id, error = %err, "history fetch failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "unable to load messages" })),
            )
                .into_response()
        }
    }
}

fn chat_error_response(err: ChatError) -> axum::response::Response {
    match err {
        ChatError::EmptyMessage => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "text is required" })),
        )
            .into_response(),
        ChatError::SessionClosed => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "conversation has ended" })),
        )
            .into_response(),
        ChatError::Send(err) | ChatError::Fetch(err) => {
            tracing::warn!(error = %err, "store operation failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "message could not be delivered" })),
            )
                .into_response()
        }
    }
}

async fn post_message(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    let sender = match body.sender.as_deref() {
        Some("agent") => Sender::Agent,
        _ => Sender::User,
    };
    match send_checked(state.store.as_ref(), &session_id, sender, &body.text).await {
        Ok(message) => (StatusCode::CREATED, Json(json!({ "message": message }))).into_response(),
        Err(err) => chat_error_response(err),
    }
}

async fn close_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match end_session(state.store.as_ref(), &session_id).await {
        Ok(changed) => Json(json!({ "ok": true, "changed": changed })).into_response(),
        Err(err) => chat_error_response(err),
    }
}

fn is_valid_zip(zip: &str) -> bool {
    let zip = zip.trim();
    zip.len() == 5 && zip.bytes().all(|b| b.is_ascii_digit())
}

async fn submit_contact_form(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewFormSubmission>,
) -> impl IntoResponse {
    if !body.disclaimer {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "disclaimer must be accepted" })),
        )
            .into_response();
    }
    if !body.zip.trim().is_empty() && !is_valid_zip(&body.zip) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "zip must be a 5-digit code" })),
        )
            .into_response();
    }
    match state.store.insert_form_submission(&body).await {
        Ok(submission) => {
            (StatusCode::CREATED, Json(json!({ "submission": submission }))).into_response()
        }
        Err(err) => {
            tracing::warn!(error = %err, "form submission failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": "submission could not be saved" })),
            )
                .into_response()
        }
    }
}

async fn list_contact_forms(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_form_submissions().await {
        Ok(submissions) => Json(json!({ "submissions": submissions })).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "form list failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "unable to load submissions" })),
            )
                .into_response()
        }
    }
}

async fn record_visit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewVisit>,
) -> impl IntoResponse {
    match state.store.record_visit(&body).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({ "ok": true }))).into_response(),
        Err(err) => {
            // Analytics are best-effort; the page must not care.
            tracing::debug!(error = %err, "visit not recorded");
            Json(json!({ "ok": false })).into_response()
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn watch_session(state: &Arc<AppState>, client_id: usize, session_id: &str) {
    let mut rt = state.realtime.lock().await;
    if let Some(previous) = rt.watched_session.remove(&client_id) {
        if let Some(set) = rt.session_watchers.get_mut(&previous) {
            set.remove(&client_id);
        }
    }
    rt.watched_session.insert(client_id, session_id.to_string());
    rt.session_watchers
        .entry(session_id.to_string())
        .or_default()
        .insert(client_id);
}

async fn emit_widget_notices(state: &Arc<AppState>, client_id: usize, widget: &mut VisitorWidget) {
    for notice in widget.take_notices() {
        match notice {
            ThreadNotice::SendFailed => {
                emit_to_client(
                    state,
                    client_id,
                    "message:error",
                    json!({ "message": "Your message could not be sent. Please try again." }),
                )
                .await;
            }
            ThreadNotice::ConversationEnded => {
                emit_to_client(
                    state,
                    client_id,
                    "session:closed",
                    json!({ "message": "This conversation has ended." }),
                )
                .await;
            }
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    // Visitor connections carry their widget plus a private change-feed
    // receiver, drained before each visitor action so the phase reflects
    // anything an agent did in the meantime.
    let mut widget: Option<(VisitorWidget, broadcast::Receiver<ChangeEvent>)> = None;

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        if let Some((w, feed)) = widget.as_mut() {
            while let Ok(event) = feed.try_recv() {
                w.apply_event(&event);
            }
        }

        match envelope.event.as_str() {
            "widget:join" => {
                let Some(session_id) = envelope.data.get("sessionId").and_then(Value::as_str)
                else {
                    continue;
                };
                let cached = envelope
                    .data
                    .get("cachedMessages")
                    .and_then(|v| serde_json::from_value::<Vec<ChatMessage>>(v.clone()).ok())
                    .unwrap_or_default();
                let ctx = SessionContext::restore(session_id.to_string(), cached);
                let (mut w, feed) = VisitorWidget::open(state.store.clone(), ctx).await;
                watch_session(&state, client_id, session_id).await;
                emit_to_client(&state, client_id, "session:history", w.messages()).await;
                emit_widget_notices(&state, client_id, &mut w).await;
                widget = Some((w, feed));
            }
            "widget:message" => {
                let Some(text) = envelope.data.get("text").and_then(Value::as_str) else {
                    continue;
                };
                let Some((w, _)) = widget.as_mut() else {
                    continue;
                };
                match w.handle_visitor_message(text).await {
                    Ok(()) | Err(ChatError::EmptyMessage) => {}
                    Err(ChatError::SessionClosed) => {
                        emit_to_client(
                            &state,
                            client_id,
                            "session:closed",
                            json!({ "message": "This conversation has ended." }),
                        )
                        .await;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "visitor message failed");
                    }
                }
                emit_widget_notices(&state, client_id, w).await;
            }
            "widget:escalate" => {
                let Some((w, _)) = widget.as_mut() else {
                    continue;
                };
                if let Err(ChatError::SessionClosed) = w.request_escalation().await {
                    emit_to_client(
                        &state,
                        client_id,
                        "session:closed",
                        json!({ "message": "This conversation has ended." }),
                    )
                    .await;
                }
                emit_widget_notices(&state, client_id, w).await;
            }
            "widget:end" => {
                let Some((w, _)) = widget.as_mut() else {
                    continue;
                };
                if w.end().await.is_err() {
                    emit_to_client(
                        &state,
                        client_id,
                        "message:error",
                        json!({ "message": "Could not end the conversation. Please try again." }),
                    )
                    .await;
                }
                emit_widget_notices(&state, client_id, w).await;
            }
            "agent:join" => {
                {
                    let mut rt = state.realtime.lock().await;
                    rt.agents.insert(client_id);
                }
                let mut registry = state.registry.lock().await;
                if let Err(err) = registry.refresh().await {
                    tracing::warn!(error = %err, "agent join refresh failed");
                }
                emit_to_client(&state, client_id, "session:snapshot", registry.sessions()).await;
            }
            "agent:watch" => {
                let Some(session_id) = envelope.data.get("sessionId").and_then(Value::as_str)
                else {
                    continue;
                };
                watch_session(&state, client_id, session_id).await;
                match state.store.messages_for_session(session_id).await {
                    Ok(messages) => {
                        emit_to_client(&state, client_id, "session:history", messages).await;
                    }
                    Err(err) => {
                        tracing::warn!(%session_id, error = %err, "agent history fetch failed");
                        emit_to_client(
                            &state,
                            client_id,
                            "message:error",
                            json!({ "message": "Unable to load this conversation." }),
                        )
                        .await;
                    }
                }
            }
            "agent:message" => {
                let session_id = envelope.data.get("sessionId").and_then(Value::as_str);
                let text = envelope.data.get("text").and_then(Value::as_str);
                let (Some(session_id), Some(text)) = (session_id, text) else {
                    continue;
                };
                match send_checked(state.store.as_ref(), session_id, Sender::Agent, text).await {
                    Ok(_) | Err(ChatError::EmptyMessage) => {}
                    Err(ChatError::SessionClosed) => {
                        emit_to_client(
                            &state,
                            client_id,
                            "session:closed",
                            json!({
                                "sessionId": session_id,
                                "message": "This conversation has ended.",
                            }),
                        )
                        .await;
                    }
                    Err(err) => {
                        tracing::warn!(%session_id, error = %err, "agent send failed");
                        emit_to_client(
                            &state,
                            client_id,
                            "message:error",
                            json!({
                                "sessionId": session_id,
                                "message": "Message could not be delivered.",
                            }),
                        )
                        .await;
                    }
                }
            }
            "agent:end" => {
                let Some(session_id) = envelope.data.get("sessionId").and_then(Value::as_str)
                else {
                    continue;
                };
                if let Err(err) = end_session(state.store.as_ref(), session_id).await {
                    tracing::warn!(%session_id, error = %err, "end session failed");
                }
            }
            _ => {}
        }
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
        rt.agents.remove(&client_id);
        rt.watched_session.remove(&client_id);
        for watchers in rt.session_watchers.values_mut() {
            watchers.remove(&client_id);
        }
    }

    send_task.abort();
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "livechat".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", get(get_sessions))
        .route("/api/session/{session_id}/messages", get(get_messages))
        .route("/api/session/{session_id}/message", post(post_message))
        .route("/api/session/{session_id}/close", post(close_session))
        .route("/api/forms/contact", post(submit_contact_form))
        .route("/api/forms", get(list_contact_forms))
        .route("/api/visits", post(record_visit))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();

    let store = PgStore::connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");
    let state = Arc::new(AppState::new(Arc::new(store)));

    tokio::spawn(route_change_events(state.clone()));

    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    tracing::info!(%addr, "live chat server listening");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_validation_accepts_five_digits_only() {
        assert!(is_valid_zip("10005"));
        assert!(is_valid_zip(" 10005 "));
        assert!(!is_valid_zip("1000"));
        assert!(!is_valid_zip("100056"));
        assert!(!is_valid_zip("1000a"));
        assert!(!is_valid_zip(""));
    }

    #[test]
    fn event_envelope_tolerates_missing_data() {
        let envelope: EventEnvelopeIn = serde_json::from_str(r#"{"event":"agent:join"}"#).unwrap();
        assert_eq!(envelope.event, "agent:join");
        assert!(envelope.data.is_null());
    }

    #[test]
    fn event_payload_wraps_event_and_data() {
        let payload = event_payload("message:new", json!({ "id": "m1" })).unwrap();
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["event"], "message:new");
        assert_eq!(value["data"]["id"], "m1");
    }
}
