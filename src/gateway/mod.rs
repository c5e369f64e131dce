//! HTTP/WebSocket gateway.
//!
//! `/ws` runs the streaming loop with a vault-status handshake; the REST
//! surface exposes chat (blocking variant), audit, policy, skills, and
//! vault status.

use crate::agent::TurnContext;
use crate::channels::ChannelRuntime;
use crate::envelope::ChannelKind;
use crate::forge::ForgeCoordinator;
use crate::notify::{NotificationHub, NotificationSink};
use crate::vault::VaultClient;
use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct GatewayState {
    pub runtime: Arc<ChannelRuntime>,
    pub coordinator: Arc<ForgeCoordinator>,
    pub notifier: Arc<NotificationHub>,
    pub vault: Option<VaultClient>,
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/audit", get(audit_handler))
        .route("/audit/denied", get(audit_denied_handler))
        .route("/policy", get(policy_handler))
        .route("/skills", get(skills_handler))
        .route("/skills/{name}", delete(delete_skill_handler))
        .route("/skills/{name}/toggle", put(toggle_skill_handler))
        .route("/vault/status", get(vault_status_handler))
        .route("/api/chat", post(chat_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Bind and serve until the task is aborted.
pub async fn serve(state: GatewayState, host: &str, port: u16) -> Result<()> {
    let router = build_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening");
    axum::serve(listener, router).await?;
    Ok(())
}

// ---------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------

async fn status_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let vault_status = match &state.vault {
        Some(vault) => vault.status().await["status"].clone(),
        None => json!("disabled"),
    };
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "vault": vault_status,
        "skill_generating": state.coordinator.is_generating(),
    }))
}

#[derive(Deserialize)]
struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    limit: usize,
}

fn default_audit_limit() -> usize {
    50
}

async fn audit_handler(
    State(state): State<GatewayState>,
    Query(query): Query<AuditQuery>,
) -> impl IntoResponse {
    let entries = state.runtime.agent().registry().audit().recent(query.limit);
    let count = entries.len();
    Json(json!({"entries": entries, "count": count}))
}

async fn audit_denied_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    let entries = state.runtime.agent().registry().audit().denied();
    let count = entries.len();
    Json(json!({"entries": entries, "count": count}))
}

async fn policy_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.runtime.agent().registry().pdp().summary())
}

async fn skills_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.coordinator.list_skills())
}

async fn delete_skill_handler(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.delete_skill(&name).await {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))),
    }
}

async fn toggle_skill_handler(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.toggle_skill(&name).await {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))),
    }
}

async fn vault_status_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    match &state.vault {
        Some(vault) => Json(vault.status().await),
        None => Json(json!({"status": "disabled"})),
    }
}

#[derive(Deserialize)]
struct ChatBody {
    message: String,
    #[serde(default)]
    user_id: Option<String>,
}

/// Single request/response chat over the blocking variant.
async fn chat_handler(
    State(state): State<GatewayState>,
    Json(body): Json<ChatBody>,
) -> impl IntoResponse {
    let user_id = body.user_id.unwrap_or_else(|| "http-api".to_string());
    let mut envelope = state
        .runtime
        .receive(ChannelKind::Api, &user_id, "", &body.message, HashMap::new());
    match state.runtime.process(&mut envelope).await {
        Ok(response) => (
            StatusCode::OK,
            Json(json!({"response": response, "bank_id": envelope.bank_id()})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

// ---------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------

struct WsSink {
    id: String,
    tx: mpsc::Sender<Value>,
}

#[async_trait]
impl NotificationSink for WsSink {
    fn label(&self) -> String {
        format!("ws:{}", self.id)
    }

    async fn deliver(&self, event: &str, message: &str) -> Result<()> {
        self.tx
            .send(json!({"type": "notification", "event": event, "message": message}))
            .await
            .map_err(|_| anyhow::anyhow!("websocket closed"))
    }
}

async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: GatewayState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Value>(32);

    // one writer task owns the sink; everything else goes through `tx`
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let connection_id = uuid::Uuid::now_v7().to_string();
    state
        .notifier
        .subscribe(Arc::new(WsSink {
            id: connection_id.clone(),
            tx: tx.clone(),
        }))
        .await;
    info!(connection = %connection_id, "websocket connected");

    // vault-status handshake
    if let Some(ref vault) = state.vault {
        let status = vault.status().await;
        let _ = tx
            .send(json!({"type": "vault_status", "status": status["status"]}))
            .await;
    }

    while let Some(frame) = receiver.next().await {
        let Ok(message) = frame else { break };
        let Message::Text(text) = message else { continue };
        let Ok(payload) = serde_json::from_str::<Value>(text.as_str()) else {
            let _ = tx.send(json!({"error": "invalid JSON frame"})).await;
            continue;
        };

        match payload.get("type").and_then(Value::as_str).unwrap_or("message") {
            "vault_setup" => {
                handle_vault_credential(&state, &tx, &payload, true).await;
            }
            "vault_unlock" => {
                handle_vault_credential(&state, &tx, &payload, false).await;
            }
            _ => {
                let message_text = payload.get("message").and_then(Value::as_str).unwrap_or("");
                if message_text.is_empty() {
                    let _ = tx.send(json!({"error": "empty message"})).await;
                    continue;
                }
                let user_id = payload
                    .get("bank_id")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("default")
                    .to_string();
                stream_reply(&state, &tx, message_text, &user_id).await;
            }
        }
    }

    debug!(connection = %connection_id, "websocket disconnected");
    // dropping tx closes the writer; the notification sink dies with it
    drop(tx);
    let _ = writer.await;
}

/// Run the streaming loop and forward each token as a frame, then the
/// final `done` frame.
async fn stream_reply(state: &GatewayState, tx: &mpsc::Sender<Value>, message: &str, user_id: &str) {
    let turn = TurnContext::new("web", user_id);
    let sessions = state.runtime.sessions();
    let history = sessions.history("web", user_id);

    let mut stream = state.runtime.agent().run_stream(message, &history, &turn).await;
    let mut response = String::new();
    while let Some(token) = stream.next_token().await {
        match token {
            Ok(token) => {
                response.push_str(&token);
                if tx.send(json!({"type": "stream", "content": token})).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "websocket stream failed");
                let _ = tx.send(json!({"error": e.to_string()})).await;
                return;
            }
        }
    }

    sessions.append_turn("web", user_id, message, &response);
    let _ = tx
        .send(json!({"type": "done", "response": response, "bank_id": turn.bank_id}))
        .await;
}

async fn handle_vault_credential(
    state: &GatewayState,
    tx: &mpsc::Sender<Value>,
    payload: &Value,
    setup: bool,
) {
    let Some(ref vault) = state.vault else {
        let _ = tx
            .send(json!({"type": "vault_error", "error": "vault is not configured"}))
            .await;
        return;
    };
    let password = payload.get("password").and_then(Value::as_str).unwrap_or("");
    let result = if setup {
        vault.setup(password).await
    } else {
        vault.unlock(password).await
    };
    match result {
        Ok(true) => {
            let _ = tx.send(json!({"type": "vault_status", "status": "unlocked"})).await;
        }
        Ok(false) => {
            let error = if setup { "password setup failed" } else { "wrong password" };
            let _ = tx.send(json!({"type": "vault_error", "error": error})).await;
        }
        Err(e) => {
            let _ = tx.send(json!({"type": "vault_error", "error": e.to_string()})).await;
        }
    }
}

#[cfg(test)]
mod tests;
