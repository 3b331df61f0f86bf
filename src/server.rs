//! Chat Transport
//!
//! Thin HTTP/WebSocket layer over the Agent Loop: `/chat` accepts user
//! messages and streams each turn's events back as JSON; `/api/history`
//! returns the persisted log reshaped into display events. No auth, no
//! rendering - the transport is an external collaborator of the core.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::agent::Agent;
use crate::store::{Store, StoredMessage};

/// Messages returned by the history endpoint
const HISTORY_LIMIT: usize = 200;

struct AppState {
    agent: Arc<Agent>,
    store: Arc<Store>,
}

/// Build the transport router
pub fn router(agent: Arc<Agent>, store: Arc<Store>) -> Router {
    let state = Arc::new(AppState { agent, store });
    Router::new()
        .route("/chat", get(chat_ws))
        .route("/api/history", get(history))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process ends
pub async fn serve(
    addr: std::net::SocketAddr,
    agent: Arc<Agent>,
    store: Arc<Store>,
) -> anyhow::Result<()> {
    let app = router(agent, store);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Chat transport listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn chat_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };

        let content = match serde_json::from_str::<serde_json::Value>(text.as_str()) {
            Ok(value) => value
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string(),
            Err(_) => {
                let reply = json!({"type": "error", "content": "Invalid JSON"}).to_string();
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    return;
                }
                continue;
            }
        };
        if content.is_empty() {
            continue;
        }

        let mut events = state.agent.handle_message(content);
        while let Some(event) = events.next().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            if socket.send(Message::Text(payload.into())).await.is_err() {
                // Client went away; the turn keeps running and persisting
                return;
            }
        }
    }
    info!("Chat client disconnected");
}

async fn history(State(state): State<Arc<AppState>>) -> Json<Vec<serde_json::Value>> {
    let mut messages = state.store.recent_messages(HISTORY_LIMIT).unwrap_or_default();
    messages.reverse();
    Json(history_events(&messages))
}

/// Reshape the raw log into display events: one `tool_call` per requested
/// call, results correlated back to their call by id.
fn history_events(messages: &[StoredMessage]) -> Vec<serde_json::Value> {
    let mut call_names: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    let mut events = Vec::new();

    for msg in messages {
        match msg.role.as_str() {
            "user" => events.push(json!({"type": "user", "content": msg.content})),
            "assistant" => {
                if let Some(calls) = msg.tool_calls.as_ref().and_then(|v| v.as_array()) {
                    for call in calls {
                        let name = call["function"]["name"].as_str().unwrap_or_default();
                        let arguments_raw =
                            call["function"]["arguments"].as_str().unwrap_or_default();
                        if let Some(id) = call["id"].as_str() {
                            call_names.insert(id.to_string(), name.to_string());
                        }
                        let arguments: serde_json::Value =
                            serde_json::from_str(arguments_raw).unwrap_or(json!({}));
                        events.push(json!({
                            "type": "tool_call",
                            "name": name,
                            "content": arguments_raw,
                            "arguments": arguments,
                        }));
                    }
                } else {
                    events.push(json!({"type": "assistant", "content": msg.content}));
                }
            }
            "tool" => {
                let name = msg
                    .tool_call_id
                    .as_ref()
                    .and_then(|id| call_names.get(id))
                    .cloned()
                    .unwrap_or_default();
                events.push(json!({
                    "type": "tool_result",
                    "name": name,
                    "content": msg.content,
                }));
            }
            _ => {}
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: i64, role: &str, content: &str) -> StoredMessage {
        StoredMessage {
            id,
            role: role.to_string(),
            content: content.to_string(),
            tool_call_id: None,
            tool_calls: None,
            created_at: id,
        }
    }

    #[test]
    fn test_plain_exchange_events() {
        let log = vec![msg(1, "user", "hi"), msg(2, "assistant", "hello")];
        let events = history_events(&log);
        assert_eq!(events[0]["type"], "user");
        assert_eq!(events[1]["type"], "assistant");
    }

    #[test]
    fn test_tool_exchange_is_expanded_and_correlated() {
        let mut request = msg(2, "assistant", "");
        request.tool_calls = Some(json!([{
            "id": "c1",
            "function": {"name": "double", "arguments": "{\"n\": 21}"}
        }]));
        let mut result = msg(3, "tool", "42");
        result.tool_call_id = Some("c1".to_string());

        let log = vec![msg(1, "user", "double 21"), request, result];
        let events = history_events(&log);

        assert_eq!(events[1]["type"], "tool_call");
        assert_eq!(events[1]["name"], "double");
        assert_eq!(events[1]["arguments"]["n"], 21);
        assert_eq!(events[2]["type"], "tool_result");
        assert_eq!(events[2]["name"], "double");
        assert_eq!(events[2]["content"], "42");
    }
}
