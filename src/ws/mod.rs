//! WebSocket transport for the IDE shell.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/ws`; one logical connection per client.
//! 2. All messages are JSON objects with a `"type"` field. An optional
//!    `"request_id"` on any incoming message is echoed on the corresponding
//!    response, enabling correlation in async clients.
//! 3. On disconnect, every terminal owned by the connection is killed, all
//!    assistant sessions are torn down, and the subagent watcher is stopped —
//!    the backend serves one active user context per process.
//!
//! ## Message types (client → server)
//!
//! | Type                      | Fields                                                            | Response type(s)                    |
//! |---------------------------|-------------------------------------------------------------------|-------------------------------------|
//! | `ping`                    | —                                                                 | `pong`                              |
//! | `terminal.create`         | `working_dir?`                                                    | `terminal.created` or `error`       |
//! | `terminal.write`          | `id`, `data`                                                      | (none)                              |
//! | `terminal.resize`         | `id`, `cols`, `rows`                                              | (none)                              |
//! | `terminal.kill`           | `id`                                                              | `terminal.killed`                   |
//! | `assistant.send`          | `conversation_id`, `prompt`, `working_dir`, `model?`, `resume_session_id?` | `assistant.send.ack`       |
//! | `assistant.respond`       | `conversation_id`, `text`                                         | `assistant.respond.ack`             |
//! | `assistant.abort`         | `conversation_id`                                                 | `assistant.abort.ack`               |
//! | `assistant.close`         | `conversation_id`                                                 | `assistant.close.ack`               |
//! | `subagent.watch`          | `conversation_id`, `parent_session_id`, `workspace_path`, `targets` | `subagent.watch.ack`              |
//! | `subagent.update_targets` | `targets`                                                         | `subagent.update_targets.ack`       |
//! | `subagent.stop`           | —                                                                 | `subagent.stop.ack`                 |
//!
//! ## Message types (server → client)
//!
//! | Type                 | Key fields                                        |
//! |----------------------|---------------------------------------------------|
//! | `pong`               | —                                                 |
//! | `terminal.created`   | `id`                                              |
//! | `terminal.data`      | `id`, `data`                                      |
//! | `terminal.exit`      | `id`, `exit_code`                                 |
//! | `terminal.killed`    | `id`, `ok`                                        |
//! | `assistant.event`    | `conversation_id`, `event` (structured / `prompt` / `stderr` / `error`) |
//! | `assistant.done`     | `conversation_id`, `exit_code`, `session_id?`     |
//! | `subagent.activity`  | `conversation_id`, `activities[]`                 |
//! | `error`              | `code`, `message`                                 |

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::subagent::transcript::WatchTarget;
use crate::terminal::TerminalRegistry;
use crate::AppState;

/// `GET /api/ws` — WebSocket upgrade handler.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Attach the echoed request id, if the request carried one.
fn with_request_id(mut resp: Value, request_id: Option<&str>) -> Value {
    if let Some(rid) = request_id {
        resp["request_id"] = json!(rid);
    }
    resp
}

/// Main WebSocket event loop.
///
/// Splits the socket into a sink (outgoing) and stream (incoming). Outgoing
/// messages are funneled through an mpsc channel so session tasks — terminal
/// forwarders, assistant classifier drivers, the subagent poller — can send
/// without holding a reference to the socket. The channel sender is handed
/// to each session at creation time, so event routing is fixed the moment a
/// session exists and a later connection can never receive another
/// connection's stragglers.
#[allow(clippy::too_many_lines)]
async fn handle_ws(socket: axum::extract::ws::WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // Channel for sending messages back to the WebSocket
    let (tx, mut rx) = mpsc::channel::<Value>(256);

    info!("Client connected");

    // Per-connection terminal state
    let mut terminals = TerminalRegistry::new(state.pty_factory.clone(), state.config.clone());

    // Task: forward channel messages to WebSocket sink
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("WS send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink
                .send(axum::extract::ws::Message::Text(text.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            axum::extract::ws::Message::Text(text) => {
                let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                    let _ = tx
                        .send(json!({
                            "type": "error",
                            "code": "INVALID_JSON",
                            "message": "Failed to parse JSON message"
                        }))
                        .await;
                    continue;
                };

                let msg_type = parsed["type"].as_str().unwrap_or("");
                let request_id = parsed["request_id"].as_str().map(ToString::to_string);
                let rid = request_id.as_deref();

                match msg_type {
                    "ping" => {
                        let _ = tx.send(with_request_id(json!({"type": "pong"}), rid)).await;
                    }
                    "terminal.create" => {
                        let working_dir = parsed["working_dir"].as_str();
                        match terminals.create(working_dir, tx.clone()).await {
                            Ok(id) => {
                                let _ = tx
                                    .send(with_request_id(
                                        json!({"type": "terminal.created", "id": id}),
                                        rid,
                                    ))
                                    .await;
                            }
                            Err(e) => {
                                error!("terminal.create failed: {e}");
                                let _ = tx
                                    .send(with_request_id(
                                        json!({
                                            "type": "error",
                                            "code": "TERMINAL_SPAWN_FAILED",
                                            "message": e,
                                        }),
                                        rid,
                                    ))
                                    .await;
                            }
                        }
                    }
                    "terminal.write" => {
                        // Fire-and-forget; unknown ids are ignored.
                        if let (Some(id), Some(data)) =
                            (parsed["id"].as_u64(), parsed["data"].as_str())
                        {
                            #[allow(clippy::cast_possible_truncation)]
                            terminals.write(id as u32, data).await;
                        }
                    }
                    "terminal.resize" => {
                        let id = parsed["id"].as_u64();
                        let cols = parsed["cols"].as_u64().unwrap_or(0);
                        let rows = parsed["rows"].as_u64().unwrap_or(0);
                        if let Some(id) = id {
                            if cols > 0 && rows > 0 {
                                #[allow(clippy::cast_possible_truncation)]
                                terminals.resize(id as u32, cols as u16, rows as u16).await;
                            }
                        }
                    }
                    "terminal.kill" => {
                        if let Some(id) = parsed["id"].as_u64() {
                            #[allow(clippy::cast_possible_truncation)]
                            let ok = terminals.kill(id as u32).await;
                            let _ = tx
                                .send(with_request_id(
                                    json!({"type": "terminal.killed", "id": id, "ok": ok}),
                                    rid,
                                ))
                                .await;
                        }
                    }
                    "assistant.send" => {
                        let conversation_id = parsed["conversation_id"].as_str().unwrap_or("");
                        let prompt = parsed["prompt"].as_str().unwrap_or("");
                        if conversation_id.is_empty() || prompt.is_empty() {
                            let _ = tx
                                .send(with_request_id(
                                    json!({
                                        "type": "error",
                                        "code": "MISSING_FIELD",
                                        "message": "conversation_id and prompt are required",
                                    }),
                                    rid,
                                ))
                                .await;
                            continue;
                        }
                        let working_dir = parsed["working_dir"].as_str().unwrap_or("");
                        let model = parsed["model"].as_str();
                        let resume = parsed["resume_session_id"].as_str();
                        let ok = state
                            .assistant
                            .send(conversation_id, prompt, working_dir, model, resume, tx.clone())
                            .await;
                        let _ = tx
                            .send(with_request_id(
                                json!({
                                    "type": "assistant.send.ack",
                                    "conversation_id": conversation_id,
                                    "ok": ok,
                                }),
                                rid,
                            ))
                            .await;
                    }
                    "assistant.respond" => {
                        let conversation_id = parsed["conversation_id"].as_str().unwrap_or("");
                        let text = parsed["text"].as_str().unwrap_or("");
                        let ok = !conversation_id.is_empty()
                            && state
                                .assistant
                                .respond(conversation_id, text, tx.clone())
                                .await;
                        let _ = tx
                            .send(with_request_id(
                                json!({
                                    "type": "assistant.respond.ack",
                                    "conversation_id": conversation_id,
                                    "ok": ok,
                                }),
                                rid,
                            ))
                            .await;
                    }
                    "assistant.abort" => {
                        let conversation_id = parsed["conversation_id"].as_str().unwrap_or("");
                        let ok = !conversation_id.is_empty()
                            && state.assistant.abort(conversation_id).await;
                        let _ = tx
                            .send(with_request_id(
                                json!({
                                    "type": "assistant.abort.ack",
                                    "conversation_id": conversation_id,
                                    "ok": ok,
                                }),
                                rid,
                            ))
                            .await;
                    }
                    "assistant.close" => {
                        let conversation_id = parsed["conversation_id"].as_str().unwrap_or("");
                        state.assistant.close(conversation_id).await;
                        // Closing the conversation ends any subagent watch
                        // attached to it.
                        state.subagents.stop_watch().await;
                        let _ = tx
                            .send(with_request_id(
                                json!({
                                    "type": "assistant.close.ack",
                                    "conversation_id": conversation_id,
                                    "ok": true,
                                }),
                                rid,
                            ))
                            .await;
                    }
                    "subagent.watch" => {
                        let conversation_id = parsed["conversation_id"].as_str().unwrap_or("");
                        let parent_session_id =
                            parsed["parent_session_id"].as_str().unwrap_or("");
                        let workspace_path = parsed["workspace_path"].as_str().unwrap_or("");
                        let targets: Vec<WatchTarget> =
                            serde_json::from_value(parsed["targets"].clone()).unwrap_or_default();
                        let ok = !parent_session_id.is_empty()
                            && state
                                .subagents
                                .start_watch(
                                    conversation_id,
                                    parent_session_id,
                                    workspace_path,
                                    targets,
                                    tx.clone(),
                                )
                                .await;
                        let _ = tx
                            .send(with_request_id(
                                json!({"type": "subagent.watch.ack", "ok": ok}),
                                rid,
                            ))
                            .await;
                    }
                    "subagent.update_targets" => {
                        let targets: Vec<WatchTarget> =
                            serde_json::from_value(parsed["targets"].clone()).unwrap_or_default();
                        state.subagents.update_targets(targets).await;
                        let _ = tx
                            .send(with_request_id(
                                json!({"type": "subagent.update_targets.ack", "ok": true}),
                                rid,
                            ))
                            .await;
                    }
                    "subagent.stop" => {
                        state.subagents.stop_watch().await;
                        let _ = tx
                            .send(with_request_id(
                                json!({"type": "subagent.stop.ack", "ok": true}),
                                rid,
                            ))
                            .await;
                    }
                    _ => {
                        let _ = tx
                            .send(with_request_id(
                                json!({
                                    "type": "error",
                                    "code": "UNKNOWN_TYPE",
                                    "message": format!("Unknown message type: {msg_type}"),
                                }),
                                rid,
                            ))
                            .await;
                    }
                }
            }
            axum::extract::ws::Message::Close(_) => break,
            _ => {}
        }
    }

    // Connection closed — conservative teardown. Connection-owned terminals
    // die with the connection; assistant sessions and the watcher are global
    // but the process serves one user context, so they go too.
    info!("Client disconnected, tearing down sessions");
    terminals.kill_all().await;
    state.assistant.kill_all().await;
    state.subagents.stop_watch().await;
    send_task.abort();
}
