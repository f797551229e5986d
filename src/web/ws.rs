use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use super::api::{ApiError, SharedState};
use crate::session::machine::SessionMachine;
use crate::session::models::{Session, SessionStatus};
use crate::session::rpc::{METHOD_RUN_SETUP, RpcRequest, SERVER_CALL_ID, ServerFrame};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let machine = state.manager.get(&id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, machine)))
}

async fn handle_socket(socket: WebSocket, state: SharedState, machine: Arc<SessionMachine>) {
    let (mut sender, receiver) = socket.split();
    // Subscribe before taking the snapshot so no mutation falls in between.
    let snapshots = state.manager.notifier().subscribe(machine.id());
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let initial = ServerFrame::State {
        session: machine.snapshot(),
    };
    if !send_frame(&mut sender, &initial).await {
        return;
    }
    tracing::info!(session_id = %machine.id(), "client connected");

    if machine.status() == SessionStatus::Configuring {
        state.registry.dispatch(
            machine.clone(),
            RpcRequest {
                id: SERVER_CALL_ID,
                method: METHOD_RUN_SETUP.to_string(),
                params: Value::Null,
            },
            out_tx.clone(),
        );
    }

    let session_id = machine.id().to_string();
    run_socket_loop(
        sender,
        receiver,
        snapshots,
        out_rx,
        |request| state.registry.dispatch(machine.clone(), request, out_tx.clone()),
        |frame| {
            let _ = out_tx.send(frame);
        },
    )
    .await;
    tracing::info!(session_id = %session_id, "client disconnected");
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines state snapshot forwarding, RPC frame forwarding, client request
/// handling and periodic ping/pong health checking into a single select
/// loop. If no Pong is received within [`PONG_TIMEOUT`] after a Ping is
/// sent, the connection is considered dead and the loop exits. Calls still
/// running when the loop exits carry on without a listener.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut snapshots: broadcast::Receiver<Session>,
    mut frames: mpsc::UnboundedReceiver<ServerFrame>,
    dispatch: impl Fn(RpcRequest),
    reply: impl Fn(ServerFrame),
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── State snapshots ─────────────────────────────────────
            result = snapshots.recv() => {
                match result {
                    Ok(session) => {
                        if !send_frame(&mut sender, &ServerFrame::State { session }).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Only the latest snapshot matters; the next one catches up.
                        tracing::debug!(skipped, "state observer lagged");
                        continue;
                    }
                }
            }

            // ── Call output ─────────────────────────────────────────
            Some(frame) = frames.recv() => {
                if !send_frame(&mut sender, &frame).await {
                    break;
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RpcRequest>(text.as_str()) {
                            Ok(request) => dispatch(request),
                            Err(e) => reply(ServerFrame::Error {
                                id: SERVER_CALL_ID,
                                message: format!("Malformed request: {}", e),
                            }),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary and Ping frames are ignored (axum answers pings).
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

/// Serialize and send one frame. Returns false once the socket is gone.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize server frame");
            true
        }
    }
}
