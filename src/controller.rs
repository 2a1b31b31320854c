//! Controller socket endpoint: admission, frame loop, liveness, teardown.
//!
//! A controller connects outbound to `/socket/v1?deviceKey=<key>` and stays
//! connected. Admission runs after the upgrade so that every refusal can be
//! delivered as a single `ERR: ` text frame on the socket before it closes.
//! Once admitted, the session is one task owning the socket, the liveness
//! ticker, and reply resolution. Inbound frames, outbound sends, and ticks
//! are serialized in its `select!` loop, so the pending table only ever
//! changes under its mutex from here or from a forwarder.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{OriginalUri, Query, State};
use axum::response::Response;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::ResponseFrame;
use crate::registry::{ControllerHandle, InsertOutcome};
use crate::GatewayState;

/// Liveness cadence: one ping per tick, teardown after one unanswered tick.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

/// Outbound frame queue depth per session.
const FRAME_QUEUE_DEPTH: usize = 64;

/// Controller-endpoint router. Every path upgrades and admission decides, so
/// a controller dialing the wrong path still gets its error frame on the
/// socket instead of an opaque HTTP status.
pub fn router(state: GatewayState) -> Router {
    Router::new().fallback(controller_socket).with_state(state)
}

/// Connect-time query parameters.
#[derive(Deserialize)]
struct ConnectParams {
    #[serde(rename = "deviceKey")]
    device_key: Option<String>,
}

async fn controller_socket(
    State(state): State<GatewayState>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let path = uri.path().to_string();
    let device_key = params.device_key.unwrap_or_default();
    ws.on_upgrade(move |socket| controller_connected(socket, state, path, device_key))
}

/// Admission checks, in order. Returns the refusal frame text on failure.
async fn admit(state: &GatewayState, path: &str, device_key: &str) -> Result<(), &'static str> {
    if path != "/socket/v1" {
        return Err("ERR: invalid path.");
    }
    if device_key.is_empty() {
        return Err("ERR: deviceKey was not properly specified.");
    }
    if state.registry.contains(device_key).await {
        return Err("ERR: A controller with this device key is already connected.");
    }
    match state.validator.validate_key(device_key).await {
        Ok(true) => Ok(()),
        Ok(false) => Err("ERR: Invalid device key."),
        Err(error) => {
            warn!(%device_key, %error, "device key validation failed");
            Err("ERR: Error validating device key.")
        }
    }
}

async fn refuse(mut socket: WebSocket, refusal: &'static str) {
    let _ = socket.send(Message::Text(refusal.into())).await;
    let _ = socket.send(Message::Close(None)).await;
}

async fn controller_connected(
    socket: WebSocket,
    state: GatewayState,
    path: String,
    device_key: String,
) {
    if let Err(refusal) = admit(&state, &path, &device_key).await {
        debug!(%path, %device_key, refusal, "controller admission refused");
        refuse(socket, refusal).await;
        return;
    }

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    let handle = ControllerHandle::new(device_key.clone(), frame_tx);
    // The pre-check above raced another connect; the registry insert is the
    // barrier that settles it.
    if state.registry.try_insert(handle.clone()).await == InsertOutcome::AlreadyPresent {
        refuse(
            socket,
            "ERR: A controller with this device key is already connected.",
        )
        .await;
        return;
    }
    info!(%device_key, session = %handle.session_id, "controller connected");

    let end = run_session(socket, &handle, frame_rx).await;

    state.registry.remove(&handle.device_key, handle.session_id).await;
    let failed = handle.drain_pending().await;
    info!(
        device_key = %handle.device_key,
        session = %handle.session_id,
        reason = end.as_str(),
        failed_requests = failed,
        "controller disconnected"
    );
}

/// Why a session loop ended.
enum SessionEnd {
    /// Peer closed, or the stream ended.
    Closed,
    /// Read or write error on the socket.
    SocketError,
    /// A liveness tick passed with no pong since the last ping.
    LivenessTimeout,
}

impl SessionEnd {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::SocketError => "socket error",
            Self::LivenessTimeout => "liveness timeout",
        }
    }
}

async fn run_session(
    socket: WebSocket,
    handle: &ControllerHandle,
    mut frame_rx: mpsc::Receiver<Message>,
) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + LIVENESS_INTERVAL,
        LIVENESS_INTERVAL,
    );
    let mut awaiting_pong = false;

    let end = loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                // The handle keeps its sender alive for the whole session, so
                // `None` cannot happen before teardown; treat it as a close.
                let Some(frame) = frame else { break SessionEnd::Closed };
                if sink.send(frame).await.is_err() {
                    break SessionEnd::SocketError;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => handle_frame(handle, text.as_bytes()).await,
                    Some(Ok(Message::Binary(bytes))) => handle_frame(handle, &bytes).await,
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break SessionEnd::Closed,
                    Some(Err(error)) => {
                        warn!(device_key = %handle.device_key, %error, "controller socket error");
                        break SessionEnd::SocketError;
                    }
                }
            }
            _ = ticker.tick() => {
                if awaiting_pong {
                    break SessionEnd::LivenessTimeout;
                }
                awaiting_pong = true;
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break SessionEnd::SocketError;
                }
            }
        }
    };

    if matches!(end, SessionEnd::LivenessTimeout) {
        warn!(device_key = %handle.device_key, "controller missed a ping, closing");
        let _ = sink.send(Message::Close(None)).await;
    }
    end
}

/// Decode one inbound frame and resolve its pending slot. Malformed frames
/// and unknown ids are logged and dropped; nothing else changes.
async fn handle_frame(handle: &ControllerHandle, raw: &[u8]) {
    match ResponseFrame::parse(raw) {
        Ok(frame) => {
            let id = frame.id;
            if handle.resolve_pending(id, frame.body.to_vec()).await {
                debug!(device_key = %handle.device_key, request_id = %id, "reply delivered");
            } else {
                debug!(
                    device_key = %handle.device_key,
                    request_id = %id,
                    "reply for unknown request id discarded"
                );
            }
        }
        Err(error) => {
            debug!(device_key = %handle.device_key, %error, "malformed frame discarded");
        }
    }
}
