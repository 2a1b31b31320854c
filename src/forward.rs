//! Request forwarder: parks the HTTP response, frames the request onto the
//! device socket, and delivers the first matching reply.
//!
//! A forward is fire-and-forget from the server's perspective: the handler
//! returns only once the device has replied, the client has gone away, or the
//! session was torn down. There is no per-forward timeout; liveness tears the
//! whole session down if the controller stops responding.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, warn};

use crate::codec::{self, RequestId};
use crate::registry::{ControllerHandle, PendingOutcome};
use crate::GatewayState;

/// Request bodies beyond this are refused with 413.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Forward routes, mounted on the HTTP listener.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/forward/v1/{device_key}", any(redirect_to_slash))
        .route("/forward/v1/{device_key}/", any(forward_root))
        .route("/forward/v1/{device_key}/{*suffix}", any(forward_suffix))
        .with_state(state)
}

/// `ALL /forward/v1/{key}` → 301 to the same URL with a trailing slash.
async fn redirect_to_slash(uri: Uri) -> Response {
    let target = match uri.query() {
        Some(query) => format!("{}/?{query}", uri.path()),
        None => format!("{}/", uri.path()),
    };
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, target)]).into_response()
}

async fn forward_root(
    State(state): State<GatewayState>,
    Path(device_key): Path<String>,
    request: Request,
) -> Response {
    forward(state, device_key, String::new(), request).await
}

async fn forward_suffix(
    State(state): State<GatewayState>,
    Path((device_key, suffix)): Path<(String, String)>,
    request: Request,
) -> Response {
    forward(state, device_key, suffix, request).await
}

async fn forward(
    state: GatewayState,
    device_key: String,
    suffix: String,
    request: Request,
) -> Response {
    if device_key.is_empty() {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "No device key was specified or an invalid format was used.",
        );
    }
    let Some(handle) = state.registry.lookup(&device_key).await else {
        return error_response(
            StatusCode::NOT_FOUND,
            "Specified device does not exist or is not connected.",
        );
    };

    let method = request.method().clone();
    let version = request.version();
    let path = forwarded_path(&suffix, request.uri().query());
    let headers = request.headers().clone();
    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body exceeds the 1 MiB limit.",
            )
        }
    };

    let Some((id, reply_rx)) = handle.register_pending().await else {
        warn!(%device_key, "pending table saturated, refusing forward");
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Too many requests are in flight for this device.",
        );
    };
    // From here on the slot must not outlive this future: the guard erases it
    // if the client disconnects while we wait.
    let guard = PendingGuard::new(Arc::clone(&handle), id);

    let frame = codec::encode_forward_frame(id, &method, &path, version, &headers, &body);
    if handle.frame_tx.send(codec::frame_message(frame)).await.is_err() {
        guard.disarm();
        handle.discard_pending(id).await;
        return error_response(
            StatusCode::BAD_GATEWAY,
            "Device disconnected before the request could be sent.",
        );
    }
    debug!(%device_key, request_id = %id, %method, %path, "request forwarded");

    match reply_rx.await {
        Ok(PendingOutcome::Reply(body)) => {
            guard.disarm();
            reply_response(body)
        }
        Ok(PendingOutcome::Disconnected) | Err(_) => {
            guard.disarm();
            error_response(
                StatusCode::BAD_GATEWAY,
                "Device disconnected before a response was received.",
            )
        }
    }
}

/// Forwarded path: the request URL minus the `/forward/v1/{key}` prefix,
/// `/` when empty, query string carried through.
fn forwarded_path(suffix: &str, query: Option<&str>) -> String {
    match query {
        Some(query) => format!("/{suffix}?{query}"),
        None => format!("/{suffix}"),
    }
}

/// The device's reply bytes, verbatim; the stream is closed after the single
/// write.
fn reply_response(body: Vec<u8>) -> Response {
    (StatusCode::OK, [(header::CONNECTION, "close")], body).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

/// Erases a parked reply slot when the forward is abandoned before
/// resolution; the handler future is dropped the moment the HTTP client
/// disconnects. A reply racing the drop becomes a lookup miss and is
/// discarded by the session.
struct PendingGuard {
    handle: Arc<ControllerHandle>,
    id: RequestId,
    armed: bool,
}

impl PendingGuard {
    fn new(handle: Arc<ControllerHandle>, id: RequestId) -> Self {
        Self {
            handle,
            id,
            armed: true,
        }
    }

    /// The slot was resolved or explicitly discarded; nothing left to clean.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            let handle = Arc::clone(&self.handle);
            let id = self.id;
            tokio::spawn(async move {
                handle.discard_pending(id).await;
                debug!(
                    device_key = %handle.device_key,
                    request_id = %id,
                    "pending request cancelled by client disconnect"
                );
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_path_defaults_to_root() {
        assert_eq!(forwarded_path("", None), "/");
        assert_eq!(forwarded_path("status", None), "/status");
        assert_eq!(forwarded_path("a/b/c", None), "/a/b/c");
        assert_eq!(forwarded_path("", Some("x=1")), "/?x=1");
        assert_eq!(forwarded_path("search", Some("q=dev&n=2")), "/search?q=dev&n=2");
    }
}
