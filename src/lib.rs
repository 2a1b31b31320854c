#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

//! # devgate
//!
//! Reverse-tunnel HTTP gateway for devices with outbound-only connectivity.
//!
//! A device ("controller") opens a long-lived WebSocket to the gateway and
//! thereafter looks like an HTTP origin: requests to
//! `/forward/v1/<deviceKey>/...` are serialized onto that device's socket as
//! forward frames, and the device's response frame is streamed back on the
//! original HTTP response.
//!
//! ## HTTP surface (port `HTTP_PORT`, default 3000)
//!
//! | Method | Path                          | Description                              |
//! |--------|-------------------------------|------------------------------------------|
//! | ALL    | `/forward/v1/{deviceKey}`     | 301 to the same URL with trailing slash  |
//! | ALL    | `/forward/v1/{deviceKey}/*`   | Forward to the device (1 MiB body cap)   |
//!
//! CORS preflight is permitted on every route. Error bodies are JSON
//! `{"message": "..."}`; a success body is whatever the device returned,
//! verbatim.
//!
//! ## Controller surface (port `WEBSOCKET_PORT`, default 8080)
//!
//! A single WebSocket endpoint at `/socket/v1?deviceKey=<key>`. Admission
//! errors arrive as one `ERR: ` text frame before the socket closes. After
//! admission the device receives `FWD: ` frames, answers with `RES: ` frames,
//! and must respond to pings (one missed 10-second interval tears the
//! session down).
//!
//! ## Architecture
//!
//! ```text
//! main.rs       — entry point, env config, plugin init, two listeners, shutdown
//! config.rs     — environment-driven configuration
//! auth/
//!   mod.rs      — KeyValidator: plugin selection and dispatch
//!   environment.rs — DEVICE_KEYS allowlist plugin
//!   mysql.rs    — MySQL row-existence plugin (sqlx)
//! registry.rs   — ControllerRegistry + per-device pending-request tables
//! controller.rs — controller endpoint: admission, session loop, liveness
//! forward.rs    — forward routes: park response, frame request, deliver reply
//! codec.rs      — forward/response wire frames, request ids
//! ```

pub mod auth;
pub mod codec;
pub mod config;
pub mod controller;
pub mod forward;
pub mod registry;

use std::sync::Arc;

use auth::KeyValidator;
use config::Config;
use registry::ControllerRegistry;

/// Shared gateway state, built once at startup before either listener starts
/// accepting, and handed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct GatewayState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Connected controllers, keyed by device key.
    pub registry: ControllerRegistry,
    /// The active authentication plugin.
    pub validator: Arc<KeyValidator>,
}

impl GatewayState {
    pub fn new(config: Config, validator: KeyValidator) -> Self {
        Self {
            config: Arc::new(config),
            registry: ControllerRegistry::new(),
            validator: Arc::new(validator),
        }
    }
}
