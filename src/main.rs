#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Entry point: configuration, plugin init, the two listeners, shutdown.

use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use devgate::auth::KeyValidator;
use devgate::config::Config;
use devgate::{controller, forward, GatewayState};

/// Reverse-tunnel HTTP gateway for devices with outbound-only connectivity.
///
/// All configuration is environment-driven; see the crate documentation for
/// the variable table.
#[derive(Parser)]
#[command(name = "devgate", version, about)]
struct Cli {}

#[tokio::main]
async fn main() {
    let Cli {} = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("devgate: {error}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter())
        .init();

    info!("devgate v{} starting", env!("CARGO_PKG_VERSION"));

    let validator = match KeyValidator::init(&config).await {
        Ok(validator) => validator,
        Err(error) => {
            error!(plugin = %config.authentication_plugin, %error, "authentication plugin init failed");
            std::process::exit(1);
        }
    };
    info!(plugin = validator.name(), "authentication plugin ready");

    let state = GatewayState::new(config, validator);

    let http_app = forward::router(state.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());
    let controller_app = controller::router(state.clone()).layer(TraceLayer::new_for_http());

    let http_addr = format!("{}:{}", state.config.host, state.config.http_port);
    let controller_addr = format!("{}:{}", state.config.host, state.config.websocket_port);

    let http_listener = bind_or_exit(&http_addr).await;
    let controller_listener = bind_or_exit(&controller_addr).await;
    info!("HTTP endpoint on {http_addr}");
    info!("controller endpoint on {controller_addr}");

    // One shutdown signal drives both listeners to a graceful stop.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    let mut http_shutdown = shutdown_rx.clone();
    let mut controller_shutdown = shutdown_rx;
    let http_server = async move {
        axum::serve(http_listener, http_app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await
    };
    let controller_server = async move {
        axum::serve(controller_listener, controller_app)
            .with_graceful_shutdown(async move {
                let _ = controller_shutdown.changed().await;
            })
            .await
    };

    let (http_result, controller_result) = tokio::join!(http_server, controller_server);
    for result in [http_result, controller_result] {
        if let Err(error) = result {
            error!(%error, "server error");
            std::process::exit(1);
        }
    }

    info!("goodbye");
}

async fn bind_or_exit(addr: &str) -> TcpListener {
    match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, "failed to bind {addr}");
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sigterm) => sigterm,
            Err(error) => {
                error!(%error, "failed to register SIGTERM handler");
                ctrl_c.await.ok();
                info!("received SIGINT");
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT");
    }
}
