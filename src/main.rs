#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # studiod
//!
//! Backend daemon of a web IDE shell.
//!
//! studiod exposes an HTTP + WebSocket API that lets a browser or desktop
//! frontend drive interactive terminal sessions and AI coding-assistant CLI
//! sessions, both backed by pseudo-terminals, and watch subagent transcript
//! activity — all over one persistent connection per client.
//!
//! ## API surface
//!
//! | Method | Path          | Description                             |
//! |--------|---------------|-----------------------------------------|
//! | GET    | `/api/health` | Liveness probe                          |
//! | GET    | `/api/ws`     | WebSocket for terminals + assistant     |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap, router setup, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! state.rs         — shared AppState
//! shell/
//!   pty.rs         — PTY allocation, session-leader spawn, resize, factory trait
//! terminal.rs      — connection-scoped terminal registry
//! assistant/
//!   mod.rs         — assistant session manager (send/respond/abort/close)
//!   classifier.rs  — stream classifier (JSON lines vs. buffered free text)
//!   prompt.rs      — interactive prompt detection
//! subagent/
//!   mod.rs         — polling watcher over sibling transcript files
//!   transcript.rs  — tail/head reads, activity extraction, fuzzy matching
//! ws/
//!   mod.rs         — WebSocket upgrade, message dispatch, teardown
//! routes/
//!   health.rs      — GET /api/health
//! ```

use std::sync::Arc;
use std::time::Instant;

use axum::{routing::get, Router};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use studiod::assistant::AssistantManager;
use studiod::shell::pty::NativePtyFactory;
use studiod::subagent::SubagentWatcher;
use studiod::{AppState, Config};

/// Backend daemon of a web IDE shell.
#[derive(Parser)]
#[command(name = "studiod", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("studiod v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Assistant CLI: {}", config.assistant.binary);

    let pty_factory = Arc::new(NativePtyFactory);
    let assistant = AssistantManager::new(pty_factory.clone(), config.assistant.clone());
    let subagents = SubagentWatcher::from_config(&config.watcher);

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        pty_factory,
        assistant: assistant.clone(),
        subagents: subagents.clone(),
    };

    let app = Router::new()
        .route("/api/health", get(studiod::routes::health::health))
        .route("/api/ws", get(studiod::ws::ws_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    assistant.kill_all().await;
    subagents.stop_watch().await;
    info!("Goodbye");
}
