mod cli;
mod config;
mod registry;
mod websocket;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cli::{Cli, Commands};
use crate::config::Config;
use crate::websocket::{websocket_handler, SwitchboardState};

async fn health_check(State(state): State<SwitchboardState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "rooms": state.registry.room_count(),
    }))
}

#[tokio::main]
async fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Some(Commands::Probe {
        url,
        room,
        user,
        say,
        linger,
    }) = cli.command
    {
        if let Err(err) = cli::run_probe(url, room, user, say, linger).await {
            error!("probe failed: {}", err);
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!("starting foyer switchboard on port {}", config.port);

    let state = SwitchboardState::new(config.clone());

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listener");
    info!("foyer switchboard listening on {}", addr);
    axum::serve(listener, app).await.expect("server error");
}
