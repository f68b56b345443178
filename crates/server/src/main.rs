mod api;
mod dto;
mod state;

use crate::state::AppState;
use axum::routing::get;
use bsds::{offline::OfflineCache, prelude::*, refresh};
use chrono::Utc;
use std::{sync::Arc, time::Instant};
use tracing::{error, info, warn};

const PORT: u32 = 3000;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    info!("Starting server...");
    let args: Vec<_> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => match Config::from_path(path) {
            Ok(config) => config,
            Err(err) => {
                error!("Failed to read config {path}: {err}");
                std::process::exit(1);
            }
        },
        None => {
            warn!("No config file given, using defaults");
            Config::default()
        }
    };
    info!(
        "Serving stop {:?} in {:?} mode",
        config.stop_id, config.data_source.mode
    );

    let offline = OfflineCache::from_config(&config);
    let provider = Arc::new(ArrivalProvider::new(config));

    info!("Loading schedule...");
    let now = Instant::now();
    match offline.ensure(Utc::now()).await {
        Ok(index) => {
            provider.install_index(index).await;
            info!("Loading schedule took {:?}", now.elapsed());
        }
        Err(err) => warn!("Starting without a schedule: {err}"),
    }

    refresh::spawn(provider.clone(), Some(offline));

    let state = Arc::new(AppState::new(provider));
    let app = axum::Router::new()
        .route("/api/arrivals", get(api::arrivals))
        .route("/api/status", get(api::status))
        .with_state(state);
    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", PORT)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind port {PORT}: {err}");
            std::process::exit(1);
        }
    };
    info!("Listening to port {PORT}");
    if let Err(err) = axum::serve(listener, app).await {
        error!("Server stopped: {err}");
    }
}
