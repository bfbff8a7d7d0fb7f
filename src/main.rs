mod config;
mod error;
mod estimator;
mod events;
mod handlers;
mod history;
mod host;
mod lifecycle;
mod rotation;
mod state;
mod stats;
mod store;
mod tasks;
mod tracker;

use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Level, info};

use crate::config::Settings;
use crate::events::Notifier;
use crate::handlers::{api, host as host_h};
use crate::host::BridgeHost;
use crate::lifecycle::Controller;
use crate::state::AppState;
use crate::store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let settings = Settings::new()?;

    tracing_subscriber::fmt()
        .with_env_filter(&settings.log_level)
        .init();

    info!("Starting speedwatch...");

    if !settings.data_dir.exists() {
        std::fs::create_dir_all(&settings.data_dir)?;
    }

    let store = Store::open(settings.store_path()).await?;
    let bridge = Arc::new(BridgeHost::new(
        settings.notification_capacity,
        settings.command_timeout(),
    ));
    let notifier = Notifier::new(settings.notification_capacity);
    let controller = Controller::load(&settings, bridge.clone(), store, notifier.clone()).await?;

    // Owns all download state from here on
    let handle = tasks::start_background_tasks(controller, &settings);

    let state = AppState {
        settings: settings.clone(),
        controller: handle,
        bridge,
        notifier,
    };

    // --- Router Setup ---
    let app = create_app(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], settings.server_port));
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn create_app(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/api/info", get(api::server_info))
        .route("/api/downloads", get(api::list_downloads))
        .route("/api/downloads/{id}/{action}", post(api::download_command))
        .route("/api/batch/{action}", post(api::batch_command))
        .route("/api/refresh", post(api::refresh))
        .route(
            "/api/history",
            get(api::get_history).delete(api::clear_history),
        )
        .route(
            "/api/speed-limit",
            get(api::get_speed_limit).put(api::set_speed_limit),
        )
        .route("/events", get(api::sse_handler));

    let host_routes = Router::new()
        .route("/host/created", post(host_h::created))
        .route("/host/changed", post(host_h::changed))
        .route("/host/ack", post(host_h::acknowledge))
        .route("/host/commands", get(host_h::command_stream));

    Router::new()
        .merge(api_routes)
        .merge(host_routes)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
