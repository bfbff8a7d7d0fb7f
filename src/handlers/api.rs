use super::failure;
use crate::host::HostCommand;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

fn parse_command(action: &str) -> Option<HostCommand> {
    match action {
        "pause" => Some(HostCommand::Pause),
        "resume" => Some(HostCommand::Resume),
        "cancel" => Some(HostCommand::Cancel),
        "open" => Some(HostCommand::Open),
        "show" => Some(HostCommand::Show),
        _ => None,
    }
}

fn unknown_action(action: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": format!("unknown action: {}", action) })),
    )
        .into_response()
}

pub async fn server_info(State(state): State<AppState>) -> Response {
    match state.controller.info().await {
        Ok(info) => Json(info).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn list_downloads(State(state): State<AppState>) -> Response {
    match state.controller.active_downloads().await {
        Ok(downloads) => Json(json!({ "success": true, "downloads": downloads })).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn download_command(
    State(state): State<AppState>,
    Path((id, action)): Path<(u64, String)>,
) -> Response {
    let Some(command) = parse_command(&action) else {
        return unknown_action(&action);
    };
    match state.controller.command(command, id).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn batch_command(
    State(state): State<AppState>,
    Path(action): Path<String>,
) -> Response {
    let command = match parse_command(&action) {
        Some(command @ (HostCommand::Pause | HostCommand::Resume | HostCommand::Cancel)) => {
            command
        }
        _ => return unknown_action(&action),
    };
    match state.controller.command_all(command).await {
        Ok(affected) => Json(json!({ "success": true, "affected": affected })).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn refresh(State(state): State<AppState>) -> Response {
    info!("Refreshing downloads from host");
    match state.controller.refresh().await {
        Ok(downloads) => Json(json!({ "success": true, "downloads": downloads })).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn get_history(State(state): State<AppState>) -> Response {
    match state.controller.history().await {
        Ok(history) => Json(json!({ "success": true, "history": history })).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn clear_history(State(state): State<AppState>) -> Response {
    match state.controller.clear_history().await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SpeedLimit {
    pub limit: u64,
}

pub async fn get_speed_limit(State(state): State<AppState>) -> Response {
    match state.controller.speed_limit().await {
        Ok(limit) => Json(json!({ "limit": limit })).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn set_speed_limit(
    State(state): State<AppState>,
    Json(body): Json<SpeedLimit>,
) -> Response {
    match state.controller.set_speed_limit(body.limit).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => failure(e),
    }
}

pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.notifier.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).map(|msg| match msg {
        Ok(notification) => Event::default().json_data(notification),
        Err(_) => Ok(Event::default().comment("lagged")),
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
