//! Endpoints the browser extension calls to report downloads and to pick up
//! the commands it has to execute.

use super::failure;
use crate::host::{CommandAck, DownloadDelta, DownloadItem};
use crate::state::AppState;
use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::stream::{self, Stream};
use tracing::{info, warn};

pub async fn created(State(state): State<AppState>, Json(item): Json<DownloadItem>) -> Response {
    state.bridge.record_created(&item);
    match state.controller.created(item).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => failure(e),
    }
}

pub async fn changed(State(state): State<AppState>, Json(delta): Json<DownloadDelta>) -> Response {
    state.bridge.record_changed(&delta);
    match state.controller.changed(delta).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => failure(e),
    }
}

pub async fn acknowledge(State(state): State<AppState>, Json(ack): Json<CommandAck>) -> StatusCode {
    let request_id = ack.request_id;
    if state.bridge.acknowledge(ack) {
        StatusCode::NO_CONTENT
    } else {
        warn!("Acknowledgement for unknown request {}", request_id);
        StatusCode::NOT_FOUND
    }
}

pub async fn command_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    info!("Extension subscribed to host commands");
    let feed = state.bridge.connect();
    let stream = stream::unfold(feed, |mut feed| async move {
        let request = feed.next().await?;
        Some((Event::default().event("command").json_data(request), feed))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
