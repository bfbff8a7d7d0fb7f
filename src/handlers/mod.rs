pub mod api;
pub mod host;

use crate::error::Error;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Maps an error to a JSON failure body. Only a dead controller is a server
/// error; everything else is an acknowledged failure.
pub(crate) fn failure(e: Error) -> Response {
    let status = match e {
        Error::ControllerClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (
        status,
        Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    )
        .into_response()
}
